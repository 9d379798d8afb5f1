//! Interfaces onto the subsystems that surround the channel layer.
//!
//! The channel core deliberately implements no cryptography, no TLS, no
//! clockkeeping, and no routing policy.  Everything it needs from those
//! worlds arrives through the small traits in this module, so that the
//! embedding application (or a test harness) can supply them.
//!
//! The [`ChannelEnv`] struct bundles one implementation of each trait;
//! every channel holds a shared handle to one of these.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

use orlink_cell::msg::DestroyReason;

use crate::channel::{Channel, ChannelRegistry};
use crate::{ClockSkew, IdDigest};

/// A view of the current time.
pub trait Clock {
    /// Return the current wallclock time.
    fn wallclock(&self) -> SystemTime;
    /// Return a cheap approximation of the current time, as seconds
    /// since the epoch.
    fn approx_secs(&self) -> u64 {
        self.wallclock()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

/// A source of cryptographic-quality randomness.
pub trait Rng {
    /// Fill `buf` with random bytes.
    fn fill_bytes(&self, buf: &mut [u8]);
    /// Return a uniform value in `[0, bound)`.  `bound` must be nonzero.
    fn pick_u16(&self, bound: u16) -> u16;
}

/// A Clock implementation that uses the system time.
#[derive(Clone, Debug, Default)]
#[non_exhaustive]
pub struct SystemClock;

impl Clock for SystemClock {
    fn wallclock(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// An Rng implementation that uses the thread RNG.
#[derive(Clone, Debug, Default)]
#[non_exhaustive]
pub struct SystemRng;

impl Rng for SystemRng {
    fn fill_bytes(&self, buf: &mut [u8]) {
        use rand::RngCore;
        rand::rng().fill_bytes(buf);
    }
    fn pick_u16(&self, bound: u16) -> u16 {
        use rand::Rng as _;
        rand::rng().random_range(0..bound)
    }
}

/// Sub-states of the OR connection that carries a channel.
///
/// The connection owns this state; the handshake engine flips it
/// forward, and the embedding event loop reports TLS-level changes
/// through [`crate::channel::tls::TlsChannel::handle_link_state_change`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[allow(clippy::exhaustive_enums)]
pub enum LinkState {
    /// The TLS handshake (or a renegotiation) is still in progress.
    Handshaking,
    /// Negotiating with a peer that may only speak link protocol 2.
    HandshakingV2,
    /// Performing the version-3 link handshake.
    HandshakingV3,
    /// The link handshake is complete; the connection is open.
    Open,
    /// The connection is closed, or closing.
    Closed,
}

/// The TLS-backed OR connection underneath a [`TlsChannel`].
///
/// [`TlsChannel`]: crate::channel::tls::TlsChannel
///
/// Implementations wrap a real TLS session and its outgoing buffer; the
/// channel layer only ever hands them fully-encoded cell bytes.
pub trait TlsLink {
    /// Append already-encoded cell bytes to the connection's outgoing
    /// buffer.
    fn write(&self, buf: &[u8]) -> io::Result<()>;
    /// Return the connection's current sub-state.
    fn state(&self) -> LinkState;
    /// Move the connection to a new sub-state.
    fn set_state(&self, state: LinkState);
    /// Return the address this connection is actually connected to.
    fn remote_addr(&self) -> SocketAddr;
    /// Return the certificate (DER) the peer presented in the TLS
    /// handshake, if any.
    fn peer_tls_cert(&self) -> Option<Vec<u8>>;
    /// Return the certificate (DER) we presented in the TLS handshake,
    /// if any.
    fn own_tls_cert(&self) -> Option<Vec<u8>>;
    /// Export 32 bytes of secret material bound to this TLS session,
    /// for use in link authentication.
    fn export_tlssecret(&self) -> io::Result<[u8; 32]>;
    /// Tell the event loop to tear this connection down.
    fn mark_for_close(&self);
    /// Record that the peer considers itself reachable at the address we
    /// actually dialed.
    fn note_canonical(&self);
    /// (Re)initialize the connection's per-peer bookkeeping for an
    /// authenticated identity.  The zero digest means "unknown".
    fn init_peer_id(&self, id: &IdDigest);
}

/// Something that can launch outbound TLS connections for channels.
pub trait TlsConnector {
    /// Begin an outbound TLS connection.
    ///
    /// The returned link may still be mid-TLS-handshake; the event loop
    /// reports its progress later.
    fn connect(&self, addr: SocketAddr) -> io::Result<Rc<dyn TlsLink>>;
}

/// A decoded certificate from a CERTS cell or a TLS session.
///
/// All the cryptography lives behind this trait: the channel layer asks
/// the questions and never touches key material itself.
pub trait PeerCert {
    /// Return true if this certificate is correctly self-signed.
    fn is_self_signed(&self) -> bool;
    /// Return true if this certificate is signed by the key in
    /// `signer`, and the two keys are different.
    fn is_signed_by(&self, signer: &dyn PeerCert) -> bool;
    /// Return true if this certificate's public key is the key used in
    /// the TLS session whose certificate is `tls_cert_der`.
    fn matches_tls_cert(&self, tls_cert_der: &[u8]) -> bool;
    /// Return the identity fingerprint of this certificate's subject
    /// key.
    fn key_digest(&self) -> IdDigest;
    /// Verify an RSA-PKCS1-v1.5 signature, made with this certificate's
    /// key, over the given SHA-256 digest.
    fn verify_sha256_sig(&self, digest: &[u8; 32], signature: &[u8]) -> bool;
}

/// A decoder for the certificates that appear in CERTS cells.
pub trait CertDecoder {
    /// Decode a DER certificate; None if it is unparseable.
    fn decode(&self, der: &[u8]) -> Option<Box<dyn PeerCert>>;
}

/// Our own authentication material, needed on the paths where we prove
/// who we are (responding to connections, or authenticating as a public
/// server).
pub trait LocalAuth {
    /// The DER body of our self-signed identity certificate.
    fn id_cert(&self) -> &[u8];
    /// The DER body of our authentication certificate, signed by the
    /// identity key.
    fn auth_cert(&self) -> &[u8];
    /// The DER body of the certificate we present in TLS handshakes.
    fn link_cert(&self) -> &[u8];
    /// Our own identity fingerprint.
    fn id_digest(&self) -> IdDigest;
    /// Produce an RSA-PKCS1-v1.5 signature over `digest` with our
    /// authentication key.
    fn sign_sha256(&self, digest: &[u8; 32]) -> Vec<u8>;
}

/// The circuit layer's view of channel events.
pub trait CircuitLayer {
    /// Tell circuits pending on this channel whether it worked out.
    fn n_chan_done(&self, chan: &Channel, success: bool);
    /// Detach every circuit attached to this channel, with the given
    /// reason.
    fn unlink_all_from_channel(&self, chan: &Channel, reason: DestroyReason);
}

/// Returned by the guard manager when it declines a channel.
#[derive(Clone, Debug, Default)]
#[non_exhaustive]
pub struct GuardRejected;

/// The entry-guard subsystem's view of channel events.
pub trait GuardManager {
    /// Note that the network is apparently up (we completed a link
    /// handshake).
    fn note_network_live(&self);
    /// Record the outcome of a connection attempt to `id`.
    ///
    /// An `Err` return means the guard subsystem does not want circuits
    /// built on this channel; the channel stays open regardless.
    fn register_connect_status(&self, id: &IdDigest, succeeded: bool)
        -> Result<(), GuardRejected>;
}

/// What the router database can tell us about a known relay.
#[derive(Clone, Debug, Default)]
#[allow(clippy::exhaustive_structs)]
pub struct RelayInfo {
    /// True if this relay is one of the trusted directories.
    pub is_trusted_dir: bool,
}

/// The router database's view of channel events.
pub trait RouterDb {
    /// Look up a known relay by identity fingerprint.
    fn lookup(&self, id: &IdDigest) -> Option<RelayInfo>;
    /// Record that we successfully connected to `id` at time `at`.
    fn note_connect_succeeded(&self, id: &IdDigest, at: u64);
    /// Set our view of whether `id` is currently reachable.
    fn set_reachable(&self, id: &IdDigest, reachable: bool);
}

/// The geoip subsystem's view of channel events.
pub trait GeoIp {
    /// Note that an apparent client connected to us from `addr` at time
    /// `at`.
    fn note_client_seen(&self, addr: IpAddr, at: u64);
}

/// The controller's view of channel events.
pub trait ControlEvents {
    /// Report clock skew measured against a source we have some reason
    /// to trust.
    fn clock_skew_event(&self, skew: ClockSkew, source: &str);
}

/// Static configuration for the link layer.
#[derive(Clone, Debug)]
#[allow(clippy::exhaustive_structs)]
pub struct LinkConfig {
    /// Link protocol versions we are willing to negotiate.
    pub versions: Vec<u16>,
    /// True if we are a public relay: we then answer AUTH_CHALLENGE
    /// cells and report real timestamps and addresses in NETINFO.
    pub is_public_server: bool,
    /// The addresses we advertise as our own in NETINFO cells.
    pub advertised_addrs: Vec<IpAddr>,
    /// Human-readable name to use for ourselves in logs, if any.
    pub nickname: Option<String>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig {
            versions: vec![3, 4, 5],
            is_public_server: false,
            advertised_addrs: Vec::new(),
            nickname: None,
        }
    }
}

/// Everything the channel layer needs from its host, bundled.
///
/// One of these is created at startup and shared (by `Rc`) among every
/// channel; there are no global variables in this crate.
#[allow(clippy::exhaustive_structs)]
pub struct ChannelEnv {
    /// Time source.
    pub clock: Rc<dyn Clock>,
    /// Randomness source.
    pub rng: Rc<dyn Rng>,
    /// Launcher for outbound TLS connections.
    pub connector: Rc<dyn TlsConnector>,
    /// Decoder for CERTS-cell certificates.
    pub cert_decoder: Rc<dyn CertDecoder>,
    /// Our own authentication material, if we have any.
    ///
    /// Pure clients have none; anything that answers or authenticates
    /// connections needs it.
    pub local_auth: Option<Rc<dyn LocalAuth>>,
    /// The circuit layer above us.
    pub circuits: Rc<dyn CircuitLayer>,
    /// The entry-guard subsystem.
    pub guards: Rc<dyn GuardManager>,
    /// The router database.
    pub routers: Rc<dyn RouterDb>,
    /// The geoip bookkeeping subsystem.
    pub geoip: Rc<dyn GeoIp>,
    /// The controller-event sink.
    pub control: Rc<dyn ControlEvents>,
    /// The process-wide channel registry.
    pub registry: Rc<ChannelRegistry>,
    /// Link-layer configuration.
    pub config: LinkConfig,
}
