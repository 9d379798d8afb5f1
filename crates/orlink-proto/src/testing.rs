//! Fake implementations of the external interfaces, for tests.
//!
//! Everything here is deterministic and records what was done to it, so
//! tests can drive a channel through its life without a network, a
//! clock, or any real cryptography.
//!
//! The fake "cryptography" is a lookup scheme: a [`FakeCertStore`] maps
//! certificate bodies to declared properties, and a fake signature over
//! a digest is just a tag plus the signing key's fingerprint plus the
//! digest.  That is obviously worthless as cryptography; it is exactly
//! enough to let the handshake engine's checks pass and fail on demand.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::rc::Rc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::channel::{Channel, ChannelRegistry};
use crate::external::{
    CertDecoder, ChannelEnv, CircuitLayer, Clock, ControlEvents, GeoIp, GuardManager,
    GuardRejected, LinkConfig, LinkState, LocalAuth, PeerCert, RelayInfo, RouterDb, Rng,
    TlsConnector, TlsLink,
};
use crate::{ClockSkew, IdDigest};

use orlink_cell::msg::DestroyReason;

/// A settable clock.
#[derive(Debug)]
pub struct FakeClock {
    /// Current time, as seconds since the epoch.
    secs: Cell<u64>,
}

impl FakeClock {
    /// Create a clock reading `secs` seconds past the epoch.
    pub fn at(secs: u64) -> Self {
        FakeClock { secs: Cell::new(secs) }
    }
    /// Move the clock to an absolute time.
    pub fn set(&self, secs: u64) {
        self.secs.set(secs);
    }
    /// Move the clock forward.
    pub fn advance(&self, secs: u64) {
        self.secs.set(self.secs.get() + secs);
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        // An arbitrary mid-2023 moment; tests that care set their own.
        FakeClock::at(1_688_000_000)
    }
}

impl Clock for FakeClock {
    fn wallclock(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(self.secs.get())
    }
}

/// A deterministic "randomness" source.
#[derive(Debug, Default)]
pub struct FakeRng;

impl Rng for FakeRng {
    fn fill_bytes(&self, buf: &mut [u8]) {
        for (i, b) in buf.iter_mut().enumerate() {
            *b = (i as u8).wrapping_mul(0x3b).wrapping_add(0x42);
        }
    }
    fn pick_u16(&self, bound: u16) -> u16 {
        0x0123 % bound
    }
}

/// A fake TLS connection that records everything done to it.
pub struct FakeTlsLink {
    /// Bytes written to the connection's outgoing buffer.
    written: RefCell<Vec<u8>>,
    /// The connection's sub-state.
    state: Cell<LinkState>,
    /// The address this connection pretends to go to.
    remote: SocketAddr,
    /// Certificate the "peer" presented in the TLS handshake.
    peer_cert: RefCell<Option<Vec<u8>>>,
    /// Certificate "we" presented in the TLS handshake.
    own_cert: RefCell<Option<Vec<u8>>>,
    /// Exported secret material for this "session".
    secret: Cell<[u8; 32]>,
    /// True once mark_for_close has run.
    marked_for_close: Cell<bool>,
    /// True once note_canonical has run.
    canonical: Cell<bool>,
    /// Every identity handed to init_peer_id, in order.
    peer_id_inits: RefCell<Vec<IdDigest>>,
    /// When true, writes fail.
    fail_writes: Cell<bool>,
}

impl FakeTlsLink {
    /// Create a new link to `remote`, still in the TLS handshake.
    pub fn new(remote: SocketAddr) -> Rc<Self> {
        Rc::new(FakeTlsLink {
            written: RefCell::new(Vec::new()),
            state: Cell::new(LinkState::Handshaking),
            remote,
            peer_cert: RefCell::new(None),
            own_cert: RefCell::new(None),
            secret: Cell::new([0x5a; 32]),
            marked_for_close: Cell::new(false),
            canonical: Cell::new(false),
            peer_id_inits: RefCell::new(Vec::new()),
            fail_writes: Cell::new(false),
        })
    }
    /// Take every byte written so far.
    pub fn take_written(&self) -> Vec<u8> {
        std::mem::take(&mut *self.written.borrow_mut())
    }
    /// Set the certificate the peer presented in the TLS handshake.
    pub fn set_peer_cert(&self, der: Vec<u8>) {
        *self.peer_cert.borrow_mut() = Some(der);
    }
    /// Set the certificate we presented in the TLS handshake.
    pub fn set_own_cert(&self, der: Vec<u8>) {
        *self.own_cert.borrow_mut() = Some(der);
    }
    /// Set the exported TLS secret material.
    pub fn set_secret(&self, secret: [u8; 32]) {
        self.secret.set(secret);
    }
    /// Make further writes fail.
    pub fn fail_writes(&self) {
        self.fail_writes.set(true);
    }
    /// Return true if the event loop was told to close this connection.
    pub fn is_marked_for_close(&self) -> bool {
        self.marked_for_close.get()
    }
    /// Return true if the connection was flagged canonical.
    pub fn is_canonical(&self) -> bool {
        self.canonical.get()
    }
    /// Return the identities handed to init_peer_id, in order.
    pub fn peer_id_inits(&self) -> Vec<IdDigest> {
        self.peer_id_inits.borrow().clone()
    }
}

impl TlsLink for FakeTlsLink {
    fn write(&self, buf: &[u8]) -> io::Result<()> {
        if self.fail_writes.get() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "fake write failure"));
        }
        self.written.borrow_mut().extend_from_slice(buf);
        Ok(())
    }
    fn state(&self) -> LinkState {
        self.state.get()
    }
    fn set_state(&self, state: LinkState) {
        self.state.set(state);
    }
    fn remote_addr(&self) -> SocketAddr {
        self.remote
    }
    fn peer_tls_cert(&self) -> Option<Vec<u8>> {
        self.peer_cert.borrow().clone()
    }
    fn own_tls_cert(&self) -> Option<Vec<u8>> {
        self.own_cert.borrow().clone()
    }
    fn export_tlssecret(&self) -> io::Result<[u8; 32]> {
        Ok(self.secret.get())
    }
    fn mark_for_close(&self) {
        self.marked_for_close.set(true);
        self.state.set(LinkState::Closed);
    }
    fn note_canonical(&self) {
        self.canonical.set(true);
    }
    fn init_peer_id(&self, id: &IdDigest) {
        self.peer_id_inits.borrow_mut().push(*id);
    }
}

/// A connector that hands out [`FakeTlsLink`]s.
#[derive(Default)]
pub struct FakeConnector {
    /// Links staged to be returned by the next connects.
    staged: RefCell<VecDeque<Rc<FakeTlsLink>>>,
    /// Every link handed out, in order.
    made: RefCell<Vec<Rc<FakeTlsLink>>>,
    /// When true, connection attempts fail.
    fail: Cell<bool>,
}

impl FakeConnector {
    /// Stage a link to be returned by the next connect call.
    pub fn stage(&self, link: Rc<FakeTlsLink>) {
        self.staged.borrow_mut().push_back(link);
    }
    /// Make further connection attempts fail.
    pub fn fail_next(&self) {
        self.fail.set(true);
    }
    /// Return the most recently handed-out link.
    pub fn last(&self) -> Option<Rc<FakeTlsLink>> {
        self.made.borrow().last().cloned()
    }
}

impl TlsConnector for FakeConnector {
    fn connect(&self, addr: SocketAddr) -> io::Result<Rc<dyn TlsLink>> {
        if self.fail.take() {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "fake connection failure",
            ));
        }
        let link = self
            .staged
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| FakeTlsLink::new(addr));
        self.made.borrow_mut().push(Rc::clone(&link));
        Ok(link)
    }
}

/// Produce a fake "signature" over `digest` by the key with fingerprint
/// `key`.
///
/// [`FakeCert::verify_sha256_sig`] accepts exactly this byte string.
pub fn fake_signature(key: &IdDigest, digest: &[u8; 32]) -> Vec<u8> {
    let mut sig = Vec::with_capacity(4 + 20 + 32);
    sig.extend_from_slice(b"SIG1");
    sig.extend_from_slice(key.as_bytes());
    sig.extend_from_slice(digest);
    sig
}

/// Declared properties of a fake certificate.
#[derive(Clone, Debug, Default)]
#[allow(clippy::exhaustive_structs)]
pub struct CertSpec {
    /// Fingerprint of the certificate's subject key.
    pub key_digest: IdDigest,
    /// True if the certificate is correctly self-signed.
    pub self_signed: bool,
    /// Fingerprint of the key that signed this certificate, if any.
    pub signed_by: Option<IdDigest>,
    /// The TLS certificate (DER) whose key this certificate matches, if
    /// any.
    pub matches_tls: Option<Vec<u8>>,
}

/// A decoded fake certificate.
pub struct FakeCert {
    /// The declared properties.
    spec: CertSpec,
}

impl PeerCert for FakeCert {
    fn is_self_signed(&self) -> bool {
        self.spec.self_signed
    }
    fn is_signed_by(&self, signer: &dyn PeerCert) -> bool {
        self.spec.signed_by == Some(signer.key_digest()) && signer.key_digest() != self.key_digest()
    }
    fn matches_tls_cert(&self, tls_cert_der: &[u8]) -> bool {
        self.spec.matches_tls.as_deref() == Some(tls_cert_der)
    }
    fn key_digest(&self) -> IdDigest {
        self.spec.key_digest
    }
    fn verify_sha256_sig(&self, digest: &[u8; 32], signature: &[u8]) -> bool {
        signature == fake_signature(&self.spec.key_digest, digest)
    }
}

/// A certificate decoder backed by a table of declared certificates.
#[derive(Default)]
pub struct FakeCertStore {
    /// Known certificate bodies and their properties.
    known: RefCell<HashMap<Vec<u8>, CertSpec>>,
}

impl FakeCertStore {
    /// Declare a certificate body and its properties.
    pub fn add(&self, der: Vec<u8>, spec: CertSpec) {
        self.known.borrow_mut().insert(der, spec);
    }
}

impl CertDecoder for FakeCertStore {
    fn decode(&self, der: &[u8]) -> Option<Box<dyn PeerCert>> {
        let spec = self.known.borrow().get(der)?.clone();
        Some(Box::new(FakeCert { spec }))
    }
}

/// Fake local authentication material.
pub struct FakeLocalAuth {
    /// DER body of the identity certificate.
    id_cert: Vec<u8>,
    /// DER body of the authentication certificate.
    auth_cert: Vec<u8>,
    /// DER body of the TLS link certificate.
    link_cert: Vec<u8>,
    /// Our identity fingerprint.
    id: IdDigest,
    /// Fingerprint of the authentication key (used to make fake
    /// signatures).
    auth_key: IdDigest,
}

impl LocalAuth for FakeLocalAuth {
    fn id_cert(&self) -> &[u8] {
        &self.id_cert
    }
    fn auth_cert(&self) -> &[u8] {
        &self.auth_cert
    }
    fn link_cert(&self) -> &[u8] {
        &self.link_cert
    }
    fn id_digest(&self) -> IdDigest {
        self.id
    }
    fn sign_sha256(&self, digest: &[u8; 32]) -> Vec<u8> {
        fake_signature(&self.auth_key, digest)
    }
}

/// Create a complete fake identity named by one byte, and declare its
/// certificates in `store`.
///
/// The identity gets an id cert (self-signed), an auth cert (signed by
/// the identity key), and a link cert that doubles as the TLS
/// certificate the identity presents, so that the link-cert-matches-TLS
/// check passes when the same body shows up in both places.
pub fn install_identity(store: &FakeCertStore, name: u8) -> Rc<FakeLocalAuth> {
    let id_cert = vec![name, 0x01, 0xc0];
    let auth_cert = vec![name, 0x02, 0xc0];
    let link_cert = vec![name, 0x03, 0xc0];
    let id = IdDigest::from_bytes(&[name; 20]).expect("20 bytes is 20 bytes");
    let mut auth_bytes = [name; 20];
    auth_bytes[19] = 0xaa;
    let auth_key = IdDigest::from(auth_bytes);
    let mut link_bytes = [name; 20];
    link_bytes[19] = 0xbb;
    let link_key = IdDigest::from(link_bytes);

    store.add(
        id_cert.clone(),
        CertSpec {
            key_digest: id,
            self_signed: true,
            signed_by: Some(id),
            matches_tls: None,
        },
    );
    store.add(
        auth_cert.clone(),
        CertSpec {
            key_digest: auth_key,
            self_signed: false,
            signed_by: Some(id),
            matches_tls: None,
        },
    );
    store.add(
        link_cert.clone(),
        CertSpec {
            key_digest: link_key,
            self_signed: false,
            signed_by: Some(id),
            matches_tls: Some(link_cert.clone()),
        },
    );

    Rc::new(FakeLocalAuth {
        id_cert,
        auth_cert,
        link_cert,
        id,
        auth_key,
    })
}

/// What the fake circuit layer saw.
#[derive(Clone, Debug, PartialEq, Eq)]
#[allow(clippy::exhaustive_enums)]
pub enum CircuitEvent {
    /// n_chan_done was called.
    NChanDone {
        /// The channel's unique id.
        chan: u64,
        /// Whether the channel worked out.
        success: bool,
    },
    /// unlink_all_from_channel was called.
    UnlinkAll {
        /// The channel's unique id.
        chan: u64,
        /// The reason given.
        reason: DestroyReason,
    },
}

/// A circuit layer that records its notifications.
#[derive(Default)]
pub struct FakeCircuits {
    /// Everything that happened, in order.
    events: RefCell<Vec<CircuitEvent>>,
}

impl FakeCircuits {
    /// Return true if n_chan_done(chan, success) was seen.
    pub fn saw_n_chan_done(&self, chan: &Channel, success: bool) -> bool {
        let id = chan.unique_id().as_u64();
        self.events
            .borrow()
            .iter()
            .any(|e| matches!(e, CircuitEvent::NChanDone { chan, success: s } if *chan == id && *s == success))
    }
    /// Return true if unlink_all_from_channel(chan, _) was seen.
    pub fn saw_unlink_all(&self, chan: &Channel) -> bool {
        let id = chan.unique_id().as_u64();
        self.events
            .borrow()
            .iter()
            .any(|e| matches!(e, CircuitEvent::UnlinkAll { chan, .. } if *chan == id))
    }
    /// Return every recorded event, in order.
    pub fn events(&self) -> Vec<CircuitEvent> {
        self.events.borrow().clone()
    }
}

impl CircuitLayer for FakeCircuits {
    fn n_chan_done(&self, chan: &Channel, success: bool) {
        self.events.borrow_mut().push(CircuitEvent::NChanDone {
            chan: chan.unique_id().as_u64(),
            success,
        });
    }
    fn unlink_all_from_channel(&self, chan: &Channel, reason: DestroyReason) {
        self.events.borrow_mut().push(CircuitEvent::UnlinkAll {
            chan: chan.unique_id().as_u64(),
            reason,
        });
    }
}

/// A guard manager that records what it is told and can be made to
/// reject.
#[derive(Default)]
pub struct FakeGuards {
    /// Times note_network_live ran.
    live: Cell<usize>,
    /// When true, the next register_connect_status is rejected.
    reject: Cell<bool>,
    /// Every status registered, in order.
    statuses: RefCell<Vec<(IdDigest, bool)>>,
}

impl FakeGuards {
    /// Make the next register_connect_status call come back rejected.
    pub fn reject_next(&self) {
        self.reject.set(true);
    }
    /// Return how many times the network was declared live.
    pub fn network_live_count(&self) -> usize {
        self.live.get()
    }
    /// Return every registered status, in order.
    pub fn statuses(&self) -> Vec<(IdDigest, bool)> {
        self.statuses.borrow().clone()
    }
}

impl GuardManager for FakeGuards {
    fn note_network_live(&self) {
        self.live.set(self.live.get() + 1);
    }
    fn register_connect_status(
        &self,
        id: &IdDigest,
        succeeded: bool,
    ) -> Result<(), GuardRejected> {
        self.statuses.borrow_mut().push((*id, succeeded));
        if self.reject.take() {
            Err(GuardRejected)
        } else {
            Ok(())
        }
    }
}

/// A router database backed by a plain map.
#[derive(Default)]
pub struct FakeRouters {
    /// The known relays.
    known: RefCell<HashMap<IdDigest, RelayInfo>>,
    /// Recorded successful connects.
    connects: RefCell<Vec<(IdDigest, u64)>>,
    /// Recorded reachability updates.
    reachable: RefCell<Vec<(IdDigest, bool)>>,
}

impl FakeRouters {
    /// Declare a known relay.
    pub fn add(&self, id: IdDigest, info: RelayInfo) {
        self.known.borrow_mut().insert(id, info);
    }
    /// Return true if a successful connect to `id` was recorded.
    pub fn connect_succeeded_to(&self, id: &IdDigest) -> bool {
        self.connects.borrow().iter().any(|(i, _)| i == id)
    }
    /// Return true if reachability for `id` was set to `value`.
    pub fn reachable_set_to(&self, id: &IdDigest, value: bool) -> bool {
        self.reachable.borrow().iter().any(|(i, v)| i == id && *v == value)
    }
}

impl RouterDb for FakeRouters {
    fn lookup(&self, id: &IdDigest) -> Option<RelayInfo> {
        self.known.borrow().get(id).cloned()
    }
    fn note_connect_succeeded(&self, id: &IdDigest, at: u64) {
        self.connects.borrow_mut().push((*id, at));
    }
    fn set_reachable(&self, id: &IdDigest, reachable: bool) {
        self.reachable.borrow_mut().push((*id, reachable));
    }
}

/// A geoip subsystem that records client sightings.
#[derive(Default)]
pub struct FakeGeoIp {
    /// Every sighting, in order.
    sightings: RefCell<Vec<(IpAddr, u64)>>,
}

impl FakeGeoIp {
    /// Return true if a client was seen at `addr`.
    pub fn saw_client(&self, addr: &IpAddr) -> bool {
        self.sightings.borrow().iter().any(|(a, _)| a == addr)
    }
}

impl GeoIp for FakeGeoIp {
    fn note_client_seen(&self, addr: IpAddr, at: u64) {
        self.sightings.borrow_mut().push((addr, at));
    }
}

/// A controller-event sink that records skew reports.
#[derive(Default)]
pub struct FakeControl {
    /// Every skew event: (signed seconds, source description).
    skews: RefCell<Vec<(i64, String)>>,
}

impl FakeControl {
    /// Return every skew event recorded so far.
    pub fn skew_events(&self) -> Vec<(i64, String)> {
        self.skews.borrow().clone()
    }
}

impl ControlEvents for FakeControl {
    fn clock_skew_event(&self, skew: ClockSkew, source: &str) {
        self.skews.borrow_mut().push((skew.as_secs(), source.to_string()));
    }
}

/// A complete fake environment, with handles onto every fake.
#[allow(clippy::exhaustive_structs)]
pub struct TestNet {
    /// The environment to hand to channels.
    pub env: Rc<ChannelEnv>,
    /// The settable clock inside it.
    pub clock: Rc<FakeClock>,
    /// The deterministic RNG inside it.
    pub rng: Rc<FakeRng>,
    /// The connector inside it.
    pub connector: Rc<FakeConnector>,
    /// The certificate table inside it.
    pub certs: Rc<FakeCertStore>,
    /// The recording circuit layer inside it.
    pub circuits: Rc<FakeCircuits>,
    /// The recording guard manager inside it.
    pub guards: Rc<FakeGuards>,
    /// The fake router database inside it.
    pub routers: Rc<FakeRouters>,
    /// The recording geoip subsystem inside it.
    pub geoip: Rc<FakeGeoIp>,
    /// The recording controller sink inside it.
    pub control: Rc<FakeControl>,
}

impl TestNet {
    /// Build a default client-flavored environment.
    pub fn new() -> Self {
        Self::with_parts(LinkConfig::default(), None, Rc::new(FakeCertStore::default()))
    }

    /// Build an environment with a particular configuration.
    pub fn with_config(config: LinkConfig) -> Self {
        Self::with_parts(config, None, Rc::new(FakeCertStore::default()))
    }

    /// Build an environment from explicit parts.
    ///
    /// `certs` is shared so that two TestNets can know about each
    /// other's certificates.
    pub fn with_parts(
        config: LinkConfig,
        local_auth: Option<Rc<FakeLocalAuth>>,
        certs: Rc<FakeCertStore>,
    ) -> Self {
        let clock = Rc::new(FakeClock::default());
        let rng = Rc::new(FakeRng);
        let connector = Rc::new(FakeConnector::default());
        let circuits = Rc::new(FakeCircuits::default());
        let guards = Rc::new(FakeGuards::default());
        let routers = Rc::new(FakeRouters::default());
        let geoip = Rc::new(FakeGeoIp::default());
        let control = Rc::new(FakeControl::default());
        let env = Rc::new(ChannelEnv {
            clock: clock.clone(),
            rng: rng.clone(),
            connector: connector.clone(),
            cert_decoder: certs.clone(),
            local_auth: local_auth.map(|l| l as Rc<dyn LocalAuth>),
            circuits: circuits.clone(),
            guards: guards.clone(),
            routers: routers.clone(),
            geoip: geoip.clone(),
            control: control.clone(),
            registry: Rc::new(ChannelRegistry::new()),
            config,
        });
        TestNet {
            env,
            clock,
            rng,
            connector,
            certs,
            circuits,
            guards,
            routers,
            geoip,
            control,
        }
    }
}

impl Default for TestNet {
    fn default() -> Self {
        TestNet::new()
    }
}
