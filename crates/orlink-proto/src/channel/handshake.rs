//! The link handshake: version negotiation, certificates,
//! authentication, and netinfo exchange.
//!
//! All of these cells arrive from the connection before the circuit
//! layer ever sees a channel; the [`TlsChannel`] routes them here until
//! the handshake completes.  The engine's inputs are cells, and its
//! outputs are either more cells on the wire or an authenticated, open
//! channel.
//!
//! The two sides of a handshake are asymmetric.  The initiator sends
//! VERSIONS as soon as TLS finishes, and then reacts to the responder's
//! flight of VERSIONS, CERTS, AUTH_CHALLENGE, and NETINFO.  A public
//! relay that initiates will also prove its identity with an
//! AUTHENTICATE cell; an ordinary client never does, and the responder
//! treats it as anonymous.

use std::rc::Rc;

use bytes::BytesMut;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{debug, info, trace, warn};

use orlink_cell::msg::{
    AuthChallenge, Authenticate, CertType, Certs, Netinfo, Versions,
    AUTHTYPE_RSA_SHA256_TLSSECRET, AUTH_CHALLENGE_LEN,
};
use orlink_cell::{Cell, VarCell};

use super::tls::TlsChannel;
use super::{Channel, CircIdRange};
use crate::external::{LinkState, LocalAuth, PeerCert};
use crate::{ClockSkew, Error, IdDigest, Result};

/// Length of the deterministic part of an AUTHENTICATE body: the
/// 8-byte type tag plus six 32-byte fields.
pub const V3_AUTH_BODY_LEN: usize = 200;

/// Tag bytes at the start of an authenticator body.
const V3_AUTH_TYPE_TAG: &[u8; 8] = b"AUTH0001";

/// How soon after our VERSIONS cell a NETINFO timestamp still counts
/// for skew measurement, in seconds.
const NETINFO_TIMESTAMP_WINDOW: u64 = 180;

/// Skew (in seconds) past which we complain about a known router's
/// clock.
const SKEW_COMPLAINT_THRESHOLD: u64 = 3600;

/// Per-connection state of an in-progress link handshake.
///
/// Dropped as soon as the handshake completes (or fails).
pub(super) struct Handshake {
    /// True if we initiated the connection.
    pub(super) started_here: bool,
    /// The negotiated link protocol version; 0 until VERSIONS cells
    /// have crossed.
    pub(super) link_proto: u16,
    /// Set once we have processed the peer's VERSIONS cell.
    pub(super) received_versions: bool,
    /// Set once we have processed the peer's CERTS cell.
    pub(super) received_certs: bool,
    /// Set once we have processed the peer's AUTH_CHALLENGE cell.
    pub(super) received_auth_challenge: bool,
    /// Set once we have processed the peer's AUTHENTICATE cell.
    pub(super) received_authenticate: bool,
    /// Set once the peer's identity is established (by CERTS on the
    /// initiator side, by AUTHENTICATE on the responder side).
    pub(super) authenticated: bool,
    /// When we sent our VERSIONS cell, in seconds since the epoch.
    pub(super) sent_versions_at: Option<u64>,
    /// The peer identity we authenticated, once we did.
    pub(super) authenticated_peer_id: IdDigest,
    /// The peer's decoded identity certificate, once seen.
    pub(super) peer_id_cert: Option<Box<dyn PeerCert>>,
    /// The peer's decoded authentication certificate, once seen
    /// (responder side only).
    pub(super) peer_auth_cert: Option<Box<dyn PeerCert>>,
    /// The raw body of the peer's identity certificate, for the
    /// authenticator's certificate digests.
    pub(super) peer_id_cert_der: Option<Vec<u8>>,
    /// Running digest of the handshake cells we have sent.
    ///
    /// Covers every variable-length handshake cell except AUTHENTICATE,
    /// in the order we sent them, in their wire encoding.
    pub(super) digest_sent: Sha256,
    /// Running digest of the handshake cells the peer has sent.
    ///
    /// Same coverage rule, in arrival order.
    pub(super) digest_received: Sha256,
}

impl Handshake {
    /// Create handshake state for a new connection.
    pub(super) fn new(started_here: bool) -> Self {
        Handshake {
            started_here,
            link_proto: 0,
            received_versions: false,
            received_certs: false,
            received_auth_challenge: false,
            received_authenticate: false,
            authenticated: false,
            sent_versions_at: None,
            authenticated_peer_id: IdDigest::ZERO,
            peer_id_cert: None,
            peer_auth_cert: None,
            peer_id_cert_der: None,
            digest_sent: Sha256::new(),
            digest_received: Sha256::new(),
        }
    }
}

impl TlsChannel {
    /// Return the channel we serve, or fail the way a dead channel
    /// fails.
    fn require_channel(&self) -> Result<Rc<Channel>> {
        self.channel().ok_or(Error::ChannelClosed)
    }

    /// Return our local authentication material, which the current
    /// code path requires.
    fn local_auth(&self) -> Result<Rc<dyn LocalAuth>> {
        self.env
            .local_auth
            .clone()
            .ok_or(Error::Internal("no local identity material configured"))
    }

    /// Handle a failure anywhere in the handshake: log it, mark the
    /// connection for close, and put the channel in Error.
    pub(super) fn handshake_failed(&self, e: Error) {
        match self.channel() {
            Some(chan) => {
                warn!("{}: link handshake failed: {}", chan.unique_id(), e);
                self.link.mark_for_close();
                chan.fail_to_error();
            }
            None => self.link.mark_for_close(),
        }
    }

    /// Send our VERSIONS cell, if we are the initiator and haven't yet.
    pub(super) fn maybe_send_versions(&self) {
        let due = {
            let hs = self.handshake.borrow();
            matches!(&*hs, Some(h) if h.started_here && h.sent_versions_at.is_none())
        };
        if !due {
            return;
        }
        let result = {
            let mut hs_slot = self.handshake.borrow_mut();
            match hs_slot.as_mut() {
                Some(hs) => self.send_versions(hs),
                None => Ok(()),
            }
        };
        if let Err(e) = result {
            self.handshake_failed(e);
        }
    }

    /// Fold a received variable-length cell into the transcript digest.
    pub(super) fn digest_received_cell(&self, cell: &VarCell) {
        let mut hs_slot = self.handshake.borrow_mut();
        let Some(hs) = hs_slot.as_mut() else { return };
        if let Ok(bytes) = self.codec.borrow_mut().encoded_var_cell(cell) {
            hs.digest_received.update(&bytes);
        }
    }

    //
    // Cell processing
    //

    /// Process a VERSIONS cell.
    pub(super) fn process_versions_cell(&self, cell: &VarCell) {
        if let Err(e) = self.try_process_versions(cell) {
            self.handshake_failed(e);
        }
    }

    /// VERSIONS processing proper; any error kills the handshake.
    fn try_process_versions(&self, cell: &VarCell) -> Result<()> {
        if !cell.circ_id().is_zero() {
            return Err(Error::HandshakeProto(
                "VERSIONS cell with nonzero circuit ID".into(),
            ));
        }
        let chan = self.require_channel()?;
        let mut hs_slot = self.handshake.borrow_mut();
        let hs = hs_slot
            .as_mut()
            .ok_or_else(|| Error::HandshakeProto("VERSIONS cell after handshake".into()))?;
        if hs.received_versions || hs.link_proto != 0 {
            return Err(Error::HandshakeProto("duplicate VERSIONS cell".into()));
        }
        let versions = Versions::from_var_cell(cell)?;
        let proto = versions
            .best_shared_link_protocol(&self.env.config.versions)
            .ok_or_else(|| Error::HandshakeProto("no common link protocol version".into()))?;
        if proto == 1 {
            // v1 predates VERSIONS cells; a peer "negotiating" it here
            // is talking nonsense.
            return Err(Error::HandshakeProto(
                "peer tried to negotiate link protocol 1".into(),
            ));
        }
        if self.link.state() == LinkState::HandshakingV3 && proto < 3 {
            return Err(Error::HandshakeProto(format!(
                "negotiated obsolete link protocol {} after a v3 TLS handshake",
                proto
            )));
        }
        hs.received_versions = true;
        hs.link_proto = proto;
        *self.codec.borrow_mut() = orlink_cell::codec::CellCodec::new(proto);
        debug!("{}: negotiated link protocol {}", chan.unique_id(), proto);

        if proto >= 3 {
            if self.link.state() == LinkState::HandshakingV2 {
                self.link.set_state(LinkState::HandshakingV3);
            }
            // The VERSIONS cells themselves are part of the transcript.
            if let Ok(bytes) = cell.encode_for_handshake() {
                hs.digest_received.update(&bytes);
            }
            let send_versions = !hs.started_here;
            let send_certs = !hs.started_here || self.env.config.is_public_server;
            let send_chall = !hs.started_here && self.env.config.is_public_server;
            let send_netinfo = !hs.started_here;
            if send_versions {
                self.send_versions(hs)?;
            }
            if send_certs {
                self.send_certs_cell(hs)?;
            }
            if send_chall {
                self.send_auth_challenge(hs)?;
            }
            if send_netinfo {
                self.send_netinfo(hs)?;
            }
        } else {
            // Link protocol 2: no certificates, no authentication; just
            // answer (if we are the responder) and trade NETINFO cells.
            if !hs.started_here {
                self.send_versions(hs)?;
            }
            self.send_netinfo(hs)?;
        }
        Ok(())
    }

    /// Process a CERTS cell.
    pub(super) fn process_certs_cell(&self, cell: &VarCell) {
        if let Err(e) = self.try_process_certs(cell) {
            self.handshake_failed(e);
        }
    }

    /// CERTS processing proper.
    fn try_process_certs(&self, cell: &VarCell) -> Result<()> {
        if !cell.circ_id().is_zero() {
            return Err(Error::HandshakeProto(
                "CERTS cell with nonzero circuit ID".into(),
            ));
        }
        let chan = self.require_channel()?;
        let mut hs_slot = self.handshake.borrow_mut();
        let hs = hs_slot
            .as_mut()
            .ok_or_else(|| Error::HandshakeProto("CERTS cell after handshake".into()))?;
        if hs.link_proto < 3 {
            return Err(Error::HandshakeProto(
                "CERTS cell before version negotiation".into(),
            ));
        }
        if hs.received_certs {
            return Err(Error::HandshakeProto("duplicate CERTS cell".into()));
        }
        if hs.authenticated {
            return Err(Error::HandshakeProto(
                "CERTS cell on an authenticated connection".into(),
            ));
        }
        let certs = Certs::from_var_cell(cell)?;
        // At most one certificate of each type we care about; other
        // types were decoded above and are ignored.
        let link_cert_der = certs.unique_cert_body(CertType::TLS_LINK)?;
        let id_cert_der = certs.unique_cert_body(CertType::ID_1024)?;
        let auth_cert_der = certs.unique_cert_body(CertType::AUTH_1024)?;

        /// Helper: decode one certificate body or die trying.
        fn decode_one(
            tls: &TlsChannel,
            der: Option<&[u8]>,
            which: &str,
        ) -> Result<(Box<dyn PeerCert>, Vec<u8>)> {
            let der = der
                .ok_or_else(|| Error::HandshakeProto(format!("missing {} certificate", which)))?;
            let cert = tls
                .env
                .cert_decoder
                .decode(der)
                .ok_or_else(|| Error::HandshakeProto(format!("unparseable {} certificate", which)))?;
            Ok((cert, der.to_vec()))
        }

        if hs.started_here {
            // We are authenticating the responder: its CERTS must bind
            // the TLS session key to a self-certifying identity.
            let (link_cert, _) = decode_one(self, link_cert_der, "link")?;
            let (id_cert, id_der) = decode_one(self, id_cert_der, "identity")?;
            let tls_cert = self.link.peer_tls_cert().ok_or_else(|| {
                Error::HandshakeProto("no TLS certificate from the peer".into())
            })?;
            if !link_cert.matches_tls_cert(&tls_cert) {
                return Err(Error::HandshakeProto(
                    "link certificate does not match TLS certificate".into(),
                ));
            }
            if !link_cert.is_signed_by(id_cert.as_ref()) {
                return Err(Error::HandshakeProto(
                    "link certificate not signed by identity".into(),
                ));
            }
            if !id_cert.is_self_signed() {
                return Err(Error::HandshakeProto(
                    "identity certificate not self-signed".into(),
                ));
            }
            let peer_id = id_cert.key_digest();
            let expected = chan.identity_digest();
            if !expected.is_zero() && expected != peer_id {
                return Err(Error::HandshakeProto(format!(
                    "identity {} does not match target {}",
                    peer_id, expected
                )));
            }
            hs.authenticated = true;
            hs.authenticated_peer_id = peer_id;
            hs.peer_id_cert = Some(id_cert);
            hs.peer_id_cert_der = Some(id_der);
            chan.set_identity_digest(peer_id);
            chan.set_circ_id_range_from_peer();
            trace!("{}: authenticated responder as {}", chan.unique_id(), peer_id);
            if !self.env.config.is_public_server {
                // We will never send AUTHENTICATE, so our side of the
                // handshake is done: say NETINFO now.
                self.send_netinfo(hs)?;
            }
        } else {
            // The initiator wants to authenticate to us: hold on to its
            // certificates and wait for the AUTHENTICATE cell.
            let (auth_cert, _) = decode_one(self, auth_cert_der, "authentication")?;
            let (id_cert, id_der) = decode_one(self, id_cert_der, "identity")?;
            if !auth_cert.is_signed_by(id_cert.as_ref()) {
                return Err(Error::HandshakeProto(
                    "authentication certificate not signed by identity".into(),
                ));
            }
            if !id_cert.is_self_signed() {
                return Err(Error::HandshakeProto(
                    "identity certificate not self-signed".into(),
                ));
            }
            hs.peer_id_cert = Some(id_cert);
            hs.peer_auth_cert = Some(auth_cert);
            hs.peer_id_cert_der = Some(id_der);
        }
        hs.received_certs = true;
        Ok(())
    }

    /// Process an AUTH_CHALLENGE cell.
    pub(super) fn process_auth_challenge_cell(&self, cell: &VarCell) {
        if let Err(e) = self.try_process_auth_challenge(cell) {
            self.handshake_failed(e);
        }
    }

    /// AUTH_CHALLENGE processing proper.
    fn try_process_auth_challenge(&self, cell: &VarCell) -> Result<()> {
        if !cell.circ_id().is_zero() {
            return Err(Error::HandshakeProto(
                "AUTH_CHALLENGE cell with nonzero circuit ID".into(),
            ));
        }
        let _chan = self.require_channel()?;
        let mut hs_slot = self.handshake.borrow_mut();
        let hs = hs_slot
            .as_mut()
            .ok_or_else(|| Error::HandshakeProto("AUTH_CHALLENGE cell after handshake".into()))?;
        if hs.link_proto < 3 {
            return Err(Error::HandshakeProto(
                "AUTH_CHALLENGE cell before version negotiation".into(),
            ));
        }
        if !hs.started_here {
            return Err(Error::HandshakeProto(
                "AUTH_CHALLENGE cell from an initiator".into(),
            ));
        }
        if !hs.received_certs {
            return Err(Error::HandshakeProto(
                "AUTH_CHALLENGE cell before CERTS".into(),
            ));
        }
        if hs.received_auth_challenge {
            return Err(Error::HandshakeProto("duplicate AUTH_CHALLENGE cell".into()));
        }
        if cell.payload().len() < AUTH_CHALLENGE_LEN + 2 {
            return Err(Error::HandshakeProto("truncated AUTH_CHALLENGE cell".into()));
        }
        let challenge = AuthChallenge::from_var_cell(cell)?;
        hs.received_auth_challenge = true;
        if self.env.config.is_public_server {
            // The challenge payload itself never appears in our reply;
            // it is bound in via the transcript digest.
            if challenge.offers(AUTHTYPE_RSA_SHA256_TLSSECRET) {
                self.send_authenticate(hs)?;
            }
            self.send_netinfo(hs)?;
        }
        Ok(())
    }

    /// Process an AUTHENTICATE cell.
    pub(super) fn process_authenticate_cell(&self, cell: &VarCell) {
        if let Err(e) = self.try_process_authenticate(cell) {
            self.handshake_failed(e);
        }
    }

    /// AUTHENTICATE processing proper.
    fn try_process_authenticate(&self, cell: &VarCell) -> Result<()> {
        if !cell.circ_id().is_zero() {
            return Err(Error::HandshakeProto(
                "AUTHENTICATE cell with nonzero circuit ID".into(),
            ));
        }
        let chan = self.require_channel()?;
        let mut hs_slot = self.handshake.borrow_mut();
        let hs = hs_slot
            .as_mut()
            .ok_or_else(|| Error::HandshakeProto("AUTHENTICATE cell after handshake".into()))?;
        if hs.link_proto < 3 {
            return Err(Error::HandshakeProto(
                "AUTHENTICATE cell before version negotiation".into(),
            ));
        }
        if hs.started_here {
            return Err(Error::HandshakeProto(
                "AUTHENTICATE cell from a responder".into(),
            ));
        }
        if !hs.received_certs {
            return Err(Error::HandshakeProto("AUTHENTICATE cell before CERTS".into()));
        }
        if hs.peer_id_cert.is_none() || hs.peer_auth_cert.is_none() {
            return Err(Error::HandshakeProto(
                "AUTHENTICATE cell without authentication certificates".into(),
            ));
        }
        if hs.authenticated || hs.received_authenticate {
            return Err(Error::HandshakeProto("duplicate AUTHENTICATE cell".into()));
        }
        let msg = Authenticate::from_var_cell(cell)?;
        if msg.auth_type() != AUTHTYPE_RSA_SHA256_TLSSECRET {
            return Err(Error::HandshakeProto(format!(
                "unrecognized authentication type {}",
                msg.auth_type()
            )));
        }
        let auth = msg.auth();
        if auth.len() <= V3_AUTH_BODY_LEN {
            return Err(Error::HandshakeProto("AUTHENTICATE body too short".into()));
        }
        let expected = self.compute_authenticator(hs)?;
        if expected[..].ct_eq(&auth[..V3_AUTH_BODY_LEN]).unwrap_u8() != 1 {
            return Err(Error::HandshakeProto(
                "AUTHENTICATE authenticator mismatch".into(),
            ));
        }
        let signed_digest: [u8; 32] = Sha256::digest(&auth[..V3_AUTH_BODY_LEN]).into();
        let auth_cert = hs
            .peer_auth_cert
            .as_ref()
            .expect("auth cert checked present above");
        if !auth_cert.verify_sha256_sig(&signed_digest, &auth[V3_AUTH_BODY_LEN..]) {
            return Err(Error::HandshakeProto(
                "bad signature on AUTHENTICATE cell".into(),
            ));
        }
        hs.received_authenticate = true;
        hs.authenticated = true;
        let peer_id = hs
            .peer_id_cert
            .as_ref()
            .expect("id cert checked present above")
            .key_digest();
        hs.authenticated_peer_id = peer_id;
        chan.set_identity_digest(peer_id);
        chan.set_circ_id_range_from_peer();
        self.link.init_peer_id(&peer_id);
        debug!("{}: authenticated initiator as {}", chan.unique_id(), peer_id);
        Ok(())
    }

    /// Process a NETINFO cell; on success the connection (and so the
    /// channel) becomes open.
    pub(super) fn process_netinfo_cell(&self, cell: &Cell) {
        match self.try_process_netinfo(cell) {
            Ok(()) => {
                if let Some(chan) = self.channel() {
                    debug!("{}: link handshake complete", chan.unique_id());
                }
                *self.handshake.borrow_mut() = None;
                self.link.set_state(LinkState::Open);
                self.handle_link_state_change(LinkState::Open);
            }
            Err(e) => self.handshake_failed(e),
        }
    }

    /// NETINFO processing proper.
    fn try_process_netinfo(&self, cell: &Cell) -> Result<()> {
        let chan = self.require_channel()?;
        let mut hs_slot = self.handshake.borrow_mut();
        let hs = hs_slot
            .as_mut()
            .ok_or_else(|| Error::HandshakeProto("NETINFO cell after handshake".into()))?;
        if !hs.received_versions {
            return Err(Error::HandshakeProto("NETINFO cell before VERSIONS".into()));
        }
        if self.link.state() == LinkState::HandshakingV3 {
            if hs.started_here && !hs.authenticated {
                return Err(Error::HandshakeProto(
                    "NETINFO cell from an unauthenticated responder".into(),
                ));
            }
            if !hs.started_here && !hs.authenticated {
                // An ordinary client: scrub any identity belief we may
                // have accumulated, and treat the peer as anonymous.
                hs.authenticated_peer_id = IdDigest::ZERO;
                chan.set_identity_digest(IdDigest::ZERO);
                chan.set_circ_id_range(CircIdRange::High);
                self.link.init_peer_id(&IdDigest::ZERO);
            }
        }
        let netinfo = Netinfo::from_cell(cell)?;

        // If the peer lists the address we actually dialed among its
        // own, this connection is canonical: the peer answers there on
        // purpose.
        if netinfo
            .my_addrs()
            .contains(&self.link.remote_addr().ip())
        {
            self.link.note_canonical();
        }

        let apparent = netinfo.their_addr();
        chan.set_my_apparent_addr(apparent);
        if let Some(addr) = apparent {
            if !self.env.config.advertised_addrs.contains(&addr) {
                debug!(
                    "{}: peer reports our address as {}",
                    chan.unique_id(),
                    addr
                );
            }
        }

        self.consider_clock_skew(&chan, hs, &netinfo);
        Ok(())
    }

    /// Measure and, where warranted, complain about the peer's declared
    /// clock.
    ///
    /// Advisory only: a skewed peer stays usable.
    fn consider_clock_skew(&self, chan: &Channel, hs: &Handshake, netinfo: &Netinfo) {
        let theirs = netinfo.timestamp();
        if theirs == 0 {
            // The peer declined to say (clients do).
            return;
        }
        let Some(sent_at) = hs.sent_versions_at else { return };
        let now = self.env.clock.approx_secs();
        if now.saturating_sub(sent_at) > NETINFO_TIMESTAMP_WINDOW {
            // Too much time on the wire for the timestamp to mean much.
            return;
        }
        let skew = ClockSkew::from_handshake_secs(now, u64::from(theirs));
        if skew.magnitude().as_secs() <= SKEW_COMPLAINT_THRESHOLD {
            return;
        }
        let peer = chan.identity_digest();
        let Some(router) = self.env.routers.lookup(&peer) else {
            // Unknown peers get no opinion about our clock.
            return;
        };
        let source = format!("OR:{}", self.link.remote_addr());
        let secs = skew.magnitude().as_secs();
        if router.is_trusted_dir {
            warn!(
                "{}: received NETINFO cell with skewed time from trusted directory {}: \
                 their clock appears to be {} seconds {} ours",
                chan.unique_id(),
                source,
                secs,
                skew.direction()
            );
            self.env.control.clock_skew_event(skew, &source);
        } else {
            info!(
                "{}: received NETINFO cell with skewed time from {}: \
                 their clock appears to be {} seconds {} ours",
                chan.unique_id(),
                source,
                secs,
                skew.direction()
            );
        }
    }

    //
    // Cell emission
    //

    /// Send our VERSIONS cell (always in the 2-byte circuit-ID
    /// encoding), noting when we did.
    fn send_versions(&self, hs: &mut Handshake) -> Result<()> {
        let versions = Versions::new(self.env.config.versions.clone())?;
        let bytes = versions.encode_for_handshake()?;
        self.link.write(&bytes).map_err(Error::from_io)?;
        hs.digest_sent.update(&bytes);
        hs.sent_versions_at = Some(self.env.clock.approx_secs());
        trace!("sent VERSIONS {:?}", self.env.config.versions);
        Ok(())
    }

    /// Encode and send one variable-length handshake cell, folding it
    /// into the sent-side transcript.
    fn send_handshake_var_cell(&self, hs: &mut Handshake, cell: VarCell) -> Result<()> {
        let bytes = self.codec.borrow_mut().encoded_var_cell(&cell)?;
        self.link.write(&bytes).map_err(Error::from_io)?;
        hs.digest_sent.update(&bytes);
        trace!("sent {} cell", cell.cmd());
        Ok(())
    }

    /// Send our CERTS cell.  Which certificates go in it depends on our
    /// role: a responder proves its link key, an initiator sets up to
    /// prove its identity.
    fn send_certs_cell(&self, hs: &mut Handshake) -> Result<()> {
        let local = self.local_auth()?;
        let mut certs = Certs::new_empty();
        if hs.started_here {
            certs.push_cert_body(CertType::AUTH_1024, local.auth_cert());
            certs.push_cert_body(CertType::ID_1024, local.id_cert());
        } else {
            certs.push_cert_body(CertType::TLS_LINK, local.link_cert());
            certs.push_cert_body(CertType::ID_1024, local.id_cert());
        }
        self.send_handshake_var_cell(hs, certs.into_var_cell()?)
    }

    /// Send an AUTH_CHALLENGE cell with fresh random material.
    fn send_auth_challenge(&self, hs: &mut Handshake) -> Result<()> {
        let mut challenge = [0_u8; AUTH_CHALLENGE_LEN];
        self.env.rng.fill_bytes(&mut challenge);
        let msg = AuthChallenge::new(challenge, vec![AUTHTYPE_RSA_SHA256_TLSSECRET]);
        self.send_handshake_var_cell(hs, msg.into_var_cell()?)
    }

    /// Send our NETINFO cell.
    ///
    /// Relays report their wallclock and advertised addresses; clients
    /// report neither.  NETINFO is a fixed-length cell, so it never
    /// enters the (variable-length-only) transcripts.
    fn send_netinfo(&self, _hs: &mut Handshake) -> Result<()> {
        let their_addr = Some(self.link.remote_addr().ip());
        let netinfo = if self.env.config.is_public_server {
            let now = u32::try_from(self.env.clock.approx_secs()).unwrap_or(u32::MAX);
            Netinfo::from_relay(now, their_addr, self.env.config.advertised_addrs.clone())
        } else {
            Netinfo::from_client(their_addr)
        };
        let cell = netinfo.into_cell()?;
        let mut buf = BytesMut::with_capacity(520);
        self.codec.borrow_mut().write_cell(&cell, &mut buf)?;
        self.link.write(&buf).map_err(Error::from_io)?;
        trace!("sent NETINFO cell");
        Ok(())
    }

    /// Compute, sign, and send an AUTHENTICATE cell.
    ///
    /// (AUTHENTICATE never enters the transcripts: it is computed over
    /// them.)
    fn send_authenticate(&self, hs: &mut Handshake) -> Result<()> {
        let local = self.local_auth()?;
        let mut auth = self.compute_authenticator(hs)?;
        let signed_digest: [u8; 32] = Sha256::digest(&auth).into();
        auth.extend_from_slice(&local.sign_sha256(&signed_digest));
        let msg = Authenticate::new(AUTHTYPE_RSA_SHA256_TLSSECRET, auth);
        let cell = msg.into_var_cell()?;
        let bytes = self.codec.borrow_mut().encoded_var_cell(&cell)?;
        self.link.write(&bytes).map_err(Error::from_io)?;
        trace!("sent AUTHENTICATE cell");
        Ok(())
    }

    /// Build the deterministic authenticator body both sides agree on.
    ///
    /// `AUTH0001 ‖ H(initiator id cert) ‖ H(responder id cert) ‖
    /// responder transcript ‖ initiator transcript ‖ H(responder TLS
    /// cert) ‖ TLS secret export`, where H is SHA-256 and each
    /// transcript is the digest of that side's variable-length
    /// handshake cells so far (AUTHENTICATE excluded).
    fn compute_authenticator(&self, hs: &Handshake) -> Result<Vec<u8>> {
        let local = self.local_auth()?;
        let peer_id_der = hs.peer_id_cert_der.as_deref().ok_or_else(|| {
            Error::HandshakeProto("authenticating with no identity certificate seen".into())
        })?;
        let (initiator_id_cert, responder_id_cert) = if hs.started_here {
            (local.id_cert(), peer_id_der)
        } else {
            (peer_id_der, local.id_cert())
        };
        let responder_tls_cert = if hs.started_here {
            self.link.peer_tls_cert()
        } else {
            self.link.own_tls_cert()
        }
        .ok_or_else(|| Error::HandshakeProto("no TLS certificate to authenticate".into()))?;
        let (responder_log, initiator_log) = if hs.started_here {
            (
                hs.digest_received.clone().finalize(),
                hs.digest_sent.clone().finalize(),
            )
        } else {
            (
                hs.digest_sent.clone().finalize(),
                hs.digest_received.clone().finalize(),
            )
        };
        let secrets = self.link.export_tlssecret().map_err(Error::from_io)?;

        let mut body = Vec::with_capacity(V3_AUTH_BODY_LEN);
        body.extend_from_slice(V3_AUTH_TYPE_TAG);
        body.extend_from_slice(&Sha256::digest(initiator_id_cert));
        body.extend_from_slice(&Sha256::digest(responder_id_cert));
        body.extend_from_slice(&responder_log);
        body.extend_from_slice(&initiator_log);
        body.extend_from_slice(&Sha256::digest(&responder_tls_cert));
        body.extend_from_slice(&secrets);
        debug_assert_eq!(body.len(), V3_AUTH_BODY_LEN);
        Ok(body)
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::channel::{ChanState, ChannelRegistry};
    use crate::external::{Clock as _, LinkConfig, RelayInfo, TlsLink as _};
    use crate::testing::{install_identity, FakeCertStore, FakeLocalAuth, FakeTlsLink, TestNet};
    use orlink_cell::codec::CellCodec;
    use orlink_cell::{AnyCell, CellCmd, CircId};
    use std::net::{IpAddr, SocketAddr};

    /// The address of the relay we "connect" to in the client tests.
    fn server_addr() -> SocketAddr {
        "192.0.2.5:9001".parse().unwrap()
    }
    /// The public address the client tests claim for themselves.
    fn client_ip() -> IpAddr {
        "198.51.100.3".parse().unwrap()
    }

    /// One side of a handshake under test.
    struct Rig {
        /// The fake world.
        net: TestNet,
        /// The channel being handshaken.
        chan: Rc<Channel>,
        /// Its transport.
        tls: Rc<crate::channel::tls::TlsChannel>,
        /// The fake connection underneath.
        link: Rc<FakeTlsLink>,
    }

    /// Build a client-side rig whose TLS handshake has just finished.
    ///
    /// The VERSIONS cell we send at that point is discarded from the
    /// link's written-bytes record.
    fn client_rig(
        store: Rc<FakeCertStore>,
        expected_id: IdDigest,
        config: LinkConfig,
        local: Option<Rc<FakeLocalAuth>>,
    ) -> Rig {
        let net = TestNet::with_parts(config, local, store);
        let link = FakeTlsLink::new(server_addr());
        link.set_state(LinkState::HandshakingV3);
        net.connector.stage(link.clone());
        let (chan, tls) =
            crate::channel::tls::TlsChannel::connect(&net.env, server_addr(), expected_id)
                .unwrap();
        let versions = link.take_written();
        assert_eq!(&versions[..5], &[0, 0, 7, 0, 6]);
        Rig {
            net,
            chan,
            tls,
            link,
        }
    }

    /// Tear a rig down so channel Drop assertions stay happy.
    fn finish(rig: Rig) {
        let Rig { net, chan, tls, .. } = rig;
        drop(tls);
        drop(chan);
        net.env.registry.finish_all();
    }

    fn versions_cell(vs: &[u16]) -> VarCell {
        Versions::new(vs.to_vec()).unwrap().into_var_cell().unwrap()
    }
    /// The CERTS cell a responder sends: link cert and identity cert.
    fn responder_certs(ident: &FakeLocalAuth) -> VarCell {
        let mut certs = Certs::new_empty();
        certs.push_cert_body(CertType::TLS_LINK, ident.link_cert());
        certs.push_cert_body(CertType::ID_1024, ident.id_cert());
        certs.into_var_cell().unwrap()
    }
    fn auth_challenge_cell(methods: &[u16]) -> VarCell {
        AuthChallenge::new([0x77_u8; 32], methods.to_vec())
            .into_var_cell()
            .unwrap()
    }
    fn netinfo_cell(timestamp: u32, their_addr: Option<IpAddr>, my_addrs: &[IpAddr]) -> Cell {
        Netinfo::from_relay(timestamp, their_addr, my_addrs.to_vec())
            .into_cell()
            .unwrap()
    }

    #[test]
    fn client_happy_handshake() {
        let store = Rc::new(FakeCertStore::default());
        let server = install_identity(&store, 0x51);
        let rig = client_rig(
            store,
            server.id_digest(),
            LinkConfig::default(),
            None,
        );
        rig.link.set_peer_cert(server.link_cert().to_vec());
        let now = rig.net.clock.approx_secs();

        rig.tls.handle_var_cell(versions_cell(&[3, 4]));
        assert_eq!(rig.chan.state(), ChanState::Opening);
        // A plain client answers a VERSIONS cell with nothing.
        assert!(rig.link.take_written().is_empty());

        rig.tls.handle_var_cell(responder_certs(&server));
        // Authenticated; and since we'll never AUTHENTICATE, our
        // NETINFO goes out now, as a 514-byte proto-4 cell.
        let out = rig.link.take_written();
        assert_eq!(out.len(), 514);
        assert_eq!(out[4], u8::from(CellCmd::NETINFO));
        assert_eq!(rig.chan.identity_digest(), server.id_digest());

        rig.tls.handle_var_cell(auth_challenge_cell(&[
            AUTHTYPE_RSA_SHA256_TLSSECRET,
            0x00ff,
        ]));
        assert!(rig.link.take_written().is_empty());

        let ts = u32::try_from(now).unwrap();
        rig.tls.handle_cell(netinfo_cell(
            ts,
            Some(client_ip()),
            &[server_addr().ip()],
        ));

        assert_eq!(rig.chan.state(), ChanState::Open);
        assert!(rig.link.is_canonical());
        assert_eq!(rig.chan.my_apparent_addr(), Some(client_ip()));
        assert!(rig.tls.handshake.borrow().is_none());
        // A client allocates from the high half of the ID space.
        assert_eq!(
            rig.chan.circ_id_range(),
            Some(crate::channel::CircIdRange::High)
        );
        assert!(rig.net.circuits.saw_n_chan_done(&rig.chan, true));

        // Cells now flow to the channel's queues.
        rig.tls.handle_cell(Cell::new(CircId::new(9), CellCmd::RELAY));
        assert_eq!(rig.chan.n_queued_cells(), 1);
        rig.chan.request_close().unwrap();
        rig.tls.handle_link_state_change(LinkState::Closed);
        finish(rig);
    }

    #[test]
    fn version_mismatch_is_fatal() {
        let store = Rc::new(FakeCertStore::default());
        let rig = client_rig(store, IdDigest::ZERO, LinkConfig::default(), None);
        rig.tls.handle_var_cell(versions_cell(&[1, 2]));
        assert_eq!(rig.chan.state(), ChanState::Error);
        assert!(rig.link.is_marked_for_close());
        assert!(rig.net.circuits.saw_n_chan_done(&rig.chan, false));
        finish(rig);
    }

    #[test]
    fn protocol_one_is_fatal() {
        let store = Rc::new(FakeCertStore::default());
        let config = LinkConfig {
            versions: vec![1, 3],
            ..LinkConfig::default()
        };
        let rig = client_rig(store, IdDigest::ZERO, config, None);
        rig.tls.handle_var_cell(versions_cell(&[1]));
        assert_eq!(rig.chan.state(), ChanState::Error);
        finish(rig);
    }

    #[test]
    fn v3_downgrade_is_fatal() {
        let store = Rc::new(FakeCertStore::default());
        let config = LinkConfig {
            versions: vec![2, 3, 4],
            ..LinkConfig::default()
        };
        // The TLS handshake was a v3 one, so negotiating down to 2 is a
        // downgrade attempt.
        let rig = client_rig(store, IdDigest::ZERO, config, None);
        rig.tls.handle_var_cell(versions_cell(&[2]));
        assert_eq!(rig.chan.state(), ChanState::Error);
        finish(rig);
    }

    #[test]
    fn v2_handshake_completes() {
        let store = Rc::new(FakeCertStore::default());
        let config = LinkConfig {
            versions: vec![2, 3, 4],
            ..LinkConfig::default()
        };
        let net = TestNet::with_parts(config, None, store);
        let link = FakeTlsLink::new(server_addr());
        link.set_state(LinkState::HandshakingV2);
        net.connector.stage(link.clone());
        let (chan, tls) =
            crate::channel::tls::TlsChannel::connect(&net.env, server_addr(), IdDigest::ZERO)
                .unwrap();
        let _ = link.take_written(); // our VERSIONS

        tls.handle_var_cell(versions_cell(&[2]));
        // Negotiated 2: our NETINFO goes out as a narrow 512-byte cell.
        let out = link.take_written();
        assert_eq!(out.len(), 512);
        assert_eq!(out[2], u8::from(CellCmd::NETINFO));

        tls.handle_cell(netinfo_cell(0, Some(client_ip()), &[server_addr().ip()]));
        assert_eq!(chan.state(), ChanState::Open);
        assert!(link.is_canonical());

        chan.request_close().unwrap();
        tls.handle_link_state_change(LinkState::Closed);
        drop(tls);
        drop(chan);
        net.env.registry.finish_all();
    }

    #[test]
    fn skewed_clock_from_trusted_directory() {
        let store = Rc::new(FakeCertStore::default());
        let server = install_identity(&store, 0x51);
        let rig = client_rig(store, server.id_digest(), LinkConfig::default(), None);
        rig.link.set_peer_cert(server.link_cert().to_vec());
        rig.net.routers.add(
            server.id_digest(),
            RelayInfo {
                is_trusted_dir: true,
            },
        );
        let now = rig.net.clock.approx_secs();

        rig.tls.handle_var_cell(versions_cell(&[3, 4]));
        rig.tls.handle_var_cell(responder_certs(&server));
        let _ = rig.link.take_written();
        // The peer's clock reads two hours in our past.
        let ts = u32::try_from(now - 7200).unwrap();
        rig.tls
            .handle_cell(netinfo_cell(ts, Some(client_ip()), &[server_addr().ip()]));

        // Advisory only: the channel still opens...
        assert_eq!(rig.chan.state(), ChanState::Open);
        // ...but the controller hears about it.
        let events = rig.net.control.skew_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, 7200);
        assert!(events[0].1.contains("192.0.2.5"));

        rig.chan.request_close().unwrap();
        rig.tls.handle_link_state_change(LinkState::Closed);
        finish(rig);
    }

    #[test]
    fn skewed_clock_from_unknown_peer_is_ignored() {
        let store = Rc::new(FakeCertStore::default());
        let server = install_identity(&store, 0x51);
        let rig = client_rig(store, server.id_digest(), LinkConfig::default(), None);
        rig.link.set_peer_cert(server.link_cert().to_vec());
        let now = rig.net.clock.approx_secs();

        rig.tls.handle_var_cell(versions_cell(&[3, 4]));
        rig.tls.handle_var_cell(responder_certs(&server));
        let ts = u32::try_from(now - 7200).unwrap();
        rig.tls
            .handle_cell(netinfo_cell(ts, None, &[server_addr().ip()]));

        assert_eq!(rig.chan.state(), ChanState::Open);
        assert!(rig.net.control.skew_events().is_empty());

        rig.chan.request_close().unwrap();
        rig.tls.handle_link_state_change(LinkState::Closed);
        finish(rig);
    }

    #[test]
    fn duplicate_certs_is_fatal() {
        let store = Rc::new(FakeCertStore::default());
        let server = install_identity(&store, 0x51);
        let rig = client_rig(store, server.id_digest(), LinkConfig::default(), None);
        rig.link.set_peer_cert(server.link_cert().to_vec());
        rig.tls.handle_var_cell(versions_cell(&[3, 4]));
        rig.tls.handle_var_cell(responder_certs(&server));
        rig.tls.handle_var_cell(responder_certs(&server));
        assert_eq!(rig.chan.state(), ChanState::Error);
        finish(rig);
    }

    #[test]
    fn doubled_cert_type_is_fatal() {
        let store = Rc::new(FakeCertStore::default());
        let server = install_identity(&store, 0x51);
        let rig = client_rig(store, server.id_digest(), LinkConfig::default(), None);
        rig.link.set_peer_cert(server.link_cert().to_vec());
        rig.tls.handle_var_cell(versions_cell(&[3, 4]));
        let mut certs = Certs::new_empty();
        certs.push_cert_body(CertType::TLS_LINK, server.link_cert());
        certs.push_cert_body(CertType::ID_1024, server.id_cert());
        certs.push_cert_body(CertType::ID_1024, server.id_cert());
        rig.tls.handle_var_cell(certs.into_var_cell().unwrap());
        assert_eq!(rig.chan.state(), ChanState::Error);
        finish(rig);
    }

    #[test]
    fn missing_link_cert_is_fatal() {
        let store = Rc::new(FakeCertStore::default());
        let server = install_identity(&store, 0x51);
        let rig = client_rig(store, server.id_digest(), LinkConfig::default(), None);
        rig.link.set_peer_cert(server.link_cert().to_vec());
        rig.tls.handle_var_cell(versions_cell(&[3, 4]));
        let mut certs = Certs::new_empty();
        certs.push_cert_body(CertType::ID_1024, server.id_cert());
        rig.tls.handle_var_cell(certs.into_var_cell().unwrap());
        assert_eq!(rig.chan.state(), ChanState::Error);
        finish(rig);
    }

    #[test]
    fn wrong_tls_cert_is_fatal() {
        let store = Rc::new(FakeCertStore::default());
        let server = install_identity(&store, 0x51);
        let rig = client_rig(store, server.id_digest(), LinkConfig::default(), None);
        // The TLS session presented some other certificate than the one
        // the CERTS cell vouches for.
        rig.link.set_peer_cert(vec![0xde, 0xad]);
        rig.tls.handle_var_cell(versions_cell(&[3, 4]));
        rig.tls.handle_var_cell(responder_certs(&server));
        assert_eq!(rig.chan.state(), ChanState::Error);
        finish(rig);
    }

    #[test]
    fn identity_mismatch_is_fatal() {
        let store = Rc::new(FakeCertStore::default());
        let server = install_identity(&store, 0x51);
        // We wanted to reach someone else entirely.
        let expected = IdDigest::from_bytes(&[0x99; 20]).unwrap();
        let rig = client_rig(store, expected, LinkConfig::default(), None);
        rig.link.set_peer_cert(server.link_cert().to_vec());
        rig.tls.handle_var_cell(versions_cell(&[3, 4]));
        rig.tls.handle_var_cell(responder_certs(&server));
        assert_eq!(rig.chan.state(), ChanState::Error);
        finish(rig);
    }

    #[test]
    fn netinfo_before_authentication_is_fatal() {
        let store = Rc::new(FakeCertStore::default());
        let rig = client_rig(store, IdDigest::ZERO, LinkConfig::default(), None);
        rig.tls.handle_var_cell(versions_cell(&[3, 4]));
        rig.tls
            .handle_cell(netinfo_cell(0, Some(client_ip()), &[server_addr().ip()]));
        assert_eq!(rig.chan.state(), ChanState::Error);
        finish(rig);
    }

    #[test]
    fn anonymous_client_is_scrubbed() {
        // Server side: a connection that never authenticates finishes
        // the handshake as an anonymous client.
        let store = Rc::new(FakeCertStore::default());
        let server = install_identity(&store, 0x51);
        let config = LinkConfig {
            is_public_server: true,
            advertised_addrs: vec![server_addr().ip()],
            ..LinkConfig::default()
        };
        let net = TestNet::with_parts(config, Some(server.clone()), store);
        let client_from: SocketAddr = "203.0.113.9:50044".parse().unwrap();
        let link = FakeTlsLink::new(client_from);
        link.set_state(LinkState::HandshakingV2);
        link.set_own_cert(server.link_cert().to_vec());
        let (chan, tls) =
            crate::channel::tls::TlsChannel::from_incoming(&net.env, link.clone()).unwrap();

        tls.handle_var_cell(versions_cell(&[3, 4, 5]));
        // Our whole flight went out, and the connection moved to the v3
        // handshake.
        assert_eq!(link.state(), LinkState::HandshakingV3);
        assert!(!link.take_written().is_empty());

        let client_netinfo = Netinfo::from_client(Some(server_addr().ip()))
            .into_cell()
            .unwrap();
        tls.handle_cell(client_netinfo);

        assert_eq!(chan.state(), ChanState::Open);
        assert!(chan.identity_digest().is_zero());
        assert_eq!(link.peer_id_inits(), vec![IdDigest::ZERO]);
        assert_eq!(
            chan.circ_id_range(),
            Some(crate::channel::CircIdRange::High)
        );
        // An unknown peer that connected to us looks like a client.
        assert!(net.geoip.saw_client(&client_from.ip()));

        chan.request_close().unwrap();
        tls.handle_link_state_change(LinkState::Closed);
        drop(tls);
        drop(chan);
        net.env.registry.finish_all();
    }

    /// Feed everything `src` has written into `dst`, tracking the
    /// narrow-to-wide codec switch at the first VERSIONS cell.
    fn pump_one(src: &FakeTlsLink, dst: &crate::channel::tls::TlsChannel, upgraded: &mut bool) -> bool {
        let bytes = src.take_written();
        if bytes.is_empty() {
            return false;
        }
        let mut buf = bytes::BytesMut::from(&bytes[..]);
        loop {
            let mut codec = CellCodec::new(if *upgraded { 5 } else { 0 });
            match codec.decode_cell(&mut buf).unwrap() {
                Some(AnyCell::Var(c)) => {
                    if c.cmd() == CellCmd::VERSIONS {
                        *upgraded = true;
                    }
                    dst.handle_var_cell(c);
                }
                Some(AnyCell::Fixed(c)) => dst.handle_cell(c),
                None => break,
            }
        }
        assert!(buf.is_empty(), "partial cell left in the pump");
        true
    }

    #[test]
    fn relays_authenticate_to_each_other() {
        // A full bidirectional handshake between two public relays:
        // VERSIONS both ways, CERTS both ways, AUTH_CHALLENGE,
        // AUTHENTICATE, NETINFO both ways.
        let store = Rc::new(FakeCertStore::default());
        let client_ident = install_identity(&store, 0x03);
        let server_ident = install_identity(&store, 0x51);

        let client_cfg = LinkConfig {
            is_public_server: true,
            advertised_addrs: vec![client_ip()],
            ..LinkConfig::default()
        };
        let server_cfg = LinkConfig {
            is_public_server: true,
            advertised_addrs: vec![server_addr().ip()],
            ..LinkConfig::default()
        };
        let client_net =
            TestNet::with_parts(client_cfg, Some(client_ident.clone()), store.clone());
        let server_net = TestNet::with_parts(server_cfg, Some(server_ident.clone()), store);

        // The connection as the client sees it.
        let client_link = FakeTlsLink::new(server_addr());
        client_link.set_state(LinkState::HandshakingV3);
        client_link.set_peer_cert(server_ident.link_cert().to_vec());
        client_net.connector.stage(client_link.clone());
        // The same connection as the server sees it.
        let server_from: SocketAddr = "198.51.100.3:40123".parse().unwrap();
        let server_link = FakeTlsLink::new(server_from);
        server_link.set_state(LinkState::HandshakingV2);
        server_link.set_own_cert(server_ident.link_cert().to_vec());

        let (client_chan, client_tls) = crate::channel::tls::TlsChannel::connect(
            &client_net.env,
            server_addr(),
            server_ident.id_digest(),
        )
        .unwrap();
        let (server_chan, server_tls) =
            crate::channel::tls::TlsChannel::from_incoming(&server_net.env, server_link.clone())
                .unwrap();

        let mut c2s_upgraded = false;
        let mut s2c_upgraded = false;
        loop {
            let a = pump_one(&client_link, &server_tls, &mut c2s_upgraded);
            let b = pump_one(&server_link, &client_tls, &mut s2c_upgraded);
            if !a && !b {
                break;
            }
        }

        assert_eq!(client_chan.state(), ChanState::Open);
        assert_eq!(server_chan.state(), ChanState::Open);
        assert_eq!(client_chan.identity_digest(), server_ident.id_digest());
        assert_eq!(server_chan.identity_digest(), client_ident.id_digest());
        // 0x03... < 0x51..., so the client takes the low IDs and the
        // server the high ones.
        assert_eq!(
            client_chan.circ_id_range(),
            Some(crate::channel::CircIdRange::Low)
        );
        assert_eq!(
            server_chan.circ_id_range(),
            Some(crate::channel::CircIdRange::High)
        );
        // Each side dialed (or was dialed on) an address the other
        // advertises.
        assert!(client_link.is_canonical());
        assert!(server_link.is_canonical());
        // The server recorded the authenticated identity on its
        // connection.
        assert_eq!(
            server_link.peer_id_inits().last(),
            Some(&client_ident.id_digest())
        );
        assert!(server_net.circuits.saw_n_chan_done(&server_chan, true));
        assert!(client_net.circuits.saw_n_chan_done(&client_chan, true));

        // The channels now carry traffic.
        server_tls.handle_cell(Cell::new(CircId::new(0x8001), CellCmd::RELAY));
        assert_eq!(server_chan.n_queued_cells(), 1);

        for (chan, tls, net) in [
            (client_chan, client_tls, &client_net),
            (server_chan, server_tls, &server_net),
        ] {
            chan.request_close().unwrap();
            tls.handle_link_state_change(LinkState::Closed);
            drop(tls);
            drop(chan);
            net.env.registry.finish_all();
        }
    }

    #[test]
    fn unauthenticated_relay_netinfo_is_scrubbed_not_fatal() {
        // A responder that saw CERTS (so it holds initiator certs) but
        // no AUTHENTICATE treats the peer as anonymous at NETINFO time.
        let store = Rc::new(FakeCertStore::default());
        let client_ident = install_identity(&store, 0x03);
        let server_ident = install_identity(&store, 0x51);
        let config = LinkConfig {
            is_public_server: true,
            advertised_addrs: vec![server_addr().ip()],
            ..LinkConfig::default()
        };
        let net = TestNet::with_parts(config, Some(server_ident.clone()), store);
        let link = FakeTlsLink::new("203.0.113.9:50044".parse().unwrap());
        link.set_state(LinkState::HandshakingV2);
        link.set_own_cert(server_ident.link_cert().to_vec());
        let (chan, tls) =
            crate::channel::tls::TlsChannel::from_incoming(&net.env, link.clone()).unwrap();

        tls.handle_var_cell(versions_cell(&[4, 5]));
        let _ = link.take_written();
        // The initiator sends its CERTS...
        let mut certs = Certs::new_empty();
        certs.push_cert_body(CertType::AUTH_1024, client_ident.auth_cert());
        certs.push_cert_body(CertType::ID_1024, client_ident.id_cert());
        tls.handle_var_cell(certs.into_var_cell().unwrap());
        // ...but never authenticates, and goes straight to NETINFO.
        tls.handle_cell(Netinfo::from_client(None).into_cell().unwrap());

        assert_eq!(chan.state(), ChanState::Open);
        assert!(chan.identity_digest().is_zero());
        assert_eq!(link.peer_id_inits(), vec![IdDigest::ZERO]);

        chan.request_close().unwrap();
        tls.handle_link_state_change(LinkState::Closed);
        drop(tls);
        drop(chan);
        net.env.registry.finish_all();
    }

    #[test]
    fn registry_shared_between_rigs_is_consistent() {
        // Spot-check invariant bookkeeping across a failing handshake.
        let store = Rc::new(FakeCertStore::default());
        let rig = client_rig(store, IdDigest::ZERO, LinkConfig::default(), None);
        let registry: &ChannelRegistry = &rig.net.env.registry;
        registry.assert_consistent();
        rig.tls.handle_var_cell(versions_cell(&[1, 2]));
        registry.assert_consistent();
        assert_eq!(registry.n_finished(), 1);
        finish(rig);
    }
}
