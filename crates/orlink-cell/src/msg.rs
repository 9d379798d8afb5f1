//! Parsed bodies for the messages that the link layer itself consumes.
//!
//! Only the handshake messages (and DESTROY's reason code) get parsed
//! representations here.  Everything else on a channel is relayed as an
//! opaque payload to the circuit layer.

use crate::{wrap_encode, Cell, CellCmd, CircId, Error, VarCell, PAYLOAD_SIZE};
use orlink_bytes::{EncodeError, EncodeResult, Reader, Result as BytesResult, Writer};

use caret::caret_int;
use std::net::{IpAddr, Ipv4Addr};

/// Trait for the bodies of link-layer messages.
pub trait Body: Sized {
    /// Decode a message body from a provided reader.
    ///
    /// The reader must be positioned at the start of the body; trailing
    /// data is tolerated only where the cell format pads (NETINFO).
    fn decode_from_reader(r: &mut Reader<'_>) -> BytesResult<Self>;
    /// Consume this message and encode its body onto `w`.
    ///
    /// Does not encode anything _but_ the message body, and does not pad
    /// to the cell length.
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> EncodeResult<()>;
}

/// Helper: declare conversions between a variable-length message body and
/// the VarCell that carries it.
macro_rules! var_cell_body {
    ($body:ident, $cmd:ident) => {
        impl $body {
            /// Package this message as a variable-length cell.
            pub fn into_var_cell(self) -> crate::Result<VarCell> {
                let mut payload = Vec::new();
                wrap_encode(self.encode_onto(&mut payload), stringify!($cmd))?;
                Ok(VarCell::new(CircId::ZERO, CellCmd::$cmd, payload))
            }
            /// Parse this message out of a variable-length cell.
            pub fn from_var_cell(cell: &VarCell) -> crate::Result<Self> {
                if cell.cmd() != CellCmd::$cmd {
                    return Err(Error::WrongCmd {
                        expected: CellCmd::$cmd,
                        actual: cell.cmd(),
                    });
                }
                let mut r = Reader::from_slice(cell.payload());
                Self::decode_from_reader(&mut r)
                    .map_err(|e| Error::from_bytes_err(e, stringify!($cmd)))
            }
        }
    };
}

/// The VERSIONS message, with which every link handshake opens.
///
/// Each endpoint announces the link protocol versions it is prepared to
/// speak; the highest version the two announcements share is the one
/// the channel runs.
///
/// Because this message has to be readable before any version has been
/// agreed on, its framing is frozen in time: its circuit-ID field is
/// two bytes even when the rest of the connection goes on to use four.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Versions {
    /// The announced link protocol versions.
    versions: Vec<u16>,
}

impl Versions {
    /// Build a VERSIONS message from the protocols we speak.
    ///
    /// Fails if the list is too long for a cell body to hold.
    pub fn new<B>(vs: B) -> crate::Result<Self>
    where
        B: Into<Vec<u16>>,
    {
        let versions = vs.into();
        if versions.len() < (u16::MAX / 2) as usize {
            Ok(Self { versions })
        } else {
            Err(Error::CantEncode("too many versions"))
        }
    }
    /// Return the versions announced in this message.
    pub fn versions(&self) -> &[u16] {
        &self.versions
    }
    /// Encode this message in the frozen pre-negotiation framing, with
    /// its two-byte circuit-ID field.
    pub fn encode_for_handshake(self) -> crate::Result<Vec<u8>> {
        self.into_var_cell()?.encode_for_handshake()
    }
    /// Pick the negotiation winner: the highest protocol that appears
    /// both in this message and in `my_protos`.
    pub fn best_shared_link_protocol(&self, my_protos: &[u16]) -> Option<u16> {
        // Quadratic, but both lists are tiny.
        my_protos
            .iter()
            .copied()
            .filter(|p| *p != 0 && self.versions.contains(p))
            .max()
    }
}

impl Body for Versions {
    fn decode_from_reader(r: &mut Reader<'_>) -> BytesResult<Self> {
        // An odd body length would leave a trailing byte with no assigned
        // meaning; reject it rather than guess.
        if r.remaining() % 2 != 0 {
            return Err(orlink_bytes::Error::InvalidMessage(
                "odd length on a VERSIONS body".into(),
            ));
        }
        let mut versions = Vec::with_capacity(r.remaining() / 2);
        while r.remaining() > 0 {
            versions.push(r.take_u16()?);
        }
        Ok(Versions { versions })
    }
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> EncodeResult<()> {
        for v in &self.versions {
            w.write_u16(*v);
        }
        Ok(())
    }
}
var_cell_body!(Versions, VERSIONS);

caret_int! {
    /// A type code for a certificate carried in a Certs message.
    pub struct CertType(u8) {
        /// Certificate matching the key used in the TLS handshake.
        TLS_LINK = 1,
        /// Self-signed certificate containing the identity key.
        ID_1024 = 2,
        /// Certificate for the authentication key, signed by the
        /// identity key.
        AUTH_1024 = 3
    }
}

/// A single certificate entry in a Certs message.
///
/// The certificate bytes are opaque here; decoding them is the business
/// of the embedding application's certificate code.
#[derive(Clone, Debug)]
struct CertEntry {
    /// Type code for this certificate.
    cert_type: CertType,
    /// Encoded certificate.
    body: Vec<u8>,
}

impl orlink_bytes::Readable for CertEntry {
    fn take_from(r: &mut Reader<'_>) -> BytesResult<Self> {
        let cert_type = r.take_u8()?.into();
        let len = r.take_u16()?;
        let body = r.take(len as usize)?.into();
        Ok(CertEntry { cert_type, body })
    }
}

/// A CERTS message: the certificate material a peer shows beyond what
/// its TLS handshake carried.
///
/// Responders use it to tie the TLS session key back to a long-term
/// identity; initiators that intend to authenticate use it to name the
/// keys their AUTHENTICATE will be checked against.  This type only
/// keeps the (opaque) certificate bodies sorted by type code; judging
/// them is the handshake engine's business.
#[derive(Clone, Debug)]
pub struct Certs {
    /// The carried certificates, in wire order.
    certs: Vec<CertEntry>,
}

impl Certs {
    /// Start an empty certificate list.
    pub fn new_empty() -> Self {
        Certs { certs: Vec::new() }
    }
    /// Append one certificate body under the given type code, taken on
    /// faith: no structural checks happen here.
    pub fn push_cert_body<B>(&mut self, cert_type: CertType, body: B)
    where
        B: Into<Vec<u8>>,
    {
        let body = body.into();
        self.certs.push(CertEntry { cert_type, body });
    }
    /// Return how many certificates are carried.
    pub fn n_certs(&self) -> usize {
        self.certs.len()
    }
    /// Find the first certificate carrying type code `tp`.
    pub fn cert_body(&self, tp: CertType) -> Option<&[u8]> {
        self.certs
            .iter()
            .find(|c| c.cert_type == tp)
            .map(|c| &c.body[..])
    }
    /// Return the body of the certificate tagged with `tp`, insisting
    /// that there be at most one.
    ///
    /// A peer that sends two certificates with the same type code is
    /// trying to confuse us about which one we validated; that is a
    /// protocol violation.
    pub fn unique_cert_body(&self, tp: CertType) -> crate::Result<Option<&[u8]>> {
        let mut found = None;
        for c in self.certs.iter().filter(|c| c.cert_type == tp) {
            if found.is_some() {
                return Err(Error::CellProto(format!(
                    "duplicate {} certificate in CERTS message",
                    tp
                )));
            }
            found = Some(&c.body[..]);
        }
        Ok(found)
    }
}

impl Body for Certs {
    fn decode_from_reader(r: &mut Reader<'_>) -> BytesResult<Self> {
        let n = r.take_u8()?;
        let certs = r.extract_n(n as usize)?;
        Ok(Certs { certs })
    }
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> EncodeResult<()> {
        let n_certs: u8 = self
            .certs
            .len()
            .try_into()
            .map_err(|_| EncodeError::BadLengthValue)?;
        w.write_u8(n_certs);
        for c in &self.certs {
            w.write_u8(c.cert_type.into());
            let cert_len: u16 = c
                .body
                .len()
                .try_into()
                .map_err(|_| EncodeError::BadLengthValue)?;
            w.write_u16(cert_len);
            w.write_all(&c.body[..]);
        }
        Ok(())
    }
}
var_cell_body!(Certs, CERTS);

/// Length of the random challenge in an AuthChallenge message.
pub const AUTH_CHALLENGE_LEN: usize = 32;

/// Authentication method: RSA-SHA256 over exported TLS secret material.
///
/// This is the only method the link handshake currently recognizes.
pub const AUTHTYPE_RSA_SHA256_TLSSECRET: u16 = 1;

/// An AUTH_CHALLENGE message, by which a responder invites the
/// initiator to prove who it is.
///
/// It contributes unpredictable bytes to the handshake (so no earlier
/// transcript can be replayed at us) and names the authentication
/// methods the responder is willing to check.  An initiator with
/// nothing to prove — an ordinary client — just never answers.
#[derive(Clone, Debug)]
pub struct AuthChallenge {
    /// The unpredictable bytes.
    challenge: [u8; AUTH_CHALLENGE_LEN],
    /// Method codes the responder will accept.
    methods: Vec<u16>,
}

impl AuthChallenge {
    /// Assemble a challenge from fresh random bytes and the method
    /// codes we are willing to check.
    pub fn new<B, M>(challenge: B, methods: M) -> Self
    where
        B: Into<[u8; AUTH_CHALLENGE_LEN]>,
        M: Into<Vec<u16>>,
    {
        AuthChallenge {
            challenge: challenge.into(),
            methods: methods.into(),
        }
    }
    /// Return the challenge value in this message.
    pub fn challenge(&self) -> &[u8; AUTH_CHALLENGE_LEN] {
        &self.challenge
    }
    /// Return true if the peer has offered the authentication method
    /// `method`.
    pub fn offers(&self, method: u16) -> bool {
        self.methods.contains(&method)
    }
}

impl Body for AuthChallenge {
    fn decode_from_reader(r: &mut Reader<'_>) -> BytesResult<Self> {
        let challenge = r.extract()?;
        let n_methods = r.take_u16()?;
        let methods = r.extract_n(n_methods as usize)?;
        Ok(AuthChallenge { challenge, methods })
    }
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> EncodeResult<()> {
        w.write_all(&self.challenge[..]);
        let n_methods: u16 = self
            .methods
            .len()
            .try_into()
            .map_err(|_| EncodeError::BadLengthValue)?;
        w.write_u16(n_methods);
        for m in self.methods {
            w.write_u16(m);
        }
        Ok(())
    }
}
var_cell_body!(AuthChallenge, AUTH_CHALLENGE);

/// An AUTHENTICATE message: an initiating relay's answer to the
/// challenge, binding its identity to this very connection.
///
/// What the body means depends entirely on the method code, so this
/// type carries the code and the raw authentication object and leaves
/// interpretation (and verification) to the handshake engine.
#[derive(Clone, Debug)]
pub struct Authenticate {
    /// The method code for this authentication object.
    auth_type: u16,
    /// The authentication object, uninterpreted.
    auth: Vec<u8>,
}

impl Authenticate {
    /// Wrap an already-computed authentication object and its method
    /// code.
    pub fn new<B>(auth_type: u16, body: B) -> Self
    where
        B: Into<Vec<u8>>,
    {
        Authenticate {
            auth_type,
            auth: body.into(),
        }
    }
    /// Return the authentication method of this message.
    pub fn auth_type(&self) -> u16 {
        self.auth_type
    }
    /// Return the authentication object of this message.
    pub fn auth(&self) -> &[u8] {
        &self.auth
    }
}

impl Body for Authenticate {
    fn decode_from_reader(r: &mut Reader<'_>) -> BytesResult<Self> {
        let auth_type = r.take_u16()?;
        let auth_len = r.take_u16()?;
        let auth = r.take(auth_len as usize)?.into();
        Ok(Authenticate { auth_type, auth })
    }
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> EncodeResult<()> {
        w.write_u16(self.auth_type);
        let auth_len: u16 = self
            .auth
            .len()
            .try_into()
            .map_err(|_| EncodeError::BadLengthValue)?;
        w.write_u16(auth_len);
        w.write_all(&self.auth[..]);
        Ok(())
    }
}
var_cell_body!(Authenticate, AUTHENTICATE);

/// Address type code for IPv4 in a netinfo address record.
const NETINFO_ADDR_IPV4: u8 = 0x04;
/// Address type code for IPv6 in a netinfo address record.
const NETINFO_ADDR_IPV6: u8 = 0x06;

/// Write one type/length/value address record.
fn enc_one_netinfo_addr<W: Writer + ?Sized>(w: &mut W, addr: &IpAddr) {
    match addr {
        IpAddr::V4(ipv4) => {
            w.write_u8(NETINFO_ADDR_IPV4);
            w.write_u8(4); // length
            w.write_all(&ipv4.octets()[..]);
        }
        IpAddr::V6(ipv6) => {
            w.write_u8(NETINFO_ADDR_IPV6);
            w.write_u8(16); // length
            w.write_all(&ipv6.octets()[..]);
        }
    }
}

/// Read one type/length/value address record.
///
/// A record with a type code we don't know still gets consumed (the
/// rest of the message must stay parseable) but comes back as None.
fn take_one_netinfo_addr(r: &mut Reader<'_>) -> BytesResult<Option<IpAddr>> {
    let atype = r.take_u8()?;
    let alen = r.take_u8()?;
    let abody = r.take(alen as usize)?;
    match (atype, alen) {
        (NETINFO_ADDR_IPV4, 4) => {
            let bytes: [u8; 4] = abody.try_into().expect("4-byte slice was not 4 bytes!?");
            Ok(Some(IpAddr::V4(bytes.into())))
        }
        (NETINFO_ADDR_IPV6, 16) => {
            let bytes: [u8; 16] = abody.try_into().expect("16-byte slice was not 16 bytes!?");
            Ok(Some(IpAddr::V6(bytes.into())))
        }
        (_, _) => Ok(None),
    }
}

/// A NETINFO message, the final move of the link handshake.
///
/// Each side declares three things: what time it believes it is, the
/// address it saw the other side arrive from, and the addresses it
/// claims for itself.  The first feeds clock-skew bookkeeping, the
/// second lets an endpoint learn how the world sees it, and the third
/// decides whether the connection counts as canonical.  Once NETINFO
/// has crossed in both directions, the channel is open for traffic.
#[derive(Clone, Debug)]
pub struct Netinfo {
    /// The sender's idea of the time, in seconds; 0 when the sender
    /// would rather not say.
    timestamp: u32,
    /// Where the sender believes its counterpart is connecting from.
    their_addr: Option<IpAddr>,
    /// The addresses the sender claims as its own.
    my_addrs: Vec<IpAddr>,
}

impl Netinfo {
    /// The NETINFO an anonymous client sends: no timestamp, no
    /// addresses, only its view of the relay's address.
    pub fn from_client(their_addr: Option<IpAddr>) -> Self {
        Netinfo {
            timestamp: 0,
            their_addr,
            my_addrs: Vec::new(),
        }
    }
    /// The NETINFO a relay sends: real wallclock seconds plus the
    /// addresses it wants to be reached at.
    pub fn from_relay<V>(timestamp: u32, their_addr: Option<IpAddr>, my_addrs: V) -> Self
    where
        V: Into<Vec<IpAddr>>,
    {
        Netinfo {
            timestamp,
            their_addr,
            my_addrs: my_addrs.into(),
        }
    }
    /// Return the raw timestamp in this message; 0 means "not reported".
    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }
    /// Return the address that the sender claims to have observed for us.
    pub fn their_addr(&self) -> Option<IpAddr> {
        self.their_addr
    }
    /// Return the addresses that the sender claims as its own.
    pub fn my_addrs(&self) -> &[IpAddr] {
        &self.my_addrs
    }
    /// Package this message as a fixed-length cell.
    pub fn into_cell(self) -> crate::Result<Cell> {
        let mut payload = Vec::new();
        wrap_encode(self.encode_onto(&mut payload), "NETINFO")?;
        if payload.len() > PAYLOAD_SIZE {
            return Err(Error::CantEncode("NETINFO body too long for a cell"));
        }
        let mut cell = Cell::new(CircId::ZERO, CellCmd::NETINFO);
        cell.payload_mut()[..payload.len()].copy_from_slice(&payload[..]);
        Ok(cell)
    }
    /// Parse this message out of a fixed-length cell.
    ///
    /// Trailing bytes in the payload are padding, and are ignored.
    pub fn from_cell(cell: &Cell) -> crate::Result<Self> {
        if cell.cmd() != CellCmd::NETINFO {
            return Err(Error::WrongCmd {
                expected: CellCmd::NETINFO,
                actual: cell.cmd(),
            });
        }
        let mut r = Reader::from_slice(&cell.payload()[..]);
        Self::decode_from_reader(&mut r).map_err(|e| Error::from_bytes_err(e, "NETINFO"))
    }
}

impl Body for Netinfo {
    fn decode_from_reader(r: &mut Reader<'_>) -> BytesResult<Self> {
        let timestamp = r.take_u32()?;
        let their_addr = take_one_netinfo_addr(r)?.filter(|a| !a.is_unspecified());
        let n_my_addrs = r.take_u8()?;
        let mut my_addrs = Vec::with_capacity(n_my_addrs as usize);
        for _ in 0..n_my_addrs {
            if let Some(a) = take_one_netinfo_addr(r)? {
                my_addrs.push(a);
            }
        }
        Ok(Netinfo {
            timestamp,
            their_addr,
            my_addrs,
        })
    }
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> EncodeResult<()> {
        w.write_u32(self.timestamp);
        let their_addr = self
            .their_addr
            .unwrap_or_else(|| Ipv4Addr::UNSPECIFIED.into());
        enc_one_netinfo_addr(w, &their_addr);
        let n_addrs: u8 = self
            .my_addrs
            .len()
            .try_into()
            .map_err(|_| EncodeError::BadLengthValue)?;
        w.write_u8(n_addrs);
        for addr in &self.my_addrs {
            enc_one_netinfo_addr(w, addr);
        }
        Ok(())
    }
}

caret_int! {
    /// The reason code a DESTROY cell gives for tearing a circuit down.
    ///
    /// Reasons relayed from elsewhere pass through this layer
    /// unchecked, so unknown code points are representable.
    pub struct DestroyReason(u8) {
        /// The sender declined to say (clients always decline).
        NONE = 0,
        /// Somebody on the circuit broke protocol.
        PROTOCOL = 1,
        /// A relay on the circuit hit an internal problem.
        INTERNAL = 2,
        /// A TRUNCATE from the client asked for this teardown.
        REQUESTED = 3,
        /// A relay on the circuit is hibernating and turning work away.
        HIBERNATING = 4,
        /// Memory, sockets, or circuit IDs ran dry somewhere.
        RESOURCELIMIT = 5,
        /// The onward connection could not be made.
        CONNECTFAILED = 6,
        /// The next hop answered with an identity other than the one
        /// asked for.
        OR_IDENTITY = 7,
        /// A channel under this circuit went away.
        CHANNEL_CLOSED = 8,
        /// The circuit reached the end of its useful life.
        FINISHED = 9,
        /// Building the circuit took too long.
        TIMEOUT = 10,
        /// Torn down by a DESTROY from further along the circuit.
        DESTROYED = 11,
        /// The onion service being asked for is unknown.
        NOSUCHSERVICE = 12
    }
}

impl DestroyReason {
    /// Describe this reason code for a log line.
    pub fn human_str(&self) -> &'static str {
        match *self {
            DestroyReason::NONE => "no reason given",
            DestroyReason::PROTOCOL => "protocol violation on the circuit",
            DestroyReason::INTERNAL => "internal error at a relay",
            DestroyReason::REQUESTED => "truncated at the client's request",
            DestroyReason::HIBERNATING => "relay is hibernating",
            DestroyReason::RESOURCELIMIT => "relay is out of resources",
            DestroyReason::CONNECTFAILED => "onward connection failed",
            DestroyReason::OR_IDENTITY => "next relay's identity was not as expected",
            DestroyReason::CHANNEL_CLOSED => "underlying channel went away",
            DestroyReason::FINISHED => "circuit reached the end of its life",
            DestroyReason::TIMEOUT => "circuit build timed out",
            DestroyReason::DESTROYED => "destroyed from further along the circuit",
            DestroyReason::NOSUCHSERVICE => "no such onion service",
            _ => "unknown reason",
        }
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use hex_literal::hex;
    use std::net::Ipv6Addr;

    #[test]
    fn versions_roundtrip() {
        // Decoding and re-encoding a VERSIONS body yields the original
        // byte string.
        let body = hex!("0003 0004 0005");
        let mut r = Reader::from_slice(&body);
        let v = Versions::decode_from_reader(&mut r).unwrap();
        assert_eq!(v.versions(), &[3, 4, 5]);
        let mut out = Vec::new();
        v.encode_onto(&mut out).unwrap();
        assert_eq!(&out[..], &body[..]);
    }

    #[test]
    fn versions_handshake_encoding() {
        let v = Versions::new(vec![3, 4, 5]).unwrap();
        let enc = v.encode_for_handshake().unwrap();
        assert_eq!(&enc[..], &hex!("0000 07 0006 0003 0004 0005")[..]);
    }

    #[test]
    fn versions_odd_length() {
        let body = hex!("0003 04");
        let mut r = Reader::from_slice(&body);
        let e = Versions::decode_from_reader(&mut r).unwrap_err();
        assert!(matches!(e, orlink_bytes::Error::InvalidMessage(_)));
    }

    #[test]
    fn versions_negotiation() {
        let v = Versions::new(vec![1, 2, 3, 4]).unwrap();
        assert_eq!(v.best_shared_link_protocol(&[3, 4, 5]), Some(4));
        assert_eq!(v.best_shared_link_protocol(&[5, 6]), None);
        assert_eq!(v.best_shared_link_protocol(&[]), None);
        // Version 0 is never a real protocol.
        let v = Versions::new(vec![0]).unwrap();
        assert_eq!(v.best_shared_link_protocol(&[0, 5]), None);
    }

    #[test]
    fn certs_parse() {
        // two certificates: a (fake) TLS link cert and an identity cert.
        let body = hex!(
            "02
             01 0003 aabbcc
             02 0002 ddee"
        );
        let mut r = Reader::from_slice(&body);
        let certs = Certs::decode_from_reader(&mut r).unwrap();
        assert_eq!(certs.n_certs(), 2);
        assert_eq!(certs.cert_body(CertType::TLS_LINK).unwrap(), &hex!("aabbcc"));
        assert_eq!(certs.cert_body(CertType::ID_1024).unwrap(), &hex!("ddee"));
        assert!(certs.cert_body(CertType::AUTH_1024).is_none());
        assert!(certs.unique_cert_body(CertType::TLS_LINK).unwrap().is_some());

        // re-encode and compare.
        let mut out = Vec::new();
        certs.encode_onto(&mut out).unwrap();
        assert_eq!(&out[..], &body[..]);
    }

    #[test]
    fn certs_truncated() {
        // claims 2 certs but contains only one.
        let body = hex!("02 01 0003 aabbcc");
        let mut r = Reader::from_slice(&body);
        let e = Certs::decode_from_reader(&mut r).unwrap_err();
        assert_eq!(e, orlink_bytes::Error::Truncated);

        // cert length runs off the end.
        let body = hex!("01 01 0009 aabbcc");
        let mut r = Reader::from_slice(&body);
        let e = Certs::decode_from_reader(&mut r).unwrap_err();
        assert_eq!(e, orlink_bytes::Error::Truncated);
    }

    #[test]
    fn certs_duplicate() {
        let mut certs = Certs::new_empty();
        certs.push_cert_body(CertType::ID_1024, &hex!("aa")[..]);
        certs.push_cert_body(CertType::ID_1024, &hex!("bb")[..]);
        let e = certs.unique_cert_body(CertType::ID_1024).unwrap_err();
        assert!(matches!(e, Error::CellProto(_)));
        // cert_body without the uniqueness check returns the first one.
        assert_eq!(certs.cert_body(CertType::ID_1024).unwrap(), &hex!("aa"));
    }

    #[test]
    fn auth_challenge_parse() {
        let body = hex!(
            "FFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFF
             FFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFF
             0002 0003 00ff"
        );
        let mut r = Reader::from_slice(&body);
        let ac = AuthChallenge::decode_from_reader(&mut r).unwrap();
        assert_eq!(ac.challenge(), &[0xff; 32]);
        assert!(ac.offers(3));
        assert!(ac.offers(0xff));
        assert!(!ac.offers(AUTHTYPE_RSA_SHA256_TLSSECRET));

        // too short to hold the challenge.
        let mut r = Reader::from_slice(&body[..20]);
        let e = AuthChallenge::decode_from_reader(&mut r).unwrap_err();
        assert_eq!(e, orlink_bytes::Error::Truncated);
    }

    #[test]
    fn authenticate_parse() {
        let body = hex!("0001 0004 01020304");
        let mut r = Reader::from_slice(&body);
        let a = Authenticate::decode_from_reader(&mut r).unwrap();
        assert_eq!(a.auth_type(), AUTHTYPE_RSA_SHA256_TLSSECRET);
        assert_eq!(a.auth(), &hex!("01020304"));

        // The declared body length must be bounded by the cell.
        let body = hex!("0001 0009 01020304");
        let mut r = Reader::from_slice(&body);
        let e = Authenticate::decode_from_reader(&mut r).unwrap_err();
        assert_eq!(e, orlink_bytes::Error::Truncated);
    }

    #[test]
    fn netinfo_parse() {
        let body = hex!(
            "48949290
             04 04 7f000002
             01
             04 04 7f000003"
        );
        let mut r = Reader::from_slice(&body);
        let n = Netinfo::decode_from_reader(&mut r).unwrap();
        assert_eq!(n.timestamp(), 0x48949290);
        assert_eq!(n.their_addr(), Some("127.0.0.2".parse().unwrap()));
        assert_eq!(n.my_addrs(), &["127.0.0.3".parse::<IpAddr>().unwrap()]);
    }

    #[test]
    fn netinfo_unspecified_and_unknown() {
        // An all-zeros observed address decodes as "none", and an
        // unrecognized address type is decoded but not stored.
        let body = hex!(
            "00000000
             04 04 00000000
             02
             0a 02 beef
             06 10 00000000000000000000000000000001"
        );
        let mut r = Reader::from_slice(&body);
        let n = Netinfo::decode_from_reader(&mut r).unwrap();
        assert_eq!(n.timestamp(), 0);
        assert_eq!(n.their_addr(), None);
        assert_eq!(n.my_addrs(), &["::1".parse::<IpAddr>().unwrap()]);
    }

    #[test]
    fn netinfo_truncated() {
        let body = hex!("48949290 04 04 7f00");
        let mut r = Reader::from_slice(&body);
        let e = Netinfo::decode_from_reader(&mut r).unwrap_err();
        assert_eq!(e, orlink_bytes::Error::Truncated);
    }

    #[test]
    fn netinfo_max_v6_roundtrip() {
        // A NETINFO body with the max-representable IPv6 peer address and
        // zero "others" round-trips.
        let all_ones = Ipv6Addr::from([0xff_u8; 16]);
        let n = Netinfo::from_client(Some(all_ones.into()));
        let mut body = Vec::new();
        n.encode_onto(&mut body).unwrap();
        let mut r = Reader::from_slice(&body);
        let n2 = Netinfo::decode_from_reader(&mut r).unwrap();
        assert_eq!(n2.their_addr(), Some(IpAddr::V6(all_ones)));
        assert!(n2.my_addrs().is_empty());
        assert_eq!(n2.timestamp(), 0);
        let mut body2 = Vec::new();
        n2.encode_onto(&mut body2).unwrap();
        assert_eq!(body, body2);
    }

    #[test]
    fn netinfo_cell_padding() {
        // into_cell pads to the fixed length; from_cell ignores padding.
        let n = Netinfo::from_relay(99, None, vec!["192.0.2.1".parse::<IpAddr>().unwrap()]);
        let cell = n.into_cell().unwrap();
        assert_eq!(cell.cmd(), CellCmd::NETINFO);
        let n2 = Netinfo::from_cell(&cell).unwrap();
        assert_eq!(n2.timestamp(), 99);
        assert_eq!(n2.my_addrs().len(), 1);
    }

    #[test]
    fn var_cell_conversions() {
        let v = Versions::new(vec![4, 5]).unwrap();
        let vc = v.clone().into_var_cell().unwrap();
        assert_eq!(vc.cmd(), CellCmd::VERSIONS);
        assert_eq!(vc.circ_id(), CircId::ZERO);
        let v2 = Versions::from_var_cell(&vc).unwrap();
        assert_eq!(v, v2);

        // Wrong command is rejected.
        let e = Certs::from_var_cell(&vc).unwrap_err();
        assert!(matches!(e, Error::WrongCmd { .. }));
    }

    #[test]
    fn destroy_reason() {
        let r1 = DestroyReason::CONNECTFAILED;
        assert_eq!(r1.human_str(), "onward connection failed");

        let r2 = DestroyReason::from(200); // not a specified number.
        assert_eq!(r2.human_str(), "unknown reason");
    }
}
