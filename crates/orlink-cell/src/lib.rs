#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![warn(noop_method_call)]
#![warn(unreachable_pub)]
#![warn(clippy::all)]
#![deny(clippy::cast_lossless)]
#![deny(clippy::checked_conversions)]
#![deny(clippy::exhaustive_enums)]
#![deny(clippy::exhaustive_structs)]
#![deny(clippy::missing_docs_in_private_items)]
#![warn(clippy::needless_borrow)]
#![warn(clippy::needless_pass_by_value)]
#![deny(clippy::print_stderr)]
#![deny(clippy::print_stdout)]
#![warn(clippy::semicolon_if_nothing_returned)]
#![deny(clippy::unwrap_used)]
#![allow(clippy::uninlined_format_args)]

pub mod codec;
mod err;
pub mod msg;

use caret::caret_int;
use orlink_bytes::{EncodeResult, Writer};

pub use err::Error;

/// A Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// The amount of data sent in a fixed-length cell.
///
/// Fixed-length cells have carried 509 bytes of payload since the first
/// version of the link protocol; the only thing that has changed since
/// then is the width of the circuit ID in front of them.
pub const PAYLOAD_SIZE: usize = 509;

/// A fixed-length cell payload considered as a raw array of bytes.
pub type RawPayload = [u8; PAYLOAD_SIZE];

/// A [`RawPayload`] stored on the heap.
///
/// We use this to avoid copying payloads around as cells move
/// between queues.
pub type BoxedPayload = Box<RawPayload>;

/// Channel-local identifier for a circuit.
///
/// A circuit ID is 2 bytes long before link protocol version 4, and 4
/// bytes long afterwards.  The value 0 does not name a circuit: cells
/// carrying it apply to the channel as a whole, which is why this type
/// (unlike a circuit-map key) permits zero.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash)]
pub struct CircId(u32);

impl CircId {
    /// The zero circuit ID, used by cells that apply to the whole channel.
    pub const ZERO: CircId = CircId(0);

    /// Create a new CircId from a raw value.
    pub fn new(val: u32) -> Self {
        CircId(val)
    }
    /// Return the raw value of this circuit ID.
    pub fn get(self) -> u32 {
        self.0
    }
    /// Return true if this is the zero (channel-scope) circuit ID.
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl From<u32> for CircId {
    fn from(item: u32) -> Self {
        CircId(item)
    }
}
impl std::fmt::Display for CircId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

caret_int! {
    /// The command byte of a cell, which fixes both the framing
    /// (fixed- or variable-length) and the meaning of the payload.
    pub struct CellCmd(u8) {
        /// Fixed-length filler; dropped on receipt.
        PADDING = 0,
        /// Open a circuit, original handshake (long obsolete).
        CREATE = 1,
        /// Answer to CREATE (long obsolete).
        CREATED = 2,
        /// One unit of circuit traffic, opaque at this layer.
        RELAY = 3,
        /// Tear a circuit down.
        DESTROY = 4,
        /// Open a circuit with the keyless first-hop handshake.
        CREATE_FAST = 5,
        /// Answer to CREATE_FAST.
        CREATED_FAST = 6,
        // 7 sits below, with the variable-length commands
        /// Close out the link handshake with time and address data.
        NETINFO = 8,
        /// Circuit traffic that may carry an onward CREATE; rationed.
        RELAY_EARLY = 9,

        /// Open the link handshake; variable-length despite its low
        /// number.
        VERSIONS = 7,
        /// Variable-length filler; dropped on receipt.
        VPADDING = 128,
        /// Certificate material beyond what the TLS handshake carried.
        CERTS = 129,
        /// A responder's invitation to authenticate.
        AUTH_CHALLENGE = 130,
        /// An initiator's proof of identity.
        AUTHENTICATE = 131,
        /// Reserved for client authorization; nobody sends it today.
        AUTHORIZE = 132
    }
}

impl CellCmd {
    /// Return true if cells with this command use the counted
    /// (variable-length) framing.
    pub fn is_var_cell(self) -> bool {
        // The split is by command value: everything at 128 and over is
        // counted, plus VERSIONS, which kept its low number from the
        // days when it was the only counted cell there was.
        self == CellCmd::VERSIONS || self.0 >= 128_u8
    }
    /// Return true if this command is a padding command.
    ///
    /// (Padding cells don't count as "traffic" for the purpose of
    /// activity timestamps.)
    pub fn is_padding(self) -> bool {
        self == CellCmd::PADDING || self == CellCmd::VPADDING
    }
}

/// A fixed-length cell: a circuit ID, a command, and 509 bytes of payload.
///
/// The payload is opaque at this level.  Commands that the link layer
/// itself cares about (like NETINFO) have parsed representations in
/// [`msg`]; everything else is passed through to the circuit layer
/// undecoded.
#[derive(Clone)]
pub struct Cell {
    /// Circuit ID associated with this cell.
    circ_id: CircId,
    /// Command describing how to interpret this cell.
    cmd: CellCmd,
    /// The payload of this cell.
    payload: BoxedPayload,
}

impl Cell {
    /// Construct a new fixed-length cell with a zero-filled payload.
    pub fn new(circ_id: CircId, cmd: CellCmd) -> Self {
        Cell {
            circ_id,
            cmd,
            payload: Box::new([0_u8; PAYLOAD_SIZE]),
        }
    }
    /// Construct a new fixed-length cell from a provided payload.
    pub fn from_payload(circ_id: CircId, cmd: CellCmd, payload: BoxedPayload) -> Self {
        Cell {
            circ_id,
            cmd,
            payload,
        }
    }
    /// Return the circuit ID of this cell.
    pub fn circ_id(&self) -> CircId {
        self.circ_id
    }
    /// Return the command of this cell.
    pub fn cmd(&self) -> CellCmd {
        self.cmd
    }
    /// Return a reference to the payload of this cell.
    pub fn payload(&self) -> &RawPayload {
        &self.payload
    }
    /// Return a mutable reference to the payload of this cell.
    pub fn payload_mut(&mut self) -> &mut RawPayload {
        &mut self.payload
    }
    /// Consume this cell and return its payload.
    pub fn into_payload(self) -> BoxedPayload {
        self.payload
    }
}

impl std::fmt::Debug for Cell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Payloads are 509 bytes of mostly-zeros; don't dump them.
        f.debug_struct("Cell")
            .field("circ_id", &self.circ_id)
            .field("cmd", &self.cmd)
            .finish_non_exhaustive()
    }
}

/// A variable-length cell: a circuit ID, a command, and a counted payload.
///
/// Only a handful of commands use this format; see
/// [`CellCmd::is_var_cell`].
#[derive(Clone, Debug)]
pub struct VarCell {
    /// Circuit ID associated with this cell.
    circ_id: CircId,
    /// Command describing how to interpret this cell.
    cmd: CellCmd,
    /// The payload of this cell.
    payload: Vec<u8>,
}

impl VarCell {
    /// Construct a new variable-length cell.
    pub fn new<B>(circ_id: CircId, cmd: CellCmd, payload: B) -> Self
    where
        B: Into<Vec<u8>>,
    {
        VarCell {
            circ_id,
            cmd,
            payload: payload.into(),
        }
    }
    /// Return the circuit ID of this cell.
    pub fn circ_id(&self) -> CircId {
        self.circ_id
    }
    /// Return the command of this cell.
    pub fn cmd(&self) -> CellCmd {
        self.cmd
    }
    /// Return a reference to the payload of this cell.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
    /// Consume this cell and return its payload.
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }
    /// Encode this cell in the manner used before version negotiation
    /// completes.
    ///
    /// (That's different from the negotiated encoding, since the
    /// circuit-ID length is an obsolete 2 bytes.  The VERSIONS cell is
    /// always encoded this way, and the handshake transcripts digest
    /// cells in this form until a width is negotiated.)
    pub fn encode_for_handshake(&self) -> Result<Vec<u8>> {
        let len: u16 = self
            .payload
            .len()
            .try_into()
            .map_err(|_| Error::CantEncode("variable-length cell payload too long"))?;
        let mut v = Vec::with_capacity(5 + self.payload.len());
        v.write_u16((self.circ_id.get() & 0xffff) as u16);
        v.write_u8(self.cmd.into());
        v.write_u16(len);
        v.write_all(&self.payload[..]);
        Ok(v)
    }
}

/// A cell of either format, as pulled off the wire or held in a queue.
///
/// Insertion order of queued cells is significant, so the two formats
/// share a queue; this is the tagged union they share it as.
#[derive(Clone, Debug)]
#[allow(clippy::exhaustive_enums)]
pub enum AnyCell {
    /// A fixed-length cell.
    Fixed(Cell),
    /// A variable-length cell.
    Var(VarCell),
}

impl AnyCell {
    /// Return the command of this cell.
    pub fn cmd(&self) -> CellCmd {
        match self {
            AnyCell::Fixed(c) => c.cmd(),
            AnyCell::Var(c) => c.cmd(),
        }
    }
    /// Return the circuit ID of this cell.
    pub fn circ_id(&self) -> CircId {
        match self {
            AnyCell::Fixed(c) => c.circ_id(),
            AnyCell::Var(c) => c.circ_id(),
        }
    }
}

impl From<Cell> for AnyCell {
    fn from(c: Cell) -> Self {
        AnyCell::Fixed(c)
    }
}
impl From<VarCell> for AnyCell {
    fn from(c: VarCell) -> Self {
        AnyCell::Var(c)
    }
}

/// Helper: wrap an EncodeResult whose only failure mode is a length
/// overflow into this crate's error type.
pub(crate) fn wrap_encode<T>(r: EncodeResult<T>, object: &'static str) -> Result<T> {
    r.map_err(|_| Error::CantEncode(object))
}
