//! Implementation for encoding and decoding of raw cells.

use crate::{AnyCell, Cell, CellCmd, CircId, Error, Result, VarCell, PAYLOAD_SIZE};
use orlink_bytes::{Reader, Writer};

use bytes::BytesMut;

/// This object can be used to encode and decode cells.
///
/// The encoding depends on the negotiated link protocol version only
/// through the width of the circuit-ID field: two bytes before version
/// 4, four bytes from version 4 on.  Before any version has been
/// negotiated (`link_proto == 0`) the obsolete two-byte width applies.
///
/// The implemented format is one of the following:
///
/// Variable-length cells:
/// ```ignore
///     u16 | u32 circ_id;
///     u8 command;
///     u16 len;
///     u8 body[len];
/// ```
///
/// Fixed-width cells:
/// ```ignore
///     u16 | u32 circ_id;
///     u8 command;
///     u8 body[509];
/// ```
///
/// NOTE: a VERSIONS cell always uses the two-byte circuit ID, whatever
/// was (or will be) negotiated.  The handshake code reads and writes
/// VERSIONS cells through [`VarCell::encode_for_handshake`] before any
/// codec with a wide width is in play, so this codec never needs to
/// special-case them.
pub struct CellCodec {
    /// The link protocol version being used for this channel.
    link_proto: u16,
}

impl CellCodec {
    /// Create a new CellCodec for a given link protocol version.
    pub fn new(link_proto: u16) -> Self {
        CellCodec { link_proto }
    }

    /// Return the link protocol version this codec was built for.
    pub fn link_proto(&self) -> u16 {
        self.link_proto
    }

    /// Return true if this codec uses 4-byte circuit IDs.
    fn wide_ids(&self) -> bool {
        self.link_proto >= 4
    }

    /// Return the number of bytes used for a circuit ID.
    fn circ_id_len(&self) -> usize {
        if self.wide_ids() {
            4
        } else {
            2
        }
    }

    /// Write a circuit ID in the current width, or fail if it doesn't fit.
    fn write_circ_id(&self, id: CircId, dst: &mut BytesMut) -> Result<()> {
        if self.wide_ids() {
            dst.write_u32(id.get());
        } else {
            let narrow: u16 = id
                .get()
                .try_into()
                .map_err(|_| Error::CellProto(format!("circuit ID {} needs a wide field", id)))?;
            dst.write_u16(narrow);
        }
        Ok(())
    }

    /// Write the given fixed-length cell into the provided BytesMut object.
    pub fn write_cell(&mut self, cell: &Cell, dst: &mut BytesMut) -> Result<()> {
        self.write_circ_id(cell.circ_id(), dst)?;
        dst.write_u8(cell.cmd().into());
        dst.write_all(&cell.payload()[..]);
        Ok(())
    }

    /// Write the given variable-length cell into the provided BytesMut
    /// object.
    pub fn write_var_cell(&mut self, cell: &VarCell, dst: &mut BytesMut) -> Result<()> {
        let len: u16 = cell
            .payload()
            .len()
            .try_into()
            .map_err(|_| Error::CantEncode("variable-length cell payload too long"))?;
        self.write_circ_id(cell.circ_id(), dst)?;
        dst.write_u8(cell.cmd().into());
        dst.write_u16(len);
        dst.write_all(cell.payload());
        Ok(())
    }

    /// Write a cell of either format.
    pub fn write_any_cell(&mut self, cell: &AnyCell, dst: &mut BytesMut) -> Result<()> {
        match cell {
            AnyCell::Fixed(c) => self.write_cell(c, dst),
            AnyCell::Var(c) => self.write_var_cell(c, dst),
        }
    }

    /// Encode a single variable-length cell on its own and return the
    /// bytes.
    ///
    /// (The handshake transcripts need cells in exactly their wire form;
    /// this is a convenience for that.)
    pub fn encoded_var_cell(&mut self, cell: &VarCell) -> Result<Vec<u8>> {
        let mut buf = BytesMut::with_capacity(self.circ_id_len() + 3 + cell.payload().len());
        self.write_var_cell(cell, &mut buf)?;
        Ok(buf.to_vec())
    }

    /// Try to decode a cell from the provided BytesMut object.
    ///
    /// On a definite decoding error, return Err(_).  On a cell that might
    /// just be truncated, return Ok(None).
    pub fn decode_cell(&mut self, src: &mut BytesMut) -> Result<Option<AnyCell>> {
        /// Wrap `err` as an appropriate error type.
        fn wrap_err(err: orlink_bytes::Error) -> Error {
            Error::from_bytes_err(err, "cell")
        }

        let id_len = self.circ_id_len();
        // Smallest possible cell: a variable-length cell with an empty
        // body.  Below that we can't even read a header.
        if src.len() < id_len + 3 {
            return Ok(None);
        }
        let cmd: CellCmd = src[id_len].into();
        let varcell = cmd.is_var_cell();
        let cell_len: usize = if varcell {
            let msg_len = u16::from_be_bytes(
                src[id_len + 1..id_len + 3]
                    .try_into()
                    .expect("two-byte slice was not two bytes long!?"),
            );
            msg_len as usize + id_len + 3
        } else {
            id_len + 1 + PAYLOAD_SIZE
        };
        if src.len() < cell_len {
            return Ok(None);
        }

        let cell = src.split_to(cell_len);
        let mut r = Reader::from_slice(&cell);
        let circ_id: CircId = if self.wide_ids() {
            r.take_u32().map_err(wrap_err)?.into()
        } else {
            u32::from(r.take_u16().map_err(wrap_err)?).into()
        };
        // Skip the command (and length, for variable-length cells); we
        // already read them above.
        r.advance(if varcell { 3 } else { 1 }).map_err(wrap_err)?;
        let decoded = if varcell {
            AnyCell::Var(VarCell::new(circ_id, cmd, r.take_rest()))
        } else {
            let mut payload = Box::new([0_u8; PAYLOAD_SIZE]);
            r.take_into(&mut payload[..]).map_err(wrap_err)?;
            AnyCell::Fixed(Cell::from_payload(circ_id, cmd, payload))
        };
        Ok(Some(decoded))
    }
}
