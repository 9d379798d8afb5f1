//! Define an error type for the orlink-cell crate.

use thiserror::Error;

/// An error type for the orlink-cell crate.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// An error that occurred in the orlink-bytes crate while decoding an
    /// object.
    #[error("Error while parsing {parsed}")]
    BytesErr {
        /// The error that occurred.
        #[source]
        err: orlink_bytes::Error,
        /// The thing that was being parsed.
        parsed: &'static str,
    },
    /// There was a cell that was formatted in violation of the link
    /// protocol.
    #[error("cell protocol violation: {0}")]
    CellProto(String),
    /// A cell or message was too long to fit in its encoding.
    #[error("can't encode: {0}")]
    CantEncode(&'static str),
    /// A cell body arrived with the wrong command for the message we were
    /// asked to parse from it.
    #[error("tried to parse a {expected} message from a {actual} cell")]
    WrongCmd {
        /// The command the message type requires.
        expected: crate::CellCmd,
        /// The command the cell actually carried.
        actual: crate::CellCmd,
    },
}

impl Error {
    /// Wrap a byte-parsing error with a note about what we were parsing.
    pub(crate) fn from_bytes_err(err: orlink_bytes::Error, parsed: &'static str) -> Self {
        Error::BytesErr { err, parsed }
    }
}
