//! Define an error type for the orlink-proto crate.

use std::sync::Arc;

use thiserror::Error;

use crate::channel::ChanState;

/// An error type for the orlink-proto crate.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// An error that occurred in the orlink-bytes crate while decoding an
    /// object.
    #[error("parsing error: {0}")]
    BytesErr(#[from] orlink_bytes::Error),
    /// An error occurred in the cell-handling layer.
    #[error("cell handling error: {0}")]
    CellErr(#[from] orlink_cell::Error),
    /// An error from the io system occurred when writing to a channel's
    /// connection.
    #[error("io error on channel: {0}")]
    ChanIoErr(#[source] Arc<std::io::Error>),
    /// Handshake protocol violation.
    #[error("handshake protocol violation: {0}")]
    HandshakeProto(String),
    /// Protocol violation at the channel level, other than at the
    /// handshake stage.
    #[error("channel protocol violation: {0}")]
    ChanProto(String),
    /// Channel is closed, or closing.
    #[error("channel closed")]
    ChannelClosed,
    /// Somebody asked for a state change the transition table forbids.
    ///
    /// This is a programming error, but one we refuse observably (the
    /// channel is left unchanged) rather than with an assertion.
    #[error("invalid channel state change: {from} -> {to}")]
    BadStateChange {
        /// The state the channel was in.
        from: ChanState,
        /// The state that was requested.
        to: ChanState,
    },
    /// An operation was attempted on a channel whose state doesn't
    /// support it.
    #[error("channel in state {state} cannot {action}")]
    UnusableState {
        /// What was being attempted.
        action: &'static str,
        /// The state the channel was in.
        state: ChanState,
    },
    /// There was a programming error somewhere in our code, or the
    /// calling code.
    #[error("internal programming error: {0}")]
    Internal(&'static str),
}

impl Error {
    /// Wrap an io error that occurred while talking to the connection
    /// under a channel.
    pub(crate) fn from_io(e: std::io::Error) -> Self {
        Error::ChanIoErr(Arc::new(e))
    }
}
