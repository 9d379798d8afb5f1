//! Internal: Declare an Error type for orlink-bytes

use std::borrow::Cow;

use thiserror::Error;

/// Error type for decoding objects from bytes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// Tried to read something, but we didn't find enough bytes.
    ///
    /// This can mean that the object is truncated, or that we need to
    /// read more and try again.
    #[error("object truncated (or not fully present)")]
    Truncated,
    /// Called Reader::should_be_exhausted(), but found bytes anyway.
    #[error("extra bytes at end of object")]
    ExtraneousBytes,
    /// Invalid length value.
    #[error("object length too large to represent")]
    BadLengthValue,
    /// An attempt to parse an object failed for some reason related to its
    /// contents.
    #[error("bad object: {0}")]
    InvalidMessage(Cow<'static, str>),
}

/// Error type for encoding objects onto bytes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum EncodeError {
    /// We tried to encode an object with an attached length, but the length
    /// was too large to encode in the available space.
    #[error("object length too large to encode")]
    BadLengthValue,
    /// A parsing error that should never happen.
    ///
    /// We use this variant instead of calling assert() and unwrap() from
    /// within encoding implementations.
    #[error("internal error: {0}")]
    Internal(Cow<'static, str>),
}
