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

pub mod channel;
mod err;
pub mod external;
mod ident;
pub mod relaycrypt;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
mod util;

pub use err::Error;
pub use ident::{IdDigest, ID_DIGEST_LEN};
pub use util::skew::ClockSkew;

pub use channel::{ChanState, Channel, ChannelRegistry, CircIdRange, CloseReason, UniqId};

/// A Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
