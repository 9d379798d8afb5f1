//! Internal utilities for orlink-proto.

pub(crate) mod skew;
