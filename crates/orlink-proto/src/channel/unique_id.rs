//! Helper for unique identifiers for channels.

use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};

/// Counter for allocating unique identifiers for channels.
static NEXT_ID: AtomicU64 = AtomicU64::new(0);

/// Unique identifier for a channel.
///
/// These identifiers are unique for the life of the process: the
/// 64-bit space cannot plausibly be exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UniqId(u64);

impl UniqId {
    /// Construct a new UniqId.
    pub(crate) fn new() -> Self {
        // Relaxed ordering is fine; we don't care about how this
        // is instantiated with respect to other channels.
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        UniqId(id)
    }
    /// Return this identifier as a plain integer, for use as a
    /// correlation key.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Display for UniqId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Chan {}", self.0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn chan_unique_id() {
        let ids: Vec<UniqId> = (0..10).map(|_| UniqId::new()).collect();

        // Make sure we got distinct numbers.
        let mut all_nums: Vec<_> = ids.iter().map(|x| x.0).collect();
        all_nums.sort_unstable();
        all_nums.dedup();
        assert_eq!(all_nums.len(), ids.len());

        assert_eq!(format!("{}", ids[3]), format!("Chan {}", ids[3].0));
    }
}
