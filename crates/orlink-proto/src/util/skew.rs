//! Tools and types for reporting declared clock skew.

use std::time::Duration;

/// A reported amount of clock skew from a relay or other source.
///
/// Note that this information may not be accurate or trustworthy: the
/// relay could be wrong, or lying.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[allow(clippy::exhaustive_enums)]
pub enum ClockSkew {
    /// Our own clock is "running slow": the peer's clock is at least
    /// this far ahead of ours.
    Slow(Duration),
    /// Our own clock is not necessarily inconsistent with the peer's
    /// clock.
    None,
    /// Our own clock is "running fast": the peer's clock is at least
    /// this far behind ours.
    Fast(Duration),
}

/// We treat clock skew as "zero" if it is less than this long.
///
/// (Since the peer only reports its time to the nearest second, we
/// can't reasonably infer that differences less than this much reflect
/// accurate differences in our clocks.)
const MIN: Duration = Duration::from_secs(2);

impl ClockSkew {
    /// Construct a ClockSkew from our own wallclock seconds and the
    /// seconds a peer declared in its NETINFO cell.
    pub fn from_handshake_secs(ours: u64, theirs: u64) -> Self {
        if theirs > ours {
            ClockSkew::Slow(Duration::from_secs(theirs - ours)).if_above(MIN)
        } else {
            ClockSkew::Fast(Duration::from_secs(ours - theirs)).if_above(MIN)
        }
    }

    /// Return the magnitude of this clock skew.
    pub fn magnitude(&self) -> Duration {
        match self {
            ClockSkew::Slow(d) => *d,
            ClockSkew::None => Duration::from_secs(0),
            ClockSkew::Fast(d) => *d,
        }
    }

    /// Return this clock skew as a signed number of seconds, with slow
    /// values treated as negative and fast values treated as positive.
    pub fn as_secs(&self) -> i64 {
        let magnitude = i64::try_from(self.magnitude().as_secs()).unwrap_or(i64::MAX);
        match self {
            ClockSkew::Slow(_) => -magnitude,
            ClockSkew::None => 0,
            ClockSkew::Fast(_) => magnitude,
        }
    }

    /// Return this value if it is greater than `min`; otherwise return
    /// None.
    pub fn if_above(self, min: Duration) -> Self {
        if self.magnitude() > min {
            self
        } else {
            ClockSkew::None
        }
    }

    /// Return true if we're estimating any skew.
    pub fn is_skewed(&self) -> bool {
        !matches!(self, ClockSkew::None)
    }

    /// Describe the peer's clock relative to ours: "behind" or
    /// "ahead of".
    ///
    /// (Used when formatting skew complaints; a peer whose declared
    /// timestamp is in our past is behind us.)
    pub fn direction(&self) -> &'static str {
        match self {
            ClockSkew::Fast(_) => "behind",
            ClockSkew::Slow(_) | ClockSkew::None => "ahead of",
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn make_skew() {
        let now = 1_600_000_000_u64;

        // Case 1: they say our clock is slow.
        let skew = ClockSkew::from_handshake_secs(now, now + 777);
        assert_eq!(skew, ClockSkew::Slow(Duration::from_secs(777)));
        assert_eq!(skew.as_secs(), -777);
        assert_eq!(skew.direction(), "ahead of");

        // Case 2: they say our clock is fast.
        let skew = ClockSkew::from_handshake_secs(now, now - 333);
        assert_eq!(skew, ClockSkew::Fast(Duration::from_secs(333)));
        assert_eq!(skew.as_secs(), 333);
        assert_eq!(skew.direction(), "behind");

        // Case 3: difference is below the timer precision.
        let skew = ClockSkew::from_handshake_secs(now, now + 1);
        assert_eq!(skew, ClockSkew::None);
        assert!(!skew.is_skewed());
    }

    #[test]
    fn thresholds() {
        let skew = ClockSkew::Fast(Duration::from_secs(3600));
        assert_eq!(skew.if_above(Duration::from_secs(7200)), ClockSkew::None);
        assert_eq!(skew.if_above(Duration::from_secs(60)), skew);
    }
}
