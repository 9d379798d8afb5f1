//! Channel states, close reasons, and the transition table.

/// The lifecycle state of a channel.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[allow(clippy::exhaustive_enums)]
pub enum ChanState {
    /// Not connected to anything; the state channels are born in, and
    /// the usual state they die in.
    Closed,
    /// Tearing down; the transport is still winding up its business.
    Closing,
    /// Something went wrong; terminal, like Closed, but remembered as a
    /// failure.
    Error,
    /// Accepting incoming channels on behalf of a transport.
    Listening,
    /// Temporarily unusable while the transport does maintenance (for
    /// the TLS transport, a renegotiation).
    Maint,
    /// Connecting and handshaking; not yet usable for traffic, but
    /// cells may be queued on it.
    Opening,
    /// Fully usable.
    Open,
}

impl ChanState {
    /// Return true if this state is terminal: nothing transitions out
    /// of it.
    pub fn is_terminal(self) -> bool {
        matches!(self, ChanState::Closed | ChanState::Error)
    }
    /// Return true if this channel is on its way out: closing or
    /// already terminal.
    pub fn is_ending(self) -> bool {
        matches!(self, ChanState::Closing | ChanState::Closed | ChanState::Error)
    }
    /// Return true if cells may be written to a channel in this state.
    pub fn can_write(self) -> bool {
        matches!(self, ChanState::Opening | ChanState::Open | ChanState::Maint)
    }
    /// Return true if the transition from this state to `to` is legal.
    pub fn may_transition_to(self, to: ChanState) -> bool {
        use ChanState::*;
        matches!(
            (self, to),
            (Closed, Listening)
                | (Closed, Opening)
                | (Opening, Open)
                | (Opening, Closing)
                | (Opening, Error)
                | (Open, Maint)
                | (Open, Closing)
                | (Open, Error)
                | (Maint, Open)
                | (Maint, Closing)
                | (Maint, Error)
                | (Listening, Closing)
                | (Listening, Error)
                | (Closing, Closed)
                | (Closing, Error)
        )
    }
}

impl std::fmt::Display for ChanState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ChanState::Closed => "closed",
            ChanState::Closing => "closing",
            ChanState::Error => "error",
            ChanState::Listening => "listening",
            ChanState::Maint => "temporarily suspended",
            ChanState::Opening => "opening",
            ChanState::Open => "open",
        };
        write!(f, "{}", s)
    }
}

/// Why is a channel closing?
///
/// Channels entering Closing, Closed, or Error must have one of the
/// non-default values here recorded first.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[allow(clippy::exhaustive_enums)]
pub enum CloseReason {
    /// Not closing at all.
    NotClosing,
    /// A local caller asked for the close.
    Requested,
    /// The transport shut down gracefully underneath us.
    FromBelow,
    /// The transport failed.
    ForError,
}

#[cfg(test)]
mod test {
    use super::*;
    use ChanState::*;

    /// All states, for exhaustively probing the table.
    const ALL: [ChanState; 7] = [Closed, Closing, Error, Listening, Maint, Opening, Open];

    #[test]
    fn transition_table() {
        let legal: &[(ChanState, &[ChanState])] = &[
            (Closed, &[Listening, Opening]),
            (Opening, &[Open, Closing, Error]),
            (Open, &[Maint, Closing, Error]),
            (Maint, &[Open, Closing, Error]),
            (Listening, &[Closing, Error]),
            (Closing, &[Closed, Error]),
            (Error, &[]),
        ];
        for (from, targets) in legal {
            for to in ALL {
                assert_eq!(
                    from.may_transition_to(to),
                    targets.contains(&to),
                    "table disagreement on {} -> {}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn predicates() {
        assert!(Closed.is_terminal());
        assert!(Error.is_terminal());
        assert!(!Closing.is_terminal());
        assert!(Closing.is_ending());
        assert!(!Open.is_ending());
        assert!(Open.can_write());
        assert!(Opening.can_write());
        assert!(Maint.can_write());
        assert!(!Listening.can_write());
        assert!(!Closing.can_write());
    }
}
