//! Process-wide bookkeeping of channels by state class.
//!
//! The registry holds the strong reference that keeps a channel alive
//! while it is doing anything useful.  Everything else (transports,
//! handler callbacks) holds weak or temporary references; when a
//! channel is unregistered and nothing is mid-callback on it, it is
//! freed.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use tracing::{debug, trace};

use super::{ChanState, Channel, UniqId};

/// The four channel sets, guarded together.
#[derive(Default)]
struct Lists {
    /// Every registered channel, by unique ID.
    all: HashMap<u64, Rc<Channel>>,
    /// Registered channels in a non-terminal state.
    active: HashSet<u64>,
    /// Registered channels in a terminal state.
    finished: HashSet<u64>,
    /// Registered channels in the Listening state.
    listening: HashSet<u64>,
}

/// Process-wide indices of channels.
///
/// A registered channel is in `all`, in exactly one of
/// {`active`, `finished`}, and in `listening` iff it is listening;
/// those invariants are maintained across every state change of a
/// registered channel.
#[derive(Default)]
pub struct ChannelRegistry {
    /// The channel sets.
    lists: RefCell<Lists>,
}

impl ChannelRegistry {
    /// Create a new, empty registry.
    pub fn new() -> Self {
        ChannelRegistry::default()
    }

    /// Add a channel to the registry.
    ///
    /// Idempotent: registering a channel twice is a no-op.
    pub fn register(&self, chan: &Rc<Channel>) {
        if chan.is_registered() {
            return;
        }
        let id = chan.unique_id().as_u64();
        let state = chan.state();
        {
            let mut lists = self.lists.borrow_mut();
            lists.all.insert(id, Rc::clone(chan));
            if state.is_terminal() {
                lists.finished.insert(id);
            } else {
                lists.active.insert(id);
            }
            if state == ChanState::Listening {
                lists.listening.insert(id);
            }
        }
        chan.note_registered(true);
        trace!("{}: registered in state {}", chan.unique_id(), state);
    }

    /// Remove a channel from the registry.
    ///
    /// If nothing else holds the channel, this frees it.
    pub fn unregister(&self, chan: &Channel) {
        if !chan.is_registered() {
            return;
        }
        let id = chan.unique_id().as_u64();
        chan.note_registered(false);
        let mut lists = self.lists.borrow_mut();
        lists.active.remove(&id);
        lists.finished.remove(&id);
        lists.listening.remove(&id);
        if let Some(rc) = lists.all.remove(&id) {
            if Rc::strong_count(&rc) == 1 {
                // Ours was the last reference; the drop below frees the
                // channel, which is only correct in a terminal state.
                debug_assert!(
                    rc.state().is_terminal(),
                    "dropping last reference to a live channel"
                );
            }
        }
    }

    /// Update the registry's indices after a channel's state changed.
    ///
    /// Called from the channel's own transition code; does nothing for
    /// unregistered channels.
    pub(crate) fn state_changed(&self, chan: &Channel, from: ChanState, to: ChanState) {
        if !chan.is_registered() {
            return;
        }
        let id = chan.unique_id().as_u64();
        let mut lists = self.lists.borrow_mut();
        match (from.is_terminal(), to.is_terminal()) {
            (false, true) => {
                lists.active.remove(&id);
                lists.finished.insert(id);
            }
            (true, false) => {
                lists.finished.remove(&id);
                lists.active.insert(id);
            }
            _ => {}
        }
        if from == ChanState::Listening {
            lists.listening.remove(&id);
        }
        if to == ChanState::Listening {
            lists.listening.insert(id);
        }
    }

    /// Return the registered channel with the given unique ID, if any.
    pub fn get(&self, id: UniqId) -> Option<Rc<Channel>> {
        self.lists.borrow().all.get(&id.as_u64()).cloned()
    }

    /// Return the number of registered channels.
    pub fn n_channels(&self) -> usize {
        self.lists.borrow().all.len()
    }
    /// Return the number of registered channels in a non-terminal state.
    pub fn n_active(&self) -> usize {
        self.lists.borrow().active.len()
    }
    /// Return the number of registered channels in a terminal state.
    pub fn n_finished(&self) -> usize {
        self.lists.borrow().finished.len()
    }
    /// Return the number of registered listening channels.
    pub fn n_listening(&self) -> usize {
        self.lists.borrow().listening.len()
    }

    /// Close every registered channel and release all registry
    /// references.
    ///
    /// For use at shutdown.  Channels that finish closing synchronously
    /// are freed here; anything a transport holds alive will be freed
    /// when the transport lets go.
    pub fn finish_all(&self) {
        let channels: Vec<Rc<Channel>> = self.lists.borrow().all.values().cloned().collect();
        debug!("closing all {} channels", channels.len());
        for chan in &channels {
            if !chan.state().is_terminal() {
                let _ = chan.request_close();
            }
            if chan.state() == ChanState::Closing {
                // Don't wait for the transport at shutdown.
                let _ = chan.closed();
            }
            self.unregister(chan);
        }
    }

    /// Check the registry invariants, panicking on violation.
    ///
    /// (Used by tests after every interesting mutation.)
    pub fn assert_consistent(&self) {
        let lists = self.lists.borrow();
        for (id, chan) in &lists.all {
            assert!(chan.is_registered(), "unregistered channel in `all`");
            let state = chan.state();
            assert_eq!(
                lists.active.contains(id),
                !state.is_terminal(),
                "channel {} active-set membership disagrees with state {}",
                id,
                state
            );
            assert_eq!(
                lists.finished.contains(id),
                state.is_terminal(),
                "channel {} finished-set membership disagrees with state {}",
                id,
                state
            );
            assert_eq!(
                lists.listening.contains(id),
                state == ChanState::Listening,
                "channel {} listening-set membership disagrees with state {}",
                id,
                state
            );
        }
        for id in lists.active.iter().chain(&lists.finished).chain(&lists.listening) {
            assert!(lists.all.contains_key(id), "stray id {} in a state set", id);
        }
    }
}
