//! Code for talking directly (over a TLS connection) to another onion
//! router or client.
//!
//! Channels form the basis of the rest of the protocol: they are the
//! only way for two instances to talk.
//!
//! Channels are not useful directly for application requests: after
//! making a channel, it needs to get used to build circuits, and the
//! circuits are used to anonymize streams.
//!
//! # Design
//!
//! A [`Channel`] is the state machine and the queues; the transport
//! behind it (TLS today) is an implementation of [`ChannelTransport`]
//! that the channel owns.  The circuit layer above installs handler
//! callbacks for inbound cells and writes outbound cells directly.
//!
//! The whole layer is single-threaded and cooperative: nothing here
//! blocks, and every callback runs synchronously on the caller's
//! stack.  Reentrancy is expected (a cell handler may close the very
//! channel that is dispatching to it), and is made safe in two ways:
//! every dispatch holds a strong reference to the channel for the
//! duration of the callback, and no interior borrow is ever held
//! across one.
//!
//! Channel lifetime is shared-ownership: the [`ChannelRegistry`] holds
//! the long-lived strong reference, the transport holds a weak one,
//! and dispatch paths hold short-lived strong ones.  A channel is
//! freed when the registry lets go and nothing is mid-callback, and
//! only in a terminal state.

pub mod handshake;
mod mux;
mod registry;
mod state;
pub mod tls;
mod unique_id;

use std::cell::RefCell;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};

use tracing::{debug, info, trace, warn};

use orlink_cell::msg::DestroyReason;
use orlink_cell::{AnyCell, Cell, CellCmd, CircId, VarCell};

use crate::external::ChannelEnv;
use crate::{Error, IdDigest, Result};

pub use mux::CircuitPriorityQueue;
pub use registry::ChannelRegistry;
pub use state::{ChanState, CloseReason};
pub use unique_id::UniqId;

/// The transport half of a channel.
///
/// The channel state machine is transport-agnostic; everything that
/// actually touches a connection goes through one of these.  The TLS
/// implementation is [`tls::TlsChannel`].
pub trait ChannelTransport {
    /// Start closing the underlying connection.
    ///
    /// Called on a locally-requested close; the transport must
    /// eventually drive the channel from Closing to Closed (or Error).
    fn close(&self, chan: &Channel);
    /// Hand one fixed-length cell to the connection.
    fn write_cell(&self, chan: &Channel, cell: Cell) -> Result<()>;
    /// Hand one variable-length cell to the connection.
    fn write_var_cell(&self, chan: &Channel, cell: VarCell) -> Result<()>;
    /// Final teardown hook; called exactly once, as the channel is
    /// freed.
    fn release(&self, chan: &Channel);
}

/// A callback slot for inbound fixed-length cells.
///
/// Installed by the circuit layer once it is ready to receive.
pub trait CellHandler {
    /// Handle one inbound cell.  Ownership of the cell passes to the
    /// handler.
    fn handle_cell(&self, chan: &Rc<Channel>, cell: Cell);
}

/// A callback slot for inbound variable-length cells.
pub trait VarCellHandler {
    /// Handle one inbound variable-length cell.
    fn handle_var_cell(&self, chan: &Rc<Channel>, cell: VarCell);
}

/// A callback slot for accepted child channels on a listening channel.
pub trait IncomingChannelHandler {
    /// Handle one accepted child channel.
    fn handle_incoming(&self, listener: &Rc<Channel>, child: Rc<Channel>);
}

/// Which half of the circuit-ID space we allocate new circuit IDs from.
///
/// The two endpoints of a channel take opposite halves, so that their
/// allocations can never collide; see
/// [`Channel::set_circ_id_range_from_peer`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[allow(clippy::exhaustive_enums)]
pub enum CircIdRange {
    /// Allocate from the low half of the space.
    Low,
    /// Allocate from the high half of the space.
    High,
}

/// Mask of the bits our circuit-ID counter cycles through.
const CIRC_ID_SEED_MASK: u16 = 0x7fff;
/// Bit that marks an ID as coming from the high half of the space.
const CIRC_ID_HIGH_BIT: u32 = 0x8000;

/// How a cell waiting for dispatch gets routed.
enum Dispatch {
    /// A fixed-length cell bound for the fixed-cell handler.
    Fixed(Rc<dyn CellHandler>, Cell),
    /// A variable-length cell bound for the variable-cell handler.
    Var(Rc<dyn VarCellHandler>, VarCell),
}

/// Where an outbound cell goes next.
enum WriteRoute {
    /// Straight to the transport.
    Direct(Rc<dyn ChannelTransport>),
    /// Onto the outgoing queue.
    Queue {
        /// Whether to attempt a flush right after queueing.
        flush: bool,
    },
}

/// The mutable parts of a channel, guarded together.
struct Inner {
    /// Current lifecycle state.
    state: ChanState,
    /// Why we are closing, once we are.
    reason_for_closing: CloseReason,
    /// Mirrors our presence in the registry.
    registered: bool,
    /// True iff this channel came from an incoming connection to a
    /// listener.
    initiated_remotely: bool,
    /// The remote peer's identity fingerprint; zero when unknown.
    identity_digest: IdDigest,
    /// Optional human-readable name for the peer.
    nickname: Option<String>,
    /// The address the transport is connected to, when it knows one.
    remote_addr: Option<SocketAddr>,
    /// The address the peer's NETINFO claimed to observe for us.
    my_apparent_addr: Option<std::net::IpAddr>,
    /// Correlation key for directory-request accounting; 0 if unused.
    dirreq_id: u64,
    /// 15-bit seed for outgoing circuit-ID allocation.
    next_circ_id: u16,
    /// Which half of the circuit-ID space we allocate from; unset until
    /// the peer's identity key is known.
    circ_id_range: Option<CircIdRange>,
    /// When this channel was created (seconds since epoch).
    timestamp_created: u64,
    /// Last time any traffic moved on this channel.
    timestamp_active: u64,
    /// Last time a non-padding cell was written.
    timestamp_last_added_nonpadding: u64,
    /// Last time a client sent real traffic (for rate-limiting
    /// decisions); 0 if never.
    timestamp_client_used: u64,
    /// The transport, once one is bound.
    transport: Option<Rc<dyn ChannelTransport>>,
    /// Handler slot for inbound fixed-length cells.
    cell_handler: Option<Rc<dyn CellHandler>>,
    /// Handler slot for inbound variable-length cells.
    var_cell_handler: Option<Rc<dyn VarCellHandler>>,
    /// Handler slot for accepted child channels.
    listener: Option<Rc<dyn IncomingChannelHandler>>,
    /// Inbound cells awaiting a handler, in arrival order.
    cell_queue: VecDeque<AnyCell>,
    /// Outbound cells not yet given to the transport, in write order.
    outgoing_queue: VecDeque<AnyCell>,
    /// Accepted-but-undispatched child channels (listening channels
    /// only).
    incoming_list: VecDeque<Rc<Channel>>,
    /// The scheduler's per-channel priority queue of sendable circuits.
    mux: Option<CircuitPriorityQueue>,
    /// Latch preventing reentrant queue drains from interleaving.
    processing_cells: bool,
}

/// One logical OR link.
pub struct Channel {
    /// Process-unique identifier, for logging and registry keys.
    unique_id: UniqId,
    /// The host subsystems this channel talks to.
    env: Rc<ChannelEnv>,
    /// Weak handle to ourself, so `&self` methods can hand out strong
    /// references across callbacks.
    weak_self: Weak<Channel>,
    /// All mutable state.
    inner: RefCell<Inner>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Channel({}, {})", self.unique_id, self.state())
    }
}

impl Channel {
    /// Create a new channel in state Closed, with no transport bound.
    pub(crate) fn new(env: &Rc<ChannelEnv>, initiated_remotely: bool) -> Rc<Self> {
        let unique_id = UniqId::new();
        let now = env.clock.approx_secs();
        let next_circ_id = env.rng.pick_u16(CIRC_ID_SEED_MASK + 1);
        trace!("{}: created", unique_id);
        Rc::new_cyclic(|weak| Channel {
            unique_id,
            env: Rc::clone(env),
            weak_self: weak.clone(),
            inner: RefCell::new(Inner {
                state: ChanState::Closed,
                reason_for_closing: CloseReason::NotClosing,
                registered: false,
                initiated_remotely,
                identity_digest: IdDigest::ZERO,
                nickname: None,
                remote_addr: None,
                my_apparent_addr: None,
                dirreq_id: 0,
                next_circ_id,
                circ_id_range: None,
                timestamp_created: now,
                timestamp_active: now,
                timestamp_last_added_nonpadding: 0,
                timestamp_client_used: 0,
                transport: None,
                cell_handler: None,
                var_cell_handler: None,
                listener: None,
                cell_queue: VecDeque::new(),
                outgoing_queue: VecDeque::new(),
                incoming_list: VecDeque::new(),
                mux: Some(CircuitPriorityQueue::new()),
                processing_cells: false,
            }),
        })
    }

    /// Create and register a new listening channel.
    ///
    /// The transport that accepts connections hands the resulting child
    /// channels to [`Channel::queue_incoming`].
    pub fn new_listener(env: &Rc<ChannelEnv>) -> Rc<Self> {
        let chan = Self::new(env, false);
        chan.change_state(ChanState::Listening)
            .expect("Closed -> Listening is in the transition table");
        env.registry.register(&chan);
        chan
    }

    /// Return a strong reference to ourself.
    ///
    /// Every dispatch path holds one of these across its callback, so
    /// that a reentrant close can never free the channel mid-call.
    fn keep_alive(&self) -> Rc<Channel> {
        self.weak_self
            .upgrade()
            .expect("channel method called during teardown")
    }

    /// Return a process-unique identifier for this channel.
    pub fn unique_id(&self) -> UniqId {
        self.unique_id
    }
    /// Return this channel's current state.
    pub fn state(&self) -> ChanState {
        self.inner.borrow().state
    }
    /// Return the reason this channel is (or finished) closing.
    pub fn reason_for_closing(&self) -> CloseReason {
        self.inner.borrow().reason_for_closing
    }
    /// Return true if this channel is currently registered.
    pub fn is_registered(&self) -> bool {
        self.inner.borrow().registered
    }
    /// Record a change in registration status.  For use by the registry
    /// only.
    pub(crate) fn note_registered(&self, registered: bool) {
        self.inner.borrow_mut().registered = registered;
    }
    /// Return true iff this channel was initiated by the remote side.
    pub fn initiated_remotely(&self) -> bool {
        self.inner.borrow().initiated_remotely
    }
    /// Return the remote peer's identity fingerprint; zero when
    /// unknown.
    pub fn identity_digest(&self) -> IdDigest {
        self.inner.borrow().identity_digest
    }
    /// Set the remote peer's identity fingerprint.
    pub fn set_identity_digest(&self, id: IdDigest) {
        self.inner.borrow_mut().identity_digest = id;
    }
    /// Return the peer's human-readable name, if one is known.
    pub fn nickname(&self) -> Option<String> {
        self.inner.borrow().nickname.clone()
    }
    /// Set the peer's human-readable name.
    pub fn set_nickname(&self, nickname: Option<String>) {
        self.inner.borrow_mut().nickname = nickname;
    }
    /// Return the address the transport is connected to, if known.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.borrow().remote_addr
    }
    /// Record the address the transport is connected to.
    pub(crate) fn set_remote_addr(&self, addr: SocketAddr) {
        self.inner.borrow_mut().remote_addr = Some(addr);
    }
    /// Return the address the peer's NETINFO claimed to observe for us.
    pub fn my_apparent_addr(&self) -> Option<std::net::IpAddr> {
        self.inner.borrow().my_apparent_addr
    }
    /// Record the address the peer claimed to observe for us.
    pub(crate) fn set_my_apparent_addr(&self, addr: Option<std::net::IpAddr>) {
        self.inner.borrow_mut().my_apparent_addr = addr;
    }
    /// Return the directory-request correlation key; 0 if unused.
    pub fn dirreq_id(&self) -> u64 {
        self.inner.borrow().dirreq_id
    }
    /// Set the directory-request correlation key.
    pub fn set_dirreq_id(&self, id: u64) {
        self.inner.borrow_mut().dirreq_id = id;
    }
    /// Return when this channel was created, in seconds since the
    /// epoch.
    pub fn timestamp_created(&self) -> u64 {
        self.inner.borrow().timestamp_created
    }
    /// Return the last time any traffic moved on this channel.
    pub fn timestamp_active(&self) -> u64 {
        self.inner.borrow().timestamp_active
    }
    /// Return the last time a non-padding cell was written to this
    /// channel.
    pub fn timestamp_last_added_nonpadding(&self) -> u64 {
        self.inner.borrow().timestamp_last_added_nonpadding
    }
    /// Return the last time a client sent real traffic here; 0 if
    /// never.
    pub fn timestamp_client_used(&self) -> u64 {
        self.inner.borrow().timestamp_client_used
    }
    /// Record that a client just used this channel.
    pub fn mark_client_used(&self) {
        let now = self.env.clock.approx_secs();
        self.inner.borrow_mut().timestamp_client_used = now;
    }

    /// Bind a transport to this channel.
    pub fn set_transport(&self, transport: Option<Rc<dyn ChannelTransport>>) {
        self.inner.borrow_mut().transport = transport;
    }

    /// Run `f` on this channel's circuit priority queue, if the channel
    /// still has one.
    ///
    /// (The scheduler in the circuit layer uses this; the queue itself
    /// is released when the channel is freed.)  `f` runs with the
    /// channel's state borrowed, so it must not call back into the
    /// channel.
    pub fn with_circuit_queue<T>(&self, f: impl FnOnce(&mut CircuitPriorityQueue) -> T) -> Option<T> {
        self.inner.borrow_mut().mux.as_mut().map(f)
    }

    /// Return the number of inbound cells waiting for a handler.
    pub fn n_queued_cells(&self) -> usize {
        self.inner.borrow().cell_queue.len()
    }
    /// Return the number of outbound cells not yet given to the
    /// transport.
    pub fn n_queued_writes(&self) -> usize {
        self.inner.borrow().outgoing_queue.len()
    }
    /// Return the number of accepted-but-undispatched child channels.
    pub fn n_queued_incoming(&self) -> usize {
        self.inner.borrow().incoming_list.len()
    }

    //
    // State machine
    //

    /// Move this channel to state `to`, refusing transitions the table
    /// forbids.
    ///
    /// On entering Open, queued writes are flushed and queued inbound
    /// cells are dispatched if a handler is installed.
    pub(crate) fn change_state(&self, to: ChanState) -> Result<()> {
        let from = {
            let mut inner = self.inner.borrow_mut();
            let from = inner.state;
            if !from.may_transition_to(to) {
                return Err(Error::BadStateChange { from, to });
            }
            if to.is_ending() && inner.reason_for_closing == CloseReason::NotClosing {
                return Err(Error::Internal("entered a closing state with no reason set"));
            }
            if to == ChanState::Closed {
                debug_assert!(
                    inner.cell_queue.is_empty()
                        && inner.outgoing_queue.is_empty()
                        && inner.incoming_list.is_empty(),
                    "a channel must drain its queues before it is Closed"
                );
            }
            inner.state = to;
            from
        };
        trace!("{}: state {} -> {}", self.unique_id, from, to);
        self.env.registry.state_changed(self, from, to);
        if to == ChanState::Open {
            if from == ChanState::Opening {
                self.do_open_actions();
            }
            self.flush_cells();
            if self.any_cell_handler_set() {
                self.process_cells();
            }
        }
        Ok(())
    }

    /// Put this freshly-created channel into Opening.
    pub(crate) fn start_opening(&self) -> Result<()> {
        self.change_state(ChanState::Opening)
    }

    /// Mark this channel for close by request of a local caller.
    ///
    /// The transport is told to start closing, and is then responsible
    /// for eventually completing the close.  A no-op on channels
    /// already on their way out.
    pub fn request_close(&self) -> Result<()> {
        let me = self.keep_alive();
        {
            let mut inner = self.inner.borrow_mut();
            if inner.state.is_ending() {
                return Ok(());
            }
            inner.reason_for_closing = CloseReason::Requested;
        }
        self.change_state(ChanState::Closing)?;
        let transport = self.inner.borrow().transport.clone();
        if let Some(t) = transport {
            t.close(&me);
        }
        Ok(())
    }

    /// The transport underneath us is closing gracefully; follow it.
    ///
    /// Unlike [`Channel::request_close`], this does not call back into
    /// the transport.
    pub fn close_from_lower_layer(&self) -> Result<()> {
        let _me = self.keep_alive();
        {
            let mut inner = self.inner.borrow_mut();
            if inner.state.is_ending() {
                return Ok(());
            }
            inner.reason_for_closing = CloseReason::FromBelow;
        }
        debug!("{}: transport is going away; closing", self.unique_id);
        self.change_state(ChanState::Closing)
    }

    /// The transport underneath us has failed; close for error.
    pub fn close_for_error(&self) -> Result<()> {
        let _me = self.keep_alive();
        {
            let mut inner = self.inner.borrow_mut();
            if inner.state.is_ending() {
                return Ok(());
            }
            inner.reason_for_closing = CloseReason::ForError;
        }
        info!("{}: transport failed; closing", self.unique_id);
        self.change_state(ChanState::Closing)
    }

    /// The transport has finished tearing down; complete the close.
    ///
    /// Attached circuits are detached here, and (on an error close)
    /// pending-but-unattached circuits are told the channel failed.
    /// Any cells still queued are discarded.
    pub fn closed(&self) -> Result<()> {
        let me = self.keep_alive();
        let reason = {
            let inner = self.inner.borrow();
            if inner.state.is_terminal() {
                return Ok(());
            }
            if inner.state != ChanState::Closing {
                return Err(Error::UnusableState {
                    action: "finish closing",
                    state: inner.state,
                });
            }
            inner.reason_for_closing
        };
        if reason == CloseReason::ForError {
            self.env.circuits.n_chan_done(&me, false);
        }
        self.env
            .circuits
            .unlink_all_from_channel(&me, DestroyReason::CHANNEL_CLOSED);
        self.discard_queues();
        let target = if reason == CloseReason::ForError {
            ChanState::Error
        } else {
            ChanState::Closed
        };
        self.change_state(target)
    }

    /// Take a failing channel straight to Error: detach circuits,
    /// discard queues, and record the failure.
    ///
    /// This is the teardown used when a protocol violation or send
    /// failure makes the channel unusable on the spot.
    pub(crate) fn fail_to_error(&self) {
        let me = self.keep_alive();
        {
            let mut inner = self.inner.borrow_mut();
            if inner.state.is_terminal() {
                return;
            }
            inner.reason_for_closing = CloseReason::ForError;
        }
        self.env.circuits.n_chan_done(&me, false);
        self.env
            .circuits
            .unlink_all_from_channel(&me, DestroyReason::CHANNEL_CLOSED);
        self.discard_queues();
        if let Err(e) = self.change_state(ChanState::Error) {
            warn!("{}: could not record failure: {}", self.unique_id, e);
        }
    }

    /// Drop everything still sitting in this channel's queues.
    fn discard_queues(&self) {
        let (cells, writes, incoming) = {
            let mut inner = self.inner.borrow_mut();
            let counts = (
                inner.cell_queue.len(),
                inner.outgoing_queue.len(),
                inner.incoming_list.len(),
            );
            inner.cell_queue.clear();
            inner.outgoing_queue.clear();
            inner.incoming_list.clear();
            counts
        };
        if cells + writes + incoming > 0 {
            debug!(
                "{}: discarding {} queued inbound, {} outbound, {} incoming",
                self.unique_id, cells, writes, incoming
            );
        }
    }

    /// Actions taken once, when a channel first becomes Open.
    fn do_open_actions(&self) {
        let me = self.keep_alive();
        let (remotely, id, remote_addr) = {
            let inner = self.inner.borrow();
            (
                inner.initiated_remotely,
                inner.identity_digest,
                inner.remote_addr,
            )
        };
        let now = self.env.clock.approx_secs();
        let mut suppressed = false;
        if !remotely {
            self.env.guards.note_network_live();
            self.env.routers.note_connect_succeeded(&id, now);
            if self.env.guards.register_connect_status(&id, true).is_err() {
                // The guard subsystem chose not to use this channel.
                // It stays open (it is perfectly usable); we just cancel
                // whatever was waiting to build circuits on it.
                info!(
                    "{}: guard subsystem declined this channel; cancelling pending circuits",
                    self.unique_id
                );
                self.env.circuits.n_chan_done(&me, false);
                suppressed = true;
            }
            self.env.routers.set_reachable(&id, true);
        } else if self.env.routers.lookup(&id).is_none() {
            // An incoming connection from something that isn't a known
            // relay: presumably a client.
            if let Some(addr) = remote_addr {
                self.env.geoip.note_client_seen(addr.ip(), now);
            }
            self.mark_client_used();
        }
        if !suppressed {
            self.env.circuits.n_chan_done(&me, true);
        }
    }

    //
    // Inbound queue and handler dispatch
    //

    /// Return true if either cell-handler slot is filled.
    fn any_cell_handler_set(&self) -> bool {
        let inner = self.inner.borrow();
        inner.cell_handler.is_some() || inner.var_cell_handler.is_some()
    }

    /// Install (or clear) the handler for inbound fixed-length cells.
    ///
    /// Installing a handler immediately dispatches any queued cells of
    /// the matching kind, in arrival order.
    pub fn set_cell_handler(&self, handler: Option<Rc<dyn CellHandler>>) {
        let run = {
            let mut inner = self.inner.borrow_mut();
            let installed = handler.is_some();
            inner.cell_handler = handler;
            installed
                && !inner.processing_cells
                && inner
                    .cell_queue
                    .iter()
                    .any(|c| matches!(c, AnyCell::Fixed(_)))
        };
        if run {
            self.process_cells();
        }
    }

    /// Install (or clear) the handler for inbound variable-length
    /// cells.
    pub fn set_var_cell_handler(&self, handler: Option<Rc<dyn VarCellHandler>>) {
        let run = {
            let mut inner = self.inner.borrow_mut();
            let installed = handler.is_some();
            inner.var_cell_handler = handler;
            installed
                && !inner.processing_cells
                && inner.cell_queue.iter().any(|c| matches!(c, AnyCell::Var(_)))
        };
        if run {
            self.process_cells();
        }
    }

    /// Accept one inbound fixed-length cell from the transport.
    ///
    /// If the matching handler is installed and nothing is queued ahead
    /// of it, the cell is dispatched synchronously; otherwise it waits
    /// in arrival order.
    pub fn queue_cell(&self, cell: Cell) {
        self.queue_any_cell(AnyCell::Fixed(cell));
    }

    /// Accept one inbound variable-length cell from the transport.
    pub fn queue_var_cell(&self, cell: VarCell) {
        self.queue_any_cell(AnyCell::Var(cell));
    }

    /// Shared implementation of the inbound queue entry points.
    fn queue_any_cell(&self, cell: AnyCell) {
        let me = self.keep_alive();
        let now = self.env.clock.approx_secs();
        let dispatch = {
            let mut inner = self.inner.borrow_mut();
            if inner.state.is_terminal() || inner.state == ChanState::Listening {
                debug!(
                    "{}: dropping inbound {} cell in state {}",
                    self.unique_id,
                    cell.cmd(),
                    inner.state
                );
                return;
            }
            inner.timestamp_active = now;
            if inner.initiated_remotely && !cell.cmd().is_padding() {
                inner.timestamp_client_used = now;
            }
            let direct = inner.cell_queue.is_empty() && !inner.processing_cells;
            match cell {
                AnyCell::Fixed(c) => match (direct, inner.cell_handler.clone()) {
                    (true, Some(h)) => Some(Dispatch::Fixed(h, c)),
                    _ => {
                        inner.cell_queue.push_back(AnyCell::Fixed(c));
                        None
                    }
                },
                AnyCell::Var(c) => match (direct, inner.var_cell_handler.clone()) {
                    (true, Some(h)) => Some(Dispatch::Var(h, c)),
                    _ => {
                        inner.cell_queue.push_back(AnyCell::Var(c));
                        None
                    }
                },
            }
        };
        match dispatch {
            Some(Dispatch::Fixed(h, c)) => h.handle_cell(&me, c),
            Some(Dispatch::Var(h, c)) => h.handle_var_cell(&me, c),
            None => {
                if self.any_cell_handler_set() {
                    self.process_cells();
                }
            }
        }
    }

    /// Dispatch queued inbound cells to their handlers.
    ///
    /// Walks the queue in arrival order, dispatching every cell whose
    /// handler slot is filled; cells whose handler is missing stay
    /// queued, in order, for later.  Reentrant calls (from inside a
    /// handler) return immediately; the outer drain picks up whatever
    /// they would have done.
    pub fn process_cells(&self) {
        let me = self.keep_alive();
        {
            let mut inner = self.inner.borrow_mut();
            if inner.processing_cells {
                return;
            }
            inner.processing_cells = true;
        }
        let mut idx = 0;
        loop {
            let dispatch = {
                let mut inner = self.inner.borrow_mut();
                if idx >= inner.cell_queue.len() {
                    inner.processing_cells = false;
                    break;
                }
                let handler = match &inner.cell_queue[idx] {
                    AnyCell::Fixed(_) => inner.cell_handler.is_some(),
                    AnyCell::Var(_) => inner.var_cell_handler.is_some(),
                };
                if !handler {
                    idx += 1;
                    None
                } else {
                    let cell = inner
                        .cell_queue
                        .remove(idx)
                        .expect("indexed a cell that was not there");
                    match cell {
                        AnyCell::Fixed(c) => {
                            let h = inner
                                .cell_handler
                                .clone()
                                .expect("handler vanished inside one borrow");
                            Some(Dispatch::Fixed(h, c))
                        }
                        AnyCell::Var(c) => {
                            let h = inner
                                .var_cell_handler
                                .clone()
                                .expect("handler vanished inside one borrow");
                            Some(Dispatch::Var(h, c))
                        }
                    }
                }
            };
            match dispatch {
                Some(Dispatch::Fixed(h, c)) => h.handle_cell(&me, c),
                Some(Dispatch::Var(h, c)) => h.handle_var_cell(&me, c),
                None => {}
            }
        }
    }

    //
    // Outbound write path
    //

    /// Write one fixed-length cell to this channel.
    ///
    /// The channel must be Opening, Open, or in maintenance; cells
    /// written before the channel is fully Open wait on the outgoing
    /// queue.
    pub fn write_cell(&self, cell: Cell) -> Result<()> {
        self.write_any_cell(AnyCell::Fixed(cell))
    }

    /// Write one variable-length cell to this channel.
    pub fn write_var_cell(&self, cell: VarCell) -> Result<()> {
        self.write_any_cell(AnyCell::Var(cell))
    }

    /// Shared implementation of the outbound entry points.
    fn write_any_cell(&self, cell: AnyCell) -> Result<()> {
        let me = self.keep_alive();
        let route = {
            let mut inner = self.inner.borrow_mut();
            if !inner.state.can_write() {
                return Err(Error::UnusableState {
                    action: "send a cell",
                    state: inner.state,
                });
            }
            let now = self.env.clock.approx_secs();
            inner.timestamp_active = now;
            if !cell.cmd().is_padding() {
                inner.timestamp_last_added_nonpadding = now;
            }
            if inner.state == ChanState::Open && inner.outgoing_queue.is_empty() {
                match inner.transport.clone() {
                    Some(t) => WriteRoute::Direct(t),
                    None => WriteRoute::Queue { flush: false },
                }
            } else {
                WriteRoute::Queue {
                    flush: inner.state == ChanState::Open,
                }
            }
        };
        match route {
            WriteRoute::Direct(t) => {
                trace!("{}: sending {} cell", self.unique_id, cell.cmd());
                if let Err(e) = self.deliver(&t, cell) {
                    warn!("{}: transport write failed: {}", self.unique_id, e);
                    let _ = me.close_for_error();
                    return Err(e);
                }
                Ok(())
            }
            WriteRoute::Queue { flush } => {
                self.inner.borrow_mut().outgoing_queue.push_back(cell);
                if flush {
                    self.flush_cells();
                }
                Ok(())
            }
        }
    }

    /// Hand one cell to the transport.
    fn deliver(&self, transport: &Rc<dyn ChannelTransport>, cell: AnyCell) -> Result<()> {
        match cell {
            AnyCell::Fixed(c) => transport.write_cell(self, c),
            AnyCell::Var(c) => transport.write_var_cell(self, c),
        }
    }

    /// Push queued outbound cells to the transport, while the channel
    /// stays Open.
    pub(crate) fn flush_cells(&self) {
        let me = self.keep_alive();
        loop {
            let next = {
                let mut inner = self.inner.borrow_mut();
                if inner.state != ChanState::Open {
                    break;
                }
                match inner.transport.clone() {
                    Some(t) => match inner.outgoing_queue.pop_front() {
                        Some(cell) => Some((t, cell)),
                        None => break,
                    },
                    None => break,
                }
            };
            let Some((transport, cell)) = next else { break };
            if let Err(e) = self.deliver(&transport, cell) {
                warn!("{}: flush failed: {}", self.unique_id, e);
                let _ = me.close_for_error();
                break;
            }
        }
    }

    /// Take every cell still waiting on the outgoing queue.
    ///
    /// Used by transports that want one last chance to put queued cells
    /// on the wire while closing.
    pub(crate) fn drain_outgoing(&self) -> VecDeque<AnyCell> {
        std::mem::take(&mut self.inner.borrow_mut().outgoing_queue)
    }

    /// Construct and send a DESTROY cell for `circ_id`.
    ///
    /// `reason` is sent as-is; reasons relayed from peers propagate
    /// verbatim.  On a channel that is already going away this is a
    /// no-op: there is nobody left to tell.
    pub fn send_destroy(&self, circ_id: CircId, reason: u8) -> Result<()> {
        {
            let inner = self.inner.borrow();
            if inner.state.is_ending() {
                debug!(
                    "{}: not sending DESTROY for circ {} on a dying channel",
                    self.unique_id, circ_id
                );
                return Ok(());
            }
        }
        let mut cell = Cell::new(circ_id, CellCmd::DESTROY);
        cell.payload_mut()[0] = reason;
        debug!(
            "{}: sending DESTROY for circ {} ({})",
            self.unique_id,
            circ_id,
            DestroyReason::from(reason).human_str()
        );
        self.write_cell(cell)
    }

    //
    // Listener path
    //

    /// Install (or clear) the handler for accepted child channels.
    pub fn set_listener_handler(&self, handler: Option<Rc<dyn IncomingChannelHandler>>) {
        let run = {
            let mut inner = self.inner.borrow_mut();
            let installed = handler.is_some();
            inner.listener = handler;
            installed && !inner.incoming_list.is_empty()
        };
        if run {
            self.process_incoming();
        }
    }

    /// Accept a child channel on this listening channel.
    ///
    /// If the listener handler is installed and there is no backlog,
    /// the child is dispatched synchronously; otherwise it waits in
    /// arrival order.
    pub fn queue_incoming(&self, child: Rc<Channel>) -> Result<()> {
        let me = self.keep_alive();
        if self.state() != ChanState::Listening {
            return Err(Error::UnusableState {
                action: "accept an incoming channel",
                state: self.state(),
            });
        }
        if child.state() == ChanState::Listening {
            return Err(Error::Internal("queued a listener as an incoming channel"));
        }
        debug_assert!(child.initiated_remotely());
        let direct = {
            let mut inner = self.inner.borrow_mut();
            match (&inner.listener, inner.incoming_list.is_empty()) {
                (Some(h), true) => Some(Rc::clone(h)),
                _ => {
                    inner.incoming_list.push_back(child.clone());
                    None
                }
            }
        };
        match direct {
            Some(h) => h.handle_incoming(&me, child),
            None => {
                if self.inner.borrow().listener.is_some() {
                    self.process_incoming();
                }
            }
        }
        Ok(())
    }

    /// Dispatch queued child channels to the listener handler.
    ///
    /// Also permitted while Closing, to drain the backlog.
    pub fn process_incoming(&self) {
        let me = self.keep_alive();
        if !matches!(self.state(), ChanState::Listening | ChanState::Closing) {
            return;
        }
        loop {
            let next = {
                let mut inner = self.inner.borrow_mut();
                let h = inner.listener.clone();
                match h {
                    Some(h) => inner.incoming_list.pop_front().map(|c| (h, c)),
                    None => None,
                }
            };
            match next {
                Some((h, child)) => h.handle_incoming(&me, child),
                None => break,
            }
        }
    }

    //
    // Circuit-ID allocation
    //

    /// Return which half of the circuit-ID space we allocate from, if
    /// decided.
    pub fn circ_id_range(&self) -> Option<CircIdRange> {
        self.inner.borrow().circ_id_range
    }

    /// Set which half of the circuit-ID space we allocate from.
    pub(crate) fn set_circ_id_range(&self, range: CircIdRange) {
        self.inner.borrow_mut().circ_id_range = Some(range);
    }

    /// Fix our circuit-ID half from the peer's (now known) identity.
    ///
    /// The endpoint whose identity fingerprint compares lower takes the
    /// low half; an endpoint with no identity of its own (a client)
    /// always takes the high half.  The two sides therefore never
    /// collide when allocating new circuit IDs.
    pub(crate) fn set_circ_id_range_from_peer(&self) {
        let peer = self.identity_digest();
        let range = match &self.env.local_auth {
            Some(local) if !peer.is_zero() && local.id_digest() < peer => CircIdRange::Low,
            _ => CircIdRange::High,
        };
        self.set_circ_id_range(range);
    }

    /// Allocate the next outgoing circuit ID.
    ///
    /// Returns None until the ID half has been decided (that happens
    /// when the peer's identity becomes known during the handshake).
    pub fn next_circ_id(&self) -> Option<CircId> {
        let mut inner = self.inner.borrow_mut();
        let range = inner.circ_id_range?;
        let mut seed = inner.next_circ_id & CIRC_ID_SEED_MASK;
        let id = match range {
            CircIdRange::Low => {
                // Zero does not name a circuit; skip over it.
                if seed == 0 {
                    seed = 1;
                }
                u32::from(seed)
            }
            CircIdRange::High => u32::from(seed) | CIRC_ID_HIGH_BIT,
        };
        inner.next_circ_id = seed.wrapping_add(1) & CIRC_ID_SEED_MASK;
        Some(CircId::new(id))
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        let transport = {
            let inner = self.inner.get_mut();
            debug_assert!(
                inner.state.is_terminal(),
                "channel freed in state {}",
                inner.state
            );
            debug_assert!(!inner.registered, "channel freed while registered");
            debug_assert!(
                inner.cell_queue.is_empty()
                    && inner.outgoing_queue.is_empty()
                    && inner.incoming_list.is_empty(),
                "channel freed with queued work"
            );
            // Clear the remote-end metadata and release the scheduler
            // queue before the transport teardown hook runs.
            inner.identity_digest = IdDigest::ZERO;
            inner.nickname = None;
            inner.mux = None;
            inner.transport.take()
        };
        trace!("{}: freed", self.unique_id);
        if let Some(t) = transport {
            t.release(self);
        }
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::testing::TestNet;
    use assert_matches::assert_matches;
    use std::cell::Cell as StdCell;

    /// A transport that records the cells given to it.
    #[derive(Default)]
    struct RecordingTransport {
        /// Every cell written, in order.
        written: RefCell<Vec<AnyCell>>,
        /// Number of times the close hook ran.
        closes: StdCell<usize>,
        /// Number of times the release hook ran.
        releases: StdCell<usize>,
        /// When true, writes fail.
        fail_writes: StdCell<bool>,
    }

    impl ChannelTransport for RecordingTransport {
        fn close(&self, _chan: &Channel) {
            self.closes.set(self.closes.get() + 1);
        }
        fn write_cell(&self, _chan: &Channel, cell: Cell) -> Result<()> {
            if self.fail_writes.get() {
                return Err(Error::ChannelClosed);
            }
            self.written.borrow_mut().push(AnyCell::Fixed(cell));
            Ok(())
        }
        fn write_var_cell(&self, _chan: &Channel, cell: VarCell) -> Result<()> {
            if self.fail_writes.get() {
                return Err(Error::ChannelClosed);
            }
            self.written.borrow_mut().push(AnyCell::Var(cell));
            Ok(())
        }
        fn release(&self, _chan: &Channel) {
            self.releases.set(self.releases.get() + 1);
        }
    }

    /// A cell handler that stashes what it receives.
    #[derive(Default)]
    struct Stash {
        /// Fixed cells received.
        fixed: RefCell<Vec<Cell>>,
        /// Variable cells received.
        var: RefCell<Vec<VarCell>>,
    }
    impl CellHandler for Stash {
        fn handle_cell(&self, _chan: &Rc<Channel>, cell: Cell) {
            self.fixed.borrow_mut().push(cell);
        }
    }
    impl VarCellHandler for Stash {
        fn handle_var_cell(&self, _chan: &Rc<Channel>, cell: VarCell) {
            self.var.borrow_mut().push(cell);
        }
    }

    /// Make an Open channel with a recording transport bound.
    fn open_channel(net: &TestNet) -> (Rc<Channel>, Rc<RecordingTransport>) {
        let chan = Channel::new(&net.env, false);
        chan.start_opening().unwrap();
        net.env.registry.register(&chan);
        let transport = Rc::new(RecordingTransport::default());
        chan.set_transport(Some(transport.clone()));
        chan.change_state(ChanState::Open).unwrap();
        net.env.registry.assert_consistent();
        (chan, transport)
    }

    /// Close a channel fully, so its Drop assertions stay happy.
    fn wind_down(net: &TestNet, chan: &Rc<Channel>) {
        let _ = chan.request_close();
        let _ = chan.closed();
        net.env.registry.unregister(chan);
    }

    #[test]
    fn transition_rules_enforced() {
        let net = TestNet::new();
        let chan = Channel::new(&net.env, false);
        // Closed -> Open is not in the table; nothing changes.
        let e = chan.change_state(ChanState::Open).unwrap_err();
        assert_matches!(
            e,
            Error::BadStateChange {
                from: ChanState::Closed,
                to: ChanState::Open
            }
        );
        assert_eq!(chan.state(), ChanState::Closed);
        // Entering Closing without a reason is refused.
        chan.start_opening().unwrap();
        let e = chan.change_state(ChanState::Closing).unwrap_err();
        assert_matches!(e, Error::Internal(_));
        assert_eq!(chan.state(), ChanState::Opening);
        // Now do it properly.
        chan.request_close().unwrap();
        assert_eq!(chan.state(), ChanState::Closing);
        assert_eq!(chan.reason_for_closing(), CloseReason::Requested);
        chan.closed().unwrap();
        assert_eq!(chan.state(), ChanState::Closed);
    }

    #[test]
    fn registry_tracks_lifecycle() {
        let net = TestNet::new();
        let reg = &net.env.registry;
        let chan = Channel::new(&net.env, false);
        chan.start_opening().unwrap();
        reg.register(&chan);
        reg.register(&chan); // idempotent
        assert_eq!(reg.n_channels(), 1);
        assert_eq!(reg.n_active(), 1);
        assert_eq!(reg.n_finished(), 0);
        reg.assert_consistent();

        let transport = Rc::new(RecordingTransport::default());
        chan.set_transport(Some(transport.clone()));
        chan.change_state(ChanState::Open).unwrap();
        reg.assert_consistent();

        chan.request_close().unwrap();
        assert_eq!(transport.closes.get(), 1);
        reg.assert_consistent();
        assert_eq!(reg.n_active(), 1); // closing is not terminal

        chan.closed().unwrap();
        reg.assert_consistent();
        assert_eq!(reg.n_active(), 0);
        assert_eq!(reg.n_finished(), 1);
        assert!(reg.get(chan.unique_id()).is_some());

        let weak = Rc::downgrade(&chan);
        reg.unregister(&chan);
        assert_eq!(reg.n_channels(), 0);
        drop(chan);
        // Freed only now: terminal, unregistered, no references left.
        assert!(weak.upgrade().is_none());
        // The release hook ran exactly once.
        assert_eq!(transport.releases.get(), 1);
    }

    #[test]
    fn listener_registry_membership() {
        let net = TestNet::new();
        let listener = Channel::new_listener(&net.env);
        assert_eq!(net.env.registry.n_listening(), 1);
        net.env.registry.assert_consistent();
        listener.request_close().unwrap();
        assert_eq!(net.env.registry.n_listening(), 0);
        net.env.registry.assert_consistent();
        listener.closed().unwrap();
        net.env.registry.unregister(&listener);
    }

    #[test]
    fn direct_dispatch_when_handler_ready() {
        let net = TestNet::new();
        let (chan, _t) = open_channel(&net);
        let stash = Rc::new(Stash::default());
        chan.set_cell_handler(Some(stash.clone()));
        chan.queue_cell(Cell::new(CircId::new(5), CellCmd::RELAY));
        assert_eq!(stash.fixed.borrow().len(), 1);
        assert_eq!(chan.n_queued_cells(), 0);
        wind_down(&net, &chan);
    }

    #[test]
    fn late_bound_handlers_drain_by_kind() {
        // Two fixed cells and one variable cell arrive with both
        // handler slots empty; installing the variable handler
        // dispatches only the variable cell, and the fixed cells stay
        // queued in order.
        let net = TestNet::new();
        let chan = Channel::new(&net.env, false);
        chan.start_opening().unwrap();
        net.env.registry.register(&chan);

        let mut first = Cell::new(CircId::new(1), CellCmd::RELAY);
        first.payload_mut()[0] = 1;
        let mut second = Cell::new(CircId::new(2), CellCmd::RELAY);
        second.payload_mut()[0] = 2;
        chan.queue_cell(first);
        chan.queue_cell(second);
        chan.queue_var_cell(VarCell::new(CircId::ZERO, CellCmd::VPADDING, vec![0; 3]));
        assert_eq!(chan.n_queued_cells(), 3);

        let stash = Rc::new(Stash::default());
        chan.set_var_cell_handler(Some(stash.clone()));
        assert_eq!(stash.var.borrow().len(), 1);
        assert_eq!(stash.fixed.borrow().len(), 0);
        assert_eq!(chan.n_queued_cells(), 2);

        chan.set_cell_handler(Some(stash.clone()));
        assert_eq!(stash.fixed.borrow().len(), 2);
        assert_eq!(chan.n_queued_cells(), 0);
        // Order preserved.
        assert_eq!(stash.fixed.borrow()[0].payload()[0], 1);
        assert_eq!(stash.fixed.borrow()[1].payload()[0], 2);

        wind_down(&net, &chan);
    }

    #[test]
    fn handler_install_without_matches_is_quiet() {
        let net = TestNet::new();
        let chan = Channel::new(&net.env, false);
        chan.start_opening().unwrap();
        net.env.registry.register(&chan);
        chan.queue_cell(Cell::new(CircId::new(1), CellCmd::RELAY));
        let stash = Rc::new(Stash::default());
        // A variable handler with only fixed cells queued does nothing.
        chan.set_var_cell_handler(Some(stash.clone()));
        assert_eq!(chan.n_queued_cells(), 1);
        assert!(stash.var.borrow().is_empty());
        wind_down(&net, &chan);
    }

    /// A handler that closes the channel from inside the callback.
    struct CloseOnFirstCell;
    impl CellHandler for CloseOnFirstCell {
        fn handle_cell(&self, chan: &Rc<Channel>, _cell: Cell) {
            let _ = chan.request_close();
            let _ = chan.closed();
            chan.env_registry_unregister();
        }
    }

    #[test]
    fn reentrant_close_from_handler() {
        // A handler that tears the channel down mid-dispatch must not
        // free it out from under the dispatch loop.
        let net = TestNet::new();
        let (chan, _t) = open_channel(&net);
        chan.set_cell_handler(Some(Rc::new(CloseOnFirstCell)));
        chan.queue_cell(Cell::new(CircId::new(1), CellCmd::RELAY));
        assert_eq!(chan.state(), ChanState::Closed);
        assert!(!chan.is_registered());
        // `chan` is still a live reference; dropping it frees the
        // channel.
        let weak = Rc::downgrade(&chan);
        chan.set_transport(None);
        drop(chan);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn write_paths() {
        let net = TestNet::new();
        net.clock.set(5_000);
        let (chan, transport) = open_channel(&net);

        // Fast path: open, empty queue; straight through.
        chan.write_cell(Cell::new(CircId::new(9), CellCmd::RELAY)).unwrap();
        assert_eq!(transport.written.borrow().len(), 1);
        assert_eq!(chan.n_queued_writes(), 0);
        assert_eq!(chan.timestamp_last_added_nonpadding(), 5_000);

        // Padding doesn't touch the non-padding timestamp.
        net.clock.set(6_000);
        chan.write_cell(Cell::new(CircId::ZERO, CellCmd::PADDING)).unwrap();
        assert_eq!(chan.timestamp_last_added_nonpadding(), 5_000);
        assert_eq!(chan.timestamp_active(), 6_000);

        wind_down(&net, &chan);
    }

    #[test]
    fn writes_queue_while_opening_and_flush_on_open() {
        let net = TestNet::new();
        let chan = Channel::new(&net.env, false);
        chan.start_opening().unwrap();
        net.env.registry.register(&chan);
        let transport = Rc::new(RecordingTransport::default());
        chan.set_transport(Some(transport.clone()));

        chan.write_cell(Cell::new(CircId::new(1), CellCmd::RELAY)).unwrap();
        chan.write_var_cell(VarCell::new(CircId::ZERO, CellCmd::VPADDING, vec![1, 2]))
            .unwrap();
        assert_eq!(chan.n_queued_writes(), 2);
        assert!(transport.written.borrow().is_empty());

        chan.change_state(ChanState::Open).unwrap();
        assert_eq!(chan.n_queued_writes(), 0);
        assert_eq!(transport.written.borrow().len(), 2);
        // FIFO order: the fixed cell first.
        assert_matches!(&transport.written.borrow()[0], AnyCell::Fixed(_));

        wind_down(&net, &chan);
    }

    #[test]
    fn write_rejected_in_bad_states() {
        let net = TestNet::new();
        let chan = Channel::new(&net.env, false);
        let e = chan.write_cell(Cell::new(CircId::new(1), CellCmd::RELAY)).unwrap_err();
        assert_matches!(
            e,
            Error::UnusableState {
                state: ChanState::Closed,
                ..
            }
        );
    }

    #[test]
    fn failed_write_closes_for_error() {
        let net = TestNet::new();
        let (chan, transport) = open_channel(&net);
        transport.fail_writes.set(true);
        let e = chan.write_cell(Cell::new(CircId::new(1), CellCmd::RELAY));
        assert!(e.is_err());
        assert_eq!(chan.state(), ChanState::Closing);
        assert_eq!(chan.reason_for_closing(), CloseReason::ForError);
        chan.closed().unwrap();
        assert_eq!(chan.state(), ChanState::Error);
        // The error close told the circuit layer.
        assert!(net.circuits.saw_n_chan_done(&chan, false));
        net.env.registry.unregister(&chan);
    }

    #[test]
    fn send_destroy_cell_shape() {
        let net = TestNet::new();
        net.clock.set(42_000);
        let (chan, transport) = open_channel(&net);

        chan.send_destroy(CircId::new(0x1234), 7).unwrap();
        let written = transport.written.borrow();
        assert_eq!(written.len(), 1);
        match &written[0] {
            AnyCell::Fixed(c) => {
                assert_eq!(c.circ_id(), CircId::new(0x1234));
                assert_eq!(c.cmd(), CellCmd::DESTROY);
                assert_eq!(c.payload()[0], 7);
                assert!(c.payload()[1..].iter().all(|b| *b == 0));
            }
            AnyCell::Var(_) => panic!("DESTROY should be a fixed cell"),
        }
        drop(written);
        assert_eq!(chan.timestamp_last_added_nonpadding(), 42_000);

        // On a dying channel it is a quiet no-op.
        chan.request_close().unwrap();
        chan.send_destroy(CircId::new(5), 0).unwrap();
        assert_eq!(transport.written.borrow().len(), 1);

        chan.closed().unwrap();
        net.env.registry.unregister(&chan);
    }

    /// A listener handler that collects accepted children.
    #[derive(Default)]
    struct Accepted {
        /// The children, in dispatch order.
        children: RefCell<Vec<Rc<Channel>>>,
    }
    impl IncomingChannelHandler for Accepted {
        fn handle_incoming(&self, _listener: &Rc<Channel>, child: Rc<Channel>) {
            self.children.borrow_mut().push(child);
        }
    }

    #[test]
    fn listener_backlog_and_dispatch() {
        let net = TestNet::new();
        let listener = Channel::new_listener(&net.env);

        let child1 = Channel::new(&net.env, true);
        child1.start_opening().unwrap();
        net.env.registry.register(&child1);
        let child2 = Channel::new(&net.env, true);
        child2.start_opening().unwrap();
        net.env.registry.register(&child2);

        // No handler yet: both children wait.
        listener.queue_incoming(child1.clone()).unwrap();
        listener.queue_incoming(child2.clone()).unwrap();
        assert_eq!(listener.n_queued_incoming(), 2);

        let accepted = Rc::new(Accepted::default());
        listener.set_listener_handler(Some(accepted.clone()));
        assert_eq!(listener.n_queued_incoming(), 0);
        let children = accepted.children.borrow();
        assert_eq!(children.len(), 2);
        assert!(Rc::ptr_eq(&children[0], &child1));
        assert!(children.iter().all(|c| c.initiated_remotely()));
        drop(children);

        // A listener won't accept another listener.
        let bogus = Channel::new_listener(&net.env);
        let e = listener.queue_incoming(bogus.clone()).unwrap_err();
        assert_matches!(e, Error::Internal(_));

        for c in [child1, child2, bogus] {
            wind_down(&net, &c);
        }
        wind_down(&net, &listener);
    }

    #[test]
    fn open_actions_locally_initiated() {
        let net = TestNet::new();
        let chan = Channel::new(&net.env, false);
        let peer = IdDigest::from_bytes(&[7; 20]).unwrap();
        chan.set_identity_digest(peer);
        chan.start_opening().unwrap();
        net.env.registry.register(&chan);
        chan.set_transport(Some(Rc::new(RecordingTransport::default())));
        chan.change_state(ChanState::Open).unwrap();

        assert!(net.guards.network_live_count() > 0);
        assert!(net.routers.connect_succeeded_to(&peer));
        assert!(net.routers.reachable_set_to(&peer, true));
        assert!(net.circuits.saw_n_chan_done(&chan, true));
        wind_down(&net, &chan);
    }

    #[test]
    fn open_actions_guard_rejection() {
        // The guard subsystem can decline the channel: pending circuits
        // are cancelled, but the channel stays Open.
        let net = TestNet::new();
        net.guards.reject_next();
        let chan = Channel::new(&net.env, false);
        chan.start_opening().unwrap();
        net.env.registry.register(&chan);
        chan.set_transport(Some(Rc::new(RecordingTransport::default())));
        chan.change_state(ChanState::Open).unwrap();

        assert!(net.circuits.saw_n_chan_done(&chan, false));
        assert!(!net.circuits.saw_n_chan_done(&chan, true));
        assert_eq!(chan.state(), ChanState::Open);
        wind_down(&net, &chan);
    }

    #[test]
    fn open_actions_remote_client() {
        // An incoming connection from an unknown peer counts as a
        // client sighting for geoip.
        let net = TestNet::new();
        net.clock.set(777);
        let chan = Channel::new(&net.env, true);
        chan.set_remote_addr("198.51.100.7:443".parse().unwrap());
        chan.start_opening().unwrap();
        net.env.registry.register(&chan);
        chan.set_transport(Some(Rc::new(RecordingTransport::default())));
        chan.change_state(ChanState::Open).unwrap();

        assert!(net
            .geoip
            .saw_client(&"198.51.100.7".parse().unwrap()));
        assert_eq!(chan.timestamp_client_used(), 777);
        wind_down(&net, &chan);
    }

    #[test]
    fn closed_discards_queued_cells() {
        let net = TestNet::new();
        let chan = Channel::new(&net.env, false);
        chan.start_opening().unwrap();
        net.env.registry.register(&chan);
        chan.queue_cell(Cell::new(CircId::new(3), CellCmd::RELAY));
        chan.write_cell(Cell::new(CircId::new(3), CellCmd::RELAY)).unwrap();
        assert_eq!(chan.n_queued_cells(), 1);
        assert_eq!(chan.n_queued_writes(), 1);
        chan.request_close().unwrap();
        chan.closed().unwrap();
        assert_eq!(chan.state(), ChanState::Closed);
        assert_eq!(chan.n_queued_cells(), 0);
        assert_eq!(chan.n_queued_writes(), 0);
        assert!(net.circuits.saw_unlink_all(&chan));
        net.env.registry.unregister(&chan);
    }

    #[test]
    fn circ_id_allocation() {
        let net = TestNet::new();
        let chan = Channel::new(&net.env, false);
        // No parity decided yet.
        assert!(chan.next_circ_id().is_none());
        chan.set_circ_id_range(CircIdRange::High);
        let id = chan.next_circ_id().unwrap();
        assert!(id.get() & CIRC_ID_HIGH_BIT != 0);
        let id2 = chan.next_circ_id().unwrap();
        assert_ne!(id, id2);

        let chan2 = Channel::new(&net.env, false);
        chan2.set_circ_id_range(CircIdRange::Low);
        for _ in 0..10 {
            let id = chan2.next_circ_id().unwrap();
            assert!(id.get() & CIRC_ID_HIGH_BIT == 0);
            assert!(!id.is_zero());
        }

        // Without local auth, the peer comparison always lands High.
        chan.set_identity_digest(IdDigest::from_bytes(&[0xff; 20]).unwrap());
        chan.set_circ_id_range_from_peer();
        assert_eq!(chan.circ_id_range(), Some(CircIdRange::High));
    }

    #[test]
    fn finish_all_closes_everything() {
        let net = TestNet::new();
        let (chan, _t) = open_channel(&net);
        let listener = Channel::new_listener(&net.env);
        let weak_chan = Rc::downgrade(&chan);
        let weak_listener = Rc::downgrade(&listener);
        chan.set_transport(None);
        drop(chan);
        drop(listener);

        net.env.registry.finish_all();
        assert_eq!(net.env.registry.n_channels(), 0);
        assert!(weak_chan.upgrade().is_none());
        assert!(weak_listener.upgrade().is_none());
    }
}

#[cfg(test)]
impl Channel {
    /// Test helper: unregister ourselves from our own registry.
    fn env_registry_unregister(&self) {
        let registry = Rc::clone(&self.env.registry);
        registry.unregister(self);
    }
}
