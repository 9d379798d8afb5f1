//! The TLS-backed concrete channel transport.
//!
//! A [`TlsChannel`] binds a [`Channel`] to an OR connection (a
//! [`TlsLink`]).  The embedding event loop owns the bytes: it parses
//! cells off the wire and feeds them in through [`TlsChannel::handle_cell`]
//! and [`TlsChannel::handle_var_cell`], and reports connection progress
//! through [`TlsChannel::handle_link_state_change`].  Until the link
//! handshake completes, inbound cells are intercepted by the handshake
//! engine (see [`super::handshake`]); afterwards they flow straight to
//! the channel's queues.

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};

use bytes::BytesMut;
use tracing::{debug, trace, warn};

use orlink_cell::codec::CellCodec;
use orlink_cell::{AnyCell, Cell, CellCmd, VarCell};

use super::handshake::Handshake;
use super::{ChanState, Channel, ChannelTransport};
use crate::external::{ChannelEnv, LinkState, TlsLink};
use crate::{Error, IdDigest, Result};

impl std::fmt::Debug for TlsChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsChannel").finish_non_exhaustive()
    }
}

/// A channel transport backed by an OR TLS connection.
pub struct TlsChannel {
    /// The connection we are bound to.
    pub(super) link: Rc<dyn TlsLink>,
    /// The channel we serve.  Weak: the registry owns the channel, and
    /// the channel owns us.
    pub(super) channel: RefCell<Weak<Channel>>,
    /// The host environment.
    pub(super) env: Rc<ChannelEnv>,
    /// Link-handshake state; present until the handshake completes.
    pub(super) handshake: RefCell<Option<Handshake>>,
    /// Cell codec for the negotiated link protocol (width 2 until one
    /// is negotiated).
    pub(super) codec: RefCell<CellCodec>,
}

impl TlsChannel {
    /// Create a channel for an outbound connection to `addr`, whose
    /// identity we expect to be `id_digest`.
    ///
    /// The channel comes back in state Opening, registered, with the
    /// transport bound; the handshake proceeds as the event loop
    /// reports connection progress.  If the lower layer refuses the
    /// connection outright, the channel is left in Error and this
    /// returns the failure.
    pub fn connect(
        env: &Rc<ChannelEnv>,
        addr: SocketAddr,
        id_digest: IdDigest,
    ) -> Result<(Rc<Channel>, Rc<TlsChannel>)> {
        let chan = Channel::new(env, false);
        chan.set_identity_digest(id_digest);
        chan.set_remote_addr(addr);
        chan.start_opening()?;
        env.registry.register(&chan);
        debug!("{}: connecting to {}", chan.unique_id(), addr);
        let link = match env.connector.connect(addr) {
            Ok(link) => link,
            Err(e) => {
                warn!("{}: connection to {} failed: {}", chan.unique_id(), addr, e);
                chan.fail_to_error();
                return Err(Error::from_io(e));
            }
        };
        let tls = Self::bind(env, link, &chan, /* started_here= */ true);
        // If the connector handed us a link whose TLS handshake already
        // finished, we owe the peer our VERSIONS cell right away.
        if matches!(
            tls.link.state(),
            LinkState::HandshakingV2 | LinkState::HandshakingV3
        ) {
            tls.maybe_send_versions();
        }
        Ok((chan, tls))
    }

    /// Create a channel for an incoming connection that a listener's
    /// transport has accepted.
    pub fn from_incoming(
        env: &Rc<ChannelEnv>,
        link: Rc<dyn TlsLink>,
    ) -> Result<(Rc<Channel>, Rc<TlsChannel>)> {
        let chan = Channel::new(env, true);
        chan.set_remote_addr(link.remote_addr());
        chan.start_opening()?;
        env.registry.register(&chan);
        debug!(
            "{}: accepted connection from {}",
            chan.unique_id(),
            link.remote_addr()
        );
        let tls = Self::bind(env, link, &chan, /* started_here= */ false);
        Ok((chan, tls))
    }

    /// Shared construction: wire a transport between `chan` and `link`.
    fn bind(
        env: &Rc<ChannelEnv>,
        link: Rc<dyn TlsLink>,
        chan: &Rc<Channel>,
        started_here: bool,
    ) -> Rc<TlsChannel> {
        let tls = Rc::new(TlsChannel {
            link,
            channel: RefCell::new(Rc::downgrade(chan)),
            env: Rc::clone(env),
            handshake: RefCell::new(Some(Handshake::new(started_here))),
            codec: RefCell::new(CellCodec::new(0)),
        });
        chan.set_transport(Some(tls.clone()));
        tls
    }

    /// Return the channel we serve, if it is still alive.
    pub fn channel(&self) -> Option<Rc<Channel>> {
        self.channel.borrow().upgrade()
    }

    /// The connection's sub-state changed; track it.
    ///
    /// The connection reaching its open sub-state opens the channel;
    /// leaving it while the channel is Open parks the channel in
    /// maintenance; the connection dying completes (or forces) a close.
    pub fn handle_link_state_change(&self, state: LinkState) {
        let Some(chan) = self.channel() else { return };
        trace!("{}: connection now {:?}", chan.unique_id(), state);
        match state {
            LinkState::Open => match chan.state() {
                ChanState::Opening | ChanState::Maint => {
                    if let Err(e) = chan.change_state(ChanState::Open) {
                        warn!("{}: could not open channel: {}", chan.unique_id(), e);
                    }
                }
                _ => {}
            },
            LinkState::Closed => match chan.state() {
                ChanState::Closing => {
                    let _ = chan.closed();
                }
                s if s.is_terminal() => {}
                _ => {
                    let _ = chan.close_from_lower_layer();
                    let _ = chan.closed();
                }
            },
            LinkState::Handshaking | LinkState::HandshakingV2 | LinkState::HandshakingV3 => {
                if chan.state() == ChanState::Open {
                    // A renegotiation or equivalent: unusable until the
                    // connection comes back.
                    let _ = chan.change_state(ChanState::Maint);
                }
                if matches!(state, LinkState::HandshakingV2 | LinkState::HandshakingV3) {
                    self.maybe_send_versions();
                }
            }
        }
    }

    /// One fixed-length cell arrived on the connection.
    pub fn handle_cell(&self, cell: Cell) {
        let Some(chan) = self.channel() else { return };
        if self.link.state() == LinkState::Open {
            chan.queue_cell(cell);
            return;
        }
        if self.link.state() == LinkState::Closed {
            debug!(
                "{}: dropping {} cell on a closed connection",
                chan.unique_id(),
                cell.cmd()
            );
            return;
        }
        // Until the connection is open, the only fixed-length cell with
        // any business arriving is NETINFO.
        match cell.cmd() {
            CellCmd::NETINFO => self.process_netinfo_cell(&cell),
            cmd => self.handshake_failed(Error::HandshakeProto(format!(
                "received unexpected {} cell while handshaking",
                cmd
            ))),
        }
    }

    /// One variable-length cell arrived on the connection.
    pub fn handle_var_cell(&self, cell: VarCell) {
        let Some(chan) = self.channel() else { return };
        match self.link.state() {
            LinkState::Open => chan.queue_var_cell(cell),
            LinkState::Closed => {
                debug!(
                    "{}: dropping {} cell on a closed connection",
                    chan.unique_id(),
                    cell.cmd()
                );
            }
            LinkState::Handshaking => match cell.cmd() {
                // The commands with meaning during the TLS handshake
                // window.  Anything else implies the peer has moved on
                // to the v3 link handshake.
                CellCmd::VPADDING | CellCmd::AUTHORIZE => {}
                _ => self.enter_v3_handshake_with_cell(cell),
            },
            LinkState::HandshakingV2 => match cell.cmd() {
                CellCmd::VERSIONS => self.process_versions_cell(&cell),
                CellCmd::VPADDING => {}
                cmd => self.handshake_failed(Error::HandshakeProto(format!(
                    "received unexpected {} cell during v2 handshake",
                    cmd
                ))),
            },
            LinkState::HandshakingV3 => self.dispatch_v3_var_cell(cell),
        }
    }

    /// A variable-length cell during the TLS-handshake window implies
    /// the v3 link handshake: flip states and process it there.
    fn enter_v3_handshake_with_cell(&self, cell: VarCell) {
        self.link.set_state(LinkState::HandshakingV3);
        self.dispatch_v3_var_cell(cell);
    }

    /// Route one variable-length cell within the v3 handshake.
    ///
    /// Every such cell except AUTHENTICATE is folded into the running
    /// transcript digest (even ones that turn out to be fatal: the
    /// connection won't outlive them anyway).
    fn dispatch_v3_var_cell(&self, cell: VarCell) {
        match cell.cmd() {
            CellCmd::VERSIONS => self.process_versions_cell(&cell),
            CellCmd::AUTHENTICATE => self.process_authenticate_cell(&cell),
            CellCmd::CERTS => {
                self.digest_received_cell(&cell);
                self.process_certs_cell(&cell);
            }
            CellCmd::AUTH_CHALLENGE => {
                self.digest_received_cell(&cell);
                self.process_auth_challenge_cell(&cell);
            }
            CellCmd::VPADDING | CellCmd::AUTHORIZE => {
                self.digest_received_cell(&cell);
            }
            cmd => {
                self.digest_received_cell(&cell);
                self.handshake_failed(Error::HandshakeProto(format!(
                    "received unexpected {} cell during v3 handshake",
                    cmd
                )));
            }
        }
    }
}

impl ChannelTransport for TlsChannel {
    fn close(&self, chan: &Channel) {
        // Give queued cells one last chance at the wire, then hand the
        // connection to the event loop for teardown.  The loop reports
        // LinkState::Closed when it is done, which completes the
        // channel's close.
        let queued = chan.drain_outgoing();
        if !queued.is_empty() {
            trace!(
                "{}: flushing {} queued cells at close",
                chan.unique_id(),
                queued.len()
            );
            let mut codec = self.codec.borrow_mut();
            for cell in queued {
                let mut buf = BytesMut::new();
                let encoded = match &cell {
                    AnyCell::Fixed(c) => codec.write_cell(c, &mut buf),
                    AnyCell::Var(c) => codec.write_var_cell(c, &mut buf),
                };
                if encoded.is_err() || self.link.write(&buf).is_err() {
                    // Closing anyway; nothing useful left to do.
                    break;
                }
            }
        }
        self.link.mark_for_close();
    }

    fn write_cell(&self, chan: &Channel, cell: Cell) -> Result<()> {
        let mut buf = BytesMut::with_capacity(520);
        self.codec.borrow_mut().write_cell(&cell, &mut buf)?;
        self.link.write(&buf).map_err(Error::from_io)?;
        trace!("{}: wrote {} cell to connection", chan.unique_id(), cell.cmd());
        Ok(())
    }

    fn write_var_cell(&self, chan: &Channel, cell: VarCell) -> Result<()> {
        let mut buf = BytesMut::with_capacity(7 + cell.payload().len());
        self.codec.borrow_mut().write_var_cell(&cell, &mut buf)?;
        self.link.write(&buf).map_err(Error::from_io)?;
        trace!("{}: wrote {} cell to connection", chan.unique_id(), cell.cmd());
        Ok(())
    }

    fn release(&self, _chan: &Channel) {
        *self.handshake.borrow_mut() = None;
        if self.link.state() != LinkState::Closed {
            self.link.mark_for_close();
        }
    }
}
