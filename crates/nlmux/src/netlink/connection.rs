//! The connection reactor.
//!
//! A [`Connection`] owns one non-blocking netlink socket and multiplexes any
//! number of [`Command`]s (request/response exchanges) and
//! [`Subscription`]s (broadcast listeners) over it.
//!
//! Sends are serialized: at most one command is in flight at a time, since
//! the kernel cannot usefully interleave several dump replies on one
//! socket. While a [`Block`] is held nothing is sent at all.
//!
//! Everything is single-threaded. The owning thread calls
//! [`Connection::poll`] whenever the socket is readable (or lets
//! [`Connection::drive`] do it) and every callback runs synchronously from
//! inside the call that triggered it.
//!
//! ```ignore
//! use std::time::Duration;
//! use nlmux::netlink::{Connection, ConnectionConfig, MessageBuilder, Protocol};
//!
//! let conn = Connection::new(ConnectionConfig::new(Protocol::Route));
//! conn.start()?;
//!
//! let cmd = conn.alloc_command();
//! cmd.set_response_callback(|msg| println!("{:?}", msg));
//! cmd.set_message(Some(MessageBuilder::dump(18).into()));
//! cmd.wait(Duration::from_secs(1))?;
//! ```

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::{Rc, Weak};
use std::time::Duration;

use tokio::sync::Notify;

use super::block::{Block, BlockEntry};
use super::command::{Command, CommandShared};
use super::config::ConnectionConfig;
use super::error::{Error, Result};
use super::message::{
    EVENT_SEQ, Message, MessageIter, NLM_F_ACK, NLM_F_REQUEST, NLMSG_HDRLEN, NlMsgError,
    NlMsgHdr, NlMsgType,
};
use super::socket::NetlinkSocket;
use super::subscription::{Subscription, SubscriptionShared};
use super::transport::Transport;

pub(crate) type SharedInner = Rc<RefCell<ConnectionInner>>;
pub(crate) type WeakInner = Weak<RefCell<ConnectionInner>>;

type Opener = Box<dyn FnMut(&ConnectionConfig) -> Result<Box<dyn Transport>>>;

pub(crate) struct ConnectionInner {
    config: ConnectionConfig,
    opener: Opener,
    socket: Option<Box<dyn Transport>>,
    /// Bumped on every successful start.
    generation: u64,
    next_seq: u32,
    pub(crate) in_flight: BTreeMap<u32, Rc<CommandShared>>,
    pub(crate) pending: VecDeque<Rc<CommandShared>>,
    pub(crate) commands: Vec<Weak<CommandShared>>,
    pub(crate) subscriptions: Vec<Rc<SubscriptionShared>>,
    pub(crate) blocks: Vec<BlockEntry>,
    pub(crate) next_block_id: u64,
    /// Sequence number of a cancelled exchange whose reply is still due.
    cancelled_seq: Option<u32>,
    polling: bool,
    /// Wakes [`Connection::drive`] when the socket is closed.
    pub(crate) stop_signal: Rc<Notify>,
}

impl ConnectionInner {
    pub(crate) fn is_open(&self) -> bool {
        self.socket.is_some()
    }

    /// Check if the socket opened as `generation` is still the open one.
    pub(crate) fn is_current(&self, generation: u64) -> bool {
        self.is_open() && self.generation == generation
    }

    fn is_blocked(&self) -> bool {
        !self.in_flight.is_empty() || self.cancelled_seq.is_some() || !self.blocks.is_empty()
    }

    /// Next sequence number; 0 is reserved for events and never returned.
    fn next_seq(&mut self) -> u32 {
        let seq = self.next_seq;
        self.next_seq = match seq.wrapping_add(1) {
            EVENT_SEQ => 1,
            next => next,
        };
        seq
    }

    /// Remember the sequence number of an in-flight exchange that was
    /// abandoned locally. The kernel will still answer it; the reply is
    /// swallowed and TX stays blocked until it arrives.
    pub(crate) fn cancel_in_flight(&mut self, seq: u32) {
        debug_assert!(
            self.cancelled_seq.is_none(),
            "only one exchange can be cancelled at a time"
        );
        if let Some(previous) = self.cancelled_seq {
            tracing::warn!(previous, seq, "overwriting pending cancelled sequence number");
        }
        tracing::debug!(seq, "in flight command cancelled, awaiting its reply");
        self.cancelled_seq = Some(seq);
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        if self.socket.take().is_some() {
            for sub in &self.subscriptions {
                sub.notify_stopped();
            }
        }

        if !self.subscriptions.is_empty() {
            tracing::warn!(
                count = self.subscriptions.len(),
                "connection dropped with subscriptions attached"
            );
        }
        for sub in self.subscriptions.drain(..) {
            sub.detach();
        }

        let commands: Vec<_> = self.commands.drain(..).filter_map(|c| c.upgrade()).collect();
        if !commands.is_empty() {
            tracing::warn!(
                count = commands.len(),
                "connection dropped with commands allocated"
            );
        }
        self.pending.clear();
        self.in_flight.clear();
        for cmd in commands {
            // Can't free them, only unlink; their owners free them later.
            cmd.detach();
            cmd.complete(false);
        }

        if !self.blocks.is_empty() {
            tracing::warn!(count = self.blocks.len(), "connection dropped with tx blocked");
            self.blocks.clear();
        }
    }
}

/// One datagram demultiplexed into what it means for the reactor.
enum Inbound {
    Noop,
    Overrun,
    /// ACK or end of a multi-part reply.
    Complete,
    Failed(Error),
    Data,
}

impl Inbound {
    fn classify(header: &NlMsgHdr, payload: &[u8]) -> Self {
        match header.nlmsg_type {
            NlMsgType::NOOP => Self::Noop,
            NlMsgType::OVERRUN => Self::Overrun,
            NlMsgType::DONE => Self::Complete,
            NlMsgType::ERROR => match NlMsgError::from_bytes(payload) {
                Ok(err) if err.is_ack() => Self::Complete,
                Ok(err) => Self::Failed(err.to_error(header.nlmsg_flags, payload)),
                Err(e) => Self::Failed(e),
            },
            _ => Self::Data,
        }
    }
}

/// Netlink connection reactor.
///
/// Cloning yields another handle to the same connection. The socket is
/// closed and every attached object detached when the last handle drops.
#[derive(Clone)]
pub struct Connection {
    pub(crate) inner: SharedInner,
}

impl Connection {
    /// Create a stopped connection that opens a [`NetlinkSocket`] on start.
    pub fn new(config: ConnectionConfig) -> Self {
        Self::with_transport(config, |config| {
            let socket = NetlinkSocket::open(config)?;
            Ok(Box::new(socket) as Box<dyn Transport>)
        })
    }

    /// Create a stopped connection with a custom transport.
    ///
    /// `opener` is called on every [`start`](Self::start).
    pub fn with_transport<F>(config: ConnectionConfig, opener: F) -> Self
    where
        F: FnMut(&ConnectionConfig) -> Result<Box<dyn Transport>> + 'static,
    {
        let inner = ConnectionInner {
            config,
            opener: Box::new(opener),
            socket: None,
            generation: 0,
            next_seq: 1,
            in_flight: BTreeMap::new(),
            pending: VecDeque::new(),
            commands: Vec::new(),
            subscriptions: Vec::new(),
            blocks: Vec::new(),
            next_block_id: 0,
            cancelled_seq: None,
            polling: false,
            stop_signal: Rc::new(Notify::new()),
        };
        Self {
            inner: Rc::new(RefCell::new(inner)),
        }
    }

    pub(crate) fn from_inner(inner: SharedInner) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> WeakInner {
        Rc::downgrade(&self.inner)
    }

    /// Open the socket, flush queued commands and notify subscriptions.
    ///
    /// Does nothing if already started.
    pub fn start(&self) -> Result<()> {
        {
            let mut guard = self.inner.borrow_mut();
            if guard.socket.is_some() {
                return Ok(());
            }

            let inner = &mut *guard;
            let socket = (inner.opener)(&inner.config)?;
            inner.socket = Some(socket);
            inner.generation += 1;
            tracing::info!(generation = inner.generation, "connection started");
        }

        self.tx();
        self.notify_subscriptions(SubscriptionShared::notify_started);
        Ok(())
    }

    /// Close the socket and notify subscriptions.
    ///
    /// Queued and in-flight commands are kept and survive a restart.
    pub fn stop(&self) {
        let socket = self.inner.borrow_mut().socket.take();
        if socket.is_none() {
            return;
        }
        drop(socket);
        self.inner.borrow().stop_signal.notify_waiters();

        tracing::info!("connection stopped");
        self.notify_subscriptions(SubscriptionShared::notify_stopped);
    }

    /// Check if the socket is open.
    pub fn is_started(&self) -> bool {
        self.inner.borrow().is_open()
    }

    /// Receive and dispatch everything currently queued on the socket.
    ///
    /// Queued commands are flushed before and after dispatch. A receive
    /// buffer overrun is recovered from and reported as [`Error::Overrun`].
    /// Must not be called from inside a callback.
    pub fn poll(&self) -> Result<()> {
        {
            let inner = self.inner.borrow();
            if !inner.is_open() {
                tracing::warn!("poll on a stopped connection");
                return Err(Error::NotStarted);
            }
            if inner.polling {
                tracing::error!("connection polled from inside a dispatch callback");
                return Err(Error::ReentrantPoll);
            }
        }

        self.tx();

        self.inner.borrow_mut().polling = true;
        let result = self.recv_all();
        self.inner.borrow_mut().polling = false;

        if let Err(Error::Overrun) = result {
            self.handle_overrun();
        }

        self.tx();
        result
    }

    /// Allocate a command bound to this connection.
    pub fn alloc_command(&self) -> Command {
        Command::new(self)
    }

    /// Free a command, completing whatever it had outstanding.
    pub fn free_command(&self, cmd: Command) {
        cmd.free();
    }

    /// Suspend all sends until the returned block is released.
    pub fn acquire_block(&self, name: impl Into<String>) -> Block {
        Block::acquire(self, name)
    }

    /// Release a block; the last release resumes sending.
    pub fn release_block(&self, block: Block) {
        block.release();
    }

    /// Attach a subscription to this connection.
    pub fn subscribe(&self, sub: &Subscription) {
        sub.start(self);
    }

    /// Detach a subscription if it is attached to this connection.
    pub fn unsubscribe(&self, sub: &Subscription) {
        if sub.is_attached_to(self) {
            sub.stop();
        }
    }

    /// Raw descriptor of the open socket.
    pub fn raw_fd(&self) -> Option<RawFd> {
        self.inner.borrow().socket.as_ref().map(|s| s.as_raw_fd())
    }

    /// Run `f` against the open socket.
    ///
    /// `f` must not call back into this connection.
    pub fn with_socket<R>(&self, f: impl FnOnce(&mut dyn Transport) -> R) -> Option<R> {
        self.inner
            .borrow_mut()
            .socket
            .as_mut()
            .map(|socket| f(&mut **socket))
    }

    /// Join a multicast group, now if started and on every later start.
    pub fn add_membership(&self, group: u32) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        if let Some(socket) = inner.socket.as_mut() {
            socket.add_membership(group)?;
        }
        if !inner.config.groups.contains(&group) {
            inner.config.groups.push(group);
        }
        Ok(())
    }

    /// Leave a multicast group.
    pub fn drop_membership(&self, group: u32) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        inner.config.groups.retain(|&g| g != group);
        if let Some(socket) = inner.socket.as_mut() {
            socket.drop_membership(group)?;
        }
        Ok(())
    }

    /// Current configuration.
    pub fn config(&self) -> ConnectionConfig {
        self.inner.borrow().config.clone()
    }

    /// Check if sending is currently held back.
    pub fn is_blocked(&self) -> bool {
        self.inner.borrow().is_blocked()
    }

    /// Number of commands waiting to be sent.
    pub fn pending_len(&self) -> usize {
        self.inner.borrow().pending.len()
    }

    /// Number of commands awaiting their reply.
    pub fn in_flight_len(&self) -> usize {
        self.inner.borrow().in_flight.len()
    }

    /// Sequence number of a cancelled exchange still awaiting its reply.
    pub fn cancelled_seq(&self) -> Option<u32> {
        self.inner.borrow().cancelled_seq
    }

    /// Names of the blocks currently held, in acquisition order.
    pub fn block_names(&self) -> Vec<String> {
        self.inner
            .borrow()
            .blocks
            .iter()
            .map(|b| b.name.clone())
            .collect()
    }

    /// Number of attached subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.inner.borrow().subscriptions.len()
    }

    pub(crate) fn generation(&self) -> Option<u64> {
        let inner = self.inner.borrow();
        inner.is_open().then_some(inner.generation)
    }

    pub(crate) fn wait_readable(&self, timeout: Duration) -> Result<bool> {
        let inner = self.inner.borrow();
        let socket = inner.socket.as_ref().ok_or(Error::NotStarted)?;
        Ok(socket.wait_readable(timeout)?)
    }

    // ========================================================================
    // Transmit
    // ========================================================================

    /// Send queued commands until the queue is empty or sending blocks.
    pub(crate) fn tx(&self) {
        while self.try_send() {}
    }

    fn try_send(&self) -> bool {
        let mut guard = self.inner.borrow_mut();
        let inner = &mut *guard;

        if !inner.is_open() || inner.is_blocked() {
            return false;
        }

        let Some(cmd) = inner.pending.pop_front() else {
            return false;
        };

        let Some(mut msg) = cmd.take_pending() else {
            tracing::warn!(name = %cmd.name(), "queued command has no message");
            return true;
        };

        let seq = loop {
            let seq = inner.next_seq();
            if !inner.in_flight.contains_key(&seq) {
                break seq;
            }
            tracing::info!(seq, "sequence number collided, trying next");
        };

        let result = match inner.socket.as_mut() {
            Some(socket) => {
                msg.set_seq(seq);
                msg.set_pid(socket.port_id());
                msg.add_flags(NLM_F_REQUEST | NLM_F_ACK);
                socket.send(msg.as_bytes())
            }
            None => Err(io::Error::from(io::ErrorKind::NotConnected)),
        };

        match result {
            Ok(()) => {
                tracing::debug!(seq, name = %cmd.name(), "command sent");
                cmd.set_in_flight(msg, inner.generation);
                inner.in_flight.insert(seq, cmd);
                true
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                tracing::debug!(seq, name = %cmd.name(), "send buffer full, deferring");
                msg.set_seq(EVENT_SEQ);
                cmd.restore_pending(msg);
                inner.pending.push_front(cmd);
                false
            }
            Err(e) => {
                tracing::warn!(seq, name = %cmd.name(), error = %e, "failed to send");
                msg.set_seq(EVENT_SEQ);
                cmd.restore_pending(msg);
                inner.pending.push_back(Rc::clone(&cmd));
                drop(guard);
                cmd.fail(Error::Io(e));
                true
            }
        }
    }

    // ========================================================================
    // Receive
    // ========================================================================

    fn recv_all(&self) -> Result<()> {
        loop {
            let received = {
                let mut inner = self.inner.borrow_mut();
                match inner.socket.as_mut() {
                    Some(socket) => socket.recv(),
                    // stopped from inside a callback
                    None => return Ok(()),
                }
            };

            let datagram = match received {
                Ok(datagram) => datagram,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.raw_os_error() == Some(libc::ENOBUFS) => return Err(Error::Overrun),
                Err(e) => return Err(e.into()),
            };

            if datagram.is_empty() {
                return Ok(());
            }

            for result in MessageIter::new(&datagram) {
                match result {
                    Ok((header, msg)) => self.dispatch(&header, msg),
                    Err(e) => {
                        tracing::warn!(error = %e, "dropping malformed datagram");
                        break;
                    }
                }
            }
        }
    }

    fn dispatch(&self, header: &NlMsgHdr, msg: &[u8]) {
        let seq = header.nlmsg_seq;
        let (cmd, is_cancelled) = {
            let inner = self.inner.borrow();
            (
                inner.in_flight.get(&seq).cloned(),
                inner.cancelled_seq == Some(seq),
            )
        };

        if seq != EVENT_SEQ && cmd.is_none() && !is_cancelled {
            tracing::trace!(
                seq,
                msg_type = header.nlmsg_type,
                "dropping message with unexpected sequence number"
            );
            return;
        }

        match Inbound::classify(header, &msg[NLMSG_HDRLEN..]) {
            Inbound::Noop => {}
            Inbound::Overrun => self.handle_overrun(),
            Inbound::Complete => {
                if let Some(cmd) = cmd {
                    cmd.complete(false);
                } else if is_cancelled {
                    self.retire_cancelled(seq);
                }
            }
            Inbound::Failed(err) => {
                if let Some(cmd) = cmd {
                    cmd.fail(err);
                } else if is_cancelled {
                    self.retire_cancelled(seq);
                }
            }
            Inbound::Data => {
                if let Some(cmd) = cmd {
                    cmd.deliver(&Message::from_slice(msg));
                } else if seq == EVENT_SEQ {
                    let event = Message::from_slice(msg);
                    self.notify_subscriptions(|sub| sub.notify_event(&event));
                }
            }
        }
    }

    fn retire_cancelled(&self, seq: u32) {
        tracing::debug!(seq, "reply to cancelled command absorbed");
        self.inner.borrow_mut().cancelled_seq = None;
    }

    /// Data was lost; nobody knows whether it was the in-flight command's
    /// ACK or one of its responses, so fail it and have listeners resync.
    fn handle_overrun(&self) {
        tracing::info!("overrun detected, trying to recover");

        let in_flight: Vec<_> = self.inner.borrow().in_flight.values().cloned().collect();
        for cmd in in_flight {
            tracing::info!(name = %cmd.name(), "discarding in flight command");
            cmd.fail(Error::Overrun);
        }
        debug_assert!(self.inner.borrow().in_flight.is_empty());

        self.inner.borrow_mut().cancelled_seq = None;
        self.notify_subscriptions(SubscriptionShared::notify_overrun);
    }

    fn notify_subscriptions(&self, notify: impl Fn(&SubscriptionShared)) {
        let subscriptions = self.inner.borrow().subscriptions.clone();
        for sub in subscriptions {
            // an earlier callback may have detached it
            if sub.is_attached_to(&self.inner) {
                notify(&sub);
            }
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Connection")
            .field("protocol", &inner.config.protocol)
            .field("started", &inner.is_open())
            .field("pending", &inner.pending.len())
            .field("in_flight", &inner.in_flight.keys().collect::<Vec<_>>())
            .field("cancelled_seq", &inner.cancelled_seq)
            .field(
                "blocks",
                &inner.blocks.iter().map(|b| &b.name).collect::<Vec<_>>(),
            )
            .field("subscriptions", &inner.subscriptions.len())
            .finish()
    }
}
