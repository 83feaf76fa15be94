//! Request/response exchanges.
//!
//! A [`Command`] is idle until a message is set on it. It then waits in the
//! connection's queue (pending), gets sent and waits for its reply (in
//! flight), and returns to idle once the kernel ACKs, errors, or finishes a
//! multi-part reply. Every exchange ends with exactly one completed
//! callback, however it ended.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use super::callback::Slot;
use super::connection::{Connection, WeakInner};
use super::error::{Error, Result};
use super::message::{EVENT_SEQ, Message};

#[derive(Default)]
struct CommandState {
    pending: Option<Message>,
    in_flight: Option<Message>,
    /// Socket generation the in-flight request was sent on.
    sent_on: u64,
    /// The kernel already answered the in-flight request.
    answered: bool,
    /// Bumped for every message queued.
    exchange: u64,
    failed: bool,
    name: String,
}

/// State shared between a [`Command`] handle and the connection queues.
pub(crate) struct CommandShared {
    owner: RefCell<WeakInner>,
    state: RefCell<CommandState>,
    response: Slot<dyn FnMut(&Message)>,
    completed: Slot<dyn FnMut()>,
    failed: Slot<dyn FnMut(&Error)>,
}

impl CommandShared {
    fn new() -> Self {
        Self {
            owner: RefCell::new(Weak::new()),
            state: RefCell::default(),
            response: Slot::default(),
            completed: Slot::default(),
            failed: Slot::default(),
        }
    }

    fn owner(&self) -> Option<Connection> {
        self.owner.borrow().upgrade().map(Connection::from_inner)
    }

    pub(crate) fn detach(&self) {
        *self.owner.borrow_mut() = Weak::new();
    }

    pub(crate) fn name(&self) -> String {
        self.state.borrow().name.clone()
    }

    pub(crate) fn take_pending(&self) -> Option<Message> {
        self.state.borrow_mut().pending.take()
    }

    pub(crate) fn restore_pending(&self, msg: Message) {
        self.state.borrow_mut().pending = Some(msg);
    }

    pub(crate) fn set_in_flight(&self, msg: Message, generation: u64) {
        let mut state = self.state.borrow_mut();
        state.in_flight = Some(msg);
        state.sent_on = generation;
    }

    pub(crate) fn deliver(&self, msg: &Message) {
        if !self.response.with(|cb| cb(msg)) {
            tracing::trace!(name = %self.name(), msg_type = msg.msg_type(), "response ignored");
        }
    }

    /// End the current exchange, if any.
    ///
    /// With `cancelling` an in-flight request is abandoned locally and the
    /// connection told to swallow its eventual reply. Requests sent on a
    /// socket that has since been closed get no reply, so nothing is
    /// recorded for them.
    pub(crate) fn complete(self: &Rc<Self>, cancelling: bool) {
        let owner = self.owner.borrow().upgrade();
        let ended = {
            let mut state = self.state.borrow_mut();
            let pending = state.pending.take();
            let in_flight = state.in_flight.take();
            let answered = std::mem::take(&mut state.answered);

            if let Some(owner) = &owner {
                let mut inner = owner.borrow_mut();
                if pending.is_some() {
                    inner.pending.retain(|cmd| !Rc::ptr_eq(cmd, self));
                }
                if let Some(msg) = &in_flight {
                    let seq = msg.seq();
                    inner.in_flight.remove(&seq);
                    if cancelling && !answered {
                        if inner.is_current(state.sent_on) {
                            inner.cancel_in_flight(seq);
                        } else {
                            tracing::debug!(seq, "cancelled command was sent on a closed socket");
                        }
                    }
                }
            }

            pending.is_some() || in_flight.is_some()
        };

        if ended {
            self.completed.fire(|cb| cb());
        }
    }

    /// Mark the current exchange failed, report `err` and complete it.
    ///
    /// If the failed callback already queued a replacement, the replacement
    /// is left alone.
    pub(crate) fn fail(self: &Rc<Self>, err: Error) {
        let exchange = {
            let mut state = self.state.borrow_mut();
            state.failed = true;
            state.answered = true;
            state.exchange
        };
        let error = err.to_string();
        if !self.failed.fire(move |cb| cb(&err)) {
            tracing::info!(name = %self.name(), %error, "command failed");
        }
        if self.state.borrow().exchange == exchange {
            self.complete(false);
        }
    }

    fn clear_callbacks(&self) {
        self.response.clear();
        self.completed.clear();
        self.failed.clear();
    }
}

/// A single request/response exchange on a [`Connection`].
///
/// Dropping the handle frees the command: an outstanding exchange is ended
/// (firing its completed callback) and the command is unlinked from its
/// connection.
pub struct Command {
    shared: Rc<CommandShared>,
}

impl Command {
    /// Allocate a command bound to `conn`.
    pub fn new(conn: &Connection) -> Self {
        let cmd = Self::detached();
        *cmd.shared.owner.borrow_mut() = conn.downgrade();
        conn.inner
            .borrow_mut()
            .commands
            .push(Rc::downgrade(&cmd.shared));
        cmd
    }

    /// Allocate a command that is not bound to any connection.
    ///
    /// Messages set on it are dropped with an immediate completion.
    pub fn detached() -> Self {
        Self {
            shared: Rc::new(CommandShared::new()),
        }
    }

    /// Set a name used in log output.
    pub fn set_name(&self, name: impl Into<String>) {
        self.shared.state.borrow_mut().name = name.into();
    }

    pub fn name(&self) -> String {
        self.shared.name()
    }

    /// The connection this command is bound to, if it is still alive.
    pub fn connection(&self) -> Option<Connection> {
        self.shared.owner()
    }

    /// Replace the request.
    ///
    /// Whatever exchange was outstanding is ended first: a queued request is
    /// dropped, an in-flight one is cancelled, and the completed callback
    /// fires for it. A new message is then queued for sending; `None` leaves
    /// the command idle.
    pub fn set_message(&self, msg: Option<Message>) {
        self.shared.complete(true);

        let Some(mut msg) = msg else {
            return;
        };

        let Some(conn) = self.shared.owner() else {
            tracing::warn!(name = %self.name(), "command has no connection, dropping message");
            self.shared.completed.fire(|cb| cb());
            return;
        };

        msg.set_seq(EVENT_SEQ);
        {
            let mut state = self.shared.state.borrow_mut();
            state.pending = Some(msg);
            state.failed = false;
            state.exchange = state.exchange.wrapping_add(1);
        }
        conn.inner
            .borrow_mut()
            .pending
            .push_back(Rc::clone(&self.shared));
        conn.tx();
    }

    /// End the outstanding exchange without queuing a new one.
    pub fn cancel(&self) {
        self.set_message(None);
    }

    /// Poll the connection until this command completes or `timeout` passes.
    ///
    /// Overruns during the wait are absorbed; if they failed this command
    /// that shows up in [`has_failed`](Self::has_failed).
    pub fn wait(&self, timeout: Duration) -> Result<()> {
        let conn = self.connection().ok_or(Error::Detached)?;
        let deadline = Instant::now() + timeout;

        loop {
            if self.is_completed() {
                return Ok(());
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if !conn.wait_readable(remaining)? {
                return Err(Error::Timeout);
            }

            match conn.poll() {
                Ok(()) | Err(Error::Overrun) => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Free the command. Same as dropping it.
    pub fn free(self) {}

    /// Check if the request is queued but not yet sent.
    pub fn is_pending(&self) -> bool {
        self.shared.state.borrow().pending.is_some()
    }

    /// Check if the request was sent and awaits its reply.
    pub fn is_in_flight(&self) -> bool {
        self.shared.state.borrow().in_flight.is_some()
    }

    /// Check if no exchange is outstanding.
    pub fn is_completed(&self) -> bool {
        !self.is_pending() && !self.is_in_flight()
    }

    /// Check if the last exchange ended in failure.
    pub fn has_failed(&self) -> bool {
        self.shared.state.borrow().failed
    }

    /// Called for every data message answering the request.
    pub fn set_response_callback<F>(&self, callback: F)
    where
        F: FnMut(&Message) + 'static,
    {
        self.shared.response.set(Some(Box::new(callback)));
    }

    /// Called exactly once when an exchange ends, whatever the outcome.
    pub fn set_completed_callback<F>(&self, callback: F)
    where
        F: FnMut() + 'static,
    {
        self.shared.completed.set(Some(Box::new(callback)));
    }

    /// Called before completion when an exchange fails.
    ///
    /// Without one, failures are only logged.
    pub fn set_failed_callback<F>(&self, callback: F)
    where
        F: FnMut(&Error) + 'static,
    {
        self.shared.failed.set(Some(Box::new(callback)));
    }
}

impl Drop for Command {
    fn drop(&mut self) {
        self.shared.complete(true);

        if let Some(owner) = self.shared.owner.borrow().upgrade() {
            owner
                .borrow_mut()
                .commands
                .retain(|cmd| !std::ptr::eq(cmd.as_ptr(), Rc::as_ptr(&self.shared)));
        }
        self.shared.detach();
        // callbacks may capture handles that keep the connection alive
        self.shared.clear_callbacks();
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.borrow();
        f.debug_struct("Command")
            .field("name", &state.name)
            .field("pending", &state.pending.is_some())
            .field("in_flight", &state.in_flight.as_ref().map(Message::seq))
            .field("failed", &state.failed)
            .finish()
    }
}
