//! Passive listeners for broadcast messages.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use super::callback::Slot;
use super::connection::{Connection, SharedInner, WeakInner};
use super::message::Message;

pub(crate) struct SubscriptionShared {
    owner: RefCell<WeakInner>,
    started: Slot<dyn FnMut()>,
    stopped: Slot<dyn FnMut()>,
    overrun: Slot<dyn FnMut()>,
    event: Slot<dyn FnMut(&Message)>,
}

impl SubscriptionShared {
    pub(crate) fn is_attached_to(&self, inner: &SharedInner) -> bool {
        std::ptr::eq(self.owner.borrow().as_ptr(), Rc::as_ptr(inner))
    }

    pub(crate) fn detach(&self) {
        *self.owner.borrow_mut() = Weak::new();
    }

    pub(crate) fn notify_started(&self) {
        self.started.with(|cb| cb());
    }

    pub(crate) fn notify_stopped(&self) {
        self.stopped.with(|cb| cb());
    }

    pub(crate) fn notify_overrun(&self) {
        self.overrun.with(|cb| cb());
    }

    pub(crate) fn notify_event(&self, msg: &Message) {
        self.event.with(|cb| cb(msg));
    }
}

/// Listener for messages nobody asked for.
///
/// Once attached with [`start`](Self::start), a subscription sees every
/// message the connection receives with sequence number 0, in the order the
/// subscriptions were attached. It is also told when the socket opens or
/// closes and when the receive buffer overran (events were lost, so any
/// state mirrored from them needs a resync).
///
/// Dropping the subscription detaches it.
pub struct Subscription {
    shared: Rc<SubscriptionShared>,
}

impl Default for Subscription {
    fn default() -> Self {
        Self::new()
    }
}

impl Subscription {
    pub fn new() -> Self {
        Self {
            shared: Rc::new(SubscriptionShared {
                owner: RefCell::new(Weak::new()),
                started: Slot::default(),
                stopped: Slot::default(),
                overrun: Slot::default(),
                event: Slot::default(),
            }),
        }
    }

    /// Attach to `conn`.
    ///
    /// The started callback fires right away if the connection is already
    /// running. Attaching twice to the same connection does nothing; a
    /// subscription attached elsewhere must be stopped first.
    pub fn start(&self, conn: &Connection) {
        let current = self.shared.owner.borrow().upgrade();
        if let Some(current) = current {
            if !Rc::ptr_eq(&current, &conn.inner) {
                tracing::warn!("subscription already attached to another connection");
            }
            return;
        }

        *self.shared.owner.borrow_mut() = conn.downgrade();
        conn.inner
            .borrow_mut()
            .subscriptions
            .push(Rc::clone(&self.shared));

        if conn.is_started() {
            self.shared.notify_started();
        }
    }

    /// Detach from the connection.
    ///
    /// The stopped callback fires first if the connection is running.
    pub fn stop(&self) {
        let owner = self.shared.owner.borrow().upgrade();
        let Some(owner) = owner else {
            self.shared.detach();
            return;
        };

        if owner.borrow().is_open() {
            self.shared.notify_stopped();
        }

        owner
            .borrow_mut()
            .subscriptions
            .retain(|sub| !Rc::ptr_eq(sub, &self.shared));
        self.shared.detach();
    }

    /// The connection this subscription is attached to.
    pub fn connection(&self) -> Option<Connection> {
        self.shared
            .owner
            .borrow()
            .upgrade()
            .map(Connection::from_inner)
    }

    pub fn is_attached(&self) -> bool {
        self.shared.owner.borrow().strong_count() > 0
    }

    pub(crate) fn is_attached_to(&self, conn: &Connection) -> bool {
        self.shared.is_attached_to(&conn.inner)
    }

    /// Called when the connection's socket opens.
    pub fn set_started_callback<F>(&self, callback: F)
    where
        F: FnMut() + 'static,
    {
        self.shared.started.set(Some(Box::new(callback)));
    }

    /// Called when the connection's socket closes.
    pub fn set_stopped_callback<F>(&self, callback: F)
    where
        F: FnMut() + 'static,
    {
        self.shared.stopped.set(Some(Box::new(callback)));
    }

    /// Called after a receive buffer overrun.
    pub fn set_overrun_callback<F>(&self, callback: F)
    where
        F: FnMut() + 'static,
    {
        self.shared.overrun.set(Some(Box::new(callback)));
    }

    /// Called for every broadcast message.
    pub fn set_event_callback<F>(&self, callback: F)
    where
        F: FnMut(&Message) + 'static,
    {
        self.shared.event.set(Some(Box::new(callback)));
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.stop();
        self.shared.started.clear();
        self.shared.stopped.clear();
        self.shared.overrun.clear();
        self.shared.event.clear();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("attached", &self.is_attached())
            .finish()
    }
}
