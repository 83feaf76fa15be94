//! Callback slots that tolerate reentrant use.
//!
//! A callback is taken out of its slot while it runs, so it may freely call
//! back into the object that owns the slot, including replacing or clearing
//! its own slot. It is put back afterwards only if nobody touched the slot
//! in the meantime.
//!
//! Calls made through [`Slot::fire`] while the callback is out are queued and
//! replayed once it returns, so no invocation is lost to reentrancy.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;

type Deferred<F> = Box<dyn FnOnce(&mut F)>;

pub(crate) struct Slot<F: ?Sized> {
    callback: RefCell<Option<Box<F>>>,
    epoch: Cell<u64>,
    running: Cell<bool>,
    deferred: RefCell<VecDeque<Deferred<F>>>,
}

impl<F: ?Sized> Default for Slot<F> {
    fn default() -> Self {
        Self {
            callback: RefCell::new(None),
            epoch: Cell::new(0),
            running: Cell::new(false),
            deferred: RefCell::new(VecDeque::new()),
        }
    }
}

impl<F: ?Sized> Slot<F> {
    pub(crate) fn set(&self, callback: Option<Box<F>>) {
        self.epoch.set(self.epoch.get().wrapping_add(1));
        *self.callback.borrow_mut() = callback;
    }

    /// Remove the callback and drop any replays still queued for it.
    pub(crate) fn clear(&self) {
        self.set(None);
        self.deferred.borrow_mut().clear();
    }

    pub(crate) fn is_set(&self) -> bool {
        self.callback.borrow().is_some()
    }

    /// Run the callback, if any. Returns whether one was installed.
    pub(crate) fn with(&self, call: impl FnOnce(&mut F)) -> bool {
        let epoch = self.epoch.get();
        let taken = self.callback.borrow_mut().take();
        let Some(mut callback) = taken else {
            return false;
        };

        let was_running = self.running.replace(true);
        call(&mut callback);
        self.running.set(was_running);

        if self.epoch.get() == epoch {
            *self.callback.borrow_mut() = Some(callback);
        }
        true
    }

    /// Like [`with`](Self::with), but a call arriving while the callback is
    /// running is queued and replayed after it returns.
    ///
    /// Replays go to whatever callback is installed by then; they are
    /// dropped if the slot was cleared.
    pub(crate) fn fire(&self, call: impl FnOnce(&mut F) + 'static) -> bool {
        if self.running.get() && !self.is_set() {
            self.deferred.borrow_mut().push_back(Box::new(call));
            return true;
        }

        let fired = self.with(call);
        if self.running.get() {
            // nested inside a replaced callback; the outer call drains
            return fired;
        }
        loop {
            let next = self.deferred.borrow_mut().pop_front();
            let Some(next) = next else {
                break;
            };
            self.with(next);
        }
        fired
    }
}
