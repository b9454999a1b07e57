//! Fan-out of unsolicited messages to subscribers.

use log::error;
use std::cell::{Cell, RefCell};
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

/// Handle returned by [`EventRouter::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler<E> = Rc<dyn Fn(&E)>;

/// Delivers each event to every subscriber, synchronously and in
/// subscription order.
///
/// Subscriptions are independent of any connection: they survive
/// reconnects.  A subscriber may subscribe or unsubscribe (itself included)
/// while an event is being dispatched; the change takes effect from the next
/// event on.
pub struct EventRouter<E> {
    subscribers: RefCell<Vec<(SubscriptionId, Handler<E>)>>,
    next_id: Cell<u64>,
}

impl<E> Default for EventRouter<E> {
    fn default() -> Self {
        Self {
            subscribers: RefCell::new(Vec::new()),
            next_id: Cell::new(0),
        }
    }
}

impl<E> EventRouter<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for every future event.
    pub fn subscribe(&self, handler: impl Fn(&E) + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.get());
        self.next_id.set(id.0 + 1);
        self.subscribers.borrow_mut().push((id, Rc::new(handler)));
        id
    }

    /// Remove a subscription.  Returns `false` if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.subscribers.borrow_mut();
        let before = subs.len();
        subs.retain(|(sid, _)| *sid != id);
        subs.len() != before
    }

    /// Drop every subscription, releasing whatever the handlers captured.
    pub fn clear(&self) {
        self.subscribers.borrow_mut().clear();
    }

    pub fn len(&self) -> usize {
        self.subscribers.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.borrow().is_empty()
    }

    /// Invoke every current subscriber with `event`.
    ///
    /// A subscriber that panics is logged and skipped; the remaining
    /// subscribers still run.  Returns how many subscribers completed
    /// normally.
    pub fn dispatch(&self, event: &E) -> usize {
        let snapshot: Vec<(SubscriptionId, Handler<E>)> = self.subscribers.borrow().clone();
        let mut delivered = 0;
        for (id, handler) in snapshot {
            match panic::catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(()) => delivered += 1,
                Err(_) => error!("subscriber {:?} panicked; continuing with the rest", id),
            }
        }
        delivered
    }
}
