//! Subscription management for observable values.
//!
//! Every observable thing in tidal (items, sequences, groups, scalar nodes)
//! hands out `SubscriptionId`s and keeps its observers in a
//! `SubscriptionManager`. Observers are notified in subscription order.

use alloc::boxed::Box;
use alloc::rc::Rc;
use alloc::vec::Vec;
use core::cell::{Cell, RefCell};

/// Unique identifier for a subscription.
pub type SubscriptionId = u64;

/// Receives notifications of type `M`.
///
/// Any `Fn(&M)` closure is an observer; implement the trait directly to also
/// learn when the observed node detaches.
pub trait Observer<M> {
    /// Called once per published notification.
    fn on_change(&self, change: &M);

    /// Called when the observed node will publish nothing further.
    fn on_detach(&self) {}
}

impl<M, F> Observer<M> for F
where
    F: Fn(&M),
{
    fn on_change(&self, change: &M) {
        self(change)
    }
}

/// A subscription to an observable.
pub struct Subscription<M> {
    /// Unique identifier
    id: SubscriptionId,
    /// Observer to invoke on changes
    observer: Box<dyn Observer<M>>,
    /// Whether this subscription is active
    active: Cell<bool>,
}

impl<M> Subscription<M> {
    /// Creates a new subscription.
    pub fn new<O>(id: SubscriptionId, observer: O) -> Self
    where
        O: Observer<M> + 'static,
    {
        Self::from_boxed(id, Box::new(observer))
    }

    /// Creates a new subscription from an already boxed observer.
    pub fn from_boxed(id: SubscriptionId, observer: Box<dyn Observer<M>>) -> Self {
        Self {
            id,
            observer,
            active: Cell::new(true),
        }
    }

    /// Returns the subscription ID.
    #[inline]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Returns whether this subscription is active.
    #[inline]
    pub fn is_active(&self) -> bool {
        self.active.get()
    }

    /// Deactivates this subscription.
    #[inline]
    pub fn deactivate(&self) {
        self.active.set(false);
    }

    /// Notifies this subscription of a change.
    pub fn notify(&self, change: &M) {
        if self.is_active() {
            self.observer.on_change(change);
        }
    }

    /// Tells the observer nothing further will be published.
    pub fn detach(&self) {
        if self.is_active() {
            self.deactivate();
            self.observer.on_detach();
        }
    }
}

/// Manages the subscriptions of one observable.
pub struct SubscriptionManager<M> {
    /// Subscriptions in subscription order
    subscriptions: Vec<Rc<Subscription<M>>>,
    /// Next subscription ID to assign
    next_id: SubscriptionId,
}

impl<M> Default for SubscriptionManager<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> SubscriptionManager<M> {
    /// Creates a new subscription manager.
    pub fn new() -> Self {
        Self {
            subscriptions: Vec::new(),
            next_id: 1,
        }
    }

    /// Subscribes with the given observer.
    ///
    /// Returns the subscription ID that can be used to unsubscribe.
    pub fn subscribe<O>(&mut self, observer: O) -> SubscriptionId
    where
        O: Observer<M> + 'static,
    {
        self.subscribe_boxed(Box::new(observer))
    }

    /// Subscribes with an already boxed observer.
    pub fn subscribe_boxed(&mut self, observer: Box<dyn Observer<M>>) -> SubscriptionId {
        let id = self.next_id;
        self.next_id += 1;
        self.subscriptions
            .push(Rc::new(Subscription::from_boxed(id, observer)));
        id
    }

    /// Unsubscribes by ID.
    ///
    /// Returns true if the subscription was found and removed.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        match self.subscriptions.iter().position(|s| s.id() == id) {
            Some(pos) => {
                let sub = self.subscriptions.remove(pos);
                sub.deactivate();
                true
            }
            None => false,
        }
    }

    /// Returns the current subscriptions so they can be notified after the
    /// manager itself is no longer borrowed.
    pub fn snapshot(&self) -> Vec<Rc<Subscription<M>>> {
        self.subscriptions.clone()
    }

    /// Removes every subscription and returns them for detaching.
    pub fn drain(&mut self) -> Vec<Rc<Subscription<M>>> {
        core::mem::take(&mut self.subscriptions)
    }

    /// Returns the number of active subscriptions.
    #[inline]
    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    /// Returns true if there are no subscriptions.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}

/// A `SubscriptionManager` behind a `RefCell`, publishing with the borrow
/// released so observers may subscribe or unsubscribe from their callbacks.
pub struct Publisher<M> {
    manager: RefCell<SubscriptionManager<M>>,
}

impl<M> Default for Publisher<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> Publisher<M> {
    /// Creates a publisher with no observers.
    pub fn new() -> Self {
        Self {
            manager: RefCell::new(SubscriptionManager::new()),
        }
    }

    /// Registers an observer.
    pub fn subscribe<O>(&self, observer: O) -> SubscriptionId
    where
        O: Observer<M> + 'static,
    {
        self.manager.borrow_mut().subscribe(observer)
    }

    /// Registers an already boxed observer.
    pub fn subscribe_boxed(&self, observer: Box<dyn Observer<M>>) -> SubscriptionId {
        self.manager.borrow_mut().subscribe_boxed(observer)
    }

    /// Removes an observer. Returns false if the ID is unknown.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.manager.borrow_mut().unsubscribe(id)
    }

    /// Delivers a change to every observer registered before the call.
    pub fn publish(&self, change: &M) {
        let subs = self.manager.borrow().snapshot();
        for sub in subs {
            sub.notify(change);
        }
    }

    /// Removes all observers, calling `on_detach` on each.
    pub fn detach_all(&self) {
        let subs = self.manager.borrow_mut().drain();
        for sub in subs {
            sub.detach();
        }
    }

    /// Returns the number of registered observers.
    pub fn len(&self) -> usize {
        self.manager.borrow().len()
    }

    /// Returns true if nobody is observing.
    pub fn is_empty(&self) -> bool {
        self.manager.borrow().is_empty()
    }
}
