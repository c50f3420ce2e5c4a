//! Node capabilities shared by every operator.

use crate::change::{Change, ValueChange};
use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::rc::Weak;
use alloc::vec::Vec;
use core::cell::{Cell, RefCell};
use tidal_core::{NodeId, Observer, SubscriptionId};

/// A node of an operator graph.
pub trait Node {
    /// Returns the node's identifier within its operation context.
    fn id(&self) -> NodeId;

    /// Releases upstream subscriptions and field watches, then detaches
    /// this node's own subscribers. Idempotent.
    fn dispose(&self);

    /// Returns true once `dispose` has run.
    fn is_disposed(&self) -> bool;
}

/// An ordered, change-notifying sequence.
///
/// `snapshot()` is valid at any time; subscribers receive one `Change` per
/// logical delta, in the order the deltas happened, and never a `Reset` when
/// a more specific change describes the delta.
pub trait Sequence<T> {
    /// Returns a copy of the current elements.
    fn snapshot(&self) -> Vec<T>;

    /// Returns the number of elements.
    fn len(&self) -> usize;

    /// Returns true if the sequence is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a copy of the element at `index`.
    fn get(&self, index: usize) -> Option<T>;

    /// Registers an observer for changes.
    fn subscribe(&self, observer: Box<dyn Observer<Change<T>>>) -> SubscriptionId;

    /// Removes an observer. Returns false if the ID is unknown.
    fn unsubscribe(&self, id: SubscriptionId) -> bool;
}

/// Generic convenience methods for any `Sequence`.
pub trait SequenceExt<T>: Sequence<T> {
    /// Registers any observer (including plain closures).
    fn observe<O>(&self, observer: O) -> SubscriptionId
    where
        O: Observer<Change<T>> + 'static,
    {
        self.subscribe(Box::new(observer))
    }
}

impl<T, S: Sequence<T> + ?Sized> SequenceExt<T> for S {}

/// A change-notifying scalar value.
pub trait Scalar<V> {
    /// Returns the current value.
    fn value(&self) -> V;

    /// Registers an observer for value changes.
    fn subscribe(&self, observer: Box<dyn Observer<ValueChange<V>>>) -> SubscriptionId;

    /// Removes an observer. Returns false if the ID is unknown.
    fn unsubscribe(&self, id: SubscriptionId) -> bool;
}

/// The receiving side of an upstream subscription.
pub trait Downstream<T> {
    /// Handles one change published upstream.
    fn on_upstream(&self, change: &Change<T>);

    /// The upstream will publish nothing further.
    fn on_upstream_detached(&self);
}

/// Observer installed on an upstream node. It only holds a weak reference to
/// the downstream node, so upstreams never keep their consumers alive.
pub struct Link<N> {
    node: Weak<N>,
}

impl<N> Link<N> {
    /// Creates a link delivering to `node` while it is alive.
    pub fn new(node: Weak<N>) -> Self {
        Self { node }
    }
}

impl<T, N> Observer<Change<T>> for Link<N>
where
    N: Downstream<T>,
{
    fn on_change(&self, change: &Change<T>) {
        if let Some(node) = self.node.upgrade() {
            node.on_upstream(change);
        }
    }

    fn on_detach(&self) {
        if let Some(node) = self.node.upgrade() {
            node.on_upstream_detached();
        }
    }
}

/// Serializes change processing for one node.
///
/// A change arriving while the node is still handling (and publishing) an
/// earlier one is queued and handled strictly afterwards, so handlers never
/// observe a half-applied state.
pub struct Pump<T> {
    busy: Cell<bool>,
    pending: RefCell<VecDeque<Change<T>>>,
}

struct BusyGuard<'a>(&'a Cell<bool>);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

impl<T> Default for Pump<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Pump<T> {
    /// Creates an idle pump.
    pub fn new() -> Self {
        Self {
            busy: Cell::new(false),
            pending: RefCell::new(VecDeque::new()),
        }
    }

    /// Handles `change` now, or after the in-flight change if one is being
    /// handled. Returns once every queued change has been handled.
    pub fn run<F>(&self, change: Change<T>, mut handle: F)
    where
        F: FnMut(Change<T>),
    {
        self.pending.borrow_mut().push_back(change);
        if self.busy.get() {
            tracing::trace!(queued = self.pending.borrow().len(), "change queued behind in-flight propagation");
            return;
        }

        self.busy.set(true);
        let _guard = BusyGuard(&self.busy);
        loop {
            let next = self.pending.borrow_mut().pop_front();
            match next {
                Some(change) => handle(change),
                None => break,
            }
        }
    }

    /// Returns true while a change is being handled.
    #[inline]
    pub fn is_busy(&self) -> bool {
        self.busy.get()
    }

    /// Drops every queued change.
    pub fn clear(&self) {
        self.pending.borrow_mut().clear();
    }
}
