//! Buffer: an indexable materialization of a sequence.
//!
//! A `Buffer` takes one snapshot of its upstream when it is built and from
//! then on maintains its copy purely from the changes the upstream
//! publishes, never re-reading the upstream. It republishes every change it
//! applies, so UI bindings can observe the buffer instead of the operator.

use alloc::boxed::Box;
use alloc::rc::Rc;
use alloc::vec::Vec;
use core::cell::{Cell, RefCell};
use tidal_core::{NodeId, Observer, Publisher, SubscriptionId};
use tidal_incremental::{Change, Downstream, Link, Node, OperationContext, Sequence};

/// An indexable copy of a sequence, kept current from its notifications.
///
/// # Example
///
/// ```
/// use std::rc::Rc;
/// use tidal_incremental::{ObservableVec, OperationContext};
/// use tidal_reactive::Buffer;
///
/// let ctx = OperationContext::new();
/// let source = Rc::new(ObservableVec::from_vec(vec![1, 2]));
/// let buffer = Buffer::<i32>::new(&ctx, source.clone());
///
/// source.push(3).unwrap();
/// assert_eq!(buffer.count(), 3);
/// assert_eq!(buffer.element_at(2), Some(3));
/// ```
pub struct Buffer<T> {
    id: NodeId,
    upstream: Rc<dyn Sequence<T>>,
    upstream_sub: Cell<Option<SubscriptionId>>,
    items: RefCell<Vec<T>>,
    publisher: Publisher<Change<T>>,
    /// Set once the upstream announced it will publish nothing further
    detached: Cell<bool>,
    disposed: Cell<bool>,
}

impl<T: Clone + 'static> Buffer<T> {
    /// Materializes `upstream`.
    pub fn new(ctx: &OperationContext, upstream: Rc<dyn Sequence<T>>) -> Rc<Self> {
        let items = upstream.snapshot();
        let buffer = Rc::new(Self {
            id: ctx.next_id(),
            upstream,
            upstream_sub: Cell::new(None),
            items: RefCell::new(items),
            publisher: Publisher::new(),
            detached: Cell::new(false),
            disposed: Cell::new(false),
        });
        let sub = buffer
            .upstream
            .subscribe(Box::new(Link::new(Rc::downgrade(&buffer))));
        buffer.upstream_sub.set(Some(sub));
        ctx.track(&buffer);
        tracing::debug!(node = buffer.id, count = buffer.count(), "buffer built");
        buffer
    }

    /// Returns the number of elements.
    #[inline]
    pub fn count(&self) -> usize {
        self.items.borrow().len()
    }

    /// Returns the element at `index`.
    pub fn element_at(&self, index: usize) -> Option<T> {
        self.items.borrow().get(index).cloned()
    }

    /// Returns a copy of all elements.
    pub fn to_vec(&self) -> Vec<T> {
        self.items.borrow().clone()
    }

    /// Returns true once the upstream has detached (for a group, once the
    /// group was closed). A detached buffer keeps its last contents.
    #[inline]
    pub fn is_detached(&self) -> bool {
        self.detached.get()
    }

    /// Registers a closure called with every change the buffer applies.
    pub fn observe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&Change<T>) + 'static,
    {
        self.publisher.subscribe(callback)
    }
}

impl<T: Clone + 'static> Downstream<T> for Buffer<T> {
    fn on_upstream(&self, change: &Change<T>) {
        if self.disposed.get() {
            return;
        }
        change.apply_to(&mut self.items.borrow_mut());
        tracing::trace!(node = self.id, kind = change.kind(), "buffer apply");
        self.publisher.publish(change);
    }

    fn on_upstream_detached(&self) {
        self.upstream_sub.set(None);
        self.detached.set(true);
        self.publisher.detach_all();
    }
}

impl<T: Clone + 'static> Sequence<T> for Buffer<T> {
    fn snapshot(&self) -> Vec<T> {
        self.to_vec()
    }

    fn len(&self) -> usize {
        self.count()
    }

    fn get(&self, index: usize) -> Option<T> {
        self.element_at(index)
    }

    fn subscribe(&self, observer: Box<dyn Observer<Change<T>>>) -> SubscriptionId {
        self.publisher.subscribe_boxed(observer)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.publisher.unsubscribe(id)
    }
}

impl<T: Clone + 'static> Node for Buffer<T> {
    fn id(&self) -> NodeId {
        self.id
    }

    fn dispose(&self) {
        if self.disposed.replace(true) {
            return;
        }
        if let Some(sub) = self.upstream_sub.take() {
            let released = self.upstream.unsubscribe(sub);
            assert!(released, "buffer {} lost its upstream subscription", self.id);
        }
        self.publisher.detach_all();
        tracing::debug!(node = self.id, "buffer disposed");
    }

    fn is_disposed(&self) -> bool {
        self.disposed.get()
    }
}
