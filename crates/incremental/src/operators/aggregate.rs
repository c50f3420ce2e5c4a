//! Incremental aggregate operators.

use crate::change::{Change, ValueChange};
use crate::dataflow::{Downstream, Link, Node, OperationContext, Scalar, Sequence};
use alloc::boxed::Box;
use alloc::rc::Rc;
use core::cell::Cell;
use tidal_core::{NodeId, Observer, Publisher, SubscriptionId};

/// Incremental COUNT aggregate.
///
/// Maintains the number of upstream elements; only changes that alter the
/// length (insert, remove, reset) are published.
pub struct Count<T> {
    id: NodeId,
    upstream: Rc<dyn Sequence<T>>,
    upstream_sub: Cell<Option<SubscriptionId>>,
    count: Cell<usize>,
    publisher: Publisher<ValueChange<usize>>,
    disposed: Cell<bool>,
}

impl<T: Clone + 'static> Count<T> {
    /// Creates a count over `upstream`, starting from its current length.
    pub fn new(ctx: &OperationContext, upstream: Rc<dyn Sequence<T>>) -> Rc<Self> {
        let count = upstream.len();
        let node = Rc::new(Self {
            id: ctx.next_id(),
            upstream,
            upstream_sub: Cell::new(None),
            count: Cell::new(count),
            publisher: Publisher::new(),
            disposed: Cell::new(false),
        });
        let sub = node.upstream.subscribe(Box::new(Link::new(Rc::downgrade(&node))));
        node.upstream_sub.set(Some(sub));
        ctx.track(&node);
        node
    }

    /// Returns the current count.
    #[inline]
    pub fn get(&self) -> usize {
        self.count.get()
    }
}

impl<T: Clone + 'static> Downstream<T> for Count<T> {
    fn on_upstream(&self, change: &Change<T>) {
        if self.disposed.get() {
            return;
        }
        let old = self.count.get();
        let new = match change.len_delta() {
            Some(delta) => old.wrapping_add_signed(delta),
            None => match change {
                Change::Reset { items } => items.len(),
                _ => old,
            },
        };
        if new == old {
            return;
        }
        self.count.set(new);
        tracing::trace!(node = self.id, old, new, "count publish");
        self.publisher.publish(&ValueChange::new(old, new));
    }

    fn on_upstream_detached(&self) {
        self.upstream_sub.set(None);
    }
}

impl<T: Clone + 'static> Scalar<usize> for Count<T> {
    fn value(&self) -> usize {
        self.count.get()
    }

    fn subscribe(&self, observer: Box<dyn Observer<ValueChange<usize>>>) -> SubscriptionId {
        self.publisher.subscribe_boxed(observer)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.publisher.unsubscribe(id)
    }
}

impl<T: Clone + 'static> Node for Count<T> {
    fn id(&self) -> NodeId {
        self.id
    }

    fn dispose(&self) {
        if self.disposed.replace(true) {
            return;
        }
        if let Some(sub) = self.upstream_sub.take() {
            let released = self.upstream.unsubscribe(sub);
            assert!(released, "count node {} lost its upstream subscription", self.id);
        }
        self.publisher.detach_all();
    }

    fn is_disposed(&self) -> bool {
        self.disposed.get()
    }
}
