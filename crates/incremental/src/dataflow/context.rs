//! Operation context: the shared scope of one compiled operator graph.

use crate::dataflow::node::Node;
use alloc::rc::{Rc, Weak};
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::any::Any;
use core::cell::{Cell, RefCell};
use hashbrown::HashMap;
use tidal_core::{Error, NodeId, Result};

struct ContextInner {
    /// Counter for generating node IDs
    next_id: Cell<NodeId>,
    /// Nodes in construction order
    nodes: RefCell<Vec<Weak<dyn Node>>>,
    /// Nodes shared by key, kept alive until disposal
    shared: RefCell<HashMap<String, Rc<dyn Any>>>,
    disposed: Cell<bool>,
}

/// Per-graph scope threaded through every node constructor.
///
/// The context hands out node identities, deduplicates equivalent nodes via
/// `share`, and is the single teardown point of the graph: `dispose` disposes
/// every tracked node, most recently constructed (most downstream) first.
/// There is no process-wide state; two graphs never share a context.
#[derive(Clone)]
pub struct OperationContext {
    inner: Rc<ContextInner>,
}

impl Default for OperationContext {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationContext {
    /// Creates a context for a new operator graph.
    pub fn new() -> Self {
        Self {
            inner: Rc::new(ContextInner {
                next_id: Cell::new(0),
                nodes: RefCell::new(Vec::new()),
                shared: RefCell::new(HashMap::new()),
                disposed: Cell::new(false),
            }),
        }
    }

    /// Allocates the next node ID.
    pub fn next_id(&self) -> NodeId {
        let id = self.inner.next_id.get();
        self.inner.next_id.set(id + 1);
        id
    }

    /// Registers a node for teardown.
    pub fn track<N: Node + 'static>(&self, node: &Rc<N>) {
        let weak: Weak<dyn Node> = Rc::downgrade(node) as Weak<dyn Node>;
        self.inner.nodes.borrow_mut().push(weak);
        tracing::debug!(node = node.id(), "node tracked");
    }

    /// Returns the node registered under `key`, building it on first use.
    ///
    /// Fails if `key` already names a node of another type, or if the
    /// context has been disposed.
    pub fn share<N, F>(&self, key: &str, build: F) -> Result<Rc<N>>
    where
        N: 'static,
        F: FnOnce() -> Rc<N>,
    {
        if self.is_disposed() {
            return Err(Error::invalid_operation("context disposed"));
        }
        if let Some(existing) = self.inner.shared.borrow().get(key) {
            return existing
                .clone()
                .downcast::<N>()
                .map_err(|_| Error::invalid_operation("shared node has a different type"));
        }

        let node = build();
        self.inner
            .shared
            .borrow_mut()
            .insert(key.to_string(), node.clone() as Rc<dyn Any>);
        Ok(node)
    }

    /// Returns the number of tracked nodes still alive.
    pub fn node_count(&self) -> usize {
        self.inner
            .nodes
            .borrow()
            .iter()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    /// Disposes every tracked node, downstream first, and drops shared
    /// nodes. Calling it again does nothing.
    pub fn dispose(&self) {
        if self.inner.disposed.replace(true) {
            return;
        }
        let nodes = core::mem::take(&mut *self.inner.nodes.borrow_mut());
        tracing::debug!(nodes = nodes.len(), "disposing operation context");
        for weak in nodes.iter().rev() {
            if let Some(node) = weak.upgrade() {
                node.dispose();
            }
        }
        let shared = core::mem::take(&mut *self.inner.shared.borrow_mut());
        drop(shared);
    }

    /// Returns true once `dispose` has run.
    #[inline]
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    struct Probe {
        id: NodeId,
        disposed: Cell<bool>,
        log: Rc<RefCell<Vec<NodeId>>>,
    }

    impl Node for Probe {
        fn id(&self) -> NodeId {
            self.id
        }

        fn dispose(&self) {
            self.disposed.set(true);
            self.log.borrow_mut().push(self.id);
        }

        fn is_disposed(&self) -> bool {
            self.disposed.get()
        }
    }

    fn probe(ctx: &OperationContext, log: &Rc<RefCell<Vec<NodeId>>>) -> Rc<Probe> {
        let node = Rc::new(Probe {
            id: ctx.next_id(),
            disposed: Cell::new(false),
            log: log.clone(),
        });
        ctx.track(&node);
        node
    }

    #[test]
    fn test_context_ids() {
        let ctx = OperationContext::new();
        assert_eq!(ctx.next_id(), 0);
        assert_eq!(ctx.next_id(), 1);

        // Contexts are independent.
        let other = OperationContext::new();
        assert_eq!(other.next_id(), 0);
    }

    #[test]
    fn test_context_dispose_downstream_first() {
        let ctx = OperationContext::new();
        let log = Rc::new(RefCell::new(vec![]));
        let a = probe(&ctx, &log);
        let b = probe(&ctx, &log);
        let c = probe(&ctx, &log);
        assert_eq!(ctx.node_count(), 3);

        ctx.dispose();
        assert_eq!(*log.borrow(), vec![2, 1, 0]);
        assert!(a.is_disposed() && b.is_disposed() && c.is_disposed());

        ctx.dispose();
        assert_eq!(log.borrow().len(), 3);
        assert!(ctx.is_disposed());
    }

    #[test]
    fn test_context_skips_dropped_nodes() {
        let ctx = OperationContext::new();
        let log = Rc::new(RefCell::new(vec![]));
        let keep = probe(&ctx, &log);
        drop(probe(&ctx, &log));

        assert_eq!(ctx.node_count(), 1);
        ctx.dispose();
        assert_eq!(*log.borrow(), vec![keep.id()]);
    }

    #[test]
    fn test_context_share_deduplicates() {
        let ctx = OperationContext::new();
        let log = Rc::new(RefCell::new(vec![]));

        let first = ctx.share("source|where", || probe(&ctx, &log)).unwrap();
        let second = ctx.share("source|where", || probe(&ctx, &log)).unwrap();
        assert!(Rc::ptr_eq(&first, &second));
        assert_eq!(ctx.next_id(), 1);

        let wrong: Result<Rc<u32>> = ctx.share("source|where", || Rc::new(5u32));
        assert!(wrong.is_err());
    }

    #[test]
    fn test_context_share_after_dispose() {
        let ctx = OperationContext::new();
        ctx.dispose();
        let result = ctx.share("k", || Rc::new(1u8));
        assert!(result.is_err());
    }
}
