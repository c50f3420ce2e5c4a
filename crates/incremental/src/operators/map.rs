//! Incremental projection operator.

use crate::change::Change;
use crate::dataflow::{Downstream, Link, Node, OperationContext, Pump, Sequence};
use crate::element::{Element, WatchRegistry};
use alloc::boxed::Box;
use alloc::rc::{Rc, Weak};
use alloc::vec::Vec;
use core::cell::{Cell, RefCell};
use tidal_core::{FieldChange, FieldId, Item, NodeId, Observer, Publisher, SubscriptionId, Value};

/// Mapper function projecting an element.
pub type MapperFn<T, U> = Box<dyn Fn(&T) -> U>;

struct ProjectState<T, U> {
    /// Upstream mirror paired with each element's projection
    source: Vec<(T, U)>,
    watches: WatchRegistry<T>,
}

/// Projects every upstream element through a mapper, position for position.
///
/// A field change on a watched element re-runs the mapper and publishes a
/// `Replace` wherever the projection actually changed.
pub struct Select<T: Element, U> {
    id: NodeId,
    this: Weak<Self>,
    upstream: Rc<dyn Sequence<T>>,
    upstream_sub: Cell<Option<SubscriptionId>>,
    mapper: MapperFn<T, U>,
    state: RefCell<ProjectState<T, U>>,
    pump: Pump<T>,
    publisher: Publisher<Change<U>>,
    disposed: Cell<bool>,
}

impl<T, U> Select<T, U>
where
    T: Element,
    U: Clone + PartialEq + 'static,
{
    /// Builds the projection over `upstream` and evaluates it once.
    pub fn new<F>(ctx: &OperationContext, upstream: Rc<dyn Sequence<T>>, mapper: F) -> Rc<Self>
    where
        F: Fn(&T) -> U + 'static,
    {
        let node = Rc::new_cyclic(|this| Self {
            id: ctx.next_id(),
            this: this.clone(),
            upstream,
            upstream_sub: Cell::new(None),
            mapper: Box::new(mapper),
            state: RefCell::new(ProjectState {
                source: Vec::new(),
                watches: WatchRegistry::new(),
            }),
            pump: Pump::new(),
            publisher: Publisher::new(),
            disposed: Cell::new(false),
        });

        let initial = node.upstream.snapshot();
        {
            let mut state = node.state.borrow_mut();
            for item in initial {
                node.watch(&mut state, &item);
                let projected = (node.mapper)(&item);
                state.source.push((item, projected));
            }
        }
        let sub = node.upstream.subscribe(Box::new(Link::new(Rc::downgrade(&node))));
        node.upstream_sub.set(Some(sub));
        ctx.track(&node);
        tracing::debug!(node = node.id, "select built");
        node
    }

    fn watch(&self, state: &mut ProjectState<T, U>, item: &T) {
        let this = self.this.clone();
        state.watches.acquire(item, move || {
            Box::new(move |change: &FieldChange| {
                if let Some(node) = this.upgrade() {
                    node.on_field_change(change);
                }
            })
        });
    }

    fn on_field_change(&self, change: &FieldChange) {
        let item = match self.state.borrow().watches.element(change.item) {
            Some(item) => item.clone(),
            None => return,
        };
        self.pump.run(
            Change::FieldChange {
                item,
                field: change.field,
                old: change.old.clone(),
                new: change.new.clone(),
            },
            |c| self.apply(c),
        );
    }

    fn apply(&self, change: Change<T>) {
        if self.disposed.get() {
            return;
        }
        let mut out = Vec::new();
        {
            let mut state = self.state.borrow_mut();
            match change {
                Change::Insert { index, item } => {
                    self.watch(&mut state, &item);
                    let projected = (self.mapper)(&item);
                    state.source.insert(index, (item, projected.clone()));
                    out.push(Change::Insert { index, item: projected });
                }
                Change::Remove { index, .. } => {
                    let (item, projected) = state.source.remove(index);
                    state.watches.release(&item);
                    out.push(Change::Remove { index, item: projected });
                }
                Change::Replace { index, new, .. } => {
                    self.watch(&mut state, &new);
                    let projected = (self.mapper)(&new);
                    let (old, old_projected) =
                        core::mem::replace(&mut state.source[index], (new, projected.clone()));
                    state.watches.release(&old);
                    out.push(Change::Replace {
                        index,
                        old: old_projected,
                        new: projected,
                    });
                }
                Change::Move { from, to, .. } => {
                    let entry = state.source.remove(from);
                    let projected = entry.1.clone();
                    state.source.insert(to, entry);
                    out.push(Change::Move {
                        from,
                        to,
                        item: projected,
                    });
                }
                Change::Reset { items } => {
                    state.watches.release_all();
                    state.source.clear();
                    for item in items {
                        self.watch(&mut state, &item);
                        let projected = (self.mapper)(&item);
                        state.source.push((item, projected));
                    }
                    out.push(Change::Reset {
                        items: state.source.iter().map(|(_, p)| p.clone()).collect(),
                    });
                }
                Change::FieldChange { item, .. } => {
                    let id = item.element_id();
                    let projected = (self.mapper)(&item);
                    for (index, entry) in state.source.iter_mut().enumerate() {
                        if entry.0.element_id() != id || entry.1 == projected {
                            continue;
                        }
                        let old = core::mem::replace(&mut entry.1, projected.clone());
                        out.push(Change::Replace {
                            index,
                            old,
                            new: projected.clone(),
                        });
                    }
                }
            }
        }
        for change in &out {
            tracing::trace!(node = self.id, kind = change.kind(), "select publish");
            self.publisher.publish(change);
        }
    }
}

impl Select<Item, Value> {
    /// Projects a single field of each item.
    pub fn field(ctx: &OperationContext, upstream: Rc<dyn Sequence<Item>>, field: FieldId) -> Rc<Self> {
        Self::new(ctx, upstream, move |item: &Item| item.get(field).unwrap_or(Value::Null))
    }
}

impl<T, U> Downstream<T> for Select<T, U>
where
    T: Element,
    U: Clone + PartialEq + 'static,
{
    fn on_upstream(&self, change: &Change<T>) {
        self.pump.run(change.clone(), |c| self.apply(c));
    }

    fn on_upstream_detached(&self) {
        self.upstream_sub.set(None);
    }
}

impl<T, U> Sequence<U> for Select<T, U>
where
    T: Element,
    U: Clone + PartialEq + 'static,
{
    fn snapshot(&self) -> Vec<U> {
        self.state.borrow().source.iter().map(|(_, p)| p.clone()).collect()
    }

    fn len(&self) -> usize {
        self.state.borrow().source.len()
    }

    fn get(&self, index: usize) -> Option<U> {
        self.state.borrow().source.get(index).map(|(_, p)| p.clone())
    }

    fn subscribe(&self, observer: Box<dyn Observer<Change<U>>>) -> SubscriptionId {
        self.publisher.subscribe_boxed(observer)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.publisher.unsubscribe(id)
    }
}

impl<T, U> Node for Select<T, U>
where
    T: Element,
    U: Clone + PartialEq + 'static,
{
    fn id(&self) -> NodeId {
        self.id
    }

    fn dispose(&self) {
        if self.disposed.replace(true) {
            return;
        }
        if let Some(sub) = self.upstream_sub.take() {
            let released = self.upstream.unsubscribe(sub);
            assert!(released, "select node {} lost its upstream subscription", self.id);
        }
        self.pump.clear();
        {
            let mut state = self.state.borrow_mut();
            state.watches.release_all();
            state.source.clear();
        }
        self.publisher.detach_all();
        tracing::debug!(node = self.id, "select disposed");
    }

    fn is_disposed(&self) -> bool {
        self.disposed.get()
    }
}
