//! Incremental filter operator.

use crate::change::Change;
use crate::dataflow::{Downstream, Link, Node, OperationContext, Pump, Sequence};
use crate::element::{Element, WatchRegistry};
use alloc::boxed::Box;
use alloc::rc::{Rc, Weak};
use alloc::vec::Vec;
use core::cell::{Cell, RefCell};
use tidal_core::{FieldChange, NodeId, Observer, Publisher, SubscriptionId};

/// Predicate deciding which elements pass.
pub type PredicateFn<T> = Box<dyn Fn(&T) -> bool>;

struct FilterState<T> {
    /// Upstream mirror with the predicate result for each position
    source: Vec<(T, bool)>,
    watches: WatchRegistry<T>,
}

impl<T: Element> FilterState<T> {
    /// Output index of upstream position `end`: passing entries before it.
    fn output_index(&self, end: usize) -> usize {
        self.source[..end].iter().filter(|(_, pass)| *pass).count()
    }

    fn passing(&self) -> Vec<T> {
        self.source
            .iter()
            .filter(|(_, pass)| *pass)
            .map(|(item, _)| item.clone())
            .collect()
    }
}

/// Keeps the upstream elements satisfying a predicate, in upstream order.
///
/// The predicate is re-evaluated when a watched element's field changes, so
/// an element enters or leaves the output as soon as its fields say so.
pub struct Where<T: Element> {
    id: NodeId,
    this: Weak<Self>,
    upstream: Rc<dyn Sequence<T>>,
    upstream_sub: Cell<Option<SubscriptionId>>,
    predicate: PredicateFn<T>,
    state: RefCell<FilterState<T>>,
    pump: Pump<T>,
    publisher: Publisher<Change<T>>,
    disposed: Cell<bool>,
}

impl<T: Element> Where<T> {
    /// Builds the filter over `upstream` and evaluates it once.
    pub fn new<F>(ctx: &OperationContext, upstream: Rc<dyn Sequence<T>>, predicate: F) -> Rc<Self>
    where
        F: Fn(&T) -> bool + 'static,
    {
        let node = Rc::new_cyclic(|this| Self {
            id: ctx.next_id(),
            this: this.clone(),
            upstream,
            upstream_sub: Cell::new(None),
            predicate: Box::new(predicate),
            state: RefCell::new(FilterState {
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
                let pass = (node.predicate)(&item);
                state.source.push((item, pass));
            }
        }
        let sub = node.upstream.subscribe(Box::new(Link::new(Rc::downgrade(&node))));
        node.upstream_sub.set(Some(sub));
        ctx.track(&node);
        tracing::debug!(node = node.id, len = node.len(), "where built");
        node
    }

    fn watch(&self, state: &mut FilterState<T>, item: &T) {
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
                    let pass = (self.predicate)(&item);
                    let at = state.output_index(index);
                    state.source.insert(index, (item.clone(), pass));
                    if pass {
                        out.push(Change::Insert { index: at, item });
                    }
                }
                Change::Remove { index, .. } => {
                    let at = state.output_index(index);
                    let (item, pass) = state.source.remove(index);
                    state.watches.release(&item);
                    if pass {
                        out.push(Change::Remove { index: at, item });
                    }
                }
                Change::Replace { index, new, .. } => {
                    self.watch(&mut state, &new);
                    let pass = (self.predicate)(&new);
                    let at = state.output_index(index);
                    let (old, was) = core::mem::replace(&mut state.source[index], (new.clone(), pass));
                    state.watches.release(&old);
                    match (was, pass) {
                        (true, true) => out.push(Change::Replace { index: at, old, new }),
                        (true, false) => out.push(Change::Remove { index: at, item: old }),
                        (false, true) => out.push(Change::Insert { index: at, item: new }),
                        (false, false) => {}
                    }
                }
                Change::Move { from, to, .. } => {
                    let at_from = state.output_index(from);
                    let entry = state.source.remove(from);
                    let pass = entry.1;
                    let item = entry.0.clone();
                    state.source.insert(to, entry);
                    let at_to = state.output_index(to);
                    if pass && at_from != at_to {
                        out.push(Change::Move {
                            from: at_from,
                            to: at_to,
                            item,
                        });
                    }
                }
                Change::Reset { items } => {
                    state.watches.release_all();
                    state.source.clear();
                    for item in items {
                        self.watch(&mut state, &item);
                        let pass = (self.predicate)(&item);
                        state.source.push((item, pass));
                    }
                    out.push(Change::Reset {
                        items: state.passing(),
                    });
                }
                Change::FieldChange { item, .. } => {
                    let id = item.element_id();
                    let pass = (self.predicate)(&item);
                    for index in 0..state.source.len() {
                        let (current, was) = &state.source[index];
                        if current.element_id() != id || *was == pass {
                            continue;
                        }
                        let at = state.output_index(index);
                        state.source[index].1 = pass;
                        if pass {
                            out.push(Change::Insert { index: at, item: item.clone() });
                        } else {
                            out.push(Change::Remove { index: at, item: item.clone() });
                        }
                    }
                }
            }
        }
        for change in &out {
            tracing::trace!(node = self.id, kind = change.kind(), "where publish");
            self.publisher.publish(change);
        }
    }
}

impl<T: Element> Downstream<T> for Where<T> {
    fn on_upstream(&self, change: &Change<T>) {
        self.pump.run(change.clone(), |c| self.apply(c));
    }

    fn on_upstream_detached(&self) {
        self.upstream_sub.set(None);
    }
}

impl<T: Element> Sequence<T> for Where<T> {
    fn snapshot(&self) -> Vec<T> {
        self.state.borrow().passing()
    }

    fn len(&self) -> usize {
        let state = self.state.borrow();
        state.output_index(state.source.len())
    }

    fn get(&self, index: usize) -> Option<T> {
        self.state
            .borrow()
            .source
            .iter()
            .filter(|(_, pass)| *pass)
            .nth(index)
            .map(|(item, _)| item.clone())
    }

    fn subscribe(&self, observer: Box<dyn Observer<Change<T>>>) -> SubscriptionId {
        self.publisher.subscribe_boxed(observer)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.publisher.unsubscribe(id)
    }
}

impl<T: Element> Node for Where<T> {
    fn id(&self) -> NodeId {
        self.id
    }

    fn dispose(&self) {
        if self.disposed.replace(true) {
            return;
        }
        if let Some(sub) = self.upstream_sub.take() {
            let released = self.upstream.unsubscribe(sub);
            assert!(released, "where node {} lost its upstream subscription", self.id);
        }
        self.pump.clear();
        {
            let mut state = self.state.borrow_mut();
            state.watches.release_all();
            state.source.clear();
        }
        self.publisher.detach_all();
        tracing::debug!(node = self.id, "where disposed");
    }

    fn is_disposed(&self) -> bool {
        self.disposed.get()
    }
}
