//! Incremental grouping operator.
//!
//! `GroupBy` keeps a table of groups over its upstream: one group per
//! distinct key, enumerated in first-occurrence order (the order in which
//! each key first appears scanning the source front to back), with members
//! in relative source order. Every upstream change, and every field change
//! of a tracked element, is translated into member changes on the affected
//! groups plus structural changes to the group sequence itself.
//!
//! The table always equals what a fresh scan of the current source would
//! build. Groups exist only while they have members: a group emptied by a
//! removal or a rekey is removed from the output and closed.
//!
//! Each group records the source positions of its members, so locating a
//! member or a group's first occurrence never scans the source. A change
//! is carried out as a queue of steps. Each step makes one visible edit and
//! is published before the next one starts, so a subscriber reading the
//! operator from a callback sees exactly the state its notification
//! describes.

use super::group::Group;
use crate::change::Change;
use crate::dataflow::{Downstream, Link, Node, OperationContext, Pump, Sequence};
use crate::element::{Element, ElementId, WatchRegistry};
use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::format;
use alloc::rc::{Rc, Weak};
use alloc::vec;
use alloc::vec::Vec;
use core::cell::{Cell, RefCell};
use core::hash::Hash;
use hashbrown::HashMap;
use tidal_core::{
    Error, FieldChange, FieldId, Item, NodeId, Observer, Publisher, Result, SubscriptionId, Value,
};

/// Fallible function computing the grouping key of an element.
pub type KeySelector<T, K> = Box<dyn Fn(&T) -> Result<K>>;

/// Something to publish once the table borrow has been released.
enum Emission<K, T> {
    Groups(Change<Rc<Group<K, T>>>),
    Member(Rc<Group<K, T>>, Change<T>),
    Closed(Rc<Group<K, T>>),
    Failed(Error),
}

/// One visible edit of the table.
enum Step<K, T> {
    /// Count an occurrence of an element entering the source
    Track(T),
    Untrack(T),
    Place { index: usize, item: T },
    Unplace { index: usize },
    Replace { index: usize, item: T },
    Relocate { from: usize, to: usize },
    Rekey { item: T, field: FieldId },
    Leave { key: Option<K>, index: usize },
    Join { key: Option<K>, index: usize },
    /// Put a group whose first member changed back in first-occurrence order
    Reorder(Rc<Group<K, T>>),
    /// Drop the last member of a group already gone from the table, then close it
    Retire(Rc<Group<K, T>>, ElementId),
    Rebuild(Vec<T>),
}

/// What a step publishes, and the steps that must run right after it.
struct Turn<K, T> {
    out: Vec<Emission<K, T>>,
    then: Vec<Step<K, T>>,
}

struct Bucket<K, T> {
    group: Rc<Group<K, T>>,
    /// Source positions of the members, ascending
    positions: Vec<usize>,
}

struct GroupTable<K, T> {
    /// Upstream mirror
    source: Vec<T>,
    /// Groups in enumeration order; each group's rank is its index here
    groups: Vec<Rc<Group<K, T>>>,
    by_key: HashMap<K, Bucket<K, T>>,
    /// Positions of the elements whose selector failed, ascending
    unkeyed: Vec<usize>,
    /// Current key of every tracked element, None while its selector fails
    keys: HashMap<ElementId, Option<K>>,
    watches: WatchRegistry<T>,
}

impl<K, T> GroupTable<K, T>
where
    K: Clone + Eq + Hash + 'static,
    T: Element,
{
    fn new() -> Self {
        Self {
            source: Vec::new(),
            groups: Vec::new(),
            by_key: HashMap::new(),
            unkeyed: Vec::new(),
            keys: HashMap::new(),
            watches: WatchRegistry::new(),
        }
    }

    fn key_of(&self, item: &T) -> Option<&K> {
        self.keys.get(&item.element_id()).and_then(Option::as_ref)
    }

    fn key_at(&self, index: usize) -> Option<K> {
        self.key_of(&self.source[index]).cloned()
    }

    fn bucket(&self, key: &K) -> &Bucket<K, T> {
        self.by_key
            .get(key)
            .unwrap_or_else(|| panic!("key present in the source has no group"))
    }

    fn positions(&self, key: Option<&K>) -> &[usize] {
        match key {
            Some(key) => &self.bucket(key).positions,
            None => &self.unkeyed,
        }
    }

    fn positions_mut(&mut self, key: Option<&K>) -> &mut Vec<usize> {
        match key {
            Some(key) => match self.by_key.get_mut(key) {
                Some(bucket) => &mut bucket.positions,
                None => panic!("key present in the source has no group"),
            },
            None => &mut self.unkeyed,
        }
    }

    /// Source position of the first member of `group`.
    fn first(&self, group: &Group<K, T>) -> usize {
        self.bucket(group.key()).positions[0]
    }

    /// Rank a group whose first member sits at `first` belongs at.
    fn slot_for(&self, first: usize) -> usize {
        self.groups.partition_point(|g| self.first(g) < first)
    }

    fn renumber(&self, from: usize) {
        for (rank, group) in self.groups.iter().enumerate().skip(from) {
            group.set_rank(rank);
        }
    }

    /// Takes `group` out of the group sequence and returns its old rank.
    fn unlink(&mut self, group: &Rc<Group<K, T>>) -> usize {
        let rank = group.rank();
        let removed = self.groups.remove(rank);
        assert!(Rc::ptr_eq(&removed, group), "group {} has a stale rank", rank);
        self.renumber(rank);
        rank
    }

    /// Moves every recorded position in `lo..hi` one place up or down.
    fn shift(&mut self, lo: usize, hi: usize, up: bool) {
        for bucket in self.by_key.values_mut() {
            nudge(&mut bucket.positions, lo, hi, up);
        }
        nudge(&mut self.unkeyed, lo, hi, up);
    }

    fn clear(&mut self) -> Vec<Rc<Group<K, T>>> {
        self.watches.release_all();
        self.source.clear();
        self.by_key.clear();
        self.unkeyed.clear();
        self.keys.clear();
        core::mem::take(&mut self.groups)
    }
}

fn nudge(positions: &mut [usize], lo: usize, hi: usize, up: bool) {
    let start = positions.partition_point(|&p| p < lo);
    for p in positions[start..].iter_mut().take_while(|p| **p < hi) {
        if up {
            *p += 1;
        } else {
            *p -= 1;
        }
    }
}

/// Index of source position `index` in a sorted position list.
fn member_index(positions: &[usize], index: usize) -> usize {
    positions
        .binary_search(&index)
        .unwrap_or_else(|_| panic!("source position {} is not recorded in its group", index))
}

/// Finishes the steps left by a subscriber that panicked mid-change, so
/// the table stays consistent. Nothing further is published.
struct Finish<'a, K, T>
where
    K: Clone + Eq + Hash + 'static,
    T: Element,
{
    node: &'a GroupBy<K, T>,
    done: bool,
}

impl<K, T> Drop for Finish<'_, K, T>
where
    K: Clone + Eq + Hash + 'static,
    T: Element,
{
    fn drop(&mut self) {
        if self.done {
            return;
        }
        tracing::warn!(node = self.node.id, "subscriber failed mid-change, finishing silently");
        while let Some(step) = self.node.next_step() {
            for emission in self.node.perform(step) {
                if let Emission::Closed(group) = emission {
                    group.close();
                }
            }
        }
    }
}

/// Groups upstream elements by a key.
///
/// The output is a sequence of `Group` handles. Structural changes to that
/// sequence (a group opened, closed or reordered) go to this node's
/// subscribers; membership changes go to each group's own subscribers.
///
/// A key selector failure is isolated to the element it failed on: the
/// element stays in the upstream mirror but belongs to no group until a
/// later field change yields a key, and the error goes to `on_error`
/// observers.
pub struct GroupBy<K, T: Element> {
    id: NodeId,
    this: Weak<Self>,
    upstream: Rc<dyn Sequence<T>>,
    upstream_sub: Cell<Option<SubscriptionId>>,
    selector: KeySelector<T, K>,
    /// Fields the selector reads; None means any field may change the key
    key_fields: Option<Vec<FieldId>>,
    table: RefCell<GroupTable<K, T>>,
    steps: RefCell<VecDeque<Step<K, T>>>,
    pump: Pump<T>,
    publisher: Publisher<Change<Rc<Group<K, T>>>>,
    errors: Publisher<Error>,
    disposed: Cell<bool>,
}

impl<K, T> GroupBy<K, T>
where
    K: Clone + Eq + Hash + 'static,
    T: Element,
{
    /// Groups `upstream` by `selector`.
    pub fn new<F>(ctx: &OperationContext, upstream: Rc<dyn Sequence<T>>, selector: F) -> Rc<Self>
    where
        F: Fn(&T) -> Result<K> + 'static,
    {
        Self::build(ctx, upstream, Box::new(selector), None)
    }

    /// Groups `upstream` by a selector reading only `fields`. Field changes
    /// outside `fields` skip key recomputation.
    pub fn with_fields<F>(
        ctx: &OperationContext,
        upstream: Rc<dyn Sequence<T>>,
        fields: Vec<FieldId>,
        selector: F,
    ) -> Rc<Self>
    where
        F: Fn(&T) -> Result<K> + 'static,
    {
        Self::build(ctx, upstream, Box::new(selector), Some(fields))
    }

    fn build(
        ctx: &OperationContext,
        upstream: Rc<dyn Sequence<T>>,
        selector: KeySelector<T, K>,
        key_fields: Option<Vec<FieldId>>,
    ) -> Rc<Self> {
        let node = Rc::new_cyclic(|this| Self {
            id: ctx.next_id(),
            this: this.clone(),
            upstream,
            upstream_sub: Cell::new(None),
            selector,
            key_fields,
            table: RefCell::new(GroupTable::new()),
            steps: RefCell::new(VecDeque::new()),
            pump: Pump::new(),
            publisher: Publisher::new(),
            errors: Publisher::new(),
            disposed: Cell::new(false),
        });

        let initial = node.upstream.snapshot();
        let mut failures = Vec::new();
        node.scan(&mut node.table.borrow_mut(), initial, &mut failures);
        let sub = node.upstream.subscribe(Box::new(Link::new(Rc::downgrade(&node))));
        node.upstream_sub.set(Some(sub));
        ctx.track(&node);
        tracing::debug!(
            node = node.id,
            groups = node.len(),
            unkeyed = failures.len(),
            "group by built"
        );
        node
    }

    /// Returns the current groups in enumeration order.
    pub fn groups(&self) -> Vec<Rc<Group<K, T>>> {
        self.table.borrow().groups.clone()
    }

    /// Returns the group for `key`, if any element currently has that key.
    pub fn group(&self, key: &K) -> Option<Rc<Group<K, T>>> {
        self.table.borrow().by_key.get(key).map(|bucket| bucket.group.clone())
    }

    /// Returns the elements that belong to no group because their key
    /// selector failed, in source order.
    pub fn unkeyed(&self) -> Vec<T> {
        let table = self.table.borrow();
        table.unkeyed.iter().map(|&p| table.source[p].clone()).collect()
    }

    /// Registers an observer for key selector failures.
    pub fn on_error<O>(&self, observer: O) -> SubscriptionId
    where
        O: Observer<Error> + 'static,
    {
        self.errors.subscribe(observer)
    }

    /// Removes an error observer. Returns false if the ID is unknown.
    pub fn off_error(&self, id: SubscriptionId) -> bool {
        self.errors.unsubscribe(id)
    }

    fn select(&self, item: &T, out: &mut Vec<Emission<K, T>>) -> Option<K> {
        match (self.selector)(item) {
            Ok(key) => Some(key),
            Err(error) => {
                tracing::warn!(node = self.id, item = item.element_id(), %error, "key selector failed");
                out.push(Emission::Failed(error));
                None
            }
        }
    }

    /// Counts one more occurrence of `item`, watching it and computing its
    /// key on the first one.
    fn track(&self, table: &mut GroupTable<K, T>, item: &T, out: &mut Vec<Emission<K, T>>) {
        let this = self.this.clone();
        let first = table.watches.acquire(item, move || {
            Box::new(move |change: &FieldChange| {
                if let Some(node) = this.upgrade() {
                    node.on_field_change(change);
                }
            })
        });
        if first {
            let key = self.select(item, out);
            table.keys.insert(item.element_id(), key);
        }
    }

    fn untrack(table: &mut GroupTable<K, T>, item: &T) {
        if table.watches.release(item) {
            table.keys.remove(&item.element_id());
        }
    }

    /// Builds the table from scratch, in one pass over `items`.
    fn scan(&self, table: &mut GroupTable<K, T>, items: Vec<T>, out: &mut Vec<Emission<K, T>>) {
        for item in items {
            self.track(table, &item, out);
            let index = table.source.len();
            let key = table.key_of(&item).cloned();
            table.source.push(item.clone());
            let Some(key) = key else {
                table.unkeyed.push(index);
                continue;
            };
            match table.by_key.get_mut(&key) {
                Some(bucket) => {
                    bucket.positions.push(index);
                    bucket.group.push_member(item);
                }
                None => {
                    let group = Group::new(key.clone(), vec![item]);
                    group.set_rank(table.groups.len());
                    table.groups.push(group.clone());
                    table.by_key.insert(key, Bucket { group, positions: vec![index] });
                }
            }
        }
    }

    /// Records source position `index` as a member of `key`'s group,
    /// opening the group if needed.
    fn join(&self, table: &mut GroupTable<K, T>, key: Option<K>, index: usize, turn: &mut Turn<K, T>) {
        let Some(key) = key else {
            let at = table.unkeyed.partition_point(|&p| p < index);
            table.unkeyed.insert(at, index);
            return;
        };
        let item = table.source[index].clone();
        if let Some(bucket) = table.by_key.get_mut(&key) {
            let at = bucket.positions.partition_point(|&p| p < index);
            bucket.positions.insert(at, index);
            let group = bucket.group.clone();
            turn.out.push(Emission::Member(group.clone(), group.insert_member(at, item)));
            if at == 0 {
                turn.then.push(Step::Reorder(group));
            }
            return;
        }

        let group = Group::new(key.clone(), vec![item]);
        let rank = table.slot_for(index);
        table.by_key.insert(key, Bucket { group: group.clone(), positions: vec![index] });
        table.groups.insert(rank, group.clone());
        table.renumber(rank);
        tracing::debug!(node = self.id, group = group.element_id(), rank, "group opened");
        turn.out.push(Emission::Groups(Change::Insert { index: rank, item: group }));
    }

    /// Takes source position `index` out of `key`'s group. An emptied group
    /// leaves the sequence first and loses its last member in a later step.
    fn leave(table: &mut GroupTable<K, T>, key: Option<K>, index: usize, turn: &mut Turn<K, T>) {
        let Some(key) = key else {
            let at = member_index(&table.unkeyed, index);
            table.unkeyed.remove(at);
            return;
        };
        let id = table.source[index].element_id();
        let bucket = table
            .by_key
            .get_mut(&key)
            .unwrap_or_else(|| panic!("key present in the source has no group"));
        let at = member_index(&bucket.positions, index);
        bucket.positions.remove(at);
        let group = bucket.group.clone();
        if !bucket.positions.is_empty() {
            turn.out.push(Emission::Member(group.clone(), group.remove_member(at, id)));
            if at == 0 {
                turn.then.push(Step::Reorder(group));
            }
            return;
        }

        table.by_key.remove(&key);
        let rank = table.unlink(&group);
        turn.out.push(Emission::Groups(Change::Remove {
            index: rank,
            item: group.clone(),
        }));
        turn.then.push(Step::Retire(group, id));
    }

    fn replace(&self, table: &mut GroupTable<K, T>, index: usize, item: T, turn: &mut Turn<K, T>) {
        let old_key = table.key_at(index);
        if old_key.as_ref() != table.key_of(&item) {
            turn.then.push(Step::Unplace { index });
            turn.then.push(Step::Place { index, item });
            return;
        }
        // Same group, same member index.
        let old = core::mem::replace(&mut table.source[index], item.clone());
        if let Some(key) = &old_key {
            let bucket = table.bucket(key);
            let at = member_index(&bucket.positions, index);
            let group = bucket.group.clone();
            turn.out.push(Emission::Member(group.clone(), group.replace_member(at, item)));
        }
        turn.then.push(Step::Untrack(old));
    }

    fn relocate(table: &mut GroupTable<K, T>, from: usize, to: usize, turn: &mut Turn<K, T>) {
        if from == to {
            return;
        }
        let item = table.source.remove(from);
        table.source.insert(to, item.clone());
        let key = table.key_of(&item).cloned();

        let positions = table.positions_mut(key.as_ref());
        let before = member_index(positions, from);
        positions.remove(before);
        if from < to {
            table.shift(from + 1, to + 1, false);
        } else {
            table.shift(to, from, true);
        }
        let positions = table.positions_mut(key.as_ref());
        let after = positions.partition_point(|&p| p < to);
        positions.insert(after, to);

        let Some(key) = key else { return };
        let group = table.bucket(&key).group.clone();
        if before != after {
            turn.out.push(Emission::Member(group.clone(), group.move_member(before, after)));
        }
        if before == 0 || after == 0 {
            turn.then.push(Step::Reorder(group));
        }
    }

    /// Moves every occurrence of `item` to the group of its recomputed key:
    /// occurrences leave in descending order, then join in ascending order.
    fn rekey(&self, table: &mut GroupTable<K, T>, item: &T, field: FieldId, turn: &mut Turn<K, T>) {
        if let Some(fields) = &self.key_fields {
            if !fields.contains(&field) {
                return;
            }
        }
        let id = item.element_id();
        let old = match table.keys.get(&id) {
            Some(key) => key.clone(),
            None => return,
        };
        let new = self.select(item, &mut turn.out);
        if old == new {
            return;
        }
        tracing::debug!(node = self.id, item = id, field, "element rekeyed");

        let occurrences: Vec<usize> = table
            .positions(old.as_ref())
            .iter()
            .copied()
            .filter(|&p| table.source[p].element_id() == id)
            .collect();
        table.keys.insert(id, new.clone());
        for &index in occurrences.iter().rev() {
            turn.then.push(Step::Leave { key: old.clone(), index });
        }
        for &index in &occurrences {
            turn.then.push(Step::Join { key: new.clone(), index });
        }
    }

    fn reorder(table: &mut GroupTable<K, T>, group: Rc<Group<K, T>>, turn: &mut Turn<K, T>) {
        let current = table
            .by_key
            .get(group.key())
            .map_or(false, |bucket| Rc::ptr_eq(&bucket.group, &group));
        if !current {
            return;
        }
        let from = table.unlink(&group);
        let to = table.slot_for(table.first(&group));
        table.groups.insert(to, group.clone());
        table.renumber(from.min(to));
        if from != to {
            turn.out.push(Emission::Groups(Change::Move { from, to, item: group }));
        }
    }

    fn on_field_change(&self, change: &FieldChange) {
        let item = match self.table.borrow().watches.element(change.item) {
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
        let plan = match change {
            Change::Insert { index, item } => vec![Step::Track(item.clone()), Step::Place { index, item }],
            Change::Remove { index, .. } => vec![Step::Unplace { index }],
            Change::Replace { index, new, .. } => {
                vec![Step::Track(new.clone()), Step::Replace { index, item: new }]
            }
            Change::Move { from, to, .. } => vec![Step::Relocate { from, to }],
            Change::Reset { items } => vec![Step::Rebuild(items)],
            Change::FieldChange { item, field, .. } => vec![Step::Rekey { item, field }],
        };
        self.steps.borrow_mut().extend(plan);

        let mut finish = Finish { node: self, done: false };
        while let Some(step) = self.next_step() {
            let out = self.perform(step);
            self.emit(out);
        }
        finish.done = true;
    }

    fn next_step(&self) -> Option<Step<K, T>> {
        let mut steps = self.steps.borrow_mut();
        if self.disposed.get() {
            steps.clear();
            return None;
        }
        steps.pop_front()
    }

    /// Applies one step to the table and queues its follow-ups in front of
    /// the remaining steps.
    fn perform(&self, step: Step<K, T>) -> Vec<Emission<K, T>> {
        let mut turn = Turn {
            out: Vec::new(),
            then: Vec::new(),
        };
        {
            let mut guard = self.table.borrow_mut();
            let table = &mut *guard;
            match step {
                Step::Track(item) => self.track(table, &item, &mut turn.out),
                Step::Untrack(item) => Self::untrack(table, &item),
                Step::Place { index, item } => {
                    let key = table.key_of(&item).cloned();
                    table.source.insert(index, item);
                    table.shift(index, usize::MAX, true);
                    self.join(table, key, index, &mut turn);
                }
                Step::Unplace { index } => {
                    let key = table.key_at(index);
                    Self::leave(table, key, index, &mut turn);
                    table.shift(index + 1, usize::MAX, false);
                    let item = table.source.remove(index);
                    turn.then.push(Step::Untrack(item));
                }
                Step::Replace { index, item } => self.replace(table, index, item, &mut turn),
                Step::Relocate { from, to } => Self::relocate(table, from, to, &mut turn),
                Step::Rekey { item, field } => self.rekey(table, &item, field, &mut turn),
                Step::Leave { key, index } => Self::leave(table, key, index, &mut turn),
                Step::Join { key, index } => self.join(table, key, index, &mut turn),
                Step::Reorder(group) => Self::reorder(table, group, &mut turn),
                Step::Retire(group, id) => {
                    turn.out.push(Emission::Member(group.clone(), group.remove_member(0, id)));
                    turn.out.push(Emission::Closed(group));
                }
                Step::Rebuild(items) => {
                    let closed = table.clear();
                    self.scan(table, items, &mut turn.out);
                    turn.out.push(Emission::Groups(Change::Reset {
                        items: table.groups.clone(),
                    }));
                    turn.out.extend(closed.into_iter().map(Emission::Closed));
                }
            }
        }
        let mut steps = self.steps.borrow_mut();
        for step in turn.then.into_iter().rev() {
            steps.push_front(step);
        }
        turn.out
    }

    fn emit(&self, out: Vec<Emission<K, T>>) {
        for emission in out {
            match emission {
                Emission::Groups(change) => {
                    tracing::trace!(node = self.id, kind = change.kind(), "group by publish");
                    self.publisher.publish(&change);
                }
                Emission::Member(group, change) => group.publish(&change),
                Emission::Closed(group) => {
                    tracing::debug!(node = self.id, group = group.element_id(), "group closed");
                    group.close();
                }
                Emission::Failed(error) => self.errors.publish(&error),
            }
        }
    }
}

impl GroupBy<Value, Item> {
    /// Groups items by the value of one field.
    pub fn by_field(ctx: &OperationContext, upstream: Rc<dyn Sequence<Item>>, field: FieldId) -> Rc<Self> {
        Self::with_fields(ctx, upstream, vec![field], move |item: &Item| {
            item.get(field)
                .ok_or_else(|| Error::key_selector(item.id(), format!("item has no field {}", field)))
        })
    }
}

impl<K, T> Downstream<T> for GroupBy<K, T>
where
    K: Clone + Eq + Hash + 'static,
    T: Element,
{
    fn on_upstream(&self, change: &Change<T>) {
        self.pump.run(change.clone(), |c| self.apply(c));
    }

    fn on_upstream_detached(&self) {
        self.upstream_sub.set(None);
    }
}

impl<K, T> Sequence<Rc<Group<K, T>>> for GroupBy<K, T>
where
    K: Clone + Eq + Hash + 'static,
    T: Element,
{
    fn snapshot(&self) -> Vec<Rc<Group<K, T>>> {
        self.groups()
    }

    fn len(&self) -> usize {
        self.table.borrow().groups.len()
    }

    fn get(&self, index: usize) -> Option<Rc<Group<K, T>>> {
        self.table.borrow().groups.get(index).cloned()
    }

    fn subscribe(&self, observer: Box<dyn Observer<Change<Rc<Group<K, T>>>>>) -> SubscriptionId {
        self.publisher.subscribe_boxed(observer)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.publisher.unsubscribe(id)
    }
}

impl<K, T> Node for GroupBy<K, T>
where
    K: Clone + Eq + Hash + 'static,
    T: Element,
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
            assert!(released, "group by node {} lost its upstream subscription", self.id);
        }
        self.pump.clear();
        self.steps.borrow_mut().clear();
        let groups = self.table.borrow_mut().clear();
        for group in &groups {
            group.close();
        }
        self.publisher.detach_all();
        self.errors.detach_all();
        tracing::debug!(node = self.id, groups = groups.len(), "group by disposed");
    }

    fn is_disposed(&self) -> bool {
        self.disposed.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataflow::SequenceExt;
    use crate::source::ObservableVec;
    use alloc::string::String;

    fn make_item(group: &str, name: &str) -> Item {
        Item::new(vec![Value::from(group), Value::from(name)])
    }

    fn source_of(pairs: &[(&str, &str)]) -> Rc<ObservableVec<Item>> {
        Rc::new(ObservableVec::from_vec(
            pairs.iter().map(|(g, n)| make_item(g, n)).collect(),
        ))
    }

    fn keys(grouping: &GroupBy<Value, Item>) -> Vec<String> {
        grouping
            .groups()
            .iter()
            .map(|g| g.key().as_str().unwrap_or_default().into())
            .collect()
    }

    fn sizes(grouping: &GroupBy<Value, Item>) -> Vec<usize> {
        grouping.groups().iter().map(|g| g.len()).collect()
    }

    fn names(group: &Group<Value, Item>) -> Vec<String> {
        group
            .snapshot()
            .iter()
            .map(|i| i.get(1).and_then(|v| v.as_str().map(String::from)).unwrap_or_default())
            .collect()
    }

    /// Keys and member names, the way a fresh scan of `source` groups them.
    fn rebuilt(source: &Rc<ObservableVec<Item>>) -> Vec<(Value, Vec<String>)> {
        let ctx = OperationContext::new();
        let fresh = GroupBy::by_field(&ctx, source.clone(), 0);
        let result = fresh
            .groups()
            .iter()
            .map(|g| (g.key().clone(), names(g)))
            .collect();
        ctx.dispose();
        result
    }

    fn current(grouping: &GroupBy<Value, Item>) -> Vec<(Value, Vec<String>)> {
        grouping
            .groups()
            .iter()
            .map(|g| (g.key().clone(), names(g)))
            .collect()
    }

    fn structural_log(grouping: &GroupBy<Value, Item>) -> Rc<RefCell<Vec<Change<Rc<Group<Value, Item>>>>>> {
        let log = Rc::new(RefCell::new(vec![]));
        let l = log.clone();
        grouping.observe(move |c: &Change<Rc<Group<Value, Item>>>| l.borrow_mut().push(c.clone()));
        log
    }

    #[test]
    fn test_group_by_initial_build() {
        let ctx = OperationContext::new();
        let source = source_of(&[("b", "1"), ("a", "2"), ("b", "3"), ("c", "4"), ("a", "5")]);
        let grouping = GroupBy::by_field(&ctx, source.clone(), 0);

        assert_eq!(keys(&grouping), vec!["b", "a", "c"]);
        assert_eq!(sizes(&grouping), vec![2, 2, 1]);
        let a = grouping.group(&Value::from("a")).unwrap();
        assert_eq!(names(&a), vec!["2", "5"]);
        assert!(grouping.group(&Value::from("z")).is_none());
    }

    #[test]
    fn test_group_by_insert_into_existing_group() {
        let ctx = OperationContext::new();
        let source = source_of(&[("a", "1"), ("b", "2"), ("a", "3")]);
        let grouping = GroupBy::by_field(&ctx, source.clone(), 0);
        let structural = structural_log(&grouping);

        let a = grouping.group(&Value::from("a")).unwrap();
        let members = Rc::new(RefCell::new(vec![]));
        let m = members.clone();
        a.observe(move |c: &Change<Item>| m.borrow_mut().push(c.clone()));

        let item = make_item("a", "x");
        source.insert(2, item.clone()).unwrap();

        assert_eq!(names(&a), vec!["1", "x", "3"]);
        assert_eq!(*members.borrow(), vec![Change::Insert { index: 1, item }]);
        assert!(structural.borrow().is_empty());
    }

    #[test]
    fn test_group_by_new_group_placed_by_first_occurrence() {
        let ctx = OperationContext::new();
        let source = source_of(&[("a", "1"), ("b", "2"), ("c", "3")]);
        let grouping = GroupBy::by_field(&ctx, source.clone(), 0);
        let structural = structural_log(&grouping);

        source.insert(1, make_item("d", "4")).unwrap();
        assert_eq!(keys(&grouping), vec!["a", "d", "b", "c"]);

        let log = structural.borrow();
        assert_eq!(log.len(), 1);
        match &log[0] {
            Change::Insert { index, item } => {
                assert_eq!(*index, 1);
                assert_eq!(*item.key(), Value::from("d"));
            }
            other => panic!("unexpected change {:?}", other),
        }
    }

    #[test]
    fn test_group_by_remove_closes_empty_group() {
        let ctx = OperationContext::new();
        let source = source_of(&[("a", "1"), ("b", "2"), ("c", "3"), ("b", "4")]);
        let grouping = GroupBy::by_field(&ctx, source.clone(), 0);
        let structural = structural_log(&grouping);
        let b = grouping.group(&Value::from("b")).unwrap();

        source.remove(3).unwrap();
        assert_eq!(keys(&grouping), vec!["a", "b", "c"]);
        assert!(!b.is_closed());

        source.remove(1).unwrap();
        assert_eq!(keys(&grouping), vec!["a", "c"]);
        assert!(b.is_closed());
        assert!(grouping.group(&Value::from("b")).is_none());
        assert!(matches!(structural.borrow()[0], Change::Remove { index: 1, .. }));
        assert_eq!(structural.borrow().len(), 1);
    }

    #[test]
    fn test_group_by_move_reorders_members_and_groups() {
        let ctx = OperationContext::new();
        let source = source_of(&[("a", "1"), ("b", "2"), ("a", "3"), ("b", "4")]);
        let grouping = GroupBy::by_field(&ctx, source.clone(), 0);
        let structural = structural_log(&grouping);

        // b:4 to the front: member order and group order both change.
        source.move_item(3, 0).unwrap();
        assert_eq!(keys(&grouping), vec!["b", "a"]);
        assert_eq!(names(&grouping.group(&Value::from("b")).unwrap()), vec!["4", "2"]);
        assert!(matches!(structural.borrow()[0], Change::Move { from: 1, to: 0, .. }));
        assert_eq!(current(&grouping), rebuilt(&source));
    }

    #[test]
    fn test_group_by_replace() {
        let ctx = OperationContext::new();
        let source = source_of(&[("a", "1"), ("b", "2")]);
        let grouping = GroupBy::by_field(&ctx, source.clone(), 0);
        let structural = structural_log(&grouping);
        let a = grouping.group(&Value::from("a")).unwrap();

        // Same key: one member replace, group untouched.
        source.replace(0, make_item("a", "9")).unwrap();
        assert_eq!(names(&a), vec!["9"]);
        assert!(structural.borrow().is_empty());

        // Other key: the old group closes, the new one opens in its place.
        source.replace(0, make_item("c", "7")).unwrap();
        assert_eq!(keys(&grouping), vec!["c", "b"]);
        assert!(a.is_closed());
        assert_eq!(structural.borrow().len(), 2);
        assert_eq!(current(&grouping), rebuilt(&source));
    }

    #[test]
    fn test_group_by_rekey_on_field_change() {
        let ctx = OperationContext::new();
        let source = source_of(&[("a", "1"), ("a", "2"), ("b", "3")]);
        let grouping = GroupBy::by_field(&ctx, source.clone(), 0);
        let first = source.get(0).unwrap();

        first.set(0, "b").unwrap();
        assert_eq!(keys(&grouping), vec!["b", "a"]);
        assert_eq!(sizes(&grouping), vec![2, 1]);
        assert_eq!(names(&grouping.group(&Value::from("b")).unwrap()), vec!["1", "3"]);

        // A field the key does not read: nothing moves.
        first.set(1, "renamed").unwrap();
        assert_eq!(sizes(&grouping), vec![2, 1]);
        assert_eq!(current(&grouping), rebuilt(&source));
    }

    #[test]
    fn test_group_by_duplicate_occurrences() {
        let ctx = OperationContext::new();
        let shared = make_item("a", "s");
        let source = Rc::new(ObservableVec::from_vec(vec![
            shared.clone(),
            make_item("b", "1"),
            shared.clone(),
        ]));
        let grouping = GroupBy::by_field(&ctx, source.clone(), 0);
        assert_eq!(sizes(&grouping), vec![2, 1]);
        assert_eq!(shared.watcher_count(), 1);

        shared.set(0, "c").unwrap();
        assert_eq!(keys(&grouping), vec!["c", "b"]);
        assert_eq!(sizes(&grouping), vec![2, 1]);

        source.remove(0).unwrap();
        assert_eq!(keys(&grouping), vec!["b", "c"]);
        assert_eq!(shared.watcher_count(), 1);
        source.remove(1).unwrap();
        assert_eq!(shared.watcher_count(), 0);
        assert_eq!(keys(&grouping), vec!["b"]);
    }

    #[test]
    fn test_group_by_key_selector_failure_is_isolated() {
        let ctx = OperationContext::new();
        let source = Rc::new(ObservableVec::from_vec(vec![
            Item::new(vec![Value::from("a")]),
            Item::new(vec![Value::Null]),
        ]));
        let grouping = GroupBy::<String, Item>::new(&ctx, source.clone(), |item: &Item| {
            item.get(0)
                .and_then(|v| v.as_str().map(String::from))
                .ok_or_else(|| Error::key_selector(item.id(), "no key"))
        });
        assert_eq!(grouping.len(), 1);
        assert_eq!(grouping.unkeyed().len(), 1);

        let errors = Rc::new(RefCell::new(vec![]));
        let e = errors.clone();
        grouping.on_error(move |err: &Error| e.borrow_mut().push(err.clone()));

        let bad = Item::new(vec![Value::Int64(3)]);
        source.push(bad.clone()).unwrap();
        source.push(Item::new(vec![Value::from("b")])).unwrap();
        assert_eq!(grouping.len(), 2);
        assert_eq!(errors.borrow().len(), 1);
        assert!(matches!(errors.borrow()[0], Error::KeySelector { item, .. } if item == bad.id()));

        // Once its key computes, the element joins a group.
        bad.set(0, "a").unwrap();
        assert_eq!(grouping.group(&String::from("a")).unwrap().len(), 2);
        assert_eq!(grouping.unkeyed().len(), 1);
    }

    #[test]
    fn test_group_by_reset() {
        let ctx = OperationContext::new();
        let source = source_of(&[("a", "1"), ("b", "2")]);
        let grouping = GroupBy::by_field(&ctx, source.clone(), 0);
        let structural = structural_log(&grouping);
        let old = grouping.groups();

        source.reset(vec![make_item("c", "3"), make_item("a", "4")]).unwrap();
        assert_eq!(keys(&grouping), vec!["c", "a"]);
        assert!(old.iter().all(|g| g.is_closed()));
        assert!(matches!(&structural.borrow()[0], Change::Reset { items } if items.len() == 2));
    }

    #[test]
    fn test_group_by_field_change_from_subscriber_is_queued() {
        let ctx = OperationContext::new();
        let source = source_of(&[("a", "1"), ("b", "2")]);
        let grouping = GroupBy::by_field(&ctx, source.clone(), 0);
        let second = source.get(1).unwrap();

        // Opening group "c" moves item 2 into it as well, from inside the
        // structural notification.
        let s = second.clone();
        grouping.observe(move |c: &Change<Rc<Group<Value, Item>>>| {
            if let Change::Insert { item, .. } = c {
                if *item.key() == Value::from("c") {
                    s.set(0, "c").unwrap();
                }
            }
        });

        source.push(make_item("c", "3")).unwrap();
        assert_eq!(keys(&grouping), vec!["a", "c"]);
        assert_eq!(names(&grouping.group(&Value::from("c")).unwrap()), vec!["2", "3"]);
        assert_eq!(current(&grouping), rebuilt(&source));
    }

    #[test]
    fn test_group_by_dispose_releases_everything() {
        let ctx = OperationContext::new();
        let source = source_of(&[("a", "1"), ("b", "2")]);
        let grouping = GroupBy::by_field(&ctx, source.clone(), 0);
        let groups = grouping.groups();

        ctx.dispose();
        assert!(grouping.is_disposed());
        assert!(grouping.is_empty());
        assert!(groups.iter().all(|g| g.is_closed()));
        assert_eq!(source.subscriber_count(), 0);
        assert!(source.snapshot().iter().all(|i| i.watcher_count() == 0));

        // Mutations after teardown reach nobody.
        source.push(make_item("c", "3")).unwrap();
        assert!(grouping.is_empty());
    }

    #[test]
    fn test_group_by_state_matches_each_notification() {
        let ctx = OperationContext::new();
        let source = source_of(&[("a", "1"), ("a", "2"), ("b", "3")]);
        let grouping = GroupBy::by_field(&ctx, source.clone(), 0);
        let structural = structural_log(&grouping);

        // Read from inside group a's member notification, the sequence has
        // not gained "c" yet.
        let seen = Rc::new(RefCell::new(vec![]));
        let (s, g) = (seen.clone(), Rc::downgrade(&grouping));
        let a = grouping.group(&Value::from("a")).unwrap();
        a.observe(move |c: &Change<Item>| {
            if let (Change::Remove { .. }, Some(grouping)) = (c, g.upgrade()) {
                s.borrow_mut().push(keys(&grouping));
            }
        });

        source.get(0).unwrap().set(0, "c").unwrap();
        assert_eq!(*seen.borrow(), vec![vec!["a", "b"]]);
        assert_eq!(keys(&grouping), vec!["c", "a", "b"]);
        let log = structural.borrow();
        assert_eq!(log.len(), 1);
        assert!(matches!(log[0], Change::Insert { index: 0, .. }));
    }

    #[test]
    fn test_group_by_many_distinct_keys() {
        let ctx = OperationContext::new();
        let labels: Vec<String> = (0..300).map(|n| format!("k{}", n)).collect();
        let source = Rc::new(ObservableVec::from_vec(
            labels.iter().map(|k| make_item(k, k)).collect(),
        ));
        let grouping = GroupBy::by_field(&ctx, source.clone(), 0);
        let structural = structural_log(&grouping);

        source.insert(0, make_item("new", "n")).unwrap();
        assert_eq!(grouping.len(), 301);
        assert_eq!(structural.borrow().len(), 1);
        assert!(matches!(structural.borrow()[0], Change::Insert { index: 0, .. }));

        source.insert(150, make_item("k7", "x")).unwrap();
        source.move_item(300, 1).unwrap();
        source.remove(0).unwrap();
        source.replace(40, make_item("k250", "y")).unwrap();
        assert_eq!(current(&grouping), rebuilt(&source));
        for (rank, group) in grouping.groups().iter().enumerate() {
            assert_eq!(group.rank(), rank);
        }
    }
}
