//! Groups produced by `GroupBy`.

use crate::change::Change;
use crate::dataflow::Sequence;
use crate::element::{Element, ElementId};
use alloc::boxed::Box;
use alloc::rc::Rc;
use alloc::vec::Vec;
use core::cell::{Cell, RefCell};
use core::fmt;
use tidal_core::{next_item_id, Observer, Publisher, SubscriptionId};

/// The ordered members sharing one key.
///
/// Members keep their relative source order. A group is handed out only
/// while it has at least one member; once `GroupBy` drops it (or is
/// disposed) the group is closed and its subscribers are detached.
pub struct Group<K, T> {
    id: ElementId,
    key: K,
    members: RefCell<Vec<T>>,
    publisher: Publisher<Change<T>>,
    closed: Cell<bool>,
    /// Index in the owning `GroupBy`'s group sequence
    rank: Cell<usize>,
}

impl<K, T: Clone + 'static> Group<K, T> {
    pub(crate) fn new(key: K, members: Vec<T>) -> Rc<Self> {
        Rc::new(Self {
            id: next_item_id(),
            key,
            members: RefCell::new(members),
            publisher: Publisher::new(),
            closed: Cell::new(false),
            rank: Cell::new(0),
        })
    }

    /// Returns the key shared by every member.
    #[inline]
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Returns true once the group left its `GroupBy`.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.get()
    }

    /// Returns the number of subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.publisher.len()
    }

    pub(crate) fn rank(&self) -> usize {
        self.rank.get()
    }

    pub(crate) fn set_rank(&self, rank: usize) {
        self.rank.set(rank);
    }

    pub(crate) fn push_member(&self, item: T) {
        self.members.borrow_mut().push(item);
    }

    pub(crate) fn insert_member(&self, index: usize, item: T) -> Change<T> {
        self.members.borrow_mut().insert(index, item.clone());
        Change::Insert { index, item }
    }

    pub(crate) fn replace_member(&self, index: usize, item: T) -> Change<T> {
        let old = core::mem::replace(&mut self.members.borrow_mut()[index], item.clone());
        Change::Replace { index, old, new: item }
    }

    pub(crate) fn move_member(&self, from: usize, to: usize) -> Change<T> {
        let mut members = self.members.borrow_mut();
        let item = members.remove(from);
        members.insert(to, item.clone());
        Change::Move { from, to, item }
    }

    pub(crate) fn publish(&self, change: &Change<T>) {
        self.publisher.publish(change);
    }

    pub(crate) fn close(&self) {
        if self.closed.replace(true) {
            return;
        }
        self.publisher.detach_all();
    }
}

impl<K, T: Element> Group<K, T> {
    /// Removes the member at `index`, which must be `expected`.
    pub(crate) fn remove_member(&self, index: usize, expected: ElementId) -> Change<T> {
        let item = self.members.borrow_mut().remove(index);
        assert_eq!(
            item.element_id(),
            expected,
            "group {} member {} is not the element being removed",
            self.id,
            index
        );
        Change::Remove { index, item }
    }
}

impl<K, T: Clone + 'static> Sequence<T> for Group<K, T> {
    fn snapshot(&self) -> Vec<T> {
        self.members.borrow().clone()
    }

    fn len(&self) -> usize {
        self.members.borrow().len()
    }

    fn get(&self, index: usize) -> Option<T> {
        self.members.borrow().get(index).cloned()
    }

    fn subscribe(&self, observer: Box<dyn Observer<Change<T>>>) -> SubscriptionId {
        self.publisher.subscribe_boxed(observer)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.publisher.unsubscribe(id)
    }
}

/// Groups compare by identity.
impl<K, T> PartialEq for Group<K, T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<K, T> Eq for Group<K, T> {}

impl<K: fmt::Debug, T> fmt::Debug for Group<K, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Group")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("len", &self.members.borrow().len())
            .field("closed", &self.closed.get())
            .finish()
    }
}

impl<K: 'static, T: 'static> Element for Rc<Group<K, T>> {
    #[inline]
    fn element_id(&self) -> ElementId {
        self.id
    }
}
