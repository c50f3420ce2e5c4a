//! Observable source collections.
//!
//! `ObservableVec` is the root of an operator graph: an ordered, mutable
//! collection that publishes exactly one `Change` per mutation.

use crate::change::Change;
use crate::dataflow::Sequence;
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::{Cell, RefCell};
use tidal_core::{Error, Observer, Publisher, Result, SubscriptionId};

/// Marks a source as propagating for the duration of one mutation.
struct PropagationGuard<'a>(&'a Cell<bool>);

impl Drop for PropagationGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

/// An ordered collection that notifies subscribers of every mutation.
///
/// Propagation is synchronous: a mutating call returns only after every
/// subscriber (and, transitively, every downstream operator) has processed
/// the change. Mutating the same collection from inside that propagation is
/// rejected with `Error::Reentrancy` and leaves the collection untouched.
pub struct ObservableVec<T> {
    items: RefCell<Vec<T>>,
    publisher: Publisher<Change<T>>,
    propagating: Cell<bool>,
}

impl<T: Clone + 'static> Default for ObservableVec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + 'static> ObservableVec<T> {
    /// Creates an empty collection.
    pub fn new() -> Self {
        Self::from_vec(Vec::new())
    }

    /// Creates a collection holding `items`.
    pub fn from_vec(items: Vec<T>) -> Self {
        Self {
            items: RefCell::new(items),
            publisher: Publisher::new(),
            propagating: Cell::new(false),
        }
    }

    fn enter(&self) -> Result<PropagationGuard<'_>> {
        if self.propagating.get() {
            tracing::warn!("rejected reentrant mutation of source collection");
            return Err(Error::reentrancy("source collection"));
        }
        self.propagating.set(true);
        Ok(PropagationGuard(&self.propagating))
    }

    /// Appends an item.
    pub fn push(&self, item: T) -> Result<()> {
        let index = self.items.borrow().len();
        self.insert(index, item)
    }

    /// Inserts an item at `index`.
    pub fn insert(&self, index: usize, item: T) -> Result<()> {
        let _guard = self.enter()?;
        {
            let mut items = self.items.borrow_mut();
            if index > items.len() {
                return Err(Error::index_out_of_bounds(index, items.len()));
            }
            items.insert(index, item.clone());
        }
        self.publisher.publish(&Change::Insert { index, item });
        Ok(())
    }

    /// Removes and returns the item at `index`.
    pub fn remove(&self, index: usize) -> Result<T> {
        let _guard = self.enter()?;
        let item = {
            let mut items = self.items.borrow_mut();
            if index >= items.len() {
                return Err(Error::index_out_of_bounds(index, items.len()));
            }
            items.remove(index)
        };
        self.publisher.publish(&Change::Remove {
            index,
            item: item.clone(),
        });
        Ok(item)
    }

    /// Replaces the item at `index`, returning the old one.
    pub fn replace(&self, index: usize, item: T) -> Result<T> {
        let _guard = self.enter()?;
        let old = {
            let mut items = self.items.borrow_mut();
            let len = items.len();
            let slot = items
                .get_mut(index)
                .ok_or_else(|| Error::index_out_of_bounds(index, len))?;
            core::mem::replace(slot, item.clone())
        };
        self.publisher.publish(&Change::Replace {
            index,
            old: old.clone(),
            new: item,
        });
        Ok(old)
    }

    /// Moves the item at `from` so that it ends up at `to`.
    pub fn move_item(&self, from: usize, to: usize) -> Result<()> {
        let _guard = self.enter()?;
        let item = {
            let mut items = self.items.borrow_mut();
            let len = items.len();
            if from >= len {
                return Err(Error::index_out_of_bounds(from, len));
            }
            if to >= len {
                return Err(Error::index_out_of_bounds(to, len));
            }
            if from == to {
                return Ok(());
            }
            let item = items.remove(from);
            items.insert(to, item.clone());
            item
        };
        self.publisher.publish(&Change::Move { from, to, item });
        Ok(())
    }

    /// Replaces the whole content.
    pub fn reset(&self, items: Vec<T>) -> Result<()> {
        let _guard = self.enter()?;
        *self.items.borrow_mut() = items.clone();
        self.publisher.publish(&Change::Reset { items });
        Ok(())
    }

    /// Removes every item.
    pub fn clear(&self) -> Result<()> {
        self.reset(Vec::new())
    }

    /// Returns true while a mutation is propagating.
    #[inline]
    pub fn is_propagating(&self) -> bool {
        self.propagating.get()
    }

    /// Returns the number of subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.publisher.len()
    }
}

impl<T: Clone + 'static> Sequence<T> for ObservableVec<T> {
    fn snapshot(&self) -> Vec<T> {
        self.items.borrow().clone()
    }

    fn len(&self) -> usize {
        self.items.borrow().len()
    }

    fn get(&self, index: usize) -> Option<T> {
        self.items.borrow().get(index).cloned()
    }

    fn subscribe(&self, observer: Box<dyn Observer<Change<T>>>) -> SubscriptionId {
        self.publisher.subscribe_boxed(observer)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.publisher.unsubscribe(id)
    }
}
