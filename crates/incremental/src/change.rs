//! Change notifications.
//!
//! A `Change` describes one mutation of an ordered sequence. Indices are
//! always relative to the state of the sequence being described: the
//! post-mutation state for inserts, the pre-mutation state for removes.
//! A `Move { from, to }` removes at `from` and then inserts at `to`.
//!
//! A `ValueChange` describes a scalar going from `old` to `new`.

use alloc::vec::Vec;
use tidal_core::{FieldId, Value};

/// A change to an ordered sequence, or to a field of one of its elements.
#[derive(Clone, Debug, PartialEq)]
pub enum Change<T> {
    /// `item` now lives at `index`
    Insert { index: usize, item: T },
    /// `item` was removed from `index`
    Remove { index: usize, item: T },
    /// The element at `index` changed from `old` to `new`
    Replace { index: usize, old: T, new: T },
    /// `item` moved from `from` to `to`
    Move { from: usize, to: usize, item: T },
    /// The whole sequence is now `items`
    Reset { items: Vec<T> },
    /// A field of `item` changed in place; the sequence shape is unchanged
    FieldChange {
        item: T,
        field: FieldId,
        old: Value,
        new: Value,
    },
}

impl<T> Change<T> {
    /// Returns a short name of the change kind, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Change::Insert { .. } => "insert",
            Change::Remove { .. } => "remove",
            Change::Replace { .. } => "replace",
            Change::Move { .. } => "move",
            Change::Reset { .. } => "reset",
            Change::FieldChange { .. } => "field",
        }
    }

    /// Returns the net change in sequence length, if it is known without
    /// looking at the sequence.
    pub fn len_delta(&self) -> Option<isize> {
        match self {
            Change::Insert { .. } => Some(1),
            Change::Remove { .. } => Some(-1),
            Change::Replace { .. } | Change::Move { .. } | Change::FieldChange { .. } => Some(0),
            Change::Reset { .. } => None,
        }
    }

    /// Maps the carried elements to a new type, keeping indices.
    pub fn map<U, F>(self, mut f: F) -> Change<U>
    where
        F: FnMut(T) -> U,
    {
        match self {
            Change::Insert { index, item } => Change::Insert { index, item: f(item) },
            Change::Remove { index, item } => Change::Remove { index, item: f(item) },
            Change::Replace { index, old, new } => Change::Replace {
                index,
                old: f(old),
                new: f(new),
            },
            Change::Move { from, to, item } => Change::Move { from, to, item: f(item) },
            Change::Reset { items } => Change::Reset {
                items: items.into_iter().map(f).collect(),
            },
            Change::FieldChange {
                item,
                field,
                old,
                new,
            } => Change::FieldChange {
                item: f(item),
                field,
                old,
                new,
            },
        }
    }
}

impl<T: Clone> Change<T> {
    /// Applies this change to a local copy of the described sequence.
    ///
    /// Panics if the indices do not fit `items`: a mirror that disagrees with
    /// the sequence it mirrors means propagation itself is broken.
    pub fn apply_to(&self, items: &mut Vec<T>) {
        match self {
            Change::Insert { index, item } => {
                assert!(*index <= items.len(), "insert index {} past end {}", index, items.len());
                items.insert(*index, item.clone());
            }
            Change::Remove { index, .. } => {
                assert!(*index < items.len(), "remove index {} past end {}", index, items.len());
                items.remove(*index);
            }
            Change::Replace { index, new, .. } => {
                assert!(*index < items.len(), "replace index {} past end {}", index, items.len());
                items[*index] = new.clone();
            }
            Change::Move { from, to, .. } => {
                assert!(
                    *from < items.len() && *to < items.len(),
                    "move {} -> {} outside {}",
                    from,
                    to,
                    items.len()
                );
                let item = items.remove(*from);
                items.insert(*to, item);
            }
            Change::Reset { items: fresh } => {
                *items = fresh.clone();
            }
            Change::FieldChange { .. } => {}
        }
    }
}

/// A scalar value changed from `old` to `new`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ValueChange<V> {
    pub old: V,
    pub new: V,
}

impl<V> ValueChange<V> {
    /// Creates a new value change.
    #[inline]
    pub fn new(old: V, new: V) -> Self {
        Self { old, new }
    }
}
