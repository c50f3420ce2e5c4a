//! Observable items.
//!
//! An `Item` is a shared record whose fields can change in place. Whoever
//! holds an item may `watch` it and receives a `FieldChange` for every
//! effective field update.

use crate::error::{Error, Result};
use crate::subscription::{Observer, Publisher, SubscriptionId};
use crate::value::Value;
use alloc::boxed::Box;
use alloc::rc::Rc;
use alloc::vec::Vec;
use core::cell::{Cell, RefCell};
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

/// Unique identifier for an item.
pub type ItemId = u64;

/// Position of a field within an item.
pub type FieldId = usize;

/// Global item ID counter for generating unique item IDs.
static NEXT_ITEM_ID: AtomicU64 = AtomicU64::new(1);

/// Gets the next unique item ID.
pub fn next_item_id() -> ItemId {
    NEXT_ITEM_ID.fetch_add(1, Ordering::SeqCst)
}

/// A field of an item changed from `old` to `new`.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldChange {
    pub item: ItemId,
    pub field: FieldId,
    pub old: Value,
    pub new: Value,
}

struct ItemInner {
    id: ItemId,
    fields: RefCell<Vec<Value>>,
    watchers: Publisher<FieldChange>,
    notifying: Cell<bool>,
}

/// A shared, observable record.
///
/// Cloning an `Item` clones the handle, not the record: both handles see the
/// same fields and share watchers. Equality is identity.
#[derive(Clone)]
pub struct Item {
    inner: Rc<ItemInner>,
}

/// Clears the notifying flag even if a watcher unwinds.
struct NotifyingGuard<'a>(&'a Cell<bool>);

impl Drop for NotifyingGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

impl Item {
    /// Creates a new item with an automatically assigned ID.
    pub fn new(fields: Vec<Value>) -> Self {
        Self::with_id(next_item_id(), fields)
    }

    /// Creates a new item with the given ID.
    pub fn with_id(id: ItemId, fields: Vec<Value>) -> Self {
        Self {
            inner: Rc::new(ItemInner {
                id,
                fields: RefCell::new(fields),
                watchers: Publisher::new(),
                notifying: Cell::new(false),
            }),
        }
    }

    /// Returns the item ID.
    #[inline]
    pub fn id(&self) -> ItemId {
        self.inner.id
    }

    /// Returns a copy of the value at the given field.
    pub fn get(&self, field: FieldId) -> Option<Value> {
        self.inner.fields.borrow().get(field).cloned()
    }

    /// Returns a copy of all field values.
    pub fn fields(&self) -> Vec<Value> {
        self.inner.fields.borrow().clone()
    }

    /// Returns the number of fields.
    #[inline]
    pub fn len(&self) -> usize {
        self.inner.fields.borrow().len()
    }

    /// Returns true if the item has no fields.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.fields.borrow().is_empty()
    }

    /// Sets a field and notifies watchers if the value actually changed.
    ///
    /// Fails with `Error::Reentrancy` when called on this item from inside
    /// one of its own watchers.
    pub fn set(&self, field: FieldId, value: impl Into<Value>) -> Result<()> {
        let new = value.into();
        if self.inner.notifying.get() {
            tracing::warn!(item = self.id(), field, "rejected reentrant field update");
            return Err(Error::reentrancy("item"));
        }

        let old = {
            let mut fields = self.inner.fields.borrow_mut();
            let len = fields.len();
            let slot = fields
                .get_mut(field)
                .ok_or_else(|| Error::field_out_of_bounds(field, len))?;
            if *slot == new {
                return Ok(());
            }
            core::mem::replace(slot, new.clone())
        };

        let change = FieldChange {
            item: self.id(),
            field,
            old,
            new,
        };
        self.inner.notifying.set(true);
        let _guard = NotifyingGuard(&self.inner.notifying);
        self.inner.watchers.publish(&change);
        Ok(())
    }

    /// Registers a watcher for field changes.
    pub fn watch<O>(&self, observer: O) -> SubscriptionId
    where
        O: Observer<FieldChange> + 'static,
    {
        self.inner.watchers.subscribe(observer)
    }

    /// Registers an already boxed watcher.
    pub fn watch_boxed(&self, observer: Box<dyn Observer<FieldChange>>) -> SubscriptionId {
        self.inner.watchers.subscribe_boxed(observer)
    }

    /// Removes a watcher. Returns false if the ID is unknown.
    pub fn unwatch(&self, id: SubscriptionId) -> bool {
        self.inner.watchers.unsubscribe(id)
    }

    /// Returns the number of registered watchers.
    pub fn watcher_count(&self) -> usize {
        self.inner.watchers.len()
    }

    /// Returns true if both handles refer to the same record.
    #[inline]
    pub fn ptr_eq(&self, other: &Item) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl PartialEq for Item {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for Item {}

impl fmt::Debug for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Item")
            .field("id", &self.id())
            .field("fields", &*self.inner.fields.borrow())
            .finish()
    }
}
