//! Sequence elements and per-element field watches.

use alloc::boxed::Box;
use hashbrown::HashMap;
use tidal_core::{FieldChange, Item, Observer, SubscriptionId};

/// Identity of an element, stable for its whole lifetime.
pub type ElementId = u64;

/// An element that operators can track by identity.
///
/// Elements with observable fields (such as `Item`) also let operators watch
/// them, so keyed or filtered views can follow in-place field updates.
pub trait Element: Clone + 'static {
    /// Returns the identity of this element.
    fn element_id(&self) -> ElementId;

    /// Starts watching field changes. Returns None if the element has no
    /// observable fields.
    fn watch_fields(&self, _observer: Box<dyn Observer<FieldChange>>) -> Option<SubscriptionId> {
        None
    }

    /// Stops a watch started by `watch_fields`.
    fn unwatch_fields(&self, _id: SubscriptionId) -> bool {
        false
    }
}

impl Element for Item {
    #[inline]
    fn element_id(&self) -> ElementId {
        self.id()
    }

    fn watch_fields(&self, observer: Box<dyn Observer<FieldChange>>) -> Option<SubscriptionId> {
        Some(self.watch_boxed(observer))
    }

    fn unwatch_fields(&self, id: SubscriptionId) -> bool {
        self.unwatch(id)
    }
}

struct WatchEntry<T> {
    element: T,
    subscription: Option<SubscriptionId>,
    /// Number of occurrences of the element in the watched sequence
    count: usize,
}

/// Registry of field watches, one per distinct element of a sequence.
///
/// An element occurring several times is watched once and reference
/// counted, so its watch is released with its last occurrence.
pub struct WatchRegistry<T> {
    entries: HashMap<ElementId, WatchEntry<T>>,
}

impl<T: Element> Default for WatchRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Element> WatchRegistry<T> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Records one more occurrence of `element`, watching it on its first.
    ///
    /// Returns true if this was the first occurrence.
    pub fn acquire<F>(&mut self, element: &T, make_observer: F) -> bool
    where
        F: FnOnce() -> Box<dyn Observer<FieldChange>>,
    {
        let id = element.element_id();
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.count += 1;
            return false;
        }
        let subscription = element.watch_fields(make_observer());
        self.entries.insert(
            id,
            WatchEntry {
                element: element.clone(),
                subscription,
                count: 1,
            },
        );
        true
    }

    /// Forgets one occurrence of `element`, unwatching it on its last.
    ///
    /// Returns true if that was the last occurrence.
    pub fn release(&mut self, element: &T) -> bool {
        let id = element.element_id();
        let entry = self
            .entries
            .get_mut(&id)
            .unwrap_or_else(|| panic!("release of unwatched element {}", id));
        entry.count -= 1;
        if entry.count > 0 {
            return false;
        }
        if let Some(entry) = self.entries.remove(&id) {
            if let Some(sub) = entry.subscription {
                let released = entry.element.unwatch_fields(sub);
                assert!(released, "field watch {} of element {} already gone", sub, id);
            }
        }
        true
    }

    /// Unwatches every element.
    pub fn release_all(&mut self) {
        for (_, entry) in self.entries.drain() {
            if let Some(sub) = entry.subscription {
                entry.element.unwatch_fields(sub);
            }
        }
    }

    /// Returns the watched element with the given identity.
    pub fn element(&self, id: ElementId) -> Option<&T> {
        self.entries.get(&id).map(|e| &e.element)
    }

    /// Returns how many times the element currently occurs.
    pub fn occurrences(&self, id: ElementId) -> usize {
        self.entries.get(&id).map(|e| e.count).unwrap_or(0)
    }

    /// Returns the number of distinct watched elements.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is watched.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;
    use tidal_core::Value;

    fn noop() -> Box<dyn Observer<FieldChange>> {
        Box::new(|_: &FieldChange| {})
    }

    #[test]
    fn test_acquire_release() {
        let item = Item::new(vec![Value::from("Group1")]);
        let mut registry = WatchRegistry::new();

        assert!(registry.acquire(&item, noop));
        assert_eq!(item.watcher_count(), 1);
        assert_eq!(registry.occurrences(item.id()), 1);

        assert!(registry.release(&item));
        assert_eq!(item.watcher_count(), 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_duplicate_occurrences_share_one_watch() {
        let item = Item::new(vec![Value::from("Group1")]);
        let mut registry = WatchRegistry::new();

        assert!(registry.acquire(&item, noop));
        assert!(!registry.acquire(&item, noop));
        assert_eq!(item.watcher_count(), 1);
        assert_eq!(registry.occurrences(item.id()), 2);

        assert!(!registry.release(&item));
        assert_eq!(item.watcher_count(), 1);
        assert!(registry.release(&item));
        assert_eq!(item.watcher_count(), 0);
    }

    #[test]
    fn test_release_all() {
        let a = Item::new(vec![Value::Int64(1)]);
        let b = Item::new(vec![Value::Int64(2)]);
        let mut registry = WatchRegistry::new();
        registry.acquire(&a, noop);
        registry.acquire(&b, noop);
        assert_eq!(registry.len(), 2);

        registry.release_all();
        assert!(registry.is_empty());
        assert_eq!(a.watcher_count(), 0);
        assert_eq!(b.watcher_count(), 0);
        assert!(registry.element(a.id()).is_none());
    }

    #[test]
    #[should_panic(expected = "release of unwatched element")]
    fn test_release_unknown_panics() {
        let item = Item::new(vec![]);
        let mut registry: WatchRegistry<Item> = WatchRegistry::new();
        registry.release(&item);
    }
}
