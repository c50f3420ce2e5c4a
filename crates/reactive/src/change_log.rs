//! Change log for asserting on published changes.
//!
//! A `ChangeLog` subscribes to a sequence and records every change it
//! publishes, in order, until the sequence detaches.

use alloc::boxed::Box;
use alloc::rc::Rc;
use alloc::vec::Vec;
use core::cell::{Cell, RefCell};
use tidal_core::{Observer, SubscriptionId};
use tidal_incremental::{Change, Sequence};

struct LogInner<T> {
    changes: RefCell<Vec<Change<T>>>,
    detached: Cell<bool>,
}

struct Recorder<T>(Rc<LogInner<T>>);

impl<T: Clone> Observer<Change<T>> for Recorder<T> {
    fn on_change(&self, change: &Change<T>) {
        self.0.changes.borrow_mut().push(change.clone());
    }

    fn on_detach(&self) {
        self.0.detached.set(true);
    }
}

/// The changes published by one sequence since the log was attached.
///
/// Clones share the same record.
#[derive(Clone)]
pub struct ChangeLog<T> {
    inner: Rc<LogInner<T>>,
    subscription: SubscriptionId,
}

impl<T: Clone + 'static> ChangeLog<T> {
    /// Starts recording the changes of `sequence`.
    pub fn attach<S>(sequence: &S) -> Self
    where
        S: Sequence<T> + ?Sized,
    {
        let inner = Rc::new(LogInner {
            changes: RefCell::new(Vec::new()),
            detached: Cell::new(false),
        });
        let subscription = sequence.subscribe(Box::new(Recorder(inner.clone())));
        Self {
            inner,
            subscription,
        }
    }

    /// Returns the subscription recording into this log.
    #[inline]
    pub fn subscription(&self) -> SubscriptionId {
        self.subscription
    }

    /// Returns the recorded changes.
    pub fn changes(&self) -> Vec<Change<T>> {
        self.inner.changes.borrow().clone()
    }

    /// Returns and forgets the recorded changes.
    pub fn take(&self) -> Vec<Change<T>> {
        core::mem::take(&mut *self.inner.changes.borrow_mut())
    }

    /// Forgets the recorded changes.
    pub fn clear(&self) {
        self.inner.changes.borrow_mut().clear();
    }

    /// Returns the number of recorded changes.
    #[inline]
    pub fn len(&self) -> usize {
        self.inner.changes.borrow().len()
    }

    /// Returns true if nothing was recorded.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.changes.borrow().is_empty()
    }

    /// Returns the kind of every recorded change, in order.
    pub fn kinds(&self) -> Vec<&'static str> {
        self.inner.changes.borrow().iter().map(Change::kind).collect()
    }

    /// Returns the items of recorded inserts.
    pub fn inserted(&self) -> Vec<T> {
        self.inner
            .changes
            .borrow()
            .iter()
            .filter_map(|c| match c {
                Change::Insert { item, .. } => Some(item.clone()),
                _ => None,
            })
            .collect()
    }

    /// Returns the items of recorded removes.
    pub fn removed(&self) -> Vec<T> {
        self.inner
            .changes
            .borrow()
            .iter()
            .filter_map(|c| match c {
                Change::Remove { item, .. } => Some(item.clone()),
                _ => None,
            })
            .collect()
    }

    /// Returns true once the sequence detached its subscribers.
    #[inline]
    pub fn is_detached(&self) -> bool {
        self.inner.detached.get()
    }
}
