//! Tidal Reactive - materialized views over tidal operator graphs.
//!
//! This crate sits at the end of an operator graph: it turns the change
//! stream of a terminal operator into something a consumer can index and
//! observe.
//!
//! # Core Concepts
//!
//! - `Buffer`: an indexable copy of a sequence (`count()`, `element_at(i)`)
//!   maintained purely from the sequence's change notifications
//! - `ChangeLog`: records the changes a sequence publishes
//!
//! # Example
//!
//! ```
//! use std::rc::Rc;
//! use tidal_core::{Item, Value};
//! use tidal_incremental::{Group, GroupBy, ObservableVec, OperationContext};
//! use tidal_reactive::Buffer;
//!
//! let ctx = OperationContext::new();
//! let source = Rc::new(ObservableVec::from_vec(vec![
//!     Item::new(vec![Value::from("Group1")]),
//!     Item::new(vec![Value::from("Group2")]),
//! ]));
//! let groups = GroupBy::by_field(&ctx, source.clone(), 0);
//! let buffer = Buffer::<Rc<Group<Value, Item>>>::new(&ctx, groups.clone());
//! assert_eq!(buffer.count(), 2);
//!
//! source.push(Item::new(vec![Value::from("Group3")])).unwrap();
//! assert_eq!(buffer.count(), 3);
//! assert_eq!(buffer.element_at(2).unwrap().key(), &Value::from("Group3"));
//! ```

#![no_std]

extern crate alloc;

pub mod buffer;
pub mod change_log;

pub use buffer::Buffer;
pub use change_log::ChangeLog;

// Re-export commonly used types from dependencies
pub use tidal_incremental::{Change, Group, GroupBy, ObservableVec, OperationContext, Sequence};
