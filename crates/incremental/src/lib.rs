//! Tidal Incremental - incrementally maintained query operators.
//!
//! A query is a graph of operator nodes rooted at an `ObservableVec`. Each
//! node evaluates its output once when built and afterwards patches it from
//! the changes its upstream publishes, republishing the minimal changes to
//! its own output. Items with observable fields are watched, so an in-place
//! field update reaches every operator whose result depends on it.
//!
//! # Core Concepts
//!
//! - `Change<T>`: one insert/remove/replace/move/reset of an ordered sequence,
//!   or a field change of one of its elements
//! - `Sequence<T>` / `Scalar<V>`: what a node exposes (snapshot + changes)
//! - `OperationContext`: identity, sharing and teardown for one graph
//! - `GroupBy`: groups elements by key, in first-occurrence order
//!
//! # Example
//!
//! ```
//! use std::rc::Rc;
//! use tidal_core::{Item, Value};
//! use tidal_incremental::{GroupBy, ObservableVec, OperationContext, Sequence};
//!
//! let ctx = OperationContext::new();
//! let source = Rc::new(ObservableVec::from_vec(vec![
//!     Item::new(vec![Value::from("Group1"), Value::from("Item1")]),
//!     Item::new(vec![Value::from("Group2"), Value::from("Item2")]),
//! ]));
//! let groups = GroupBy::by_field(&ctx, source.clone(), 0);
//! assert_eq!(groups.len(), 2);
//!
//! source.get(1).unwrap().set(0, "Group1").unwrap();
//! assert_eq!(groups.len(), 1);
//! assert_eq!(groups.get(0).unwrap().len(), 2);
//!
//! ctx.dispose();
//! ```

#![no_std]

extern crate alloc;

pub mod change;
pub mod dataflow;
pub mod element;
pub mod operators;
pub mod source;

pub use change::{Change, ValueChange};
pub use dataflow::{Downstream, Link, Node, OperationContext, Pump, Scalar, Sequence, SequenceExt};
pub use element::{Element, ElementId, WatchRegistry};
pub use operators::{Count, Group, GroupBy, KeySelector, MapperFn, PredicateFn, Select, Where};
pub use source::ObservableVec;
