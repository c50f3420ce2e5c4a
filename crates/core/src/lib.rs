//! Tidal Core - Core types shared by the tidal incremental query engine.
//!
//! This crate provides the foundational types:
//!
//! - `Value`: Field values (and the most common grouping keys)
//! - `Item`: A shared record whose field updates can be watched
//! - `SubscriptionManager` / `Publisher`: Observer bookkeeping used by every node
//! - `Error`: Recoverable errors raised by sources and operators
//!
//! # Example
//!
//! ```rust
//! use tidal_core::{FieldChange, Item, Value};
//!
//! let item = Item::new(vec![Value::from("Group1"), Value::from("Item1")]);
//! item.watch(|change: &FieldChange| {
//!     assert_eq!(change.new, Value::from("Group3"));
//! });
//!
//! item.set(0, "Group3").unwrap();
//! assert_eq!(item.get(0), Some(Value::from("Group3")));
//! ```

#![no_std]

extern crate alloc;

mod error;
mod item;
pub mod subscription;
mod value;

pub use error::{Error, NodeId, Result};
pub use item::{next_item_id, FieldChange, FieldId, Item, ItemId};
pub use subscription::{Observer, Publisher, Subscription, SubscriptionId, SubscriptionManager};
pub use value::{Value, ValueKind};
