//! Incremental operators.
//!
//! Every operator owns its upstream, subscribes to it through a weak
//! `Link`, evaluates its output once at construction and then keeps it
//! current from upstream changes and watched field changes:
//! - `Where`: keeps the elements matching a predicate
//! - `Select`: projects each element
//! - `Count`: counts the elements
//! - `GroupBy`: groups elements by a key, following rekeys

mod aggregate;
mod filter;
mod group;
mod group_by;
mod map;

pub use aggregate::Count;
pub use filter::{PredicateFn, Where};
pub use group::Group;
pub use group_by::{GroupBy, KeySelector};
pub use map::{MapperFn, Select};
