//! Operator graph scaffolding.
//!
//! This module provides the capabilities every operator implements and the
//! per-graph `OperationContext` used to build and tear graphs down.

mod context;
pub mod node;

pub use context::OperationContext;
pub use node::{Downstream, Link, Node, Pump, Scalar, Sequence, SequenceExt};
