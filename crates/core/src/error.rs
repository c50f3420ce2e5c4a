//! Error types for tidal.

use crate::item::{FieldId, ItemId};
use alloc::string::String;
use core::fmt;

/// Result type alias for tidal operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Identifier of a node inside one operation context.
pub type NodeId = u32;

/// Recoverable errors raised by sources, items and operators.
///
/// Broken engine invariants are not represented here: they panic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// A key selector failed for one item.
    KeySelector {
        item: ItemId,
        message: String,
    },
    /// A mutation was issued while the same source was still propagating.
    Reentrancy {
        source: String,
    },
    /// Sequence index out of range.
    IndexOutOfBounds {
        index: usize,
        len: usize,
    },
    /// Field index out of range for an item.
    FieldOutOfBounds {
        field: FieldId,
        len: usize,
    },
    /// Invalid operation.
    InvalidOperation {
        message: String,
    },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::KeySelector { item, message } => {
                write!(f, "Key selector failed for item {}: {}", item, message)
            }
            Error::Reentrancy { source } => {
                write!(f, "Reentrant mutation of {} during propagation", source)
            }
            Error::IndexOutOfBounds { index, len } => {
                write!(f, "Index {} out of range [0, {})", index, len)
            }
            Error::FieldOutOfBounds { field, len } => {
                write!(f, "Field {} out of range [0, {})", field, len)
            }
            Error::InvalidOperation { message } => {
                write!(f, "Invalid operation: {}", message)
            }
        }
    }
}

impl Error {
    /// Creates a key selector error.
    pub fn key_selector(item: ItemId, message: impl Into<String>) -> Self {
        Error::KeySelector {
            item,
            message: message.into(),
        }
    }

    /// Creates a reentrancy error.
    pub fn reentrancy(source: impl Into<String>) -> Self {
        Error::Reentrancy {
            source: source.into(),
        }
    }

    /// Creates an index out of bounds error.
    pub fn index_out_of_bounds(index: usize, len: usize) -> Self {
        Error::IndexOutOfBounds { index, len }
    }

    /// Creates a field out of bounds error.
    pub fn field_out_of_bounds(field: FieldId, len: usize) -> Self {
        Error::FieldOutOfBounds { field, len }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Error::InvalidOperation {
            message: message.into(),
        }
    }

    /// Returns true if this error reports a rejected reentrant mutation.
    pub fn is_reentrancy(&self) -> bool {
        matches!(self, Error::Reentrancy { .. })
    }
}
