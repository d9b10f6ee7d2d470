//! Error types for identifier parsing and validation.

use thiserror::Error;

/// Errors that can occur when parsing or validating identifiers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The identifier string is empty.
    #[error("{kind} cannot be empty")]
    Empty { kind: &'static str },

    /// The identifier contains characters its kind doesn't allow.
    #[error("invalid {kind} {value:?}: {reason}")]
    Invalid {
        kind: &'static str,
        value: String,
        reason: &'static str,
    },

    /// The entity tag names a kind this agent doesn't know.
    #[error("unknown entity kind in tag {0:?}")]
    UnknownKind(String),

    /// The entity tag is missing the `-` separator.
    #[error("entity tag {0:?} missing '-' separator")]
    MissingSeparator(String),
}

impl IdError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty { .. })
    }
}
