//! Error types for ID parsing and validation.

use thiserror::Error;

/// Errors that can occur when parsing or validating IDs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The ID string is empty.
    #[error("ID cannot be empty")]
    Empty,

    /// The string is not a UUID at all.
    #[error("invalid {kind} ID '{input}': {reason}")]
    InvalidUuid {
        kind: &'static str,
        input: String,
        reason: String,
    },

    /// The string is a UUID but not in canonical hyphenated form.
    #[error("{kind} ID '{input}' is not in hyphenated form")]
    NotHyphenated { kind: &'static str, input: String },
}

impl IdError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty)
    }
}
