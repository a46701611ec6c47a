//! Error types for name and ID parsing.

use thiserror::Error;

/// Errors that can occur when parsing or validating names and IDs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The string is empty.
    #[error("ID cannot be empty")]
    Empty,

    /// The ID has an invalid prefix.
    #[error("invalid ID prefix: expected '{expected}', got '{actual}'")]
    InvalidPrefix {
        expected: &'static str,
        actual: String,
    },

    /// The ID is missing the underscore separator.
    #[error("ID missing underscore separator")]
    MissingSeparator,

    /// The ULID portion of the ID is invalid.
    #[error("invalid ULID: {0}")]
    InvalidUlid(String),

    /// The name is longer than allowed.
    #[error("{kind} is too long: {len} > {max} characters")]
    TooLong {
        kind: &'static str,
        len: usize,
        max: usize,
    },

    /// The name contains a character that is not allowed.
    #[error("{kind} contains invalid character {found:?}")]
    InvalidCharacter { kind: &'static str, found: char },
}

impl IdError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty)
    }

    /// Returns true if this error indicates a prefix mismatch.
    pub fn is_prefix_error(&self) -> bool {
        matches!(self, IdError::InvalidPrefix { .. })
    }
}
