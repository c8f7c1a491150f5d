//! Error types for ID parsing and validation.

use thiserror::Error;

/// Errors that can occur when parsing or validating IDs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The ID string is empty.
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

    /// The task handle has no generation suffix.
    #[error("task handle missing generation suffix: {0}")]
    MissingGeneration(String),

    /// The generation suffix is not a positive integer.
    #[error("invalid generation '{0}'")]
    InvalidGeneration(String),
}

impl IdError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty)
    }

    /// Returns true if this error came from the generation suffix of a task handle.
    pub fn is_generation_error(&self) -> bool {
        matches!(
            self,
            IdError::MissingGeneration(_) | IdError::InvalidGeneration(_)
        )
    }
}
