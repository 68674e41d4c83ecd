//! Error types for ID parsing and engine-name decomposition.

use thiserror::Error;

/// Errors that can occur when parsing IDs or engine-level names.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The input string is empty.
    #[error("ID cannot be empty")]
    Empty,

    /// The ID is zero; fleet identifiers start at 1.
    #[error("{kind} must be a positive integer")]
    Zero { kind: &'static str },

    /// The ID is not a decimal integer.
    #[error("invalid {kind}: '{value}' is not a positive integer")]
    NotAnInteger { kind: &'static str, value: String },

    /// The name is missing the underscore separator.
    #[error("name missing underscore separator: '{0}'")]
    MissingSeparator(String),

    /// The engine name does not follow the namespacing convention.
    #[error("invalid engine name: {message}")]
    InvalidFormat { message: String },
}

impl IdError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty)
    }

    /// Returns true if this error came from decomposing an engine name.
    pub fn is_name_error(&self) -> bool {
        matches!(
            self,
            IdError::MissingSeparator(_) | IdError::InvalidFormat { .. }
        )
    }
}
