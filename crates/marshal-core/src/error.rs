//! Error types and result aliases for marshal.
//!
//! This module defines the shared error types used across all marshal components.
//! Target I/O failures have their own type, [`crate::target::TargetError`], because
//! the engine classifies them separately from everything else.

/// The result type used throughout marshal-core.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in shared marshal operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An invalid identifier was provided.
    #[error("invalid identifier: {message}")]
    InvalidId {
        /// Description of what made the ID invalid.
        message: String,
    },

    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// An internal error occurred that should not happen in normal operation.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl Error {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}
