//! Error types for the suite engine.
//!
//! Only [`Error::TargetUnavailable`] is meant to travel through the module and
//! suite layers to the invocation caller. Every other failure kind that occurs
//! while a module runs is converted into a reported run failure at the point
//! where it happens.

use marshal_core::TargetError;

/// The result type used throughout marshal-suite.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in suite operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Communication with a target was lost and could not be recovered.
    #[error("target unavailable: {source}")]
    TargetUnavailable {
        /// The target failure that caused the abort.
        #[source]
        source: TargetError,
    },

    /// A module spec or suite option cannot be run.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the problem.
        message: String,
    },

    /// An invalid module state transition was attempted.
    #[error("invalid state transition: {from} -> {to} ({reason})")]
    InvalidStateTransition {
        /// The current state.
        from: String,
        /// The attempted target state.
        to: String,
        /// The reason the transition is invalid.
        reason: String,
    },

    /// The prior-run record or command line could not be rescheduled.
    #[error("rescheduler error: {message}")]
    Rescheduler {
        /// Description of the failure.
        message: String,
    },

    /// An error from marshal-core.
    #[error("core error: {0}")]
    Core(#[from] marshal_core::Error),
}

impl Error {
    /// Creates a new configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a new rescheduler error.
    #[must_use]
    pub fn rescheduler(message: impl Into<String>) -> Self {
        Self::Rescheduler {
            message: message.into(),
        }
    }

    /// Returns true if this error aborts the invocation.
    #[must_use]
    pub const fn is_target_unavailable(&self) -> bool {
        matches!(self, Self::TargetUnavailable { .. })
    }
}

impl From<TargetError> for Error {
    /// Only unavailable-class target errors should be converted; the engine
    /// handles the recoverable ones before they reach this point.
    fn from(source: TargetError) -> Self {
        Self::TargetUnavailable { source }
    }
}
