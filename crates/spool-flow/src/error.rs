//! Error types for the generation engine.
//!
//! Components report errors; only the orchestrator turns them into task
//! outcomes. The variants split into three groups:
//! - Caller errors: `TaskNotFound`, `Conflict`, `Validation`
//! - Step failures the orchestrator classifies before retrying:
//!   `TransientProvider`, `Persistence`
//! - Plumbing: `CacheUnavailable`, `LeaseLost`, `Storage`, `Core`

use spool_core::TaskId;

/// The result type used throughout spool-flow.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in engine operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A task was not found.
    #[error("task not found: {task_id}")]
    TaskNotFound {
        /// The task ID that was not found.
        task_id: TaskId,
    },

    /// A write conflicted with existing durable state.
    ///
    /// Raised for duplicate task IDs, illegal status updates, decreasing
    /// cursors, mismatched chunk payloads and sequence gaps.
    #[error("conflict: {message}")]
    Conflict {
        /// Description of the conflict.
        message: String,
    },

    /// An invalid state transition was attempted.
    #[error("invalid state transition: {from} -> {to} ({reason})")]
    InvalidStateTransition {
        /// The current state.
        from: String,
        /// The attempted target state.
        to: String,
        /// The reason the transition is invalid.
        reason: String,
    },

    /// The request is malformed. Never retried.
    #[error("validation failed: {message}")]
    Validation {
        /// Description of the validation failure.
        message: String,
    },

    /// The generation provider failed in a retryable way.
    #[error("transient provider error: {message}")]
    TransientProvider {
        /// Description of the provider failure.
        message: String,
    },

    /// Durable state could not be written.
    #[error("persistence error: {message}")]
    Persistence {
        /// Description of the persistence failure.
        message: String,
    },

    /// The result cache could not be consulted.
    #[error("cache unavailable: {message}")]
    CacheUnavailable {
        /// Description of the cache failure.
        message: String,
    },

    /// The driving worker no longer holds the task lease.
    #[error("lease lost for task {task_id}")]
    LeaseLost {
        /// The task whose lease was lost.
        task_id: TaskId,
    },

    /// Invalid engine configuration.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },

    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A serialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// An error from spool-core.
    #[error("core error: {0}")]
    Core(#[from] spool_core::Error),
}

impl Error {
    /// Creates a conflict error.
    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    /// Creates a validation error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Creates a persistence error.
    #[must_use]
    pub fn persistence(message: impl Into<String>) -> Self {
        Self::Persistence {
            message: message.into(),
        }
    }

    /// Creates a configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a new storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a serialization error from any displayable cause.
    #[must_use]
    pub fn serialization(message: impl std::fmt::Display) -> Self {
        Self::Serialization {
            message: message.to_string(),
        }
    }

    /// Returns true if retrying the failed operation may succeed.
    ///
    /// Storage and persistence failures are transient; caller errors,
    /// conflicts and lost leases are not.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::TransientProvider { .. }
            | Self::Persistence { .. }
            | Self::Storage { .. }
            | Self::CacheUnavailable { .. } => true,
            Self::Core(inner) => matches!(
                inner,
                spool_core::Error::Storage { .. } | spool_core::Error::Internal { .. }
            ),
            _ => false,
        }
    }

    /// Returns a short stable label for metrics and task error records.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::TaskNotFound { .. } => "not_found",
            Self::Conflict { .. } | Self::InvalidStateTransition { .. } => "conflict",
            Self::Validation { .. } => "validation",
            Self::TransientProvider { .. } => "transient_provider",
            Self::Persistence { .. } | Self::Storage { .. } | Self::Core(_) => "persistence",
            Self::CacheUnavailable { .. } => "cache_unavailable",
            Self::LeaseLost { .. } => "lease_lost",
            Self::Configuration { .. } => "configuration",
            Self::Serialization { .. } => "serialization",
        }
    }
}
