// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for assay-core.
//!
//! Every kind carries a stable code (see [`CoreError::error_code`]) and a
//! human-readable reason. None of them are retried automatically; callers
//! surface them at the API boundary.

use std::fmt;
use std::time::Duration;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors surfaced by the state machine, the ledger and the stores.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum CoreError {
    /// Client-supplied parameters failed schema validation.
    InvalidParameters {
        /// Step the parameters were validated against.
        step_ref: String,
        /// Every violation found, in parameter-name order.
        violations: Vec<String>,
    },

    /// A task transition violated the state machine.
    IllegalTransition {
        /// The task ID.
        task_id: String,
        /// Status recorded at the time of the attempt.
        from: String,
        /// Status the caller tried to reach.
        to: String,
    },

    /// No valid progress event arrived within the liveness timeout.
    RunnerUnresponsive {
        /// The task ID.
        task_id: String,
        /// Liveness timeout that elapsed.
        timeout: Duration,
    },

    /// Output artifacts could not be verified or uploaded.
    ArtifactPersistError {
        /// Task ID, or artifact hash when raised by the store.
        subject: String,
        /// The reason for failure.
        reason: String,
    },

    /// A step run was already finalized for this task.
    DuplicateFinalization {
        /// The task ID.
        task_id: String,
    },

    /// A patch failed dry-run validation.
    ValidationRejected {
        /// The advice ID.
        advice_id: String,
        /// The reason for rejection.
        reason: String,
    },

    /// Requested entity does not exist.
    NotFound {
        /// Entity kind ("task", "step_run", "advice", ...).
        entity: &'static str,
        /// The ID that was not found.
        id: String,
    },

    /// Database operation failed.
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// Unexpected internal failure (I/O, corrupt stored data).
    Internal {
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidParameters { .. } => "INVALID_PARAMETERS",
            Self::IllegalTransition { .. } => "ILLEGAL_TRANSITION",
            Self::RunnerUnresponsive { .. } => "RUNNER_UNRESPONSIVE",
            Self::ArtifactPersistError { .. } => "ARTIFACT_PERSIST_ERROR",
            Self::DuplicateFinalization { .. } => "DUPLICATE_FINALIZATION",
            Self::ValidationRejected { .. } => "VALIDATION_REJECTED",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
            Self::Internal { .. } => "INTERNAL_ERROR",
        }
    }

    /// Shorthand for a [`CoreError::NotFound`].
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Shorthand for a [`CoreError::Internal`].
    pub fn internal(details: impl fmt::Display) -> Self {
        Self::Internal {
            details: details.to_string(),
        }
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidParameters {
                step_ref,
                violations,
            } => {
                write!(
                    f,
                    "Invalid parameters for step '{}': {}",
                    step_ref,
                    violations.join("; ")
                )
            }
            Self::IllegalTransition { task_id, from, to } => {
                write!(
                    f,
                    "Task '{}' cannot transition from '{}' to '{}'",
                    task_id, from, to
                )
            }
            Self::RunnerUnresponsive { task_id, timeout } => {
                write!(
                    f,
                    "Runner for task '{}' produced no valid progress event within {:?}",
                    task_id, timeout
                )
            }
            Self::ArtifactPersistError { subject, reason } => {
                write!(f, "Failed to persist artifacts for '{}': {}", subject, reason)
            }
            Self::DuplicateFinalization { task_id } => {
                write!(f, "Step run for task '{}' is already finalized", task_id)
            }
            Self::ValidationRejected { advice_id, reason } => {
                write!(f, "Advice '{}' rejected by dry-run: {}", advice_id, reason)
            }
            Self::NotFound { entity, id } => write!(f, "{} '{}' not found", entity, id),
            Self::DatabaseError { operation, details } => {
                write!(f, "Database error during '{}': {}", operation, details)
            }
            Self::Internal { details } => write!(f, "Internal error: {}", details),
        }
    }
}

impl std::error::Error for CoreError {}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::DatabaseError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for CoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        CoreError::DatabaseError {
            operation: "migrate".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::DatabaseError {
            operation: "json".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::internal(err)
    }
}
