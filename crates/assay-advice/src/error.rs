// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for assay-advice.

use thiserror::Error;

/// Advice pipeline errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Core state machine, ledger or store operation failed.
    ///
    /// Dry-run rejections surface here as `CoreError::ValidationRejected`.
    #[error(transparent)]
    Core(#[from] assay_core::CoreError),

    /// A high-risk change was applied without an explicit confirmation.
    #[error("Change to '{subject}' is high-risk and requires confirmation")]
    ConfirmationRequired {
        /// The advice or step run the change targets.
        subject: String,
    },

    /// The advice is not in a state that allows the requested action.
    #[error("Advice '{advice_id}' cannot be {action}: {reason}")]
    InvalidState {
        /// The advice ID.
        advice_id: String,
        /// Attempted action ("applied", "rolled back").
        action: &'static str,
        /// Why the action is refused.
        reason: String,
    },

    /// The diagnose/propose backend failed or answered malformed data.
    #[error("Advice backend '{backend}' failed: {reason}")]
    Backend {
        /// Backend name.
        backend: &'static str,
        /// The reason for failure.
        reason: String,
    },

    /// A tool was called with unusable input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// HTTP transport failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Pipeline was misconfigured.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Stable error code, matching [`assay_core::CoreError::error_code`] for
    /// wrapped core errors.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Core(e) => e.error_code(),
            Self::ConfirmationRequired { .. } => "CONFIRMATION_REQUIRED",
            Self::InvalidState { .. } => "INVALID_ADVICE_STATE",
            Self::Backend { .. } => "ADVICE_BACKEND_ERROR",
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::Http(_) => "ADVICE_BACKEND_ERROR",
            Self::Json(_) => "INTERNAL_ERROR",
            Self::Config(_) => "INVALID_CONFIGURATION",
        }
    }
}

/// Result type using Advice Error.
pub type Result<T> = std::result::Result<T, Error>;
