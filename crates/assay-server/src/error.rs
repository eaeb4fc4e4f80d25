// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mapping of library errors to HTTP responses.
//!
//! | Kind | Status |
//! |------|--------|
//! | `INVALID_PARAMETERS`, `VALIDATION_REJECTED`, `INVALID_INPUT`, malformed body | 422 |
//! | `ILLEGAL_TRANSITION`, `DUPLICATE_FINALIZATION` | 409 |
//! | `CONFIRMATION_REQUIRED`, `INVALID_ADVICE_STATE` | 409 |
//! | `NOT_FOUND` | 404 |
//! | `ADVICE_BACKEND_ERROR` | 502 |
//! | everything else | 500 |
//!
//! Body: `{"error": {"code": "...", "message": "..."}}`.

use assay_core::CoreError;
use axum::Json;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tracing::error;

/// Error returned by every handler.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: ErrorPayload<'a>,
}

#[derive(Serialize)]
struct ErrorPayload<'a> {
    code: &'a str,
    message: &'a str,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, "INVALID_REQUEST", message)
    }
}

/// Status for a stable error code.
fn status_for(code: &str) -> StatusCode {
    match code {
        "INVALID_PARAMETERS" | "VALIDATION_REJECTED" | "INVALID_INPUT" => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        "ILLEGAL_TRANSITION"
        | "DUPLICATE_FINALIZATION"
        | "CONFIRMATION_REQUIRED"
        | "INVALID_ADVICE_STATE" => StatusCode::CONFLICT,
        "NOT_FOUND" => StatusCode::NOT_FOUND,
        "ADVICE_BACKEND_ERROR" => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        let code = e.error_code();
        if matches!(e, CoreError::DuplicateFinalization { .. }) {
            error!(error = %e, "Duplicate finalization reached the API");
        }
        Self::new(status_for(code), code, e.to_string())
    }
}

impl From<assay_advice::Error> for ApiError {
    fn from(e: assay_advice::Error) -> Self {
        match e {
            assay_advice::Error::Core(core) => core.into(),
            other => {
                let code = other.error_code();
                Self::new(status_for(code), code, other.to_string())
            }
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(code = self.code, message = %self.message, "Request failed");
        }
        let body = ErrorBody {
            error: ErrorPayload {
                code: self.code,
                message: &self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
