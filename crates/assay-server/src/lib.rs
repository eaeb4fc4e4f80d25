// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Assay Server - HTTP API for the analysis orchestrator
//!
//! Exposes the Task API, live progress over SSE, StepRun ledger queries,
//! the advice pipeline and signed artifact downloads on top of a running
//! [`EnvironmentRuntime`](assay_environment::EnvironmentRuntime).
//!
//! ```text
//! client ──HTTP──► axum router ──► TaskStateMachine ──► durable queue ──► workers
//!    ▲                 │                  │
//!    └──── SSE ◄───────┴──── EventBus ◄───┘
//! ```
//!
//! # Routes
//!
//! | Method | Path | Operation |
//! |--------|------|-----------|
//! | GET | `/health` | liveness |
//! | GET/POST | `/api/v1/steps` | list / register steps |
//! | POST | `/api/v1/tasks` | create (202) |
//! | GET | `/api/v1/tasks/{id}` | query |
//! | POST | `/api/v1/tasks/{id}/cancel` | cancel |
//! | GET | `/api/v1/tasks/{id}/stream` | snapshot + live events (SSE) |
//! | GET | `/api/v1/tasks/{id}/events/history` | persisted event log |
//! | GET | `/api/v1/step-runs/{id}` | step run |
//! | GET | `/api/v1/step-runs/{id}/lineage` | ancestors (`?tree=true` for the tree) |
//! | GET | `/api/v1/step-runs/compare?a=&b=` | compare |
//! | POST | `/api/v1/step-runs/{id}/clone` | clone + create |
//! | POST/DELETE | `/api/v1/step-runs/{id}/pin` | pin / unpin |
//! | GET | `/api/v1/step-runs/{id}/metrics` | metrics |
//! | GET | `/api/v1/step-runs/{id}/artifacts` | artifacts with signed links |
//! | GET/POST | `/api/v1/step-runs/{id}/advice` | list / generate advice |
//! | GET | `/api/v1/advice/{id}` | advice |
//! | POST | `/api/v1/advice/{id}/dry-run` | re-validate |
//! | POST | `/api/v1/advice/{id}/apply` | apply |
//! | POST | `/api/v1/advice/{id}/rollback` | rollback |
//! | POST | `/api/v1/tools/*` | suggest-threshold, render-plot, apply-patch |
//! | GET | `/api/v1/artifacts/{hash}` | signed download |

/// Environment configuration.
pub mod config;

/// Error to HTTP response mapping.
pub mod error;

/// Route handlers.
pub mod routes;

/// Shared handler state.
pub mod state;

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{Value, json};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use config::{Config, ConfigError};
pub use error::{ApiError, ApiResult};
pub use state::AppState;

async fn health(State(state): State<Arc<AppState>>) -> (StatusCode, Json<Value>) {
    match state.persistence().health_check().await {
        Ok(true) => (StatusCode::OK, Json(json!({"status": "ok"}))),
        Ok(false) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "degraded"})),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "degraded", "error": e.to_string()})),
        ),
    }
}

/// Build the full router. Used by the binary and the integration tests.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", routes::api())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
