// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Step definitions.

use std::sync::Arc;

use assay_core::model::StepDefinition;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use tracing::info;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/steps", get(list_steps).post(register_step))
}

async fn list_steps(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<StepDefinition>>> {
    Ok(Json(state.persistence().list_steps().await?))
}

/// Register a step; a changed contract gets the next version.
async fn register_step(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<StepDefinition>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<StepDefinition>)> {
    let Json(definition) = payload?;
    if definition.step_ref.trim().is_empty() {
        return Err(ApiError::bad_request("step_ref must not be empty"));
    }
    if definition.command.is_empty() {
        return Err(ApiError::bad_request("command must not be empty"));
    }

    let registered = state.persistence().register_step(&definition).await?;
    info!(
        step_ref = %registered.step_ref,
        version = registered.version,
        "Step registered"
    );
    Ok((StatusCode::CREATED, Json(registered)))
}
