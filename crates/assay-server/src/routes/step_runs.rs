// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! StepRun ledger queries, cloning and pins.

use std::sync::Arc;

use assay_core::ledger::StepRunDiff;
use assay_core::model::{Metrics, Params, StepRun};
use assay_core::persistence::Pin;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use super::tasks::{TaskCreated, accepted};
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/step-runs/compare", get(compare))
        .route("/step-runs/pinned", get(list_pinned))
        .route("/step-runs/{id}", get(get_step_run))
        .route("/step-runs/{id}/lineage", get(lineage))
        .route("/step-runs/{id}/clone", post(clone_run))
        .route("/step-runs/{id}/pin", post(pin).delete(unpin))
        .route("/step-runs/{id}/metrics", get(metrics))
        .route("/step-runs/{id}/artifacts", get(artifacts))
}

async fn get_step_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<StepRun>> {
    Ok(Json(state.ledger.get(&id).await?))
}

#[derive(Debug, Default, Deserialize)]
struct LineageQuery {
    /// Whole lineage tree instead of the ancestor chain.
    #[serde(default)]
    tree: bool,
}

async fn lineage(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    query: Result<Query<LineageQuery>, QueryRejection>,
) -> ApiResult<Json<Vec<StepRun>>> {
    let Query(query) = query?;
    let runs = if query.tree {
        state.ledger.lineage_tree(&id).await?
    } else {
        state.ledger.lineage(&id).await?
    };
    Ok(Json(runs))
}

#[derive(Debug, Deserialize)]
struct CompareQuery {
    a: String,
    b: String,
}

async fn compare(
    State(state): State<Arc<AppState>>,
    query: Result<Query<CompareQuery>, QueryRejection>,
) -> ApiResult<Json<StepRunDiff>> {
    let Query(query) = query?;
    Ok(Json(state.ledger.compare(&query.a, &query.b).await?))
}

#[derive(Debug, Default, Deserialize)]
struct CloneRequest {
    /// Parameters overriding the source run's.
    #[serde(default)]
    params: Params,
}

async fn clone_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    payload: Result<Json<CloneRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<TaskCreated>)> {
    let Json(request) = payload?;
    let draft = state.ledger.clone_run(&id, &request.params).await?;
    let task = state.machine.create(draft).await?;
    info!(
        step_run_id = %id,
        task_id = %task.task_id,
        overrides = request.params.len(),
        "Step run cloned"
    );
    Ok(accepted(&state, &task))
}

#[derive(Debug, Default, Deserialize)]
struct PinRequest {
    #[serde(default)]
    note: Option<String>,
}

async fn pin(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    payload: Result<Json<PinRequest>, JsonRejection>,
) -> ApiResult<Json<Pin>> {
    let Json(request) = payload?;
    Ok(Json(state.ledger.pin(&id, request.note.as_deref()).await?))
}

async fn unpin(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let removed = state.ledger.unpin(&id).await?;
    Ok(Json(json!({"step_run_id": id, "unpinned": removed})))
}

async fn list_pinned(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<Pin>>> {
    Ok(Json(state.ledger.list_pinned().await?))
}

async fn metrics(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Metrics>> {
    Ok(Json(state.advice.tools().get_metrics(&id).await?))
}

/// Artifact of a run with a time-limited download link.
#[derive(Debug, Serialize)]
struct ArtifactLink {
    hash: String,
    #[serde(rename = "type")]
    kind: String,
    size: u64,
    name: Option<String>,
    url: String,
    expires_at: DateTime<Utc>,
}

async fn artifacts(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<ArtifactLink>>> {
    let run = state.ledger.get(&id).await?;
    run.artifacts
        .into_iter()
        .map(|artifact| {
            let signed = state.store.signed_url(&artifact.hash, state.signed_url_ttl)?;
            Ok(ArtifactLink {
                url: format!("{}&type={}", signed.url, artifact.kind),
                expires_at: signed.expires_at,
                hash: artifact.hash,
                kind: artifact.kind,
                size: artifact.size,
                name: artifact.name,
            })
        })
        .collect::<Result<Vec<_>, ApiError>>()
        .map(Json)
}
