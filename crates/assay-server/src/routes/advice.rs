// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Advice endpoints and the agent tool surface.

use std::sync::Arc;

use assay_advice::{ApplyReceipt, ApplyRequest, PatchOutcome, PlotSpec, ThresholdSuggestion};
use assay_core::model::{Advice, ArtifactRef, Patch};
use assay_core::persistence::AuditEntry;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use super::tasks::{TaskCreated, accepted};
use crate::error::ApiResult;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/step-runs/{id}/advice", get(list_advice).post(generate))
        .route("/advice/{id}", get(get_advice))
        .route("/advice/{id}/audit", get(audit_log))
        .route("/advice/{id}/dry-run", post(dry_run))
        .route("/advice/{id}/apply", post(apply))
        .route("/advice/{id}/rollback", post(rollback))
        .route("/tools/suggest-threshold", post(suggest_threshold))
        .route("/tools/render-plot", post(render_plot))
        .route("/tools/apply-patch", post(apply_patch))
}

#[derive(Debug, Deserialize)]
struct ActorQuery {
    #[serde(default = "anonymous")]
    actor: String,
}

fn anonymous() -> String {
    "anonymous".to_string()
}

async fn generate(
    State(state): State<Arc<AppState>>,
    Path(step_run_id): Path<String>,
    query: Result<Query<ActorQuery>, QueryRejection>,
) -> ApiResult<(StatusCode, Json<Vec<Advice>>)> {
    let Query(query) = query?;
    let advice = state.advice.generate(&step_run_id, &query.actor).await?;
    Ok((StatusCode::CREATED, Json(advice)))
}

async fn list_advice(
    State(state): State<Arc<AppState>>,
    Path(step_run_id): Path<String>,
) -> ApiResult<Json<Vec<Advice>>> {
    Ok(Json(state.advice.list(&step_run_id).await?))
}

async fn get_advice(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Advice>> {
    Ok(Json(state.advice.get(&id).await?))
}

async fn audit_log(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<AuditEntry>>> {
    state.advice.get(&id).await?;
    Ok(Json(state.advice.audit_log(&id).await?))
}

async fn dry_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    query: Result<Query<ActorQuery>, QueryRejection>,
) -> ApiResult<Json<Advice>> {
    let Query(query) = query?;
    Ok(Json(state.advice.dry_run(&id, &query.actor).await?))
}

/// Advice after apply/rollback plus the spawned task's links.
#[derive(Debug, Serialize)]
struct ReceiptResponse {
    advice: Advice,
    task: TaskCreated,
}

fn receipt(state: &AppState, receipt: ApplyReceipt) -> (StatusCode, Json<ReceiptResponse>) {
    let (status, Json(task)) = accepted(state, &receipt.task);
    (
        status,
        Json(ReceiptResponse {
            advice: receipt.advice,
            task,
        }),
    )
}

async fn apply(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    payload: Result<Json<ApplyRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<ReceiptResponse>)> {
    let Json(request) = payload?;
    let applied = state.advice.apply(&id, &request).await?;
    Ok(receipt(&state, applied))
}

async fn rollback(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    query: Result<Query<ActorQuery>, QueryRejection>,
) -> ApiResult<(StatusCode, Json<ReceiptResponse>)> {
    let Query(query) = query?;
    let rolled_back = state.advice.rollback(&id, &query.actor).await?;
    Ok(receipt(&state, rolled_back))
}

#[derive(Debug, Deserialize)]
struct SuggestThresholdRequest {
    metric_key: String,
    distribution: Vec<f64>,
}

async fn suggest_threshold(
    payload: Result<Json<SuggestThresholdRequest>, JsonRejection>,
) -> ApiResult<Json<ThresholdSuggestion>> {
    let Json(request) = payload?;
    Ok(Json(assay_advice::suggest_threshold(
        &request.metric_key,
        &request.distribution,
    )?))
}

#[derive(Debug, Deserialize)]
struct RenderPlotRequest {
    step_run_id: String,
    #[serde(default)]
    spec: PlotSpec,
}

async fn render_plot(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<RenderPlotRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<ArtifactRef>)> {
    let Json(request) = payload?;
    let artifact = state
        .advice
        .tools()
        .render_plot(&request.step_run_id, &request.spec)
        .await?;
    Ok((StatusCode::CREATED, Json(artifact)))
}

#[derive(Debug, Deserialize)]
struct ApplyPatchRequest {
    step_run_id: String,
    patch: Patch,
    #[serde(default = "default_dry_run")]
    dry_run: bool,
    /// Accept a high-risk patch.
    #[serde(default)]
    confirm: bool,
}

fn default_dry_run() -> bool {
    true
}

async fn apply_patch(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ApplyPatchRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<PatchOutcome>)> {
    let Json(request) = payload?;
    let outcome = state
        .advice
        .tools()
        .apply_patch(
            &request.step_run_id,
            &request.patch,
            request.dry_run,
            request.confirm,
        )
        .await?;
    let status = match outcome {
        PatchOutcome::Created { .. } => StatusCode::ACCEPTED,
        _ => StatusCode::OK,
    };
    Ok((status, Json(outcome)))
}
