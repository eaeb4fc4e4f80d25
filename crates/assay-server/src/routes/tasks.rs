// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task API: create, query, cancel, live stream and event history.

use std::convert::Infallible;
use std::sync::Arc;

use assay_core::events::{Subscription, TaskEvent};
use assay_core::model::{Params, Task, TaskDraft, TaskStatus};
use assay_core::TaskView;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::ApiResult;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/tasks", post(create_task))
        .route("/tasks/{id}", get(get_task))
        .route("/tasks/{id}/cancel", post(cancel_task))
        .route("/tasks/{id}/stream", get(stream_task))
        .route("/tasks/{id}/events/history", get(event_history))
}

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    pub step_ref: String,
    #[serde(default)]
    pub params: Params,
    #[serde(default)]
    pub input_artifacts: Vec<String>,
    #[serde(default)]
    pub reference: Value,
}

/// Response of every task-creating endpoint.
#[derive(Debug, Serialize)]
pub struct TaskCreated {
    pub task_id: String,
    pub status: TaskStatus,
    pub status_url: String,
    pub stream_url: String,
}

/// 202 with the links a client polls or streams.
pub(crate) fn accepted(state: &AppState, task: &Task) -> (StatusCode, Json<TaskCreated>) {
    let status_url = state.task_url(&task.task_id);
    let stream_url = format!("{}/stream", status_url);
    (
        StatusCode::ACCEPTED,
        Json(TaskCreated {
            task_id: task.task_id.clone(),
            status: task.status,
            status_url,
            stream_url,
        }),
    )
}

async fn create_task(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<CreateTaskRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<TaskCreated>)> {
    let Json(request) = payload?;
    let draft = TaskDraft {
        input_artifacts: request.input_artifacts,
        reference: request.reference,
        ..TaskDraft::new(request.step_ref, request.params)
    };
    let task = state.machine.create(draft).await?;
    info!(task_id = %task.task_id, step_ref = %task.step_ref, "Task submitted");
    Ok(accepted(&state, &task))
}

async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> ApiResult<Json<TaskView>> {
    Ok(Json(state.machine.query(&task_id).await?))
}

async fn cancel_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> ApiResult<Json<TaskView>> {
    state.machine.cancel(&task_id).await?;
    Ok(Json(state.machine.query(&task_id).await?))
}

/// Snapshot first, then the live tail until the task is terminal.
async fn stream_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let Subscription {
        snapshot,
        mut receiver,
    } = state.machine.subscribe(&task_id).await?;
    debug!(task_id = %task_id, seq = snapshot.seq, "Stream subscriber attached");

    let stream = async_stream::stream! {
        yield Ok(sse_event("snapshot", snapshot.seq, &snapshot));
        while let Some(event) = receiver.recv().await {
            yield Ok(sse_event(event.kind.type_name(), event.seq, &event));
        }
    };
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn sse_event<T: Serialize>(name: &str, seq: u64, payload: &T) -> Event {
    Event::default()
        .event(name)
        .id(seq.to_string())
        .json_data(payload)
        .unwrap_or_else(|e| Event::default().event("error").data(e.to_string()))
}

async fn event_history(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> ApiResult<Json<Vec<TaskEvent>>> {
    state.machine.get(&task_id).await?;
    Ok(Json(state.persistence().list_events(&task_id).await?))
}
