// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Router fixtures for assay-server integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use assay_advice::{AdviceConfig, AdvicePipeline, AdviceTools};
use assay_core::model::{ArtifactRef, Finalization, StepCatalog, StepRun, TaskOutcome};
use assay_core::{
    ArtifactStore, EventBus, FsArtifactStore, Persistence, SqlitePersistence, StateMachineConfig,
    StepRunLedger, TaskStateMachine,
};
use assay_server::{AppState, build_router};
use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use axum::response::Response;
use serde_json::{Value, json};
use tempfile::TempDir;
use tower::ServiceExt;

pub const PUBLIC_URL: &str = "http://assay.test";

pub struct TestApp {
    pub dir: TempDir,
    pub state: Arc<AppState>,
    pub store: Arc<FsArtifactStore>,
}

/// App over an in-memory database with the single-cell steps registered.
/// No workers run; tests drive task transitions directly.
pub async fn app() -> TestApp {
    let dir = tempfile::tempdir().expect("tempdir");
    let persistence = SqlitePersistence::in_memory()
        .await
        .expect("Failed to create in-memory SQLite");
    for step in StepCatalog::single_cell("/opt/assay/runner", "runner:1.0") {
        persistence
            .register_step(&step)
            .await
            .expect("Failed to register step");
    }
    let persistence = Arc::new(persistence);
    let store = Arc::new(
        FsArtifactStore::new(dir.path().join("store"), PUBLIC_URL, b"test-key".to_vec())
            .expect("store"),
    );

    let machine = TaskStateMachine::new(
        persistence.clone(),
        Arc::new(EventBus::default()),
        StateMachineConfig::default(),
    );
    let ledger = StepRunLedger::new(persistence);
    let advice = AdvicePipeline::new(
        AdviceTools::new(machine, ledger, store.clone()),
        AdviceConfig {
            auto_advice: false,
            ..Default::default()
        },
    )
    .expect("pipeline");

    let state = Arc::new(AppState::new(
        Arc::new(advice),
        store.clone(),
        PUBLIC_URL,
        Duration::from_secs(600),
    ));
    TestApp { dir, state, store }
}

impl TestApp {
    pub fn router(&self) -> Router {
        build_router(self.state.clone())
    }

    pub async fn send(&self, request: Request<Body>) -> Response {
        self.router()
            .oneshot(request)
            .await
            .unwrap_or_else(|err| panic!("router request failed: {err}"))
    }

    pub async fn get(&self, uri: &str) -> (StatusCode, Value) {
        let response = self
            .send(Request::get(uri).body(Body::empty()).expect("request"))
            .await;
        let status = response.status();
        (status, response_json(response).await)
    }

    pub async fn post(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        let response = self
            .send(
                Request::post(uri)
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body.to_string()))
                    .expect("request"),
            )
            .await;
        let status = response.status();
        (status, response_json(response).await)
    }

    pub async fn delete(&self, uri: &str) -> (StatusCode, Value) {
        let response = self
            .send(Request::delete(uri).body(Body::empty()).expect("request"))
            .await;
        let status = response.status();
        (status, response_json(response).await)
    }

    /// Submit through the API and return the task id.
    pub async fn submit(&self, step_ref: &str, params: Value) -> String {
        let (status, body) = self
            .post("/api/v1/tasks", json!({"step_ref": step_ref, "params": params}))
            .await;
        assert_eq!(status, StatusCode::ACCEPTED, "{body}");
        body["task_id"].as_str().expect("task_id").to_string()
    }

    /// Run a task to SUCCEEDED the way the executor does.
    pub async fn succeed(
        &self,
        task_id: &str,
        metrics: Value,
        artifacts: Vec<ArtifactRef>,
    ) -> StepRun {
        let machine = &self.state.machine;
        machine.start(task_id).await.expect("start");
        let task = machine
            .complete(task_id, TaskOutcome::Succeeded)
            .await
            .expect("complete");
        self.state
            .ledger
            .finalize(Finalization {
                task_id: task.task_id.clone(),
                input_artifacts: task.input_artifacts.clone(),
                params: task.params.clone(),
                code_identity: task.code_identity.clone(),
                metrics: serde_json::from_value(metrics).expect("metrics must be an object"),
                artifacts,
                evidence: json!({}),
            })
            .await
            .expect("finalize")
    }

    pub async fn store_artifact(&self, bytes: &[u8], kind: &str) -> ArtifactRef {
        self.store.put(bytes, kind, None).await.expect("put")
    }
}

pub async fn body_bytes(response: Response) -> Vec<u8> {
    to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap_or_else(|err| panic!("failed to read response body: {err}"))
        .to_vec()
}

pub async fn response_json(response: Response) -> Value {
    let bytes = body_bytes(response).await;
    if bytes.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(&bytes).unwrap_or_else(|err| {
        panic!(
            "response body is not JSON: {err}; body={}",
            String::from_utf8_lossy(&bytes)
        )
    })
}
