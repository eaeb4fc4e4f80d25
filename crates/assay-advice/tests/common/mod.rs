// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared fixtures for assay-advice integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use assay_advice::{AdviceConfig, AdvicePipeline, AdviceTools};
use assay_core::model::{
    Finalization, Params, StepCatalog, StepRun, Task, TaskDraft, TaskOutcome, TaskStatus,
};
use assay_core::{
    EventBus, FsArtifactStore, LifecycleHook, Persistence, SqlitePersistence, StateMachineConfig,
    StepRunLedger, TaskStateMachine,
};
use serde_json::{Value, json};
use tempfile::TempDir;

pub struct Harness {
    pub dir: TempDir,
    pub persistence: Arc<SqlitePersistence>,
    pub machine: TaskStateMachine,
    pub ledger: StepRunLedger,
    pub store: Arc<FsArtifactStore>,
}

pub async fn harness() -> Harness {
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
        FsArtifactStore::new(dir.path().join("store"), "http://localhost:8080", b"k".to_vec())
            .expect("store"),
    );

    Harness {
        machine: TaskStateMachine::new(
            persistence.clone(),
            Arc::new(EventBus::default()),
            StateMachineConfig::default(),
        ),
        ledger: StepRunLedger::new(persistence.clone()),
        dir,
        persistence,
        store,
    }
}

pub fn params(value: Value) -> Params {
    serde_json::from_value(value).expect("params must be an object")
}

impl Harness {
    pub fn tools(&self) -> AdviceTools {
        AdviceTools::new(self.machine.clone(), self.ledger.clone(), self.store.clone())
    }

    pub fn pipeline(&self, config: AdviceConfig) -> AdvicePipeline {
        AdvicePipeline::new(self.tools(), config).expect("pipeline")
    }

    /// Pipeline with hooks-driven automation switched off.
    pub fn manual_pipeline(&self) -> AdvicePipeline {
        self.pipeline(AdviceConfig {
            auto_advice: false,
            ..Default::default()
        })
    }

    /// Run a created task to SUCCEEDED and finalize it, without hooks.
    pub async fn succeed(&self, task_id: &str, metrics: Value) -> (Task, StepRun) {
        self.machine.start(task_id).await.expect("start");
        let task = self
            .machine
            .complete(task_id, TaskOutcome::Succeeded)
            .await
            .expect("complete");
        let run = self
            .ledger
            .finalize(Finalization {
                task_id: task.task_id.clone(),
                input_artifacts: task.input_artifacts.clone(),
                params: task.params.clone(),
                code_identity: task.code_identity.clone(),
                metrics: serde_json::from_value(metrics).expect("metrics must be an object"),
                artifacts: vec![],
                evidence: json!({}),
            })
            .await
            .expect("finalize");
        (task, run)
    }

    /// Submit a draft and run it to success.
    pub async fn run(&self, draft: TaskDraft, metrics: Value) -> StepRun {
        let task = self.machine.create(draft).await.expect("create");
        self.succeed(&task.task_id, metrics).await.1
    }

    /// Complete a task the way the executor does, then notify `hook`.
    pub async fn finish_with_hook(
        &self,
        hook: &dyn LifecycleHook,
        task_id: &str,
        metrics: Value,
    ) -> StepRun {
        let (task, run) = self.succeed(task_id, metrics).await;
        hook.on_task_finished(&task, Some(&run))
            .await
            .expect("hook");
        run
    }

    pub async fn tasks_with_status(&self, status: TaskStatus) -> usize {
        self.persistence
            .list_tasks_by_status(status)
            .await
            .expect("list tasks")
            .len()
    }
}
