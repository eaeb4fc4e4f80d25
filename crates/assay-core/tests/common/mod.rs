// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared fixtures for assay-core integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use assay_core::model::{
    Finalization, Params, StepCatalog, StepRun, Task, TaskDraft, TaskOutcome,
};
use assay_core::{
    EventBus, Persistence, SqlitePersistence, StateMachineConfig, StepRunLedger, TaskStateMachine,
};
use serde_json::{Value, json};

pub struct Harness {
    pub machine: TaskStateMachine,
    pub ledger: StepRunLedger,
}

pub async fn harness() -> Harness {
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

    Harness {
        machine: TaskStateMachine::new(
            persistence.clone(),
            Arc::new(EventBus::default()),
            StateMachineConfig::default(),
        ),
        ledger: StepRunLedger::new(persistence),
    }
}

pub fn params(value: Value) -> Params {
    serde_json::from_value(value).expect("params must be an object")
}

impl Harness {
    /// Drive a draft through create/start/complete and finalize its step run.
    pub async fn run_to_success(&self, draft: TaskDraft, metrics: Value) -> StepRun {
        let task = self.machine.create(draft).await.expect("create");
        self.machine.start(&task.task_id).await.expect("start");
        let task = self
            .machine
            .complete(&task.task_id, TaskOutcome::Succeeded)
            .await
            .expect("complete");
        self.ledger
            .finalize(finalization(&task, metrics))
            .await
            .expect("finalize")
    }
}

pub fn finalization(task: &Task, metrics: Value) -> Finalization {
    Finalization {
        task_id: task.task_id.clone(),
        input_artifacts: task.input_artifacts.clone(),
        params: task.params.clone(),
        code_identity: task.code_identity.clone(),
        metrics: serde_json::from_value(metrics).expect("metrics must be an object"),
        artifacts: vec![],
        evidence: json!({}),
    }
}
