// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared fixtures for assay-environment integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use assay_core::model::{
    Advice, Params, RiskTier, StepCatalog, StepDefinition, StepRun, Task, TaskDraft, TaskFailure,
    TaskStatus, Validation,
};
use assay_core::persistence::{AuditEntry, Pin};
use assay_core::{
    CoreError, EventBus, FsArtifactStore, Persistence, SqlitePersistence, StateMachineConfig,
    StepRunLedger, TaskEvent, TaskStateMachine,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use assay_environment::runner::Runner;
use assay_environment::{Executor, ExecutorConfig};
use serde_json::{Value, json};
use tempfile::TempDir;

pub struct TestEnv {
    pub dir: TempDir,
    pub persistence: Arc<SqlitePersistence>,
    pub machine: TaskStateMachine,
    pub ledger: StepRunLedger,
    pub store: Arc<FsArtifactStore>,
}

/// Environment whose single-cell steps launch `runner_command`.
pub async fn test_env_with(runner_command: &str) -> TestEnv {
    let dir = tempfile::tempdir().expect("tempdir");
    test_env_in(dir, runner_command).await
}

pub async fn test_env() -> TestEnv {
    test_env_with("/opt/assay/runner").await
}

/// Environment whose steps run `body` as a `/bin/sh` script. The script
/// runs inside the task's run directory.
pub async fn script_env(body: &str) -> TestEnv {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("runner.sh");
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).expect("write script");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).expect("chmod");
    let command = path.to_str().expect("utf-8 path").to_string();
    test_env_in(dir, &command).await
}

/// Like [`script_env`], but storing a step run always fails.
pub async fn script_env_failing_finalize(body: &str) -> TestEnv {
    let env = script_env(body).await;
    let failing: Arc<dyn Persistence> = Arc::new(FailingFinalize {
        inner: env.persistence.clone(),
        fail_finalize: AtomicBool::new(true),
    });
    let machine = TaskStateMachine::new(
        failing.clone(),
        env.machine.bus().clone(),
        env.machine.config().clone(),
    );
    TestEnv {
        ledger: StepRunLedger::new(failing),
        machine,
        ..env
    }
}

async fn test_env_in(dir: TempDir, runner_command: &str) -> TestEnv {
    let persistence = SqlitePersistence::in_memory()
        .await
        .expect("Failed to create in-memory SQLite");
    for step in StepCatalog::single_cell(runner_command, "runner:1.0") {
        persistence
            .register_step(&step)
            .await
            .expect("Failed to register step");
    }
    let persistence = Arc::new(persistence);

    let machine = TaskStateMachine::new(
        persistence.clone(),
        Arc::new(EventBus::default()),
        StateMachineConfig {
            cancel_grace: Duration::from_secs(1),
            watchdog_slack: Duration::from_secs(5),
        },
    );
    let store = Arc::new(
        FsArtifactStore::new(dir.path().join("store"), "http://localhost:8080", b"k".to_vec())
            .expect("store"),
    );

    TestEnv {
        ledger: StepRunLedger::new(persistence.clone()),
        dir,
        persistence,
        machine,
        store,
    }
}

impl TestEnv {
    pub fn config(&self) -> ExecutorConfig {
        ExecutorConfig {
            data_dir: self.dir.path().join("data"),
            liveness_timeout: Duration::from_secs(5),
            execution_timeout: Duration::from_secs(30),
            cancel_grace: Duration::from_secs(1),
            diagnostic_tail_lines: 5,
            check_interval: Duration::from_millis(50),
        }
    }

    pub fn executor(&self, runner: Arc<dyn Runner>, config: ExecutorConfig) -> Executor {
        Executor::new(
            self.machine.clone(),
            self.ledger.clone(),
            self.store.clone(),
            runner,
            config,
        )
    }

    /// Create a PENDING qc task.
    pub async fn qc_task(&self) -> Task {
        self.machine
            .create(TaskDraft::new("qc", params(json!({"min_genes": 200}))))
            .await
            .expect("create task")
    }

    pub async fn wait_for_status(&self, task_id: &str, status: TaskStatus) -> Task {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let task = self.machine.get(task_id).await.expect("task");
            if task.status == status {
                return task;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "task {} stuck in {} waiting for {}",
                task_id,
                task.status,
                status
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

pub fn params(value: Value) -> Params {
    serde_json::from_value(value).expect("params must be an object")
}

/// A progress line as a worker would print it.
pub fn progress(phase: &str, progress: f64) -> String {
    json!({
        "phase": phase,
        "progress": progress,
        "message": format!("{} at {}", phase, progress),
        "ts": "2025-03-01T10:00:00Z"
    })
    .to_string()
}

/// Persistence that can be told to reject step-run finalization.
pub struct FailingFinalize {
    pub inner: Arc<SqlitePersistence>,
    pub fail_finalize: AtomicBool,
}

#[async_trait]
impl Persistence for FailingFinalize {
    async fn register_step(
        &self,
        definition: &StepDefinition,
    ) -> Result<StepDefinition, CoreError> {
        self.inner.register_step(definition).await
    }

    async fn get_step(&self, step_ref: &str) -> Result<Option<StepDefinition>, CoreError> {
        self.inner.get_step(step_ref).await
    }

    async fn get_step_version(
        &self,
        step_ref: &str,
        version: i64,
    ) -> Result<Option<StepDefinition>, CoreError> {
        self.inner.get_step_version(step_ref, version).await
    }

    async fn list_steps(&self) -> Result<Vec<StepDefinition>, CoreError> {
        self.inner.list_steps().await
    }

    async fn insert_task(&self, task: &Task) -> Result<(), CoreError> {
        self.inner.insert_task(task).await
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<Task>, CoreError> {
        self.inner.get_task(task_id).await
    }

    async fn transition_task(
        &self,
        task_id: &str,
        from: &[TaskStatus],
        to: TaskStatus,
        failure: Option<&TaskFailure>,
        at: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        self.inner.transition_task(task_id, from, to, failure, at).await
    }

    async fn request_cancel(&self, task_id: &str, at: DateTime<Utc>) -> Result<bool, CoreError> {
        self.inner.request_cancel(task_id, at).await
    }

    async fn record_heartbeat(
        &self,
        task_id: &str,
        phase: Option<&str>,
        progress: f64,
        at: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        self.inner.record_heartbeat(task_id, phase, progress, at).await
    }

    async fn list_tasks_by_status(&self, status: TaskStatus) -> Result<Vec<Task>, CoreError> {
        self.inner.list_tasks_by_status(status).await
    }

    async fn append_event(&self, event: &TaskEvent) -> Result<(), CoreError> {
        self.inner.append_event(event).await
    }

    async fn list_events(&self, task_id: &str) -> Result<Vec<TaskEvent>, CoreError> {
        self.inner.list_events(task_id).await
    }

    async fn enqueue(&self, task_id: &str, at: DateTime<Utc>) -> Result<(), CoreError> {
        self.inner.enqueue(task_id, at).await
    }

    async fn claim_next(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<String>, CoreError> {
        self.inner.claim_next(worker_id, now, lease_until).await
    }

    async fn ack(&self, task_id: &str) -> Result<(), CoreError> {
        self.inner.ack(task_id).await
    }

    async fn queue_depth(&self) -> Result<i64, CoreError> {
        self.inner.queue_depth().await
    }

    async fn insert_step_run(&self, run: &StepRun) -> Result<StepRun, CoreError> {
        self.inner.insert_step_run(run).await
    }

    async fn complete_with_step_run(
        &self,
        run: &StepRun,
        at: DateTime<Utc>,
    ) -> Result<Option<StepRun>, CoreError> {
        if self.fail_finalize.load(Ordering::SeqCst) {
            return Err(CoreError::internal("step_runs table is read-only"));
        }
        self.inner.complete_with_step_run(run, at).await
    }

    async fn get_step_run(&self, step_run_id: &str) -> Result<Option<StepRun>, CoreError> {
        self.inner.get_step_run(step_run_id).await
    }

    async fn get_step_run_by_task(&self, task_id: &str) -> Result<Option<StepRun>, CoreError> {
        self.inner.get_step_run_by_task(task_id).await
    }

    async fn list_lineage(&self, lineage_root_id: &str) -> Result<Vec<StepRun>, CoreError> {
        self.inner.list_lineage(lineage_root_id).await
    }

    async fn list_children(&self, step_run_id: &str) -> Result<Vec<StepRun>, CoreError> {
        self.inner.list_children(step_run_id).await
    }

    async fn referenced_artifacts(&self) -> Result<HashSet<String>, CoreError> {
        self.inner.referenced_artifacts().await
    }

    async fn pin(&self, step_run_id: &str, note: Option<&str>) -> Result<Pin, CoreError> {
        self.inner.pin(step_run_id, note).await
    }

    async fn unpin(&self, step_run_id: &str) -> Result<bool, CoreError> {
        self.inner.unpin(step_run_id).await
    }

    async fn list_pins(&self) -> Result<Vec<Pin>, CoreError> {
        self.inner.list_pins().await
    }

    async fn insert_advice(&self, advice: &Advice) -> Result<(), CoreError> {
        self.inner.insert_advice(advice).await
    }

    async fn get_advice(&self, advice_id: &str) -> Result<Option<Advice>, CoreError> {
        self.inner.get_advice(advice_id).await
    }

    async fn list_advice(&self, step_run_id: &str) -> Result<Vec<Advice>, CoreError> {
        self.inner.list_advice(step_run_id).await
    }

    async fn find_advice_by_task(&self, task_id: &str) -> Result<Option<Advice>, CoreError> {
        self.inner.find_advice_by_task(task_id).await
    }

    async fn update_advice_validation(
        &self,
        advice_id: &str,
        validation: &Validation,
    ) -> Result<(), CoreError> {
        self.inner.update_advice_validation(advice_id, validation).await
    }

    async fn update_advice_risk_tier(
        &self,
        advice_id: &str,
        tier: RiskTier,
    ) -> Result<(), CoreError> {
        self.inner.update_advice_risk_tier(advice_id, tier).await
    }

    async fn update_advice_application(
        &self,
        advice: &Advice,
        expected: &Advice,
    ) -> Result<bool, CoreError> {
        self.inner.update_advice_application(advice, expected).await
    }

    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), CoreError> {
        self.inner.append_audit(entry).await
    }

    async fn list_audit(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Vec<AuditEntry>, CoreError> {
        self.inner.list_audit(entity_type, entity_id).await
    }

    async fn health_check(&self) -> Result<bool, CoreError> {
        self.inner.health_check().await
    }
}
