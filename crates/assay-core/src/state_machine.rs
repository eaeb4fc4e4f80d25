// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task lifecycle.
//!
//! ```text
//!            start()             succeed() / complete(Succeeded)
//! PENDING ───────────► RUNNING ─────────────────────► SUCCEEDED
//!    │                   │  │   complete(Failed)
//!    │                   │  └───────────────────────► FAILED
//!    │ cancel()          │ cancel() + teardown ack
//!    └───────────────────┴──────────────────────────► CANCELED
//! ```
//!
//! Every transition is a conditional update in persistence, so the first
//! writer to reach a terminal status wins and the loser receives
//! `IllegalTransition`. Each successful transition publishes a synthetic
//! `status_changed` event.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{CoreError, Result};
use crate::events::{EventBus, EventKind, Subscription, TaskEvent, TaskSnapshot};
use crate::model::{StepRun, Task, TaskDraft, TaskFailure, TaskOutcome, TaskStatus, new_id};
use crate::persistence::Persistence;

/// State machine configuration.
#[derive(Debug, Clone)]
pub struct StateMachineConfig {
    /// How long a RUNNING task may take to acknowledge cancellation before
    /// it is force-marked CANCELED.
    pub cancel_grace: Duration,
    /// Extra time the watchdog waits past the grace deadline, leaving the
    /// owning executor room to kill the worker itself.
    pub watchdog_slack: Duration,
}

impl Default for StateMachineConfig {
    fn default() -> Self {
        Self {
            cancel_grace: Duration::from_secs(10),
            watchdog_slack: Duration::from_secs(2),
        }
    }
}

/// Result of `query`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskView {
    pub task_id: String,
    pub status: TaskStatus,
    pub phase: Option<String>,
    pub progress: f64,
    pub cancel_requested: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<TaskFailure>,
}

/// Owns task lifecycle transitions and per-task cancellation tokens.
#[derive(Clone)]
pub struct TaskStateMachine {
    persistence: Arc<dyn Persistence>,
    bus: Arc<EventBus>,
    tokens: Arc<DashMap<String, CancellationToken>>,
    queue_notify: Arc<Notify>,
    config: StateMachineConfig,
}

impl TaskStateMachine {
    pub fn new(
        persistence: Arc<dyn Persistence>,
        bus: Arc<EventBus>,
        config: StateMachineConfig,
    ) -> Self {
        Self {
            persistence,
            bus,
            tokens: Arc::new(DashMap::new()),
            queue_notify: Arc::new(Notify::new()),
            config,
        }
    }

    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.persistence
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn config(&self) -> &StateMachineConfig {
        &self.config
    }

    /// Notified whenever a task is enqueued.
    pub fn queue_notify(&self) -> Arc<Notify> {
        self.queue_notify.clone()
    }

    /// Validate a draft, store it as PENDING and enqueue it.
    pub async fn create(&self, draft: TaskDraft) -> Result<Task> {
        let step = self
            .persistence
            .get_step(&draft.step_ref)
            .await?
            .ok_or_else(|| CoreError::InvalidParameters {
                step_ref: draft.step_ref.clone(),
                violations: vec![format!("step '{}' is not registered", draft.step_ref)],
            })?;

        let params = step
            .schema
            .resolve(&draft.params)
            .map_err(|violations| CoreError::InvalidParameters {
                step_ref: draft.step_ref.clone(),
                violations,
            })?;

        if let Some(parent) = &draft.parent_step_run_id
            && self.persistence.get_step_run(parent).await?.is_none()
        {
            return Err(CoreError::not_found("step_run", parent));
        }

        let now = Utc::now();
        let task = Task {
            task_id: new_id(),
            step_ref: step.step_ref.clone(),
            schema_version: step.version,
            status: TaskStatus::Pending,
            params,
            input_artifacts: draft.input_artifacts,
            reference: draft.reference,
            code_identity: draft.code_identity.unwrap_or(step.code_identity),
            parent_step_run_id: draft.parent_step_run_id,
            origin: draft.origin,
            phase: None,
            progress: 0.0,
            cancel_requested: false,
            cancel_requested_at: None,
            failure: None,
            created_at: now,
            started_at: None,
            finished_at: None,
            heartbeat_at: None,
        };

        self.persistence.insert_task(&task).await?;
        self.emit_status(&task.task_id, None, TaskStatus::Pending, None)
            .await;
        self.persistence.enqueue(&task.task_id, now).await?;
        self.queue_notify.notify_one();

        info!(
            task_id = %task.task_id,
            step_ref = %task.step_ref,
            schema_version = task.schema_version,
            "Task created"
        );
        Ok(task)
    }

    /// PENDING → RUNNING. Only one caller can win this transition.
    pub async fn start(&self, task_id: &str) -> Result<Task> {
        let moved = self
            .persistence
            .transition_task(
                task_id,
                &[TaskStatus::Pending],
                TaskStatus::Running,
                None,
                Utc::now(),
            )
            .await?;

        if !moved {
            let current = self.load(task_id).await?;
            return Err(illegal(task_id, current.status, TaskStatus::Running));
        }

        self.emit_status(task_id, Some(TaskStatus::Pending), TaskStatus::Running, None)
            .await;
        debug!(task_id = %task_id, "Task started");
        self.load(task_id).await
    }

    /// RUNNING → SUCCEEDED | FAILED.
    ///
    /// Repeating the call with the outcome already recorded is a no-op.
    pub async fn complete(&self, task_id: &str, outcome: TaskOutcome) -> Result<Task> {
        let target = outcome.status();
        let failure = match &outcome {
            TaskOutcome::Failed(failure) => Some(failure),
            TaskOutcome::Succeeded => None,
        };

        let moved = self
            .persistence
            .transition_task(task_id, &[TaskStatus::Running], target, failure, Utc::now())
            .await?;

        if !moved {
            let current = self.load(task_id).await?;
            if current.status == target {
                return Ok(current);
            }
            warn!(
                task_id = %task_id,
                current = %current.status,
                attempted = %target,
                "Rejected completion of task that already left RUNNING"
            );
            return Err(illegal(task_id, current.status, target));
        }

        self.tokens.remove(task_id);
        self.emit_status(
            task_id,
            Some(TaskStatus::Running),
            target,
            failure.map(|f| f.reason.clone()),
        )
        .await;
        info!(task_id = %task_id, status = %target, "Task completed");
        self.load(task_id).await
    }

    /// RUNNING → SUCCEEDED together with the task's step run.
    ///
    /// Both writes land in one transaction, so subscribers never see
    /// SUCCEEDED without a step run and a failed insert leaves the task
    /// RUNNING.
    pub async fn succeed(&self, run: StepRun) -> Result<StepRun> {
        let task_id = run.task_id.clone();
        let stored = match self
            .persistence
            .complete_with_step_run(&run, Utc::now())
            .await?
        {
            Some(stored) => stored,
            None => {
                let current = self.load(&task_id).await?;
                warn!(
                    task_id = %task_id,
                    current = %current.status,
                    "Rejected success of task that already left RUNNING"
                );
                return Err(illegal(&task_id, current.status, TaskStatus::Succeeded));
            }
        };

        self.tokens.remove(&task_id);
        self.emit_status(&task_id, Some(TaskStatus::Running), TaskStatus::Succeeded, None)
            .await;
        info!(
            task_id = %task_id,
            step_run_id = %stored.step_run_id,
            sequence = stored.sequence,
            "Task succeeded, step run finalized"
        );
        Ok(stored)
    }

    /// Cancel a task.
    ///
    /// PENDING tasks are canceled immediately. RUNNING tasks get their
    /// cancellation flag and token set; the owning executor acknowledges
    /// teardown through [`acknowledge_cancel`](Self::acknowledge_cancel).
    /// If nobody does within the grace period plus slack, a watchdog
    /// force-marks the task CANCELED.
    pub async fn cancel(&self, task_id: &str) -> Result<Task> {
        let current = self.load(task_id).await?;

        if current.status == TaskStatus::Pending {
            let moved = self
                .persistence
                .transition_task(
                    task_id,
                    &[TaskStatus::Pending],
                    TaskStatus::Canceled,
                    None,
                    Utc::now(),
                )
                .await?;
            if moved {
                self.persistence.ack(task_id).await?;
                self.emit_status(
                    task_id,
                    Some(TaskStatus::Pending),
                    TaskStatus::Canceled,
                    Some("canceled before start".to_string()),
                )
                .await;
                info!(task_id = %task_id, "Pending task canceled");
                return self.load(task_id).await;
            }
        }

        let current = self.load(task_id).await?;
        if current.status != TaskStatus::Running {
            return Err(illegal(task_id, current.status, TaskStatus::Canceled));
        }

        let newly_requested = self.persistence.request_cancel(task_id, Utc::now()).await?;
        self.cancellation_token(task_id).cancel();

        if newly_requested && !current.cancel_requested {
            info!(task_id = %task_id, "Cancellation requested for running task");
            let this = self.clone();
            let task_id = task_id.to_string();
            let deadline = self.config.cancel_grace + self.config.watchdog_slack;
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                if let Err(e) = this.force_cancel(&task_id).await {
                    debug!(task_id = %task_id, error = %e, "Cancel watchdog found nothing to do");
                }
            });
        }

        self.load(task_id).await
    }

    /// RUNNING → CANCELED after the executor tore the worker down.
    ///
    /// `forced` records whether the worker had to be killed.
    pub async fn acknowledge_cancel(&self, task_id: &str, forced: bool) -> Result<Task> {
        let reason = if forced {
            "grace deadline elapsed, worker terminated"
        } else {
            "worker acknowledged cancellation"
        };
        self.mark_canceled(task_id, reason).await
    }

    /// Force-mark a task CANCELED if it is still RUNNING.
    pub async fn force_cancel(&self, task_id: &str) -> Result<Task> {
        self.mark_canceled(task_id, "force-marked after grace deadline")
            .await
    }

    async fn mark_canceled(&self, task_id: &str, reason: &str) -> Result<Task> {
        let moved = self
            .persistence
            .transition_task(
                task_id,
                &[TaskStatus::Running],
                TaskStatus::Canceled,
                None,
                Utc::now(),
            )
            .await?;

        if !moved {
            let current = self.load(task_id).await?;
            if current.status == TaskStatus::Canceled {
                return Ok(current);
            }
            warn!(
                task_id = %task_id,
                current = %current.status,
                "Rejected cancellation of task that already finished"
            );
            return Err(illegal(task_id, current.status, TaskStatus::Canceled));
        }

        self.tokens.remove(task_id);
        self.emit_status(
            task_id,
            Some(TaskStatus::Running),
            TaskStatus::Canceled,
            Some(reason.to_string()),
        )
        .await;
        info!(task_id = %task_id, reason = reason, "Task canceled");
        self.load(task_id).await
    }

    /// Current status plus last known phase/progress.
    pub async fn query(&self, task_id: &str) -> Result<TaskView> {
        let task = self.load(task_id).await?;
        let snapshot = self.bus.snapshot(task_id);

        let (phase, progress) = match snapshot {
            Some(s) if s.progress >= task.progress => (s.phase.or(task.phase), s.progress),
            _ => (task.phase, task.progress),
        };

        Ok(TaskView {
            task_id: task.task_id,
            status: task.status,
            phase,
            progress,
            cancel_requested: task.cancel_requested,
            failure: task.failure,
        })
    }

    /// Snapshot plus live tail of a task's events.
    pub async fn subscribe(&self, task_id: &str) -> Result<Subscription> {
        let task = self.load(task_id).await?;
        Ok(self
            .bus
            .subscribe_or_seed(task_id, || TaskSnapshot::from_task(&task)))
    }

    /// Publish a runner event: fan it out, append it to the event log and
    /// refresh the heartbeat for progress events.
    pub async fn publish(&self, task_id: &str, kind: EventKind) -> Option<TaskEvent> {
        let event = self.bus.publish(task_id, kind)?;

        if let Err(e) = self.persistence.append_event(&event).await {
            warn!(task_id = %task_id, error = %e, "Failed to persist task event");
        }

        if let EventKind::Progress {
            phase, progress, ..
        } = &event.kind
            && let Err(e) = self
                .persistence
                .record_heartbeat(task_id, Some(phase), *progress, event.ts)
                .await
        {
            warn!(task_id = %task_id, error = %e, "Failed to record heartbeat");
        }

        Some(event)
    }

    /// Cancellation token of a task, created on first use.
    pub fn cancellation_token(&self, task_id: &str) -> CancellationToken {
        self.tokens
            .entry(task_id.to_string())
            .or_default()
            .clone()
    }

    /// Whether cancellation was requested for a task.
    pub async fn is_cancel_requested(&self, task_id: &str) -> Result<bool> {
        Ok(self.load(task_id).await?.cancel_requested)
    }

    pub async fn get(&self, task_id: &str) -> Result<Task> {
        self.load(task_id).await
    }

    async fn load(&self, task_id: &str) -> Result<Task> {
        self.persistence
            .get_task(task_id)
            .await?
            .ok_or_else(|| CoreError::not_found("task", task_id))
    }

    async fn emit_status(
        &self,
        task_id: &str,
        from: Option<TaskStatus>,
        to: TaskStatus,
        reason: Option<String>,
    ) {
        self.publish(task_id, EventKind::StatusChanged { from, to, reason })
            .await;
    }
}

fn illegal(task_id: &str, from: TaskStatus, to: TaskStatus) -> CoreError {
    CoreError::IllegalTransition {
        task_id: task_id.to_string(),
        from: from.to_string(),
        to: to.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FailureKind, Params, StepCatalog};
    use crate::persistence::SqlitePersistence;
    use serde_json::json;

    async fn machine_with(config: StateMachineConfig) -> TaskStateMachine {
        let persistence = SqlitePersistence::in_memory().await.unwrap();
        for step in StepCatalog::single_cell("runner", "v1") {
            persistence.register_step(&step).await.unwrap();
        }
        TaskStateMachine::new(Arc::new(persistence), Arc::new(EventBus::default()), config)
    }

    async fn machine() -> TaskStateMachine {
        machine_with(StateMachineConfig::default()).await
    }

    fn qc_draft(min_genes: i64) -> TaskDraft {
        let params: Params = serde_json::from_value(json!({"min_genes": min_genes})).unwrap();
        TaskDraft::new("qc", params)
    }

    fn statuses(events: &[TaskEvent]) -> Vec<TaskStatus> {
        events
            .iter()
            .filter_map(|e| match e.kind {
                EventKind::StatusChanged { to, .. } => Some(to),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_create_validates_and_enqueues() {
        let sm = machine().await;
        let task = sm.create(qc_draft(200)).await.unwrap();

        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.params["max_genes"], json!(5000));
        assert_eq!(task.code_identity, "v1");
        assert_eq!(sm.persistence().queue_depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_params() {
        let sm = machine().await;
        let err = sm.create(qc_draft(-1)).await.unwrap_err();
        assert_eq!(err.error_code(), "INVALID_PARAMETERS");

        let err = sm
            .create(TaskDraft::new("nope", Params::new()))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "INVALID_PARAMETERS");
        assert_eq!(sm.persistence().queue_depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_happy_path_status_sequence() {
        let sm = machine().await;
        let task = sm.create(qc_draft(200)).await.unwrap();

        sm.start(&task.task_id).await.unwrap();
        let done = sm
            .complete(&task.task_id, TaskOutcome::Succeeded)
            .await
            .unwrap();
        assert_eq!(done.status, TaskStatus::Succeeded);
        assert_eq!(done.progress, 1.0);

        let events = sm.persistence().list_events(&task.task_id).await.unwrap();
        assert_eq!(
            statuses(&events),
            vec![
                TaskStatus::Pending,
                TaskStatus::Running,
                TaskStatus::Succeeded
            ]
        );
    }

    #[tokio::test]
    async fn test_start_only_from_pending() {
        let sm = machine().await;
        let task = sm.create(qc_draft(200)).await.unwrap();

        sm.start(&task.task_id).await.unwrap();
        let err = sm.start(&task.task_id).await.unwrap_err();
        assert_eq!(err.error_code(), "ILLEGAL_TRANSITION");
    }

    #[tokio::test]
    async fn test_complete_is_idempotent_for_same_outcome() {
        let sm = machine().await;
        let task = sm.create(qc_draft(200)).await.unwrap();
        sm.start(&task.task_id).await.unwrap();

        let failure = TaskOutcome::Failed(TaskFailure::new(FailureKind::ExitCode, "exit 1"));
        sm.complete(&task.task_id, failure.clone()).await.unwrap();
        let again = sm.complete(&task.task_id, failure).await.unwrap();
        assert_eq!(again.status, TaskStatus::Failed);

        let err = sm
            .complete(&task.task_id, TaskOutcome::Succeeded)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "ILLEGAL_TRANSITION");

        let events = sm.persistence().list_events(&task.task_id).await.unwrap();
        assert_eq!(statuses(&events).len(), 3);
    }

    #[tokio::test]
    async fn test_cancel_pending_is_immediate() {
        let sm = machine().await;
        let task = sm.create(qc_draft(200)).await.unwrap();

        let canceled = sm.cancel(&task.task_id).await.unwrap();
        assert_eq!(canceled.status, TaskStatus::Canceled);
        assert_eq!(sm.persistence().queue_depth().await.unwrap(), 0);

        let err = sm.start(&task.task_id).await.unwrap_err();
        assert_eq!(err.error_code(), "ILLEGAL_TRANSITION");
        let err = sm.cancel(&task.task_id).await.unwrap_err();
        assert_eq!(err.error_code(), "ILLEGAL_TRANSITION");
    }

    #[tokio::test]
    async fn test_cancel_running_waits_for_ack() {
        let sm = machine().await;
        let task = sm.create(qc_draft(200)).await.unwrap();
        sm.start(&task.task_id).await.unwrap();
        let token = sm.cancellation_token(&task.task_id);

        let requested = sm.cancel(&task.task_id).await.unwrap();
        assert_eq!(requested.status, TaskStatus::Running);
        assert!(requested.cancel_requested);
        assert!(token.is_cancelled());

        let canceled = sm.acknowledge_cancel(&task.task_id, false).await.unwrap();
        assert_eq!(canceled.status, TaskStatus::Canceled);
    }

    #[tokio::test]
    async fn test_cancel_racing_complete_first_writer_wins() {
        let sm = machine().await;
        let task = sm.create(qc_draft(200)).await.unwrap();
        sm.start(&task.task_id).await.unwrap();
        sm.cancel(&task.task_id).await.unwrap();

        sm.complete(&task.task_id, TaskOutcome::Succeeded)
            .await
            .unwrap();
        let err = sm.acknowledge_cancel(&task.task_id, true).await.unwrap_err();
        assert_eq!(err.error_code(), "ILLEGAL_TRANSITION");
        assert_eq!(
            sm.get(&task.task_id).await.unwrap().status,
            TaskStatus::Succeeded
        );
    }

    fn success_run(task: &Task) -> StepRun {
        let step_run_id = new_id();
        StepRun {
            lineage_root_id: step_run_id.clone(),
            step_run_id,
            task_id: task.task_id.clone(),
            step_ref: task.step_ref.clone(),
            sequence: 0,
            parent_step_run_id: None,
            input_artifacts: vec![],
            params: task.params.clone(),
            code_identity: task.code_identity.clone(),
            schema_version: task.schema_version,
            metrics: Default::default(),
            artifacts: vec![],
            evidence: json!({}),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_succeed_records_step_run_with_status() {
        let sm = machine().await;
        let task = sm.create(qc_draft(200)).await.unwrap();
        let task = sm.start(&task.task_id).await.unwrap();

        let run = sm.succeed(success_run(&task)).await.unwrap();
        assert_eq!(run.sequence, 1);
        assert_eq!(
            sm.get(&task.task_id).await.unwrap().status,
            TaskStatus::Succeeded
        );
        let events = sm.persistence().list_events(&task.task_id).await.unwrap();
        assert_eq!(statuses(&events).last(), Some(&TaskStatus::Succeeded));
    }

    #[tokio::test]
    async fn test_succeed_after_cancel_is_rejected_without_step_run() {
        let sm = machine().await;
        let task = sm.create(qc_draft(200)).await.unwrap();
        let task = sm.start(&task.task_id).await.unwrap();
        sm.cancel(&task.task_id).await.unwrap();
        sm.acknowledge_cancel(&task.task_id, false).await.unwrap();

        let err = sm.succeed(success_run(&task)).await.unwrap_err();
        assert_eq!(err.error_code(), "ILLEGAL_TRANSITION");
        assert!(
            sm.persistence()
                .get_step_run_by_task(&task.task_id)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_watchdog_force_cancels_after_grace() {
        let sm = machine_with(StateMachineConfig {
            cancel_grace: Duration::from_millis(50),
            watchdog_slack: Duration::from_millis(10),
        })
        .await;
        let task = sm.create(qc_draft(200)).await.unwrap();
        sm.start(&task.task_id).await.unwrap();
        sm.cancel(&task.task_id).await.unwrap();

        let mut status = TaskStatus::Running;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            status = sm.get(&task.task_id).await.unwrap().status;
            if status == TaskStatus::Canceled {
                break;
            }
        }
        assert_eq!(status, TaskStatus::Canceled);
    }

    #[tokio::test]
    async fn test_query_and_subscribe_use_latest_snapshot() {
        let sm = machine().await;
        let task = sm.create(qc_draft(200)).await.unwrap();
        sm.start(&task.task_id).await.unwrap();

        sm.publish(
            &task.task_id,
            EventKind::Progress {
                phase: "filter".into(),
                progress: 0.4,
                message: "filtering cells".into(),
            },
        )
        .await
        .unwrap();

        let view = sm.query(&task.task_id).await.unwrap();
        assert_eq!(view.phase.as_deref(), Some("filter"));
        assert_eq!(view.progress, 0.4);

        let mut sub = sm.subscribe(&task.task_id).await.unwrap();
        assert_eq!(sub.snapshot.status, TaskStatus::Running);
        sm.complete(&task.task_id, TaskOutcome::Succeeded)
            .await
            .unwrap();
        let event = sub.receiver.recv().await.unwrap();
        assert!(matches!(
            event.kind,
            EventKind::StatusChanged {
                to: TaskStatus::Succeeded,
                ..
            }
        ));
        assert!(sub.receiver.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_unknown_task() {
        let sm = machine().await;
        assert_eq!(sm.query("nope").await.unwrap_err().error_code(), "NOT_FOUND");
        assert_eq!(sm.cancel("nope").await.unwrap_err().error_code(), "NOT_FOUND");
    }
}
