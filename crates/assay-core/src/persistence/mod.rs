// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interface and the SQLite backend.
//!
//! The trait speaks in domain types; row mapping stays inside the backend.

pub mod sqlite;

pub use self::sqlite::SqlitePersistence;

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CoreError;
use crate::events::TaskEvent;
use crate::model::{
    Advice, RiskTier, StepDefinition, StepRun, Task, TaskFailure, TaskStatus, Validation,
};

/// One audit log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Who acted ("system", a user name, ...).
    pub actor: String,
    /// What happened ("advice.generate", "advice.apply", ...).
    pub action: String,
    /// Kind of the affected entity.
    pub entity_type: String,
    pub entity_id: String,
    pub details: Value,
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    /// Entry stamped with the current time.
    pub fn now(
        actor: impl Into<String>,
        action: impl Into<String>,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        details: Value,
    ) -> Self {
        Self {
            actor: actor.into(),
            action: action.into(),
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            details,
            created_at: Utc::now(),
        }
    }
}

/// A step-run pin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pin {
    pub step_run_id: String,
    pub note: Option<String>,
    pub pinned_at: DateTime<Utc>,
}

/// Storage operations required by the state machine, the ledger, the queue
/// and the advice pipeline.
///
/// Transition methods are conditional: they only succeed when the stored
/// status is one of the expected ones, which makes them the serialization
/// point for concurrent cancel/complete races.
#[async_trait]
pub trait Persistence: Send + Sync {
    // ------------------------------------------------------------------
    // Steps
    // ------------------------------------------------------------------

    /// Store a step definition under the next version of its `step_ref`.
    ///
    /// When the latest stored version describes the same contract it is
    /// returned unchanged.
    async fn register_step(&self, definition: &StepDefinition)
    -> Result<StepDefinition, CoreError>;

    /// Latest version of a step.
    async fn get_step(&self, step_ref: &str) -> Result<Option<StepDefinition>, CoreError>;

    /// A specific version of a step.
    async fn get_step_version(
        &self,
        step_ref: &str,
        version: i64,
    ) -> Result<Option<StepDefinition>, CoreError>;

    /// Latest version of every step, ordered by `step_ref`.
    async fn list_steps(&self) -> Result<Vec<StepDefinition>, CoreError>;

    // ------------------------------------------------------------------
    // Tasks
    // ------------------------------------------------------------------

    async fn insert_task(&self, task: &Task) -> Result<(), CoreError>;

    async fn get_task(&self, task_id: &str) -> Result<Option<Task>, CoreError>;

    /// Move a task to `to` if its status is one of `from`.
    ///
    /// Sets `started_at` when entering RUNNING and `finished_at` when
    /// entering a terminal status. Returns whether the row changed.
    async fn transition_task(
        &self,
        task_id: &str,
        from: &[TaskStatus],
        to: TaskStatus,
        failure: Option<&TaskFailure>,
        at: DateTime<Utc>,
    ) -> Result<bool, CoreError>;

    /// Set the cooperative cancellation flag of a RUNNING task.
    async fn request_cancel(&self, task_id: &str, at: DateTime<Utc>) -> Result<bool, CoreError>;

    /// Record the latest phase/progress and refresh the heartbeat.
    async fn record_heartbeat(
        &self,
        task_id: &str,
        phase: Option<&str>,
        progress: f64,
        at: DateTime<Utc>,
    ) -> Result<(), CoreError>;

    async fn list_tasks_by_status(&self, status: TaskStatus) -> Result<Vec<Task>, CoreError>;

    // ------------------------------------------------------------------
    // Event log
    // ------------------------------------------------------------------

    async fn append_event(&self, event: &TaskEvent) -> Result<(), CoreError>;

    /// Events of a task in publication order.
    async fn list_events(&self, task_id: &str) -> Result<Vec<TaskEvent>, CoreError>;

    // ------------------------------------------------------------------
    // Durable queue
    // ------------------------------------------------------------------

    /// Add a task to the queue. Enqueuing twice is a no-op.
    async fn enqueue(&self, task_id: &str, at: DateTime<Utc>) -> Result<(), CoreError>;

    /// Lease the oldest entry that is unclaimed or whose lease expired.
    async fn claim_next(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<String>, CoreError>;

    /// Remove an entry after it has been consumed.
    async fn ack(&self, task_id: &str) -> Result<(), CoreError>;

    async fn queue_depth(&self) -> Result<i64, CoreError>;

    // ------------------------------------------------------------------
    // Step runs
    // ------------------------------------------------------------------

    /// Insert a step run, assigning its sequence within the lineage.
    ///
    /// Fails with `DuplicateFinalization` if the task already has one.
    async fn insert_step_run(&self, run: &StepRun) -> Result<StepRun, CoreError>;

    /// Move a RUNNING task to SUCCEEDED and insert its step run in one
    /// transaction. Returns `None` and writes nothing when the task is no
    /// longer RUNNING; on error neither write is kept.
    async fn complete_with_step_run(
        &self,
        run: &StepRun,
        at: DateTime<Utc>,
    ) -> Result<Option<StepRun>, CoreError>;

    async fn get_step_run(&self, step_run_id: &str) -> Result<Option<StepRun>, CoreError>;

    async fn get_step_run_by_task(&self, task_id: &str) -> Result<Option<StepRun>, CoreError>;

    /// Every run of a lineage, ordered by sequence.
    async fn list_lineage(&self, lineage_root_id: &str) -> Result<Vec<StepRun>, CoreError>;

    /// Direct children of a step run.
    async fn list_children(&self, step_run_id: &str) -> Result<Vec<StepRun>, CoreError>;

    /// Hashes referenced by any step run.
    async fn referenced_artifacts(&self) -> Result<HashSet<String>, CoreError>;

    async fn pin(&self, step_run_id: &str, note: Option<&str>) -> Result<Pin, CoreError>;

    /// Returns whether a pin existed.
    async fn unpin(&self, step_run_id: &str) -> Result<bool, CoreError>;

    async fn list_pins(&self) -> Result<Vec<Pin>, CoreError>;

    // ------------------------------------------------------------------
    // Advice
    // ------------------------------------------------------------------

    async fn insert_advice(&self, advice: &Advice) -> Result<(), CoreError>;

    async fn get_advice(&self, advice_id: &str) -> Result<Option<Advice>, CoreError>;

    async fn list_advice(&self, step_run_id: &str) -> Result<Vec<Advice>, CoreError>;

    /// Advice whose apply or rollback task is `task_id`.
    async fn find_advice_by_task(&self, task_id: &str) -> Result<Option<Advice>, CoreError>;

    /// Overwrite only the validation field.
    async fn update_advice_validation(
        &self,
        advice_id: &str,
        validation: &Validation,
    ) -> Result<(), CoreError>;

    /// Overwrite the stored risk tier.
    async fn update_advice_risk_tier(
        &self,
        advice_id: &str,
        tier: RiskTier,
    ) -> Result<(), CoreError>;

    /// Overwrite the application fields of `advice` if the stored state,
    /// apply task and rollback task still equal those of `expected`.
    /// Returns whether the row changed.
    async fn update_advice_application(
        &self,
        advice: &Advice,
        expected: &Advice,
    ) -> Result<bool, CoreError>;

    // ------------------------------------------------------------------
    // Audit
    // ------------------------------------------------------------------

    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), CoreError>;

    async fn list_audit(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Vec<AuditEntry>, CoreError>;

    /// Check database connectivity.
    async fn health_check(&self) -> Result<bool, CoreError>;
}
