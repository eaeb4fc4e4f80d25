// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed persistence implementation.

use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};

use crate::error::CoreError;
use crate::events::{EventKind, TaskEvent};
use crate::model::{
    Advice, ApplicationState, RiskTier, StepDefinition, StepRun, Task, TaskFailure, TaskStatus,
    Validation,
};

use super::{AuditEntry, Persistence, Pin};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an existing, migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to a database URL (`sqlite://path?mode=rwc` or `sqlite::memory:`)
    /// and run all migrations.
    pub async fn connect(url: &str) -> Result<Self, CoreError> {
        if url.contains(":memory:") {
            return Self::in_memory().await;
        }

        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Invalid SQLite URL '{}': {}", url, e),
            })?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at '{}': {}", url, e),
            })?;

        MIGRATOR.run(&pool).await?;
        Ok(Self { pool })
    }

    /// Create and initialize a database file, creating parent directories.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::DatabaseError {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        Self::connect(&format!("sqlite:{}?mode=rwc", path.to_string_lossy())).await
    }

    /// Private in-memory database on a single pinned connection.
    pub async fn in_memory() -> Result<Self, CoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        MIGRATOR.run(&pool).await?;
        Ok(Self { pool })
    }

    /// Underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

// ============================================================================
// Row mapping
// ============================================================================

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, CoreError> {
    Ok(serde_json::to_string(value)?)
}

fn from_json<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T, CoreError> {
    Ok(serde_json::from_str(raw)?)
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    task_id: String,
    step_ref: String,
    schema_version: i64,
    status: String,
    params: String,
    input_artifacts: String,
    reference: String,
    code_identity: String,
    parent_step_run_id: Option<String>,
    origin: String,
    phase: Option<String>,
    progress: f64,
    cancel_requested: bool,
    cancel_requested_at: Option<DateTime<Utc>>,
    failure: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    heartbeat_at: Option<DateTime<Utc>>,
}

impl TryFrom<TaskRow> for Task {
    type Error = CoreError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        Ok(Task {
            status: TaskStatus::from_str(&row.status).map_err(CoreError::internal)?,
            params: from_json(&row.params)?,
            input_artifacts: from_json(&row.input_artifacts)?,
            reference: from_json(&row.reference)?,
            origin: from_json(&row.origin)?,
            failure: row.failure.as_deref().map(from_json).transpose()?,
            task_id: row.task_id,
            step_ref: row.step_ref,
            schema_version: row.schema_version,
            code_identity: row.code_identity,
            parent_step_run_id: row.parent_step_run_id,
            phase: row.phase,
            progress: row.progress,
            cancel_requested: row.cancel_requested,
            cancel_requested_at: row.cancel_requested_at,
            created_at: row.created_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
            heartbeat_at: row.heartbeat_at,
        })
    }
}

const TASK_COLUMNS: &str = "task_id, step_ref, schema_version, status, params, input_artifacts, \
    reference, code_identity, parent_step_run_id, origin, phase, progress, cancel_requested, \
    cancel_requested_at, failure, created_at, started_at, finished_at, heartbeat_at";

#[derive(sqlx::FromRow)]
struct StepRunRow {
    step_run_id: String,
    task_id: String,
    step_ref: String,
    lineage_root_id: String,
    sequence: i64,
    parent_step_run_id: Option<String>,
    input_artifacts: String,
    params: String,
    code_identity: String,
    schema_version: i64,
    metrics: String,
    artifacts: String,
    evidence: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<StepRunRow> for StepRun {
    type Error = CoreError;

    fn try_from(row: StepRunRow) -> Result<Self, Self::Error> {
        Ok(StepRun {
            input_artifacts: from_json(&row.input_artifacts)?,
            params: from_json(&row.params)?,
            metrics: from_json(&row.metrics)?,
            artifacts: from_json(&row.artifacts)?,
            evidence: from_json(&row.evidence)?,
            step_run_id: row.step_run_id,
            task_id: row.task_id,
            step_ref: row.step_ref,
            lineage_root_id: row.lineage_root_id,
            sequence: row.sequence,
            parent_step_run_id: row.parent_step_run_id,
            code_identity: row.code_identity,
            schema_version: row.schema_version,
            created_at: row.created_at,
        })
    }
}

const STEP_RUN_COLUMNS: &str = "step_run_id, task_id, step_ref, lineage_root_id, sequence, \
    parent_step_run_id, input_artifacts, params, code_identity, schema_version, metrics, \
    artifacts, evidence, created_at";

#[derive(sqlx::FromRow)]
struct AdviceRow {
    body: String,
    validation: String,
    application_state: String,
    apply_task_id: Option<String>,
    applied_step_run_id: Option<String>,
    rollback_task_id: Option<String>,
    rollback_step_run_id: Option<String>,
    confirmed_by: Option<String>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<AdviceRow> for Advice {
    type Error = CoreError;

    fn try_from(row: AdviceRow) -> Result<Self, Self::Error> {
        let mut advice: Advice = from_json(&row.body)?;
        advice.validation = from_json(&row.validation)?;
        advice.application_state =
            serde_json::from_value::<ApplicationState>(row.application_state.into())?;
        advice.apply_task_id = row.apply_task_id;
        advice.applied_step_run_id = row.applied_step_run_id;
        advice.rollback_task_id = row.rollback_task_id;
        advice.rollback_step_run_id = row.rollback_step_run_id;
        advice.confirmed_by = row.confirmed_by;
        advice.updated_at = row.updated_at;
        Ok(advice)
    }
}

const ADVICE_COLUMNS: &str = "body, validation, application_state, apply_task_id, \
    applied_step_run_id, rollback_task_id, rollback_step_run_id, confirmed_by, updated_at";

#[derive(sqlx::FromRow)]
struct EventRow {
    task_id: String,
    seq: i64,
    payload: String,
    created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct AuditRow {
    actor: String,
    action: String,
    entity_type: String,
    entity_id: String,
    details: String,
    created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct PinRow {
    step_run_id: String,
    note: Option<String>,
    pinned_at: DateTime<Utc>,
}

impl From<PinRow> for Pin {
    fn from(row: PinRow) -> Self {
        Pin {
            step_run_id: row.step_run_id,
            note: row.note,
            pinned_at: row.pinned_at,
        }
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

/// Insert a step run inside an open transaction, assigning its sequence.
async fn insert_step_run_in(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    run: &StepRun,
) -> Result<StepRun, CoreError> {
    let inserted = sqlx::query(
        r#"
        INSERT INTO step_runs (step_run_id, task_id, step_ref, lineage_root_id, sequence,
                               parent_step_run_id, input_artifacts, params, code_identity,
                               schema_version, metrics, artifacts, evidence, created_at)
        SELECT ?, ?, ?, ?, COALESCE(MAX(sequence), 0) + 1, ?, ?, ?, ?, ?, ?, ?, ?, ?
        FROM step_runs
        WHERE lineage_root_id = ?
        "#,
    )
    .bind(&run.step_run_id)
    .bind(&run.task_id)
    .bind(&run.step_ref)
    .bind(&run.lineage_root_id)
    .bind(&run.parent_step_run_id)
    .bind(to_json(&run.input_artifacts)?)
    .bind(to_json(&run.params)?)
    .bind(&run.code_identity)
    .bind(run.schema_version)
    .bind(to_json(&run.metrics)?)
    .bind(to_json(&run.artifacts)?)
    .bind(to_json(&run.evidence)?)
    .bind(run.created_at)
    .bind(&run.lineage_root_id)
    .execute(&mut **tx)
    .await;

    if let Err(e) = inserted {
        if is_unique_violation(&e) {
            return Err(CoreError::DuplicateFinalization {
                task_id: run.task_id.clone(),
            });
        }
        return Err(e.into());
    }

    for artifact in &run.artifacts {
        sqlx::query("INSERT OR IGNORE INTO artifact_links (hash, step_run_id) VALUES (?, ?)")
            .bind(&artifact.hash)
            .bind(&run.step_run_id)
            .execute(&mut **tx)
            .await?;
    }

    let row = sqlx::query_as::<_, StepRunRow>(&format!(
        "SELECT {} FROM step_runs WHERE step_run_id = ?",
        STEP_RUN_COLUMNS
    ))
    .bind(&run.step_run_id)
    .fetch_one(&mut **tx)
    .await?;

    StepRun::try_from(row)
}

#[async_trait::async_trait]
impl Persistence for SqlitePersistence {
    async fn register_step(
        &self,
        definition: &StepDefinition,
    ) -> Result<StepDefinition, CoreError> {
        let mut tx = self.pool.begin().await?;

        let latest: Option<(i64, String)> = sqlx::query_as(
            r#"
            SELECT version, definition FROM steps
            WHERE step_ref = ?
            ORDER BY version DESC
            LIMIT 1
            "#,
        )
        .bind(&definition.step_ref)
        .fetch_optional(&mut *tx)
        .await?;

        let next_version = match latest {
            Some((version, raw)) => {
                let existing: StepDefinition = from_json(&raw)?;
                if existing.same_contract(definition) {
                    tx.commit().await?;
                    return Ok(existing);
                }
                version + 1
            }
            None => 1,
        };

        let mut stored = definition.clone();
        stored.version = next_version;
        stored.registered_at = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO steps (step_ref, version, definition, registered_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&stored.step_ref)
        .bind(stored.version)
        .bind(to_json(&stored)?)
        .bind(stored.registered_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(stored)
    }

    async fn get_step(&self, step_ref: &str) -> Result<Option<StepDefinition>, CoreError> {
        let raw: Option<(String,)> = sqlx::query_as(
            "SELECT definition FROM steps WHERE step_ref = ? ORDER BY version DESC LIMIT 1",
        )
        .bind(step_ref)
        .fetch_optional(&self.pool)
        .await?;

        raw.map(|(raw,)| from_json(&raw)).transpose()
    }

    async fn get_step_version(
        &self,
        step_ref: &str,
        version: i64,
    ) -> Result<Option<StepDefinition>, CoreError> {
        let raw: Option<(String,)> =
            sqlx::query_as("SELECT definition FROM steps WHERE step_ref = ? AND version = ?")
                .bind(step_ref)
                .bind(version)
                .fetch_optional(&self.pool)
                .await?;

        raw.map(|(raw,)| from_json(&raw)).transpose()
    }

    async fn list_steps(&self) -> Result<Vec<StepDefinition>, CoreError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT s.definition FROM steps s
            WHERE s.version = (SELECT MAX(version) FROM steps WHERE step_ref = s.step_ref)
            ORDER BY s.step_ref
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(|(raw,)| from_json(raw)).collect()
    }

    async fn insert_task(&self, task: &Task) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO tasks (task_id, step_ref, schema_version, status, params, input_artifacts,
                               reference, code_identity, parent_step_run_id, origin, phase,
                               progress, cancel_requested, cancel_requested_at, failure, created_at,
                               started_at, finished_at, heartbeat_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&task.task_id)
        .bind(&task.step_ref)
        .bind(task.schema_version)
        .bind(task.status.as_str())
        .bind(to_json(&task.params)?)
        .bind(to_json(&task.input_artifacts)?)
        .bind(to_json(&task.reference)?)
        .bind(&task.code_identity)
        .bind(&task.parent_step_run_id)
        .bind(to_json(&task.origin)?)
        .bind(&task.phase)
        .bind(task.progress)
        .bind(task.cancel_requested)
        .bind(task.cancel_requested_at)
        .bind(task.failure.as_ref().map(to_json).transpose()?)
        .bind(task.created_at)
        .bind(task.started_at)
        .bind(task.finished_at)
        .bind(task.heartbeat_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<Task>, CoreError> {
        let row = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {} FROM tasks WHERE task_id = ?",
            TASK_COLUMNS
        ))
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Task::try_from).transpose()
    }

    async fn transition_task(
        &self,
        task_id: &str,
        from: &[TaskStatus],
        to: TaskStatus,
        failure: Option<&TaskFailure>,
        at: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        if from.is_empty() {
            return Ok(false);
        }

        let placeholders = vec!["?"; from.len()].join(", ");
        let sql = format!(
            r#"
            UPDATE tasks
            SET status = ?,
                started_at = COALESCE(?, started_at),
                finished_at = COALESCE(?, finished_at),
                failure = COALESCE(?, failure),
                progress = CASE WHEN ? THEN 1.0 ELSE progress END
            WHERE task_id = ? AND status IN ({})
            "#,
            placeholders
        );

        let mut query = sqlx::query(&sql)
            .bind(to.as_str())
            .bind((to == TaskStatus::Running).then_some(at))
            .bind(to.is_terminal().then_some(at))
            .bind(failure.map(to_json).transpose()?)
            .bind(to == TaskStatus::Succeeded)
            .bind(task_id);
        for status in from {
            query = query.bind(status.as_str());
        }

        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn request_cancel(&self, task_id: &str, at: DateTime<Utc>) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET cancel_requested = 1,
                cancel_requested_at = COALESCE(cancel_requested_at, ?)
            WHERE task_id = ? AND status = 'RUNNING'
            "#,
        )
        .bind(at)
        .bind(task_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn record_heartbeat(
        &self,
        task_id: &str,
        phase: Option<&str>,
        progress: f64,
        at: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            UPDATE tasks
            SET phase = COALESCE(?, phase),
                progress = MAX(progress, ?),
                heartbeat_at = ?
            WHERE task_id = ? AND status = 'RUNNING'
            "#,
        )
        .bind(phase)
        .bind(progress)
        .bind(at)
        .bind(task_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_tasks_by_status(&self, status: TaskStatus) -> Result<Vec<Task>, CoreError> {
        let rows = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {} FROM tasks WHERE status = ? ORDER BY created_at",
            TASK_COLUMNS
        ))
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Task::try_from).collect()
    }

    async fn append_event(&self, event: &TaskEvent) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO task_events (task_id, seq, event_type, payload, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&event.task_id)
        .bind(event.seq as i64)
        .bind(event.kind.type_name())
        .bind(to_json(&event.kind)?)
        .bind(event.ts)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_events(&self, task_id: &str) -> Result<Vec<TaskEvent>, CoreError> {
        let rows = sqlx::query_as::<_, EventRow>(
            r#"
            SELECT task_id, seq, payload, created_at
            FROM task_events
            WHERE task_id = ?
            ORDER BY id
            "#,
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(TaskEvent {
                    kind: from_json::<EventKind>(&row.payload)?,
                    task_id: row.task_id,
                    seq: row.seq as u64,
                    ts: row.created_at,
                })
            })
            .collect()
    }

    async fn enqueue(&self, task_id: &str, at: DateTime<Utc>) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO task_queue (task_id, enqueued_at_ms)
            VALUES (?, ?)
            "#,
        )
        .bind(task_id)
        .bind(at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn claim_next(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<String>, CoreError> {
        let claimed: Option<(String,)> = sqlx::query_as(
            r#"
            UPDATE task_queue
            SET claimed_by = ?, lease_until_ms = ?, deliveries = deliveries + 1
            WHERE task_id = (
                SELECT task_id FROM task_queue
                WHERE lease_until_ms IS NULL OR lease_until_ms < ?
                ORDER BY enqueued_at_ms, rowid
                LIMIT 1
            )
            RETURNING task_id
            "#,
        )
        .bind(worker_id)
        .bind(lease_until.timestamp_millis())
        .bind(now.timestamp_millis())
        .fetch_optional(&self.pool)
        .await?;

        Ok(claimed.map(|(task_id,)| task_id))
    }

    async fn ack(&self, task_id: &str) -> Result<(), CoreError> {
        sqlx::query("DELETE FROM task_queue WHERE task_id = ?")
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn queue_depth(&self) -> Result<i64, CoreError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM task_queue")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn insert_step_run(&self, run: &StepRun) -> Result<StepRun, CoreError> {
        let mut tx = self.pool.begin().await?;
        let stored = insert_step_run_in(&mut tx, run).await?;
        tx.commit().await?;
        Ok(stored)
    }

    async fn complete_with_step_run(
        &self,
        run: &StepRun,
        at: DateTime<Utc>,
    ) -> Result<Option<StepRun>, CoreError> {
        let mut tx = self.pool.begin().await?;

        let moved = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'SUCCEEDED', finished_at = ?, progress = 1.0
            WHERE task_id = ? AND status = 'RUNNING'
            "#,
        )
        .bind(at)
        .bind(&run.task_id)
        .execute(&mut *tx)
        .await?;

        if moved.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        // Dropping the transaction on error rolls the status back.
        let stored = insert_step_run_in(&mut tx, run).await?;
        tx.commit().await?;
        Ok(Some(stored))
    }

    async fn get_step_run(&self, step_run_id: &str) -> Result<Option<StepRun>, CoreError> {
        let row = sqlx::query_as::<_, StepRunRow>(&format!(
            "SELECT {} FROM step_runs WHERE step_run_id = ?",
            STEP_RUN_COLUMNS
        ))
        .bind(step_run_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(StepRun::try_from).transpose()
    }

    async fn get_step_run_by_task(&self, task_id: &str) -> Result<Option<StepRun>, CoreError> {
        let row = sqlx::query_as::<_, StepRunRow>(&format!(
            "SELECT {} FROM step_runs WHERE task_id = ?",
            STEP_RUN_COLUMNS
        ))
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(StepRun::try_from).transpose()
    }

    async fn list_lineage(&self, lineage_root_id: &str) -> Result<Vec<StepRun>, CoreError> {
        let rows = sqlx::query_as::<_, StepRunRow>(&format!(
            "SELECT {} FROM step_runs WHERE lineage_root_id = ? ORDER BY sequence",
            STEP_RUN_COLUMNS
        ))
        .bind(lineage_root_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(StepRun::try_from).collect()
    }

    async fn list_children(&self, step_run_id: &str) -> Result<Vec<StepRun>, CoreError> {
        let rows = sqlx::query_as::<_, StepRunRow>(&format!(
            "SELECT {} FROM step_runs WHERE parent_step_run_id = ? ORDER BY sequence",
            STEP_RUN_COLUMNS
        ))
        .bind(step_run_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(StepRun::try_from).collect()
    }

    async fn referenced_artifacts(&self) -> Result<HashSet<String>, CoreError> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT DISTINCT hash FROM artifact_links")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(hash,)| hash).collect())
    }

    async fn pin(&self, step_run_id: &str, note: Option<&str>) -> Result<Pin, CoreError> {
        let row = sqlx::query_as::<_, PinRow>(
            r#"
            INSERT INTO step_run_pins (step_run_id, note, pinned_at)
            VALUES (?, ?, ?)
            ON CONFLICT(step_run_id) DO UPDATE SET note = excluded.note
            RETURNING step_run_id, note, pinned_at
            "#,
        )
        .bind(step_run_id)
        .bind(note)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into())
    }

    async fn unpin(&self, step_run_id: &str) -> Result<bool, CoreError> {
        let result = sqlx::query("DELETE FROM step_run_pins WHERE step_run_id = ?")
            .bind(step_run_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_pins(&self) -> Result<Vec<Pin>, CoreError> {
        let rows = sqlx::query_as::<_, PinRow>(
            "SELECT step_run_id, note, pinned_at FROM step_run_pins ORDER BY pinned_at",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Pin::from).collect())
    }

    async fn insert_advice(&self, advice: &Advice) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO advice (advice_id, step_run_id, body, validation, application_state,
                                apply_task_id, applied_step_run_id, rollback_task_id,
                                rollback_step_run_id, confirmed_by, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&advice.advice_id)
        .bind(&advice.step_run_id)
        .bind(to_json(advice)?)
        .bind(to_json(&advice.validation)?)
        .bind(advice.application_state.as_str())
        .bind(&advice.apply_task_id)
        .bind(&advice.applied_step_run_id)
        .bind(&advice.rollback_task_id)
        .bind(&advice.rollback_step_run_id)
        .bind(&advice.confirmed_by)
        .bind(advice.created_at)
        .bind(advice.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_advice(&self, advice_id: &str) -> Result<Option<Advice>, CoreError> {
        let row = sqlx::query_as::<_, AdviceRow>(&format!(
            "SELECT {} FROM advice WHERE advice_id = ?",
            ADVICE_COLUMNS
        ))
        .bind(advice_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Advice::try_from).transpose()
    }

    async fn list_advice(&self, step_run_id: &str) -> Result<Vec<Advice>, CoreError> {
        let rows = sqlx::query_as::<_, AdviceRow>(&format!(
            "SELECT {} FROM advice WHERE step_run_id = ? ORDER BY created_at, rowid",
            ADVICE_COLUMNS
        ))
        .bind(step_run_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Advice::try_from).collect()
    }

    async fn find_advice_by_task(&self, task_id: &str) -> Result<Option<Advice>, CoreError> {
        let row = sqlx::query_as::<_, AdviceRow>(&format!(
            "SELECT {} FROM advice WHERE apply_task_id = ? OR rollback_task_id = ? LIMIT 1",
            ADVICE_COLUMNS
        ))
        .bind(task_id)
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Advice::try_from).transpose()
    }

    async fn update_advice_validation(
        &self,
        advice_id: &str,
        validation: &Validation,
    ) -> Result<(), CoreError> {
        let result = sqlx::query("UPDATE advice SET validation = ? WHERE advice_id = ?")
            .bind(to_json(validation)?)
            .bind(advice_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::not_found("advice", advice_id));
        }
        Ok(())
    }

    async fn update_advice_risk_tier(
        &self,
        advice_id: &str,
        tier: RiskTier,
    ) -> Result<(), CoreError> {
        let result = sqlx::query(
            "UPDATE advice SET body = json_set(body, '$.risk_tier', ?) WHERE advice_id = ?",
        )
        .bind(tier.as_str())
        .bind(advice_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::not_found("advice", advice_id));
        }
        Ok(())
    }

    async fn update_advice_application(
        &self,
        advice: &Advice,
        expected: &Advice,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE advice
            SET application_state = ?, apply_task_id = ?, applied_step_run_id = ?,
                rollback_task_id = ?, rollback_step_run_id = ?, confirmed_by = ?, updated_at = ?
            WHERE advice_id = ?
              AND application_state = ?
              AND apply_task_id IS ?
              AND rollback_task_id IS ?
            "#,
        )
        .bind(advice.application_state.as_str())
        .bind(&advice.apply_task_id)
        .bind(&advice.applied_step_run_id)
        .bind(&advice.rollback_task_id)
        .bind(&advice.rollback_step_run_id)
        .bind(&advice.confirmed_by)
        .bind(advice.updated_at)
        .bind(&advice.advice_id)
        .bind(expected.application_state.as_str())
        .bind(&expected.apply_task_id)
        .bind(&expected.rollback_task_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO audit_log (actor, action, entity_type, entity_id, details, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.actor)
        .bind(&entry.action)
        .bind(&entry.entity_type)
        .bind(&entry.entity_id)
        .bind(to_json(&entry.details)?)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_audit(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Vec<AuditEntry>, CoreError> {
        let rows = sqlx::query_as::<_, AuditRow>(
            r#"
            SELECT actor, action, entity_type, entity_id, details, created_at
            FROM audit_log
            WHERE entity_type = ? AND entity_id = ?
            ORDER BY id
            "#,
        )
        .bind(entity_type)
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(AuditEntry {
                    details: from_json(&row.details)?,
                    actor: row.actor,
                    action: row.action,
                    entity_type: row.entity_type,
                    entity_id: row.entity_id,
                    created_at: row.created_at,
                })
            })
            .collect()
    }

    async fn health_check(&self) -> Result<bool, CoreError> {
        let result: Result<(i64,), _> = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await;
        Ok(result.is_ok())
    }
}
