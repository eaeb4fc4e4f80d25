// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task records and lifecycle states.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::Params;

/// Lifecycle status of a task.
///
/// `Pending` and `Running` are the only non-terminal states. A task never
/// re-enters a state it has left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Created and queued, not yet claimed by an executor.
    Pending,
    /// Owned by exactly one executor.
    Running,
    /// Runner exited cleanly and its outputs were persisted.
    Succeeded,
    /// Runner failed, timed out or produced unusable outputs.
    Failed,
    /// Canceled before or during execution.
    Canceled,
}

impl TaskStatus {
    /// Stored representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Canceled => "CANCELED",
        }
    }

    /// Whether no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }

    /// Whether `self -> next` is an edge of the lifecycle graph.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Canceled)
                | (Self::Running, Self::Succeeded)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Canceled)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "SUCCEEDED" => Ok(Self::Succeeded),
            "FAILED" => Ok(Self::Failed),
            "CANCELED" => Ok(Self::Canceled),
            other => Err(format!("unknown task status '{}'", other)),
        }
    }
}

/// Why a task failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// No valid progress event within the liveness timeout.
    RunnerUnresponsive,
    /// Output artifact missing, mismatched or not uploadable.
    ArtifactPersistError,
    /// Runner exited with a non-zero code.
    ExitCode,
    /// Overall execution time limit exceeded.
    Timeout,
    /// Runner exited cleanly but `outputs.json` was missing or malformed.
    ContractViolation,
    /// Runner process could not be started.
    LaunchFailed,
    /// Orchestrator-side failure.
    Internal,
}

impl FailureKind {
    /// Stored representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RunnerUnresponsive => "runner_unresponsive",
            Self::ArtifactPersistError => "artifact_persist_error",
            Self::ExitCode => "exit_code",
            Self::Timeout => "timeout",
            Self::ContractViolation => "contract_violation",
            Self::LaunchFailed => "launch_failed",
            Self::Internal => "internal",
        }
    }
}

/// Failure details retained on the task for postmortem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    /// Failure category.
    pub kind: FailureKind,
    /// Human-readable reason.
    pub reason: String,
    /// Last output lines of the runner.
    #[serde(default)]
    pub diagnostic_tail: Vec<String>,
}

impl TaskFailure {
    /// Failure without diagnostic lines.
    pub fn new(kind: FailureKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
            diagnostic_tail: Vec::new(),
        }
    }

    /// Attach the runner's diagnostic tail.
    pub fn with_tail(mut self, tail: Vec<String>) -> Self {
        self.diagnostic_tail = tail;
        self
    }
}

/// Terminal outcome reported by the executor through `complete`.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// Runner succeeded.
    Succeeded,
    /// Runner failed.
    Failed(TaskFailure),
}

impl TaskOutcome {
    /// Status this outcome transitions to.
    pub fn status(&self) -> TaskStatus {
        match self {
            Self::Succeeded => TaskStatus::Succeeded,
            Self::Failed(_) => TaskStatus::Failed,
        }
    }
}

/// How a task came to exist.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskOrigin {
    /// Direct client submission.
    #[default]
    Submitted,
    /// Cloned from an existing step run.
    Clone {
        /// Source step run.
        source_step_run_id: String,
    },
    /// Spawned by applying an advice patch.
    AdviceApply {
        /// Applied advice.
        advice_id: String,
    },
    /// Spawned by rolling back an applied advice.
    AdviceRollback {
        /// Rolled-back advice.
        advice_id: String,
    },
}

/// A task that has not been created yet.
///
/// Produced by clients and by `StepRunLedger::clone_run`; passed to
/// `TaskStateMachine::create`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TaskDraft {
    /// Registered step to run.
    pub step_ref: String,
    /// Parameters before schema resolution.
    #[serde(default)]
    pub params: Params,
    /// Content hashes of input artifacts.
    #[serde(default)]
    pub input_artifacts: Vec<String>,
    /// Reference data pointers handed to the runner verbatim.
    #[serde(default)]
    pub reference: Value,
    /// Overrides the step's code identity (code patches).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_identity: Option<String>,
    /// Step run this task derives from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_step_run_id: Option<String>,
    /// Provenance of the draft.
    #[serde(default)]
    pub origin: TaskOrigin,
}

impl TaskDraft {
    /// Draft for a direct submission.
    pub fn new(step_ref: impl Into<String>, params: Params) -> Self {
        Self {
            step_ref: step_ref.into(),
            params,
            reference: Value::Null,
            ..Default::default()
        }
    }
}

/// One scheduled execution unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Task ID (UUID)
    pub task_id: String,
    /// Owning step reference.
    pub step_ref: String,
    /// Schema version the params were validated against.
    pub schema_version: i64,
    /// Current status.
    pub status: TaskStatus,
    /// Resolved parameter set.
    pub params: Params,
    /// Content hashes of input artifacts.
    pub input_artifacts: Vec<String>,
    /// Reference data pointers.
    pub reference: Value,
    /// Code/image identity the runner is launched with.
    pub code_identity: String,
    /// Step run this task derives from.
    pub parent_step_run_id: Option<String>,
    /// Provenance.
    pub origin: TaskOrigin,
    /// Last reported phase.
    pub phase: Option<String>,
    /// Last reported progress in `[0, 1]`.
    pub progress: f64,
    /// Cooperative cancellation flag.
    pub cancel_requested: bool,
    /// When cancellation was requested.
    pub cancel_requested_at: Option<DateTime<Utc>>,
    /// Failure details (FAILED only).
    pub failure: Option<TaskFailure>,
    /// When the task was created.
    pub created_at: DateTime<Utc>,
    /// When an executor started it.
    pub started_at: Option<DateTime<Utc>>,
    /// When it reached a terminal status.
    pub finished_at: Option<DateTime<Utc>>,
    /// Last valid progress event.
    pub heartbeat_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_graph() {
        use TaskStatus::*;
        let all = [Pending, Running, Succeeded, Failed, Canceled];
        let allowed = [
            (Pending, Running),
            (Pending, Canceled),
            (Running, Succeeded),
            (Running, Failed),
            (Running, Canceled),
        ];

        for from in all {
            for to in all {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        for status in [
            TaskStatus::Succeeded,
            TaskStatus::Failed,
            TaskStatus::Canceled,
        ] {
            assert!(status.is_terminal());
            assert!(!status.can_transition_to(TaskStatus::Running));
        }
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
    }

    #[test]
    fn test_status_string_roundtrip() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Succeeded,
            TaskStatus::Failed,
            TaskStatus::Canceled,
        ] {
            assert_eq!(status.as_str().parse::<TaskStatus>(), Ok(status));
        }
        assert!("DONE".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_origin_serialization() {
        let origin = TaskOrigin::AdviceApply {
            advice_id: "a1".into(),
        };
        let json = serde_json::to_value(&origin).unwrap();
        assert_eq!(json["kind"], "advice_apply");
        assert_eq!(json["advice_id"], "a1");
    }
}
