// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Immutable step-run snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{ArtifactRef, Metrics, Params};

/// Frozen record of one finished runner invocation.
///
/// There is no mutator: the ledger only inserts these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRun {
    pub step_run_id: String,
    /// Owning task.
    pub task_id: String,
    pub step_ref: String,
    /// Root of the lineage tree this run belongs to.
    pub lineage_root_id: String,
    /// Position within the lineage, starting at 1 for the root.
    pub sequence: i64,
    pub parent_step_run_id: Option<String>,
    /// Content hashes of the input artifacts.
    pub input_artifacts: Vec<String>,
    pub params: Params,
    pub code_identity: String,
    /// Schema version the params were validated against.
    pub schema_version: i64,
    pub metrics: Metrics,
    pub artifacts: Vec<ArtifactRef>,
    /// Evidence bundle reported by the runner.
    pub evidence: Value,
    pub created_at: DateTime<Utc>,
}

/// Input of `StepRunLedger::finalize`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Finalization {
    pub task_id: String,
    pub input_artifacts: Vec<String>,
    pub params: Params,
    pub code_identity: String,
    pub metrics: Metrics,
    pub artifacts: Vec<ArtifactRef>,
    pub evidence: Value,
}
