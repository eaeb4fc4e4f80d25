// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Append-only step-run ledger.
//!
//! Step runs are inserted once per task and never updated. Pins live in a
//! separate table, comparisons are pure functions and cloning only
//! produces a [`TaskDraft`].

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info};

use crate::error::{CoreError, Result};
use crate::model::{Finalization, Params, StepRun, Task, TaskDraft, TaskOrigin, new_id};
use crate::persistence::{Persistence, Pin};

/// A parameter whose value differs between two runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueChange {
    pub a: Value,
    pub b: Value,
}

/// Structural parameter diff from `a` to `b`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ParamDiff {
    /// Keys only in `b`.
    pub added: Params,
    /// Keys only in `a`.
    pub removed: Params,
    pub changed: BTreeMap<String, ValueChange>,
}

impl ParamDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

/// Numeric difference of one shared metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricDelta {
    pub a: f64,
    pub b: f64,
    /// `b - a`
    pub delta: f64,
    /// `delta / |a|`, absent when `a` is zero.
    pub relative: Option<f64>,
}

/// Result of comparing two step runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRunDiff {
    pub a: String,
    pub b: String,
    pub params: ParamDiff,
    /// Shared numeric metrics.
    pub metrics: BTreeMap<String, MetricDelta>,
    /// Shared structured metrics whose values differ.
    pub structured_changed: Vec<String>,
}

/// Structural diff of two parameter sets.
pub fn diff_params(a: &Params, b: &Params) -> ParamDiff {
    let mut diff = ParamDiff::default();

    for (key, va) in a {
        match b.get(key) {
            None => {
                diff.removed.insert(key.clone(), va.clone());
            }
            Some(vb) if !values_equal(va, vb) => {
                diff.changed.insert(
                    key.clone(),
                    ValueChange {
                        a: va.clone(),
                        b: vb.clone(),
                    },
                );
            }
            Some(_) => {}
        }
    }
    for (key, vb) in b {
        if !a.contains_key(key) {
            diff.added.insert(key.clone(), vb.clone());
        }
    }

    diff
}

/// `200` and `200.0` are the same parameter value.
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

/// Compare two snapshots. Neither record is touched.
pub fn compare(a: &StepRun, b: &StepRun) -> StepRunDiff {
    let mut metrics = BTreeMap::new();
    let mut structured_changed = Vec::new();

    for (key, va) in &a.metrics {
        let Some(vb) = b.metrics.get(key) else {
            continue;
        };
        match (va.as_f64(), vb.as_f64()) {
            (Some(x), Some(y)) => {
                let delta = y - x;
                metrics.insert(
                    key.clone(),
                    MetricDelta {
                        a: x,
                        b: y,
                        delta,
                        relative: (x != 0.0).then(|| delta / x.abs()),
                    },
                );
            }
            _ if va != vb => structured_changed.push(key.clone()),
            _ => {}
        }
    }

    StepRunDiff {
        a: a.step_run_id.clone(),
        b: b.step_run_id.clone(),
        params: diff_params(&a.params, &b.params),
        metrics,
        structured_changed,
    }
}

/// Ledger over the persistence layer.
#[derive(Clone)]
pub struct StepRunLedger {
    persistence: Arc<dyn Persistence>,
}

impl StepRunLedger {
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self { persistence }
    }

    /// Record the immutable step run of a terminal task.
    ///
    /// Fails with `DuplicateFinalization` on a second call for the same
    /// task; the stored record is left unchanged.
    pub async fn finalize(&self, finalization: Finalization) -> Result<StepRun> {
        let task = self
            .persistence
            .get_task(&finalization.task_id)
            .await?
            .ok_or_else(|| CoreError::not_found("task", &finalization.task_id))?;

        if !task.status.is_terminal() {
            return Err(CoreError::IllegalTransition {
                task_id: task.task_id,
                from: task.status.to_string(),
                to: "FINALIZED".to_string(),
            });
        }

        let run = self.record_for(&task, finalization).await?;

        match self.persistence.insert_step_run(&run).await {
            Ok(stored) => {
                info!(
                    task_id = %stored.task_id,
                    step_run_id = %stored.step_run_id,
                    sequence = stored.sequence,
                    "Step run finalized"
                );
                Ok(stored)
            }
            Err(e @ CoreError::DuplicateFinalization { .. }) => {
                error!(task_id = %run.task_id, "Duplicate step-run finalization");
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Build the step run record of `task` without storing it.
    ///
    /// The sequence is assigned on insert.
    pub async fn record_for(&self, task: &Task, finalization: Finalization) -> Result<StepRun> {
        let step_run_id = new_id();
        let lineage_root_id = match &task.parent_step_run_id {
            Some(parent_id) => self.get(parent_id).await?.lineage_root_id,
            None => step_run_id.clone(),
        };

        Ok(StepRun {
            step_run_id,
            task_id: task.task_id.clone(),
            step_ref: task.step_ref.clone(),
            lineage_root_id,
            sequence: 0,
            parent_step_run_id: task.parent_step_run_id.clone(),
            input_artifacts: finalization.input_artifacts,
            params: finalization.params,
            code_identity: finalization.code_identity,
            schema_version: task.schema_version,
            metrics: finalization.metrics,
            artifacts: finalization.artifacts,
            evidence: finalization.evidence,
            created_at: Utc::now(),
        })
    }

    pub async fn get(&self, step_run_id: &str) -> Result<StepRun> {
        self.persistence
            .get_step_run(step_run_id)
            .await?
            .ok_or_else(|| CoreError::not_found("step_run", step_run_id))
    }

    pub async fn get_by_task(&self, task_id: &str) -> Result<Option<StepRun>> {
        self.persistence.get_step_run_by_task(task_id).await
    }

    /// Ancestor chain ending at `step_run_id`, oldest first.
    pub async fn lineage(&self, step_run_id: &str) -> Result<Vec<StepRun>> {
        let mut chain = vec![self.get(step_run_id).await?];

        while let Some(parent_id) = chain
            .last()
            .and_then(|run| run.parent_step_run_id.clone())
        {
            if chain.iter().any(|run| run.step_run_id == parent_id) {
                return Err(CoreError::internal(format!(
                    "lineage cycle at step run '{}'",
                    parent_id
                )));
            }
            chain.push(self.get(&parent_id).await?);
        }

        chain.reverse();
        Ok(chain)
    }

    /// Every run sharing the lineage root of `step_run_id`, by sequence.
    pub async fn lineage_tree(&self, step_run_id: &str) -> Result<Vec<StepRun>> {
        let run = self.get(step_run_id).await?;
        self.persistence.list_lineage(&run.lineage_root_id).await
    }

    pub async fn children(&self, step_run_id: &str) -> Result<Vec<StepRun>> {
        self.persistence.list_children(step_run_id).await
    }

    /// Compare two stored runs.
    pub async fn compare(&self, a: &str, b: &str) -> Result<StepRunDiff> {
        let a = self.get(a).await?;
        let b = self.get(b).await?;
        Ok(compare(&a, &b))
    }

    /// Draft a new task from a step run with `overrides` merged into its
    /// parameters. Nothing is created until the draft is submitted.
    pub async fn clone_run(&self, step_run_id: &str, overrides: &Params) -> Result<TaskDraft> {
        let source = self.get(step_run_id).await?;
        let reference = self
            .persistence
            .get_task(&source.task_id)
            .await?
            .map(|task| task.reference)
            .unwrap_or(Value::Null);

        let mut params = source.params.clone();
        for (key, value) in overrides {
            params.insert(key.clone(), value.clone());
        }

        Ok(TaskDraft {
            step_ref: source.step_ref,
            params,
            input_artifacts: source.input_artifacts,
            reference,
            code_identity: Some(source.code_identity),
            parent_step_run_id: Some(source.step_run_id.clone()),
            origin: TaskOrigin::Clone {
                source_step_run_id: source.step_run_id,
            },
        })
    }

    pub async fn pin(&self, step_run_id: &str, note: Option<&str>) -> Result<Pin> {
        self.get(step_run_id).await?;
        self.persistence.pin(step_run_id, note).await
    }

    pub async fn unpin(&self, step_run_id: &str) -> Result<bool> {
        self.persistence.unpin(step_run_id).await
    }

    pub async fn list_pinned(&self) -> Result<Vec<Pin>> {
        self.persistence.list_pins().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: Value) -> Params {
        serde_json::from_value(value).unwrap()
    }

    fn run(id: &str, p: Value, metrics: Value) -> StepRun {
        StepRun {
            step_run_id: id.into(),
            task_id: format!("task-{id}"),
            step_ref: "qc".into(),
            lineage_root_id: id.into(),
            sequence: 1,
            parent_step_run_id: None,
            input_artifacts: vec![],
            params: params(p),
            code_identity: "v1".into(),
            schema_version: 1,
            metrics: serde_json::from_value(metrics).unwrap(),
            artifacts: vec![],
            evidence: json!({}),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_diff_params() {
        let diff = diff_params(
            &params(json!({"a": 1, "b": 2, "c": "x"})),
            &params(json!({"a": 1.0, "b": 3, "d": true})),
        );
        assert_eq!(diff.removed, params(json!({"c": "x"})));
        assert_eq!(diff.added, params(json!({"d": true})));
        assert_eq!(diff.changed.len(), 1);
        assert_eq!(diff.changed["b"].b, json!(3));
    }

    #[test]
    fn test_compare_numeric_metrics() {
        let a = run(
            "a",
            json!({"min_genes": 200}),
            json!({"n_cells": 1000, "doublet_rate": 0.0, "labels": ["x"], "only_a": 1}),
        );
        let b = run(
            "b",
            json!({"min_genes": 150}),
            json!({"n_cells": 1200, "doublet_rate": 0.02, "labels": ["y"]}),
        );

        let before = (a.clone(), b.clone());
        let diff = compare(&a, &b);

        let cells = &diff.metrics["n_cells"];
        assert_eq!(cells.delta, 200.0);
        assert_eq!(cells.relative, Some(0.2));
        assert_eq!(diff.metrics["doublet_rate"].relative, None);
        assert!(!diff.metrics.contains_key("only_a"));
        assert_eq!(diff.structured_changed, vec!["labels".to_string()]);
        assert_eq!(diff.params.changed.len(), 1);
        assert_eq!((a, b), before);
    }

    #[test]
    fn test_compare_with_self_is_empty() {
        let a = run("a", json!({"x": 1}), json!({"m": 2}));
        let diff = compare(&a, &a);
        assert!(diff.params.is_empty());
        assert_eq!(diff.metrics["m"].delta, 0.0);
        assert!(diff.structured_changed.is_empty());
    }
}
