// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Advice records: findings, patches and their validation/application state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Params;

/// Risk tier assigned by the policy table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskTier {
    /// May auto-apply once dry-run passed.
    Low,
    /// Requires an explicit confirming action.
    High,
}

impl RiskTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::High => "high",
        }
    }
}

/// Severity of a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// Inclusive healthy range of a metric. Open ends are unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct HealthyRange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
}

impl HealthyRange {
    pub fn between(min: f64, max: f64) -> Self {
        Self {
            min: Some(min),
            max: Some(max),
        }
    }

    pub fn at_least(min: f64) -> Self {
        Self {
            min: Some(min),
            max: None,
        }
    }

    pub fn at_most(max: f64) -> Self {
        Self {
            min: None,
            max: Some(max),
        }
    }

    pub fn contains(&self, value: f64) -> bool {
        self.min.is_none_or(|min| value >= min) && self.max.is_none_or(|max| value <= max)
    }
}

/// One observation of the Data Agent. Purely descriptive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    /// Metric key the finding is about.
    pub metric: String,
    pub observed: f64,
    pub expected: HealthyRange,
    pub severity: Severity,
    pub message: String,
    /// Knowledge-base citation backing the expected range.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub citation: Option<String>,
}

/// Structured output of the diagnose stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub step_run_id: String,
    pub step_ref: String,
    /// Schema version current when the diagnosis ran.
    pub schema_version: i64,
    pub findings: Vec<Finding>,
}

/// Parameter-level change.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ParamDelta {
    /// Keys to set (added or overwritten).
    #[serde(default)]
    pub set: Params,
    /// Keys to remove, falling back to the schema default.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unset: Vec<String>,
}

impl ParamDelta {
    pub fn apply_to(&self, params: &Params) -> Params {
        let mut merged = params.clone();
        for key in &self.unset {
            merged.remove(key);
        }
        for (key, value) in &self.set {
            merged.insert(key.clone(), value.clone());
        }
        merged
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.unset.is_empty()
    }
}

/// Code-level change: the runner is re-launched with another code identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeDelta {
    /// Target code identity (content hash or version tag).
    pub code_identity: String,
    /// Unified diff describing the change, for review.
    pub diff: String,
    #[serde(default)]
    pub summary: String,
}

/// Patch payload, tagged by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum Patch {
    ParamDelta(ParamDelta),
    CodeDelta(CodeDelta),
}

impl Patch {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ParamDelta(_) => "param_delta",
            Self::CodeDelta(_) => "code_delta",
        }
    }
}

/// Category of an advice, for display and filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdviceType {
    ParameterOptimization,
    QualityImprovement,
    MethodSuggestion,
    Troubleshooting,
}

/// What an advice is backed by.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Evidence {
    #[serde(default)]
    pub metric_ids: Vec<String>,
    /// Artifact hashes of rendered plots.
    #[serde(default)]
    pub plot_artifacts: Vec<String>,
    #[serde(default)]
    pub citations: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ValidationState {
    Unvalidated,
    DryRunPassed,
    DryRunFailed,
}

/// Outcome of the latest dry-run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Validation {
    pub state: ValidationState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Schema version the dry-run resolved against.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validated_at: Option<DateTime<Utc>>,
}

impl Validation {
    pub fn unvalidated() -> Self {
        Self {
            state: ValidationState::Unvalidated,
            reason: None,
            schema_version: None,
            validated_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApplicationState {
    Proposed,
    Applied,
    RolledBack,
}

impl ApplicationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Proposed => "proposed",
            Self::Applied => "applied",
            Self::RolledBack => "rolled-back",
        }
    }
}

/// A proposed change tied to exactly one step run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Advice {
    pub advice_id: String,
    /// Step run the advice was generated against.
    pub step_run_id: String,
    pub step_ref: String,
    pub advice_type: AdviceType,
    pub title: String,
    /// Natural-language rationale from the action stage.
    pub rationale: String,
    pub risk_tier: RiskTier,
    /// Findings that motivated the patch.
    pub diagnostic: Vec<Finding>,
    pub patch: Patch,
    pub evidence: Evidence,
    /// Schema version captured at diagnosis.
    pub schema_version: i64,
    pub validation: Validation,
    pub application_state: ApplicationState,
    /// Parameters of the advised step run, restored on rollback.
    pub pre_patch_params: Params,
    /// Task spawned by the latest apply.
    pub apply_task_id: Option<String>,
    pub applied_step_run_id: Option<String>,
    /// Task spawned by rollback.
    pub rollback_task_id: Option<String>,
    pub rollback_step_run_id: Option<String>,
    /// Actor who confirmed a high-risk apply.
    pub confirmed_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
