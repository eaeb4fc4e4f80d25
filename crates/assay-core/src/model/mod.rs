// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Domain model shared by every assay crate.

use std::collections::BTreeMap;

use serde_json::Value;

mod advice;
mod artifact;
mod catalog;
mod step;
mod step_run;
mod task;

pub use advice::{
    Advice, AdviceType, ApplicationState, CodeDelta, Diagnostic, Evidence, Finding, HealthyRange,
    ParamDelta, Patch, RiskTier, Severity, Validation, ValidationState,
};
pub use artifact::{ArtifactRef, mime_type_for};
pub use catalog::StepCatalog;
pub use step::{ParamKind, ParamSchema, ParamSpec, StepDefinition};
pub use step_run::{Finalization, StepRun};
pub use task::{
    FailureKind, Task, TaskDraft, TaskFailure, TaskOrigin, TaskOutcome, TaskStatus,
};

/// Flat key to value parameter mapping.
pub type Params = BTreeMap<String, Value>;

/// Metric key to numeric or structured value.
pub type Metrics = BTreeMap<String, Value>;

/// Generate a new entity ID.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
