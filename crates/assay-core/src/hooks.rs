// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Post-execution hooks.

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{StepRun, Task};

/// Called by the executor once a task is terminal and, on success, its
/// step run is finalized.
///
/// Errors are logged by the caller and never change the task outcome.
#[async_trait]
pub trait LifecycleHook: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// `step_run` is `Some` only for SUCCEEDED tasks.
    async fn on_task_finished(&self, task: &Task, step_run: Option<&StepRun>) -> Result<()>;
}
