// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared handler state.

use std::sync::Arc;
use std::time::Duration;

use assay_advice::AdvicePipeline;
use assay_core::{ArtifactStore, Persistence, StepRunLedger, TaskStateMachine};

/// Components every handler works against.
#[derive(Clone)]
pub struct AppState {
    pub machine: TaskStateMachine,
    pub ledger: StepRunLedger,
    pub store: Arc<dyn ArtifactStore>,
    pub advice: Arc<AdvicePipeline>,
    /// Base of the status and stream URLs handed to clients.
    pub public_url: String,
    pub signed_url_ttl: Duration,
}

impl AppState {
    pub fn new(
        advice: Arc<AdvicePipeline>,
        store: Arc<dyn ArtifactStore>,
        public_url: impl Into<String>,
        signed_url_ttl: Duration,
    ) -> Self {
        Self {
            machine: advice.tools().machine().clone(),
            ledger: advice.tools().ledger().clone(),
            store,
            advice,
            public_url: public_url.into().trim_end_matches('/').to_string(),
            signed_url_ttl,
        }
    }

    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        self.machine.persistence()
    }

    pub fn task_url(&self, task_id: &str) -> String {
        format!("{}/api/v1/tasks/{}", self.public_url, task_id)
    }
}
