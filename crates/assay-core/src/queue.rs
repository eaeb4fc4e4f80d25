// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Durable task queue with at-least-once delivery.
//!
//! An entry stays in the queue until it is acknowledged. A claim leases the
//! entry for a while; if the consumer dies the lease expires and the entry
//! is handed out again. Consumers stay idempotent by only acting when
//! `TaskStateMachine::start` succeeds for the task.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::error::{CoreError, Result};
use crate::persistence::Persistence;

/// A leased queue entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub task_id: String,
    pub worker_id: String,
}

/// Queue facade over persistence.
#[derive(Clone)]
pub struct TaskQueue {
    persistence: Arc<dyn Persistence>,
    lease: Duration,
}

impl TaskQueue {
    pub fn new(persistence: Arc<dyn Persistence>, lease: Duration) -> Self {
        Self { persistence, lease }
    }

    pub async fn enqueue(&self, task_id: &str) -> Result<()> {
        self.persistence.enqueue(task_id, Utc::now()).await
    }

    /// Lease the next available entry for `worker_id`.
    pub async fn claim(&self, worker_id: &str) -> Result<Option<Claim>> {
        let now = Utc::now();
        let lease = chrono::Duration::from_std(self.lease).map_err(CoreError::internal)?;
        Ok(self
            .persistence
            .claim_next(worker_id, now, now + lease)
            .await?
            .map(|task_id| Claim {
                task_id,
                worker_id: worker_id.to_string(),
            }))
    }

    /// Remove a consumed entry.
    pub async fn ack(&self, claim: &Claim) -> Result<()> {
        self.persistence.ack(&claim.task_id).await
    }

    pub async fn depth(&self) -> Result<i64> {
        self.persistence.queue_depth().await
    }
}
