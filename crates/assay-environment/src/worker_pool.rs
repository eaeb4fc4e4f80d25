// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker pool pulling tasks from the durable queue.
//!
//! Each worker loops: claim the oldest available entry, execute it, ack
//! it. A task occupies exactly one worker for its lifetime. Entries are
//! acked even when the executor skipped the task, so redelivered entries
//! for tasks that already started or finished drain away.

use std::sync::Arc;
use std::time::Duration;

use assay_core::TaskQueue;
use assay_core::queue::Claim;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::executor::{ExecutionOutcome, Executor};

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of concurrent workers.
    pub workers: usize,
    /// Fallback poll interval when no enqueue notification arrives.
    pub poll_interval: Duration,
    /// Queue lease; an unacked entry is redelivered after it expires.
    pub lease: Duration,
    /// Prefix of worker IDs recorded on claims.
    pub worker_prefix: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            poll_interval: Duration::from_secs(1),
            lease: Duration::from_secs(45 * 60),
            worker_prefix: "worker".to_string(),
        }
    }
}

/// Fixed-size pool of queue consumers.
pub struct WorkerPool {
    executor: Arc<Executor>,
    queue: TaskQueue,
    notify: Arc<Notify>,
    config: WorkerPoolConfig,
    shutdown: CancellationToken,
}

impl WorkerPool {
    pub fn new(
        executor: Arc<Executor>,
        queue: TaskQueue,
        notify: Arc<Notify>,
        config: WorkerPoolConfig,
    ) -> Self {
        Self {
            executor,
            queue,
            notify,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that stops every worker once cancelled. Running executions
    /// finish first.
    pub fn shutdown_handle(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Spawn the workers.
    pub fn spawn(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        info!(workers = self.config.workers, "Worker pool started");
        (0..self.config.workers.max(1))
            .map(|i| {
                let pool = self.clone();
                let worker_id = format!("{}-{}", pool.config.worker_prefix, i);
                tokio::spawn(async move { pool.run_worker(worker_id).await })
            })
            .collect()
    }

    async fn run_worker(&self, worker_id: String) {
        debug!(worker_id = %worker_id, "Worker started");

        while !self.shutdown.is_cancelled() {
            match self.queue.claim(&worker_id).await {
                Ok(Some(claim)) => {
                    self.process(claim).await;
                    continue;
                }
                Ok(None) => {}
                Err(e) => error!(worker_id = %worker_id, error = %e, "Failed to claim task"),
            }

            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        debug!(worker_id = %worker_id, "Worker stopped");
    }

    /// Execute one claimed task and acknowledge the entry.
    pub async fn process(&self, claim: Claim) {
        debug!(task_id = %claim.task_id, worker_id = %claim.worker_id, "Claimed task");

        match self.executor.execute(&claim.task_id).await {
            Ok(ExecutionOutcome::Skipped(status)) => {
                debug!(task_id = %claim.task_id, status = %status, "Dropping redelivered entry");
            }
            Ok(outcome) => {
                debug!(task_id = %claim.task_id, outcome = outcome_name(&outcome), "Task executed");
            }
            Err(e) => {
                error!(task_id = %claim.task_id, error = %e, "Task execution failed");
            }
        }

        if let Err(e) = self.queue.ack(&claim).await {
            error!(task_id = %claim.task_id, error = %e, "Failed to ack queue entry");
        }
    }
}

fn outcome_name(outcome: &ExecutionOutcome) -> &'static str {
    match outcome {
        ExecutionOutcome::Succeeded(_) => "succeeded",
        ExecutionOutcome::Failed(_) => "failed",
        ExecutionOutcome::Canceled { .. } => "canceled",
        ExecutionOutcome::Skipped(_) => "skipped",
        ExecutionOutcome::Superseded(_) => "superseded",
    }
}
