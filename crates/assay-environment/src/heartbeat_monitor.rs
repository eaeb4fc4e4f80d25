// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker for detecting and failing stale tasks.
//!
//! Tasks that are RUNNING but not owned by an executor in this process
//! and have not reported a valid progress event within the heartbeat
//! timeout are failed with `RunnerUnresponsive`. This covers tasks whose
//! owning process died. Tasks whose cancellation was requested longer
//! ago than the grace period are force-marked CANCELED.
//!
//! Each pass also prunes closed event-bus channels.

use std::sync::Arc;
use std::time::Duration;

use assay_core::model::{FailureKind, Task, TaskFailure, TaskOutcome, TaskStatus};
use assay_core::{CoreError, Persistence, TaskStateMachine};
use chrono::{DateTime, Utc};
use dashmap::DashSet;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};

/// Configuration for the heartbeat monitor.
#[derive(Debug, Clone)]
pub struct HeartbeatMonitorConfig {
    /// How often to check for stale tasks.
    pub poll_interval: Duration,
    /// Maximum time since the last heartbeat before a task is failed.
    pub heartbeat_timeout: Duration,
    /// Time a requested cancellation may stay unacknowledged.
    pub cancel_grace: Duration,
    /// How long terminal event channels are kept for late subscribers.
    pub event_retention: Duration,
}

impl Default for HeartbeatMonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(120),
            cancel_grace: Duration::from_secs(10),
            event_retention: Duration::from_secs(10 * 60),
        }
    }
}

/// Counts from one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub failed: usize,
    pub canceled: usize,
    pub pruned_channels: usize,
}

/// Background worker that monitors for stale tasks.
pub struct HeartbeatMonitor {
    machine: TaskStateMachine,
    active: Arc<DashSet<String>>,
    config: HeartbeatMonitorConfig,
    shutdown: Arc<Notify>,
}

impl HeartbeatMonitor {
    /// `active` holds tasks executing in this process; those enforce
    /// their own liveness and are skipped.
    pub fn new(
        machine: TaskStateMachine,
        active: Arc<DashSet<String>>,
        config: HeartbeatMonitorConfig,
    ) -> Self {
        Self {
            machine,
            active,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the monitor loop until shutdown.
    ///
    /// The first pass runs immediately so tasks orphaned by a previous
    /// process are failed on startup.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            heartbeat_timeout_secs = self.config.heartbeat_timeout.as_secs(),
            "Heartbeat monitor started"
        );

        loop {
            match self.check_once().await {
                Ok(report) if report != SweepReport::default() => {
                    info!(
                        failed = report.failed,
                        canceled = report.canceled,
                        pruned_channels = report.pruned_channels,
                        "Heartbeat sweep finished"
                    );
                }
                Ok(_) => debug!("No stale tasks found"),
                Err(e) => error!(error = %e, "Failed to check stale tasks"),
            }

            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Heartbeat monitor received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        info!("Heartbeat monitor stopped");
    }

    /// One sweep over RUNNING tasks.
    pub async fn check_once(&self) -> Result<SweepReport> {
        let now = Utc::now();
        let timeout = chrono::Duration::from_std(self.config.heartbeat_timeout)
            .map_err(|e| Error::Other(format!("Invalid duration: {}", e)))?;
        let grace = chrono::Duration::from_std(self.config.cancel_grace)
            .map_err(|e| Error::Other(format!("Invalid duration: {}", e)))?;

        let mut report = SweepReport::default();
        let running = self
            .machine
            .persistence()
            .list_tasks_by_status(TaskStatus::Running)
            .await?;

        for task in running {
            if let Some(requested_at) = task.cancel_requested_at
                && now - requested_at > grace
            {
                match self.machine.force_cancel(&task.task_id).await {
                    Ok(_) => {
                        warn!(
                            task_id = %task.task_id,
                            "Cancellation not acknowledged in time, force-marked CANCELED"
                        );
                        report.canceled += 1;
                    }
                    Err(e) => log_lost_race(&task, e),
                }
                continue;
            }

            if self.active.contains(&task.task_id) {
                continue;
            }

            let last_seen = last_activity(&task);
            if now - last_seen <= timeout {
                continue;
            }

            let reason = CoreError::RunnerUnresponsive {
                task_id: task.task_id.clone(),
                timeout: self.config.heartbeat_timeout,
            }
            .to_string();
            let failure = TaskFailure::new(FailureKind::RunnerUnresponsive, reason);

            match self
                .machine
                .complete(&task.task_id, TaskOutcome::Failed(failure))
                .await
            {
                Ok(_) => {
                    warn!(
                        task_id = %task.task_id,
                        last_seen = %last_seen,
                        "Stale task failed"
                    );
                    report.failed += 1;
                }
                Err(e) => log_lost_race(&task, e),
            }
        }

        report.pruned_channels = self.machine.bus().prune_closed(self.config.event_retention);
        Ok(report)
    }
}

fn last_activity(task: &Task) -> DateTime<Utc> {
    task.heartbeat_at
        .or(task.started_at)
        .unwrap_or(task.created_at)
}

fn log_lost_race(task: &Task, e: CoreError) {
    match e {
        CoreError::IllegalTransition { .. } => {
            debug!(task_id = %task.task_id, "Task left RUNNING before the monitor acted");
        }
        e => error!(task_id = %task.task_id, error = %e, "Failed to update stale task"),
    }
}
