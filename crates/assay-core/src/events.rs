// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-task progress fan-out.
//!
//! Each task has one channel holding the latest snapshot and a list of
//! subscribers. Publication never blocks: every subscriber has a bounded
//! backlog and a subscriber whose backlog is full is disconnected.
//!
//! ```text
//! executor ──publish──► TaskChannel { snapshot, seq } ──try_send──► subscriber 1
//!                                                     ├─try_send──► subscriber 2
//!                                                     └─(full)────► dropped
//! ```
//!
//! A late subscriber receives the snapshot first and then only events with
//! a higher sequence number, so progress never appears to move backward.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::model::{Task, TaskStatus};

/// Default per-subscriber backlog.
pub const DEFAULT_SUBSCRIBER_BACKLOG: usize = 256;

/// Payload of a task event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// Structured progress line from the runner.
    Progress {
        phase: String,
        progress: f64,
        message: String,
    },
    /// Free-form log line (runner stderr, executor notes).
    Log { level: String, message: String },
    /// Interim metric reported while running.
    Metric { key: String, value: Value },
    /// Synthetic event emitted on every status transition.
    StatusChanged {
        #[serde(skip_serializing_if = "Option::is_none")]
        from: Option<TaskStatus>,
        to: TaskStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl EventKind {
    /// Stored event type.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Progress { .. } => "progress",
            Self::Log { .. } => "log",
            Self::Metric { .. } => "metric",
            Self::StatusChanged { .. } => "status_changed",
        }
    }
}

/// One ordered event of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub task_id: String,
    /// Per-task sequence number, strictly increasing.
    pub seq: u64,
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Last known state of a task as seen by the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub task_id: String,
    pub status: TaskStatus,
    pub phase: Option<String>,
    pub progress: f64,
    pub message: Option<String>,
    /// Sequence number of the last event folded into this snapshot.
    pub seq: u64,
}

impl TaskSnapshot {
    /// Snapshot seeded from a persisted task.
    pub fn from_task(task: &Task) -> Self {
        Self {
            task_id: task.task_id.clone(),
            status: task.status,
            phase: task.phase.clone(),
            progress: task.progress,
            message: None,
            seq: 0,
        }
    }
}

/// Snapshot plus live tail handed to a subscriber.
#[derive(Debug)]
pub struct Subscription {
    pub snapshot: TaskSnapshot,
    /// Live events with `seq > snapshot.seq`. Ends when the task reaches a
    /// terminal status or the subscriber falls behind.
    pub receiver: mpsc::Receiver<TaskEvent>,
}

struct TaskChannel {
    snapshot: TaskSnapshot,
    subscribers: Vec<mpsc::Sender<TaskEvent>>,
    closed_at: Option<Instant>,
}

impl TaskChannel {
    fn new(snapshot: TaskSnapshot) -> Self {
        let closed_at = snapshot.status.is_terminal().then(Instant::now);
        Self {
            snapshot,
            subscribers: Vec::new(),
            closed_at,
        }
    }
}

/// In-process fan-out of task events.
pub struct EventBus {
    channels: DashMap<String, TaskChannel>,
    backlog: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_BACKLOG)
    }
}

impl EventBus {
    /// Create a bus with the given per-subscriber backlog.
    pub fn new(backlog: usize) -> Self {
        Self {
            channels: DashMap::new(),
            backlog: backlog.max(1),
        }
    }

    /// Publish an event for `task_id`.
    ///
    /// Returns the sequenced event, or `None` when the task's channel is
    /// already closed by a terminal status. Progress values lower than the
    /// snapshot are raised to it.
    pub fn publish(&self, task_id: &str, kind: EventKind) -> Option<TaskEvent> {
        let mut channel = self.channels.entry(task_id.to_string()).or_insert_with(|| {
            TaskChannel::new(TaskSnapshot {
                task_id: task_id.to_string(),
                status: TaskStatus::Pending,
                phase: None,
                progress: 0.0,
                message: None,
                seq: 0,
            })
        });

        if channel.closed_at.is_some() {
            debug!(
                task_id = %task_id,
                event = kind.type_name(),
                "Dropping event for closed task channel"
            );
            return None;
        }

        let kind = match kind {
            EventKind::Progress {
                phase,
                progress,
                message,
            } => {
                let progress = progress.clamp(0.0, 1.0).max(channel.snapshot.progress);
                channel.snapshot.phase = Some(phase.clone());
                channel.snapshot.progress = progress;
                channel.snapshot.message = Some(message.clone());
                EventKind::Progress {
                    phase,
                    progress,
                    message,
                }
            }
            EventKind::StatusChanged { from, to, reason } => {
                channel.snapshot.status = to;
                if to == TaskStatus::Succeeded {
                    channel.snapshot.progress = 1.0;
                }
                EventKind::StatusChanged { from, to, reason }
            }
            other => other,
        };

        channel.snapshot.seq += 1;
        let event = TaskEvent {
            task_id: task_id.to_string(),
            seq: channel.snapshot.seq,
            ts: Utc::now(),
            kind,
        };

        channel.subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    task_id = %task_id,
                    seq = event.seq,
                    "Subscriber backlog full, disconnecting"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });

        if channel.snapshot.status.is_terminal() {
            channel.closed_at = Some(Instant::now());
            channel.subscribers.clear();
        }

        Some(event)
    }

    /// Subscribe to a task, seeding its channel with `seed` if the bus has
    /// not seen the task yet.
    ///
    /// Snapshot capture and registration happen under the channel lock, so
    /// the live tail starts exactly after the snapshot.
    pub fn subscribe_or_seed(
        &self,
        task_id: &str,
        seed: impl FnOnce() -> TaskSnapshot,
    ) -> Subscription {
        let (tx, rx) = mpsc::channel(self.backlog);
        let mut channel = self
            .channels
            .entry(task_id.to_string())
            .or_insert_with(|| TaskChannel::new(seed()));

        let snapshot = channel.snapshot.clone();
        if channel.closed_at.is_none() {
            channel.subscribers.push(tx);
        }

        Subscription {
            snapshot,
            receiver: rx,
        }
    }

    /// Latest snapshot, if the bus has seen the task.
    pub fn snapshot(&self, task_id: &str) -> Option<TaskSnapshot> {
        self.channels.get(task_id).map(|c| c.snapshot.clone())
    }

    /// Number of live subscribers of a task.
    pub fn subscriber_count(&self, task_id: &str) -> usize {
        self.channels
            .get(task_id)
            .map(|c| c.subscribers.len())
            .unwrap_or(0)
    }

    /// Forget channels closed longer than `retention` ago.
    pub fn prune_closed(&self, retention: Duration) -> usize {
        let before = self.channels.len();
        self.channels.retain(|_, channel| {
            channel
                .closed_at
                .is_none_or(|closed| closed.elapsed() < retention)
        });
        before - self.channels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(phase: &str, progress: f64) -> EventKind {
        EventKind::Progress {
            phase: phase.into(),
            progress,
            message: String::new(),
        }
    }

    fn status(from: TaskStatus, to: TaskStatus) -> EventKind {
        EventKind::StatusChanged {
            from: Some(from),
            to,
            reason: None,
        }
    }

    fn seed(task_id: &str) -> TaskSnapshot {
        TaskSnapshot {
            task_id: task_id.into(),
            status: TaskStatus::Running,
            phase: None,
            progress: 0.0,
            message: None,
            seq: 0,
        }
    }

    #[tokio::test]
    async fn test_events_arrive_in_order() {
        let bus = EventBus::default();
        let mut sub = bus.subscribe_or_seed("t1", || seed("t1"));

        for i in 1..=5 {
            bus.publish("t1", progress("qc", i as f64 / 10.0));
        }

        for expected in 1..=5 {
            let event = sub.receiver.recv().await.unwrap();
            assert_eq!(event.seq, expected);
        }
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_snapshot_then_tail() {
        let bus = EventBus::default();
        bus.publish("t1", progress("load", 0.2));
        bus.publish("t1", progress("filter", 0.6));

        let mut sub = bus.subscribe_or_seed("t1", || seed("t1"));
        assert_eq!(sub.snapshot.phase.as_deref(), Some("filter"));
        assert_eq!(sub.snapshot.progress, 0.6);
        assert_eq!(sub.snapshot.seq, 2);

        bus.publish("t1", progress("write", 0.9));
        let event = sub.receiver.recv().await.unwrap();
        assert_eq!(event.seq, 3);
    }

    #[test]
    fn test_progress_never_goes_backward() {
        let bus = EventBus::default();
        bus.publish("t1", progress("a", 0.7));
        let event = bus.publish("t1", progress("b", 0.3)).unwrap();

        match event.kind {
            EventKind::Progress { progress, .. } => assert_eq!(progress, 0.7),
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(bus.snapshot("t1").unwrap().phase.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_slow_subscriber_is_dropped_without_blocking() {
        let bus = EventBus::new(2);
        let mut slow = bus.subscribe_or_seed("t1", || seed("t1"));
        let mut fast = bus.subscribe_or_seed("t1", || seed("t1"));

        bus.publish("t1", progress("a", 0.1));
        bus.publish("t1", progress("a", 0.2));
        assert_eq!(fast.receiver.recv().await.unwrap().seq, 1);
        assert_eq!(fast.receiver.recv().await.unwrap().seq, 2);

        // slow never read, its backlog of 2 is full
        bus.publish("t1", progress("a", 0.3));
        assert_eq!(bus.subscriber_count("t1"), 1);
        assert_eq!(fast.receiver.recv().await.unwrap().seq, 3);

        // slow still drains what it buffered, then ends
        assert_eq!(slow.receiver.recv().await.unwrap().seq, 1);
        assert_eq!(slow.receiver.recv().await.unwrap().seq, 2);
        assert!(slow.receiver.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_terminal_status_closes_channel() {
        let bus = EventBus::default();
        let mut sub = bus.subscribe_or_seed("t1", || seed("t1"));

        bus.publish("t1", status(TaskStatus::Running, TaskStatus::Succeeded));
        let event = sub.receiver.recv().await.unwrap();
        assert_eq!(event.kind.type_name(), "status_changed");
        assert!(sub.receiver.recv().await.is_none());

        assert!(bus.publish("t1", progress("late", 1.0)).is_none());

        let late = bus.subscribe_or_seed("t1", || seed("t1"));
        assert_eq!(late.snapshot.status, TaskStatus::Succeeded);
        assert_eq!(late.snapshot.progress, 1.0);
        let mut rx = late.receiver;
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn test_prune_closed_channels() {
        let bus = EventBus::default();
        bus.publish("done", status(TaskStatus::Running, TaskStatus::Failed));
        bus.publish("live", progress("a", 0.5));

        assert_eq!(bus.prune_closed(Duration::from_secs(3600)), 0);
        assert_eq!(bus.prune_closed(Duration::ZERO), 1);
        assert!(bus.snapshot("done").is_none());
        assert!(bus.snapshot("live").is_some());
    }

    #[test]
    fn test_event_serialization() {
        let event = TaskEvent {
            task_id: "t1".into(),
            seq: 4,
            ts: Utc::now(),
            kind: status(TaskStatus::Pending, TaskStatus::Running),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "status_changed");
        assert_eq!(json["to"], "RUNNING");
        assert_eq!(json["seq"], 4);
    }
}
