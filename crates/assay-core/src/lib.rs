// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Assay Core - task lifecycle, step-run lineage and progress fan-out.
//!
//! This crate holds the shared state of the orchestrator. Runner execution
//! lives in `assay-environment`, the advice pipeline in `assay-advice`.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐  create/start/complete/cancel  ┌─────────────────┐
//! │ TaskStateMachine │ ─────────────────────────────► │   Persistence   │
//! └────────┬─────────┘                                │    (SQLite)     │
//!          │ publish                                  └────────▲────────┘
//!          ▼                                                   │
//! ┌──────────────────┐                               ┌─────────┴───────┐
//! │     EventBus     │ ──► subscribers               │  StepRunLedger  │
//! └──────────────────┘                               └─────────────────┘
//!
//! ┌──────────────────┐
//! │  ArtifactStore   │  content-addressed blobs + signed URLs
//! └──────────────────┘
//! ```
//!
//! # Task lifecycle
//!
//! | From      | To        | Operation                     |
//! |-----------|-----------|-------------------------------|
//! | -         | PENDING   | `create`                      |
//! | PENDING   | RUNNING   | `start` (executor)            |
//! | PENDING   | CANCELED  | `cancel`                      |
//! | RUNNING   | SUCCEEDED | `succeed` (with the step run) |
//! | RUNNING   | FAILED    | `complete(Failed)`            |
//! | RUNNING   | CANCELED  | `cancel` + teardown ack/force |
//!
//! Terminal states are final. A step run is finalized only for a task in a
//! terminal state and at most once per task.

/// Content-addressed blob storage and URL signing.
pub mod artifact_store;

/// Error taxonomy shared across crates.
pub mod error;

/// Per-task event fan-out with snapshot replay.
pub mod events;

/// Callbacks run after a task reaches a terminal status.
pub mod hooks;

/// Append-only step-run ledger: finalize, lineage, compare, clone, pin.
pub mod ledger;

/// Domain types.
pub mod model;

/// Persistence trait and the SQLite backend.
pub mod persistence;

/// Durable at-least-once task queue.
pub mod queue;

/// Task lifecycle transitions.
pub mod state_machine;

pub use artifact_store::{ArtifactStore, FsArtifactStore};
pub use error::{CoreError, Result};
pub use events::{EventBus, EventKind, Subscription, TaskEvent, TaskSnapshot};
pub use hooks::LifecycleHook;
pub use ledger::StepRunLedger;
pub use persistence::{Persistence, SqlitePersistence};
pub use queue::TaskQueue;
pub use state_machine::{StateMachineConfig, TaskStateMachine, TaskView};
