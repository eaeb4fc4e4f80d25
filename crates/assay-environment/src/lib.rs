// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Assay Environment - Worker Execution
//!
//! This crate runs tasks: it pulls them from the durable queue, launches
//! one isolated worker per task, enforces the runner contract and records
//! the outcome through `assay-core`.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐ claim/ack ┌────────────────┐  start/complete  ┌──────────────────┐
//! │  TaskQueue   │ ◄──────── │   WorkerPool   │ ───────────────► │ TaskStateMachine │
//! └──────────────┘           └───────┬────────┘                  └──────────────────┘
//!                                    │ execute
//!                                    ▼
//!                            ┌────────────────┐  finalize  ┌───────────────┐
//!                            │    Executor    │ ─────────► │ StepRunLedger │
//!                            └───────┬────────┘            └───────────────┘
//!                                    │ launch
//!                                    ▼
//!                            ┌────────────────┐
//!                            │ Runner/Worker  │  stdout: JSON progress lines
//!                            └────────────────┘
//! ```
//!
//! # Runner contract
//!
//! | File / stream | Direction | Content |
//! |---------------|-----------|---------|
//! | `inputs.json` | in | `{artifact_refs, params, reference}` |
//! | `params.json` | in | flat parameter mapping |
//! | stdout | out | one `{phase, progress, message, ts}` object per line |
//! | `outputs.json` | out | `{artifacts: [{uri, hash, type}], metrics, evidence}` |
//! | stdin / `cancel` file | in | cooperative cancellation signal |
//!
//! # Runner Types
//!
//! | Runner | Description |
//! |--------|-------------|
//! | Process (default) | Local child process in its own process group |
//! | Mock | Scripted workers for tests |

/// Deletes unreferenced artifacts past their retention.
pub mod artifact_gc_worker;

/// Runner contract files and progress lines.
pub mod contract;

/// Error types.
pub mod error;

/// Executes one task against the runner contract.
pub mod executor;

/// Fails orphaned RUNNING tasks and forces overdue cancellations.
pub mod heartbeat_monitor;

/// Worker runners.
pub mod runner;

/// Embeddable runtime.
pub mod runtime;

/// Queue consumers.
pub mod worker_pool;

pub use artifact_gc_worker::{ArtifactGcConfig, ArtifactGcWorker};
pub use error::{Error, Result};
pub use executor::{ExecutionOutcome, Executor, ExecutorConfig};
pub use heartbeat_monitor::{HeartbeatMonitor, HeartbeatMonitorConfig};
pub use runtime::EnvironmentRuntime;
pub use worker_pool::{WorkerPool, WorkerPoolConfig};
