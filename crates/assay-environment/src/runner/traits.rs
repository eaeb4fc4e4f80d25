// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runner trait definitions.
//!
//! A [`Runner`] launches one isolated worker per task and hands back a
//! [`WorkerProcess`] the executor drives: it reads stdout lines, delivers
//! the cooperative cancellation signal and, past the grace deadline,
//! kills the worker.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;

/// Errors from runner operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RunnerError {
    /// Step definition has no program to launch.
    #[error("Empty command")]
    EmptyCommand,

    /// Worker process failed to start.
    #[error("Start failed: {0}")]
    StartFailed(String),

    /// I/O operation on the worker failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Signal delivery failed.
    #[error("Signal error: {0}")]
    Signal(#[from] nix::errno::Errno),

    /// Other error.
    #[error("Other: {0}")]
    Other(String),
}

/// Result type for runner operations.
pub type Result<T> = std::result::Result<T, RunnerError>;

/// Options for launching a worker.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    /// Task ID (UUID)
    pub task_id: String,
    /// Program and arguments.
    pub command: Vec<String>,
    /// Working directory holding the contract files.
    pub run_dir: PathBuf,
    /// Extra environment variables.
    pub env: HashMap<String, String>,
}

/// How a worker ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    /// Exit code, `None` when terminated by a signal.
    pub code: Option<i32>,
}

impl ExitInfo {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// A running worker.
#[async_trait]
pub trait WorkerProcess: Send {
    /// OS process ID, if any.
    fn pid(&self) -> Option<u32>;

    /// Next stdout line, `None` at end of stream. Cancel safe.
    async fn next_line(&mut self) -> Result<Option<String>>;

    /// Deliver the cooperative cancellation signal.
    async fn request_cancel(&mut self) -> Result<()>;

    /// Wait for the worker to exit. Cancel safe.
    async fn wait(&mut self) -> Result<ExitInfo>;

    /// Forcibly terminate the worker.
    async fn kill(&mut self) -> Result<()>;

    /// Last stderr lines captured so far.
    fn stderr_tail(&self) -> Vec<String>;
}

/// Trait for worker runners.
#[async_trait]
pub trait Runner: Send + Sync {
    /// Get the runner type name.
    fn runner_type(&self) -> &'static str;

    /// Launch a worker with the run directory already prepared.
    async fn launch(&self, options: &LaunchOptions) -> Result<Box<dyn WorkerProcess>>;
}
