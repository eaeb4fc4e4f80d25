// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock runner for testing.
//!
//! Workers replay a scripted list of stdout lines, write the scripted
//! files into the run directory when they exit and can be told to hang
//! until cancelled or killed.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use super::traits::*;
use crate::contract::OUTPUTS_FILE;

/// Behaviour of every worker launched by a [`MockRunner`].
#[derive(Debug, Clone)]
pub struct MockScript {
    /// Lines printed to stdout, in order.
    pub lines: Vec<String>,
    /// Delay before each line.
    pub line_delay: Duration,
    /// Files written into the run directory on exit.
    pub files: Vec<(String, Vec<u8>)>,
    /// Written as `outputs.json` on exit.
    pub outputs: Option<Value>,
    pub exit_code: i32,
    /// Stay alive after the last line until killed (or cancelled, if
    /// `honor_cancel` is set).
    pub hang: bool,
    /// Exit with `exit_code` once cancellation is requested.
    pub honor_cancel: bool,
    pub stderr: Vec<String>,
}

impl Default for MockScript {
    fn default() -> Self {
        Self {
            lines: Vec::new(),
            line_delay: Duration::from_millis(1),
            files: Vec::new(),
            outputs: None,
            exit_code: 0,
            hang: false,
            honor_cancel: true,
            stderr: Vec::new(),
        }
    }
}

/// Mock runner for testing.
#[derive(Debug, Clone, Default)]
pub struct MockRunner {
    script: MockScript,
    launches: Arc<Mutex<Vec<LaunchOptions>>>,
}

impl MockRunner {
    pub fn new(script: MockScript) -> Self {
        Self {
            script,
            launches: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Every launch seen so far.
    pub async fn launches(&self) -> Vec<LaunchOptions> {
        self.launches.lock().await.clone()
    }
}

#[async_trait]
impl Runner for MockRunner {
    fn runner_type(&self) -> &'static str {
        "mock"
    }

    async fn launch(&self, options: &LaunchOptions) -> Result<Box<dyn WorkerProcess>> {
        if options.command.is_empty() {
            return Err(RunnerError::EmptyCommand);
        }
        self.launches.lock().await.push(options.clone());

        Ok(Box::new(MockWorker {
            script: self.script.clone(),
            pending: self.script.lines.iter().cloned().collect(),
            run_dir: options.run_dir.clone(),
            cancelled: false,
            killed: false,
            exited: None,
        }))
    }
}

struct MockWorker {
    script: MockScript,
    pending: VecDeque<String>,
    run_dir: PathBuf,
    cancelled: bool,
    killed: bool,
    exited: Option<ExitInfo>,
}

impl MockWorker {
    fn stopped(&self) -> bool {
        self.killed || (self.cancelled && self.script.honor_cancel)
    }
}

#[async_trait]
impl WorkerProcess for MockWorker {
    fn pid(&self) -> Option<u32> {
        None
    }

    async fn next_line(&mut self) -> Result<Option<String>> {
        if self.stopped() {
            return Ok(None);
        }
        if !self.pending.is_empty() {
            tokio::time::sleep(self.script.line_delay).await;
            return Ok(self.pending.pop_front());
        }
        if self.script.hang {
            std::future::pending::<()>().await;
        }
        Ok(None)
    }

    async fn request_cancel(&mut self) -> Result<()> {
        self.cancelled = true;
        Ok(())
    }

    async fn wait(&mut self) -> Result<ExitInfo> {
        if let Some(exit) = self.exited {
            return Ok(exit);
        }
        if self.killed {
            let exit = ExitInfo { code: None };
            self.exited = Some(exit);
            return Ok(exit);
        }
        if self.script.hang && !self.stopped() {
            std::future::pending::<()>().await;
        }

        for (name, bytes) in &self.script.files {
            let path = self.run_dir.join(name);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(path, bytes).await?;
        }
        if let Some(outputs) = &self.script.outputs {
            let bytes = serde_json::to_vec(outputs).map_err(|e| RunnerError::Other(e.to_string()))?;
            tokio::fs::write(self.run_dir.join(OUTPUTS_FILE), bytes).await?;
        }

        let exit = ExitInfo {
            code: Some(self.script.exit_code),
        };
        self.exited = Some(exit);
        Ok(exit)
    }

    async fn kill(&mut self) -> Result<()> {
        self.killed = true;
        Ok(())
    }

    fn stderr_tail(&self) -> Vec<String> {
        self.script.stderr.clone()
    }
}
