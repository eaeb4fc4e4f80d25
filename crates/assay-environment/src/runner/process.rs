// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Child-process runner.
//!
//! Each worker runs in its own process group with piped stdio. The
//! cancellation signal is a `cancel` line on stdin plus a marker file
//! whose path is exported as `ASSAY_CANCEL_FILE`; workers check either at
//! phase boundaries. Forced termination sends SIGKILL to the whole group.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};

use super::traits::*;
use crate::contract::CANCEL_FILE;

const DEFAULT_STDERR_TAIL: usize = 50;

/// Launches workers as local child processes.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    stderr_tail_lines: usize,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self {
            stderr_tail_lines: DEFAULT_STDERR_TAIL,
        }
    }

    /// Number of stderr lines kept per worker.
    pub fn with_stderr_tail(mut self, lines: usize) -> Self {
        self.stderr_tail_lines = lines.max(1);
        self
    }
}

#[async_trait]
impl Runner for ProcessRunner {
    fn runner_type(&self) -> &'static str {
        "process"
    }

    async fn launch(&self, options: &LaunchOptions) -> Result<Box<dyn WorkerProcess>> {
        let (program, args) = options
            .command
            .split_first()
            .ok_or(RunnerError::EmptyCommand)?;
        let cancel_file = options.run_dir.join(CANCEL_FILE);

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&options.run_dir)
            .envs(&options.env)
            .env("ASSAY_TASK_ID", &options.task_id)
            .env("ASSAY_RUN_DIR", &options.run_dir)
            .env("ASSAY_CANCEL_FILE", &cancel_file)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|e| RunnerError::StartFailed(format!("{}: {}", program, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RunnerError::StartFailed("stdout not captured".to_string()))?;
        let stdin = child.stdin.take();

        let stderr_tail = Arc::new(Mutex::new(VecDeque::new()));
        if let Some(stderr) = child.stderr.take() {
            let tail = stderr_tail.clone();
            let limit = self.stderr_tail_lines;
            tokio::spawn(async move {
                let mut stderr = BufReader::new(stderr);
                let mut buf = Vec::new();
                while let Ok(Some(line)) = read_lossy_line(&mut stderr, &mut buf).await {
                    let mut tail = tail.lock().unwrap_or_else(|e| e.into_inner());
                    if tail.len() == limit {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            });
        }

        info!(
            task_id = %options.task_id,
            pid = ?child.id(),
            program = %program,
            "Worker process launched"
        );

        Ok(Box::new(ProcessWorker {
            task_id: options.task_id.clone(),
            pid: child.id(),
            child,
            stdin,
            stdout: BufReader::new(stdout),
            line_buf: Vec::new(),
            stderr_tail,
            cancel_file,
        }))
    }
}

/// Read one line, replacing invalid UTF-8 instead of failing.
///
/// `buf` holds bytes of an unfinished line, so a read cancelled by
/// `select!` resumes where it stopped. Returns `None` at end of stream.
async fn read_lossy_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let read = reader.read_until(b'\n', buf).await?;
    if read == 0 && buf.is_empty() {
        return Ok(None);
    }

    let mut bytes = std::mem::take(buf);
    if bytes.last() == Some(&b'\n') {
        bytes.pop();
        if bytes.last() == Some(&b'\r') {
            bytes.pop();
        }
    }
    Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
}

struct ProcessWorker {
    task_id: String,
    pid: Option<u32>,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
    /// Partial line kept across cancelled reads.
    line_buf: Vec<u8>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    cancel_file: PathBuf,
}

#[async_trait]
impl WorkerProcess for ProcessWorker {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    async fn next_line(&mut self) -> Result<Option<String>> {
        read_lossy_line(&mut self.stdout, &mut self.line_buf).await
    }

    async fn request_cancel(&mut self) -> Result<()> {
        tokio::fs::write(&self.cancel_file, b"cancel\n").await?;

        if let Some(mut stdin) = self.stdin.take() {
            // The worker may have closed stdin already.
            if let Err(e) = stdin.write_all(b"cancel\n").await {
                debug!(task_id = %self.task_id, error = %e, "Could not write cancel line to stdin");
            } else if let Err(e) = stdin.flush().await {
                debug!(task_id = %self.task_id, error = %e, "Could not flush worker stdin");
            }
        }
        Ok(())
    }

    async fn wait(&mut self) -> Result<ExitInfo> {
        let status = self.child.wait().await?;
        Ok(ExitInfo {
            code: status.code(),
        })
    }

    async fn kill(&mut self) -> Result<()> {
        if let Some(pid) = self.pid {
            match signal::killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                Ok(()) => {
                    debug!(task_id = %self.task_id, pid = pid, "Sent SIGKILL to worker group");
                }
                Err(nix::errno::Errno::ESRCH) => {
                    debug!(task_id = %self.task_id, pid = pid, "Worker group already gone");
                }
                Err(e) => {
                    warn!(
                        task_id = %self.task_id,
                        pid = pid,
                        error = %e,
                        "Failed to signal worker group"
                    );
                }
            }
        }

        if let Err(e) = self.child.start_kill()
            && e.kind() != std::io::ErrorKind::InvalidInput
        {
            return Err(e.into());
        }
        Ok(())
    }

    fn stderr_tail(&self) -> Vec<String> {
        self.stderr_tail
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}
