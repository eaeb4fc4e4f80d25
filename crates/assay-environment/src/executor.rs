// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runner contract executor.
//!
//! Owns one task from `start()` to its terminal status:
//!
//! 1. Materialize `inputs.json` / `params.json` in the run directory.
//! 2. Launch the worker and read its stdout line by line. Valid progress
//!    lines are published, malformed ones are logged and skipped. If no
//!    valid line arrives within the liveness timeout the worker is killed
//!    and the task fails with `RunnerUnresponsive`.
//! 3. On exit 0, read `outputs.json`, verify every declared artifact hash,
//!    upload them, then mark the task SUCCEEDED and store its step run in
//!    one transaction.
//!    Any verification or upload problem fails the task with
//!    `ArtifactPersistError`; nothing is linked.
//! 4. On non-zero exit or timeout, fail the task with the diagnostic tail.
//!
//! Cancellation is cooperative: the worker gets the cancel signal and has
//! `cancel_grace` to exit before it is killed. Either way the task ends
//! CANCELED and no step run is recorded.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use assay_core::artifact_store::{is_valid_hash, put_file};
use assay_core::model::{
    ArtifactRef, FailureKind, Finalization, StepDefinition, StepRun, Task, TaskFailure,
    TaskOutcome, TaskStatus,
};
use assay_core::{
    ArtifactStore, CoreError, EventKind, LifecycleHook, Persistence, StepRunLedger,
    TaskStateMachine,
};
use dashmap::DashSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::contract::{self, InputsFile, OutputsFile, ProgressLine};
use crate::error::Result;
use crate::runner::{ExitInfo, LaunchOptions, Runner, WorkerProcess};

/// Longest diagnostic line kept, in bytes.
const MAX_TAIL_LINE: usize = 2048;

/// Executor configuration.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Run directories live under `<data_dir>/runs/<task_id>`.
    pub data_dir: PathBuf,
    /// Maximum silence between valid progress lines.
    pub liveness_timeout: Duration,
    /// Overall wall-clock limit of one execution.
    pub execution_timeout: Duration,
    /// Time a worker gets to exit after the cancel signal.
    pub cancel_grace: Duration,
    /// Output lines kept for failed tasks.
    pub diagnostic_tail_lines: usize,
    /// How often timeouts and the persisted cancel flag are checked.
    pub check_interval: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".data"),
            liveness_timeout: Duration::from_secs(60),
            execution_timeout: Duration::from_secs(30 * 60),
            cancel_grace: Duration::from_secs(10),
            diagnostic_tail_lines: 50,
            check_interval: Duration::from_millis(500),
        }
    }
}

/// How an execution ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Succeeded(StepRun),
    Failed(TaskFailure),
    Canceled { forced: bool },
    /// The task was no longer PENDING when this executor tried to start it.
    Skipped(TaskStatus),
    /// Another writer reached a terminal status first.
    Superseded(TaskStatus),
}

/// Bounded ring of recent worker output.
#[derive(Debug, Clone)]
pub struct DiagnosticTail {
    lines: VecDeque<String>,
    limit: usize,
}

impl DiagnosticTail {
    pub fn new(limit: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(limit.min(1024)),
            limit: limit.max(1),
        }
    }

    pub fn push(&mut self, line: &str) {
        if self.lines.len() == self.limit {
            self.lines.pop_front();
        }
        let mut line = line.to_string();
        if line.len() > MAX_TAIL_LINE {
            let mut cut = MAX_TAIL_LINE;
            while !line.is_char_boundary(cut) {
                cut -= 1;
            }
            line.truncate(cut);
        }
        self.lines.push_back(line);
    }

    /// Stdout tail followed by the stderr tail, both bounded by the limit.
    pub fn with_stderr(&self, stderr: Vec<String>) -> Vec<String> {
        let skip = stderr.len().saturating_sub(self.limit);
        self.lines
            .iter()
            .cloned()
            .chain(stderr.into_iter().skip(skip).map(|l| format!("stderr: {}", l)))
            .collect()
    }
}

enum WorkerEnd {
    Exited(ExitInfo),
    Unresponsive,
    TimedOut,
    Canceled { forced: bool },
    Lost(String),
}

enum Step {
    Cancel,
    Tick,
    Line(crate::runner::Result<Option<String>>),
    Exit(crate::runner::Result<ExitInfo>),
}

struct Prepared {
    step: StepDefinition,
    run_dir: PathBuf,
}

/// Removes a task from the active set when execution ends.
struct ActiveGuard {
    active: Arc<DashSet<String>>,
    task_id: String,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.active.remove(&self.task_id);
    }
}

/// Drives tasks through the runner contract.
pub struct Executor {
    machine: TaskStateMachine,
    ledger: StepRunLedger,
    store: Arc<dyn ArtifactStore>,
    runner: Arc<dyn Runner>,
    hooks: Vec<Arc<dyn LifecycleHook>>,
    active: Arc<DashSet<String>>,
    config: ExecutorConfig,
}

impl Executor {
    pub fn new(
        machine: TaskStateMachine,
        ledger: StepRunLedger,
        store: Arc<dyn ArtifactStore>,
        runner: Arc<dyn Runner>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            machine,
            ledger,
            store,
            runner,
            hooks: Vec::new(),
            active: Arc::new(DashSet::new()),
            config,
        }
    }

    pub fn with_hooks(mut self, hooks: Vec<Arc<dyn LifecycleHook>>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Tasks currently executing in this process.
    pub fn active_tasks(&self) -> Arc<DashSet<String>> {
        self.active.clone()
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn run_dir(&self, task_id: &str) -> PathBuf {
        self.config.data_dir.join("runs").join(task_id)
    }

    /// Execute a task. Returns `Skipped` unless this call won `start()`.
    pub async fn execute(&self, task_id: &str) -> Result<ExecutionOutcome> {
        let task = match self.machine.start(task_id).await {
            Ok(task) => task,
            Err(CoreError::IllegalTransition { .. }) => {
                let status = self.machine.get(task_id).await?.status;
                debug!(task_id = %task_id, status = %status, "Task no longer pending, skipping");
                return Ok(ExecutionOutcome::Skipped(status));
            }
            Err(e) => return Err(e.into()),
        };

        self.active.insert(task.task_id.clone());
        let _guard = ActiveGuard {
            active: self.active.clone(),
            task_id: task.task_id.clone(),
        };

        match self.drive(&task).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                error!(task_id = %task_id, error = %e, "Execution aborted by internal error");
                let failure = TaskFailure::new(FailureKind::Internal, e.to_string());
                if let Err(complete_err) = self
                    .machine
                    .complete(task_id, TaskOutcome::Failed(failure))
                    .await
                {
                    debug!(task_id = %task_id, error = %complete_err, "Task already terminal");
                }
                Err(e)
            }
        }
    }

    async fn drive(&self, task: &Task) -> Result<ExecutionOutcome> {
        let token = self.machine.cancellation_token(&task.task_id);

        let prepared = match self.prepare(task).await {
            Ok(prepared) => prepared,
            Err(failure) => return self.fail(task, failure).await,
        };

        let options = LaunchOptions {
            task_id: task.task_id.clone(),
            command: prepared.step.command.clone(),
            run_dir: prepared.run_dir.clone(),
            env: HashMap::from([
                ("ASSAY_STEP_REF".to_string(), task.step_ref.clone()),
                ("ASSAY_CODE_IDENTITY".to_string(), task.code_identity.clone()),
            ]),
        };

        let mut worker = match self.runner.launch(&options).await {
            Ok(worker) => worker,
            Err(e) => {
                let failure = TaskFailure::new(FailureKind::LaunchFailed, e.to_string());
                return self.fail(task, failure).await;
            }
        };

        let mut tail = DiagnosticTail::new(self.config.diagnostic_tail_lines);
        let end = self
            .monitor(task, worker.as_mut(), &mut tail, &token)
            .await;
        let diagnostic = tail.with_stderr(worker.stderr_tail());

        match end {
            WorkerEnd::Exited(exit) if exit.success() => {
                self.collect(task, &prepared, diagnostic).await
            }
            WorkerEnd::Exited(exit) => {
                let reason = match exit.code {
                    Some(code) => format!("runner exited with code {}", code),
                    None => "runner terminated by signal".to_string(),
                };
                let failure = TaskFailure::new(FailureKind::ExitCode, reason).with_tail(diagnostic);
                self.fail(task, failure).await
            }
            WorkerEnd::Unresponsive => {
                let reason = CoreError::RunnerUnresponsive {
                    task_id: task.task_id.clone(),
                    timeout: self.config.liveness_timeout,
                }
                .to_string();
                let failure =
                    TaskFailure::new(FailureKind::RunnerUnresponsive, reason).with_tail(diagnostic);
                self.fail(task, failure).await
            }
            WorkerEnd::TimedOut => {
                let reason = format!(
                    "timeout: execution exceeded {}s",
                    self.config.execution_timeout.as_secs()
                );
                let failure = TaskFailure::new(FailureKind::Timeout, reason).with_tail(diagnostic);
                self.fail(task, failure).await
            }
            WorkerEnd::Canceled { forced } => {
                let done = self.machine.acknowledge_cancel(&task.task_id, forced).await;
                match done {
                    Ok(_) => {
                        self.run_hooks(&task.task_id, None).await;
                        Ok(ExecutionOutcome::Canceled { forced })
                    }
                    Err(CoreError::IllegalTransition { from, .. }) => {
                        warn!(
                            task_id = %task.task_id,
                            current = %from,
                            "Cancellation lost the race"
                        );
                        Ok(ExecutionOutcome::Superseded(self.status(&task.task_id).await?))
                    }
                    Err(e) => Err(e.into()),
                }
            }
            WorkerEnd::Lost(reason) => {
                let failure = TaskFailure::new(FailureKind::Internal, reason).with_tail(diagnostic);
                self.fail(task, failure).await
            }
        }
    }

    async fn prepare(&self, task: &Task) -> std::result::Result<Prepared, TaskFailure> {
        let internal = |e: CoreError| TaskFailure::new(FailureKind::Internal, e.to_string());

        let step = self
            .machine
            .persistence()
            .get_step_version(&task.step_ref, task.schema_version)
            .await
            .map_err(internal)?
            .ok_or_else(|| {
                TaskFailure::new(
                    FailureKind::LaunchFailed,
                    format!(
                        "step '{}' version {} is not registered",
                        task.step_ref, task.schema_version
                    ),
                )
            })?;

        let mut artifact_refs = Vec::with_capacity(task.input_artifacts.len());
        for hash in &task.input_artifacts {
            if !self.store.exists(hash).await.map_err(internal)? {
                return Err(TaskFailure::new(
                    FailureKind::LaunchFailed,
                    format!("input artifact '{}' not found", hash),
                ));
            }
            artifact_refs.push(self.store.uri(hash));
        }

        let run_dir = self.run_dir(&task.task_id);
        let io_failure =
            |e: std::io::Error| TaskFailure::new(FailureKind::Internal, e.to_string());
        tokio::fs::create_dir_all(&run_dir)
            .await
            .map_err(io_failure)?;

        let inputs = InputsFile {
            artifact_refs,
            params: task.params.clone(),
            reference: task.reference.clone(),
        };
        contract::write_inputs(&run_dir, &inputs)
            .await
            .map_err(|e| TaskFailure::new(FailureKind::Internal, e.to_string()))?;

        debug!(task_id = %task.task_id, run_dir = %run_dir.display(), "Run directory prepared");
        Ok(Prepared { step, run_dir })
    }

    async fn monitor(
        &self,
        task: &Task,
        worker: &mut dyn WorkerProcess,
        tail: &mut DiagnosticTail,
        token: &CancellationToken,
    ) -> WorkerEnd {
        let started = Instant::now();
        let mut last_valid = Instant::now();
        let mut ticker = tokio::time::interval(self.config.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut stdout_open = true;

        loop {
            let step = if stdout_open {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => Step::Cancel,
                    _ = ticker.tick() => Step::Tick,
                    line = worker.next_line() => Step::Line(line),
                }
            } else {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => Step::Cancel,
                    _ = ticker.tick() => Step::Tick,
                    exit = worker.wait() => Step::Exit(exit),
                }
            };

            match step {
                Step::Cancel => {
                    let forced = self.teardown(task, worker).await;
                    return WorkerEnd::Canceled { forced };
                }
                Step::Line(Ok(Some(line))) => {
                    if self.handle_line(task, &line, tail).await {
                        last_valid = Instant::now();
                    }
                }
                Step::Line(Ok(None)) => stdout_open = false,
                Step::Line(Err(e)) => {
                    warn!(task_id = %task.task_id, error = %e, "Worker stdout failed");
                    stdout_open = false;
                }
                Step::Exit(Ok(exit)) => {
                    info!(task_id = %task.task_id, code = ?exit.code, "Worker exited");
                    return WorkerEnd::Exited(exit);
                }
                Step::Exit(Err(e)) => return WorkerEnd::Lost(e.to_string()),
                Step::Tick => {
                    if started.elapsed() >= self.config.execution_timeout {
                        warn!(task_id = %task.task_id, "Execution timeout, killing worker");
                        self.kill(task, worker).await;
                        return WorkerEnd::TimedOut;
                    }
                    if last_valid.elapsed() >= self.config.liveness_timeout {
                        warn!(
                            task_id = %task.task_id,
                            timeout_ms = self.config.liveness_timeout.as_millis() as u64,
                            "No valid progress event within liveness timeout, killing worker"
                        );
                        self.kill(task, worker).await;
                        return WorkerEnd::Unresponsive;
                    }
                    // Cancellation requested through another process.
                    match self.machine.is_cancel_requested(&task.task_id).await {
                        Ok(true) => token.cancel(),
                        Ok(false) => {}
                        Err(e) => {
                            debug!(
                                task_id = %task.task_id,
                                error = %e,
                                "Could not read cancel flag"
                            )
                        }
                    }
                }
            }
        }
    }

    /// Returns true for a valid progress line.
    async fn handle_line(&self, task: &Task, line: &str, tail: &mut DiagnosticTail) -> bool {
        tail.push(line);

        match ProgressLine::parse(line) {
            Ok(progress) => {
                self.machine
                    .publish(
                        &task.task_id,
                        EventKind::Progress {
                            phase: progress.phase,
                            progress: progress.progress,
                            message: progress.message,
                        },
                    )
                    .await;
                for (key, value) in progress.metrics {
                    self.machine
                        .publish(&task.task_id, EventKind::Metric { key, value })
                        .await;
                }
                true
            }
            Err(e) => {
                warn!(task_id = %task.task_id, error = %e, "Skipping malformed progress line");
                false
            }
        }
    }

    /// Signal cancellation and wait out the grace period. Returns true if
    /// the worker had to be killed.
    async fn teardown(&self, task: &Task, worker: &mut dyn WorkerProcess) -> bool {
        info!(
            task_id = %task.task_id,
            grace_secs = self.config.cancel_grace.as_secs(),
            "Cancellation requested, signalling worker"
        );
        if let Err(e) = worker.request_cancel().await {
            warn!(task_id = %task.task_id, error = %e, "Failed to deliver cancel signal");
        }

        let graceful = tokio::time::timeout(self.config.cancel_grace, async {
            while let Ok(Some(_)) = worker.next_line().await {}
            worker.wait().await
        })
        .await;

        match graceful {
            Ok(Ok(exit)) => {
                info!(
                    task_id = %task.task_id,
                    code = ?exit.code,
                    "Worker acknowledged cancellation"
                );
                false
            }
            _ => {
                warn!(task_id = %task.task_id, "Cancel grace elapsed, killing worker");
                self.kill(task, worker).await;
                true
            }
        }
    }

    async fn kill(&self, task: &Task, worker: &mut dyn WorkerProcess) {
        if let Err(e) = worker.kill().await {
            error!(task_id = %task.task_id, error = %e, "Failed to kill worker");
            return;
        }
        if tokio::time::timeout(Duration::from_secs(5), worker.wait())
            .await
            .is_err()
        {
            warn!(task_id = %task.task_id, pid = ?worker.pid(), "Killed worker did not exit");
        }
    }

    /// Exit 0: verify and upload outputs, then succeed with the step run.
    async fn collect(
        &self,
        task: &Task,
        prepared: &Prepared,
        diagnostic: Vec<String>,
    ) -> Result<ExecutionOutcome> {
        let outputs = match contract::read_outputs(&prepared.run_dir).await {
            Ok(outputs) => outputs,
            Err(e) => {
                let failure = TaskFailure::new(FailureKind::ContractViolation, e.to_string())
                    .with_tail(diagnostic);
                return self.fail(task, failure).await;
            }
        };

        let artifacts = match self.persist_artifacts(task, &prepared.run_dir, &outputs).await {
            Ok(artifacts) => artifacts,
            Err(reason) => {
                error!(task_id = %task.task_id, reason = %reason, "Artifact persistence failed");
                let failure = TaskFailure::new(FailureKind::ArtifactPersistError, reason)
                    .with_tail(diagnostic);
                return self.fail(task, failure).await;
            }
        };

        for key in &prepared.step.metrics {
            if !outputs.metrics.contains_key(key) {
                warn!(
                    task_id = %task.task_id,
                    metric = %key,
                    "Declared metric missing from outputs"
                );
            }
        }
        for (key, value) in &outputs.metrics {
            self.machine
                .publish(
                    &task.task_id,
                    EventKind::Metric {
                        key: key.clone(),
                        value: value.clone(),
                    },
                )
                .await;
        }

        let record = self
            .ledger
            .record_for(
                task,
                Finalization {
                    task_id: task.task_id.clone(),
                    input_artifacts: task.input_artifacts.clone(),
                    params: task.params.clone(),
                    code_identity: task.code_identity.clone(),
                    metrics: outputs.metrics,
                    artifacts,
                    evidence: outputs.evidence,
                },
            )
            .await?;

        // Blobs uploaded above stay unreferenced if this loses the race;
        // the artifact GC reclaims them after the retention window.
        let run = match self.machine.succeed(record).await {
            Ok(run) => run,
            Err(CoreError::IllegalTransition { from, .. }) => {
                warn!(task_id = %task.task_id, current = %from, "Completion lost the race");
                return Ok(ExecutionOutcome::Superseded(self.status(&task.task_id).await?));
            }
            Err(e) => return Err(e.into()),
        };

        self.run_hooks(&task.task_id, Some(&run)).await;
        Ok(ExecutionOutcome::Succeeded(run))
    }

    /// Verify every declared artifact before uploading any of them.
    async fn persist_artifacts(
        &self,
        task: &Task,
        run_dir: &Path,
        outputs: &OutputsFile,
    ) -> std::result::Result<Vec<ArtifactRef>, String> {
        let mut verified = Vec::with_capacity(outputs.artifacts.len());
        for declared in &outputs.artifacts {
            let declared_hash = declared.hash.to_ascii_lowercase();
            if !is_valid_hash(&declared_hash) {
                return Err(format!(
                    "artifact '{}' declares invalid hash '{}'",
                    declared.uri, declared.hash
                ));
            }
            let path = declared.resolve_path(run_dir);
            match contract::hash_file(&path).await {
                Ok(actual) if actual == declared_hash => {
                    verified.push((path, declared, declared_hash));
                }
                Ok(actual) => {
                    return Err(format!(
                        "hash mismatch for '{}': declared {}, actual {}",
                        declared.uri, declared_hash, actual
                    ));
                }
                Err(e) => {
                    return Err(format!("cannot read artifact '{}': {}", declared.uri, e));
                }
            }
        }

        let mut stored = Vec::with_capacity(verified.len());
        for (path, declared, hash) in verified {
            let artifact = put_file(self.store.as_ref(), &path, &declared.kind, &hash)
                .await
                .map_err(|e| e.to_string())?;
            debug!(
                task_id = %task.task_id,
                hash = %artifact.hash,
                kind = %artifact.kind,
                "Artifact stored"
            );
            stored.push(artifact);
        }
        Ok(stored)
    }

    async fn fail(&self, task: &Task, failure: TaskFailure) -> Result<ExecutionOutcome> {
        self.machine
            .publish(
                &task.task_id,
                EventKind::Log {
                    level: "error".to_string(),
                    message: failure.reason.clone(),
                },
            )
            .await;

        match self
            .machine
            .complete(&task.task_id, TaskOutcome::Failed(failure.clone()))
            .await
        {
            Ok(_) => {
                self.run_hooks(&task.task_id, None).await;
                Ok(ExecutionOutcome::Failed(failure))
            }
            Err(CoreError::IllegalTransition { from, .. }) => {
                warn!(task_id = %task.task_id, current = %from, "Failure lost the race");
                Ok(ExecutionOutcome::Superseded(self.status(&task.task_id).await?))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn status(&self, task_id: &str) -> Result<TaskStatus> {
        Ok(self.machine.get(task_id).await?.status)
    }

    async fn run_hooks(&self, task_id: &str, step_run: Option<&StepRun>) {
        if self.hooks.is_empty() {
            return;
        }
        let task = match self.machine.get(task_id).await {
            Ok(task) => task,
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Could not load task for hooks");
                return;
            }
        };
        for hook in &self.hooks {
            if let Err(e) = hook.on_task_finished(&task, step_run).await {
                warn!(task_id = %task_id, hook = hook.name(), error = %e, "Lifecycle hook failed");
            }
        }
    }
}
