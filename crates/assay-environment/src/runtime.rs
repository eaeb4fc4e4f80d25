// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime.
//!
//! [`EnvironmentRuntime`] wires the state machine, ledger, executor, worker
//! pool, heartbeat monitor and artifact GC into an existing tokio application.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use assay_core::{FsArtifactStore, SqlitePersistence};
//! use assay_environment::runner::ProcessRunner;
//! use assay_environment::runtime::EnvironmentRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let persistence = Arc::new(SqlitePersistence::connect("sqlite://assay.db?mode=rwc").await?);
//!     let store = FsArtifactStore::new(".data", "http://localhost:8080", b"key".to_vec())?;
//!     let store = Arc::new(store);
//!
//!     let runtime = EnvironmentRuntime::builder()
//!         .persistence(persistence)
//!         .artifact_store(store)
//!         .runner(Arc::new(ProcessRunner::new()))
//!         .workers(4)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... serve the API with runtime.machine() / runtime.ledger() ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use assay_core::events::DEFAULT_SUBSCRIBER_BACKLOG;
use assay_core::{
    ArtifactStore, EventBus, LifecycleHook, Persistence, StateMachineConfig, StepRunLedger,
    TaskQueue, TaskStateMachine,
};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::artifact_gc_worker::{ArtifactGcConfig, ArtifactGcWorker};
use crate::error::{Error, Result};
use crate::executor::{Executor, ExecutorConfig};
use crate::heartbeat_monitor::{HeartbeatMonitor, HeartbeatMonitorConfig};
use crate::runner::Runner;
use crate::worker_pool::{WorkerPool, WorkerPoolConfig};

/// Builder for [`EnvironmentRuntime`].
pub struct EnvironmentRuntimeBuilder {
    persistence: Option<Arc<dyn Persistence>>,
    store: Option<Arc<dyn ArtifactStore>>,
    runner: Option<Arc<dyn Runner>>,
    executor: ExecutorConfig,
    pool: WorkerPoolConfig,
    heartbeat: HeartbeatMonitorConfig,
    artifact_gc: ArtifactGcConfig,
    state_machine: StateMachineConfig,
    subscriber_backlog: usize,
}

impl Default for EnvironmentRuntimeBuilder {
    fn default() -> Self {
        Self {
            persistence: None,
            store: None,
            runner: None,
            executor: ExecutorConfig::default(),
            pool: WorkerPoolConfig::default(),
            heartbeat: HeartbeatMonitorConfig::default(),
            artifact_gc: ArtifactGcConfig::default(),
            state_machine: StateMachineConfig::default(),
            subscriber_backlog: DEFAULT_SUBSCRIBER_BACKLOG,
        }
    }
}

impl EnvironmentRuntimeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the persistence layer (required).
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Set the artifact store (required).
    pub fn artifact_store(mut self, store: Arc<dyn ArtifactStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the worker runner (required).
    pub fn runner(mut self, runner: Arc<dyn Runner>) -> Self {
        self.runner = Some(runner);
        self
    }

    /// Root of the run directories.
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.executor.data_dir = path.into();
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.pool.workers = workers;
        self
    }

    /// Liveness timeout for the executor and the heartbeat monitor.
    pub fn liveness_timeout(mut self, timeout: Duration) -> Self {
        self.executor.liveness_timeout = timeout;
        self.heartbeat.heartbeat_timeout = timeout;
        self
    }

    /// Cancellation grace for the executor, the watchdog and the monitor.
    pub fn cancel_grace(mut self, grace: Duration) -> Self {
        self.executor.cancel_grace = grace;
        self.heartbeat.cancel_grace = grace;
        self.state_machine.cancel_grace = grace;
        self
    }

    pub fn subscriber_backlog(mut self, backlog: usize) -> Self {
        self.subscriber_backlog = backlog;
        self
    }

    pub fn executor_config(mut self, config: ExecutorConfig) -> Self {
        self.executor = config;
        self
    }

    pub fn worker_pool_config(mut self, config: WorkerPoolConfig) -> Self {
        self.pool = config;
        self
    }

    pub fn heartbeat_config(mut self, config: HeartbeatMonitorConfig) -> Self {
        self.heartbeat = config;
        self
    }

    pub fn artifact_gc_config(mut self, config: ArtifactGcConfig) -> Self {
        self.artifact_gc = config;
        self
    }

    pub fn state_machine_config(mut self, config: StateMachineConfig) -> Self {
        self.state_machine = config;
        self
    }

    /// Validate and construct the shared components.
    pub fn build(self) -> Result<EnvironmentRuntimeConfig> {
        let persistence = self
            .persistence
            .ok_or_else(|| Error::Config("persistence is required".to_string()))?;
        let store = self
            .store
            .ok_or_else(|| Error::Config("artifact store is required".to_string()))?;
        let runner = self
            .runner
            .ok_or_else(|| Error::Config("runner is required".to_string()))?;
        if self.subscriber_backlog == 0 {
            return Err(Error::Config("subscriber backlog must be positive".to_string()));
        }

        let bus = Arc::new(EventBus::new(self.subscriber_backlog));
        let machine = TaskStateMachine::new(persistence.clone(), bus, self.state_machine);
        let ledger = StepRunLedger::new(persistence.clone());
        let queue = TaskQueue::new(persistence.clone(), self.pool.lease);

        Ok(EnvironmentRuntimeConfig {
            machine,
            ledger,
            store,
            runner,
            queue,
            executor: self.executor,
            pool: self.pool,
            heartbeat: self.heartbeat,
            artifact_gc: self.artifact_gc,
            persistence,
            hooks: Vec::new(),
        })
    }
}

/// Built but not yet started runtime. Hooks are registered here because
/// they usually need the state machine and ledger.
pub struct EnvironmentRuntimeConfig {
    machine: TaskStateMachine,
    ledger: StepRunLedger,
    store: Arc<dyn ArtifactStore>,
    runner: Arc<dyn Runner>,
    queue: TaskQueue,
    executor: ExecutorConfig,
    pool: WorkerPoolConfig,
    heartbeat: HeartbeatMonitorConfig,
    artifact_gc: ArtifactGcConfig,
    persistence: Arc<dyn Persistence>,
    hooks: Vec<Arc<dyn LifecycleHook>>,
}

impl EnvironmentRuntimeConfig {
    pub fn machine(&self) -> &TaskStateMachine {
        &self.machine
    }

    pub fn ledger(&self) -> &StepRunLedger {
        &self.ledger
    }

    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        &self.store
    }

    /// Run `hook` after every task reaches a terminal status.
    pub fn hook(mut self, hook: Arc<dyn LifecycleHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Spawn the worker pool, the heartbeat monitor and the artifact GC.
    pub async fn start(self) -> Result<EnvironmentRuntime> {
        tokio::fs::create_dir_all(self.executor.data_dir.join("runs")).await?;

        let executor = Arc::new(
            Executor::new(
                self.machine.clone(),
                self.ledger.clone(),
                self.store.clone(),
                self.runner.clone(),
                self.executor,
            )
            .with_hooks(self.hooks),
        );

        let pool = Arc::new(WorkerPool::new(
            executor.clone(),
            self.queue.clone(),
            self.machine.queue_notify(),
            self.pool,
        ));
        let pool_shutdown = pool.shutdown_handle();
        let mut handles = pool.spawn();

        let monitor = HeartbeatMonitor::new(
            self.machine.clone(),
            executor.active_tasks(),
            self.heartbeat,
        );
        let monitor_shutdown = monitor.shutdown_handle();
        handles.push(tokio::spawn(async move { monitor.run().await }));

        let gc = ArtifactGcWorker::new(self.persistence, self.store.clone(), self.artifact_gc);
        let gc_shutdown = gc.shutdown_handle();
        handles.push(tokio::spawn(async move { gc.run().await }));

        info!(runner = self.runner.runner_type(), "Environment runtime started");

        Ok(EnvironmentRuntime {
            machine: self.machine,
            ledger: self.ledger,
            store: self.store,
            queue: self.queue,
            pool_shutdown,
            monitor_shutdown,
            gc_shutdown,
            handles,
            running: Arc::new(AtomicBool::new(true)),
        })
    }
}

/// A running runtime.
pub struct EnvironmentRuntime {
    machine: TaskStateMachine,
    ledger: StepRunLedger,
    store: Arc<dyn ArtifactStore>,
    queue: TaskQueue,
    pool_shutdown: CancellationToken,
    monitor_shutdown: Arc<Notify>,
    gc_shutdown: Arc<Notify>,
    handles: Vec<JoinHandle<()>>,
    running: Arc<AtomicBool>,
}

impl EnvironmentRuntime {
    /// Create a new runtime builder.
    pub fn builder() -> EnvironmentRuntimeBuilder {
        EnvironmentRuntimeBuilder::new()
    }

    pub fn machine(&self) -> &TaskStateMachine {
        &self.machine
    }

    pub fn ledger(&self) -> &StepRunLedger {
        &self.ledger
    }

    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        &self.store
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop claiming new tasks, let running executions finish and wait
    /// for every background task.
    pub async fn shutdown(self) -> Result<()> {
        info!("Shutting down environment runtime");
        self.running.store(false, Ordering::SeqCst);
        self.pool_shutdown.cancel();
        self.monitor_shutdown.notify_one();
        self.gc_shutdown.notify_one();

        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        info!("Environment runtime stopped");
        Ok(())
    }
}
