// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker for deleting unreferenced artifacts.
//!
//! A blob is deleted only when no step run lists it and it is older than
//! the retention window. The window also covers artifacts uploaded by an
//! executor whose step run is not finalized yet. Blobs uploaded for a task
//! whose success lost to a cancel are never referenced and go on a later pass.

use std::sync::Arc;
use std::time::Duration;

use assay_core::{ArtifactStore, Persistence};
use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::error::Result;

/// Configuration for the artifact GC worker.
#[derive(Debug, Clone)]
pub struct ArtifactGcConfig {
    /// Disabled by default; deleting blobs is opt-in.
    pub enabled: bool,
    /// How often to run a collection pass.
    pub poll_interval: Duration,
    /// Minimum age of an unreferenced blob before it is deleted.
    pub retention: Duration,
}

impl Default for ArtifactGcConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            poll_interval: Duration::from_secs(6 * 3600),
            retention: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

/// Background worker that garbage-collects the artifact store.
pub struct ArtifactGcWorker {
    persistence: Arc<dyn Persistence>,
    store: Arc<dyn ArtifactStore>,
    config: ArtifactGcConfig,
    shutdown: Arc<Notify>,
}

impl ArtifactGcWorker {
    pub fn new(
        persistence: Arc<dyn Persistence>,
        store: Arc<dyn ArtifactStore>,
        config: ArtifactGcConfig,
    ) -> Self {
        Self {
            persistence,
            store,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the collection loop until shutdown.
    pub async fn run(&self) {
        if !self.config.enabled {
            info!("Artifact GC worker disabled");
            return;
        }

        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            retention_secs = self.config.retention.as_secs(),
            "Artifact GC worker started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Artifact GC worker received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.collect_once().await {
                        error!(error = %e, "Failed to collect artifacts");
                    }
                }
            }
        }

        info!("Artifact GC worker stopped");
    }

    /// One pass. Returns the number of deleted blobs.
    pub async fn collect_once(&self) -> Result<usize> {
        let referenced = self.persistence.referenced_artifacts().await?;
        let removed = self.store.gc(&referenced, self.config.retention).await?;

        if removed > 0 {
            info!(
                removed = removed,
                referenced = referenced.len(),
                "Artifact GC pass completed"
            );
        } else {
            debug!(referenced = referenced.len(), "Artifact GC pass completed, nothing to delete");
        }
        Ok(removed)
    }
}
