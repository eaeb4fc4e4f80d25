// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Assay Server - analysis job orchestrator
//!
//! Runs the worker pool, the heartbeat monitor and the advice hook, and
//! serves the HTTP API until Ctrl-C.

use std::sync::Arc;

use assay_advice::{AdvicePipeline, AdviceTools};
use assay_core::model::StepCatalog;
use assay_core::{ArtifactStore, FsArtifactStore, Persistence, SqlitePersistence};
use assay_environment::runner::{ProcessRunner, Runner};
use assay_environment::runtime::EnvironmentRuntime;
use assay_server::{AppState, Config, build_router};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "info,assay_core=info,assay_environment=info,assay_advice=info".into()
            }),
        )
        .init();

    let config = Config::load()?;

    info!(
        http_addr = %config.http_addr,
        data_dir = %config.data_dir.display(),
        workers = config.workers,
        "Starting Assay Server"
    );

    let persistence = Arc::new(SqlitePersistence::connect(&config.database_url).await?);
    info!("Connected to database");

    if let Some(command) = &config.runner_command {
        for step in StepCatalog::single_cell(command, &config.runner_code_identity) {
            let registered = persistence.register_step(&step).await?;
            info!(
                step_ref = %registered.step_ref,
                version = registered.version,
                "Built-in step registered"
            );
        }
    } else {
        warn!("ASSAY_RUNNER_COMMAND not set, only steps registered through the API will run");
    }

    let store: Arc<dyn ArtifactStore> = Arc::new(FsArtifactStore::new(
        &config.data_dir,
        config.public_url.as_str(),
        config.signing_key.as_bytes().to_vec(),
    )?);

    let runner = Arc::new(ProcessRunner::new());
    info!(runner_type = runner.runner_type(), "Runner initialized");

    let runtime = EnvironmentRuntime::builder()
        .persistence(persistence)
        .artifact_store(store.clone())
        .runner(runner)
        .executor_config(config.executor())
        .heartbeat_config(config.heartbeat())
        .artifact_gc_config(config.artifact_gc())
        .workers(config.workers)
        .cancel_grace(config.cancel_grace)
        .subscriber_backlog(config.subscriber_backlog)
        .build()?;

    let advice = Arc::new(AdvicePipeline::new(
        AdviceTools::new(
            runtime.machine().clone(),
            runtime.ledger().clone(),
            store.clone(),
        ),
        config.advice(),
    )?);
    let runtime = runtime.hook(advice.clone()).start().await?;

    let state = Arc::new(AppState::new(
        advice,
        store,
        config.public_url.as_str(),
        config.signed_url_ttl,
    ));
    let listener = tokio::net::TcpListener::bind(config.http_addr).await?;
    info!(addr = %listener.local_addr()?, "Assay Server ready");

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Shutdown signal received");
        })
        .await?;

    // Graceful shutdown
    runtime.shutdown().await?;

    info!("Assay Server shut down");

    Ok(())
}
