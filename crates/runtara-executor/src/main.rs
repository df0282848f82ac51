// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runtara Executor - Serverless Runtime Server
//!
//! An HTTP server responsible for:
//! - Runtime builds (stage source, run build command, persist artifact)
//! - Execution dispatch (on-demand build, cold start, proxy)
//! - Idle eviction and orphan cleanup
//! - Host and runtime usage reporting

use std::sync::Arc;

use tokio::signal::unix::{SignalKind, signal};
use tracing::{info, warn};

use runtara_executor::config::Config;
use runtara_executor::orchestrator::{DockerCli, DockerCliConfig, Orchestrator};
use runtara_executor::runtime::ExecutorRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "runtara_executor=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        bind_addr = %config.bind_addr,
        hostname = %config.hostname,
        mode = ?config.mode,
        scratch_root = %config.scratch_root.display(),
        "Starting Runtara Executor"
    );

    let docker = DockerCli::new(DockerCliConfig {
        credentials: config.registry_credentials.clone(),
        ..Default::default()
    });
    if let Err(e) = docker.login().await {
        warn!(error = %e, "Container registry login failed");
    }
    let orchestrator: Arc<dyn Orchestrator> = Arc::new(docker);
    info!(
        orchestrator_type = orchestrator.orchestrator_type(),
        "Orchestrator initialized"
    );

    let runtime = ExecutorRuntime::builder()
        .config(config)
        .orchestrator(orchestrator)
        .build()?
        .start()
        .await?;

    info!(addr = %runtime.local_addr(), "Executor server ready");

    // Wait for shutdown signal
    let mut terminate = signal(SignalKind::terminate())?;
    let mut quit = signal(SignalKind::quit())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = terminate.recv() => {}
        _ = quit.recv() => {}
    }
    info!("Shutdown signal received");

    runtime.shutdown().await?;

    info!("Runtara Executor shut down");

    Ok(())
}
