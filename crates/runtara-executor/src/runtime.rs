// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for runtara-executor.
//!
//! [`ExecutorRuntime`] owns the executor's lifecycle:
//!
//! 1. bind the HTTP listener
//! 2. remove containers and networks left behind by a previous run
//! 3. create runtime networks and pull runtime images
//! 4. take a first usage sample, then start the sampler and maintenance workers
//! 5. serve the API
//!
//! [`ExecutorRuntime::shutdown`] stops the server and workers, then removes
//! every container this host owns.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use runtara_executor::config::Config;
//! use runtara_executor::orchestrator::{DockerCli, DockerCliConfig};
//! use runtara_executor::runtime::ExecutorRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let runtime = ExecutorRuntime::builder()
//!         .config(config)
//!         .orchestrator(Arc::new(DockerCli::new(DockerCliConfig::default())))
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     runtime.shutdown().await
//! }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::build::{BuildPipeline, DEFAULT_REMOVE_GRACE};
use crate::config::Config;
use crate::handlers::AppState;
use crate::maintenance::{MaintenanceConfig, MaintenanceWorker};
use crate::network::NetworkManager;
use crate::orchestrator::Orchestrator;
use crate::registry::RuntimeRegistry;
use crate::server::{build_router, serve};
use crate::usage_sampler::{DEFAULT_SAMPLE_INTERVAL, UsageSampler};

/// Builder for creating an [`ExecutorRuntime`].
pub struct ExecutorRuntimeBuilder {
    config: Option<Config>,
    orchestrator: Option<Arc<dyn Orchestrator>>,
    remove_grace: Duration,
    sample_interval: Duration,
}

impl Default for ExecutorRuntimeBuilder {
    fn default() -> Self {
        Self {
            config: None,
            orchestrator: None,
            remove_grace: DEFAULT_REMOVE_GRACE,
            sample_interval: DEFAULT_SAMPLE_INTERVAL,
        }
    }
}

impl ExecutorRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the executor configuration (required).
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the container engine (required).
    pub fn orchestrator(mut self, orchestrator: Arc<dyn Orchestrator>) -> Self {
        self.orchestrator = Some(orchestrator);
        self
    }

    /// Set the delay before auto-removed runtimes are torn down.
    ///
    /// Default: 2 seconds
    pub fn remove_grace(mut self, grace: Duration) -> Self {
        self.remove_grace = grace;
        self
    }

    /// Set the usage sampling interval.
    ///
    /// Default: 1 second
    pub fn sample_interval(mut self, interval: Duration) -> Self {
        self.sample_interval = interval;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing or the configuration
    /// is invalid.
    pub fn build(self) -> Result<ExecutorRuntimeConfig> {
        let config = self
            .config
            .ok_or_else(|| anyhow::anyhow!("config is required"))?;
        let orchestrator = self
            .orchestrator
            .ok_or_else(|| anyhow::anyhow!("orchestrator is required"))?;
        config.validate()?;

        Ok(ExecutorRuntimeConfig {
            config: Arc::new(config),
            orchestrator,
            remove_grace: self.remove_grace,
            sample_interval: self.sample_interval,
        })
    }
}

/// Configuration for an [`ExecutorRuntime`].
pub struct ExecutorRuntimeConfig {
    config: Arc<Config>,
    orchestrator: Arc<dyn Orchestrator>,
    remove_grace: Duration,
    sample_interval: Duration,
}

impl ExecutorRuntimeConfig {
    /// Start the runtime.
    pub async fn start(self) -> Result<ExecutorRuntime> {
        let config = self.config;
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        let registry = Arc::new(RuntimeRegistry::new(config.registry_capacity));
        let network = NetworkManager::new(
            config.hostname.clone(),
            config.executor_image.clone(),
            registry.clone(),
            self.orchestrator.clone(),
        );

        network.reconcile_orphans(&config.networks).await;
        let networks = network.bootstrap(&config.networks).await;
        if networks.is_empty() {
            anyhow::bail!("no runtime network could be created");
        }
        network.warmup(&config.warmup_images).await;

        let pipeline = BuildPipeline::new(
            config.clone(),
            registry.clone(),
            self.orchestrator.clone(),
            networks.clone(),
        )
        .with_remove_grace(self.remove_grace);
        let state = Arc::new(AppState::new(
            config.clone(),
            registry.clone(),
            self.orchestrator.clone(),
            pipeline,
            local_addr,
        )?);

        // First sample before serving so health has data
        let sampler = UsageSampler::new(self.orchestrator.clone(), state.usage.clone())
            .with_interval(self.sample_interval);
        sampler.sample().await;
        let sampler_shutdown = sampler.shutdown_handle();
        let sampler_handle = tokio::spawn(async move {
            sampler.run().await;
        });

        let maintenance = MaintenanceWorker::new(
            MaintenanceConfig::from_config(&config),
            registry,
            self.orchestrator.clone(),
        );
        let maintenance_shutdown = maintenance.shutdown_handle();
        let maintenance_handle = tokio::spawn(async move {
            maintenance.run().await;
        });

        let (server_shutdown_tx, server_shutdown_rx) = watch::channel(false);
        let server_handle = tokio::spawn(serve(
            listener,
            build_router(state.clone()),
            server_shutdown_rx,
        ));

        info!(
            addr = %local_addr,
            hostname = %config.hostname,
            networks = ?networks,
            orchestrator = self.orchestrator.orchestrator_type(),
            "ExecutorRuntime started"
        );

        Ok(ExecutorRuntime {
            server_handle,
            sampler_handle,
            maintenance_handle,
            server_shutdown_tx,
            sampler_shutdown,
            maintenance_shutdown,
            network,
            state,
            local_addr,
        })
    }
}

/// A running executor.
///
/// The runtime manages:
/// - HTTP server for the executor API
/// - Usage sampler feeding the health endpoint
/// - Maintenance worker evicting idle runtimes
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct ExecutorRuntime {
    server_handle: JoinHandle<Result<()>>,
    sampler_handle: JoinHandle<()>,
    maintenance_handle: JoinHandle<()>,
    server_shutdown_tx: watch::Sender<bool>,
    sampler_shutdown: Arc<Notify>,
    maintenance_shutdown: Arc<Notify>,
    network: NetworkManager,
    state: Arc<AppState>,
    local_addr: SocketAddr,
}

impl ExecutorRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> ExecutorRuntimeBuilder {
        ExecutorRuntimeBuilder::new()
    }

    /// Address the HTTP server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Get a reference to the shared handler state.
    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// Check if the runtime is still running.
    pub fn is_running(&self) -> bool {
        !self.server_handle.is_finished()
            && !self.sampler_handle.is_finished()
            && !self.maintenance_handle.is_finished()
    }

    /// Gracefully shut down the runtime and remove owned containers.
    pub async fn shutdown(self) -> Result<()> {
        info!("ExecutorRuntime shutting down...");

        let _ = self.server_shutdown_tx.send(true);
        self.sampler_shutdown.notify_one();
        self.maintenance_shutdown.notify_one();

        if let Err(e) = self.sampler_handle.await {
            error!(error = %e, "Usage sampler task panicked");
        }
        if let Err(e) = self.maintenance_handle.await {
            error!(error = %e, "Maintenance worker task panicked");
        }

        let server_result = match self.server_handle.await {
            Ok(result) => result,
            Err(e) => Err(anyhow::anyhow!("server task panicked: {}", e)),
        };

        self.network
            .reconcile_orphans(&self.state.config.networks)
            .await;

        match server_result {
            Ok(()) => {
                info!("ExecutorRuntime shutdown complete");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "ExecutorRuntime server error during shutdown");
                Err(e)
            }
        }
    }
}
