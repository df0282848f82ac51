// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker for idle-runtime eviction.
//!
//! Each cycle:
//! - removes every runtime whose descriptor has not been touched within the
//!   inactivity threshold (container first, then descriptor)
//! - deletes scratch directories named `{hostname}-*` that no longer belong
//!   to a tracked runtime
//!
//! Evictions run as independent tasks so a slow or failing removal never
//! holds up the others.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::orchestrator::Orchestrator;
use crate::registry::{self, RuntimeRegistry};

/// Configuration for the maintenance worker.
#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    /// Executor hostname; prefixes runtime names and scratch directories.
    pub hostname: String,
    /// Root of the per-runtime scratch directories.
    pub scratch_root: PathBuf,
    /// How often to run a cycle.
    pub interval: Duration,
    /// Idle time after which a runtime is evicted.
    pub inactive_threshold: Duration,
}

impl MaintenanceConfig {
    /// Take the maintenance settings from the executor configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            hostname: config.hostname.clone(),
            scratch_root: config.scratch_root.clone(),
            interval: config.maintenance_interval,
            inactive_threshold: config.inactive_threshold,
        }
    }
}

/// Summary of one maintenance cycle.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Runtimes evicted for inactivity.
    pub evicted: Vec<String>,
    /// Scratch directories deleted.
    pub scratch_deleted: usize,
}

/// Background worker that evicts idle runtimes.
pub struct MaintenanceWorker {
    config: MaintenanceConfig,
    registry: Arc<RuntimeRegistry>,
    orchestrator: Arc<dyn Orchestrator>,
    shutdown: Arc<Notify>,
}

impl MaintenanceWorker {
    /// Create a new maintenance worker.
    pub fn new(
        config: MaintenanceConfig,
        registry: Arc<RuntimeRegistry>,
        orchestrator: Arc<dyn Orchestrator>,
    ) -> Self {
        Self {
            config,
            registry,
            orchestrator,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the maintenance loop until shutdown is signalled.
    pub async fn run(&self) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            inactive_threshold_secs = self.config.inactive_threshold.as_secs(),
            "Maintenance worker started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Maintenance worker received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.interval) => {
                    self.run_once().await;
                }
            }
        }

        info!("Maintenance worker stopped");
    }

    /// Run a single cycle and wait for its evictions to finish.
    pub async fn run_once(&self) -> MaintenanceReport {
        let evicted = self.evict_inactive().await;
        let scratch_deleted = match self.cleanup_scratch().await {
            Ok(n) => n,
            Err(e) => {
                error!(error = %e, "Failed to clean up scratch directories");
                0
            }
        };

        if evicted.is_empty() && scratch_deleted == 0 {
            debug!("Maintenance cycle completed, nothing to do");
        } else {
            info!(
                evicted = evicted.len(),
                scratch_deleted, "Maintenance cycle completed"
            );
        }

        MaintenanceReport {
            evicted,
            scratch_deleted,
        }
    }

    async fn evict_inactive(&self) -> Vec<String> {
        let cutoff = registry::now() - self.config.inactive_threshold.as_secs_f64();
        let idle: Vec<String> = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|descriptor| descriptor.updated < cutoff)
            .map(|descriptor| descriptor.name)
            .collect();

        let tasks: Vec<_> = idle
            .iter()
            .cloned()
            .map(|name| {
                let registry = self.registry.clone();
                let orchestrator = self.orchestrator.clone();
                tokio::spawn(async move {
                    info!(runtime_id = %name, "Evicting inactive runtime");
                    if let Err(e) = orchestrator.remove(&name, true).await {
                        warn!(runtime_id = %name, error = %e, "Failed to remove inactive runtime");
                    }
                    registry.delete(&name);
                })
            })
            .collect();

        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                error!(error = %e, "Eviction task panicked");
            }
        }

        idle
    }

    async fn cleanup_scratch(&self) -> std::io::Result<usize> {
        let mut entries = match tokio::fs::read_dir(&self.config.scratch_root).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Scratch root does not exist, nothing to clean");
                return Ok(0);
            }
            Err(e) => return Err(e),
        };

        let prefix = format!("{}-", self.config.hostname);
        let live: HashSet<String> = self
            .registry
            .snapshot()
            .into_iter()
            .map(|descriptor| descriptor.name)
            .collect();

        let mut deleted = 0;
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let name = file_name.to_string_lossy();
            if !name.starts_with(&prefix) || live.contains(name.as_ref()) {
                continue;
            }

            let path = entry.path();
            let result = if path.is_dir() {
                tokio::fs::remove_dir_all(&path).await
            } else {
                tokio::fs::remove_file(&path).await
            };
            match result {
                Ok(()) => {
                    debug!(path = %path.display(), "Deleted orphaned scratch directory");
                    deleted += 1;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to delete scratch directory");
                }
            }
        }

        Ok(deleted)
    }
}
