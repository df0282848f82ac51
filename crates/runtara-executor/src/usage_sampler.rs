// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker that samples host and runtime CPU usage.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::orchestrator::Orchestrator;
use crate::usage::UsageStore;

/// Default sampling interval.
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// Periodically folds orchestrator usage readings into a [`UsageStore`].
pub struct UsageSampler {
    orchestrator: Arc<dyn Orchestrator>,
    store: Arc<UsageStore>,
    interval: Duration,
    shutdown: Arc<Notify>,
}

impl UsageSampler {
    /// Create a sampler with the default interval.
    pub fn new(orchestrator: Arc<dyn Orchestrator>, store: Arc<UsageStore>) -> Self {
        Self {
            orchestrator,
            store,
            interval: DEFAULT_SAMPLE_INTERVAL,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Set the sampling interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Take one sample.
    pub async fn sample(&self) {
        let report = match self.orchestrator.usage().await {
            Ok(report) => report,
            Err(e) => {
                warn!(error = %e, "Failed to read resource usage");
                return;
            }
        };

        if let Some(host) = report.host {
            self.store.record_host(host);
        }
        for (name, reading) in &report.containers {
            self.store.record_runtime(name, *reading);
        }
        self.store.retain_runtimes(&report.containers);

        debug!(
            host = ?self.store.host(),
            runtimes = report.containers.len(),
            "Usage sampled"
        );
    }

    /// Sample on every tick until shutdown is signalled.
    ///
    /// The first sample is taken by the caller via [`UsageSampler::sample`]
    /// so health checks have data before the loop starts.
    pub async fn run(&self) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            "Usage sampler started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Usage sampler received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.interval) => {
                    self.sample().await;
                }
            }
        }

        info!("Usage sampler stopped");
    }
}
