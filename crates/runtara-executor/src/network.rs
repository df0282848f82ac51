// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Network bootstrap, image warm-up and orphan reconciliation.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, error, info, warn};

use crate::build::EXECUTOR_LABEL;
use crate::orchestrator::Orchestrator;
use crate::registry::RuntimeRegistry;

/// Container label carrying the image name of the executor's own container.
pub const IMAGE_LABEL: &str = "openruntimes-image";

/// Manages host-level container resources owned by this executor.
pub struct NetworkManager {
    hostname: String,
    executor_image: String,
    registry: Arc<RuntimeRegistry>,
    orchestrator: Arc<dyn Orchestrator>,
}

impl NetworkManager {
    /// Create a manager for executor `hostname`.
    pub fn new(
        hostname: impl Into<String>,
        executor_image: impl Into<String>,
        registry: Arc<RuntimeRegistry>,
        orchestrator: Arc<dyn Orchestrator>,
    ) -> Self {
        Self {
            hostname: hostname.into(),
            executor_image: executor_image.into(),
            registry,
            orchestrator,
        }
    }

    /// Force-remove every container labelled as owned by this host, then the
    /// given networks. Failures are logged and skipped.
    ///
    /// Returns the names of the removed containers.
    pub async fn reconcile_orphans(&self, networks: &[String]) -> Vec<String> {
        let filter = HashMap::from([(EXECUTOR_LABEL.to_string(), self.hostname.clone())]);
        let containers = match self.orchestrator.list(&filter).await {
            Ok(containers) => containers,
            Err(e) => {
                error!(error = %e, "Failed to list owned containers");
                Vec::new()
            }
        };

        let removals = containers.iter().map(|container| async move {
            let result = self.orchestrator.remove(&container.name, true).await;
            self.registry.delete(&container.name);
            match result {
                Ok(()) => {
                    debug!(runtime_id = %container.name, "Removed owned container");
                    Some(container.name.clone())
                }
                Err(e) => {
                    warn!(runtime_id = %container.name, error = %e, "Failed to remove owned container");
                    None
                }
            }
        });
        let removed: Vec<String> = join_all(removals).await.into_iter().flatten().collect();

        for network in networks {
            match self.orchestrator.network_exists(network).await {
                Ok(true) => {
                    if let Err(e) = self.orchestrator.remove_network(network).await {
                        warn!(network = %network, error = %e, "Failed to remove network");
                    }
                }
                Ok(false) => {}
                Err(e) => warn!(network = %network, error = %e, "Failed to inspect network"),
            }
        }

        info!(
            containers = removed.len(),
            networks = networks.len(),
            "Reconciled orphaned resources"
        );
        removed
    }

    /// Ensure every network exists, attaching the executor's own container to
    /// networks it creates.
    ///
    /// Returns the networks that are usable for runtimes.
    pub async fn bootstrap(&self, networks: &[String]) -> Vec<String> {
        let executor = self.executor_container().await;
        let mut usable = Vec::with_capacity(networks.len());

        for network in networks {
            match self.orchestrator.network_exists(network).await {
                Ok(true) => {
                    debug!(network = %network, "Network already exists");
                    usable.push(network.clone());
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(network = %network, error = %e, "Failed to inspect network");
                    continue;
                }
            }

            if let Err(e) = self.orchestrator.create_network(network).await {
                error!(network = %network, error = %e, "Failed to create network");
                continue;
            }
            info!(network = %network, "Created network");

            if let Some(container) = &executor
                && let Err(e) = self.orchestrator.network_connect(container, network).await
            {
                warn!(network = %network, container = %container, error = %e, "Failed to attach executor to network");
            }
            usable.push(network.clone());
        }

        usable
    }

    /// Pull every image concurrently. Returns the images that failed.
    pub async fn warmup(&self, images: &[String]) -> Vec<String> {
        if images.is_empty() {
            return Vec::new();
        }
        info!(images = images.len(), "Pulling runtime images");

        let pulls = images.iter().map(|image| async move {
            match self.orchestrator.pull(image).await {
                Ok(true) => {
                    debug!(image = %image, "Image pulled");
                    None
                }
                Ok(false) => {
                    warn!(image = %image, "Failed to pull image");
                    Some(image.clone())
                }
                Err(e) => {
                    warn!(image = %image, error = %e, "Failed to pull image");
                    Some(image.clone())
                }
            }
        });
        join_all(pulls).await.into_iter().flatten().collect()
    }

    async fn executor_container(&self) -> Option<String> {
        if self.executor_image.is_empty() {
            return None;
        }
        let filter = HashMap::from([(IMAGE_LABEL.to_string(), self.executor_image.clone())]);
        match self.orchestrator.list(&filter).await {
            Ok(containers) => containers.into_iter().next().map(|c| c.name),
            Err(e) => {
                warn!(error = %e, "Failed to find executor container");
                None
            }
        }
    }
}
