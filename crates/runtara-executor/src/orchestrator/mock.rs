// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock orchestrator for testing.
//!
//! Keeps containers and networks in memory. Commands executed inside a
//! container are answered by a scriptable handler that can see the
//! container's spec, including its host-side mounts.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Mutex, mpsc};

use super::traits::*;

/// Handler answering [`Orchestrator::execute`] calls.
pub type ExecHandler = Arc<dyn Fn(&ContainerSpec, &[String]) -> ExecOutput + Send + Sync>;

/// Mock orchestrator for testing.
pub struct MockOrchestrator {
    containers: Arc<Mutex<HashMap<String, ContainerSpec>>>,
    networks: Arc<Mutex<HashSet<String>>>,
    pulled: Arc<Mutex<Vec<String>>>,
    connected: Arc<Mutex<Vec<(String, String)>>>,
    usage: Arc<Mutex<UsageReport>>,
    exec_handler: ExecHandler,
    run_count: AtomicUsize,
    remove_count: AtomicUsize,
    /// Optional delay before `run` returns
    pub run_delay: Duration,
    /// If true, `run` fails
    pub fail_run: bool,
    /// Chunks delivered by `follow_file`
    pub log_chunks: Vec<Bytes>,
}

impl Default for MockOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl MockOrchestrator {
    /// Create a mock where every exec succeeds with empty output.
    pub fn new() -> Self {
        Self::with_exec(Arc::new(|_, _| ExecOutput {
            success: true,
            output: String::new(),
        }))
    }

    /// Create a mock with a custom exec handler.
    pub fn with_exec(exec_handler: ExecHandler) -> Self {
        Self {
            containers: Arc::new(Mutex::new(HashMap::new())),
            networks: Arc::new(Mutex::new(HashSet::new())),
            pulled: Arc::new(Mutex::new(Vec::new())),
            connected: Arc::new(Mutex::new(Vec::new())),
            usage: Arc::new(Mutex::new(UsageReport::default())),
            exec_handler,
            run_count: AtomicUsize::new(0),
            remove_count: AtomicUsize::new(0),
            run_delay: Duration::ZERO,
            fail_run: false,
            log_chunks: Vec::new(),
        }
    }

    /// Number of `run` calls so far.
    pub fn run_count(&self) -> usize {
        self.run_count.load(Ordering::SeqCst)
    }

    /// Number of successful `remove` calls so far.
    pub fn remove_count(&self) -> usize {
        self.remove_count.load(Ordering::SeqCst)
    }

    /// Spec of container `name`, if it exists.
    pub async fn container(&self, name: &str) -> Option<ContainerSpec> {
        self.containers.lock().await.get(name).cloned()
    }

    /// Names of all containers.
    pub async fn container_names(&self) -> Vec<String> {
        self.containers.lock().await.keys().cloned().collect()
    }

    /// Insert a container directly, bypassing `run`.
    pub async fn insert_container(&self, spec: ContainerSpec) {
        self.containers.lock().await.insert(spec.name.clone(), spec);
    }

    /// Insert a network directly.
    pub async fn insert_network(&self, name: &str) {
        self.networks.lock().await.insert(name.to_string());
    }

    /// Names of all networks.
    pub async fn network_names(&self) -> HashSet<String> {
        self.networks.lock().await.clone()
    }

    /// Images pulled so far.
    pub async fn pulled(&self) -> Vec<String> {
        self.pulled.lock().await.clone()
    }

    /// `(container, network)` pairs connected so far.
    pub async fn connected(&self) -> Vec<(String, String)> {
        self.connected.lock().await.clone()
    }

    /// Set the report returned by `usage`.
    pub async fn set_usage(&self, report: UsageReport) {
        *self.usage.lock().await = report;
    }
}

#[async_trait]
impl Orchestrator for MockOrchestrator {
    fn orchestrator_type(&self) -> &'static str {
        "mock"
    }

    async fn list(&self, labels: &HashMap<String, String>) -> Result<Vec<ContainerSummary>> {
        let containers = self.containers.lock().await;
        Ok(containers
            .values()
            .filter(|spec| labels.iter().all(|(k, v)| spec.labels.get(k) == Some(v)))
            .map(|spec| ContainerSummary {
                id: format!("id-{}", spec.name),
                name: spec.name.clone(),
                status: "Up".to_string(),
                labels: spec.labels.clone(),
            })
            .collect())
    }

    async fn container_exists(&self, name: &str) -> Result<bool> {
        Ok(self.containers.lock().await.contains_key(name))
    }

    async fn run(&self, spec: &ContainerSpec) -> Result<String> {
        self.run_count.fetch_add(1, Ordering::SeqCst);
        if !self.run_delay.is_zero() {
            tokio::time::sleep(self.run_delay).await;
        }
        if self.fail_run {
            return Err(OrchestratorError::CommandFailed {
                command: "run".to_string(),
                stderr: "mock failure".to_string(),
            });
        }
        self.containers
            .lock()
            .await
            .insert(spec.name.clone(), spec.clone());
        Ok(format!("id-{}", spec.name))
    }

    async fn execute(
        &self,
        name: &str,
        command: &[String],
        _timeout: Duration,
    ) -> Result<ExecOutput> {
        let spec = self
            .containers
            .lock()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| OrchestratorError::NotFound(name.to_string()))?;
        Ok((self.exec_handler)(&spec, command))
    }

    async fn remove(&self, name: &str, _force: bool) -> Result<()> {
        match self.containers.lock().await.remove(name) {
            Some(_) => {
                self.remove_count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            None => Err(OrchestratorError::NotFound(name.to_string())),
        }
    }

    async fn pull(&self, image: &str) -> Result<bool> {
        self.pulled.lock().await.push(image.to_string());
        Ok(true)
    }

    async fn network_exists(&self, name: &str) -> Result<bool> {
        Ok(self.networks.lock().await.contains(name))
    }

    async fn create_network(&self, name: &str) -> Result<()> {
        self.networks.lock().await.insert(name.to_string());
        Ok(())
    }

    async fn remove_network(&self, name: &str) -> Result<()> {
        if self.networks.lock().await.remove(name) {
            Ok(())
        } else {
            Err(OrchestratorError::NotFound(name.to_string()))
        }
    }

    async fn network_connect(&self, container: &str, network: &str) -> Result<()> {
        self.connected
            .lock()
            .await
            .push((container.to_string(), network.to_string()));
        Ok(())
    }

    async fn usage(&self) -> Result<UsageReport> {
        Ok(self.usage.lock().await.clone())
    }

    async fn follow_file(
        &self,
        name: &str,
        _path: &str,
        _duration: Duration,
    ) -> Result<mpsc::Receiver<Bytes>> {
        if !self.containers.lock().await.contains_key(name) {
            return Err(OrchestratorError::NotFound(name.to_string()));
        }
        let (tx, rx) = mpsc::channel(self.log_chunks.len().max(1));
        for chunk in &self.log_chunks {
            let _ = tx.try_send(chunk.clone());
        }
        Ok(rx)
    }
}
