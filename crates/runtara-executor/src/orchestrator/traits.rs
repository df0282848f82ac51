// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Orchestrator trait definitions.
//!
//! Defines the abstract interface to the container engine.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors from orchestrator operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum OrchestratorError {
    /// Container or network does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Engine command exited with a failure status.
    #[error("{command} failed: {stderr}")]
    CommandFailed {
        /// Engine sub-command that failed.
        command: String,
        /// Standard error output.
        stderr: String,
    },

    /// Operation exceeded its timeout.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for orchestrator operations.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// A container as reported by [`Orchestrator::list`].
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSummary {
    /// Engine container ID
    pub id: String,
    /// Container name
    pub name: String,
    /// Engine status string
    pub status: String,
    /// Container labels
    pub labels: HashMap<String, String>,
}

/// Read-write bind mount.
#[derive(Debug, Clone, PartialEq)]
pub struct Mount {
    /// Path on the host
    pub host: PathBuf,
    /// Path inside the container
    pub container: String,
}

/// Everything needed to create and start a container.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    /// Image reference
    pub image: String,
    /// Container name
    pub name: String,
    /// Hostname inside the network
    pub hostname: String,
    /// Environment variables
    pub vars: HashMap<String, String>,
    /// Command run after start; empty keeps the image default
    pub command: Vec<String>,
    /// Container labels
    pub labels: HashMap<String, String>,
    /// Bind mounts
    pub mounts: Vec<Mount>,
    /// Network to attach to
    pub network: String,
    /// Working directory
    pub workdir: Option<String>,
    /// CPU share
    pub cpus: f64,
    /// Memory limit in megabytes
    pub memory_mb: u64,
}

/// Result of a command executed inside a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    /// Whether the command exited with status zero.
    pub success: bool,
    /// Combined stdout and stderr.
    pub output: String,
}

/// Resource usage reported by the engine.
#[derive(Debug, Clone, Default)]
pub struct UsageReport {
    /// Host CPU usage in percent, if known
    pub host: Option<f64>,
    /// CPU usage in percent per container name
    pub containers: HashMap<String, f64>,
}

/// Trait for container engines.
///
/// Implementations must be safe for concurrent use; callers add no locking.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Orchestrator type identifier (e.g., "docker", "mock")
    fn orchestrator_type(&self) -> &'static str;

    /// List containers whose labels contain every pair in `labels`.
    async fn list(&self, labels: &HashMap<String, String>) -> Result<Vec<ContainerSummary>>;

    /// Whether a container named `name` exists.
    async fn container_exists(&self, name: &str) -> Result<bool>;

    /// Create and start a container. Returns the container ID.
    async fn run(&self, spec: &ContainerSpec) -> Result<String>;

    /// Execute `command` inside container `name`.
    ///
    /// A non-zero exit is reported through [`ExecOutput::success`]; exceeding
    /// `timeout` is [`OrchestratorError::Timeout`].
    async fn execute(&self, name: &str, command: &[String], timeout: Duration)
    -> Result<ExecOutput>;

    /// Remove container `name`.
    async fn remove(&self, name: &str, force: bool) -> Result<()>;

    /// Pull an image. Returns whether the pull succeeded.
    async fn pull(&self, image: &str) -> Result<bool>;

    /// Whether network `name` exists.
    async fn network_exists(&self, name: &str) -> Result<bool>;

    /// Create network `name`.
    async fn create_network(&self, name: &str) -> Result<()>;

    /// Remove network `name`.
    async fn remove_network(&self, name: &str) -> Result<()>;

    /// Attach container `container` to network `network`.
    async fn network_connect(&self, container: &str, network: &str) -> Result<()>;

    /// Current host and per-container usage.
    async fn usage(&self) -> Result<UsageReport>;

    /// Follow file `path` inside container `name` for up to `duration`.
    ///
    /// Chunks arrive on the returned channel as they are read. Dropping the
    /// receiver stops following.
    async fn follow_file(
        &self,
        name: &str,
        path: &str,
        duration: Duration,
    ) -> Result<mpsc::Receiver<Bytes>>;
}
