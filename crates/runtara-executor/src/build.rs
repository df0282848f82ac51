// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Build pipeline.
//!
//! Turns a source archive into a running runtime container and, when a
//! destination is given, a persisted build artifact.
//!
//! ```text
//! claim (Pending) ─► stage source ─► run container ─► build command ─► persist artifact ─► Ready
//!        │                 └───────────────┴───────────────┴──────────────────┘
//!        │                               any failure
//!        ▼                                    ▼
//!    409 Conflict          extract logs, delete scratch, remove container, delete descriptor
//! ```
//!
//! Every runtime gets a scratch directory `{scratch_root}/{runtime name}/` with
//! `src/` (mounted at `/tmp`) and `builds/` (mounted at the protocol's code
//! path).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::orchestrator::{ContainerSpec, Mount, Orchestrator};
use crate::output::{MAX_OUTPUT_BYTES, truncate_head, truncate_tail};
use crate::protocol::ProtocolVersion;
use crate::registry::{self, RuntimeDescriptor, RuntimeRegistry, RuntimeStatus};
use crate::storage::{LocalDevice, StorageDevice};

/// File inside the container that build output is teed into.
pub const BUILD_LOG_PATH: &str = "/var/tmp/logs.txt";

/// Delay before an auto-removed runtime is torn down.
pub const DEFAULT_REMOVE_GRACE: Duration = Duration::from_secs(2);

/// Timeout for extracting logs from a failed build.
const LOG_EXTRACTION_TIMEOUT: Duration = Duration::from_secs(15);

/// Container label naming the executor that owns a runtime.
pub const EXECUTOR_LABEL: &str = "openruntimes-executor";

/// Container label carrying the caller's runtime identifier.
pub const RUNTIME_ID_LABEL: &str = "openruntimes-runtime-id";

fn default_build_timeout() -> u64 {
    600
}

pub(crate) fn default_cpus() -> f64 {
    1.0
}

pub(crate) fn default_memory() -> u64 {
    512
}

/// Deserialize a JSON object into string values, stringifying scalars.
pub(crate) fn string_map<'de, D>(deserializer: D) -> std::result::Result<HashMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<HashMap<String, Value>>::deserialize(deserializer)?.unwrap_or_default();
    Ok(raw
        .into_iter()
        .map(|(key, value)| {
            let value = match value {
                Value::String(s) => s,
                Value::Null => String::new(),
                other => other.to_string(),
            };
            (key, value)
        })
        .collect())
}

/// Parameters of a runtime build.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRuntimeRequest {
    /// Caller-supplied runtime identifier
    pub runtime_id: String,
    /// Base image
    pub image: String,
    /// Entrypoint file of the user code
    #[serde(default)]
    pub entrypoint: String,
    /// Source archive path on the configured storage device
    #[serde(default)]
    pub source: String,
    /// Directory the build artifact is copied to
    #[serde(default)]
    pub destination: String,
    /// Environment variables for the container
    #[serde(default, deserialize_with = "string_map")]
    pub variables: HashMap<String, String>,
    /// Command replacing the idle command
    #[serde(default)]
    pub runtime_entrypoint: String,
    /// Build command run inside the container
    #[serde(default)]
    pub command: String,
    /// Build command timeout in seconds
    #[serde(default = "default_build_timeout")]
    pub timeout: u64,
    /// Tear the runtime down after the build
    #[serde(default)]
    pub remove: bool,
    /// CPU share
    #[serde(default = "default_cpus")]
    pub cpus: f64,
    /// Memory limit in megabytes
    #[serde(default = "default_memory")]
    pub memory: u64,
    /// Runtime protocol version
    #[serde(default)]
    pub version: ProtocolVersion,
}

impl CreateRuntimeRequest {
    /// Request with defaults for everything but identifier and image.
    pub fn new(runtime_id: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            runtime_id: runtime_id.into(),
            image: image.into(),
            entrypoint: String::new(),
            source: String::new(),
            destination: String::new(),
            variables: HashMap::new(),
            runtime_entrypoint: String::new(),
            command: String::new(),
            timeout: default_build_timeout(),
            remove: false,
            cpus: default_cpus(),
            memory: default_memory(),
            version: ProtocolVersion::default(),
        }
    }
}

/// Result of a successful build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildOutcome {
    /// Captured build output
    pub output: String,
    /// Build start (unix seconds)
    pub start_time: f64,
    /// Build duration in seconds
    pub duration: f64,
    /// Path of the persisted artifact
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Size of the persisted artifact in bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// Per-runtime scratch directory layout.
#[derive(Debug, Clone)]
pub struct ScratchDir {
    /// `{scratch_root}/{runtime name}`
    pub root: String,
    /// Mounted at `/tmp`
    pub src_dir: String,
    /// Mounted at the protocol's code path
    pub build_dir: String,
    /// Staged source archive
    pub source_file: String,
    /// Expected build artifact
    pub build_file: String,
}

impl ScratchDir {
    /// Layout for runtime `name` under `scratch_root`.
    pub fn new(scratch_root: &std::path::Path, name: &str) -> Self {
        let root = scratch_root.join(name).to_string_lossy().into_owned();
        let src_dir = format!("{root}/src");
        let build_dir = format!("{root}/builds");
        Self {
            source_file: format!("{src_dir}/code.tar.gz"),
            build_file: format!("{build_dir}/code.tar.gz"),
            root,
            src_dir,
            build_dir,
        }
    }
}

fn build_failed(message: impl Into<String>, code: u16) -> Error {
    Error::BuildFailed {
        message: message.into(),
        code,
    }
}

/// Creates runtimes.
pub struct BuildPipeline {
    config: Arc<Config>,
    registry: Arc<RuntimeRegistry>,
    orchestrator: Arc<dyn Orchestrator>,
    networks: Vec<String>,
    remove_grace: Duration,
}

impl BuildPipeline {
    /// Create a pipeline placing runtimes on `networks`.
    pub fn new(
        config: Arc<Config>,
        registry: Arc<RuntimeRegistry>,
        orchestrator: Arc<dyn Orchestrator>,
        networks: Vec<String>,
    ) -> Self {
        Self {
            config,
            registry,
            orchestrator,
            networks,
            remove_grace: DEFAULT_REMOVE_GRACE,
        }
    }

    /// Set the delay before auto-removal.
    pub fn with_remove_grace(mut self, grace: Duration) -> Self {
        self.remove_grace = grace;
        self
    }

    /// Build a runtime on its own task.
    ///
    /// The build and its compensation run to completion even if the caller
    /// stops waiting, so a dropped request never leaves a `Pending` claim
    /// behind.
    pub async fn create_detached(
        self: &Arc<Self>,
        request: CreateRuntimeRequest,
    ) -> Result<BuildOutcome> {
        let pipeline = Arc::clone(self);
        tokio::spawn(async move { pipeline.create(&request).await })
            .await
            .map_err(|e| Error::Internal(format!("Runtime build task failed: {e}")))?
    }

    /// Build a runtime.
    ///
    /// Fails with [`Error::Conflict`] if the runtime exists or is being
    /// created. Any later failure is compensated before it is returned.
    pub async fn create(&self, request: &CreateRuntimeRequest) -> Result<BuildOutcome> {
        let name = self.config.runtime_name(&request.runtime_id);
        let hostname = uuid::Uuid::new_v4().simple().to_string();
        let secret = hex::encode(rand::random::<[u8; 16]>());

        self.registry
            .try_claim(RuntimeDescriptor::pending(&name, &hostname, &secret))?;

        let started = Instant::now();
        let start_time = registry::now();
        let scratch = ScratchDir::new(&self.config.scratch_root, &name);
        let local = LocalDevice::new(self.config.scratch_root.to_string_lossy());

        info!(runtime_id = %name, image = %request.image, version = ?request.version, "Creating runtime");

        let mut output = String::new();
        let artifact = match self
            .provision(request, &name, &hostname, &secret, &scratch, &local, &mut output)
            .await
        {
            Ok(artifact) => artifact,
            Err(e) => {
                return Err(self
                    .compensate(e, &name, &scratch, &local, &output, request.remove)
                    .await);
            }
        };

        if output.is_empty() {
            output = "Runtime created successfully!".to_string();
        }
        let duration = started.elapsed();
        self.registry.update(&name, |descriptor| {
            descriptor.status = RuntimeStatus::ready_after(duration);
            descriptor.touch();
        });

        info!(runtime_id = %name, duration_ms = duration.as_millis() as u64, "Runtime created");

        let (path, size) = artifact.unzip();
        let outcome = BuildOutcome {
            output: truncate_head(&output, MAX_OUTPUT_BYTES).to_string(),
            start_time,
            duration: duration.as_secs_f64(),
            path,
            size,
        };

        if request.remove {
            tokio::time::sleep(self.remove_grace).await;
            self.teardown(&name, &scratch, &local).await;
        }

        Ok(outcome)
    }

    #[allow(clippy::too_many_arguments)]
    async fn provision(
        &self,
        request: &CreateRuntimeRequest,
        name: &str,
        hostname: &str,
        secret: &str,
        scratch: &ScratchDir,
        local: &LocalDevice,
        output: &mut String,
    ) -> Result<Option<(String, u64)>> {
        if !request.source.is_empty() {
            let source_device = self.config.storage.device("/");
            if let Err(e) = source_device
                .transfer(&request.source, &scratch.source_file, local)
                .await
            {
                warn!(runtime_id = %name, source = %request.source, error = %e, "Failed to stage source");
                return Err(build_failed(
                    "Failed to copy source code to temporary directory",
                    500,
                ));
            }
        }

        for dir in [&scratch.src_dir, &scratch.build_dir] {
            if let Err(e) = local.create_directory(dir).await {
                warn!(runtime_id = %name, dir = %dir, error = %e, "Failed to create scratch directory");
                return Err(build_failed("Failed to create temporary directory", 500));
            }
        }

        let mut vars = request.variables.clone();
        vars.extend(
            request
                .version
                .runtime_vars(secret, &request.entrypoint, &self.config.hostname)
                .into_iter()
                .map(|(k, v)| (k.to_string(), v)),
        );

        let network = self
            .networks
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or_else(|| build_failed("No runtime network is available", 500))?;

        let version = request.version;
        let spec = ContainerSpec {
            image: request.image.clone(),
            name: name.to_string(),
            hostname: hostname.to_string(),
            vars,
            command: version.startup_command(&request.runtime_entrypoint, !request.command.is_empty()),
            labels: HashMap::from([
                (EXECUTOR_LABEL.to_string(), self.config.hostname.clone()),
                (RUNTIME_ID_LABEL.to_string(), request.runtime_id.clone()),
            ]),
            mounts: vec![
                Mount {
                    host: PathBuf::from(&scratch.src_dir),
                    container: "/tmp".to_string(),
                },
                Mount {
                    host: PathBuf::from(&scratch.build_dir),
                    container: version.code_mount_path().to_string(),
                },
            ],
            network,
            workdir: version.workdir().map(str::to_string),
            cpus: request.cpus,
            memory_mb: request.memory,
        };

        let container_id = self.orchestrator.run(&spec).await?;
        if container_id.is_empty() {
            return Err(build_failed("Failed to create runtime", 500));
        }
        debug!(runtime_id = %name, container_id = %container_id, "Container started");

        if !request.command.is_empty() {
            let command = vec![
                "sh".to_string(),
                "-c".to_string(),
                format!(
                    "touch {BUILD_LOG_PATH} && ({}) >> {BUILD_LOG_PATH} 2>&1 && cat {BUILD_LOG_PATH}",
                    request.command
                ),
            ];
            match self
                .orchestrator
                .execute(name, &command, Duration::from_secs(request.timeout))
                .await
            {
                Ok(exec) => {
                    *output = exec.output;
                    if !exec.success {
                        // The captured output is appended once, bounded, on compensation
                        return Err(build_failed("Failed to create runtime: ", 400));
                    }
                }
                Err(e) => return Err(build_failed(e.to_string(), 400)),
            }
        }

        if request.destination.is_empty() {
            return Ok(None);
        }

        if !local.exists(&scratch.build_file).await.unwrap_or(false) {
            return Err(build_failed(
                "Something went wrong when starting runtime.",
                500,
            ));
        }
        let size = local.file_size(&scratch.build_file).await?;

        let destination = self.config.storage.device(&request.destination);
        let path = destination.get_path(&format!("{}.gz", uuid::Uuid::new_v4().simple()));
        if let Err(e) = local
            .transfer(&scratch.build_file, &path, destination.as_ref())
            .await
        {
            warn!(runtime_id = %name, path = %path, error = %e, "Failed to persist build artifact");
            return Err(build_failed("Failed to move built code to storage", 500));
        }

        Ok(Some((path, size)))
    }

    async fn compensate(
        &self,
        error: Error,
        name: &str,
        scratch: &ScratchDir,
        local: &LocalDevice,
        output: &str,
        remove: bool,
    ) -> Error {
        let code = error.code();
        let message = error.to_string();
        warn!(runtime_id = %name, error = %message, code, "Runtime build failed");

        let mut captured = output.to_string();
        let extract = vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("cat {BUILD_LOG_PATH}"),
        ];
        if let Ok(logs) = self
            .orchestrator
            .execute(name, &extract, LOG_EXTRACTION_TIMEOUT)
            .await
            && !logs.output.is_empty()
        {
            captured = logs.output;
        }

        if remove {
            tokio::time::sleep(self.remove_grace).await;
        }
        self.teardown(name, scratch, local).await;

        build_failed(
            format!("{message}{}", truncate_tail(&captured, MAX_OUTPUT_BYTES)),
            code,
        )
    }

    async fn teardown(&self, name: &str, scratch: &ScratchDir, local: &LocalDevice) {
        if let Err(e) = local.delete_path(&scratch.root).await {
            warn!(runtime_id = %name, error = %e, "Failed to delete scratch directory");
        }
        if let Err(e) = self.orchestrator.remove(name, true).await {
            debug!(runtime_id = %name, error = %e, "Container removal skipped");
        }
        self.registry.delete(name);
    }
}
