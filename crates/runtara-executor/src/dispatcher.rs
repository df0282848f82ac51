// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Execution dispatcher.
//!
//! Runs one execution through four phases that share a single
//! [`TimeoutBudget`]:
//!
//! 1. **Resolve** - build the runtime on demand through the loopback API
//! 2. **AwaitReady** - wait for the descriptor to leave `Pending`
//! 3. **AwaitListening** - wait for the runtime's port to accept connections
//! 4. **Proxy** - deliver the execution with the requested protocol
//!
//! Billable duration is measured from the end of phase 3. A failed execution
//! leaves the runtime running; idle eviction or an explicit delete reclaims it.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::budget::TimeoutBudget;
use crate::build::{CreateRuntimeRequest, default_cpus, default_memory, string_map};
use crate::client::{CreateAttempt, LoopbackClient};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::output::{MAX_OUTPUT_BYTES, truncate_head};
use crate::protocol::{ProtocolVersion, Protocols, ProxyError, ProxyRequest, ProxyResponse};
use crate::registry::{self, RuntimeRegistry};

/// Timeout of a single TCP readiness probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Header marking a base64-encoded execution body.
pub const ENCODING_HEADER: &str = "x-open-runtimes-encoding";

fn default_path() -> String {
    "/".to_string()
}

fn default_execution_timeout() -> u64 {
    15
}

/// HTTP methods an execution may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExecutionMethod {
    /// GET
    #[default]
    Get,
    /// POST
    Post,
    /// PUT
    Put,
    /// PATCH
    Patch,
    /// DELETE
    Delete,
    /// OPTIONS
    Options,
}

impl ExecutionMethod {
    /// Method name.
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionMethod::Get => "GET",
            ExecutionMethod::Post => "POST",
            ExecutionMethod::Put => "PUT",
            ExecutionMethod::Patch => "PATCH",
            ExecutionMethod::Delete => "DELETE",
            ExecutionMethod::Options => "OPTIONS",
        }
    }
}

/// Parameters of one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    /// Request body forwarded to the runtime
    #[serde(default)]
    pub body: Option<String>,
    /// Request path
    #[serde(default = "default_path")]
    pub path: String,
    /// Request method
    #[serde(default)]
    pub method: ExecutionMethod,
    /// Request headers
    #[serde(default, deserialize_with = "string_map")]
    pub headers: HashMap<String, String>,
    /// Total budget in seconds
    #[serde(default = "default_execution_timeout")]
    pub timeout: u64,
    /// On-demand build: base image
    #[serde(default)]
    pub image: String,
    /// On-demand build: source archive
    #[serde(default)]
    pub source: String,
    /// On-demand build: entrypoint
    #[serde(default)]
    pub entrypoint: String,
    /// Variables for the runtime
    #[serde(default, deserialize_with = "string_map")]
    pub variables: HashMap<String, String>,
    /// On-demand build: CPU share
    #[serde(default = "default_cpus")]
    pub cpus: f64,
    /// On-demand build: memory limit in megabytes
    #[serde(default = "default_memory")]
    pub memory: u64,
    /// Runtime protocol version
    #[serde(default)]
    pub version: ProtocolVersion,
    /// On-demand build: startup command override
    #[serde(default)]
    pub runtime_entrypoint: String,
}

impl Default for ExecutionRequest {
    fn default() -> Self {
        Self {
            body: None,
            path: default_path(),
            method: ExecutionMethod::default(),
            headers: HashMap::new(),
            timeout: default_execution_timeout(),
            image: String::new(),
            source: String::new(),
            entrypoint: String::new(),
            variables: HashMap::new(),
            cpus: default_cpus(),
            memory: default_memory(),
            version: ProtocolVersion::default(),
            runtime_entrypoint: String::new(),
        }
    }
}

impl ExecutionRequest {
    fn can_build(&self) -> bool {
        !self.image.is_empty() && !self.source.is_empty() && !self.entrypoint.is_empty()
    }
}

/// Result of a successful execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionOutcome {
    /// Status code returned by the runtime
    pub status_code: u16,
    /// Response headers
    pub headers: BTreeMap<String, String>,
    /// Response body; base64 when the runtime answered with non-text bytes
    pub body: String,
    /// Captured stdout
    pub logs: String,
    /// Captured stderr
    pub errors: String,
    /// Billable duration in seconds
    pub duration: f64,
    /// Billing start (unix seconds)
    pub start_time: f64,
}

impl ExecutionOutcome {
    /// Build an outcome, bounding logs and encoding binary bodies.
    pub fn from_response(response: ProxyResponse, duration: f64, start_time: f64) -> Self {
        let mut headers = response.headers;
        let body = match std::str::from_utf8(&response.body) {
            Ok(text) => text.to_string(),
            Err(_) => {
                headers.insert(ENCODING_HEADER.to_string(), "base64".to_string());
                BASE64.encode(&response.body)
            }
        };
        Self {
            status_code: response.status_code,
            headers,
            body,
            logs: truncate_head(&response.logs, MAX_OUTPUT_BYTES).to_string(),
            errors: truncate_head(&response.errors, MAX_OUTPUT_BYTES).to_string(),
            duration,
            start_time,
        }
    }
}

fn secret_missing() -> Error {
    Error::Internal("Runtime secret not found. Please re-create the runtime.".to_string())
}

/// Whether `addr` accepts a TCP connection within [`PROBE_TIMEOUT`].
pub async fn probe_listening(addr: &str) -> bool {
    matches!(
        tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

/// Dispatches executions to runtimes.
pub struct ExecutionDispatcher {
    config: Arc<Config>,
    registry: Arc<RuntimeRegistry>,
    loopback: LoopbackClient,
    protocols: Arc<Protocols>,
}

impl ExecutionDispatcher {
    /// Create a dispatcher.
    pub fn new(
        config: Arc<Config>,
        registry: Arc<RuntimeRegistry>,
        loopback: LoopbackClient,
        protocols: Arc<Protocols>,
    ) -> Self {
        Self {
            config,
            registry,
            loopback,
            protocols,
        }
    }

    /// Run one execution against runtime `runtime_id`.
    pub async fn execute(
        &self,
        runtime_id: &str,
        request: &ExecutionRequest,
    ) -> Result<ExecutionOutcome> {
        let name = self.config.runtime_name(runtime_id);
        let mut budget = TimeoutBudget::from_secs(request.timeout);

        let mut variables = request.variables.clone();
        variables.insert(
            "INERNAL_EXECUTOR_HOSTNAME".to_string(),
            self.config.hostname.clone(),
        );

        if !self.registry.exists(&name) {
            if !request.can_build() {
                return Err(Error::NotStarted);
            }
            self.build_on_demand(runtime_id, request, &variables, &mut budget)
                .await?;
        }
        self.registry.touch(&name);

        let descriptor = budget
            .poll("Function timed out during launch.", || async {
                match self.registry.get(&name) {
                    None => Err(secret_missing()),
                    Some(descriptor) if descriptor.status.is_pending() => Ok(None),
                    Some(descriptor) => Ok(Some(descriptor)),
                }
            })
            .await?;
        if descriptor.secret.is_empty() {
            return Err(secret_missing());
        }

        if !descriptor.listening {
            let addr = format!("{}:{}", descriptor.hostname, self.config.runtime_port);
            budget
                .poll("Function timed out during cold start.", || async {
                    Ok(probe_listening(&addr).await.then_some(()))
                })
                .await?;
            self.registry.update(&name, |d| d.listening = true);
            debug!(runtime_id = %name, "Runtime is listening");
        }

        let started = Instant::now();
        let start_time = registry::now();

        let body = request.body.clone().unwrap_or_default();
        let proxy = ProxyRequest {
            hostname: &descriptor.hostname,
            port: self.config.runtime_port,
            secret: &descriptor.secret,
            method: request.method.as_str(),
            path: &request.path,
            headers: &request.headers,
            body: &body,
            variables: &variables,
            remaining: budget.remaining(),
        };
        let response = self
            .protocols
            .for_version(request.version)
            .execute(&proxy)
            .await
            .map_err(|e| match e {
                ProxyError::TooLarge(_) => Error::InvalidResponse,
                ProxyError::Timeout(message) if request.version == ProtocolVersion::V2 => {
                    Error::Timeout(message)
                }
                other => Error::Internal(format!(
                    "Internal error has occurred within the executor! Error Msg: {other}"
                )),
            })?;

        let duration = started.elapsed().as_secs_f64();
        self.registry.touch(&name);

        info!(
            runtime_id = %name,
            status_code = response.status_code,
            duration_ms = (duration * 1000.0) as u64,
            "Execution finished"
        );

        Ok(ExecutionOutcome::from_response(
            response, duration, start_time,
        ))
    }

    async fn build_on_demand(
        &self,
        runtime_id: &str,
        request: &ExecutionRequest,
        variables: &HashMap<String, String>,
        budget: &mut TimeoutBudget,
    ) -> Result<()> {
        let create = CreateRuntimeRequest {
            entrypoint: request.entrypoint.clone(),
            source: request.source.clone(),
            variables: variables.clone(),
            runtime_entrypoint: request.runtime_entrypoint.clone(),
            cpus: request.cpus,
            memory: request.memory,
            version: request.version,
            ..CreateRuntimeRequest::new(runtime_id, request.image.clone())
        };

        info!(runtime_id = %runtime_id, "Building runtime on demand");
        budget
            .poll("Function timed out during preparation.", || async {
                match self.loopback.create_runtime(&create).await {
                    // Conflict means a concurrent request owns the build; readiness is awaited next
                    CreateAttempt::Created | CreateAttempt::Conflict => Ok(Some(())),
                    CreateAttempt::Retry(reason) => {
                        debug!(runtime_id = %runtime_id, reason = %reason, "Retrying runtime creation");
                        Ok(None)
                    }
                    CreateAttempt::Fatal(reason) => Err(Error::Internal(format!(
                        "An internal error has occurred while starting runtime! Error Msg: {reason}"
                    ))),
                }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_request_defaults() {
        let request: ExecutionRequest = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(request.path, "/");
        assert_eq!(request.method, ExecutionMethod::Get);
        assert_eq!(request.timeout, 15);
        assert!(request.body.is_none());
        assert!(!request.can_build());

        let request: ExecutionRequest =
            serde_json::from_value(serde_json::json!({"body": null, "method": "POST"})).unwrap();
        assert_eq!(request.method, ExecutionMethod::Post);
        assert!(
            serde_json::from_value::<ExecutionRequest>(serde_json::json!({"method": "TRACE"}))
                .is_err()
        );
    }

    #[test]
    fn test_outcome_text_body() {
        let response = ProxyResponse {
            status_code: 200,
            body: Bytes::from_static(b"hello"),
            logs: "log".into(),
            ..Default::default()
        };
        let outcome = ExecutionOutcome::from_response(response, 0.5, 1.0);
        assert_eq!(outcome.body, "hello");
        assert!(!outcome.headers.contains_key(ENCODING_HEADER));
        assert_eq!(outcome.logs, "log");
    }

    #[test]
    fn test_outcome_binary_body_is_base64() {
        let bytes = vec![0xff, 0xfe, 0x00, 0x01];
        let response = ProxyResponse {
            status_code: 200,
            body: Bytes::from(bytes.clone()),
            ..Default::default()
        };
        let outcome = ExecutionOutcome::from_response(response, 0.0, 0.0);
        assert_eq!(outcome.headers[ENCODING_HEADER], "base64");
        assert_eq!(BASE64.decode(&outcome.body).unwrap(), bytes);

        let json = serde_json::to_string(&outcome).unwrap();
        let back: ExecutionOutcome = serde_json::from_str(&json).unwrap();
        assert_eq!(back, outcome);
    }

    #[test]
    fn test_outcome_bounds_logs() {
        let response = ProxyResponse {
            status_code: 200,
            logs: "x".repeat(MAX_OUTPUT_BYTES + 10),
            ..Default::default()
        };
        let outcome = ExecutionOutcome::from_response(response, 0.0, 0.0);
        assert_eq!(outcome.logs.len(), MAX_OUTPUT_BYTES);
    }

    #[tokio::test]
    async fn test_probe_listening() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        assert!(probe_listening(&addr).await);
        drop(listener);
        assert!(!probe_listening(&addr).await);
    }
}
