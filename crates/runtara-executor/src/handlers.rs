// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP handlers for the executor API.
//!
//! Handlers stay thin: they validate input, delegate to the build pipeline,
//! the dispatcher or the registry, and shape the response.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::budget::POLL_INTERVAL;
use crate::build::{BUILD_LOG_PATH, BuildOutcome, BuildPipeline, CreateRuntimeRequest};
use crate::client::LoopbackClient;
use crate::config::Config;
use crate::dispatcher::{ExecutionDispatcher, ExecutionOutcome, ExecutionRequest};
use crate::error::{ApiError, Error, Result};
use crate::orchestrator::Orchestrator;
use crate::protocol::Protocols;
use crate::registry::{RuntimeDescriptor, RuntimeRegistry};
use crate::usage::UsageStore;

/// Probes for the container before a log stream gives up.
const LOG_WAIT_ATTEMPTS: usize = 10;

/// Interval at which buffered log output is flushed to the client.
const LOG_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Shared state for HTTP handlers.
pub struct AppState {
    /// Executor configuration
    pub config: Arc<Config>,
    /// Runtime registry
    pub registry: Arc<RuntimeRegistry>,
    /// Smoothed usage samples
    pub usage: Arc<UsageStore>,
    /// Container engine
    pub orchestrator: Arc<dyn Orchestrator>,
    /// Runtime builds
    pub pipeline: Arc<BuildPipeline>,
    /// Executions
    pub dispatcher: Arc<ExecutionDispatcher>,
}

impl AppState {
    /// Assemble handler state.
    ///
    /// `pipeline` must share `registry`. `local_addr` is the address the API
    /// is served on; on-demand builds call back into it.
    pub fn new(
        config: Arc<Config>,
        registry: Arc<RuntimeRegistry>,
        orchestrator: Arc<dyn Orchestrator>,
        pipeline: BuildPipeline,
        local_addr: SocketAddr,
    ) -> Result<Self> {
        let loopback = LoopbackClient::new(local_addr, config.secret.clone())
            .map_err(|e| Error::Internal(format!("Failed to create loopback client: {e}")))?;
        let protocols = Protocols::new()
            .map_err(|e| Error::Internal(format!("Failed to create runtime client: {e}")))?;
        let dispatcher =
            ExecutionDispatcher::new(config.clone(), registry.clone(), loopback, Arc::new(protocols));

        Ok(Self {
            config,
            registry,
            usage: Arc::new(UsageStore::new()),
            orchestrator,
            pipeline: Arc::new(pipeline),
            dispatcher: Arc::new(dispatcher),
        })
    }
}

fn json_body<T>(payload: std::result::Result<Json<T>, JsonRejection>) -> Result<T> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| Error::InvalidRequest(rejection.body_text()))
}

fn check_length(field: &str, value: &str, max: usize) -> Result<()> {
    let len = value.chars().count();
    if len == 0 || len > max {
        return Err(Error::InvalidRequest(format!(
            "{field} must be between 1 and {max} characters"
        )));
    }
    Ok(())
}

/// `POST /v1/runtimes`
pub async fn create_runtime(
    State(state): State<Arc<AppState>>,
    payload: std::result::Result<Json<CreateRuntimeRequest>, JsonRejection>,
) -> std::result::Result<(StatusCode, Json<BuildOutcome>), ApiError> {
    let request = json_body(payload)?;
    check_length("runtimeId", &request.runtime_id, 64)?;
    check_length("image", &request.image, 128)?;

    let outcome = state.pipeline.create_detached(request).await?;
    Ok((StatusCode::CREATED, Json(outcome)))
}

/// `GET /v1/runtimes`
pub async fn list_runtimes(State(state): State<Arc<AppState>>) -> Json<Vec<RuntimeDescriptor>> {
    Json(state.registry.snapshot())
}

/// `GET /v1/runtimes/{runtime_id}`
pub async fn get_runtime(
    State(state): State<Arc<AppState>>,
    Path(runtime_id): Path<String>,
) -> std::result::Result<Json<RuntimeDescriptor>, ApiError> {
    let name = state.config.runtime_name(&runtime_id);
    let descriptor = state
        .registry
        .get(&name)
        .ok_or_else(Error::runtime_not_found)?;
    Ok(Json(descriptor))
}

/// `DELETE /v1/runtimes/{runtime_id}`
pub async fn delete_runtime(
    State(state): State<Arc<AppState>>,
    Path(runtime_id): Path<String>,
) -> std::result::Result<StatusCode, ApiError> {
    let name = state.config.runtime_name(&runtime_id);
    if !state.registry.exists(&name) {
        return Err(Error::runtime_not_found().into());
    }

    if let Err(e) = state.orchestrator.remove(&name, true).await {
        warn!(runtime_id = %name, error = %e, "Failed to remove runtime container");
    }
    state.registry.delete(&name);
    info!(runtime_id = %name, "Runtime deleted");

    Ok(StatusCode::OK)
}

/// `POST /v1/runtimes/{runtime_id}/executions`
pub async fn create_execution(
    State(state): State<Arc<AppState>>,
    Path(runtime_id): Path<String>,
    payload: std::result::Result<Json<ExecutionRequest>, JsonRejection>,
) -> std::result::Result<Json<ExecutionOutcome>, ApiError> {
    let request = json_body(payload)?;
    let outcome = state.dispatcher.execute(&runtime_id, &request).await?;
    Ok(Json(outcome))
}

/// Query parameters of the log stream.
#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    /// Seconds to follow the log file
    #[serde(default = "default_logs_timeout")]
    pub timeout: String,
}

fn default_logs_timeout() -> String {
    "600".to_string()
}

/// `GET /v1/runtimes/{runtime_id}/logs`
///
/// Streams the runtime's build log as `text/event-stream`. Output is
/// buffered and flushed once per [`LOG_FLUSH_INTERVAL`]; closing the
/// connection stops following.
pub async fn runtime_logs(
    State(state): State<Arc<AppState>>,
    Path(runtime_id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> std::result::Result<Response, ApiError> {
    let name = state.config.runtime_name(&runtime_id);
    let timeout = Duration::from_secs(query.timeout.trim().parse().unwrap_or(0));

    let mut found = false;
    for attempt in 0..LOG_WAIT_ATTEMPTS {
        if state
            .orchestrator
            .container_exists(&name)
            .await
            .map_err(Error::from)?
        {
            found = true;
            break;
        }
        if attempt + 1 < LOG_WAIT_ATTEMPTS {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
    if !found {
        return Err(Error::Internal("Runtime not ready. Container not found.".to_string()).into());
    }

    let mut chunks = state
        .orchestrator
        .follow_file(&name, BUILD_LOG_PATH, timeout)
        .await
        .map_err(Error::from)?;
    debug!(runtime_id = %name, timeout_secs = timeout.as_secs(), "Streaming runtime logs");

    let stream = async_stream::stream! {
        let mut ticker = tokio::time::interval(LOG_FLUSH_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut pending = BytesMut::new();

        loop {
            let flush = tokio::select! {
                chunk = chunks.recv() => match chunk {
                    Some(chunk) => {
                        pending.extend_from_slice(&chunk);
                        false
                    }
                    None => break,
                },
                _ = ticker.tick() => true,
            };
            if flush && !pending.is_empty() {
                yield Ok::<Bytes, std::io::Error>(pending.split().freeze());
            }
        }

        if !pending.is_empty() {
            yield Ok(pending.freeze());
        }
    };

    Ok((
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(stream),
    )
        .into_response())
}

/// Health of one runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeHealth {
    /// Always `pass`
    pub status: String,
    /// Smoothed CPU usage
    pub usage: Option<f64>,
}

/// Response of `GET /v1/health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Always `pass`
    pub status: String,
    /// Smoothed host CPU usage
    pub usage: Option<f64>,
    /// Per-runtime usage keyed by container name
    pub runtimes: BTreeMap<String, RuntimeHealth>,
}

/// `GET /v1/health`
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let runtimes = state
        .usage
        .runtimes()
        .into_iter()
        .map(|(name, usage)| {
            (
                name,
                RuntimeHealth {
                    status: "pass".to_string(),
                    usage: Some(usage),
                },
            )
        })
        .collect();

    Json(HealthResponse {
        status: "pass".to_string(),
        usage: state.usage.host(),
        runtimes,
    })
}

/// Fallback for unknown routes.
pub async fn not_found() -> ApiError {
    Error::RouteNotFound.into()
}
