// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for runtara-executor integration tests.
//!
//! Provides a fake runtime listener, scripted mock orchestrators and a
//! [`TestExecutor`] that runs the full executor against them.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::body::Bytes;
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};
use tempfile::TempDir;

use runtara_executor::build::BUILD_LOG_PATH;
use runtara_executor::config::Config;
use runtara_executor::orchestrator::{ContainerSpec, ExecOutput, MockOrchestrator};
use runtara_executor::registry::{RuntimeDescriptor, RuntimeRegistry, RuntimeStatus};
use runtara_executor::runtime::ExecutorRuntime;

/// Shared secret of the executor API.
pub const SECRET: &str = "executor-secret";

/// Executor hostname used by every test.
pub const HOSTNAME: &str = "exec";

/// Secret the fake runtime expects.
pub const RUNTIME_SECRET: &str = "runtime-secret";

/// Executor configuration for tests.
pub fn test_config(scratch_root: &std::path::Path, runtime_port: u16) -> Config {
    let mut config = Config::new(SECRET, HOSTNAME);
    config.scratch_root = scratch_root.to_path_buf();
    config.runtime_port = runtime_port;
    config
}

/// A ready descriptor pointing at a runtime on the loopback interface.
pub fn ready_descriptor(name: &str, listening: bool) -> RuntimeDescriptor {
    let mut descriptor = RuntimeDescriptor::pending(name, "127.0.0.1", RUNTIME_SECRET);
    descriptor.status = RuntimeStatus::ready_after(Duration::from_millis(100));
    descriptor.listening = listening;
    descriptor
}

/// Insert a ready runtime into `registry`.
pub fn insert_ready(registry: &RuntimeRegistry, runtime_id: &str, listening: bool) -> String {
    let name = format!("{HOSTNAME}-{runtime_id}");
    registry
        .set(ready_descriptor(&name, listening))
        .expect("registry has room");
    name
}

fn is_build_command(command: &[String]) -> bool {
    command.len() == 3 && command[0] == "sh" && command[2].starts_with("touch ")
}

fn code_mount(spec: &ContainerSpec) -> Option<PathBuf> {
    spec.mounts
        .iter()
        .find(|m| m.container != "/tmp")
        .map(|m| m.host.clone())
}

/// Mock whose build command writes `code.tar.gz` into the build mount and
/// prints `OK`.
pub fn building_orchestrator() -> MockOrchestrator {
    MockOrchestrator::with_exec(Arc::new(|spec, command| {
        if is_build_command(command) {
            if let Some(dir) = code_mount(spec) {
                let _ = std::fs::write(dir.join("code.tar.gz"), b"built artifact bytes");
            }
            return ExecOutput {
                success: true,
                output: "OK".to_string(),
            };
        }
        ExecOutput {
            success: true,
            output: String::new(),
        }
    }))
}

/// Mock whose build command fails; the log file holds `compile error`.
pub fn failing_orchestrator() -> MockOrchestrator {
    MockOrchestrator::with_exec(Arc::new(|_, command| {
        if is_build_command(command) {
            return ExecOutput {
                success: false,
                output: "boom".to_string(),
            };
        }
        if command.last().is_some_and(|c| c.contains(BUILD_LOG_PATH)) {
            return ExecOutput {
                success: true,
                output: "compile error".to_string(),
            };
        }
        ExecOutput {
            success: true,
            output: String::new(),
        }
    }))
}

/// A fake runtime HTTP listener.
pub struct FakeRuntime {
    /// Address the runtime listens on.
    pub addr: SocketAddr,
    /// Requests received so far.
    pub hits: Arc<AtomicUsize>,
}

impl FakeRuntime {
    /// Number of requests received.
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

async fn runtime_reply(hits: Arc<AtomicUsize>, uri: Uri, headers: HeaderMap, body: Bytes) -> Response {
    hits.fetch_add(1, Ordering::SeqCst);

    // v2 envelope
    if let Some(challenge) = headers.get("x-internal-challenge") {
        if challenge != RUNTIME_SECRET {
            return StatusCode::UNAUTHORIZED.into_response();
        }
        let envelope: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
        let reply = json!({
            "response": {"payload": envelope["payload"], "ok": true},
            "stdout": "v2 log",
            "stderr": "",
        });
        return axum::Json(reply).into_response();
    }

    // v3 passthrough
    if headers
        .get("x-open-runtimes-secret")
        .is_none_or(|s| s != RUNTIME_SECRET)
    {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    if uri.path() == "/binary" {
        return (StatusCode::OK, vec![0xffu8, 0xfe, 0x00]).into_response();
    }
    (
        StatusCode::OK,
        [
            ("content-type", "text/plain"),
            ("x-open-runtimes-logs", "log%20line"),
            ("x-open-runtimes-errors", "warn+line"),
            ("x-open-runtimes-internal", "hidden"),
        ],
        format!("hello from {} ({} bytes)", uri.path(), body.len()),
    )
        .into_response()
}

fn runtime_router(hits: Arc<AtomicUsize>) -> Router {
    Router::new().fallback(move |uri: Uri, headers: HeaderMap, body: Bytes| {
        let hits = hits.clone();
        async move { runtime_reply(hits, uri, headers, body).await }
    })
}

/// Start a fake runtime on an ephemeral loopback port.
pub async fn spawn_fake_runtime() -> FakeRuntime {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind fake runtime");
    let addr = listener.local_addr().expect("local addr");
    let hits = Arc::new(AtomicUsize::new(0));
    let router = runtime_router(hits.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    FakeRuntime { addr, hits }
}

/// Start a fake runtime on `port` after `delay`, simulating a cold start.
pub fn spawn_fake_runtime_later(port: u16, delay: Duration) -> Arc<AtomicUsize> {
    let hits = Arc::new(AtomicUsize::new(0));
    let router = runtime_router(hits.clone());
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
            .await
            .expect("bind delayed runtime");
        let _ = axum::serve(listener, router).await;
    });
    hits
}

/// A free loopback port.
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    listener.local_addr().expect("local addr").port()
}

/// A full executor running against a mock orchestrator.
pub struct TestExecutor {
    /// The running executor.
    pub runtime: ExecutorRuntime,
    /// The orchestrator behind it.
    pub mock: Arc<MockOrchestrator>,
    /// HTTP client.
    pub client: reqwest::Client,
    /// Base URL of the executor API.
    pub base_url: String,
    /// Scratch root.
    pub scratch: TempDir,
    /// Directory for source archives and build artifacts.
    pub storage: TempDir,
}

impl TestExecutor {
    /// Start an executor with `mock`, pointing runtimes at `runtime_port`.
    pub async fn start(mock: MockOrchestrator, runtime_port: u16) -> Self {
        let scratch = TempDir::new().expect("scratch dir");
        let storage = TempDir::new().expect("storage dir");
        let mock = Arc::new(mock);

        let runtime = ExecutorRuntime::builder()
            .config(test_config(scratch.path(), runtime_port))
            .orchestrator(mock.clone())
            .remove_grace(Duration::from_millis(50))
            .build()
            .expect("build runtime")
            .start()
            .await
            .expect("start runtime");
        let base_url = format!("http://{}", runtime.local_addr());

        Self {
            runtime,
            mock,
            client: reqwest::Client::new(),
            base_url,
            scratch,
            storage,
        }
    }

    /// Full URL of `path`.
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Authenticated JSON POST.
    pub async fn post(&self, path: &str, body: Value) -> reqwest::Response {
        self.client
            .post(self.url(path))
            .bearer_auth(SECRET)
            .json(&body)
            .send()
            .await
            .expect("request")
    }

    /// Authenticated GET.
    pub async fn get(&self, path: &str) -> reqwest::Response {
        self.client
            .get(self.url(path))
            .bearer_auth(SECRET)
            .send()
            .await
            .expect("request")
    }

    /// Write a source archive and return its path.
    pub fn source_archive(&self) -> String {
        let path = self.storage.path().join("source.tar.gz");
        std::fs::write(&path, b"source archive bytes").expect("write source");
        path.to_string_lossy().into_owned()
    }

    /// Directory build artifacts are persisted to.
    pub fn destination(&self) -> String {
        self.storage.path().join("builds").to_string_lossy().into_owned()
    }

    /// Scratch directory of `runtime_id`.
    pub fn scratch_dir(&self, runtime_id: &str) -> PathBuf {
        self.scratch.path().join(format!("{HOSTNAME}-{runtime_id}"))
    }

    /// Stop the executor.
    pub async fn shutdown(self) {
        self.runtime.shutdown().await.expect("shutdown");
    }
}
