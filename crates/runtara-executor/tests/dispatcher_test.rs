// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for the execution dispatcher against a fake runtime listener.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;

use common::*;
use runtara_executor::client::LoopbackClient;
use runtara_executor::dispatcher::{
    ENCODING_HEADER, ExecutionDispatcher, ExecutionMethod, ExecutionRequest,
};
use runtara_executor::protocol::{ProtocolVersion, Protocols};
use runtara_executor::registry::RuntimeRegistry;
use runtara_executor::{Config, Error};

fn dispatcher(config: Config, registry: Arc<RuntimeRegistry>) -> ExecutionDispatcher {
    // Loopback is never reached when the runtime already exists
    let loopback = LoopbackClient::new("127.0.0.1:1".parse().unwrap(), SECRET).unwrap();
    ExecutionDispatcher::new(
        Arc::new(config),
        registry,
        loopback,
        Arc::new(Protocols::new().unwrap()),
    )
}

#[tokio::test]
async fn test_v3_execution_passthrough() {
    let runtime = spawn_fake_runtime().await;
    let scratch = tempfile::tempdir().unwrap();
    let registry = Arc::new(RuntimeRegistry::new(16));
    let name = insert_ready(&registry, "r1", true);
    let dispatcher = dispatcher(test_config(scratch.path(), runtime.addr.port()), registry.clone());

    let request = ExecutionRequest {
        body: Some("ping".to_string()),
        path: "/hello".to_string(),
        method: ExecutionMethod::Post,
        ..Default::default()
    };
    let before = registry.get(&name).unwrap().updated;
    let outcome = dispatcher.execute("r1", &request).await.unwrap();

    assert_eq!(outcome.status_code, 200);
    assert_eq!(outcome.body, "hello from /hello (4 bytes)");
    assert_eq!(outcome.logs, "log line");
    assert_eq!(outcome.errors, "warn line");
    assert_eq!(outcome.headers["content-type"], "text/plain");
    assert!(
        outcome
            .headers
            .keys()
            .all(|k| !k.starts_with("x-open-runtimes-"))
    );
    assert!(outcome.duration >= 0.0);
    assert!(registry.get(&name).unwrap().updated >= before);
    assert_eq!(runtime.hits(), 1);
}

#[tokio::test]
async fn test_v2_execution_envelope() {
    let runtime = spawn_fake_runtime().await;
    let scratch = tempfile::tempdir().unwrap();
    let registry = Arc::new(RuntimeRegistry::new(16));
    insert_ready(&registry, "r2", true);
    let dispatcher = dispatcher(test_config(scratch.path(), runtime.addr.port()), registry);

    let request = ExecutionRequest {
        body: Some("data".to_string()),
        version: ProtocolVersion::V2,
        ..Default::default()
    };
    let outcome = dispatcher.execute("r2", &request).await.unwrap();

    assert_eq!(outcome.status_code, 200);
    assert_eq!(outcome.logs, "v2 log");
    let body: serde_json::Value = serde_json::from_str(&outcome.body).unwrap();
    assert_eq!(body["ok"], true);
    assert_eq!(body["payload"], "data");
}

#[tokio::test]
async fn test_binary_body_is_base64_encoded() {
    let runtime = spawn_fake_runtime().await;
    let scratch = tempfile::tempdir().unwrap();
    let registry = Arc::new(RuntimeRegistry::new(16));
    insert_ready(&registry, "bin", true);
    let dispatcher = dispatcher(test_config(scratch.path(), runtime.addr.port()), registry);

    let request = ExecutionRequest {
        path: "/binary".to_string(),
        ..Default::default()
    };
    let outcome = dispatcher.execute("bin", &request).await.unwrap();

    assert_eq!(outcome.headers[ENCODING_HEADER], "base64");
    assert_eq!(BASE64.decode(&outcome.body).unwrap(), vec![0xff, 0xfe, 0x00]);
}

#[tokio::test]
async fn test_unknown_runtime_without_build_params() {
    let scratch = tempfile::tempdir().unwrap();
    let registry = Arc::new(RuntimeRegistry::new(16));
    let dispatcher = dispatcher(test_config(scratch.path(), 3000), registry);

    let err = dispatcher
        .execute("missing", &ExecutionRequest::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotStarted));
    assert_eq!(err.public_code(), 401);
}

#[tokio::test]
async fn test_pending_runtime_times_out_during_launch() {
    let scratch = tempfile::tempdir().unwrap();
    let registry = Arc::new(RuntimeRegistry::new(16));
    registry
        .set(runtara_executor::RuntimeDescriptor::pending(
            "exec-slow",
            "127.0.0.1",
            RUNTIME_SECRET,
        ))
        .unwrap();
    let dispatcher = dispatcher(test_config(scratch.path(), 3000), registry);

    let request = ExecutionRequest {
        timeout: 1,
        ..Default::default()
    };
    let err = dispatcher.execute("slow", &request).await.unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));
    assert_eq!(err.to_string(), "Function timed out during launch.");
    assert_eq!(err.public_code(), 400);
}

#[tokio::test]
async fn test_unreachable_runtime_times_out_during_cold_start() {
    let scratch = tempfile::tempdir().unwrap();
    let registry = Arc::new(RuntimeRegistry::new(16));
    insert_ready(&registry, "cold", false);
    let dispatcher = dispatcher(test_config(scratch.path(), free_port()), registry);

    let request = ExecutionRequest {
        timeout: 1,
        ..Default::default()
    };
    let err = dispatcher.execute("cold", &request).await.unwrap_err();
    assert_eq!(err.to_string(), "Function timed out during cold start.");
}

#[tokio::test]
async fn test_cold_start_is_slower_than_warm_path() {
    let port = free_port();
    let hits = spawn_fake_runtime_later(port, Duration::from_millis(700));
    let scratch = tempfile::tempdir().unwrap();
    let registry = Arc::new(RuntimeRegistry::new(16));
    let name = insert_ready(&registry, "warmup", false);
    let dispatcher = dispatcher(test_config(scratch.path(), port), registry.clone());

    let started = Instant::now();
    let cold = dispatcher
        .execute("warmup", &ExecutionRequest::default())
        .await
        .unwrap();
    let cold_elapsed = started.elapsed();
    assert_eq!(cold.status_code, 200);
    assert!(registry.get(&name).unwrap().listening);
    // Billable time starts after the cold start
    assert!(cold.duration < cold_elapsed.as_secs_f64());

    let started = Instant::now();
    let warm = dispatcher
        .execute("warmup", &ExecutionRequest::default())
        .await
        .unwrap();
    let warm_elapsed = started.elapsed();
    assert_eq!(warm.status_code, 200);

    assert!(cold_elapsed >= Duration::from_millis(500));
    assert!(warm_elapsed < cold_elapsed);
    assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_failed_execution_leaves_runtime_registered() {
    let scratch = tempfile::tempdir().unwrap();
    let registry = Arc::new(RuntimeRegistry::new(16));
    // Marked listening, but nothing answers on the port
    let name = insert_ready(&registry, "down", true);
    let dispatcher = dispatcher(test_config(scratch.path(), free_port()), registry.clone());

    let err = dispatcher
        .execute("down", &ExecutionRequest::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Internal(_)));
    assert_eq!(err.public_code(), 500);
    assert!(registry.exists(&name));
}
