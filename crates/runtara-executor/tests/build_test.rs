// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runtime build tests through the full executor HTTP API.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};

use common::*;
use runtara_executor::orchestrator::{ExecOutput, MockOrchestrator};
use runtara_executor::output::MAX_OUTPUT_BYTES;
use runtara_executor::runtime::ExecutorRuntime;

#[tokio::test]
async fn test_create_runtime_persists_artifact() {
    let executor = TestExecutor::start(building_orchestrator(), free_port()).await;

    let response = executor
        .post(
            "/v1/runtimes",
            json!({
                "runtimeId": "build-ok",
                "image": "openruntimes/node:v3-18.0",
                "entrypoint": "index.js",
                "source": executor.source_archive(),
                "destination": executor.destination(),
                "command": "npm install",
            }),
        )
        .await;
    assert_eq!(response.status(), 201);

    let outcome: Value = response.json().await.unwrap();
    assert!(outcome["output"].as_str().unwrap().contains("OK"));
    let path = outcome["path"].as_str().unwrap();
    assert!(!path.is_empty());
    assert!(std::path::Path::new(path).exists());
    assert!(outcome["size"].as_u64().unwrap() > 0);
    assert!(outcome["duration"].as_f64().unwrap() >= 0.0);

    let response = executor.get("/v1/runtimes/build-ok").await;
    assert_eq!(response.status(), 200);
    let descriptor: Value = response.json().await.unwrap();
    assert!(descriptor["name"].as_str().unwrap().ends_with("build-ok"));
    assert!(!descriptor["key"].as_str().unwrap().is_empty());
    assert!(descriptor["status"].as_str().unwrap().starts_with("Up "));

    let runtimes: Value = executor.get("/v1/runtimes").await.json().await.unwrap();
    assert_eq!(runtimes.as_array().unwrap().len(), 1);

    let spec = executor.mock.container(&format!("{HOSTNAME}-build-ok")).await.unwrap();
    assert_eq!(spec.labels["openruntimes-executor"], HOSTNAME);
    assert_eq!(spec.labels["openruntimes-runtime-id"], "build-ok");
    assert_eq!(spec.vars["OPEN_RUNTIMES_ENTRYPOINT"], "index.js");

    executor.shutdown().await;
}

#[tokio::test]
async fn test_failed_build_is_compensated() {
    let executor = TestExecutor::start(failing_orchestrator(), free_port()).await;

    let response = executor
        .post(
            "/v1/runtimes",
            json!({
                "runtimeId": "build-bad",
                "image": "openruntimes/node:v3-18.0",
                "source": executor.source_archive(),
                "command": "npm run build",
            }),
        )
        .await;
    assert_eq!(response.status(), 400);

    let error: Value = response.json().await.unwrap();
    let message = error["message"].as_str().unwrap();
    // Extracted log replaces the exec output; it appears once
    assert_eq!(message, "Failed to create runtime: compile error");
    assert_eq!(error["code"], 400);

    assert!(!executor.scratch_dir("build-bad").exists());
    assert_eq!(executor.mock.remove_count(), 1);
    assert!(executor.mock.container_names().await.is_empty());
    assert_eq!(executor.get("/v1/runtimes/build-bad").await.status(), 404);

    executor.shutdown().await;
}

#[tokio::test]
async fn test_remove_tears_down_after_build() {
    let executor = TestExecutor::start(building_orchestrator(), free_port()).await;

    let response = executor
        .post(
            "/v1/runtimes",
            json!({
                "runtimeId": "one-shot",
                "image": "openruntimes/node:v3-18.0",
                "source": executor.source_archive(),
                "destination": executor.destination(),
                "command": "npm install",
                "remove": true,
            }),
        )
        .await;
    assert_eq!(response.status(), 201);
    let outcome: Value = response.json().await.unwrap();
    assert!(std::path::Path::new(outcome["path"].as_str().unwrap()).exists());

    assert!(!executor.scratch_dir("one-shot").exists());
    assert!(executor.mock.container_names().await.is_empty());
    assert_eq!(executor.get("/v1/runtimes/one-shot").await.status(), 404);

    executor.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_create_conflicts() {
    let mut mock = building_orchestrator();
    mock.run_delay = Duration::from_millis(300);
    let executor = TestExecutor::start(mock, free_port()).await;

    let body = json!({
        "runtimeId": "dup",
        "image": "openruntimes/node:v3-18.0",
    });
    let (first, second) = tokio::join!(
        executor.post("/v1/runtimes", body.clone()),
        executor.post("/v1/runtimes", body.clone()),
    );

    let mut statuses = vec![first.status().as_u16(), second.status().as_u16()];
    statuses.sort_unstable();
    assert_eq!(statuses, vec![201, 409]);
    assert_eq!(executor.mock.run_count(), 1);

    executor.shutdown().await;
}

#[tokio::test]
async fn test_create_without_command_reports_default_output() {
    let executor = TestExecutor::start(building_orchestrator(), free_port()).await;

    let response = executor
        .post(
            "/v1/runtimes",
            json!({"runtimeId": "plain", "image": "openruntimes/node:v3-18.0"}),
        )
        .await;
    assert_eq!(response.status(), 201);
    let outcome: Value = response.json().await.unwrap();
    assert_eq!(outcome["output"], "Runtime created successfully!");
    assert!(outcome.get("path").is_none());

    executor.shutdown().await;
}

#[tokio::test]
async fn test_create_validates_lengths() {
    let executor = TestExecutor::start(building_orchestrator(), free_port()).await;

    let response = executor
        .post(
            "/v1/runtimes",
            json!({"runtimeId": "x".repeat(65), "image": "openruntimes/node:v3-18.0"}),
        )
        .await;
    assert_eq!(response.status(), 400);
    assert_eq!(executor.mock.run_count(), 0);

    executor.shutdown().await;
}

#[tokio::test]
async fn test_delete_runtime_twice() {
    let executor = TestExecutor::start(building_orchestrator(), free_port()).await;

    let response = executor
        .post(
            "/v1/runtimes",
            json!({"runtimeId": "gone", "image": "openruntimes/node:v3-18.0"}),
        )
        .await;
    assert_eq!(response.status(), 201);

    let url = executor.url("/v1/runtimes/gone");
    let first = executor
        .client
        .delete(&url)
        .bearer_auth(SECRET)
        .send()
        .await
        .unwrap();
    assert_eq!(first.status(), 200);
    assert!(executor.mock.container_names().await.is_empty());

    let second = executor
        .client
        .delete(&url)
        .bearer_auth(SECRET)
        .send()
        .await
        .unwrap();
    assert_eq!(second.status(), 404);
    let error: Value = second.json().await.unwrap();
    assert_eq!(error["message"], "Runtime not found");

    executor.shutdown().await;
}

#[tokio::test]
async fn test_failure_output_is_bounded() {
    let mut noisy = "x".repeat(1_500_000);
    noisy.push_str("last line");
    let mock = MockOrchestrator::with_exec(Arc::new(move |_, command| {
        if command[2].starts_with("touch ") {
            return ExecOutput {
                success: false,
                output: noisy.clone(),
            };
        }
        ExecOutput {
            success: false,
            output: String::new(),
        }
    }));
    let executor = TestExecutor::start(mock, free_port()).await;

    let response = executor
        .post(
            "/v1/runtimes",
            json!({
                "runtimeId": "noisy",
                "image": "openruntimes/node:v3-18.0",
                "command": "npm run build",
            }),
        )
        .await;
    assert_eq!(response.status(), 400);

    let error: Value = response.json().await.unwrap();
    let message = error["message"].as_str().unwrap();
    assert!(message.starts_with("Failed to create runtime: "));
    assert!(message.ends_with("last line"));
    assert_eq!(
        message.len(),
        "Failed to create runtime: ".len() + MAX_OUTPUT_BYTES
    );

    executor.shutdown().await;
}

#[tokio::test]
async fn test_build_survives_dropped_client() {
    let mut mock = building_orchestrator();
    mock.run_delay = Duration::from_secs(1);
    let executor = TestExecutor::start(mock, free_port()).await;

    let impatient = reqwest::Client::builder()
        .timeout(Duration::from_millis(200))
        .build()
        .unwrap();
    let dropped = impatient
        .post(executor.url("/v1/runtimes"))
        .bearer_auth(SECRET)
        .json(&json!({"runtimeId": "detached", "image": "openruntimes/node:v3-18.0"}))
        .send()
        .await;
    assert!(dropped.unwrap_err().is_timeout());

    let mut status = String::new();
    for _ in 0..50 {
        let descriptor: Value = executor
            .get("/v1/runtimes/detached")
            .await
            .json()
            .await
            .unwrap();
        status = descriptor["status"].as_str().unwrap_or_default().to_string();
        if status.starts_with("Up ") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(status.starts_with("Up "), "status: {status}");

    let again = executor
        .post(
            "/v1/runtimes",
            json!({"runtimeId": "detached", "image": "openruntimes/node:v3-18.0"}),
        )
        .await;
    assert_eq!(again.status(), 409);
    let error: Value = again.json().await.unwrap();
    assert_eq!(error["message"], "Runtime already exists.");

    executor.shutdown().await;
}

#[tokio::test]
async fn test_failed_build_is_compensated_after_dropped_client() {
    let mut mock = failing_orchestrator();
    mock.run_delay = Duration::from_secs(1);
    let executor = TestExecutor::start(mock, free_port()).await;

    let impatient = reqwest::Client::builder()
        .timeout(Duration::from_millis(200))
        .build()
        .unwrap();
    let dropped = impatient
        .post(executor.url("/v1/runtimes"))
        .bearer_auth(SECRET)
        .json(&json!({
            "runtimeId": "abandoned",
            "image": "openruntimes/node:v3-18.0",
            "command": "npm run build",
        }))
        .send()
        .await;
    assert!(dropped.is_err());

    let mut cleared = false;
    for _ in 0..50 {
        if executor.get("/v1/runtimes/abandoned").await.status() == 404
            && executor.mock.remove_count() == 1
        {
            cleared = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(cleared, "pending claim was never released");
    assert!(!executor.scratch_dir("abandoned").exists());

    executor.shutdown().await;
}

#[tokio::test]
async fn test_zero_capacity_is_rejected_at_startup() {
    let scratch = tempfile::tempdir().unwrap();
    let mut config = test_config(scratch.path(), free_port());
    config.registry_capacity = 0;

    let result = ExecutorRuntime::builder()
        .config(config)
        .orchestrator(Arc::new(building_orchestrator()))
        .build();
    let err = result.err().unwrap();
    assert!(err.to_string().contains("OPR_EXECUTOR_MAX_RUNTIMES"), "error: {err}");
}
