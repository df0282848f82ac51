// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runtara Executor - Serverless Runtime Lifecycle Management
//!
//! This crate provides the control plane for short-lived runtime containers.
//! It builds user code inside containers, routes executions to them under a
//! shrinking timeout budget, evicts idle runtimes, and reclaims everything it
//! owns across restarts.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Upstream API / Scheduler                          │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │ HTTP /v1 (Bearer secret)
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    runtara-executor (This Crate)                         │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐     │
//! │  │   Build     │  │  Execution  │  │ Maintenance │  │   Usage     │     │
//! │  │  Pipeline   │  │ Dispatcher  │  │   Worker    │  │  Sampler    │     │
//! │  └─────────────┘  └─────────────┘  └─────────────┘  └─────────────┘     │
//! │         │                │     Runtime Registry / Usage Store           │
//! └─────────────────────────────────────────────────────────────────────────┘
//!           │                │                               │
//!           │ Storage        │ Proxy (v2 envelope / v3 HTTP)  │ Orchestrator
//!           ▼                ▼                               ▼
//! ┌───────────────────┐  ┌───────────────────────────────────────────────┐
//! │  Local disk / S3  │  │          Runtime containers (docker)          │
//! └───────────────────┘  └───────────────────────────────────────────────┘
//! ```
//!
//! # HTTP API
//!
//! | Operation | Description |
//! |-----------|-------------|
//! | `POST /v1/runtimes` | Build a runtime, optionally persisting the artifact |
//! | `GET /v1/runtimes` | List tracked runtimes |
//! | `GET /v1/runtimes/{id}` | Get one runtime |
//! | `DELETE /v1/runtimes/{id}` | Force-remove a runtime |
//! | `POST /v1/runtimes/{id}/executions` | Execute, building on demand |
//! | `GET /v1/runtimes/{id}/logs` | Stream the build log |
//! | `GET /v1/health` | Host and runtime usage |
//!
//! # Configuration
//!
//! See [`config::Config::from_env`] for the recognised environment variables.

#![deny(missing_docs)]

pub mod budget;
pub mod build;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod handlers;
pub mod maintenance;
pub mod network;
pub mod orchestrator;
pub mod output;
pub mod protocol;
pub mod registry;
pub mod runtime;
pub mod server;
pub mod storage;
pub mod usage;
pub mod usage_sampler;

pub use build::{BuildOutcome, BuildPipeline, CreateRuntimeRequest};
pub use config::Config;
pub use dispatcher::{ExecutionDispatcher, ExecutionOutcome, ExecutionRequest};
pub use error::{Error, Result};
pub use registry::{RuntimeDescriptor, RuntimeRegistry, RuntimeStatus};
pub use runtime::ExecutorRuntime;
