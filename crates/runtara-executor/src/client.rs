// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Loopback client for the executor's own API.
//!
//! On-demand builds go through the public create endpoint rather than calling
//! the pipeline directly, so they pass through the same validation and
//! conflict handling as external callers.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde::Deserialize;

use crate::build::CreateRuntimeRequest;

/// Outcome of one create attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateAttempt {
    /// The runtime was built.
    Created,
    /// Another request already owns the runtime.
    Conflict,
    /// Transient failure; try again.
    Retry(String),
    /// Permanent failure.
    Fatal(String),
}

#[derive(Debug, Default, Deserialize)]
struct ErrorReply {
    #[serde(default)]
    message: String,
}

/// HTTP client bound to this executor's listener.
#[derive(Clone)]
pub struct LoopbackClient {
    client: reqwest::Client,
    base_url: String,
    secret: String,
}

impl LoopbackClient {
    /// Client for the executor listening on `addr`.
    ///
    /// Unspecified addresses are reached over the IPv4 loopback.
    pub fn new(addr: SocketAddr, secret: impl Into<String>) -> reqwest::Result<Self> {
        let host = if addr.ip().is_unspecified() {
            Ipv4Addr::LOCALHOST.into()
        } else {
            addr.ip()
        };
        Ok(Self {
            client: reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(10))
                .build()?,
            base_url: format!("http://{}", SocketAddr::new(host, addr.port())),
            secret: secret.into(),
        })
    }

    /// Base URL of the executor API.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Ask the executor to build a runtime.
    pub async fn create_runtime(&self, request: &CreateRuntimeRequest) -> CreateAttempt {
        let response = match self
            .client
            .post(format!("{}/v1/runtimes", self.base_url))
            .bearer_auth(&self.secret)
            .json(request)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) if e.is_connect() => return CreateAttempt::Retry(e.to_string()),
            Err(e) => return CreateAttempt::Fatal(e.to_string()),
        };

        let status = response.status();
        if status.is_success() {
            return CreateAttempt::Created;
        }
        if status == reqwest::StatusCode::CONFLICT {
            return CreateAttempt::Conflict;
        }

        let message = response
            .json::<ErrorReply>()
            .await
            .map(|reply| reply.message)
            .unwrap_or_default();
        if status.is_server_error() {
            CreateAttempt::Retry(message)
        } else {
            CreateAttempt::Fatal(message)
        }
    }
}
