// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runtime protocol versions.
//!
//! A protocol version fixes two contracts with the code running inside a
//! runtime container: how the container is started (injected variables,
//! mount path, idle command) and how an execution travels over HTTP.
//!
//! | Version | Request | Logs and errors |
//! |---------|---------|-----------------|
//! | `v2` | JSON envelope POSTed to `/` | `stdout` / `stderr` fields of the JSON reply |
//! | `v3` | raw HTTP passthrough | `x-open-runtimes-logs` / `-errors` reply headers |

use std::collections::{BTreeMap, HashMap};
use std::error::Error as _;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Header prefix reserved for the runtime protocol.
pub const RESERVED_HEADER_PREFIX: &str = "x-open-runtimes-";

/// Extra time a `v3` runtime gets to deliver its reply after its own timeout.
pub const PASSTHROUGH_GRACE: Duration = Duration::from_secs(5);

/// Wire contract between the executor and a runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolVersion {
    /// JSON envelope
    V2,
    /// Raw HTTP passthrough
    #[default]
    V3,
}

impl ProtocolVersion {
    /// Variables injected into the runtime container.
    pub fn runtime_vars(
        self,
        secret: &str,
        entrypoint: &str,
        executor_hostname: &str,
    ) -> [(&'static str, String); 3] {
        match self {
            ProtocolVersion::V2 => [
                ("INTERNAL_RUNTIME_KEY", secret.to_string()),
                ("INTERNAL_RUNTIME_ENTRYPOINT", entrypoint.to_string()),
                ("INERNAL_EXECUTOR_HOSTNAME", executor_hostname.to_string()),
            ],
            ProtocolVersion::V3 => [
                ("OPEN_RUNTIMES_SECRET", secret.to_string()),
                ("OPEN_RUNTIMES_ENTRYPOINT", entrypoint.to_string()),
                ("OPEN_RUNTIMES_HOSTNAME", executor_hostname.to_string()),
            ],
        }
    }

    /// Where the build output directory is mounted in the container.
    pub fn code_mount_path(self) -> &'static str {
        match self {
            ProtocolVersion::V2 => "/usr/code",
            ProtocolVersion::V3 => "/mnt/code",
        }
    }

    /// Working directory of the container, if fixed.
    pub fn workdir(self) -> Option<&'static str> {
        match self {
            ProtocolVersion::V2 => Some("/usr/code"),
            ProtocolVersion::V3 => None,
        }
    }

    /// Command the container runs after start.
    ///
    /// An explicit `runtime_entrypoint` runs through `sh -c`. Otherwise the
    /// container idles so build commands can be executed in it; `v2` images
    /// without a build command keep their own default command.
    pub fn startup_command(self, runtime_entrypoint: &str, has_build_command: bool) -> Vec<String> {
        if !runtime_entrypoint.is_empty() {
            return vec!["sh".into(), "-c".into(), runtime_entrypoint.to_string()];
        }
        if self == ProtocolVersion::V2 && !has_build_command {
            return Vec::new();
        }
        vec!["tail".into(), "-f".into(), "/dev/null".into()]
    }
}

/// Failures while proxying an execution.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The reply could not be parsed because it was too large.
    #[error("{0}")]
    TooLarge(String),
    /// The runtime did not answer in time.
    #[error("{0}")]
    Timeout(String),
    /// Any other transport failure.
    #[error("{0}")]
    Transport(String),
}

impl From<reqwest::Error> for ProxyError {
    fn from(e: reqwest::Error) -> Self {
        let chain = error_chain(&e);
        if chain.contains("too large") {
            ProxyError::TooLarge(chain)
        } else if e.is_timeout() {
            ProxyError::Timeout(chain)
        } else {
            ProxyError::Transport(chain)
        }
    }
}

fn error_chain(e: &reqwest::Error) -> String {
    let mut message = e.to_string();
    let mut source = e.source();
    while let Some(inner) = source {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        source = inner.source();
    }
    message
}

/// One execution to deliver to a runtime.
#[derive(Debug, Clone)]
pub struct ProxyRequest<'a> {
    /// Runtime hostname
    pub hostname: &'a str,
    /// Runtime listener port
    pub port: u16,
    /// Runtime secret
    pub secret: &'a str,
    /// HTTP method
    pub method: &'a str,
    /// Request path
    pub path: &'a str,
    /// Request headers
    pub headers: &'a HashMap<String, String>,
    /// Request body
    pub body: &'a str,
    /// Variables (JSON envelope only)
    pub variables: &'a HashMap<String, String>,
    /// Time left in the budget
    pub remaining: Duration,
}

/// What the runtime answered.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProxyResponse {
    /// HTTP status code
    pub status_code: u16,
    /// Response headers, reserved headers removed
    pub headers: BTreeMap<String, String>,
    /// Response body
    pub body: Bytes,
    /// Captured stdout
    pub logs: String,
    /// Captured stderr
    pub errors: String,
}

/// One execution wire format.
#[async_trait]
pub trait ExecutionProtocol: Send + Sync {
    /// Deliver `request` and collect the reply.
    async fn execute(&self, request: &ProxyRequest<'_>) -> Result<ProxyResponse, ProxyError>;
}

/// `v2`: JSON envelope in, JSON envelope out.
pub struct JsonEnvelope {
    client: reqwest::Client,
}

/// `v3`: raw HTTP passthrough with sideband headers.
pub struct HttpPassthrough {
    client: reqwest::Client,
}

/// The closed set of execution protocols.
pub struct Protocols {
    v2: JsonEnvelope,
    v3: HttpPassthrough,
}

impl Protocols {
    /// Build the HTTP clients for both protocols.
    pub fn new() -> reqwest::Result<Self> {
        Ok(Self {
            v2: JsonEnvelope {
                client: reqwest::Client::builder()
                    .connect_timeout(Duration::from_secs(10))
                    .build()?,
            },
            v3: HttpPassthrough {
                client: reqwest::Client::builder()
                    .connect_timeout(Duration::from_secs(5))
                    .redirect(reqwest::redirect::Policy::none())
                    .build()?,
            },
        })
    }

    /// Protocol implementation for `version`.
    pub fn for_version(&self, version: ProtocolVersion) -> &dyn ExecutionProtocol {
        match version {
            ProtocolVersion::V2 => &self.v2,
            ProtocolVersion::V3 => &self.v3,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct EnvelopeReply {
    #[serde(default)]
    response: Value,
    #[serde(default)]
    stdout: Option<String>,
    #[serde(default)]
    stderr: Option<String>,
}

fn envelope_body(response: Value) -> String {
    match response {
        Value::Null => String::new(),
        Value::String(s) => s,
        other => other.to_string(),
    }
}

#[async_trait]
impl ExecutionProtocol for JsonEnvelope {
    async fn execute(&self, request: &ProxyRequest<'_>) -> Result<ProxyResponse, ProxyError> {
        let envelope = serde_json::json!({
            "variables": request.variables,
            "payload": request.body,
            "headers": {},
        });

        let response = self
            .client
            .post(format!("http://{}:{}/", request.hostname, request.port))
            .header("x-internal-challenge", request.secret)
            .header("host", "null")
            .timeout(request.remaining.max(Duration::from_secs(1)))
            .json(&envelope)
            .send()
            .await?;

        let status_code = response.status().as_u16();
        let raw = response.bytes().await?;
        let reply: EnvelopeReply = serde_json::from_slice(&raw).unwrap_or_default();

        Ok(ProxyResponse {
            status_code,
            headers: BTreeMap::new(),
            body: Bytes::from(envelope_body(reply.response)),
            logs: reply.stdout.unwrap_or_default(),
            errors: reply.stderr.unwrap_or_default(),
        })
    }
}

fn decode_sideband(value: &str) -> String {
    let spaced = value.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|v| v.into_owned())
        .unwrap_or(spaced)
}

/// Split reply headers into caller-visible headers, logs and errors.
fn split_headers(headers: &HeaderMap) -> (BTreeMap<String, String>, String, String) {
    let mut visible = BTreeMap::new();
    let mut logs = String::new();
    let mut errors = String::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes()).trim().to_string();
        match name.as_str() {
            "x-open-runtimes-logs" => logs = decode_sideband(&value),
            "x-open-runtimes-errors" => errors = decode_sideband(&value),
            key if key.starts_with(RESERVED_HEADER_PREFIX) => {}
            key => {
                visible.insert(key.to_string(), value);
            }
        }
    }
    (visible, logs, errors)
}

#[async_trait]
impl ExecutionProtocol for HttpPassthrough {
    async fn execute(&self, request: &ProxyRequest<'_>) -> Result<ProxyResponse, ProxyError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|e| ProxyError::Transport(e.to_string()))?;

        let mut headers = HeaderMap::new();
        for (key, value) in request.headers {
            let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(key.to_ascii_lowercase().as_bytes()),
                HeaderValue::from_str(value),
            ) else {
                tracing::debug!(header = %key, "Skipping invalid execution header");
                continue;
            };
            headers.insert(name, value);
        }
        let timeout_secs = request.remaining.as_secs().max(1);
        if let Ok(secret) = HeaderValue::from_str(request.secret) {
            headers.insert("x-open-runtimes-secret", secret);
        }
        headers.insert("x-open-runtimes-timeout", HeaderValue::from(timeout_secs));

        let response = self
            .client
            .request(
                method,
                format!("http://{}:{}{}", request.hostname, request.port, request.path),
            )
            .headers(headers)
            .timeout(request.remaining + PASSTHROUGH_GRACE)
            .body(request.body.to_string())
            .send()
            .await?;

        let status_code = response.status().as_u16();
        let (headers, logs, errors) = split_headers(response.headers());
        let body = response.bytes().await?;

        Ok(ProxyResponse {
            status_code,
            headers,
            body,
            logs,
            errors,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_serde() {
        assert_eq!(serde_json::to_value(ProtocolVersion::V2).unwrap(), "v2");
        let v: ProtocolVersion = serde_json::from_value("v3".into()).unwrap();
        assert_eq!(v, ProtocolVersion::V3);
        assert!(serde_json::from_value::<ProtocolVersion>("v4".into()).is_err());
        assert_eq!(ProtocolVersion::default(), ProtocolVersion::V3);
    }

    #[test]
    fn test_runtime_vars() {
        let v2 = ProtocolVersion::V2.runtime_vars("s", "index.js", "exec");
        assert_eq!(v2[0], ("INTERNAL_RUNTIME_KEY", "s".to_string()));
        assert_eq!(v2[2].0, "INERNAL_EXECUTOR_HOSTNAME");
        let v3 = ProtocolVersion::V3.runtime_vars("s", "index.js", "exec");
        assert_eq!(v3[1], ("OPEN_RUNTIMES_ENTRYPOINT", "index.js".to_string()));
    }

    #[test]
    fn test_startup_command() {
        assert!(ProtocolVersion::V2.startup_command("", false).is_empty());
        assert_eq!(
            ProtocolVersion::V2.startup_command("", true),
            vec!["tail", "-f", "/dev/null"]
        );
        assert_eq!(
            ProtocolVersion::V3.startup_command("", false),
            vec!["tail", "-f", "/dev/null"]
        );
        assert_eq!(
            ProtocolVersion::V3.startup_command("npm start", false),
            vec!["sh", "-c", "npm start"]
        );
    }

    #[test]
    fn test_mounts() {
        assert_eq!(ProtocolVersion::V2.code_mount_path(), "/usr/code");
        assert_eq!(ProtocolVersion::V2.workdir(), Some("/usr/code"));
        assert_eq!(ProtocolVersion::V3.code_mount_path(), "/mnt/code");
        assert_eq!(ProtocolVersion::V3.workdir(), None);
    }

    #[test]
    fn test_envelope_body() {
        assert_eq!(envelope_body(Value::String("hi".into())), "hi");
        assert_eq!(envelope_body(serde_json::json!({"a": 1})), r#"{"a":1}"#);
        assert_eq!(envelope_body(serde_json::json!([1, 2])), "[1,2]");
        assert_eq!(envelope_body(serde_json::json!(42)), "42");
        assert_eq!(envelope_body(Value::Null), "");
    }

    #[test]
    fn test_split_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("text/plain"));
        headers.insert("x-open-runtimes-logs", HeaderValue::from_static("hello%20world+again"));
        headers.insert("x-open-runtimes-errors", HeaderValue::from_static("oops%21"));
        headers.insert("x-open-runtimes-other", HeaderValue::from_static("hidden"));

        let (visible, logs, errors) = split_headers(&headers);
        assert_eq!(logs, "hello world again");
        assert_eq!(errors, "oops!");
        assert_eq!(visible.len(), 1);
        assert_eq!(visible["content-type"], "text/plain");
    }
}
