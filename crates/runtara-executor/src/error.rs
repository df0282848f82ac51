// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for runtara-executor.

use std::panic::Location;

use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

use crate::orchestrator::OrchestratorError;
use crate::storage::StorageError;

/// Status codes that are passed through to callers verbatim.
/// Every other code is reported as 500.
pub const PUBLIC_CODES: [u16; 12] = [400, 401, 402, 403, 404, 406, 409, 412, 425, 429, 501, 503];

/// Executor errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// A runtime with the same identifier exists or is being created.
    #[error("{0}")]
    Conflict(String),

    /// The runtime is not known to this executor.
    #[error("{0}")]
    NotFound(String),

    /// Execution was requested for an unknown runtime without build parameters.
    #[error("Runtime not found. Please start it first or provide runtime-related parameters.")]
    NotStarted,

    /// Staging, the build command, or artifact upload failed.
    #[error("{message}")]
    BuildFailed {
        /// Message including whatever build output was captured.
        message: String,
        /// Status code reported to the caller.
        code: u16,
    },

    /// A phase ran out of its timeout budget.
    #[error("{0}")]
    Timeout(String),

    /// The runtime answered with a response the proxy could not parse.
    #[error(
        "Invalid response. This usually means too large logs or errors. Please avoid logging files or lengthy strings."
    )]
    InvalidResponse,

    /// Transport or protocol failure that has no better classification.
    #[error("{0}")]
    Internal(String),

    /// Missing or incorrect shared secret.
    #[error("Missing executor key")]
    Unauthorized,

    /// Request validation failed.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// No route matched the request.
    #[error("Not Found")]
    RouteNotFound,

    /// The runtime registry reached its configured capacity.
    #[error("Runtime registry is full (capacity {0}); raise OPR_EXECUTOR_MAX_RUNTIMES")]
    RegistryFull(usize),

    /// Container orchestration failed.
    #[error("Orchestrator error: {0}")]
    Orchestrator(#[from] OrchestratorError),

    /// Storage device operation failed.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// The canonical "Runtime not found" error.
    pub fn runtime_not_found() -> Self {
        Error::NotFound("Runtime not found".to_string())
    }

    /// Raw status code of this error, before public normalisation.
    pub fn code(&self) -> u16 {
        match self {
            Error::Conflict(_) => 409,
            Error::NotFound(_) | Error::RouteNotFound => 404,
            Error::NotStarted | Error::Unauthorized => 401,
            Error::BuildFailed { code, .. } => *code,
            Error::Timeout(_) | Error::InvalidRequest(_) => 400,
            _ => 500,
        }
    }

    /// Status code reported to callers.
    pub fn public_code(&self) -> u16 {
        public_code(self.code())
    }
}

/// Normalise a status code against [`PUBLIC_CODES`].
pub fn public_code(code: u16) -> u16 {
    if PUBLIC_CODES.contains(&code) {
        code
    } else {
        500
    }
}

/// Result type using executor Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Error returned by HTTP handlers.
///
/// Records where the error crossed into the HTTP layer so development mode
/// can report it. The body is rendered by the router's error layer.
#[derive(Debug)]
pub struct ApiError {
    error: Error,
    location: &'static Location<'static>,
}

impl ApiError {
    /// The underlying error.
    pub fn error(&self) -> &Error {
        &self.error
    }
}

impl From<Error> for ApiError {
    #[track_caller]
    fn from(error: Error) -> Self {
        Self {
            error,
            location: Location::caller(),
        }
    }
}

/// Error details attached to the response for the error layer.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    /// Human-readable message.
    pub message: String,
    /// Public status code.
    pub code: u16,
    /// Source file where the error surfaced.
    #[serde(skip)]
    pub file: &'static str,
    /// Source line where the error surfaced.
    #[serde(skip)]
    pub line: u32,
    /// Debug rendering of the error chain.
    #[serde(skip)]
    pub trace: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.error.public_code();
        let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        if code == 500 {
            tracing::error!(
                error = %self.error,
                file = self.location.file(),
                line = self.location.line(),
                "Request failed"
            );
        } else {
            tracing::debug!(error = %self.error, code, "Request rejected");
        }

        let body = ErrorBody {
            message: self.error.to_string(),
            code,
            file: self.location.file(),
            line: self.location.line(),
            trace: format!("{:?}", self.error),
        };

        let mut response = (status, Json(&body)).into_response();
        let headers = response.headers_mut();
        headers.insert(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-cache, no-store, must-revalidate"),
        );
        headers.insert(header::EXPIRES, HeaderValue::from_static("0"));
        headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
        response.extensions_mut().insert(body);
        response
    }
}
