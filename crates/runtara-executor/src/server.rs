// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Executor HTTP server.
//!
//! All routes live under `/v1` and require `Authorization: Bearer <secret>`.
//!
//! | Route | Handler |
//! |-------|---------|
//! | `POST /v1/runtimes` | [`handlers::create_runtime`] |
//! | `GET /v1/runtimes` | [`handlers::list_runtimes`] |
//! | `GET /v1/runtimes/{id}` | [`handlers::get_runtime`] |
//! | `DELETE /v1/runtimes/{id}` | [`handlers::delete_runtime`] |
//! | `POST /v1/runtimes/{id}/executions` | [`handlers::create_execution`] |
//! | `POST /v1/runtimes/{id}/execution` | [`handlers::create_execution`] |
//! | `GET /v1/runtimes/{id}/logs` | [`handlers::runtime_logs`] |
//! | `GET /v1/health` | [`handlers::health`] |

use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderValue, header};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::{ApiError, Error, ErrorBody};
use crate::handlers::{self, AppState};

/// Build the executor router.
pub fn build_router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route(
            "/runtimes",
            post(handlers::create_runtime).get(handlers::list_runtimes),
        )
        .route(
            "/runtimes/{runtime_id}",
            get(handlers::get_runtime).delete(handlers::delete_runtime),
        )
        .route(
            "/runtimes/{runtime_id}/executions",
            post(handlers::create_execution),
        )
        .route(
            "/runtimes/{runtime_id}/execution",
            post(handlers::create_execution),
        )
        .route("/runtimes/{runtime_id}/logs", get(handlers::runtime_logs))
        .route("/health", get(handlers::health));

    Router::new()
        .nest("/v1", api)
        .fallback(handlers::not_found)
        .layer(middleware::from_fn_with_state(state.clone(), authenticate))
        .layer(middleware::from_fn_with_state(state.clone(), render_errors))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Reject requests whose bearer token does not match the shared secret.
async fn authenticate(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> std::result::Result<Response, ApiError> {
    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(' ').nth(1))
        .unwrap_or_default();

    if token.is_empty() || !secret_matches(token, &state.config.secret) {
        return Err(Error::Unauthorized.into());
    }
    Ok(next.run(request).await)
}

/// Constant-time comparison of `token` against `secret`.
///
/// Both sides are MACed under the secret and the tags compared with
/// [`Mac::verify_slice`].
fn secret_matches(token: &str, secret: &str) -> bool {
    let tag = |value: &str| {
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).map(|mut mac| {
            mac.update(value.as_bytes());
            mac
        })
    };
    match (tag(token), tag(secret)) {
        (Ok(presented), Ok(expected)) => expected
            .verify_slice(&presented.finalize().into_bytes())
            .is_ok(),
        _ => false,
    }
}

#[derive(Serialize)]
struct ErrorEnvelope<'a> {
    message: &'a str,
    code: u16,
    version: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    file: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    line: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    trace: Option<&'a str>,
}

/// Re-render error responses with the executor version and, in development
/// mode, the source location.
async fn render_errors(State(state): State<Arc<AppState>>, request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let Some(body) = response.extensions_mut().remove::<ErrorBody>() else {
        return response;
    };

    let development = state.config.mode.is_development();
    let envelope = ErrorEnvelope {
        message: &body.message,
        code: body.code,
        version: &state.config.version,
        file: development.then_some(body.file),
        line: development.then_some(body.line),
        trace: development.then_some(body.trace.as_str()),
    };
    let Ok(bytes) = serde_json::to_vec(&envelope) else {
        return response;
    };

    let (mut parts, _) = response.into_parts();
    parts.headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    parts.headers.remove(header::CONTENT_LENGTH);
    Response::from_parts(parts, Body::from(bytes))
}

/// Serve `router` on `listener` until `shutdown` turns true.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let addr = listener.local_addr()?;
    info!(addr = %addr, "Executor HTTP server starting");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await?;

    info!("Executor HTTP server stopped");
    Ok(())
}
