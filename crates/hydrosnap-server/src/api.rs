//! HTTP API routes and handlers.
//!
//! This module contains all HTTP endpoint implementations organized by domain:
//! - `qr` - QR plate pre-check and site presence validation
//! - `location` - Device location reports and the cached position
//! - `monitoring` - Geofence monitoring sessions
//! - `health` - Service health checks
//! - `error` - API error types
//! - `openapi` - OpenAPI specification generation

use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::state::SharedState;

pub mod error;
pub mod health;
pub mod location;
pub mod monitoring;
pub mod openapi;
pub mod qr;

// Re-export commonly used types
pub use error::{ApiError, ApiResult, ErrorResponse};

// Re-export OpenAPI utilities for the gen-openapi binary
pub use openapi::get_openapi_json;

/// Creates the combined API router with all endpoints.
///
/// # Route Structure
///
/// ```text
/// /health                - Health check
/// /api
/// ├── /qr                - Pre-check and validate scanned QR plates
/// ├── /location          - Cached position and device fix reports
/// ├── /monitoring        - Start, stop and inspect geofence sessions
/// └── /openapi.json      - OpenAPI specification
/// ```
pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .nest("/health", health::router())
        .nest(
            "/api",
            Router::new()
                // OpenAPI spec at /api/openapi.json
                .route("/openapi.json", get(openapi::get_openapi_spec))
                .nest("/qr", qr::router())
                .nest("/location", location::router())
                .nest("/monitoring", monitoring::router()),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use hydrosnap_core::{Config, MemoryStore};
    use serde_json::Value;
    use tower::ServiceExt;

    use crate::state::{AppState, SharedState};

    pub const SECRET: &str = "server-test-secret";

    /// State backed by an in-memory store with a QR secret configured.
    pub fn test_state() -> SharedState {
        let mut config = Config::default();
        config.qr.secret = Some(SECRET.to_string());
        config.location.fetch_timeout_secs = 1;
        AppState::new(config, Arc::new(MemoryStore::new()))
            .unwrap()
            .shared()
    }

    /// Send one request through a fresh router and decode the JSON body.
    pub async fn send(
        state: &SharedState,
        method: Method,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };

        let response = super::create_router(Arc::clone(state))
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();

        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }
}
