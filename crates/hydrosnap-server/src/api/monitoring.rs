//! Geofence monitoring API endpoints.
//!
//! While the operator captures a reading, the client keeps one monitoring
//! session open against the site they validated at. Only one session runs
//! per server.

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use hydrosnap_core::{
    Coordinate, GeofenceConfig, GeofenceStatus, HydroSnapError, Statistics, StatusSnapshot,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::api::error::{ApiError, ApiResult, ErrorResponse};
use crate::state::SharedState;

/// Creates the monitoring router with all endpoints.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/start", post(start_monitoring))
        .route("/stop", post(stop_monitoring))
        .route("/status", get(get_status))
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// Request to start a monitoring session.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[schema(example = json!({
    "site_id": "CWC-DEL-001",
    "center": {"lat": 28.6139, "lng": 77.2090},
    "radius_meters": 125.0,
    "strict_mode": false
}))]
pub struct StartMonitoringRequest {
    /// Site the operator validated at.
    #[schema(example = "CWC-DEL-001")]
    pub site_id: String,

    /// Geofence center.
    pub center: Coordinate,

    /// Geofence radius in meters. Defaults to the configured radius;
    /// zero disables the check.
    #[serde(default)]
    pub radius_meters: Option<f64>,

    /// Whether the client should block submission on breach.
    #[serde(default)]
    pub strict_mode: bool,
}

/// Response after starting a session.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct StartMonitoringResponse {
    /// Identifier of the new session.
    pub session_id: Uuid,

    /// Site being monitored.
    #[schema(example = "CWC-DEL-001")]
    pub site_id: String,

    /// Effective geofence radius in meters.
    #[schema(example = 125.0)]
    pub radius_meters: f64,
}

// ============================================================================
// Handlers
// ============================================================================

/// Start a monitoring session.
#[utoipa::path(
    post,
    path = "/api/monitoring/start",
    tag = "monitoring",
    operation_id = "startMonitoring",
    summary = "Start geofence monitoring",
    description = "Samples the device position every 5 seconds and accumulates \
        breach and distance statistics until stopped.",
    request_body = StartMonitoringRequest,
    responses(
        (status = 200, description = "Monitoring started", body = StartMonitoringResponse),
        (status = 400, description = "Invalid center or radius", body = ErrorResponse),
        (status = 403, description = "Location permission unavailable", body = ErrorResponse),
        (status = 409, description = "A session is already active", body = ErrorResponse)
    )
)]
pub async fn start_monitoring(
    State(state): State<SharedState>,
    Json(request): Json<StartMonitoringRequest>,
) -> ApiResult<Json<StartMonitoringResponse>> {
    if request.site_id.trim().is_empty() {
        return Err(ApiError::bad_request("INVALID_SITE_ID", "site_id must not be empty"));
    }
    if !request.center.is_valid() {
        return Err(ApiError::bad_request(
            "INVALID_COORDINATE",
            format!("Coordinate out of range: {}", request.center),
        ));
    }
    let radius_meters = request
        .radius_meters
        .unwrap_or(state.config.geofence.default_radius_meters);
    if !radius_meters.is_finite() || radius_meters < 0.0 {
        return Err(ApiError::bad_request(
            "INVALID_RADIUS",
            "radius_meters must be a non-negative number",
        ));
    }

    let config = GeofenceConfig {
        site_id: request.site_id.clone(),
        center: request.center,
        radius_meters,
        strict_mode: request.strict_mode,
    };

    let session_id = state.monitor.start(config, log_update).await?;

    Ok(Json(StartMonitoringResponse {
        session_id,
        site_id: request.site_id,
        radius_meters,
    }))
}

fn log_update(snapshot: StatusSnapshot) {
    match snapshot.status {
        GeofenceStatus::Outside => warn!(
            site_id = %snapshot.site_id,
            distance_meters = ?snapshot.distance_meters,
            radius_meters = snapshot.radius_meters,
            breach_count = snapshot.breach_count,
            strict_mode = snapshot.strict_mode,
            "Operator outside site geofence"
        ),
        GeofenceStatus::Inside | GeofenceStatus::Unknown => debug!(
            site_id = %snapshot.site_id,
            status = ?snapshot.status,
            distance_meters = ?snapshot.distance_meters,
            "Geofence update"
        ),
    }
}

/// Stop the running session.
#[utoipa::path(
    post,
    path = "/api/monitoring/stop",
    tag = "monitoring",
    operation_id = "stopMonitoring",
    summary = "Stop geofence monitoring",
    description = "Stops sampling and returns the session statistics. When no \
        session is running, returns the statistics of the previous session.",
    responses(
        (status = 200, description = "Monitoring stopped", body = Statistics)
    )
)]
pub async fn stop_monitoring(State(state): State<SharedState>) -> Json<Statistics> {
    Json(state.monitor.stop().await)
}

/// Get the live status of the running session.
#[utoipa::path(
    get,
    path = "/api/monitoring/status",
    tag = "monitoring",
    operation_id = "getMonitoringStatus",
    summary = "Get live geofence status",
    responses(
        (status = 200, description = "Session status", body = StatusSnapshot),
        (status = 404, description = "No session is active", body = ErrorResponse)
    )
)]
pub async fn get_status(State(state): State<SharedState>) -> ApiResult<Json<StatusSnapshot>> {
    state
        .monitor
        .status()
        .await
        .map(Json)
        .ok_or_else(|| HydroSnapError::NoActiveSession.into())
}
