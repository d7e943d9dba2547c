//! Location API endpoints.
//!
//! The field device pushes its fixes to `PUT /api/location/fix`; everything
//! else in the server reads positions back through the location cache.

use axum::extract::State;
use axum::routing::{get, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use hydrosnap_core::{Coordinate, LocationSample, PermissionStatus};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use utoipa::ToSchema;

use crate::api::error::{ApiError, ApiResult, ErrorResponse};
use crate::state::SharedState;

/// Creates the location router with all endpoints.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/", get(get_location))
        .route("/fix", put(report_fix))
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// Best position the server can offer without waiting.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "coordinate": {"lat": 28.6140, "lng": 77.2091},
    "accuracy_meters": 8.0,
    "cached_at": "2026-10-16T09:30:00Z",
    "refreshing": true,
    "permission": "granted"
}))]
pub struct LocationResponse {
    /// Cached or freshly fetched position, if any.
    #[schema(nullable)]
    pub coordinate: Option<Coordinate>,

    /// Reported accuracy of the cached fix.
    #[schema(nullable)]
    pub accuracy_meters: Option<f64>,

    /// When the cached fix was stored.
    #[schema(nullable)]
    pub cached_at: Option<DateTime<Utc>>,

    /// Whether a background refresh is in flight.
    pub refreshing: bool,

    /// Location permission reported by the device.
    pub permission: PermissionStatus,
}

/// A fix reported by the field device.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[schema(example = json!({
    "lat": 28.6140,
    "lng": 77.2091,
    "accuracy_meters": 8.0
}))]
pub struct ReportFixRequest {
    /// Latitude in degrees.
    #[schema(example = 28.6140)]
    pub lat: f64,

    /// Longitude in degrees.
    #[schema(example = 77.2091)]
    pub lng: f64,

    /// Horizontal accuracy radius in meters.
    #[serde(default)]
    pub accuracy_meters: Option<f64>,

    /// When the device captured the fix. Defaults to now.
    #[serde(default)]
    pub captured_at: Option<DateTime<Utc>>,

    /// Permission state on the device, when it changed.
    #[serde(default)]
    pub permission: Option<PermissionStatus>,
}

/// Response after a fix report.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ReportFixResponse {
    /// The recorded fix.
    pub sample: LocationSample,

    /// Whether this report started a cache refresh.
    pub refresh_started: bool,
}

// ============================================================================
// Handlers
// ============================================================================

/// Get the best available position.
#[utoipa::path(
    get,
    path = "/api/location",
    tag = "location",
    operation_id = "getLocation",
    summary = "Get the cached device position",
    description = "Serves the cached fix when it is fresh and refreshes it in \
        the background; otherwise tries the last known and then a current fix. \
        `coordinate` is null when no position can be obtained.",
    responses(
        (status = 200, description = "Position lookup completed", body = LocationResponse)
    )
)]
pub async fn get_location(State(state): State<SharedState>) -> Json<LocationResponse> {
    let coordinate = state.cache.get_fast().await;
    let entry = state.cache.peek().await;

    Json(LocationResponse {
        coordinate,
        accuracy_meters: entry.as_ref().and_then(|e| e.sample.accuracy_meters),
        cached_at: entry.map(|e| e.cached_at),
        refreshing: state.cache.is_refreshing(),
        permission: state.cache.permission().await,
    })
}

/// Record a fix from the field device.
#[utoipa::path(
    put,
    path = "/api/location/fix",
    tag = "location",
    operation_id = "reportFix",
    summary = "Report a device fix",
    description = "Pushes the device's latest position. Monitoring sessions \
        and QR validation without an explicit location read from these reports.",
    request_body = ReportFixRequest,
    responses(
        (status = 200, description = "Fix recorded", body = ReportFixResponse),
        (status = 400, description = "Invalid coordinate or accuracy", body = ErrorResponse)
    )
)]
pub async fn report_fix(
    State(state): State<SharedState>,
    Json(request): Json<ReportFixRequest>,
) -> ApiResult<Json<ReportFixResponse>> {
    let coordinate = Coordinate::new(request.lat, request.lng);
    if !coordinate.is_valid() {
        return Err(ApiError::bad_request(
            "INVALID_COORDINATE",
            format!("Coordinate out of range: {coordinate}"),
        ));
    }
    if let Some(accuracy) = request.accuracy_meters {
        if !accuracy.is_finite() || accuracy < 0.0 {
            return Err(ApiError::bad_request(
                "INVALID_ACCURACY",
                "Accuracy must be a non-negative number of meters",
            ));
        }
    }

    if let Some(permission) = request.permission {
        info!(?permission, "Device location permission updated");
        state.reports.set_permission(permission);
    }

    let sample = LocationSample {
        lat: coordinate.lat,
        lng: coordinate.lng,
        accuracy_meters: request.accuracy_meters,
        captured_at: request.captured_at.unwrap_or_else(Utc::now),
    };
    debug!(%coordinate, accuracy = ?sample.accuracy_meters, "Fix reported");
    state.reports.report(sample.clone());

    let refresh_started = state.cache.refresh_in_background();

    Ok(Json(ReportFixResponse {
        sample,
        refresh_started,
    }))
}
