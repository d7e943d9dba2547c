//! OpenAPI specification generation for the HydroSnap API.
//!
//! The generated document is consumed by the field client to build its
//! typed HTTP bindings.

use axum::Json;
use hydrosnap_core::{
    Coordinate, GeofenceStatus, Levels, LocationSample, PermissionStatus, SiteDescriptor,
    Statistics, StatusSnapshot,
};
use utoipa::OpenApi;

use super::error::ErrorResponse;
use super::health::HealthResponse;
use super::location::{LocationResponse, ReportFixRequest, ReportFixResponse};
use super::monitoring::{StartMonitoringRequest, StartMonitoringResponse};
use super::qr::{PrecheckRequest, PrecheckResponse, ValidateRequest, ValidationResponse};

/// Serve the OpenAPI specification as JSON.
///
/// This endpoint is available at `/api/openapi.json`.
pub async fn get_openapi_spec() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

/// Returns the OpenAPI specification as pretty-printed JSON.
/// Used by the gen-openapi binary.
///
/// # Errors
///
/// Returns an error if the document cannot be serialized.
pub fn get_openapi_json() -> serde_json::Result<String> {
    ApiDoc::openapi().to_pretty_json()
}

/// Main OpenAPI document structure for HydroSnap.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "HydroSnap API",
        version = "0.1.0",
        description = r#"
# HydroSnap API

HydroSnap confirms that a field operator is standing at a registered
water-level monitoring site before a gauge reading is accepted.

## Flow

1. **Scan**: The client reads the QR plate at the site and calls
   `precheckQr` to reject foreign codes early.
2. **Validate**: `validateQr` decodes the plate and compares the operator's
   position with the site geofence. A `validated` outcome unlocks capture.
3. **Monitor**: `startMonitoring` keeps checking the position every 5 seconds
   while the reading is captured; `stopMonitoring` returns the statistics to
   attach to the submission.

Positions come from the field device through `reportFix`.
"#,
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    ),
    servers(
        (url = "/", description = "Local HydroSnap server")
    ),
    tags(
        (
            name = "system",
            description = "Health checks and service status"
        ),
        (
            name = "qr",
            description = "QR plate pre-check and site presence validation"
        ),
        (
            name = "location",
            description = "Device fix reports and the cached position"
        ),
        (
            name = "monitoring",
            description = "Geofence monitoring sessions during reading capture"
        )
    ),
    paths(
        // Health endpoints
        super::health::health_check,
        // QR endpoints
        super::qr::precheck,
        super::qr::validate,
        // Location endpoints
        super::location::get_location,
        super::location::report_fix,
        // Monitoring endpoints
        super::monitoring::start_monitoring,
        super::monitoring::stop_monitoring,
        super::monitoring::get_status,
    ),
    components(
        schemas(
            // Error types
            ErrorResponse,
            // Health types
            HealthResponse,
            // QR types
            PrecheckRequest,
            PrecheckResponse,
            ValidateRequest,
            ValidationResponse,
            SiteDescriptor,
            Levels,
            // Location types
            Coordinate,
            LocationSample,
            PermissionStatus,
            LocationResponse,
            ReportFixRequest,
            ReportFixResponse,
            // Monitoring types
            StartMonitoringRequest,
            StartMonitoringResponse,
            GeofenceStatus,
            StatusSnapshot,
            Statistics,
        )
    )
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openapi_spec_generation() {
        let spec = ApiDoc::openapi();
        assert_eq!(spec.info.title, "HydroSnap API");
        assert_eq!(spec.paths.paths.len(), 8);
        assert!(spec.paths.paths.contains_key("/api/monitoring/start"));
    }

    #[test]
    fn test_openapi_json_serialization() {
        let json = get_openapi_json().unwrap();
        assert!(json.contains("\"openapi\":"));
        assert!(json.contains("\"HydroSnap API\""));
    }
}
