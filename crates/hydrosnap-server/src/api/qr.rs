//! QR validation API endpoints.
//!
//! The client scans the plate mounted at a monitoring site and posts the raw
//! text here. A cheap pre-check lets the scanner reject foreign codes before
//! any location work; validation decodes the plate and checks the operator's
//! position against the site geofence.

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use hydrosnap_core::{Coordinate, SiteDescriptor, ValidationOutcome};
use serde::{Deserialize, Serialize};
use tracing::debug;
use utoipa::ToSchema;

use crate::api::error::{ApiError, ApiResult, ErrorResponse};
use crate::state::SharedState;

/// Creates the QR router with all endpoints.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/precheck", post(precheck))
        .route("/validate", post(validate))
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// Request to pre-check a scanned payload.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[schema(example = json!({ "raw": "QR-DEL-YM-001" }))]
pub struct PrecheckRequest {
    /// Raw text read from the QR plate.
    #[schema(example = "QR-DEL-YM-001")]
    pub raw: String,
}

/// Result of the format pre-check.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PrecheckResponse {
    /// Whether the payload looks like a HydroSnap plate.
    #[schema(example = true)]
    pub recognized: bool,
}

/// Request to validate a scanned payload at the operator's position.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[schema(example = json!({
    "raw": "gAAAAABl...",
    "user_location": {"lat": 28.6140, "lng": 77.2091}
}))]
pub struct ValidateRequest {
    /// Raw text read from the QR plate.
    pub raw: String,

    /// Operator position. When omitted, the cached device position is used.
    #[serde(default)]
    pub user_location: Option<Coordinate>,
}

/// Validation result document.
///
/// Every outcome is returned with status 200; `validated` tells the client
/// whether the reading may proceed and `error` explains why not.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "outcome": "out_of_range",
    "validated": false,
    "site": null,
    "distance_meters": 12034.5,
    "error": {
        "error": "OUT_OF_RANGE",
        "message": "You are 12035 m from site CWC-DEL-001; move within 125 m to continue.",
        "details": null
    }
}))]
pub struct ValidationResponse {
    /// Outcome kind: `invalid_format`, `decode_failed`, `validation_failed`,
    /// `site_inactive`, `out_of_range` or `validated`.
    #[schema(example = "validated")]
    pub outcome: String,

    /// Whether the operator is verified at the site.
    pub validated: bool,

    /// The decoded site, when decoding succeeded.
    #[schema(nullable)]
    pub site: Option<SiteDescriptor>,

    /// Distance from the operator to the site, in meters.
    #[schema(nullable)]
    pub distance_meters: Option<f64>,

    /// Why validation failed.
    #[schema(nullable)]
    pub error: Option<ErrorResponse>,
}

impl From<ValidationOutcome> for ValidationResponse {
    fn from(outcome: ValidationOutcome) -> Self {
        let kind = outcome.kind().to_string();
        let validated = outcome.is_validated();
        let site = outcome.descriptor().cloned();
        let distance_meters = outcome.distance();
        let error = outcome.into_result().err().map(|err| ErrorResponse {
            error: err.error_code().to_string(),
            message: err.to_string(),
            details: None,
        });

        Self {
            outcome: kind,
            validated,
            site,
            distance_meters,
            error,
        }
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Pre-check a scanned payload.
#[utoipa::path(
    post,
    path = "/api/qr/precheck",
    tag = "qr",
    operation_id = "precheckQr",
    summary = "Check whether a scan is a HydroSnap plate",
    description = "Cheap shape check run before any decoding or location work. \
        Accepts encrypted site tokens, plain JSON site records carrying the \
        required keys, and printed site codes.",
    request_body = PrecheckRequest,
    responses(
        (status = 200, description = "Pre-check completed", body = PrecheckResponse)
    )
)]
pub async fn precheck(
    State(state): State<SharedState>,
    Json(request): Json<PrecheckRequest>,
) -> Json<PrecheckResponse> {
    Json(PrecheckResponse {
        recognized: state.validation.precheck(&request.raw),
    })
}

/// Validate a scanned payload at the operator's position.
#[utoipa::path(
    post,
    path = "/api/qr/validate",
    tag = "qr",
    operation_id = "validateQr",
    summary = "Verify presence at a monitoring site",
    description = "Decodes the plate, validates the site record and checks the \
        operator's distance against the site geofence. Uses the cached device \
        position when `user_location` is omitted.",
    request_body = ValidateRequest,
    responses(
        (status = 200, description = "Validation completed", body = ValidationResponse),
        (status = 400, description = "Invalid coordinate", body = ErrorResponse),
        (status = 403, description = "Location permission denied", body = ErrorResponse),
        (status = 503, description = "No location fix available", body = ErrorResponse)
    )
)]
pub async fn validate(
    State(state): State<SharedState>,
    Json(request): Json<ValidateRequest>,
) -> ApiResult<Json<ValidationResponse>> {
    let outcome = match request.user_location {
        Some(position) => {
            if !position.is_valid() {
                return Err(ApiError::bad_request(
                    "INVALID_COORDINATE",
                    format!("Coordinate out of range: {position}"),
                ));
            }
            state.validation.validate_qr(&request.raw, position)
        }
        None => {
            state
                .validation
                .validate_qr_here(&request.raw, &state.cache)
                .await?
        }
    };

    debug!(outcome = outcome.kind(), "QR validation finished");
    Ok(Json(ValidationResponse::from(outcome)))
}
