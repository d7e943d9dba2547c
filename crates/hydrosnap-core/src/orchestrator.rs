//! QR validation pipeline.
//!
//! `validate_qr` runs a scanned payload through the format pre-check, the
//! codec, the descriptor validator, the activity check and the geofence,
//! stopping at the first failure. Failures before a descriptor exists are
//! hard (no site data); activity and distance failures are soft and still
//! carry the descriptor so the caller can explain what went wrong.

use serde::Serialize;
use tracing::{debug, info};
use utoipa::ToSchema;

use crate::cache::LocationCache;
use crate::codec::{is_recognized_format, DecodeError, PayloadCodec};
use crate::descriptor::{DescriptorValidator, SiteDescriptor, ValidationError};
use crate::error::HydroSnapError;
use crate::geodesy;
use crate::location::{LocationError, PermissionStatus};
use crate::types::Coordinate;

/// Result of validating a scanned QR payload.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationOutcome {
    /// The payload is not a token, a plain site record or a site code.
    InvalidFormat,
    /// The payload could not be decoded.
    DecodeFailed(DecodeError),
    /// The decoded record is not a valid site.
    ValidationFailed(ValidationError),
    /// The site exists but is not in service.
    SiteInactive {
        /// The decoded site.
        descriptor: SiteDescriptor,
    },
    /// The user is outside the site's geofence.
    OutOfRange {
        /// The decoded site.
        descriptor: SiteDescriptor,
        /// Distance from the user to the site, in meters.
        distance: f64,
    },
    /// The user is at an active site.
    Validated {
        /// The decoded site.
        descriptor: SiteDescriptor,
        /// Distance from the user to the site, in meters.
        distance: f64,
    },
}

/// A site the user has been verified at.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct Verified {
    /// The verified site.
    pub descriptor: SiteDescriptor,
    /// Distance from the user to the site, in meters.
    pub distance_meters: f64,
}

impl ValidationOutcome {
    /// Whether the user is verified at the site.
    #[must_use]
    pub const fn is_validated(&self) -> bool {
        matches!(self, Self::Validated { .. })
    }

    /// The decoded site, for outcomes that produced one.
    #[must_use]
    pub const fn descriptor(&self) -> Option<&SiteDescriptor> {
        match self {
            Self::SiteInactive { descriptor }
            | Self::OutOfRange { descriptor, .. }
            | Self::Validated { descriptor, .. } => Some(descriptor),
            Self::InvalidFormat | Self::DecodeFailed(_) | Self::ValidationFailed(_) => None,
        }
    }

    /// Distance to the site, for outcomes that computed one.
    #[must_use]
    pub const fn distance(&self) -> Option<f64> {
        match self {
            Self::OutOfRange { distance, .. } | Self::Validated { distance, .. } => Some(*distance),
            _ => None,
        }
    }

    /// Short machine-readable name of the outcome.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::InvalidFormat => "invalid_format",
            Self::DecodeFailed(_) => "decode_failed",
            Self::ValidationFailed(_) => "validation_failed",
            Self::SiteInactive { .. } => "site_inactive",
            Self::OutOfRange { .. } => "out_of_range",
            Self::Validated { .. } => "validated",
        }
    }

    /// Convert into a `Result`, turning every failure into a [`HydroSnapError`].
    ///
    /// # Errors
    ///
    /// Returns the error matching any outcome other than
    /// [`ValidationOutcome::Validated`].
    pub fn into_result(self) -> Result<Verified, HydroSnapError> {
        match self {
            Self::Validated {
                descriptor,
                distance,
            } => Ok(Verified {
                descriptor,
                distance_meters: distance,
            }),
            Self::InvalidFormat => Err(HydroSnapError::InvalidQrFormat),
            Self::DecodeFailed(e) => Err(HydroSnapError::Decode(e)),
            Self::ValidationFailed(e) => Err(HydroSnapError::Validation(e)),
            Self::SiteInactive { descriptor } => Err(HydroSnapError::SiteInactive {
                site_id: descriptor.site_id,
            }),
            Self::OutOfRange {
                descriptor,
                distance,
            } => Err(HydroSnapError::OutOfRange {
                site_id: descriptor.site_id,
                distance_meters: distance,
                radius_meters: descriptor.geofence_radius,
            }),
        }
    }
}

/// Validates scanned QR payloads against the user's position.
#[derive(Debug, Clone, Default)]
pub struct QrValidationService {
    codec: PayloadCodec,
    validator: DescriptorValidator,
}

impl QrValidationService {
    /// Create a service from a codec and a validator.
    #[must_use]
    pub const fn new(codec: PayloadCodec, validator: DescriptorValidator) -> Self {
        Self { codec, validator }
    }

    /// The codec in use.
    #[must_use]
    pub const fn codec(&self) -> &PayloadCodec {
        &self.codec
    }

    /// Cheap shape check a UI can run before attempting a full validation.
    #[must_use]
    pub fn precheck(&self, raw: &str) -> bool {
        is_recognized_format(raw)
    }

    /// Validate `raw` for a user standing at `user_location`.
    #[must_use]
    pub fn validate_qr(&self, raw: &str, user_location: Coordinate) -> ValidationOutcome {
        if !is_recognized_format(raw) {
            debug!("QR payload rejected by format pre-check");
            return ValidationOutcome::InvalidFormat;
        }

        let record = match self.codec.decode(raw) {
            Ok(record) => record,
            Err(e) => {
                debug!(error = %e, "QR payload could not be decoded");
                return ValidationOutcome::DecodeFailed(e);
            }
        };

        let descriptor = match self.validator.validate(&record) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                debug!(error = %e, "QR payload failed validation");
                return ValidationOutcome::ValidationFailed(e);
            }
        };

        if !descriptor.is_active {
            info!(site_id = %descriptor.site_id, "Scanned site is inactive");
            return ValidationOutcome::SiteInactive { descriptor };
        }

        let distance = geodesy::distance(user_location, descriptor.coordinates);
        if !geodesy::within_radius(distance, descriptor.geofence_radius) {
            info!(
                site_id = %descriptor.site_id,
                distance_meters = distance,
                radius_meters = descriptor.geofence_radius,
                "User outside site geofence"
            );
            return ValidationOutcome::OutOfRange {
                descriptor,
                distance,
            };
        }

        info!(site_id = %descriptor.site_id, distance_meters = distance, "Site presence verified");
        ValidationOutcome::Validated {
            descriptor,
            distance,
        }
    }

    /// Validate `raw` using the best position the cache can offer.
    ///
    /// The format pre-check runs before any location work.
    ///
    /// # Errors
    ///
    /// - [`LocationError::PermissionDenied`] if location access is not granted
    /// - [`LocationError::Unavailable`] if no position could be obtained
    pub async fn validate_qr_here(
        &self,
        raw: &str,
        cache: &LocationCache,
    ) -> Result<ValidationOutcome, LocationError> {
        if !is_recognized_format(raw) {
            return Ok(ValidationOutcome::InvalidFormat);
        }

        match cache.get_fast().await {
            Some(position) => Ok(self.validate_qr(raw, position)),
            None => match cache.permission().await {
                PermissionStatus::Granted => Err(LocationError::Unavailable(
                    "no location fix available".to_string(),
                )),
                PermissionStatus::Denied | PermissionStatus::Undetermined => {
                    Err(LocationError::PermissionDenied)
                }
            },
        }
    }
}
