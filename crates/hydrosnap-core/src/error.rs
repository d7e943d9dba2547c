//! Unified error types for the hydrosnap core library.
//!
//! This module provides a unified error type [`HydroSnapError`] that covers all
//! failure modes across the core. Each module also has its own specific error
//! types (`DecodeError`, `ValidationError`, `LocationError`, `StartError`,
//! `StorageError`, `ConfigError`) for internal use.
//!
//! # Design Principles
//!
//! - **Distinct taxonomy**: format, decode, validation, geofence, location and
//!   session failures never collapse into one another
//! - **Actionable messages**: Error messages tell the operator what to do next
//! - **HTTP-ready**: Error types include HTTP status codes and error codes
//!
//! # Example
//!
//! ```rust
//! use hydrosnap_core::error::{HydroSnapError, Result};
//! use hydrosnap_core::codec::is_recognized_format;
//!
//! fn precheck(raw: &str) -> Result<()> {
//!     if !is_recognized_format(raw) {
//!         return Err(HydroSnapError::InvalidQrFormat);
//!     }
//!     Ok(())
//! }
//!
//! assert!(precheck("not a code").unwrap_err().is_format_error());
//! ```

use thiserror::Error;

use crate::codec::{DecodeError, KeyError};
use crate::descriptor::ValidationError;
use crate::location::LocationError;
use crate::monitor::StartError;

/// The unified error type for all hydrosnap operations.
#[derive(Debug, Error)]
pub enum HydroSnapError {
    // =========================================================================
    // QR ERRORS
    // =========================================================================
    /// The scanned text is not a HydroSnap QR code.
    #[error("Not a HydroSnap QR code. Rescan the site's QR plate.")]
    InvalidQrFormat,

    /// The QR code was recognized but could not be read.
    #[error("Invalid QR code: {0}")]
    Decode(#[from] DecodeError),

    /// The QR code decoded to incomplete or inconsistent site data.
    #[error("Invalid site data: {0}")]
    Validation(#[from] ValidationError),

    /// The configured QR key material is unusable.
    #[error("QR key unavailable: {0}")]
    InvalidKey(#[from] KeyError),

    /// A QR token could not be issued.
    #[error("Failed to issue QR token: {0}")]
    TokenIssueFailed(String),

    // =========================================================================
    // GEOFENCE ERRORS
    // =========================================================================
    /// The site is registered but out of service.
    #[error("Site {site_id} is inactive. Readings cannot be submitted for it.")]
    SiteInactive {
        /// The inactive site.
        site_id: String,
    },

    /// The user is outside the site's geofence.
    #[error("You are {distance_meters:.0} m from site {site_id}; move within {radius_meters:.0} m to continue.")]
    OutOfRange {
        /// The site scanned.
        site_id: String,
        /// Distance from the user to the site.
        distance_meters: f64,
        /// Geofence radius of the site.
        radius_meters: f64,
    },

    // =========================================================================
    // LOCATION ERRORS
    // =========================================================================
    /// The device position could not be determined.
    #[error("{0}")]
    Location(#[from] LocationError),

    // =========================================================================
    // SESSION ERRORS
    // =========================================================================
    /// A monitoring session could not be started.
    #[error("{0}")]
    Session(#[from] StartError),

    /// No monitoring session is running.
    #[error("No geofence monitoring session is active")]
    NoActiveSession,

    // =========================================================================
    // CONFIGURATION ERRORS
    // =========================================================================
    /// The configuration file was not found at the expected path.
    #[error("Configuration file not found at: {0}")]
    ConfigNotFound(String),

    /// The configuration could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    ConfigParseError(String),

    /// The configuration contains invalid values.
    #[error("Configuration validation failed: {0}")]
    ConfigValidationError(String),

    // =========================================================================
    // PERSISTENCE & I/O ERRORS
    // =========================================================================
    /// An error occurred while persisting or reading data.
    #[error("Persistence error: {0}")]
    PersistenceError(String),

    /// A low-level I/O error occurred.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// A specialized [`Result`] type for hydrosnap operations.
pub type Result<T> = std::result::Result<T, HydroSnapError>;

impl HydroSnapError {
    /// Returns `true` if the scanned text was rejected before decoding.
    #[inline]
    #[must_use]
    pub const fn is_format_error(&self) -> bool {
        matches!(self, Self::InvalidQrFormat)
    }

    /// Returns `true` if this error concerns the QR code itself.
    #[inline]
    #[must_use]
    pub const fn is_qr_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidQrFormat
                | Self::Decode(_)
                | Self::Validation(_)
                | Self::InvalidKey(_)
                | Self::TokenIssueFailed(_)
        )
    }

    /// Returns `true` for soft failures at a valid site.
    #[inline]
    #[must_use]
    pub const fn is_geofence_error(&self) -> bool {
        matches!(self, Self::SiteInactive { .. } | Self::OutOfRange { .. })
    }

    /// Returns `true` if the device position is unknown.
    #[inline]
    #[must_use]
    pub const fn is_location_error(&self) -> bool {
        matches!(self, Self::Location(_))
    }

    /// Returns `true` if this error concerns monitoring session state.
    #[inline]
    #[must_use]
    pub const fn is_session_error(&self) -> bool {
        matches!(self, Self::Session(_) | Self::NoActiveSession)
    }

    /// Returns `true` if this error is related to configuration.
    #[inline]
    #[must_use]
    pub const fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::ConfigNotFound(_) | Self::ConfigParseError(_) | Self::ConfigValidationError(_)
        )
    }

    /// Returns `true` if this error is related to I/O or persistence.
    #[inline]
    #[must_use]
    pub const fn is_io_error(&self) -> bool {
        matches!(self, Self::PersistenceError(_) | Self::IoError(_))
    }

    /// Returns `true` if the user can resolve this by rescanning, moving or
    /// waiting for a fix.
    #[inline]
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::InvalidQrFormat
                | Self::OutOfRange { .. }
                | Self::Location(LocationError::Timeout { .. } | LocationError::Unavailable(_))
        )
    }

    /// Returns an HTTP-appropriate status code for this error.
    #[must_use]
    pub const fn http_status_code(&self) -> u16 {
        match self {
            // 400 Bad Request - malformed input
            Self::InvalidQrFormat => 400,

            // 403 Forbidden - understood but refused
            Self::SiteInactive { .. }
            | Self::OutOfRange { .. }
            | Self::Location(LocationError::PermissionDenied)
            | Self::Session(StartError::PermissionUnavailable(_)) => 403,

            // 404 Not Found
            Self::ConfigNotFound(_) | Self::NoActiveSession => 404,

            // 409 Conflict
            Self::Session(StartError::AlreadyActive { .. }) => 409,

            // 422 Unprocessable Entity - semantic errors
            Self::Decode(_)
            | Self::Validation(_)
            | Self::ConfigParseError(_)
            | Self::ConfigValidationError(_) => 422,

            // 500 Internal Server Error - server-side issues
            Self::InvalidKey(_)
            | Self::TokenIssueFailed(_)
            | Self::PersistenceError(_)
            | Self::IoError(_) => 500,

            // 502/503/504 - location provider trouble
            Self::Location(LocationError::Provider(_)) => 502,
            Self::Location(LocationError::Unavailable(_)) => 503,
            Self::Location(LocationError::Timeout { .. }) => 504,
        }
    }

    /// Returns a machine-readable error code for API responses.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidQrFormat => "INVALID_QR_FORMAT",
            Self::Decode(DecodeError::Malformed) => "QR_MALFORMED",
            Self::Decode(DecodeError::DecryptionFailed) => "QR_DECRYPTION_FAILED",
            Self::Decode(DecodeError::InvalidStructure(_)) => "QR_INVALID_STRUCTURE",
            Self::Decode(DecodeError::NoSiteData(_)) => "QR_NO_SITE_DATA",
            Self::Validation(ValidationError::MissingField(_)) => "SITE_MISSING_FIELD",
            Self::Validation(ValidationError::InvalidField { .. }) => "SITE_INVALID_FIELD",
            Self::Validation(ValidationError::IntegrityMismatch) => "SITE_INTEGRITY_MISMATCH",
            Self::Validation(ValidationError::Expired { .. }) => "QR_EXPIRED",
            Self::InvalidKey(_) => "QR_KEY_UNAVAILABLE",
            Self::TokenIssueFailed(_) => "TOKEN_ISSUE_FAILED",
            Self::SiteInactive { .. } => "SITE_INACTIVE",
            Self::OutOfRange { .. } => "OUT_OF_RANGE",
            Self::Location(LocationError::PermissionDenied) => "LOCATION_PERMISSION_DENIED",
            Self::Location(LocationError::Timeout { .. }) => "LOCATION_TIMEOUT",
            Self::Location(LocationError::Unavailable(_)) => "LOCATION_UNAVAILABLE",
            Self::Location(LocationError::Provider(_)) => "LOCATION_PROVIDER_ERROR",
            Self::Session(StartError::AlreadyActive { .. }) => "MONITORING_ALREADY_ACTIVE",
            Self::Session(StartError::PermissionUnavailable(_)) => "MONITORING_PERMISSION_UNAVAILABLE",
            Self::NoActiveSession => "NO_ACTIVE_SESSION",
            Self::ConfigNotFound(_) => "CONFIG_NOT_FOUND",
            Self::ConfigParseError(_) => "CONFIG_PARSE_ERROR",
            Self::ConfigValidationError(_) => "CONFIG_VALIDATION_ERROR",
            Self::PersistenceError(_) => "PERSISTENCE_ERROR",
            Self::IoError(_) => "IO_ERROR",
        }
    }
}

// =============================================================================
// CONVERSIONS FROM MODULE-SPECIFIC ERRORS
// =============================================================================

impl From<crate::config::ConfigError> for HydroSnapError {
    fn from(err: crate::config::ConfigError) -> Self {
        use crate::config::ConfigError;
        match err {
            ConfigError::NotFound(path) => Self::ConfigNotFound(path),
            ConfigError::WriteError { path, source } => {
                Self::PersistenceError(format!("Failed to write {path}: {source}"))
            }
            ConfigError::ParseError(e) => Self::ConfigParseError(e.to_string()),
            ConfigError::SerializeError(e) => Self::ConfigParseError(e.to_string()),
            ConfigError::ValidationError { field, message } => {
                Self::ConfigValidationError(format!("{field}: {message}"))
            }
            ConfigError::MultipleValidationErrors(errors) => {
                let messages: Vec<String> = errors.into_iter().map(|e| e.to_string()).collect();
                Self::ConfigValidationError(messages.join("; "))
            }
            ConfigError::NoConfigDir => {
                Self::ConfigNotFound("no platform configuration directory".to_string())
            }
        }
    }
}

impl From<crate::storage::StorageError> for HydroSnapError {
    fn from(err: crate::storage::StorageError) -> Self {
        Self::PersistenceError(err.to_string())
    }
}

impl From<crate::issuer::IssueError> for HydroSnapError {
    fn from(err: crate::issuer::IssueError) -> Self {
        Self::TokenIssueFailed(err.to_string())
    }
}

// =============================================================================
// TESTS
// =============================================================================
