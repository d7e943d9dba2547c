//! Site descriptor validation.
//!
//! Turns a decoded [`RawSiteRecord`] into an immutable [`SiteDescriptor`].
//! Required fields are never defaulted; optional display fields are.
//!
//! Two checks go beyond field presence when the record carries the data
//! for them:
//!
//! - **Integrity**: `validationHash` must equal the first 16 hex characters
//!   of `sha256(siteId ‖ name ‖ lat ‖ lng)`
//! - **Expiry**: `expiresAt` must lie in the future

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use utoipa::ToSchema;

use crate::codec::RawSiteRecord;
use crate::types::Coordinate;

/// Site type used when the payload does not name one.
pub const DEFAULT_SITE_TYPE: &str = "river";

/// Operating organization used when the payload does not name one.
pub const DEFAULT_ORGANIZATION: &str = "Central Water Commission";

/// Geofence radius used when the payload does not carry one.
pub const DEFAULT_GEOFENCE_RADIUS_METERS: f64 = 125.0;

/// Number of hex characters kept from the integrity digest.
pub const INTEGRITY_HASH_LEN: usize = 16;

/// Errors returned by [`DescriptorValidator::validate`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    /// A required field is absent, empty, non-numeric or (for levels) zero.
    #[error("Required field '{0}' is missing or invalid")]
    MissingField(String),

    /// An optional field is present but malformed.
    #[error("Field '{field}' is invalid: {reason}")]
    InvalidField {
        /// Dotted field name.
        field: String,
        /// What is wrong with it.
        reason: String,
    },

    /// The embedded validation hash does not match the site data.
    #[error("Site data integrity check failed; the QR code may have been tampered with")]
    IntegrityMismatch,

    /// The QR code is past its expiry date.
    #[error("QR code expired at {expires_at}")]
    Expired {
        /// When the code stopped being valid.
        expires_at: DateTime<Utc>,
    },
}

/// Alert thresholds for a site, in the unit of submitted readings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({"safe": 200.0, "warning": 203.5, "danger": 205.0}))]
pub struct Levels {
    /// Level below which the site is considered safe.
    pub safe: f64,
    /// Level at which a warning is raised.
    pub warning: f64,
    /// Level at which the site is in danger.
    pub danger: f64,
}

/// A validated monitoring site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct SiteDescriptor {
    /// Stable unique site identifier.
    #[schema(example = "CWC-DEL-001")]
    pub site_id: String,

    /// Display name.
    #[schema(example = "Yamuna at Old Railway Bridge")]
    pub name: String,

    /// Free-form location description.
    pub location: String,

    /// River the site is on.
    pub river_name: String,

    /// State the site is in.
    pub state: String,

    /// District the site is in.
    pub district: String,

    /// Site type, `"river"` unless stated otherwise.
    #[schema(example = "river")]
    pub site_type: String,

    /// Operating organization.
    pub organization: String,

    /// Fence center.
    pub coordinates: Coordinate,

    /// Alert thresholds.
    pub levels: Levels,

    /// Geofence radius in meters; `0` disables the geofence.
    #[schema(example = 125.0)]
    pub geofence_radius: f64,

    /// Whether the site currently accepts readings.
    pub is_active: bool,

    /// Printed site code, if the payload carries one.
    #[schema(nullable, example = "QR-DEL-YM-001")]
    pub qr_code: Option<String>,

    /// When the QR payload was issued.
    #[schema(nullable)]
    pub generated_at: Option<DateTime<Utc>>,

    /// When the QR payload stops being valid.
    #[schema(nullable)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl SiteDescriptor {
    /// Whether the geofence is enforced for this site.
    #[must_use]
    pub fn geofence_enabled(&self) -> bool {
        self.geofence_radius > 0.0
    }

    /// Whether `safe <= warning <= danger` holds.
    ///
    /// Not enforced during validation; some sites use inverted scales.
    #[must_use]
    pub fn levels_ordered(&self) -> bool {
        self.levels.safe <= self.levels.warning && self.levels.warning <= self.levels.danger
    }
}

/// Validates raw records into [`SiteDescriptor`]s.
#[derive(Debug, Clone, Copy)]
pub struct DescriptorValidator {
    verify_integrity: bool,
    enforce_expiry: bool,
    default_radius: f64,
}

impl Default for DescriptorValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl DescriptorValidator {
    /// A validator with every check enabled and the default radius.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            verify_integrity: true,
            enforce_expiry: true,
            default_radius: DEFAULT_GEOFENCE_RADIUS_METERS,
        }
    }

    /// Toggle the `validationHash` check.
    #[must_use]
    pub const fn with_integrity_check(mut self, enabled: bool) -> Self {
        self.verify_integrity = enabled;
        self
    }

    /// Toggle the `expiresAt` check.
    #[must_use]
    pub const fn with_expiry_check(mut self, enabled: bool) -> Self {
        self.enforce_expiry = enabled;
        self
    }

    /// Radius applied when a record carries no `geofenceRadius`.
    #[must_use]
    pub const fn with_default_radius(mut self, meters: f64) -> Self {
        self.default_radius = meters;
        self
    }

    /// Validate a record against the current time.
    ///
    /// # Errors
    ///
    /// See [`ValidationError`].
    pub fn validate(&self, record: &RawSiteRecord) -> Result<SiteDescriptor, ValidationError> {
        self.validate_at(record, Utc::now())
    }

    /// Validate a record against an explicit clock reading.
    ///
    /// Checks run in a fixed order and the first failure wins: required
    /// fields, then `validationHash`, then `expiresAt`, then the optional
    /// fields. `isActive` is only read in that last step, so an inactive
    /// site with a tampered hash or a lapsed expiry is reported as that
    /// error rather than as inactive.
    ///
    /// # Errors
    ///
    /// See [`ValidationError`].
    pub fn validate_at(
        &self,
        record: &RawSiteRecord,
        now: DateTime<Utc>,
    ) -> Result<SiteDescriptor, ValidationError> {
        let site_id = required_string(record, "siteId")?;
        let name = required_string(record, "name")?;
        let lat = required_number(record, "coordinates.lat", false)?;
        let lng = required_number(record, "coordinates.lng", false)?;
        let levels = Levels {
            safe: required_number(record, "levels.safe", true)?,
            warning: required_number(record, "levels.warning", true)?,
            danger: required_number(record, "levels.danger", true)?,
        };

        if self.verify_integrity {
            if let Some(stored) = optional_string(record, "validationHash")? {
                if !stored.is_empty() && stored != record_integrity_hash(record) {
                    return Err(ValidationError::IntegrityMismatch);
                }
            }
        }

        let expires_at = optional_timestamp(record, "expiresAt")?;
        if self.enforce_expiry {
            if let Some(expires_at) = expires_at {
                if expires_at <= now {
                    return Err(ValidationError::Expired { expires_at });
                }
            }
        }

        Ok(SiteDescriptor {
            site_id,
            name,
            location: optional_string(record, "location")?.unwrap_or_default(),
            river_name: optional_string(record, "riverName")?.unwrap_or_default(),
            state: optional_string(record, "state")?.unwrap_or_default(),
            district: optional_string(record, "district")?.unwrap_or_default(),
            site_type: optional_string(record, "siteType")?
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| DEFAULT_SITE_TYPE.to_string()),
            organization: optional_string(record, "organization")?
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| DEFAULT_ORGANIZATION.to_string()),
            coordinates: Coordinate::new(lat, lng),
            levels,
            geofence_radius: self.geofence_radius(record)?,
            is_active: is_active(record)?,
            qr_code: optional_string(record, "qrCode")?,
            generated_at: optional_timestamp(record, "generatedAt")?,
            expires_at,
        })
    }

    fn geofence_radius(&self, record: &RawSiteRecord) -> Result<f64, ValidationError> {
        match present(record, "geofenceRadius") {
            None => Ok(self.default_radius),
            Some(value) => match number_of(value) {
                Some(radius) if radius >= 0.0 => Ok(radius),
                _ => Err(invalid("geofenceRadius", "must be a non-negative number")),
            },
        }
    }
}

/// Integrity hash over the identifying fields of a site.
///
/// Each part is rendered the way the issuing tool renders it before
/// concatenation, so the digest matches tokens issued elsewhere.
#[must_use]
pub fn integrity_hash(site_id: &str, name: &str, lat: &Value, lng: &Value) -> String {
    let input = format!("{site_id}{name}{}{}", render_part(lat), render_part(lng));
    let digest = format!("{:x}", Sha256::digest(input.as_bytes()));
    digest[..INTEGRITY_HASH_LEN].to_string()
}

fn record_integrity_hash(record: &RawSiteRecord) -> String {
    let null = Value::Null;
    let part = |path| render_part(record.get(path).unwrap_or(&null));
    integrity_hash(
        &part("siteId"),
        &part("name"),
        record.get("coordinates.lat").unwrap_or(&null),
        record.get("coordinates.lng").unwrap_or(&null),
    )
}

fn render_part(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) if n.is_f64() => n.as_f64().map_or_else(|| n.to_string(), render_float),
        other => other.to_string(),
    }
}

/// Render a float with a trailing `.0` when it is integral (`77.0`, not `77`).
fn render_float(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e16 {
        format!("{value:.1}")
    } else {
        format!("{value}")
    }
}

fn present<'a>(record: &'a RawSiteRecord, field: &str) -> Option<&'a Value> {
    record.get(field).filter(|v| !v.is_null())
}

fn invalid(field: &str, reason: &str) -> ValidationError {
    ValidationError::InvalidField {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

fn number_of(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    number.is_finite().then_some(number)
}

fn required_string(record: &RawSiteRecord, field: &str) -> Result<String, ValidationError> {
    let value = match present(record, field) {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    };
    if value.is_empty() {
        return Err(ValidationError::MissingField(field.to_string()));
    }
    Ok(value)
}

fn required_number(
    record: &RawSiteRecord,
    field: &str,
    reject_zero: bool,
) -> Result<f64, ValidationError> {
    match present(record, field).and_then(number_of) {
        Some(n) if !(reject_zero && n == 0.0) => Ok(n),
        _ => Err(ValidationError::MissingField(field.to_string())),
    }
}

fn optional_string(record: &RawSiteRecord, field: &str) -> Result<Option<String>, ValidationError> {
    match present(record, field) {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.trim().to_string())),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(_) => Err(invalid(field, "must be a string")),
    }
}

fn is_active(record: &RawSiteRecord) -> Result<bool, ValidationError> {
    match present(record, "isActive") {
        None => Ok(true),
        Some(Value::Bool(b)) => Ok(*b),
        Some(Value::String(s)) if s.eq_ignore_ascii_case("true") => Ok(true),
        Some(Value::String(s)) if s.eq_ignore_ascii_case("false") => Ok(false),
        Some(_) => Err(invalid("isActive", "must be a boolean")),
    }
}

fn optional_timestamp(
    record: &RawSiteRecord,
    field: &str,
) -> Result<Option<DateTime<Utc>>, ValidationError> {
    let Some(raw) = optional_string(record, field)? else {
        return Ok(None);
    };
    if raw.is_empty() {
        return Ok(None);
    }
    parse_timestamp(&raw)
        .map(Some)
        .ok_or_else(|| invalid(field, "must be an ISO-8601 timestamp"))
}

/// Parse RFC 3339, or a naive ISO-8601 timestamp taken as UTC.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}
