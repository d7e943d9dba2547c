//! Encrypted QR token issuing.
//!
//! The inverse of [`crate::codec`]: packs a site into the compact payload
//! schema, stamps issue/expiry times and the integrity hash, then
//! compresses and encrypts it into a Fernet token ready for printing.

use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

use crate::codec::{RawSiteRecord, SiteKey};
use crate::descriptor::{integrity_hash, SiteDescriptor};

/// Default validity of an issued token.
pub const DEFAULT_TOKEN_VALIDITY_DAYS: i64 = 365;

/// Errors raised while issuing a token.
#[derive(Debug, Error)]
pub enum IssueError {
    /// Compressing the payload failed.
    #[error("Failed to compress QR payload: {0}")]
    Compression(#[from] std::io::Error),
}

/// Issues encrypted QR tokens for sites.
#[derive(Debug, Clone)]
pub struct TokenIssuer {
    key: SiteKey,
    validity: Duration,
}

impl TokenIssuer {
    /// Create an issuer with the default one-year validity.
    #[must_use]
    pub fn new(key: SiteKey) -> Self {
        Self {
            key,
            validity: Duration::days(DEFAULT_TOKEN_VALIDITY_DAYS),
        }
    }

    /// Override how long issued tokens stay valid.
    #[must_use]
    pub const fn with_validity(mut self, validity: Duration) -> Self {
        self.validity = validity;
        self
    }

    /// Build the payload record for `site` as issued at `issued_at`.
    #[must_use]
    pub fn record_for(&self, site: &SiteDescriptor, issued_at: DateTime<Utc>) -> RawSiteRecord {
        let lat = json!(site.coordinates.lat);
        let lng = json!(site.coordinates.lng);
        let hash = integrity_hash(&site.site_id, &site.name, &lat, &lng);

        let mut record = RawSiteRecord::default();
        record.insert("siteId", json!(site.site_id));
        record.insert("name", json!(site.name));
        record.insert("coordinates", json!({"lat": lat, "lng": lng}));
        record.insert(
            "levels",
            json!({
                "safe": site.levels.safe,
                "warning": site.levels.warning,
                "danger": site.levels.danger,
            }),
        );
        record.insert("geofenceRadius", json!(site.geofence_radius));
        record.insert("isActive", Value::Bool(site.is_active));

        for (key, value) in [
            ("location", &site.location),
            ("riverName", &site.river_name),
            ("state", &site.state),
            ("district", &site.district),
            ("siteType", &site.site_type),
            ("organization", &site.organization),
        ] {
            if !value.is_empty() {
                record.insert(key, json!(value));
            }
        }
        if let Some(code) = &site.qr_code {
            record.insert("qrCode", json!(code));
        }

        record.insert("generatedAt", json!(issued_at.to_rfc3339()));
        record.insert(
            "expiresAt",
            json!((issued_at + self.validity).to_rfc3339()),
        );
        record.insert("validationHash", json!(hash));
        record
    }

    /// Issue a token for `site`, valid from now.
    ///
    /// # Errors
    ///
    /// Returns [`IssueError::Compression`] if the payload cannot be compressed.
    pub fn issue(&self, site: &SiteDescriptor) -> Result<String, IssueError> {
        self.issue_at(site, Utc::now())
    }

    /// Issue a token for `site` with an explicit issue time.
    ///
    /// # Errors
    ///
    /// Returns [`IssueError::Compression`] if the payload cannot be compressed.
    pub fn issue_at(
        &self,
        site: &SiteDescriptor,
        issued_at: DateTime<Utc>,
    ) -> Result<String, IssueError> {
        let payload = self.record_for(site, issued_at).to_compact_json();
        let token = self.key.seal(payload.as_bytes())?;
        debug!(
            site_id = %site.site_id,
            payload_bytes = payload.len(),
            token_len = token.len(),
            "Issued QR token"
        );
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::PayloadCodec;
    use crate::descriptor::{DescriptorValidator, Levels, ValidationError};
    use crate::types::Coordinate;

    fn site() -> SiteDescriptor {
        SiteDescriptor {
            site_id: "CWC-DEL-001".to_string(),
            name: "Yamuna at Old Railway Bridge".to_string(),
            location: "Old Delhi".to_string(),
            river_name: "Yamuna".to_string(),
            state: "Delhi".to_string(),
            district: String::new(),
            site_type: "river".to_string(),
            organization: "Central Water Commission".to_string(),
            coordinates: Coordinate::new(28.6139, 77.0),
            levels: Levels {
                safe: 200.0,
                warning: 203.5,
                danger: 205.0,
            },
            geofence_radius: 125.0,
            is_active: true,
            qr_code: Some("QR-DEL-YM-001".to_string()),
            generated_at: None,
            expires_at: None,
        }
    }

    fn key() -> SiteKey {
        SiteKey::derive("issuer-secret").unwrap()
    }

    #[test]
    fn test_issued_token_decodes_to_same_site() {
        let issued_at = Utc::now();
        let token = TokenIssuer::new(key()).issue_at(&site(), issued_at).unwrap();

        let record = PayloadCodec::with_key(key()).decode(&token).unwrap();
        let decoded = DescriptorValidator::default().validate(&record).unwrap();

        assert_eq!(decoded.site_id, "CWC-DEL-001");
        assert_eq!(decoded.coordinates, site().coordinates);
        assert_eq!(decoded.levels, site().levels);
        assert_eq!(decoded.district, "");
        assert_eq!(
            decoded.expires_at.map(|t| t.timestamp()),
            Some((issued_at + Duration::days(365)).timestamp())
        );
    }

    #[test]
    fn test_record_carries_integrity_hash() {
        let record = TokenIssuer::new(key()).record_for(&site(), Utc::now());
        let hash = record.get("validationHash").and_then(Value::as_str).unwrap();
        assert_eq!(hash.len(), 16);
        assert!(record.get("district").is_none());
    }

    #[test]
    fn test_short_validity_expires() {
        let issued_at = Utc::now() - Duration::days(2);
        let token = TokenIssuer::new(key())
            .with_validity(Duration::days(1))
            .issue_at(&site(), issued_at)
            .unwrap();

        let record = PayloadCodec::with_key(key()).decode(&token).unwrap();
        assert!(matches!(
            DescriptorValidator::default().validate(&record),
            Err(ValidationError::Expired { .. })
        ));
    }
}
