//! Shared types and OpenAPI schemas.
//!
//! This module contains the small value types that flow between the
//! geodesy, cache and monitoring modules.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// A WGS-84 position in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({"lat": 28.6139, "lng": 77.2090}))]
pub struct Coordinate {
    /// Latitude in degrees (-90 to 90).
    #[schema(example = 28.6139)]
    pub lat: f64,

    /// Longitude in degrees (-180 to 180).
    #[schema(example = 77.2090)]
    pub lng: f64,
}

impl Coordinate {
    /// Create a coordinate from latitude and longitude in degrees.
    #[must_use]
    pub const fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Returns `true` if both components are finite and inside their ranges.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }
}

impl std::fmt::Display for Coordinate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.6}, {:.6}", self.lat, self.lng)
    }
}

/// A single position fix produced by a location provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "lat": 28.6140,
    "lng": 77.2091,
    "accuracy_meters": 8.5,
    "captured_at": "2025-01-15T03:30:00Z"
}))]
pub struct LocationSample {
    /// Latitude in degrees.
    pub lat: f64,

    /// Longitude in degrees.
    pub lng: f64,

    /// Horizontal accuracy radius reported by the provider, in meters.
    #[schema(nullable)]
    pub accuracy_meters: Option<f64>,

    /// When the fix was taken (UTC).
    pub captured_at: DateTime<Utc>,
}

impl LocationSample {
    /// Create a sample captured now.
    #[must_use]
    pub fn now(coordinate: Coordinate, accuracy_meters: Option<f64>) -> Self {
        Self {
            lat: coordinate.lat,
            lng: coordinate.lng,
            accuracy_meters,
            captured_at: Utc::now(),
        }
    }

    /// The position of this sample.
    #[must_use]
    pub const fn coordinate(&self) -> Coordinate {
        Coordinate::new(self.lat, self.lng)
    }

    /// Age of the sample relative to `now`, clamped at zero.
    #[must_use]
    pub fn age_at(&self, now: DateTime<Utc>) -> chrono::Duration {
        (now - self.captured_at).max(chrono::Duration::zero())
    }
}

/// Accuracy tier requested from a location provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AccuracyTier {
    /// Coarse network positioning, fast and cheap.
    Low,
    /// Balanced power/accuracy.
    #[default]
    Balanced,
    /// Full GNSS fix.
    High,
}

impl std::fmt::Display for AccuracyTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Balanced => write!(f, "balanced"),
            Self::High => write!(f, "high"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coordinate_validity() {
        assert!(Coordinate::new(28.6139, 77.2090).is_valid());
        assert!(Coordinate::new(-90.0, 180.0).is_valid());
        assert!(!Coordinate::new(91.0, 0.0).is_valid());
        assert!(!Coordinate::new(0.0, -180.5).is_valid());
        assert!(!Coordinate::new(f64::NAN, 0.0).is_valid());
    }

    #[test]
    fn test_sample_age_never_negative() {
        let mut sample = LocationSample::now(Coordinate::new(1.0, 2.0), None);
        sample.captured_at = Utc::now() + chrono::Duration::seconds(30);
        assert_eq!(sample.age_at(Utc::now()), chrono::Duration::zero());
    }

    #[test]
    fn test_sample_serialization() {
        let sample = LocationSample::now(Coordinate::new(1.5, 2.5), Some(4.0));
        let json = serde_json::to_string(&sample).unwrap();
        assert!(json.contains("\"lat\":1.5"));
        assert!(json.contains("\"accuracy_meters\":4.0"));

        let back: LocationSample = serde_json::from_str(&json).unwrap();
        assert_eq!(back.coordinate(), sample.coordinate());
    }

    #[test]
    fn test_accuracy_tier_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&AccuracyTier::High).unwrap(), "\"high\"");
        assert_eq!(AccuracyTier::default(), AccuracyTier::Balanced);
    }
}
