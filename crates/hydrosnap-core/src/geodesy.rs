//! Great-circle distance on a spherical Earth.
//!
//! Distances are accurate to roughly 0.5% for terrestrial spans, which is
//! far below typical GNSS error at geofence scales.

use crate::types::Coordinate;

/// Mean Earth radius used by the haversine formula, in meters.
pub const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

/// Haversine distance between two coordinates, in meters.
///
/// The result is symmetric and exactly `0.0` for identical inputs. Inputs
/// outside the valid latitude/longitude ranges are not rejected; they yield
/// a mathematically defined but meaningless number.
#[must_use]
pub fn distance(a: Coordinate, b: Coordinate) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let dlat = (b.lat - a.lat).to_radians();
    let dlng = (b.lng - a.lng).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
    // Rounding can push h marginally above 1 for antipodal points.
    let c = 2.0 * h.clamp(0.0, 1.0).sqrt().asin();

    EARTH_RADIUS_METERS * c
}

/// Whether a point `distance` meters from a fence center is inside a fence
/// of `radius_meters`.
///
/// A radius of zero disables the fence, so every distance counts as inside.
#[inline]
#[must_use]
pub fn within_radius(distance: f64, radius_meters: f64) -> bool {
    radius_meters <= 0.0 || distance <= radius_meters
}
