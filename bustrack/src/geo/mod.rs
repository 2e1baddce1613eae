//! Geographic math primitives.
//!
//! Provides the great-circle distance, bearing, and interpolation helpers the
//! rest of the engine builds on. Coordinates are WGS84 decimal degrees.
//!
//! Distance uses the Haversine formula; it is symmetric, zero for identical
//! points (within floating tolerance), and respects the triangle inequality.
//! Segment distance uses a local flat-earth projection, which is accurate at
//! the sub-kilometre scales route-deviation detection cares about.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Mean Earth radius in kilometres.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Kilometres per degree of latitude.
const KM_PER_DEG_LAT: f64 = 110.574;

/// Kilometres per degree of longitude at the equator.
const KM_PER_DEG_LON: f64 = 111.320;

/// Errors from coordinate validation.
#[derive(Debug, Error, PartialEq)]
pub enum GeoError {
    /// Latitude outside [-90, 90] or not finite.
    #[error("invalid latitude: {0}")]
    InvalidLatitude(f64),

    /// Longitude outside [-180, 180] or not finite.
    #[error("invalid longitude: {0}")]
    InvalidLongitude(f64),
}

/// A WGS84 coordinate in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    /// Create a validated coordinate.
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, GeoError> {
        let coord = Self {
            latitude,
            longitude,
        };
        coord.validate()?;
        Ok(coord)
    }

    /// Validate latitude and longitude ranges, rejecting NaN/infinite values.
    pub fn validate(&self) -> Result<(), GeoError> {
        if !self.latitude.is_finite() || !(-90.0..=90.0).contains(&self.latitude) {
            return Err(GeoError::InvalidLatitude(self.latitude));
        }
        if !self.longitude.is_finite() || !(-180.0..=180.0).contains(&self.longitude) {
            return Err(GeoError::InvalidLongitude(self.longitude));
        }
        Ok(())
    }
}

impl std::fmt::Display for Coordinate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({:.5}, {:.5})", self.latitude, self.longitude)
    }
}

/// Great-circle distance between two coordinates in kilometres (Haversine).
pub fn distance_km(a: Coordinate, b: Coordinate) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let dlat = (b.latitude - a.latitude).to_radians();
    let dlon = (b.longitude - a.longitude).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().asin()
}

/// Initial great-circle bearing from `a` to `b`, in degrees in [0, 360).
///
/// 0 = north, 90 = east.
pub fn bearing_degrees(a: Coordinate, b: Coordinate) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let dlon = (b.longitude - a.longitude).to_radians();

    let y = dlon.sin() * lat2.cos();
    let x = lat1.cos() * lat2.sin() - lat1.sin() * lat2.cos() * dlon.cos();
    let bearing = y.atan2(x).to_degrees();

    bearing.rem_euclid(360.0)
}

/// Linear interpolation between two coordinates.
///
/// `fraction` is clamped to [0, 1]. Consistent with the straight-line
/// approximation used by the route estimator's segment fallback.
pub fn interpolate(a: Coordinate, b: Coordinate, fraction: f64) -> Coordinate {
    let f = fraction.clamp(0.0, 1.0);
    Coordinate {
        latitude: a.latitude + (b.latitude - a.latitude) * f,
        longitude: a.longitude + (b.longitude - a.longitude) * f,
    }
}

/// Perpendicular distance in kilometres from `p` to the segment `a`–`b`.
///
/// Projects into a local flat plane centred on `a`, then measures the
/// distance to the closest point on the segment (endpoints included).
pub fn point_to_segment_km(p: Coordinate, a: Coordinate, b: Coordinate) -> f64 {
    let lat_scale = KM_PER_DEG_LAT;
    let lon_scale = KM_PER_DEG_LON * a.latitude.to_radians().cos();

    let px = (p.longitude - a.longitude) * lon_scale;
    let py = (p.latitude - a.latitude) * lat_scale;
    let bx = (b.longitude - a.longitude) * lon_scale;
    let by = (b.latitude - a.latitude) * lat_scale;

    let seg_len_sq = bx * bx + by * by;
    if seg_len_sq == 0.0 {
        return (px * px + py * py).sqrt();
    }

    let t = ((px * bx + py * by) / seg_len_sq).clamp(0.0, 1.0);
    let dx = px - t * bx;
    let dy = py - t * by;
    (dx * dx + dy * dy).sqrt()
}
