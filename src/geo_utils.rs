//! # Geographic Utilities
//!
//! Core geographic computations shared by the index, the matcher and the
//! progress catalogue.
//!
//! | Function | Description |
//! |----------|-------------|
//! | [`haversine_distance`] | Great-circle distance between two GPS points |
//! | [`polyline_length`] | Total length of a polyline in meters |
//! | [`bounds_contain`] | Inclusive bounding-box test |
//! | [`meters_to_lat_degrees`] / [`meters_to_lng_degrees`] | Meter to degree conversion |
//! | [`LocalProjection`] | Equirectangular projection about a reference point |
//!
//! ## Example
//!
//! ```rust
//! use city_walker::{GpsPoint, geo_utils};
//!
//! let road = vec![
//!     GpsPoint::new(37.96, 23.70),
//!     GpsPoint::new(37.96, 23.72),
//! ];
//!
//! let length = geo_utils::polyline_length(&road);
//! assert!((length - 1755.0).abs() < 10.0);
//! ```
//!
//! ## Coordinate System
//!
//! All functions expect WGS84 coordinates in degrees. Planar helpers are valid at
//! city scale (a few tens of kilometers) and are not geodesically exact over
//! longer spans.

use geo::{Distance, Haversine, Point};

use crate::{Bounds, GpsPoint};

/// Meters per degree of latitude (and of longitude at the equator).
pub const METERS_PER_DEGREE: f64 = 111_320.0;

// =============================================================================
// Distance Functions
// =============================================================================

/// Great-circle distance in meters between two GPS points (spherical Earth).
///
/// ```rust
/// use city_walker::{GpsPoint, geo_utils};
///
/// let london = GpsPoint::new(51.5074, -0.1278);
/// let paris = GpsPoint::new(48.8566, 2.3522);
/// let distance = geo_utils::haversine_distance(&london, &paris);
/// assert!((distance - 343_560.0).abs() < 1000.0);
/// ```
#[inline]
pub fn haversine_distance(p1: &GpsPoint, p2: &GpsPoint) -> f64 {
    let point1 = Point::new(p1.longitude, p1.latitude);
    let point2 = Point::new(p2.longitude, p2.latitude);
    Haversine::distance(point1, point2)
}

/// Total length of a polyline in meters. Empty or single-point input is 0.0.
pub fn polyline_length(points: &[GpsPoint]) -> f64 {
    if points.len() < 2 {
        return 0.0;
    }

    points
        .windows(2)
        .map(|w| haversine_distance(&w[0], &w[1]))
        .sum()
}

/// Convert a north-south distance in meters to degrees of latitude.
#[inline]
pub fn meters_to_lat_degrees(meters: f64) -> f64 {
    meters / METERS_PER_DEGREE
}

/// Convert an east-west distance in meters to degrees of longitude at `latitude`.
///
/// Longitude degrees shrink with cos(latitude); the cosine is floored at 0.1 so
/// the result stays finite near the poles.
#[inline]
pub fn meters_to_lng_degrees(meters: f64, latitude: f64) -> f64 {
    let lat_rad = latitude.to_radians();
    meters / (METERS_PER_DEGREE * lat_rad.cos().max(0.1))
}

/// Longitude span covering `meters` east-west at `latitude`, using the true
/// cosine. At the poles the span is the whole circle.
#[inline]
pub fn lng_degrees_covering(meters: f64, latitude: f64) -> f64 {
    let cos_lat = latitude.to_radians().cos();
    if cos_lat <= 1e-9 {
        return 360.0;
    }
    (meters / (METERS_PER_DEGREE * cos_lat)).min(360.0)
}

// =============================================================================
// Bounding Box Functions
// =============================================================================

/// Check if a point lies inside a bounding box (edges inclusive).
#[inline]
pub fn bounds_contain(bounds: &Bounds, point: &GpsPoint) -> bool {
    point.latitude >= bounds.min_lat
        && point.latitude <= bounds.max_lat
        && point.longitude >= bounds.min_lng
        && point.longitude <= bounds.max_lng
}

// =============================================================================
// Planar Projection
// =============================================================================

/// Equirectangular projection centred on a reference point.
///
/// Maps a GPS point to planar `(x, y)` meters east/north of the origin. Used by the
/// matcher so that perpendicular distances can be computed with plain vector math.
#[derive(Debug, Clone, Copy)]
pub struct LocalProjection {
    origin: GpsPoint,
    meters_per_lng_degree: f64,
}

impl LocalProjection {
    pub fn new(origin: GpsPoint) -> Self {
        Self {
            origin,
            meters_per_lng_degree: METERS_PER_DEGREE * origin.latitude.to_radians().cos(),
        }
    }

    /// Project a point to `(x, y)` meters relative to the origin.
    #[inline]
    pub fn project(&self, point: &GpsPoint) -> (f64, f64) {
        (
            (point.longitude - self.origin.longitude) * self.meters_per_lng_degree,
            (point.latitude - self.origin.latitude) * METERS_PER_DEGREE,
        )
    }
}
