//! # City Walker
//!
//! Track which road segments of a city a user has walked, from a stream of noisy
//! GPS fixes, and report completion progress.
//!
//! This library provides:
//! - City detection by point-in-polygon over known city boundaries
//! - A uniform grid index for fast candidate segment lookup
//! - Clamped point-to-polyline matching under a distance threshold
//! - A stateful tracking engine with deduplicated walking credit
//! - Incremental, recomputable per-city progress totals
//!
//! ## Features
//!
//! - **`parallel`** - Enable parallel catalogue preparation with rayon
//! - **`async`** - Enable driving a session from a `futures::Stream` of fixes
//! - **`full`** - Enable all features
//!
//! ## Quick Start
//!
//! ```rust
//! use city_walker::{
//!     CityBoundary, GpsPoint, InMemoryMapData, Position, RoadSegment, TrackingConfig,
//!     TrackingEngine,
//! };
//!
//! let athens = CityBoundary::new(
//!     "athens",
//!     vec![
//!         GpsPoint::new(37.95, 23.70),
//!         GpsPoint::new(37.95, 23.76),
//!         GpsPoint::new(37.97, 23.76),
//!         GpsPoint::new(37.97, 23.70),
//!     ],
//! );
//! let road = RoadSegment::new(
//!     1,
//!     "athens",
//!     vec![GpsPoint::new(37.96, 23.70), GpsPoint::new(37.96, 23.72)],
//! )
//! .unwrap();
//!
//! let mut map_data = InMemoryMapData::new();
//! map_data.add_city(athens, vec![road]);
//!
//! let mut engine =
//!     TrackingEngine::new("walker-1", TrackingConfig::default(), Box::new(map_data)).unwrap();
//! engine.start().unwrap();
//!
//! let outcome = engine.process_fix(&Position::new(37.9602, 23.71, 10.0, 1_700_000_000_000));
//! assert!(outcome.event.is_some());
//! assert_eq!(engine.progress("athens").unwrap().segments_walked, 1);
//! ```

use serde::{Deserialize, Serialize};

// Unified error handling
pub mod error;
pub use error::{Advisory, OptionExt, Result, WalkerError};

// Geographic utilities (distance, bounds, projection)
pub mod geo_utils;

// City detection (ray-casting point-in-polygon)
pub mod boundary;
pub use boundary::{locate, point_in_polygon, BoundaryLocator};

// Grid index of road segments
pub mod spatial_index;
pub use spatial_index::{SharedIndex, SpatialIndex};

// Point-to-polyline matching
pub mod matcher;
pub use matcher::{distance_to_polyline, match_point, SegmentMatch};

// Road-segment catalogue and map-data collaborator
pub mod catalogue;
pub use catalogue::{CityCatalogue, InMemoryMapData, MapDataSource};

// Per-city walking progress
pub mod progress;
pub use progress::ProgressAggregator;

// Stateful tracking engine
pub mod engine;
pub use engine::{EngineStats, FixOutcome, MatchOutcome, TrackingEngine, TrackingEvent, TrackingState};

// Threaded session wrapper with ordered fix queue
pub mod session;
pub use session::{FixSender, PositionSource, TrackingSession};

// Async position stream adapter
#[cfg(feature = "async")]
pub mod stream;
#[cfg(feature = "async")]
pub use stream::{pump_channel, pump_stream, spawn_pump};

// ============================================================================
// Core Types
// ============================================================================

/// Road segment identifier, unique within a city.
pub type SegmentId = u64;

/// A GPS coordinate with latitude and longitude.
///
/// Used for boundary polygon and road polyline vertices.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GpsPoint {
    /// Create a new GPS point.
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Check if the point has valid coordinates.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.latitude >= -90.0
            && self.latitude <= 90.0
            && self.longitude >= -180.0
            && self.longitude <= 180.0
    }
}

/// Bounding box in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl Bounds {
    /// Create bounds from GPS points.
    pub fn from_points(points: &[GpsPoint]) -> Option<Self> {
        if points.is_empty() {
            return None;
        }
        let mut min_lat = f64::MAX;
        let mut max_lat = f64::MIN;
        let mut min_lng = f64::MAX;
        let mut max_lng = f64::MIN;

        for p in points {
            min_lat = min_lat.min(p.latitude);
            max_lat = max_lat.max(p.latitude);
            min_lng = min_lng.min(p.longitude);
            max_lng = max_lng.max(p.longitude);
        }

        Some(Self {
            min_lat,
            max_lat,
            min_lng,
            max_lng,
        })
    }

    /// Get the center point of the bounds.
    pub fn center(&self) -> GpsPoint {
        GpsPoint::new(
            (self.min_lat + self.max_lat) / 2.0,
            (self.min_lng + self.max_lng) / 2.0,
        )
    }

    /// Smallest bounds covering both `self` and `other`.
    pub fn union(&self, other: &Bounds) -> Bounds {
        Bounds {
            min_lat: self.min_lat.min(other.min_lat),
            max_lat: self.max_lat.max(other.max_lat),
            min_lng: self.min_lng.min(other.min_lng),
            max_lng: self.max_lng.max(other.max_lng),
        }
    }
}

/// One reported GPS fix.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
    /// Accuracy radius in meters
    pub accuracy_meters: f64,
    /// Unix timestamp in milliseconds
    pub timestamp: i64,
}

impl Position {
    pub fn new(latitude: f64, longitude: f64, accuracy_meters: f64, timestamp: i64) -> Self {
        Self {
            latitude,
            longitude,
            accuracy_meters,
            timestamp,
        }
    }

    /// The fix location without accuracy or time.
    pub fn point(&self) -> GpsPoint {
        GpsPoint::new(self.latitude, self.longitude)
    }
}

/// Closed polygon delimiting a city's extent.
///
/// The closing edge from the last vertex back to the first is implicit. Boundaries
/// with fewer than 3 vertices are kept but never match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CityBoundary {
    pub city_id: String,
    pub points: Vec<GpsPoint>,
}

impl CityBoundary {
    pub fn new(city_id: &str, points: Vec<GpsPoint>) -> Self {
        Self {
            city_id: city_id.to_string(),
            points,
        }
    }

    /// True when the polygon cannot enclose anything.
    pub fn is_degenerate(&self) -> bool {
        self.points.len() < 3
    }

    pub fn bounds(&self) -> Option<Bounds> {
        Bounds::from_points(&self.points)
    }
}

/// A named section of road, the unit of walking credit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoadSegment {
    pub segment_id: SegmentId,
    pub city_id: String,
    /// Polyline vertices, at least 2
    pub points: Vec<GpsPoint>,
    /// Polyline length in meters, computed at construction
    pub length_meters: f64,
    /// Pre-computed bounding box of the polyline
    pub bounds: Bounds,
}

impl RoadSegment {
    /// Create a road segment, validating the polyline and precomputing its length.
    ///
    /// # Errors
    /// `InsufficientPoints` for fewer than 2 vertices, `InvalidCoordinates` for any
    /// vertex outside the WGS84 range.
    pub fn new(segment_id: SegmentId, city_id: &str, points: Vec<GpsPoint>) -> Result<Self> {
        if let Some(bad) = points.iter().find(|p| !p.is_valid()) {
            return Err(WalkerError::InvalidCoordinates {
                id: segment_id.to_string(),
                message: format!("({}, {})", bad.latitude, bad.longitude),
            });
        }
        let point_count = points.len();
        let bounds = Bounds::from_points(&points)
            .filter(|_| point_count >= 2)
            .ok_or_insufficient_points(&segment_id.to_string(), point_count, 2)?;
        let length_meters = geo_utils::polyline_length(&points);

        Ok(Self {
            segment_id,
            city_id: city_id.to_string(),
            points,
            length_meters,
            bounds,
        })
    }
}

/// A credited (or revisited) walk of one segment by one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalkedSegment {
    pub user_id: String,
    pub segment_id: SegmentId,
    pub city_id: String,
    /// Unix timestamp in milliseconds of the fix that produced the match
    pub walked_at: i64,
}

/// Derived per-user, per-city totals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CityProgress {
    pub user_id: String,
    pub city_id: String,
    pub segments_walked: u32,
    pub total_segments: u32,
    pub distance_walked_meters: f64,
    /// 0-100
    pub completion_percent: f64,
    /// Time of the most recent newly credited segment (None until the first credit)
    pub last_updated: Option<i64>,
}

impl CityProgress {
    /// Progress with nothing walked yet.
    pub fn empty(user_id: &str, city_id: &str, total_segments: u32) -> Self {
        Self {
            user_id: user_id.to_string(),
            city_id: city_id.to_string(),
            segments_walked: 0,
            total_segments,
            distance_walked_meters: 0.0,
            completion_percent: 0.0,
            last_updated: None,
        }
    }
}

/// `100 * walked / total`, or 0 when the city has no segments.
pub fn completion_percent(segments_walked: u32, total_segments: u32) -> f64 {
    if total_segments == 0 {
        return 0.0;
    }
    100.0 * segments_walked as f64 / total_segments as f64
}

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for matching and tracking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    /// Maximum fix-to-road distance for a match, and maximum accuracy radius a
    /// fix may report and still earn credit.
    /// Default: 25.0 meters (GPS error of 3-10m plus sidewalk offset)
    pub max_match_distance_meters: f64,

    /// Radius used to pull candidates from the grid index. Never smaller than
    /// `max_match_distance_meters`.
    /// Default: 50.0 meters
    pub lookup_radius_meters: f64,

    /// Grid cell edge length.
    /// Default: 75.0 meters
    pub grid_cell_meters: f64,

    /// Distances closer than this are treated as tied; the lower segment id wins.
    /// Default: 1e-9 meters
    pub tie_epsilon_meters: f64,

    /// Emit a WalkedSegment for repeat visits of already credited segments.
    /// Repeats go to the history log only and never add credit.
    /// Default: false
    pub record_revisits: bool,

    /// Re-run city detection when an automatically detected city's boundary no
    /// longer contains the fix. Manually selected cities are never replaced.
    /// Default: true
    pub redetect_on_exit: bool,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            max_match_distance_meters: 25.0,
            lookup_radius_meters: 50.0,
            grid_cell_meters: 75.0,
            tie_epsilon_meters: 1e-9,
            record_revisits: false,
            redetect_on_exit: true,
        }
    }
}

impl TrackingConfig {
    /// Parse a config from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: TrackingConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that all distances are positive and finite.
    pub fn validate(&self) -> Result<()> {
        let checks = [
            ("max_match_distance_meters", self.max_match_distance_meters),
            ("lookup_radius_meters", self.lookup_radius_meters),
            ("grid_cell_meters", self.grid_cell_meters),
        ];
        for (name, value) in checks {
            if !value.is_finite() || value <= 0.0 {
                return Err(WalkerError::ConfigError {
                    message: format!("{} must be positive, got {}", name, value),
                });
            }
        }
        if !self.tie_epsilon_meters.is_finite() || self.tie_epsilon_meters < 0.0 {
            return Err(WalkerError::ConfigError {
                message: format!(
                    "tie_epsilon_meters must be non-negative, got {}",
                    self.tie_epsilon_meters
                ),
            });
        }
        Ok(())
    }

    /// Candidate lookup radius, clamped so it never undercuts the match threshold.
    pub fn effective_lookup_radius(&self) -> f64 {
        self.lookup_radius_meters.max(self.max_match_distance_meters)
    }
}

// ============================================================================
// Tests
// ============================================================================
