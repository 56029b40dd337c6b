//! Unified error handling for the city-walker library.
//!
//! Two kinds of failure live here:
//! - [`WalkerError`]: misuse of the API or malformed input data (bad polylines,
//!   invalid configuration, illegal state transitions). Returned as `Err`.
//! - [`Advisory`]: recoverable conditions hit while processing a fix (no city,
//!   no catalogue, poor accuracy). These are plain values attached to a fix
//!   outcome and never stop the position stream.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::SegmentId;

/// Error type for city-walker operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum WalkerError {
    /// Polyline or polygon has too few vertices
    #[error("'{id}' has {point_count} points, minimum {minimum_required} required")]
    InsufficientPoints {
        id: String,
        point_count: usize,
        minimum_required: usize,
    },
    /// Coordinates outside the WGS84 range or not finite
    #[error("'{id}' has invalid coordinates: {message}")]
    InvalidCoordinates { id: String, message: String },
    /// A road segment was handed to a catalogue of a different city
    #[error("segment {segment_id} belongs to city '{segment_city}', not '{catalogue_city}'")]
    CityMismatch {
        segment_id: SegmentId,
        segment_city: String,
        catalogue_city: String,
    },
    /// Two segments in one catalogue share an id
    #[error("segment {segment_id} appears twice in catalogue for '{city_id}'")]
    DuplicateSegment { segment_id: SegmentId, city_id: String },
    /// The requested state transition is not allowed
    #[error("cannot {action} while {state}")]
    InvalidTransition { action: String, state: String },
    /// A city id was not registered with the engine
    #[error("unknown city '{city_id}'")]
    UnknownCity { city_id: String },
    /// Configuration error
    #[error("configuration error: {message}")]
    ConfigError { message: String },
    /// The tracking session worker has shut down
    #[error("tracking session is closed")]
    SessionClosed,
    /// JSON encode/decode failure
    #[error("serialization error: {message}")]
    Serialization { message: String },
}

impl From<serde_json::Error> for WalkerError {
    fn from(err: serde_json::Error) -> Self {
        WalkerError::Serialization {
            message: err.to_string(),
        }
    }
}

/// Result type alias for city-walker operations.
pub type Result<T> = std::result::Result<T, WalkerError>;

/// Extension trait for converting Option to WalkerError.
pub trait OptionExt<T> {
    /// Convert Option to Result with insufficient points error.
    fn ok_or_insufficient_points(self, id: &str, point_count: usize, minimum: usize)
        -> Result<T>;

    /// Convert Option to Result with unknown city error.
    fn ok_or_unknown_city(self, city_id: &str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_insufficient_points(
        self,
        id: &str,
        point_count: usize,
        minimum: usize,
    ) -> Result<T> {
        self.ok_or_else(|| WalkerError::InsufficientPoints {
            id: id.to_string(),
            point_count,
            minimum_required: minimum,
        })
    }

    fn ok_or_unknown_city(self, city_id: &str) -> Result<T> {
        self.ok_or_else(|| WalkerError::UnknownCity {
            city_id: city_id.to_string(),
        })
    }
}

/// Non-fatal condition reported while processing a fix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Advisory {
    /// No fix yet, or the position source failed. Tracking stays active.
    PositionUnavailable,
    /// No known boundary contains the fix.
    CityUndetermined,
    /// The active city has no road-segment data loaded.
    CatalogueMissing { city_id: String },
    /// No candidate segment lies within the matching threshold.
    NoSegmentWithinThreshold,
    /// The fix's accuracy radius exceeds the matching threshold.
    LowAccuracyFix { accuracy_meters: f64 },
}

impl std::fmt::Display for Advisory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Advisory::PositionUnavailable => write!(f, "position unavailable"),
            Advisory::CityUndetermined => write!(f, "city undetermined"),
            Advisory::CatalogueMissing { city_id } => {
                write!(f, "no road data for '{}'", city_id)
            }
            Advisory::NoSegmentWithinThreshold => write!(f, "no segment within threshold"),
            Advisory::LowAccuracyFix { accuracy_meters } => {
                write!(f, "fix accuracy {:.0}m too poor to credit", accuracy_meters)
            }
        }
    }
}
