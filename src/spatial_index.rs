//! Uniform grid index over a city's road segments.
//!
//! The city's extent is cut into cells of fixed angular size, roughly
//! `cell_meters` on a side at the catalogue's reference latitude. Every segment is
//! registered in each cell its polyline bounding box touches. A query visits the
//! cells covering the query circle's bounding box, and never fewer than the
//! query cell plus its surrounding ring.
//!
//! Results are a superset of the segments actually within the radius: false
//! positives are fine (the matcher confirms distances), false negatives are not.
//!
//! An index is immutable once built. [`SharedIndex`] publishes a fresh index
//! atomically; readers holding the previous `Arc` keep using it until they drop it.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use log::debug;

use crate::catalogue::CityCatalogue;
use crate::geo_utils::{lng_degrees_covering, meters_to_lat_degrees, meters_to_lng_degrees};
use crate::{Bounds, GpsPoint, RoadSegment, SegmentId};

/// Slack on the radius-to-degrees conversion, covering the difference between
/// the planar and spherical meter scales.
const RADIUS_MARGIN: f64 = 1.01;

type CellKey = (i64, i64);

/// Grid index of one city's road segments.
#[derive(Debug)]
pub struct SpatialIndex {
    catalogue: Arc<CityCatalogue>,
    origin: GpsPoint,
    cell_lat_deg: f64,
    cell_lng_deg: f64,
    /// Cell -> positions into `catalogue.segments()`
    cells: HashMap<CellKey, Vec<usize>>,
    /// Inclusive cell range holding any data: (min_row, max_row, min_col, max_col)
    extent: Option<(i64, i64, i64, i64)>,
}

impl SpatialIndex {
    /// Build the grid for a catalogue.
    ///
    /// Segments with no vertices are skipped.
    pub fn build(catalogue: Arc<CityCatalogue>, cell_meters: f64) -> Self {
        let bounds = catalogue.bounds();
        let origin = bounds
            .map(|b| GpsPoint::new(b.min_lat, b.min_lng))
            .unwrap_or_else(|| GpsPoint::new(0.0, 0.0));
        let reference_lat = bounds.map(|b| b.center().latitude).unwrap_or(0.0);

        let mut index = Self {
            origin,
            cell_lat_deg: meters_to_lat_degrees(cell_meters),
            cell_lng_deg: meters_to_lng_degrees(cell_meters, reference_lat),
            cells: HashMap::new(),
            extent: None,
            catalogue: Arc::clone(&catalogue),
        };

        for (position, segment) in catalogue.segments().iter().enumerate() {
            index.register(position, segment);
        }

        debug!(
            "[SpatialIndex] {}: {} segments in {} cells",
            catalogue.city_id(),
            catalogue.len(),
            index.cells.len()
        );

        index
    }

    fn register(&mut self, position: usize, segment: &RoadSegment) {
        let Some(bounds) = Bounds::from_points(&segment.points) else {
            return;
        };
        let (min_row, min_col) = self.cell_of(bounds.min_lat, bounds.min_lng);
        let (max_row, max_col) = self.cell_of(bounds.max_lat, bounds.max_lng);

        for row in min_row..=max_row {
            for col in min_col..=max_col {
                self.cells.entry((row, col)).or_default().push(position);
            }
        }

        self.extent = Some(match self.extent {
            None => (min_row, max_row, min_col, max_col),
            Some((r0, r1, c0, c1)) => (
                r0.min(min_row),
                r1.max(max_row),
                c0.min(min_col),
                c1.max(max_col),
            ),
        });
    }

    #[inline]
    fn cell_of(&self, lat: f64, lng: f64) -> CellKey {
        (
            ((lat - self.origin.latitude) / self.cell_lat_deg).floor() as i64,
            ((lng - self.origin.longitude) / self.cell_lng_deg).floor() as i64,
        )
    }

    /// Positions (into the catalogue) of segments registered near the query circle.
    fn positions_near(&self, point: &GpsPoint, radius_meters: f64) -> Vec<usize> {
        let Some((r0, r1, c0, c1)) = self.extent else {
            return Vec::new();
        };
        if !point.is_valid() {
            return Vec::new();
        }

        let radius = radius_meters.max(0.0) * RADIUS_MARGIN;
        let dlat = meters_to_lat_degrees(radius);
        let dlng = lng_degrees_covering(radius, point.latitude);

        let (row, col) = self.cell_of(point.latitude, point.longitude);
        let (low_row, low_col) = self.cell_of(point.latitude - dlat, point.longitude - dlng);
        let (high_row, high_col) = self.cell_of(point.latitude + dlat, point.longitude + dlng);

        // Always include the surrounding ring; clip to cells that hold data
        let row_range = (low_row.min(row - 1)).max(r0)..=(high_row.max(row + 1)).min(r1);
        let col_range = (low_col.min(col - 1)).max(c0)..=(high_col.max(col + 1)).min(c1);

        let mut seen = HashSet::new();
        let mut positions = Vec::new();
        for r in row_range {
            for c in col_range.clone() {
                if let Some(cell) = self.cells.get(&(r, c)) {
                    for &position in cell {
                        if seen.insert(position) {
                            positions.push(position);
                        }
                    }
                }
            }
        }
        positions.sort_unstable();
        positions
    }

    /// Ids of every segment whose bounding box may intersect the query circle,
    /// in ascending id order.
    pub fn query_near(&self, point: &GpsPoint, radius_meters: f64) -> Vec<SegmentId> {
        let segments = self.catalogue.segments();
        self.positions_near(point, radius_meters)
            .into_iter()
            .map(|p| segments[p].segment_id)
            .collect()
    }

    /// Candidate segments near the query circle, in ascending id order.
    pub fn candidates_near(&self, point: &GpsPoint, radius_meters: f64) -> Vec<&RoadSegment> {
        let segments = self.catalogue.segments();
        self.positions_near(point, radius_meters)
            .into_iter()
            .map(|p| &segments[p])
            .collect()
    }

    pub fn city_id(&self) -> &str {
        self.catalogue.city_id()
    }

    /// The catalogue this index was built from.
    pub fn catalogue(&self) -> &Arc<CityCatalogue> {
        &self.catalogue
    }

    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }
}

/// Atomically replaceable handle to the current index.
#[derive(Debug, Default)]
pub struct SharedIndex {
    current: RwLock<Option<Arc<SpatialIndex>>>,
}

impl SharedIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the current index. The snapshot stays valid after a republish.
    pub fn load(&self) -> Option<Arc<SpatialIndex>> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Swap in a fully built index, returning the retired one.
    pub fn publish(&self, index: Arc<SpatialIndex>) -> Option<Arc<SpatialIndex>> {
        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        current.replace(index)
    }

    /// Drop the current index (no active city).
    pub fn clear(&self) -> Option<Arc<SpatialIndex>> {
        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        current.take()
    }
}
