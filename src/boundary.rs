//! City detection by point-in-polygon.
//!
//! Uses the even-odd ray-casting rule: a horizontal ray is cast from the point
//! towards +∞ longitude and edge crossings are counted; an odd count means inside.
//! Points lying exactly on an edge may be classified either way.
//!
//! Boundaries are tested in the order supplied and the first containing boundary
//! wins. Overlapping cities are not an error, just resolved by that order.

use rstar::{RTree, RTreeObject, AABB};

use crate::geo_utils::bounds_contain;
use crate::{Bounds, CityBoundary, GpsPoint};

/// Even-odd ray-casting test. Polygons with fewer than 3 vertices never contain anything.
pub fn point_in_polygon(point: &GpsPoint, polygon: &[GpsPoint]) -> bool {
    if polygon.len() < 3 {
        return false;
    }

    let x = point.longitude;
    let y = point.latitude;
    let mut inside = false;
    let mut j = polygon.len() - 1;

    for i in 0..polygon.len() {
        let (xi, yi) = (polygon[i].longitude, polygon[i].latitude);
        let (xj, yj) = (polygon[j].longitude, polygon[j].latitude);

        // Edge straddles the ray's latitude and the crossing lies east of the point
        if (yi > y) != (yj > y) && x < (xj - xi) * (y - yi) / (yj - yi) + xi {
            inside = !inside;
        }
        j = i;
    }

    inside
}

/// Find the first boundary (in slice order) containing `point`.
///
/// # Example
/// ```
/// use city_walker::{locate, CityBoundary, GpsPoint};
///
/// let athens = CityBoundary::new(
///     "athens",
///     vec![
///         GpsPoint::new(37.95, 23.70),
///         GpsPoint::new(37.95, 23.76),
///         GpsPoint::new(37.97, 23.76),
///         GpsPoint::new(37.97, 23.70),
///     ],
/// );
/// let cities = [athens];
/// assert_eq!(locate(&GpsPoint::new(37.96, 23.73), &cities), Some("athens"));
/// assert_eq!(locate(&GpsPoint::new(38.10, 23.73), &cities), None);
/// ```
pub fn locate<'a>(point: &GpsPoint, boundaries: &'a [CityBoundary]) -> Option<&'a str> {
    boundaries
        .iter()
        .filter(|b| !b.is_degenerate())
        .filter(|b| b.bounds().is_some_and(|bounds| bounds_contain(&bounds, point)))
        .find(|b| point_in_polygon(point, &b.points))
        .map(|b| b.city_id.as_str())
}

/// Bounding box of a registered boundary, for R-tree pre-filtering.
#[derive(Debug, Clone)]
struct BoundaryEnvelope {
    /// Registration order of the boundary
    order: usize,
    bounds: Bounds,
}

impl RTreeObject for BoundaryEnvelope {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_corners(
            [self.bounds.min_lng, self.bounds.min_lat],
            [self.bounds.max_lng, self.bounds.max_lat],
        )
    }
}

/// A registered set of city boundaries with an R-tree envelope pre-filter.
///
/// Behaves exactly like [`locate`] over the boundaries in registration order; the
/// R-tree only skips polygons whose bounding box cannot contain the point.
#[derive(Debug, Default)]
pub struct BoundaryLocator {
    boundaries: Vec<CityBoundary>,
    index: RTree<BoundaryEnvelope>,
}

impl BoundaryLocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_boundaries(boundaries: Vec<CityBoundary>) -> Self {
        let mut locator = Self::new();
        for boundary in boundaries {
            locator.register(boundary);
        }
        locator
    }

    /// Register a boundary. A boundary for an already known city replaces the old
    /// polygon but keeps its original registration slot.
    pub fn register(&mut self, boundary: CityBoundary) {
        if let Some(existing) = self
            .boundaries
            .iter_mut()
            .find(|b| b.city_id == boundary.city_id)
        {
            *existing = boundary;
            self.rebuild_index();
            return;
        }

        let order = self.boundaries.len();
        if let Some(bounds) = boundary.bounds().filter(|_| !boundary.is_degenerate()) {
            self.index.insert(BoundaryEnvelope { order, bounds });
        }
        self.boundaries.push(boundary);
    }

    fn rebuild_index(&mut self) {
        let envelopes: Vec<BoundaryEnvelope> = self
            .boundaries
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.is_degenerate())
            .filter_map(|(order, b)| b.bounds().map(|bounds| BoundaryEnvelope { order, bounds }))
            .collect();
        self.index = RTree::bulk_load(envelopes);
    }

    /// City containing `point`, first registered wins.
    pub fn locate(&self, point: &GpsPoint) -> Option<&str> {
        let query = AABB::from_point([point.longitude, point.latitude]);
        let mut candidates: Vec<usize> = self
            .index
            .locate_in_envelope_intersecting(&query)
            .map(|e| e.order)
            .collect();
        candidates.sort_unstable();

        candidates
            .into_iter()
            .map(|order| &self.boundaries[order])
            .find(|b| point_in_polygon(point, &b.points))
            .map(|b| b.city_id.as_str())
    }

    /// Whether the named city's boundary contains `point`. Unknown cities never do.
    pub fn contains(&self, city_id: &str, point: &GpsPoint) -> bool {
        self.boundary(city_id)
            .map(|b| point_in_polygon(point, &b.points))
            .unwrap_or(false)
    }

    pub fn boundary(&self, city_id: &str) -> Option<&CityBoundary> {
        self.boundaries.iter().find(|b| b.city_id == city_id)
    }

    pub fn city_ids(&self) -> Vec<String> {
        self.boundaries.iter().map(|b| b.city_id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.boundaries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boundaries.is_empty()
    }
}
