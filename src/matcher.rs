//! Point-to-polyline matching.
//!
//! Distances are computed in an equirectangular projection centred on the fix,
//! which is accurate to well under a meter at city scale. For each candidate the
//! distance to every sub-segment is taken with the perpendicular foot clamped to
//! the sub-segment's endpoints, and the closest candidate overall wins.
//!
//! Ties within `epsilon` meters go to the lower segment id, so results do not
//! depend on candidate order.

use serde::{Deserialize, Serialize};

use crate::geo_utils::LocalProjection;
use crate::{GpsPoint, RoadSegment, SegmentId};

/// Default tie tolerance in meters.
pub const DEFAULT_TIE_EPSILON: f64 = 1e-9;

/// Best segment for a fix.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SegmentMatch {
    pub segment_id: SegmentId,
    /// Distance from the fix to the segment's polyline in meters
    pub distance_meters: f64,
}

/// Distance from `p` to the segment `a`-`b`, all in planar meters.
///
/// The projection of `p` is clamped to the segment, so points beyond an endpoint
/// measure to that endpoint.
#[inline]
pub fn point_to_segment_distance(p: (f64, f64), a: (f64, f64), b: (f64, f64)) -> f64 {
    let (abx, aby) = (b.0 - a.0, b.1 - a.1);
    let len_sq = abx * abx + aby * aby;
    if len_sq == 0.0 {
        return (p.0 - a.0).hypot(p.1 - a.1);
    }

    let t = (((p.0 - a.0) * abx + (p.1 - a.1) * aby) / len_sq).clamp(0.0, 1.0);
    let (cx, cy) = (a.0 + t * abx, a.1 + t * aby);
    (p.0 - cx).hypot(p.1 - cy)
}

/// Distance in meters from the projection origin to a polyline.
///
/// Returns `None` for an empty polyline. A single vertex measures to that vertex.
pub fn distance_to_polyline(projection: &LocalProjection, points: &[GpsPoint]) -> Option<f64> {
    let origin = (0.0, 0.0);
    match points {
        [] => None,
        [only] => {
            let (x, y) = projection.project(only);
            Some(x.hypot(y))
        }
        _ => {
            let projected: Vec<(f64, f64)> = points.iter().map(|p| projection.project(p)).collect();
            projected
                .windows(2)
                .map(|w| point_to_segment_distance(origin, w[0], w[1]))
                .reduce(f64::min)
        }
    }
}

/// Find the closest candidate within `max_distance_meters` of `point`.
///
/// # Example
/// ```
/// use city_walker::{match_point, GpsPoint, RoadSegment};
///
/// let road = RoadSegment::new(
///     1,
///     "athens",
///     vec![GpsPoint::new(37.96, 23.70), GpsPoint::new(37.96, 23.72)],
/// )
/// .unwrap();
///
/// let found = match_point(&GpsPoint::new(37.9602, 23.71), [&road], 25.0).unwrap();
/// assert_eq!(found.segment_id, 1);
/// assert!((found.distance_meters - 22.3).abs() < 0.5);
///
/// assert!(match_point(&GpsPoint::new(37.961, 23.71), [&road], 25.0).is_none());
/// ```
pub fn match_point<'a, I>(point: &GpsPoint, candidates: I, max_distance_meters: f64) -> Option<SegmentMatch>
where
    I: IntoIterator<Item = &'a RoadSegment>,
{
    match_point_with_epsilon(point, candidates, max_distance_meters, DEFAULT_TIE_EPSILON)
}

/// [`match_point`] with an explicit tie tolerance.
pub fn match_point_with_epsilon<'a, I>(
    point: &GpsPoint,
    candidates: I,
    max_distance_meters: f64,
    epsilon: f64,
) -> Option<SegmentMatch>
where
    I: IntoIterator<Item = &'a RoadSegment>,
{
    let projection = LocalProjection::new(*point);
    let mut best: Option<SegmentMatch> = None;

    for segment in candidates {
        let Some(distance) = distance_to_polyline(&projection, &segment.points) else {
            continue;
        };

        let better = match best {
            None => true,
            Some(current) => {
                if (distance - current.distance_meters).abs() <= epsilon {
                    segment.segment_id < current.segment_id
                } else {
                    distance < current.distance_meters
                }
            }
        };

        if better {
            best = Some(SegmentMatch {
                segment_id: segment.segment_id,
                distance_meters: distance,
            });
        }
    }

    best.filter(|m| m.distance_meters <= max_distance_meters)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn road(id: SegmentId, points: Vec<(f64, f64)>) -> RoadSegment {
        RoadSegment::new(
            id,
            "athens",
            points.into_iter().map(|(lat, lng)| GpsPoint::new(lat, lng)).collect(),
        )
        .unwrap()
    }

    struct Lcg(u64);

    impl Lcg {
        fn next_f64(&mut self) -> f64 {
            self.0 = self
                .0
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            (self.0 >> 11) as f64 / (1u64 << 53) as f64
        }
    }

    /// Reference distance: nearer endpoint, or the perpendicular line distance when
    /// the foot of the perpendicular lands strictly inside the segment.
    fn reference_segment_distance(p: (f64, f64), a: (f64, f64), b: (f64, f64)) -> f64 {
        let to_a = (p.0 - a.0).hypot(p.1 - a.1);
        let to_b = (p.0 - b.0).hypot(p.1 - b.1);
        let mut best = to_a.min(to_b);

        let ab = (b.0 - a.0, b.1 - a.1);
        let len = ab.0.hypot(ab.1);
        if len > 0.0 {
            let along = ((p.0 - a.0) * ab.0 + (p.1 - a.1) * ab.1) / len;
            if along > 0.0 && along < len {
                let cross = ((p.0 - a.0) * ab.1 - (p.1 - a.1) * ab.0).abs();
                best = best.min(cross / len);
            }
        }
        best
    }

    #[test]
    fn test_straight_road_scenario() {
        let roads = [road(1, vec![(37.96, 23.70), (37.96, 23.72)])];
        let found = match_point(&GpsPoint::new(37.9602, 23.71), &roads, 25.0).unwrap();
        assert_eq!(found.segment_id, 1);
        assert!(found.distance_meters > 21.0 && found.distance_meters < 23.0);
    }

    #[test]
    fn test_distance_clamped_to_endpoints() {
        let projection = LocalProjection::new(GpsPoint::new(37.96, 23.73));
        let distance =
            distance_to_polyline(&projection, &[GpsPoint::new(37.96, 23.70), GpsPoint::new(37.96, 23.72)])
                .unwrap();
        // Past the east end: measured to the endpoint (~880m), not to the infinite line (0m)
        assert!(distance > 850.0 && distance < 900.0);
    }

    #[test]
    fn test_empty_and_single_vertex_polylines() {
        let projection = LocalProjection::new(GpsPoint::new(37.96, 23.71));
        assert!(distance_to_polyline(&projection, &[]).is_none());

        let single = distance_to_polyline(&projection, &[GpsPoint::new(37.9601, 23.71)]).unwrap();
        assert!((single - 11.132).abs() < 0.01);

        let mut hollow = road(5, vec![(37.96, 23.70), (37.96, 23.72)]);
        hollow.points.clear();
        assert!(match_point(&GpsPoint::new(37.96, 23.71), [&hollow], 25.0).is_none());
    }

    #[test]
    fn test_tie_prefers_lower_id() {
        // Identical geometry under two ids, offered in both orders
        let a = road(7, vec![(37.96, 23.70), (37.96, 23.72)]);
        let b = road(3, vec![(37.96, 23.70), (37.96, 23.72)]);
        let point = GpsPoint::new(37.9601, 23.71);
        assert_eq!(match_point(&point, [&a, &b], 25.0).unwrap().segment_id, 3);
        assert_eq!(match_point(&point, [&b, &a], 25.0).unwrap().segment_id, 3);
    }

    #[test]
    fn test_closest_segment_wins() {
        let north = road(1, vec![(37.9603, 23.70), (37.9603, 23.72)]);
        let south = road(2, vec![(37.9599, 23.70), (37.9599, 23.72)]);
        let found = match_point(&GpsPoint::new(37.9602, 23.71), [&north, &south], 25.0).unwrap();
        assert_eq!(found.segment_id, 1);
    }

    #[test]
    fn test_beyond_threshold_is_none() {
        let roads = [road(1, vec![(37.96, 23.70), (37.96, 23.72)])];
        assert!(match_point(&GpsPoint::new(37.9603, 23.71), &roads, 25.0).is_none());
        assert!(match_point(&GpsPoint::new(37.9603, 23.71), &roads, 40.0).is_some());
        let none: [&RoadSegment; 0] = [];
        assert!(match_point(&GpsPoint::new(37.96, 23.71), none, 25.0).is_none());
    }

    #[test]
    fn test_random_polylines_against_reference() {
        let mut rng = Lcg(7);

        for _ in 0..300 {
            let origin = GpsPoint::new(37.96, 23.71);
            let vertex_count = 2 + (rng.next_f64() * 5.0) as usize;
            let vertices: Vec<GpsPoint> = (0..vertex_count)
                .map(|_| {
                    GpsPoint::new(
                        origin.latitude + (rng.next_f64() - 0.5) * 0.004,
                        origin.longitude + (rng.next_f64() - 0.5) * 0.004,
                    )
                })
                .collect();
            let point = GpsPoint::new(
                origin.latitude + (rng.next_f64() - 0.5) * 0.006,
                origin.longitude + (rng.next_f64() - 0.5) * 0.006,
            );

            let projection = LocalProjection::new(point);
            let projected: Vec<(f64, f64)> = vertices.iter().map(|v| projection.project(v)).collect();
            let expected = projected
                .windows(2)
                .map(|w| reference_segment_distance((0.0, 0.0), w[0], w[1]))
                .fold(f64::INFINITY, f64::min);

            let actual = distance_to_polyline(&projection, &vertices).unwrap();
            assert!(actual >= 0.0);
            assert!((actual - expected).abs() < 1e-6, "{} vs {}", actual, expected);

            // Dense sampling along the polyline never gets closer than the reported distance
            let sampled = projected
                .windows(2)
                .flat_map(|w| {
                    (0..=200).map(move |k| {
                        let t = k as f64 / 200.0;
                        let x = w[0].0 + t * (w[1].0 - w[0].0);
                        let y = w[0].1 + t * (w[1].1 - w[0].1);
                        x.hypot(y)
                    })
                })
                .fold(f64::INFINITY, f64::min);
            assert!(sampled + 1e-6 >= actual);
            assert!(sampled - actual < 5.0);
        }
    }
}
