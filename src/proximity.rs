//! Point-to-polyline proximity evaluation.
//!
//! A summit counts as reached when the minimum distance from the summit to
//! any segment of the track drops below a threshold. Each segment distance
//! is a standard projection onto the segment with the projection parameter
//! clamped to [0, 1].
//!
//! Distances are computed on a plane. With [`DistanceMetric::Planar`] the
//! plane is raw (latitude, longitude) degree space, so thresholds are in
//! degrees and east-west distances are over-reported away from the equator.
//! [`DistanceMetric::Equirectangular`] projects around the summit first and
//! measures in meters.

use crate::config::DistanceMetric;
use crate::geo_utils::EARTH_RADIUS_METERS;
use crate::GpsPoint;

/// Local plane for one evaluation, anchored at the summit.
#[derive(Debug, Clone, Copy)]
struct Plane {
    lat_scale: f64,
    lng_scale: f64,
}

impl Plane {
    fn new(origin: &GpsPoint, metric: DistanceMetric) -> Self {
        match metric {
            DistanceMetric::Planar => Self {
                lat_scale: 1.0,
                lng_scale: 1.0,
            },
            DistanceMetric::Equirectangular => {
                let meters_per_degree = EARTH_RADIUS_METERS.to_radians();
                Self {
                    lat_scale: meters_per_degree,
                    lng_scale: meters_per_degree * origin.latitude.to_radians().cos(),
                }
            }
        }
    }

    #[inline]
    fn project(&self, p: &GpsPoint) -> (f64, f64) {
        (p.latitude * self.lat_scale, p.longitude * self.lng_scale)
    }
}

#[inline]
fn distance(a: (f64, f64), b: (f64, f64)) -> f64 {
    let dx = b.0 - a.0;
    let dy = b.1 - a.1;
    (dx * dx + dy * dy).sqrt()
}

/// Distance from `p` to the segment `a`-`b` on the plane.
fn segment_distance(p: (f64, f64), a: (f64, f64), b: (f64, f64)) -> f64 {
    let ab = (b.0 - a.0, b.1 - a.1);
    let len_sq = ab.0 * ab.0 + ab.1 * ab.1;

    // Degenerate segment (repeated GPS fix)
    if len_sq == 0.0 {
        return distance(p, a);
    }

    let ap = (p.0 - a.0, p.1 - a.1);
    let t = ((ap.0 * ab.0 + ap.1 * ab.1) / len_sq).clamp(0.0, 1.0);
    let projection = (a.0 + t * ab.0, a.1 + t * ab.1);

    distance(p, projection)
}

/// Degree-space distance from `point` to the segment `a`-`b`.
///
/// # Example
/// ```
/// use summit_engine::{GpsPoint, distance_point_to_segment};
///
/// let a = GpsPoint::new(0.0, 0.0);
/// let b = GpsPoint::new(0.0, 1.0);
///
/// // Projection falls inside the segment
/// let d = distance_point_to_segment(&GpsPoint::new(0.5, 0.5), &a, &b);
/// assert!((d - 0.5).abs() < 1e-12);
///
/// // Projection clamped to the endpoint
/// let d = distance_point_to_segment(&GpsPoint::new(0.0, 2.0), &a, &b);
/// assert!((d - 1.0).abs() < 1e-12);
/// ```
pub fn distance_point_to_segment(point: &GpsPoint, a: &GpsPoint, b: &GpsPoint) -> f64 {
    let plane = Plane::new(point, DistanceMetric::Planar);
    segment_distance(plane.project(point), plane.project(a), plane.project(b))
}

/// Whether `track` passes strictly closer than `threshold` (degrees) to `point`.
///
/// Returns as soon as any segment comes within the threshold. A single-point
/// track is compared by point distance; an empty track is never close.
pub fn is_within_threshold(track: &[GpsPoint], point: &GpsPoint, threshold: f64) -> bool {
    is_within_threshold_using(track, point, threshold, DistanceMetric::Planar)
}

/// [`is_within_threshold`] with an explicit distance metric.
pub fn is_within_threshold_using(
    track: &[GpsPoint],
    point: &GpsPoint,
    threshold: f64,
    metric: DistanceMetric,
) -> bool {
    let plane = Plane::new(point, metric);
    let p = plane.project(point);

    let (first, rest) = match track.split_first() {
        Some(split) => split,
        None => return false,
    };

    let mut prev = plane.project(first);
    if rest.is_empty() {
        return distance(p, prev) < threshold;
    }

    let mut min_dist = f64::INFINITY;
    for next in rest {
        let cur = plane.project(next);
        let seg_dist = segment_distance(p, prev, cur);
        if seg_dist < min_dist {
            min_dist = seg_dist;
        }
        if min_dist < threshold {
            return true;
        }
        prev = cur;
    }

    false
}

/// Minimum degree-space distance from `point` to `track`, `None` when empty.
///
/// Full scan without early exit; for diagnostics.
pub fn min_distance_to_track(track: &[GpsPoint], point: &GpsPoint) -> Option<f64> {
    min_distance_using(track, point, DistanceMetric::Planar)
}

/// [`min_distance_to_track`] with an explicit distance metric.
pub fn min_distance_using(
    track: &[GpsPoint],
    point: &GpsPoint,
    metric: DistanceMetric,
) -> Option<f64> {
    let plane = Plane::new(point, metric);
    let p = plane.project(point);

    match track {
        [] => None,
        [only] => Some(distance(p, plane.project(only))),
        _ => Some(
            track
                .windows(2)
                .map(|w| segment_distance(p, plane.project(&w[0]), plane.project(&w[1])))
                .fold(f64::INFINITY, f64::min),
        ),
    }
}
