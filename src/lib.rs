//! # Summit Engine
//!
//! Detects which known summits a GPS-tracked activity passed close enough
//! to count as "visited".
//!
//! This library provides:
//! - Encoded polyline decoding (precision 5)
//! - Bounding-box candidate filtering against a summit catalog
//! - Point-to-polyline proximity evaluation with early exit
//! - An idempotent per-activity detection pipeline
//! - A backlog scheduler and a bounded background worker
//!
//! ## Features
//!
//! - **`persistence`** (default) - SQLite-backed stores via rusqlite
//! - **`parallel`** - Evaluate candidate summits in parallel with rayon
//! - **`full`** - Enable all features
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use chrono::Utc;
//! use summit_engine::{Activity, DetectionConfig, MemoryStore, Summit, SummitDetector};
//!
//! let store = Arc::new(MemoryStore::new());
//! store.add_summit(Summit::new(1, "Midpoint Peak", 39.6, -120.575));
//! store.add_activity(Activity::new(10, 1, "_p~iF~ps|U_ulLnnqC_mqNvxq`@", Utc::now()));
//!
//! let detector = SummitDetector::new(
//!     store.clone(),
//!     store.clone(),
//!     store.clone(),
//!     DetectionConfig::default(),
//! )
//! .unwrap();
//!
//! let mut activity = store.activity(10).unwrap();
//! let outcome = detector.detect_summits(&mut activity).unwrap();
//! assert_eq!(outcome.summit_count(), 1);
//! assert!(activity.has_summit && activity.processed);
//! ```

use rstar::AABB;
use serde::{Deserialize, Serialize};

// Unified error handling
pub mod error;
pub use error::{OptionExt, Result, SummitError};

// Detection and worker configuration
pub mod config;
pub use config::{DetectionConfig, DistanceMetric, WorkerConfig};

// Domain records
pub mod types;
pub use types::{Activity, ActivityId, Summit, SummitId, SummitRecord, UserId};

// Geographic utilities (haversine, meters/degrees)
pub mod geo_utils;

// Encoded polyline codec
pub mod codec;
pub use codec::DecodeError;

// Bounding box candidate filter
pub mod candidates;
pub use candidates::{candidate_summits, search_bounds};

// Point-to-polyline proximity evaluation
pub mod proximity;
pub use proximity::{distance_point_to_segment, is_within_threshold, min_distance_to_track};

// Storage contracts and in-memory implementation
pub mod store;
pub use store::{ActivityRepository, MemoryStore, SummitCatalog, SummitRecordStore};

// SQLite implementation of the storage contracts
#[cfg(feature = "persistence")]
pub mod persistence;
#[cfg(feature = "persistence")]
pub use persistence::SqliteStore;

// Per-activity detection orchestration
pub mod detector;
pub use detector::{DetectionOutcome, SummitDetector};

// Backlog sweeps and background worker
pub mod scheduler;
pub use scheduler::{
    BacklogScheduler, DetectionJob, DetectionWorker, SweepSummary, WorkerStats,
};

// ============================================================================
// Core Types
// ============================================================================

/// A GPS coordinate with latitude and longitude in decimal degrees.
///
/// # Example
/// ```
/// use summit_engine::GpsPoint;
/// let point = GpsPoint::new(46.5577, 7.9789); // Eiger
/// ```
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

/// Axis-aligned bounding box in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl Bounds {
    /// Create bounds from GPS points. O(n) scan, `None` for an empty track.
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

    /// Grow the box by `buffer` degrees on every side.
    pub fn expand(&self, buffer: f64) -> Self {
        Self {
            min_lat: self.min_lat - buffer,
            max_lat: self.max_lat + buffer,
            min_lng: self.min_lng - buffer,
            max_lng: self.max_lng + buffer,
        }
    }

    /// Whether a point lies inside the box (edges inclusive).
    pub fn contains(&self, point: &GpsPoint) -> bool {
        point.latitude >= self.min_lat
            && point.latitude <= self.max_lat
            && point.longitude >= self.min_lng
            && point.longitude <= self.max_lng
    }

    /// R-tree envelope in (lng, lat) order.
    pub fn envelope(&self) -> AABB<[f64; 2]> {
        AABB::from_corners([self.min_lng, self.min_lat], [self.max_lng, self.max_lat])
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_track() -> Vec<GpsPoint> {
        vec![
            GpsPoint::new(46.5500, 7.9700),
            GpsPoint::new(46.5577, 7.9789),
            GpsPoint::new(46.5620, 7.9650),
        ]
    }

    #[test]
    fn test_gps_point_validation() {
        assert!(GpsPoint::new(46.5577, 7.9789).is_valid());
        assert!(!GpsPoint::new(91.0, 0.0).is_valid());
        assert!(!GpsPoint::new(0.0, 181.0).is_valid());
        assert!(!GpsPoint::new(f64::NAN, 0.0).is_valid());
    }

    #[test]
    fn test_bounds_from_points() {
        let bounds = Bounds::from_points(&sample_track()).unwrap();
        assert_eq!(bounds.min_lat, 46.5500);
        assert_eq!(bounds.max_lat, 46.5620);
        assert_eq!(bounds.min_lng, 7.9650);
        assert_eq!(bounds.max_lng, 7.9789);
        assert!(Bounds::from_points(&[]).is_none());
    }

    #[test]
    fn test_bounds_expand_and_contains() {
        let bounds = Bounds::from_points(&sample_track()).unwrap();
        let outside = GpsPoint::new(46.5700, 7.9700);
        assert!(!bounds.contains(&outside));
        assert!(bounds.expand(0.01).contains(&outside));
        assert!(!bounds.expand(0.001).contains(&outside));
    }

    #[test]
    fn test_single_point_bounds() {
        let p = GpsPoint::new(10.0, 20.0);
        let bounds = Bounds::from_points(&[p]).unwrap();
        assert!(bounds.contains(&p));
        assert_eq!(bounds.min_lat, bounds.max_lat);
        assert!(!bounds.contains(&GpsPoint::new(10.0, 20.000001)));
    }
}
