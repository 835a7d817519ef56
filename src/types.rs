//! Domain records consumed and produced by the detection pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::GpsPoint;

pub type ActivityId = i64;
pub type UserId = i64;
pub type SummitId = i64;

/// A known summit from the catalog.
///
/// Only `id`, `latitude` and `longitude` drive detection; `name` is used
/// for logging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summit {
    pub id: SummitId,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    /// Elevation in meters (optional)
    pub elevation_meters: Option<f64>,
}

impl Summit {
    pub fn new(id: SummitId, name: &str, latitude: f64, longitude: f64) -> Self {
        Self {
            id,
            name: name.to_string(),
            latitude,
            longitude,
            elevation_meters: None,
        }
    }

    /// Summit location as a GPS point.
    pub fn point(&self) -> GpsPoint {
        GpsPoint::new(self.latitude, self.longitude)
    }
}

/// An activity owned by one user, carrying its encoded track.
///
/// `has_summit` and `processed` are the only fields the engine writes.
/// `processed` means detection has run, not that it succeeded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    pub id: ActivityId,
    pub user_id: UserId,
    pub name: String,
    /// Encoded polyline (precision 5), empty when the activity has no route
    pub polyline: String,
    pub start_date: DateTime<Utc>,
    pub has_summit: bool,
    pub processed: bool,
}

impl Activity {
    /// Create an unprocessed activity.
    pub fn new(id: ActivityId, user_id: UserId, polyline: &str, start_date: DateTime<Utc>) -> Self {
        Self {
            id,
            user_id,
            name: String::new(),
            polyline: polyline.to_string(),
            start_date,
            has_summit: false,
            processed: false,
        }
    }

    pub fn has_route(&self) -> bool {
        !self.polyline.is_empty()
    }
}

/// "User U summited summit S during activity A at time T".
///
/// Keyed by (user, summit, activity).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummitRecord {
    pub user_id: UserId,
    pub summit_id: SummitId,
    pub activity_id: ActivityId,
    pub summited_at: DateTime<Utc>,
}

impl SummitRecord {
    pub fn key(&self) -> (UserId, SummitId, ActivityId) {
        (self.user_id, self.summit_id, self.activity_id)
    }
}
