//! Per-activity summit detection.
//!
//! [`SummitDetector::detect_summits`] runs the whole pipeline for one
//! activity: decode the track, narrow the catalog to bounding-box
//! candidates, evaluate proximity for each candidate, upsert a record for
//! every summit reached and persist the activity flags.
//!
//! Data problems (no route, malformed polyline) and catalog failures are
//! converted into a [`DetectionOutcome`] and logged. Only failure to
//! persist the activity itself is returned as an error.

use std::sync::Arc;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::candidates::candidate_summits;
use crate::codec;
use crate::config::{DetectionConfig, DistanceMetric};
use crate::error::{Result, SummitError};
use crate::proximity::{is_within_threshold_using, min_distance_using};
use crate::store::{ActivityRepository, SummitCatalog, SummitRecordStore};
use crate::{Activity, GpsPoint, Summit, SummitId, SummitRecord};

/// How detection ended for one activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DetectionOutcome {
    /// The activity has no polyline.
    NoRoute,
    /// The polyline could not be decoded.
    DecodeError { message: String },
    /// The summit catalog could not be queried.
    LookupError { message: String },
    /// Detection ran to completion.
    Completed {
        /// Summits reached, in candidate order
        summit_ids: Vec<SummitId>,
        /// Summits handed to the proximity evaluator
        candidates: usize,
    },
}

impl DetectionOutcome {
    /// Number of summits reached (0 for every non-completed outcome).
    pub fn summit_count(&self) -> usize {
        match self {
            DetectionOutcome::Completed { summit_ids, .. } => summit_ids.len(),
            _ => 0,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, DetectionOutcome::Completed { .. })
    }

    /// Short label for logs and summaries.
    pub fn label(&self) -> &'static str {
        match self {
            DetectionOutcome::NoRoute => "no-route",
            DetectionOutcome::DecodeError { .. } => "decode-error",
            DetectionOutcome::LookupError { .. } => "lookup-error",
            DetectionOutcome::Completed { .. } => "completed",
        }
    }
}

/// Detects summits for single activities against an injected catalog.
///
/// Cheap to clone; all collaborators are shared behind `Arc`.
#[derive(Clone)]
pub struct SummitDetector {
    activities: Arc<dyn ActivityRepository>,
    catalog: Arc<dyn SummitCatalog>,
    records: Arc<dyn SummitRecordStore>,
    config: DetectionConfig,
}

impl SummitDetector {
    /// Fails with [`SummitError::Config`] when `config` does not validate.
    pub fn new(
        activities: Arc<dyn ActivityRepository>,
        catalog: Arc<dyn SummitCatalog>,
        records: Arc<dyn SummitRecordStore>,
        config: DetectionConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            activities,
            catalog,
            records,
            config,
        })
    }

    pub fn config(&self) -> &DetectionConfig {
        &self.config
    }

    pub fn activities(&self) -> &Arc<dyn ActivityRepository> {
        &self.activities
    }

    /// Run detection for one activity and persist its flags.
    ///
    /// On return `activity` carries the flags that were saved. Every
    /// outcome marks the activity processed, except a lookup error when
    /// `retry_lookup_failures` is enabled.
    pub fn detect_summits(&self, activity: &mut Activity) -> Result<DetectionOutcome> {
        if !activity.has_route() {
            debug!("[SummitDetector] Activity {} has no route, skipping", activity.id);
            return self.finish(activity, DetectionOutcome::NoRoute);
        }

        let track = match codec::decode(&activity.polyline) {
            Ok(track) => track,
            Err(e) => {
                warn!(
                    "[SummitDetector] Activity {}: {}, marking processed",
                    activity.id, e
                );
                return self.finish(
                    activity,
                    DetectionOutcome::DecodeError { message: e.message },
                );
            }
        };

        let candidates = match candidate_summits(
            &track,
            self.catalog.as_ref(),
            self.config.buffer_degrees,
        ) {
            Ok(candidates) => candidates,
            Err(SummitError::NoRoute) => {
                debug!("[SummitDetector] Activity {} decoded to an empty track", activity.id);
                return self.finish(activity, DetectionOutcome::NoRoute);
            }
            Err(e) => {
                warn!(
                    "[SummitDetector] Activity {}: {} ({})",
                    activity.id,
                    e,
                    if self.config.retry_lookup_failures {
                        "will retry"
                    } else {
                        "marking processed"
                    }
                );
                return self.finish(
                    activity,
                    DetectionOutcome::LookupError {
                        message: e.to_string(),
                    },
                );
            }
        };

        debug!(
            "[SummitDetector] Activity {}: {} points, {} candidate summits",
            activity.id,
            track.len(),
            candidates.len()
        );

        let reached = self.qualifying_summits(&track, &candidates);
        let mut summit_ids = Vec::with_capacity(reached.len());

        for summit in reached {
            self.log_nearest_distance(activity, &track, summit);

            let record = SummitRecord {
                user_id: activity.user_id,
                summit_id: summit.id,
                activity_id: activity.id,
                summited_at: activity.start_date,
            };
            if let Err(e) = self.records.upsert_summit_record(&record) {
                warn!(
                    "[SummitDetector] Failed to record summit {} for activity {}: {}",
                    summit.id, activity.id, e
                );
            }
            summit_ids.push(summit.id);
        }

        if !summit_ids.is_empty() {
            info!(
                "[SummitDetector] Activity {}: {} summit(s) reached",
                activity.id,
                summit_ids.len()
            );
        }

        activity.has_summit = !summit_ids.is_empty();
        self.finish(
            activity,
            DetectionOutcome::Completed {
                summit_ids,
                candidates: candidates.len(),
            },
        )
    }

    /// Set the processed flag for `outcome` and persist the activity.
    fn finish(&self, activity: &mut Activity, outcome: DetectionOutcome) -> Result<DetectionOutcome> {
        let retry = self.config.retry_lookup_failures
            && matches!(outcome, DetectionOutcome::LookupError { .. });
        activity.processed = !retry;
        self.activities.save_activity(activity)?;
        Ok(outcome)
    }

    fn reaches(&self, track: &[GpsPoint], summit: &Summit) -> bool {
        is_within_threshold_using(
            track,
            &summit.point(),
            self.config.summit_threshold,
            self.config.distance_metric,
        )
    }

    #[cfg(not(feature = "parallel"))]
    fn qualifying_summits<'a>(&self, track: &[GpsPoint], candidates: &'a [Summit]) -> Vec<&'a Summit> {
        candidates
            .iter()
            .filter(|summit| self.reaches(track, summit))
            .collect()
    }

    #[cfg(feature = "parallel")]
    fn qualifying_summits<'a>(&self, track: &[GpsPoint], candidates: &'a [Summit]) -> Vec<&'a Summit> {
        use rayon::prelude::*;

        candidates
            .par_iter()
            .filter(|summit| self.reaches(track, summit))
            .collect()
    }

    fn log_nearest_distance(&self, activity: &Activity, track: &[GpsPoint], summit: &Summit) {
        if !log::log_enabled!(log::Level::Debug) {
            return;
        }
        if let Some(meters) = min_distance_using(track, &summit.point(), DistanceMetric::Equirectangular) {
            debug!(
                "[SummitDetector] Activity {} passed {:.0}m from {} ({})",
                activity.id, meters, summit.name, summit.id
            );
        }
    }
}
