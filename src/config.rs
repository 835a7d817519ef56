//! Detection and worker configuration.
//!
//! Both configs have sensible defaults and can be overridden from the
//! process environment. Unset variables fall back to the defaults;
//! variables that are set but unparsable are configuration errors.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SummitError};
use crate::geo_utils::meters_to_degrees;

/// How the proximity evaluator measures track-to-summit distance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DistanceMetric {
    /// Raw latitude/longitude deltas treated as a Euclidean plane.
    /// Thresholds are in degrees. Longitude degrees shrink away from
    /// the equator, so this over-reports east-west distances.
    #[default]
    Planar,
    /// Local equirectangular projection around the summit.
    /// Thresholds are in meters.
    Equirectangular,
}

impl FromStr for DistanceMetric {
    type Err = SummitError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "planar" | "degrees" => Ok(DistanceMetric::Planar),
            "equirectangular" | "meters" => Ok(DistanceMetric::Equirectangular),
            other => Err(SummitError::config(format!(
                "unknown distance metric '{}'",
                other
            ))),
        }
    }
}

/// Configuration for summit detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Maximum track-to-summit distance for a summit to count as reached,
    /// in the unit of `distance_metric`.
    /// Default: 0.0007 degrees (~70 meters)
    pub summit_threshold: f64,

    /// Margin added on every side of the track's bounding box before
    /// querying the catalog, in degrees. One degree is ~111 km of latitude
    /// but less longitude away from the equator.
    /// Default: 0.01 (~1 km)
    pub buffer_degrees: f64,

    /// Distance measure used by the proximity evaluator.
    /// Default: Planar
    pub distance_metric: DistanceMetric,

    /// Leave activities unprocessed when the catalog lookup fails so the
    /// next sweep retries them. When false they are marked processed.
    /// Default: false
    pub retry_lookup_failures: bool,
}

/// Default summit threshold in degree space (~70 m).
pub const DEFAULT_SUMMIT_THRESHOLD: f64 = 0.0007;

/// Default bounding box buffer in degrees (~1 km).
pub const DEFAULT_BUFFER_DEGREES: f64 = 0.01;

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            summit_threshold: DEFAULT_SUMMIT_THRESHOLD,
            buffer_degrees: DEFAULT_BUFFER_DEGREES,
            distance_metric: DistanceMetric::Planar,
            retry_lookup_failures: false,
        }
    }
}

impl DetectionConfig {
    /// Load from `SUMMIT_THRESHOLD`, `SUMMIT_BUFFER_DEGREES`,
    /// `SUMMIT_DISTANCE_METRIC` and `SUMMIT_RETRY_LOOKUP_FAILURES`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup (environment, config map, tests).
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let config = Self {
            summit_threshold: parse_var(&lookup, "SUMMIT_THRESHOLD")?
                .unwrap_or(defaults.summit_threshold),
            buffer_degrees: parse_var(&lookup, "SUMMIT_BUFFER_DEGREES")?
                .unwrap_or(defaults.buffer_degrees),
            distance_metric: parse_var(&lookup, "SUMMIT_DISTANCE_METRIC")?
                .unwrap_or(defaults.distance_metric),
            retry_lookup_failures: parse_var(&lookup, "SUMMIT_RETRY_LOOKUP_FAILURES")?
                .unwrap_or(defaults.retry_lookup_failures),
        };
        config.validate()?;
        Ok(config)
    }

    /// Planar config whose threshold and buffer correspond to the given
    /// distances at `reference_latitude`.
    ///
    /// Converts with the longitude scale, so the east-west reach matches
    /// the requested distance and the north-south reach is larger.
    pub fn for_region(threshold_meters: f64, buffer_meters: f64, reference_latitude: f64) -> Self {
        Self {
            summit_threshold: meters_to_degrees(threshold_meters, reference_latitude),
            buffer_degrees: meters_to_degrees(buffer_meters, reference_latitude),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.summit_threshold.is_finite() || self.summit_threshold <= 0.0 {
            return Err(SummitError::config(format!(
                "summit_threshold must be positive, got {}",
                self.summit_threshold
            )));
        }
        if !self.buffer_degrees.is_finite() || self.buffer_degrees < 0.0 {
            return Err(SummitError::config(format!(
                "buffer_degrees must be non-negative, got {}",
                self.buffer_degrees
            )));
        }
        Ok(())
    }
}

/// Configuration for the background detection worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Jobs that may wait in the queue before submissions are rejected.
    /// Default: 64
    pub queue_capacity: usize,

    /// Detection jobs allowed in flight at once.
    /// Default: 4
    pub max_concurrency: usize,

    /// Interval between automatic backlog sweeps (None = only on request).
    /// The first sweep runs immediately on start.
    /// Default: 15 minutes
    pub sweep_interval: Option<Duration>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            max_concurrency: 4,
            sweep_interval: Some(Duration::from_secs(15 * 60)),
        }
    }
}

impl WorkerConfig {
    /// Load from `SUMMIT_QUEUE_CAPACITY`, `SUMMIT_MAX_CONCURRENCY` and
    /// `SUMMIT_SWEEP_INTERVAL_SECS` (0 disables periodic sweeps).
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let sweep_interval = match parse_var::<u64, _>(&lookup, "SUMMIT_SWEEP_INTERVAL_SECS")? {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => defaults.sweep_interval,
        };
        let config = Self {
            queue_capacity: parse_var(&lookup, "SUMMIT_QUEUE_CAPACITY")?
                .unwrap_or(defaults.queue_capacity),
            max_concurrency: parse_var(&lookup, "SUMMIT_MAX_CONCURRENCY")?
                .unwrap_or(defaults.max_concurrency),
            sweep_interval,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(SummitError::config("queue_capacity must be at least 1"));
        }
        if self.max_concurrency == 0 {
            return Err(SummitError::config("max_concurrency must be at least 1"));
        }
        if self.sweep_interval == Some(Duration::ZERO) {
            return Err(SummitError::config(
                "sweep_interval must be positive (use None to disable)",
            ));
        }
        Ok(())
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| SummitError::config(format!("{}='{}': {}", key, raw, e))),
    }
}
