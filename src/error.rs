//! Unified error handling for the summit engine.
//!
//! Every fallible operation in the crate returns [`Result`]. The detector
//! converts the recoverable variants (no route, decode, candidate lookup)
//! into a [`DetectionOutcome`](crate::DetectionOutcome) so they never reach
//! the scheduler as failures.

use thiserror::Error;

use crate::codec::DecodeError;
use crate::types::ActivityId;

/// Unified error type for summit engine operations.
#[derive(Debug, Error)]
pub enum SummitError {
    /// The activity has no track to evaluate
    #[error("no route")]
    NoRoute,

    /// The encoded polyline could not be decoded
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// The summit catalog could not answer the bounding-box query
    #[error("candidate lookup failed: {message}")]
    CandidateLookup { message: String },

    /// No activity with this id exists in the repository
    #[error("activity {0} not found")]
    ActivityNotFound(ActivityId),

    /// A track contains coordinates that cannot be encoded
    #[error("invalid coordinates: {message}")]
    InvalidCoordinates { message: String },

    /// Persistence/storage error
    #[error("storage error: {message}")]
    Storage { message: String },

    /// Configuration error
    #[error("configuration error: {message}")]
    Config { message: String },

    /// Background worker error (queue full, worker stopped)
    #[error("scheduler error: {message}")]
    Scheduler { message: String },
}

impl SummitError {
    pub(crate) fn storage(message: impl Into<String>) -> Self {
        SummitError::Storage {
            message: message.into(),
        }
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        SummitError::Config {
            message: message.into(),
        }
    }

    pub(crate) fn scheduler(message: impl Into<String>) -> Self {
        SummitError::Scheduler {
            message: message.into(),
        }
    }
}

#[cfg(feature = "persistence")]
impl From<rusqlite::Error> for SummitError {
    fn from(err: rusqlite::Error) -> Self {
        SummitError::storage(err.to_string())
    }
}

/// Result type alias for summit engine operations.
pub type Result<T> = std::result::Result<T, SummitError>;

/// Extension trait for converting Option to SummitError.
pub trait OptionExt<T> {
    /// Convert Option to Result with an activity-not-found error.
    fn ok_or_not_found(self, activity_id: ActivityId) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_not_found(self, activity_id: ActivityId) -> Result<T> {
        self.ok_or(SummitError::ActivityNotFound(activity_id))
    }
}
