//! Bounding box candidate filter.
//!
//! Narrows the summit catalog to the summits inside the track's bounding
//! box grown by a buffer, so the proximity evaluator only sees a handful of
//! plausible candidates per activity. False positives are expected here and
//! are removed by [`crate::proximity`].

use log::debug;

use crate::error::{Result, SummitError};
use crate::store::SummitCatalog;
use crate::{Bounds, GpsPoint, Summit};

/// Bounding box of the track grown by `buffer_degrees` on every side.
///
/// An empty track has no route and never produces a query box.
pub fn search_bounds(track: &[GpsPoint], buffer_degrees: f64) -> Result<Bounds> {
    let bounds = Bounds::from_points(track).ok_or(SummitError::NoRoute)?;
    Ok(bounds.expand(buffer_degrees))
}

/// Summits from `catalog` inside the buffered bounding box of `track`.
///
/// Catalog failures surface as [`SummitError::CandidateLookup`]. Summits a
/// catalog returns outside the box are dropped.
pub fn candidate_summits<C>(
    track: &[GpsPoint],
    catalog: &C,
    buffer_degrees: f64,
) -> Result<Vec<Summit>>
where
    C: SummitCatalog + ?Sized,
{
    let bounds = search_bounds(track, buffer_degrees)?;

    let mut summits = catalog
        .summits_within_bounds(&bounds)
        .map_err(|e| match e {
            SummitError::CandidateLookup { .. } => e,
            other => SummitError::CandidateLookup {
                message: other.to_string(),
            },
        })?;

    let returned = summits.len();
    summits.retain(|summit| bounds.contains(&summit.point()));
    if summits.len() < returned {
        debug!(
            "[Candidates] Dropped {} catalog summits outside the search box",
            returned - summits.len()
        );
    }
    Ok(summits)
}
