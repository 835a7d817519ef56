//! Encoded polyline decoding (Google polyline algorithm, precision 5).
//!
//! Activity tracks arrive from the fitness provider as compact ASCII
//! strings: each coordinate is scaled by 1e5, delta-encoded against the
//! previous point and written as base-32 chunks offset by 63. Malformed
//! input is a recoverable [`DecodeError`], never a panic.

use geo::LineString;
use thiserror::Error;

use crate::error::{Result, SummitError};
use crate::GpsPoint;

/// Decimal places carried by provider polylines.
pub const POLYLINE_PRECISION: u32 = 5;

/// The encoded string ended mid-codeword or produced an invalid coordinate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed polyline: {message}")]
pub struct DecodeError {
    pub message: String,
}

impl DecodeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Decode an encoded polyline into an ordered track.
///
/// An empty string decodes to an empty track.
///
/// # Example
/// ```
/// use summit_engine::codec::decode;
///
/// let track = decode("_p~iF~ps|U_ulLnnqC_mqNvxq`@").unwrap();
/// assert_eq!(track.len(), 3);
/// assert!((track[0].latitude - 38.5).abs() < 1e-9);
/// assert!((track[0].longitude + 120.2).abs() < 1e-9);
/// ```
pub fn decode(encoded: &str) -> std::result::Result<Vec<GpsPoint>, DecodeError> {
    if encoded.is_empty() {
        return Ok(Vec::new());
    }

    check_codewords(encoded)?;

    // geo coordinates are (x, y) = (lng, lat)
    let line = polyline::decode_polyline(encoded, POLYLINE_PRECISION)
        .map_err(|e| DecodeError::new(e.to_string()))?;

    let track: Vec<GpsPoint> = line.coords().map(|c| GpsPoint::new(c.y, c.x)).collect();
    if let Some(index) = first_invalid(&track) {
        return Err(DecodeError::new(format!(
            "coordinate out of range at point {}",
            index
        )));
    }
    Ok(track)
}

fn first_invalid(track: &[GpsPoint]) -> Option<usize> {
    track.iter().position(|p| !p.is_valid())
}

/// Reject input that ends mid-codeword, carries a latitude without its
/// longitude, or contains bytes outside the encoding alphabet.
fn check_codewords(encoded: &str) -> std::result::Result<(), DecodeError> {
    let mut values = 0usize;
    let mut in_codeword = false;

    for (index, byte) in encoded.bytes().enumerate() {
        if !(63..=126).contains(&byte) {
            return Err(DecodeError::new(format!(
                "invalid character {:?} at index {}",
                byte as char, index
            )));
        }
        // Chunks with the 0x20 bit set continue the current value
        in_codeword = (byte - 63) & 0x20 != 0;
        if !in_codeword {
            values += 1;
        }
    }

    if in_codeword {
        return Err(DecodeError::new("input ends mid-codeword"));
    }
    if values % 2 != 0 {
        return Err(DecodeError::new("latitude without matching longitude"));
    }
    Ok(())
}

/// Encode a track as a polyline string, the inverse of [`decode`].
///
/// Fails with [`SummitError::InvalidCoordinates`] when a point lies outside
/// WGS84 range.
pub fn encode(track: &[GpsPoint]) -> Result<String> {
    if track.is_empty() {
        return Ok(String::new());
    }
    if let Some(index) = first_invalid(track) {
        return Err(SummitError::InvalidCoordinates {
            message: format!("point {} out of range", index),
        });
    }

    let line: LineString<f64> = track.iter().map(|p| (p.longitude, p.latitude)).collect();

    polyline::encode_coordinates(line, POLYLINE_PRECISION).map_err(|e| {
        SummitError::InvalidCoordinates {
            message: e.to_string(),
        }
    })
}
