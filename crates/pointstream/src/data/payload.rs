//! Decoding of the sensor service's JSON payload.
//!
//! ```text
//! { "status": "success", "points": [[x, y, z], ...], "colors": [[r, g, b], ...] }
//! ```
//!
//! Any other status (the sensor answers `"no data"` before its first
//! capture) carries no arrays.

use super::types::Batch;
use crate::error::IngestError;
use glam::Vec3;
use serde::Deserialize;

pub const STATUS_SUCCESS: &str = "success";

#[derive(Debug, Deserialize)]
struct WirePayload {
    status: String,
    #[serde(default)]
    points: Option<Vec<[f32; 3]>>,
    #[serde(default)]
    colors: Option<Vec<[f32; 3]>>,
}

/// Parses one payload into a [`Batch`].
pub fn decode_payload(bytes: &[u8]) -> Result<Batch, IngestError> {
    let wire: WirePayload =
        serde_json::from_slice(bytes).map_err(|e| IngestError::decode(e.to_string()))?;

    if wire.status != STATUS_SUCCESS {
        return Err(IngestError::Status(wire.status));
    }

    let points = wire
        .points
        .ok_or_else(|| IngestError::decode("missing `points` array"))?;
    let colors = wire
        .colors
        .ok_or_else(|| IngestError::decode("missing `colors` array"))?;

    if points.iter().chain(&colors).flatten().any(|v| !v.is_finite()) {
        return Err(IngestError::decode("non-finite coordinate"));
    }

    Batch::new(
        points.into_iter().map(Vec3::from_array).collect(),
        colors.into_iter().map(Vec3::from_array).collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_parallel_arrays_in_order() {
        let json = br#"{"status":"success","points":[[0,0,0],[1,1,1]],"colors":[[1,0,0],[0,1,0]]}"#;
        let batch = decode_payload(json).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.positions(), &[Vec3::ZERO, Vec3::ONE]);
        assert_eq!(batch.colors(), &[Vec3::X, Vec3::Y]);
    }

    #[test]
    fn empty_success_is_an_empty_batch() {
        let batch = decode_payload(br#"{"status":"success","points":[],"colors":[]}"#).unwrap();
        assert!(batch.is_empty());
    }

    #[test]
    fn no_data_status_is_status_error() {
        let err = decode_payload(br#"{"status":"no data"}"#).unwrap_err();
        assert!(matches!(err, IngestError::Status(s) if s == "no data"));
    }

    #[test]
    fn malformed_payloads_are_decode_errors() {
        let cases: &[&[u8]] = &[
            b"not json",
            br#"{"points":[[0,0,0]],"colors":[[0,0,0]]}"#,
            br#"{"status":"success","points":[[0,0]],"colors":[[0,0,0]]}"#,
            br#"{"status":"success","points":[[0,0,0]],"colors":[[0,0,0],[1,1,1]]}"#,
            br#"{"status":"success","points":[[0,0,0]]}"#,
            br#"{"status":"success","points":[[0,0,"x"]],"colors":[[0,0,0]]}"#,
        ];
        for case in cases {
            let err = decode_payload(case).unwrap_err();
            assert!(
                matches!(err, IngestError::Decode(_)),
                "{:?} -> {err:?}",
                String::from_utf8_lossy(case)
            );
        }
    }
}
