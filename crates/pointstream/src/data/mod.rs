// src/data/mod.rs
//! Data handling for the point-cloud pipeline.
//!
//! This module provides:
//! - The per-cycle sample types and the GPU-ready instance layout.
//! - Decoding of the sensor's JSON payload.

pub mod payload;
pub mod types;

// Re-export commonly used types for convenience.
pub use self::payload::decode_payload;
pub use self::types::{Batch, Bounds, DrawArgs, InstanceRaw, Sample};
