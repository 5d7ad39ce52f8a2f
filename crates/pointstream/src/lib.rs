// src/lib.rs
//! Streaming point-cloud buffer manager.
//!
//! Polls a sensor service for JSON point clouds, turns every sample into a
//! GPU-ready instance on a bounded worker pool, maps the samples onto a
//! fixed-capacity cell pool (one cell per point, or a voxel grid lit up around
//! each point) and publishes double-buffered frames for an external renderer.

pub mod buffer;
pub mod config;
pub mod data;
pub mod error;
pub mod grid;
pub mod ingest;
pub mod metrics;
pub mod pool;
pub mod scheduler;
pub mod transform;

pub use buffer::{BufferFrame, RenderState};
pub use config::{FillMode, PipelineConfig};
pub use data::{Batch, Bounds, DrawArgs, InstanceRaw, Sample};
pub use error::{BufferError, ConfigError, IngestError, InitError, PoolError, TransportError};
pub use ingest::{HttpTransport, IngestClient, Transport};
pub use metrics::PipelineMetrics;
pub use scheduler::{CycleOutcome, Pipeline, PipelineState};
