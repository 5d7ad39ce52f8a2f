//! Error types for the point-cloud pipeline.
//!
//! Only [`ConfigError`], [`BufferError`] and [`InitError`] are fatal, and only
//! during start-up. Everything raised while the pipeline is running is
//! absorbed by the scheduler.

use std::time::Duration;
use thiserror::Error;

/// Failure reported by a [`crate::ingest::Transport`] implementation.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The request could not be sent or the connection broke.
    #[error("request failed: {0}")]
    Request(String),

    /// The server answered with a non-success HTTP status.
    #[error("server answered HTTP {0}")]
    HttpStatus(u16),
}

/// Errors raised while fetching and decoding a point-cloud payload.
#[derive(Debug, Error)]
pub enum IngestError {
    /// Network failure or unusable HTTP response.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The fetch did not complete within the configured timeout.
    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),

    /// The payload's `status` field was not `"success"`.
    #[error("sensor reported status {0:?}")]
    Status(String),

    /// The payload was malformed or its arrays were inconsistent.
    #[error("decode error: {0}")]
    Decode(String),
}

impl IngestError {
    /// Creates a decode error.
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    /// Short, stable label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport",
            Self::Timeout(_) => "timeout",
            Self::Status(_) => "status",
            Self::Decode(_) => "decode",
        }
    }
}

/// Non-fatal pool conditions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    /// The batch held more points than the pool has slots; the excess was dropped.
    #[error("batch overflowed pool capacity {capacity}: dropped {dropped} points")]
    Overflow { dropped: usize, capacity: usize },
}

/// Buffer storage errors. Fatal at start-up.
#[derive(Debug, Error)]
pub enum BufferError {
    #[error("failed to allocate storage for {requested} entries: {reason}")]
    AllocationFailed { requested: usize, reason: String },
}

/// Invalid pipeline configuration.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    NotPositive { field: &'static str },

    #[error("grid of {cells} cells exceeds max_entries {max_entries}")]
    GridTooLarge { cells: u64, max_entries: u32 },

    #[error("invalid server url {0:?}")]
    ServerUrl(String),
}

/// Anything that can abort [`crate::scheduler::Pipeline::new`].
#[derive(Debug, Error)]
pub enum InitError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Buffer(#[from] BufferError),

    #[error("failed to build transform worker pool: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),

    #[error("failed to register metrics: {0}")]
    Metrics(#[from] prometheus::Error),
}
