//! Pipeline configuration.

use crate::error::ConfigError;
use std::time::Duration;

/// How incoming points are mapped onto pool cells.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FillMode {
    /// One cell per point, in batch order.
    Dense,
    /// A fixed cubic grid of cells; every cell within `activation_distance`
    /// of a point lights up with that point's color.
    Grid { grid_size: u32, grid_spacing: f32 },
}

/// Everything the pipeline needs to run. Immutable once validated.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Endpoint returning the JSON point-cloud payload.
    pub server_url: String,
    /// Cadence of fetch cycles.
    pub poll_interval: Duration,
    /// A fetch slower than this counts as a transport failure.
    pub fetch_timeout: Duration,
    /// Pool capacity. Never exceeded by the number of active cells.
    pub max_entries: u32,
    /// Uniform scale of a dense-mode point.
    pub cell_scale: f32,
    /// Grid-mode activation radius in world units.
    pub activation_distance: f32,
    pub mode: FillMode,
    /// Points per work item in the transform stage.
    pub chunk_size: usize,
    /// Transform worker threads; 0 lets rayon pick.
    pub worker_threads: usize,
    /// Consecutive ingest failures before the scheduler enters `Faulted`.
    pub fault_threshold: u32,
    /// Wait in `Faulted` before resuming.
    pub fault_backoff: Duration,
    /// Edge length of the culling volume centered on the anchor.
    pub bounds_extent: f32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:5001/get_point_cloud".into(),
            poll_interval: Duration::from_millis(100),
            fetch_timeout: Duration::from_secs(2),
            max_entries: 100_000,
            cell_scale: 0.01,
            activation_distance: 0.2,
            mode: FillMode::Dense,
            chunk_size: 64,
            worker_threads: 0,
            fault_threshold: 5,
            fault_backoff: Duration::from_secs(1),
            bounds_extent: 10_000.0,
        }
    }
}

impl PipelineConfig {
    /// Checks all invariants and returns the config unchanged if they hold.
    pub fn validate(self) -> Result<Self, ConfigError> {
        if !(self.server_url.starts_with("http://") || self.server_url.starts_with("https://")) {
            return Err(ConfigError::ServerUrl(self.server_url));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::NotPositive { field: "poll_interval" });
        }
        if self.fetch_timeout.is_zero() {
            return Err(ConfigError::NotPositive { field: "fetch_timeout" });
        }
        if self.max_entries == 0 {
            return Err(ConfigError::NotPositive { field: "max_entries" });
        }
        if !(self.cell_scale > 0.0) {
            return Err(ConfigError::NotPositive { field: "cell_scale" });
        }
        if self.chunk_size == 0 {
            return Err(ConfigError::NotPositive { field: "chunk_size" });
        }
        if self.fault_threshold == 0 {
            return Err(ConfigError::NotPositive { field: "fault_threshold" });
        }
        if !(self.bounds_extent > 0.0) {
            return Err(ConfigError::NotPositive { field: "bounds_extent" });
        }
        if let FillMode::Grid { grid_size, grid_spacing } = self.mode {
            if grid_size == 0 {
                return Err(ConfigError::NotPositive { field: "grid_size" });
            }
            if !(grid_spacing > 0.0) {
                return Err(ConfigError::NotPositive { field: "grid_spacing" });
            }
            if !(self.activation_distance > 0.0) {
                return Err(ConfigError::NotPositive { field: "activation_distance" });
            }
            let cells = u64::from(grid_size).pow(3);
            if cells > u64::from(self.max_entries) {
                return Err(ConfigError::GridTooLarge {
                    cells,
                    max_entries: self.max_entries,
                });
            }
        }
        Ok(self)
    }

    /// Number of slots the pool and buffers are sized for.
    pub fn capacity(&self) -> usize {
        match self.mode {
            FillMode::Dense => self.max_entries as usize,
            FillMode::Grid { grid_size, .. } => (grid_size as usize).pow(3),
        }
    }
}
