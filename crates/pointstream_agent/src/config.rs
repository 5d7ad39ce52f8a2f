use clap::{Parser, ValueEnum};
use glam::Vec3;
use pointstream::{FillMode, PipelineConfig};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// One pooled instance per received point.
    Dense,
    /// Fixed voxel grid lit up around received points.
    Grid,
}

/// `pointstream_agent` - headless host for the point-cloud streaming pipeline.
///
/// Polls a sensor service for point clouds, keeps the render buffers up to
/// date and exposes pipeline metrics for Prometheus.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// URL of the sensor's point-cloud endpoint.
    #[arg(long, env = "POINTSTREAM_SERVER_URL", default_value = "http://127.0.0.1:5001/get_point_cloud")]
    pub server_url: String,

    /// The listen address for the agent's Prometheus metrics server.
    #[arg(long, env = "POINTSTREAM_METRICS_LISTEN_ADDR", default_value = "127.0.0.1:9102")]
    pub metrics_listen_addr: String,

    /// Time between fetches, in milliseconds.
    #[arg(long, env = "POINTSTREAM_POLL_INTERVAL_MS", default_value_t = 100)]
    pub poll_interval_ms: u64,

    /// A fetch slower than this is treated as a failure, in milliseconds.
    #[arg(long, env = "POINTSTREAM_FETCH_TIMEOUT_MS", default_value_t = 2000)]
    pub fetch_timeout_ms: u64,

    /// Pool capacity: the most instances a frame can hold.
    #[arg(long, env = "POINTSTREAM_MAX_ENTRIES", default_value_t = 100_000)]
    pub max_entries: u32,

    /// Edge length of a rendered point in dense mode.
    #[arg(long, env = "POINTSTREAM_POINT_SIZE", default_value_t = 0.01)]
    pub point_size: f32,

    #[arg(long, env = "POINTSTREAM_MODE", value_enum, default_value_t = Mode::Dense)]
    pub mode: Mode,

    /// Cells per grid axis (grid mode).
    #[arg(long, env = "POINTSTREAM_GRID_SIZE", default_value_t = 40)]
    pub grid_size: u32,

    /// Distance between grid cells (grid mode).
    #[arg(long, env = "POINTSTREAM_GRID_SPACING", default_value_t = 0.1)]
    pub grid_spacing: f32,

    /// Cells within this distance of a point light up (grid mode).
    #[arg(long, env = "POINTSTREAM_ACTIVATION_DISTANCE", default_value_t = 0.2)]
    pub activation_distance: f32,

    /// Points per transform work item.
    #[arg(long, env = "POINTSTREAM_CHUNK_SIZE", default_value_t = 64)]
    pub chunk_size: usize,

    /// Transform worker threads (0 = one per core).
    #[arg(long, env = "POINTSTREAM_WORKER_THREADS", default_value_t = 0)]
    pub worker_threads: usize,

    /// Consecutive failed fetches before backing off.
    #[arg(long, env = "POINTSTREAM_FAULT_THRESHOLD", default_value_t = 5)]
    pub fault_threshold: u32,

    #[arg(long, env = "POINTSTREAM_FAULT_BACKOFF_MS", default_value_t = 1000)]
    pub fault_backoff_ms: u64,

    /// Edge length of the culling volume around the anchor.
    #[arg(long, env = "POINTSTREAM_BOUNDS_EXTENT", default_value_t = 10_000.0)]
    pub bounds_extent: f32,

    /// World-space anchor of the point cloud, as `x,y,z`.
    #[arg(long, env = "POINTSTREAM_ANCHOR", value_parser = parse_vec3, default_value = "0,0,0")]
    pub anchor: Vec3,

    /// How often the frame monitor logs a summary, in milliseconds.
    #[arg(long, env = "POINTSTREAM_REPORT_INTERVAL_MS", default_value_t = 1000)]
    pub report_interval_ms: u64,
}

fn parse_vec3(s: &str) -> Result<Vec3, String> {
    let parts = s
        .split(',')
        .map(|p| p.trim().parse::<f32>().map_err(|e| format!("{p:?}: {e}")))
        .collect::<Result<Vec<_>, _>>()?;
    match parts.as_slice() {
        [x, y, z] => Ok(Vec3::new(*x, *y, *z)),
        _ => Err(format!("expected x,y,z but got {} components", parts.len())),
    }
}

impl Config {
    pub fn pipeline_config(&self) -> PipelineConfig {
        let mode = match self.mode {
            Mode::Dense => FillMode::Dense,
            Mode::Grid => FillMode::Grid {
                grid_size: self.grid_size,
                grid_spacing: self.grid_spacing,
            },
        };
        PipelineConfig {
            server_url: self.server_url.clone(),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            fetch_timeout: self.fetch_timeout(),
            max_entries: self.max_entries,
            cell_scale: self.point_size,
            activation_distance: self.activation_distance,
            mode,
            chunk_size: self.chunk_size,
            worker_threads: self.worker_threads,
            fault_threshold: self.fault_threshold,
            fault_backoff: Duration::from_millis(self.fault_backoff_ms),
            bounds_extent: self.bounds_extent,
        }
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms.max(1))
    }
}
