//! Pipeline scheduler: drives fetch → decode → transform → commit cycles.
//!
//! ```text
//!        ┌────────────────────────── IngestError ─────────────┐
//!        v                                                     │
//!  Idle ──> Fetching ──> Decoding ──> Transforming ──> Committing ──> Idle
//!        ^                                                     │
//!        └──── backoff ──── Faulted <── N consecutive failures ┘
//! ```
//!
//! A failed cycle leaves the previously committed frame published, so the
//! renderer keeps drawing the last good cloud. Nothing that happens inside a
//! cycle stops the loop; only the shutdown signal does.

use crate::buffer::{BufferFrame, RenderState};
use crate::config::{FillMode, PipelineConfig};
use crate::data::{decode_payload, Bounds, InstanceRaw};
use crate::error::{InitError, IngestError};
use crate::grid::SpatialGrid;
use crate::ingest::{IngestClient, Transport};
use crate::metrics::PipelineMetrics;
use crate::pool::{CellPool, FillReport};
use crate::transform::TransformStage;
use glam::Vec3;
use std::sync::Arc;
use std::time::Instant;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Fetching,
    Decoding,
    Transforming,
    Committing,
    Faulted,
}

/// What a single cycle did.
#[derive(Debug)]
pub enum CycleOutcome {
    /// A new frame was published.
    Committed {
        sequence: u64,
        entries: usize,
        dropped: usize,
    },
    /// Ingest failed; the previous frame stays current.
    Skipped(IngestError),
    /// Too many consecutive failures; the caller should back off.
    Faulted { failures: u32, last: IngestError },
}

/// Runs CPU-bound work so that other tasks on the runtime keep making progress.
fn blocking<R>(f: impl FnOnce() -> R) -> R {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

enum Fill {
    Dense,
    Grid(SpatialGrid),
}

pub struct Pipeline<T> {
    config: PipelineConfig,
    client: IngestClient<T>,
    stage: TransformStage,
    fill: Fill,
    pool: CellPool,
    render: RenderState,
    /// Transform output, reused every cycle.
    scratch: Vec<InstanceRaw>,
    anchor: Option<watch::Receiver<Vec3>>,
    metrics: Arc<PipelineMetrics>,
    state: PipelineState,
    failure_streak: u32,
}

impl<T: Transport> Pipeline<T> {
    /// Validates `config` and allocates every long-lived resource.
    ///
    /// Nothing is allocated for the pool or frames after this returns.
    pub fn new(
        config: PipelineConfig,
        transport: T,
        metrics: Arc<PipelineMetrics>,
    ) -> Result<Self, InitError> {
        let config = config.validate()?;
        let capacity = config.capacity();

        let (fill, pool, scale) = match config.mode {
            FillMode::Dense => (
                Fill::Dense,
                CellPool::dense(capacity, config.cell_scale)?,
                config.cell_scale,
            ),
            FillMode::Grid { grid_size, grid_spacing } => {
                let grid = SpatialGrid::new(grid_size, grid_spacing, config.activation_distance);
                let pool = CellPool::for_grid(&grid)?;
                (Fill::Grid(grid), pool, grid_spacing)
            }
        };

        let render = RenderState::allocate(capacity, config.bounds_extent)?;
        let stage = TransformStage::new(config.chunk_size, config.worker_threads, scale)?;
        let client = IngestClient::new(transport, config.server_url.clone(), config.fetch_timeout);

        tracing::info!(
            url = %config.server_url,
            capacity,
            mode = ?config.mode,
            workers = stage.threads(),
            chunk_size = stage.chunk_size(),
            "Pipeline initialized"
        );

        Ok(Self {
            scratch: Vec::with_capacity(capacity),
            config,
            client,
            stage,
            fill,
            pool,
            render,
            anchor: None,
            metrics,
            state: PipelineState::Idle,
            failure_streak: 0,
        })
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn pool(&self) -> &CellPool {
        &self.pool
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    pub fn failure_streak(&self) -> u32 {
        self.failure_streak
    }

    pub fn current_frame(&self) -> &BufferFrame {
        self.render.current_frame()
    }

    pub fn bounds(&self) -> Bounds {
        self.render.bounds()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<BufferFrame>> {
        self.render.subscribe()
    }

    pub fn set_anchor(&mut self, anchor: Vec3) {
        self.render.set_anchor(anchor);
    }

    /// Reads the anchor from `source` before every commit.
    pub fn follow_anchor(&mut self, source: watch::Receiver<Vec3>) {
        self.anchor = Some(source);
    }

    /// Runs one complete cycle.
    ///
    /// The transform stage holds the calling task until its workers join; on
    /// a multi-threaded runtime the worker thread is handed over first.
    pub async fn run_cycle(&mut self) -> CycleOutcome {
        let started = Instant::now();

        self.state = PipelineState::Fetching;
        let body = match self.client.fetch_payload().await {
            Ok(body) => body,
            Err(e) => return self.ingest_failed(e),
        };

        self.state = PipelineState::Decoding;
        let batch = match decode_payload(&body) {
            Ok(batch) => batch,
            Err(e) => return self.ingest_failed(e),
        };
        self.metrics.batch_points.set(batch.len() as i64);

        self.state = PipelineState::Transforming;
        let (positions, colors) = (batch.positions(), batch.colors());
        let report = match &self.fill {
            Fill::Dense => {
                let n = positions.len().min(self.pool.capacity());
                let (stage, scratch) = (&self.stage, &mut self.scratch);
                blocking(|| stage.run_window(&positions[..n], &colors[..n], scratch));
                self.state = PipelineState::Committing;
                self.pool.fill_dense(&self.scratch, batch.len())
            }
            Fill::Grid(grid) => {
                // Windows of pool capacity keep `scratch` at its initial size.
                let window = self.pool.capacity().max(1);
                self.pool.clear_grid();
                for (ps, cs) in positions.chunks(window).zip(colors.chunks(window)) {
                    let (stage, scratch) = (&self.stage, &mut self.scratch);
                    blocking(|| stage.run_window(ps, cs, scratch));
                    self.pool.light_grid(grid, ps, &self.scratch);
                }
                self.state = PipelineState::Committing;
                FillReport {
                    active: self.pool.active_count(),
                    overflow: None,
                }
            }
        };
        if let Some(source) = &self.anchor {
            self.render.set_anchor(*source.borrow());
        }
        let frame = self.render.commit(&self.pool);

        let dropped = report.dropped();
        self.metrics.overflow_dropped_total.inc_by(dropped as u64);
        self.metrics.active_entries.set(i64::from(frame.count()));
        self.metrics.cycles_total.inc();
        self.metrics
            .cycle_duration
            .observe(started.elapsed().as_secs_f64());

        if self.failure_streak > 0 {
            tracing::info!(failures = self.failure_streak, "Ingest recovered");
        }
        self.failure_streak = 0;
        self.state = PipelineState::Idle;

        tracing::debug!(
            sequence = frame.sequence(),
            points = batch.len(),
            entries = frame.count(),
            dropped,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Frame committed"
        );

        CycleOutcome::Committed {
            sequence: frame.sequence(),
            entries: frame.count() as usize,
            dropped,
        }
    }

    fn ingest_failed(&mut self, e: IngestError) -> CycleOutcome {
        self.metrics
            .ingest_failures_total
            .with_label_values(&[e.kind()])
            .inc();
        self.failure_streak += 1;

        if self.failure_streak >= self.config.fault_threshold {
            self.state = PipelineState::Faulted;
            self.metrics.faults_total.inc();
            tracing::error!(
                error = %e,
                failures = self.failure_streak,
                backoff_ms = self.config.fault_backoff.as_millis() as u64,
                "Ingest keeps failing; backing off"
            );
            CycleOutcome::Faulted {
                failures: self.failure_streak,
                last: e,
            }
        } else {
            self.state = PipelineState::Idle;
            tracing::warn!(
                error = %e,
                failures = self.failure_streak,
                "Cycle skipped; keeping last frame"
            );
            CycleOutcome::Skipped(e)
        }
    }

    /// Leaves `Faulted` and starts a fresh failure count.
    pub fn recover(&mut self) {
        if self.state == PipelineState::Faulted {
            tracing::info!("Resuming after backoff");
        }
        self.state = PipelineState::Idle;
        self.failure_streak = 0;
    }

    /// Cycles at `poll_interval` until `shutdown` fires or its sender is dropped.
    ///
    /// An overrunning cycle is followed immediately by the next one; missed
    /// ticks are not replayed. Shutdown aborts an outstanding fetch or backoff.
    pub async fn run(mut self, mut shutdown: watch::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            interval_ms = self.config.poll_interval.as_millis() as u64,
            "Starting fetch loop..."
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }

            let outcome = tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    tracing::info!("Shutdown during cycle; outstanding fetch cancelled");
                    break;
                }
                outcome = self.run_cycle() => outcome,
            };

            if let CycleOutcome::Faulted { .. } = outcome {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(self.config.fault_backoff) => {}
                }
                self.recover();
                ticker.reset();
            }
        }

        self.shutdown();
    }

    /// Releases render buffers. Safe to call more than once.
    pub fn shutdown(&mut self) {
        self.state = PipelineState::Idle;
        if self.render.release() {
            tracing::info!(
                cycles = self.metrics.cycles_total.get(),
                "Pipeline shut down"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::ingest::testing::{Reply, ScriptedTransport};
    use glam::IVec3;
    use std::time::Duration;

    const TWO_POINTS: &str =
        r#"{"status":"success","points":[[0,0,0],[1,1,1]],"colors":[[1,0,0],[0,1,0]]}"#;

    fn dense(max_entries: u32) -> PipelineConfig {
        PipelineConfig {
            max_entries,
            worker_threads: 2,
            fault_threshold: 3,
            ..Default::default()
        }
    }

    fn pipeline(
        config: PipelineConfig,
        script: impl IntoIterator<Item = Reply>,
    ) -> Pipeline<Arc<ScriptedTransport>> {
        let metrics = Arc::new(PipelineMetrics::new().unwrap());
        Pipeline::new(config, ScriptedTransport::new(script), metrics).unwrap()
    }

    #[tokio::test]
    async fn dense_cycle_commits_points_in_order() {
        let mut p = pipeline(dense(10), [Reply::json(TWO_POINTS)]);
        let outcome = p.run_cycle().await;

        assert!(matches!(outcome, CycleOutcome::Committed { entries: 2, dropped: 0, .. }));
        let frame = p.current_frame();
        assert_eq!(frame.count(), 2);
        assert_eq!(frame.entries()[0].position(), Vec3::ZERO);
        assert_eq!(frame.entries()[0].color, [1.0, 0.0, 0.0, 1.0]);
        assert_eq!(frame.entries()[1].position(), Vec3::ONE);
        assert_eq!(frame.entries()[1].color, [0.0, 1.0, 0.0, 1.0]);
        assert_eq!(frame.draw_args().as_array(), [2, 1, 0, 0, 0]);
        assert_eq!(p.state(), PipelineState::Idle);
    }

    #[tokio::test]
    async fn overflow_keeps_first_points_and_counts_drops() {
        let mut p = pipeline(dense(1), [Reply::json(TWO_POINTS)]);
        let outcome = p.run_cycle().await;

        assert!(matches!(outcome, CycleOutcome::Committed { entries: 1, dropped: 1, .. }));
        assert_eq!(p.current_frame().count(), 1);
        assert_eq!(p.current_frame().entries()[0].position(), Vec3::ZERO);
        assert_eq!(p.metrics().overflow_dropped_total.get(), 1);
    }

    #[tokio::test]
    async fn grid_point_at_center_lights_one_cell() {
        let config = PipelineConfig {
            max_entries: 27,
            activation_distance: 0.5,
            mode: FillMode::Grid { grid_size: 3, grid_spacing: 1.0 },
            ..dense(27)
        };
        let body = r#"{"status":"success","points":[[-0.5,-0.5,-0.5]],"colors":[[0.2,0.4,0.6]]}"#;
        let mut p = pipeline(config, [Reply::json(body)]);
        p.run_cycle().await;

        assert_eq!(p.pool().active_count(), 1);
        let frame = p.current_frame();
        assert_eq!(frame.count(), 1);
        let grid = SpatialGrid::new(3, 1.0, 0.5);
        assert_eq!(frame.entries()[0].position(), grid.grid_to_world(IVec3::ONE));
        assert_eq!(frame.entries()[0].model[0][0], 1.0);
    }

    #[tokio::test]
    async fn failed_fetch_keeps_last_good_frame() {
        let mut p = pipeline(dense(10), [Reply::json(TWO_POINTS), Reply::Fail]);
        p.run_cycle().await;
        let f1 = p.current_frame().clone();

        let outcome = p.run_cycle().await;
        assert!(matches!(outcome, CycleOutcome::Skipped(IngestError::Transport(TransportError::Request(_)))));
        assert_eq!(*p.current_frame(), f1);
        assert_eq!(p.state(), PipelineState::Idle);
        assert_eq!(
            p.metrics().ingest_failures_total.with_label_values(&["transport"]).get(),
            1
        );
    }

    #[tokio::test]
    async fn decode_and_status_failures_keep_last_good_frame() {
        let mut p = pipeline(
            dense(10),
            [
                Reply::json(TWO_POINTS),
                Reply::json(r#"{"status":"no data"}"#),
                Reply::json("{garbage"),
            ],
        );
        p.run_cycle().await;
        let f1 = p.current_frame().clone();

        assert!(matches!(p.run_cycle().await, CycleOutcome::Skipped(IngestError::Status(_))));
        assert!(matches!(p.run_cycle().await, CycleOutcome::Skipped(IngestError::Decode(_))));
        assert_eq!(*p.current_frame(), f1);
        assert_eq!(p.failure_streak(), 2);
    }

    #[tokio::test]
    async fn repeated_failures_fault_then_recover() {
        let mut p = pipeline(dense(10), [Reply::Fail, Reply::Fail, Reply::Fail, Reply::json(TWO_POINTS)]);
        assert!(matches!(p.run_cycle().await, CycleOutcome::Skipped(_)));
        assert!(matches!(p.run_cycle().await, CycleOutcome::Skipped(_)));
        assert!(matches!(p.run_cycle().await, CycleOutcome::Faulted { failures: 3, .. }));
        assert_eq!(p.state(), PipelineState::Faulted);
        assert_eq!(p.metrics().faults_total.get(), 1);

        p.recover();
        assert_eq!(p.state(), PipelineState::Idle);
        assert_eq!(p.failure_streak(), 0);
        assert!(matches!(p.run_cycle().await, CycleOutcome::Committed { entries: 2, .. }));
    }

    #[tokio::test]
    async fn active_entries_never_exceed_capacity() {
        let sizes = [0usize, 10, 49, 50, 51, 500, 3];
        let script = sizes.iter().map(|&n| {
            let points = vec!["[0.1,0.2,0.3]"; n].join(",");
            let colors = vec!["[0.5,0.5,0.5]"; n].join(",");
            Reply::json(&format!(r#"{{"status":"success","points":[{points}],"colors":[{colors}]}}"#))
        });
        let mut p = pipeline(dense(50), script.collect::<Vec<_>>());

        for &n in &sizes {
            p.run_cycle().await;
            assert!(p.pool().active_count() <= 50);
            assert_eq!(p.current_frame().count() as usize, n.min(50));
        }
    }

    #[tokio::test]
    async fn anchor_source_drives_bounds() {
        let mut p = pipeline(dense(10), [Reply::json(TWO_POINTS)]);
        let (tx, rx) = watch::channel(Vec3::ZERO);
        p.follow_anchor(rx);

        tx.send_replace(Vec3::new(5.0, 0.0, -2.0));
        p.run_cycle().await;
        assert_eq!(p.current_frame().bounds().center, Vec3::new(5.0, 0.0, -2.0));
        assert_eq!(p.bounds().center, Vec3::new(5.0, 0.0, -2.0));
    }

    #[tokio::test(start_paused = true)]
    async fn run_loop_publishes_frames_until_shutdown() {
        let config = PipelineConfig {
            poll_interval: Duration::from_millis(100),
            ..dense(10)
        };
        let p = pipeline(config, [Reply::json(TWO_POINTS)]);
        let mut frames = p.subscribe();
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let handle = tokio::spawn(p.run(shutdown_rx));

        frames.changed().await.unwrap();
        assert_eq!(frames.borrow_and_update().count(), 2);
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(frames.borrow().sequence() >= 3);

        drop(shutdown_tx);
        handle.await.unwrap();
        assert_eq!(frames.borrow().count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_outstanding_fetch() {
        let config = PipelineConfig {
            fetch_timeout: Duration::from_secs(60),
            ..dense(10)
        };
        let transport = ScriptedTransport::new([Reply::Hang]);
        let metrics = Arc::new(PipelineMetrics::new().unwrap());
        let p = Pipeline::new(config, transport.clone(), metrics.clone()).unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let started = tokio::time::Instant::now();
        let handle = tokio::spawn(p.run(shutdown_rx));

        tokio::time::sleep(Duration::from_secs(1)).await;
        shutdown_tx.send_replace(());
        handle.await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(60));
        assert_eq!(transport.calls(), 1);
        assert_eq!(metrics.ingest_failures_total.with_label_values(&["timeout"]).get(), 0);
    }

    fn grid3(activation_distance: f32) -> PipelineConfig {
        PipelineConfig {
            activation_distance,
            mode: FillMode::Grid { grid_size: 3, grid_spacing: 1.0 },
            ..dense(27)
        }
    }

    #[tokio::test]
    async fn grid_mode_ignores_distant_points() {
        let body = r#"{"status":"success","points":[[1e30,0,0],[-0.5,-0.5,-0.5],[0,-3e38,0]],"colors":[[1,0,0],[0,1,0],[0,0,1]]}"#;
        let mut p = pipeline(grid3(0.5), [Reply::json(body)]);

        let outcome = p.run_cycle().await;
        assert!(matches!(outcome, CycleOutcome::Committed { entries: 1, .. }));
        assert_eq!(p.current_frame().entries()[0].rgb(), Vec3::Y);
    }

    #[tokio::test]
    async fn grid_batch_larger_than_pool_keeps_scratch_size() {
        let grid = SpatialGrid::new(3, 1.0, 0.5);
        let (points, colors): (Vec<String>, Vec<String>) = (0..100u32)
            .map(|i| {
                let p = grid.grid_to_world(grid.coord_of(i % 27));
                let c = i as f32 / 100.0;
                (format!("[{},{},{}]", p.x, p.y, p.z), format!("[{c},{c},{c}]"))
            })
            .unzip();
        let body = format!(
            r#"{{"status":"success","points":[{}],"colors":[{}]}}"#,
            points.join(","),
            colors.join(",")
        );
        let mut p = pipeline(grid3(0.5), [Reply::json(&body)]);
        let capacity = p.scratch.capacity();

        let outcome = p.run_cycle().await;
        assert!(matches!(outcome, CycleOutcome::Committed { entries: 27, dropped: 0, .. }));
        assert_eq!(p.scratch.capacity(), capacity);
        assert!(p.scratch.len() <= 27);

        // Cell 0 was last hit by point 81, in the fourth window.
        let first = &p.pool().cells()[0];
        assert!((first.color() - Vec3::splat(0.81)).abs().max_element() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn overrunning_cycle_is_followed_immediately_without_catch_up() {
        let config = PipelineConfig {
            poll_interval: Duration::from_millis(100),
            ..dense(10)
        };
        let transport = ScriptedTransport::new([
            Reply::Slow(Duration::from_millis(250), TWO_POINTS.as_bytes().to_vec()),
            Reply::json(TWO_POINTS),
        ]);
        let metrics = Arc::new(PipelineMetrics::new().unwrap());
        let p = Pipeline::new(config, transport.clone(), metrics).unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let handle = tokio::spawn(p.run(shutdown_rx));

        // Cycles start at 0, 250 (right after the overrun), 350 and 450.
        // Replaying the two missed ticks would add extra cycles at 250.
        tokio::time::sleep(Duration::from_millis(520)).await;
        assert_eq!(transport.calls(), 4);

        drop(shutdown_tx);
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn run_loop_backs_off_after_fault_then_resumes() {
        let config = PipelineConfig {
            poll_interval: Duration::from_millis(100),
            fault_threshold: 2,
            fault_backoff: Duration::from_secs(1),
            ..dense(10)
        };
        let transport = ScriptedTransport::new([Reply::Fail, Reply::Fail, Reply::json(TWO_POINTS)]);
        let metrics = Arc::new(PipelineMetrics::new().unwrap());
        let p = Pipeline::new(config, transport.clone(), metrics.clone()).unwrap();
        let mut frames = p.subscribe();
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let handle = tokio::spawn(p.run(shutdown_rx));

        // Failures at 0 and 100 fault the pipeline; backoff runs to 1100.
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(transport.calls(), 2);
        assert_eq!(metrics.faults_total.get(), 1);
        assert_eq!(metrics.cycles_total.get(), 0);

        tokio::time::sleep(Duration::from_millis(550)).await;
        assert_eq!(transport.calls(), 2);

        // Ticks restart one interval after the backoff ends.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(transport.calls(), 3);
        assert_eq!(metrics.cycles_total.get(), 1);
        assert_eq!(frames.borrow_and_update().sequence(), 1);

        drop(shutdown_tx);
        handle.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn transform_yields_worker_on_multi_thread_runtime() {
        let mut p = pipeline(dense(10), [Reply::json(TWO_POINTS)]);
        let other = tokio::spawn(async { 7 });

        assert!(matches!(p.run_cycle().await, CycleOutcome::Committed { entries: 2, .. }));
        assert_eq!(other.await.unwrap(), 7);
        assert_eq!(blocking(|| 1 + 1), 2);
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let mut p = pipeline(dense(4), [Reply::json(TWO_POINTS)]);
        p.shutdown();
        p.shutdown();
        assert_eq!(p.current_frame().count(), 0);
    }

    #[test]
    fn invalid_config_aborts_init() {
        let config = PipelineConfig { max_entries: 0, ..Default::default() };
        let metrics = Arc::new(PipelineMetrics::new().unwrap());
        let err = Pipeline::new(config, ScriptedTransport::new(Vec::<Reply>::new()), metrics).err().unwrap();
        assert!(matches!(err, InitError::Config(_)));
    }
}
