//! Stand-in for the renderer: consumes committed frames and reports on them.

use pointstream::BufferFrame;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Summary of what the renderer would have drawn in one report window.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct FrameReport {
    pub frames: u64,
    pub last_sequence: u64,
    pub instances: u32,
    pub upload_bytes: usize,
}

impl FrameReport {
    fn observe(&mut self, frame: &BufferFrame) {
        self.frames += 1;
        self.last_sequence = frame.sequence();
        self.instances = frame.draw_args().instance_count;
        self.upload_bytes = frame.as_bytes().len() + frame.draw_args().as_bytes().len();
    }
}

/// Watches `frames` until `shutdown` fires, logging a report every `interval`.
pub async fn run(
    mut frames: watch::Receiver<Arc<BufferFrame>>,
    mut shutdown: watch::Receiver<()>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    let mut report = FrameReport::default();

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            changed = frames.changed() => {
                if changed.is_err() {
                    break;
                }
                let frame = frames.borrow_and_update().clone();
                report.observe(&frame);
            },
            _ = ticker.tick() => {
                if report.frames == 0 {
                    tracing::debug!("No new frames this window");
                } else {
                    let bounds = frames.borrow().bounds();
                    tracing::info!(
                        frames = report.frames,
                        sequence = report.last_sequence,
                        instances = report.instances,
                        upload_bytes = report.upload_bytes,
                        bounds_center = ?bounds.center,
                        "Frame window"
                    );
                }
                report.frames = 0;
            }
        }
    }
    tracing::info!("Frame monitor stopped");
}
