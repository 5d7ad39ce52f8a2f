//! Parallel per-point transform stage.
//!
//! Each sample becomes an [`InstanceRaw`] independently of every other one,
//! so the output is split into fixed-size chunks and handed to a dedicated
//! rayon pool. Output slot `i` is only ever written from sample `i`.

use crate::data::{Batch, InstanceRaw};
use glam::Vec3;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuildError, ThreadPoolBuilder};

pub struct TransformStage {
    workers: ThreadPool,
    chunk_size: usize,
    scale: f32,
}

impl TransformStage {
    /// `worker_threads == 0` lets rayon size the pool from the CPU count.
    pub fn new(chunk_size: usize, worker_threads: usize, scale: f32) -> Result<Self, ThreadPoolBuildError> {
        let workers = ThreadPoolBuilder::new()
            .num_threads(worker_threads)
            .thread_name(|i| format!("pointstream-transform-{i}"))
            .build()?;
        Ok(Self {
            workers,
            chunk_size: chunk_size.max(1),
            scale,
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn threads(&self) -> usize {
        self.workers.current_num_threads()
    }

    /// Transforms the first `limit` samples of `batch` into `out`.
    pub fn run(&self, batch: &Batch, limit: usize, out: &mut Vec<InstanceRaw>) {
        let n = limit.min(batch.len());
        self.run_window(&batch.positions()[..n], &batch.colors()[..n], out);
    }

    /// Transforms one window of samples into `out`.
    ///
    /// `out` is resized to exactly `positions.len()` entries; its capacity is
    /// reused across calls. Blocks until every chunk is done.
    pub fn run_window(&self, positions: &[Vec3], colors: &[Vec3], out: &mut Vec<InstanceRaw>) {
        debug_assert_eq!(positions.len(), colors.len());
        out.clear();
        out.resize(positions.len(), bytemuck::Zeroable::zeroed());
        let (chunk, scale) = (self.chunk_size, self.scale);

        self.workers.install(|| {
            out.par_chunks_mut(chunk)
                .zip(positions.par_chunks(chunk))
                .zip(colors.par_chunks(chunk))
                .for_each(|((dst, ps), cs)| {
                    for ((slot, &p), &c) in dst.iter_mut().zip(ps).zip(cs) {
                        *slot = InstanceRaw::new(p, scale, c);
                    }
                });
        });
    }
}
