//! Double-buffered render state handed to the external renderer.
//!
//! The renderer only ever sees immutable [`BufferFrame`] snapshots behind an
//! `Arc`. A commit fills the back frame, swaps it to the front and publishes
//! it; the old front is recycled as the next back frame once no reader holds
//! it any more, so a frame is never written while it can be read.

use crate::data::{Bounds, DrawArgs, InstanceRaw};
use crate::error::BufferError;
use crate::pool::CellPool;
use glam::Vec3;
use std::sync::Arc;
use tokio::sync::watch;

/// Render-ready snapshot of one cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferFrame {
    entries: Vec<InstanceRaw>,
    draw_args: DrawArgs,
    bounds: Bounds,
    sequence: u64,
}

impl BufferFrame {
    fn with_capacity(capacity: usize, bounds: Bounds) -> Result<Self, BufferError> {
        let mut entries = Vec::new();
        entries
            .try_reserve_exact(capacity)
            .map_err(|e| BufferError::AllocationFailed {
                requested: capacity,
                reason: e.to_string(),
            })?;
        Ok(Self {
            entries,
            draw_args: DrawArgs::new(0),
            bounds,
            sequence: 0,
        })
    }

    fn empty() -> Self {
        Self {
            entries: Vec::new(),
            draw_args: DrawArgs::new(0),
            bounds: Bounds::around(Vec3::ZERO, 0.0),
            sequence: 0,
        }
    }

    /// Valid entries only.
    pub fn entries(&self) -> &[InstanceRaw] {
        &self.entries
    }

    pub fn count(&self) -> u32 {
        self.entries.len() as u32
    }

    pub fn draw_args(&self) -> DrawArgs {
        self.draw_args
    }

    pub fn bounds(&self) -> Bounds {
        self.bounds
    }

    /// Commit number; 0 until the first successful cycle.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Entry bytes ready for a vertex/storage buffer upload.
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.entries)
    }
}

/// Owns the committed frame and its spare.
pub struct RenderState {
    capacity: usize,
    front: Arc<BufferFrame>,
    spare: Option<BufferFrame>,
    publisher: watch::Sender<Arc<BufferFrame>>,
    anchor: Vec3,
    bounds_extent: f32,
    sequence: u64,
    released: bool,
}

impl RenderState {
    /// Reserves both frames for `capacity` entries.
    pub fn allocate(capacity: usize, bounds_extent: f32) -> Result<Self, BufferError> {
        let bounds = Bounds::around(Vec3::ZERO, bounds_extent);
        let front = Arc::new(BufferFrame::with_capacity(capacity, bounds)?);
        let spare = BufferFrame::with_capacity(capacity, bounds)?;
        let (publisher, _) = watch::channel(front.clone());

        tracing::debug!(
            capacity,
            bytes = 2 * capacity * std::mem::size_of::<InstanceRaw>(),
            "Render buffers allocated"
        );

        Ok(Self {
            capacity,
            front,
            spare: Some(spare),
            publisher,
            anchor: Vec3::ZERO,
            bounds_extent,
            sequence: 0,
            released: false,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The frame the renderer should draw right now.
    pub fn current_frame(&self) -> &BufferFrame {
        &self.front
    }

    /// Shared handle to the current frame.
    pub fn snapshot(&self) -> Arc<BufferFrame> {
        self.front.clone()
    }

    /// Receiver that observes every committed frame.
    pub fn subscribe(&self) -> watch::Receiver<Arc<BufferFrame>> {
        self.publisher.subscribe()
    }

    pub fn draw_args(&self) -> DrawArgs {
        self.front.draw_args
    }

    /// Culling volume around the latest anchor.
    pub fn bounds(&self) -> Bounds {
        Bounds::around(self.anchor, self.bounds_extent)
    }

    /// World-space position of the frame of reference the points live in.
    pub fn set_anchor(&mut self, anchor: Vec3) {
        self.anchor = anchor;
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Writes the pool's active cells into the back frame and swaps it in.
    pub fn commit(&mut self, pool: &CellPool) -> Arc<BufferFrame> {
        if self.released {
            tracing::warn!("Commit after release ignored");
            return self.front.clone();
        }

        // A reader still holding the previous front forces a fresh frame.
        let mut back = match self.spare.take() {
            Some(frame) => frame,
            None => BufferFrame {
                entries: Vec::with_capacity(self.capacity),
                ..BufferFrame::empty()
            },
        };

        back.entries.clear();
        back.entries
            .extend(pool.active_cells().take(self.capacity).map(|c| *c.instance()));
        self.sequence += 1;
        back.draw_args = DrawArgs::new(back.entries.len() as u32);
        back.bounds = self.bounds();
        back.sequence = self.sequence;

        let next = Arc::new(back);
        let prev = std::mem::replace(&mut self.front, next.clone());
        self.publisher.send_replace(next.clone());
        self.spare = Arc::try_unwrap(prev).ok();

        next
    }

    /// Frees both frames. Only the first call does anything.
    pub fn release(&mut self) -> bool {
        if self.released {
            return false;
        }
        self.released = true;
        self.spare = None;
        self.front = Arc::new(BufferFrame::empty());
        self.publisher.send_replace(self.front.clone());
        tracing::debug!(capacity = self.capacity, "Render buffers released");
        true
    }
}

impl Drop for RenderState {
    fn drop(&mut self) {
        self.release();
    }
}
