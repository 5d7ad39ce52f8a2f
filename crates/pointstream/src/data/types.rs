//! Core data types for the pipeline, focused on what ends up in GPU buffers.

use crate::error::IngestError;
use glam::{Mat4, Vec3};

/// One decoded point from the latest payload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub position: Vec3,
    /// Linear RGB in `[0, 1]`.
    pub color: Vec3,
}

/// All samples of one ingestion cycle, stored as parallel arrays.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    positions: Vec<Vec3>,
    colors: Vec<Vec3>,
}

impl Batch {
    /// Builds a batch, rejecting arrays of different lengths.
    pub fn new(positions: Vec<Vec3>, colors: Vec<Vec3>) -> Result<Self, IngestError> {
        if positions.len() != colors.len() {
            return Err(IngestError::Decode(format!(
                "{} points but {} colors",
                positions.len(),
                colors.len()
            )));
        }
        Ok(Self { positions, colors })
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn positions(&self) -> &[Vec3] {
        &self.positions
    }

    pub fn colors(&self) -> &[Vec3] {
        &self.colors
    }

    /// Sample `i`. Panics if out of range, like slice indexing.
    #[inline]
    pub fn sample(&self, i: usize) -> Sample {
        Sample {
            position: self.positions[i],
            color: self.colors[i],
        }
    }

    pub fn iter(&self) -> impl ExactSizeIterator<Item = Sample> + '_ {
        self.positions
            .iter()
            .zip(&self.colors)
            .map(|(&position, &color)| Sample { position, color })
    }
}

impl FromIterator<Sample> for Batch {
    fn from_iter<I: IntoIterator<Item = Sample>>(iter: I) -> Self {
        let (positions, colors) = iter.into_iter().map(|s| (s.position, s.color)).unzip();
        Self { positions, colors }
    }
}

/// Per-instance data uploaded to the GPU.
/// Layout: column-major model matrix followed by RGBA color (80 bytes).
#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable, Debug, PartialEq)]
pub struct InstanceRaw {
    /// Translation(position) * uniform scale.
    pub model: [[f32; 4]; 4],
    /// RGB clamped to `[0, 1]`, alpha always 1.
    pub color: [f32; 4],
}

impl InstanceRaw {
    #[inline]
    pub fn new(position: Vec3, scale: f32, color: Vec3) -> Self {
        let model = Mat4::from_translation(position) * Mat4::from_scale(Vec3::splat(scale));
        let rgb = color.clamp(Vec3::ZERO, Vec3::ONE);
        Self {
            model: model.to_cols_array_2d(),
            color: [rgb.x, rgb.y, rgb.z, 1.0],
        }
    }

    #[inline]
    pub fn from_sample(sample: Sample, scale: f32) -> Self {
        Self::new(sample.position, scale, sample.color)
    }

    /// World-space position encoded in the translation column.
    #[inline]
    pub fn position(&self) -> Vec3 {
        let t = self.model[3];
        Vec3::new(t[0], t[1], t[2])
    }

    #[inline]
    pub fn rgb(&self) -> Vec3 {
        Vec3::new(self.color[0], self.color[1], self.color[2])
    }
}

/// Indirect draw arguments: `[instance_count, instances_per_draw, start_vertex, start_instance, reserved]`.
#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable, Debug, PartialEq, Eq)]
pub struct DrawArgs {
    pub instance_count: u32,
    pub instances_per_draw: u32,
    pub start_vertex: u32,
    pub start_instance: u32,
    pub reserved: u32,
}

impl DrawArgs {
    pub fn new(instance_count: u32) -> Self {
        Self {
            instance_count,
            instances_per_draw: 1,
            start_vertex: 0,
            start_instance: 0,
            reserved: 0,
        }
    }

    pub fn as_array(&self) -> [u32; 5] {
        bytemuck::cast(*self)
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}

impl Default for DrawArgs {
    fn default() -> Self {
        Self::new(0)
    }
}

/// Axis-aligned culling volume.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub center: Vec3,
    pub size: Vec3,
}

impl Bounds {
    /// A cube of edge `extent` centered on `anchor`.
    pub fn around(anchor: Vec3, extent: f32) -> Self {
        Self {
            center: anchor,
            size: Vec3::splat(extent),
        }
    }

    pub fn min(&self) -> Vec3 {
        self.center - self.size * 0.5
    }

    pub fn max(&self) -> Vec3 {
        self.center + self.size * 0.5
    }

    pub fn contains(&self, p: Vec3) -> bool {
        p.cmpge(self.min()).all() && p.cmple(self.max()).all()
    }
}
