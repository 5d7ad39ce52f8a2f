//! Uniform cubic grid used for grid-mode activation.
//!
//! Cell `(x, y, z)` sits at `c * spacing - offset` with
//! `offset = (size / 2) * spacing` on every axis. Cell centers therefore span
//! `[-offset, offset - spacing]`: an even-sized lattice has a cell at the
//! origin, an odd-sized one is centered on `-spacing / 2`.
//! Linear indices run `x`-major: `x * size² + y * size + z`.

use glam::{IVec3, Vec3};

/// Integer cell coordinate. May be out of bounds until checked.
pub type GridCoord = IVec3;

#[derive(Debug, Clone)]
pub struct SpatialGrid {
    size: u32,
    spacing: f32,
    offset: Vec3,
    activation_distance: f32,
    search_radius: i32,
}

impl SpatialGrid {
    /// `size` cells per axis, `spacing` world units apart.
    pub fn new(size: u32, spacing: f32, activation_distance: f32) -> Self {
        let offset = Vec3::splat(size as f32 / 2.0) * spacing;
        let search_radius = (activation_distance / spacing).ceil() as i32;
        Self {
            size,
            spacing,
            offset,
            activation_distance,
            search_radius,
        }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn spacing(&self) -> f32 {
        self.spacing
    }

    pub fn offset(&self) -> Vec3 {
        self.offset
    }

    pub fn activation_distance(&self) -> f32 {
        self.activation_distance
    }

    /// Half-width, in cells, of the box scanned around a point.
    pub fn search_radius(&self) -> i32 {
        self.search_radius
    }

    pub fn cell_count(&self) -> usize {
        (self.size as usize).pow(3)
    }

    /// Nearest cell coordinate for a world position. Not bounds-checked.
    ///
    /// Halfway cases round to the even coordinate. Positions beyond the `i32`
    /// range saturate.
    #[inline]
    pub fn world_to_grid(&self, p: Vec3) -> GridCoord {
        let g = (p + self.offset) / self.spacing;
        Vec3::new(g.x.round_ties_even(), g.y.round_ties_even(), g.z.round_ties_even()).as_ivec3()
    }

    #[inline]
    pub fn grid_to_world(&self, c: GridCoord) -> Vec3 {
        c.as_vec3() * self.spacing - self.offset
    }

    #[inline]
    pub fn in_bounds(&self, c: GridCoord) -> bool {
        let n = self.size as i32;
        c.cmpge(IVec3::ZERO).all() && c.cmplt(IVec3::splat(n)).all()
    }

    #[inline]
    pub fn linear_index(&self, c: GridCoord) -> Option<u32> {
        if !self.in_bounds(c) {
            return None;
        }
        let n = self.size;
        Some(c.x as u32 * n * n + c.y as u32 * n + c.z as u32)
    }

    /// Inverse of [`Self::linear_index`].
    #[inline]
    pub fn coord_of(&self, index: u32) -> GridCoord {
        let n = self.size;
        IVec3::new(
            (index / (n * n)) as i32,
            (index / n % n) as i32,
            (index % n) as i32,
        )
    }

    /// Calls `f(index, coord)` for every in-bounds cell whose center lies
    /// within `activation_distance` of `p`.
    ///
    /// The scan covers `[-r, r]³` around the nearest cell; corner cells of
    /// that box can still be too far, so the true distance is checked for
    /// each candidate.
    pub fn visit_within(&self, p: Vec3, mut f: impl FnMut(u32, GridCoord)) {
        let center = self.world_to_grid(p);
        let r = self.search_radius;
        // Search box entirely outside the grid. Also keeps the offsets below
        // from overflowing on saturated coordinates.
        let lo = IVec3::splat(-r);
        let hi = IVec3::splat(self.size as i32 - 1 + r);
        if center.cmplt(lo).any() || center.cmpgt(hi).any() {
            return;
        }
        for dx in -r..=r {
            for dy in -r..=r {
                for dz in -r..=r {
                    let c = center + IVec3::new(dx, dy, dz);
                    let Some(index) = self.linear_index(c) else {
                        continue;
                    };
                    if p.distance(self.grid_to_world(c)) <= self.activation_distance {
                        f(index, c);
                    }
                }
            }
        }
    }

    /// Collecting variant of [`Self::visit_within`].
    pub fn cells_within(&self, p: Vec3) -> Vec<GridCoord> {
        let mut out = Vec::new();
        self.visit_within(p, |_, c| out.push(c));
        out
    }
}
