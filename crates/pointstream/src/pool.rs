//! Fixed-capacity arena of renderable cells.
//!
//! Cells are created once when the pool is built and are afterwards only
//! toggled and recolored. Nothing here allocates after construction.

use crate::data::InstanceRaw;
use crate::error::{BufferError, PoolError};
use crate::grid::SpatialGrid;
use glam::Vec3;

/// One pooled renderable unit.
#[derive(Debug, Clone, PartialEq)]
pub struct Cell {
    index: u32,
    active: bool,
    world_position: Vec3,
    color: Vec3,
    /// Render-ready form of this cell, kept in sync with the fields above.
    instance: InstanceRaw,
}

impl Cell {
    fn new(index: u32, world_position: Vec3, scale: f32) -> Self {
        Self {
            index,
            active: false,
            world_position,
            color: Vec3::ZERO,
            instance: InstanceRaw::new(world_position, scale, Vec3::ZERO),
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn world_position(&self) -> Vec3 {
        self.world_position
    }

    pub fn color(&self) -> Vec3 {
        self.color
    }

    pub fn instance(&self) -> &InstanceRaw {
        &self.instance
    }

    /// Takes position, scale and color from an already transformed instance.
    #[inline]
    fn place(&mut self, instance: &InstanceRaw) {
        self.active = true;
        self.world_position = instance.position();
        self.color = instance.rgb();
        self.instance = *instance;
    }

    /// Keeps the fixed position, takes only the color.
    #[inline]
    fn recolor(&mut self, instance: &InstanceRaw) {
        self.active = true;
        self.color = instance.rgb();
        self.instance.color = instance.color;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Discipline {
    Dense,
    Grid,
}

/// Outcome of one fill pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FillReport {
    /// Active cells after the pass.
    pub active: usize,
    /// Set when the batch did not fit; the pass still applied what it could.
    pub overflow: Option<PoolError>,
}

impl FillReport {
    pub fn dropped(&self) -> usize {
        match self.overflow {
            Some(PoolError::Overflow { dropped, .. }) => dropped,
            None => 0,
        }
    }
}

pub struct CellPool {
    cells: Vec<Cell>,
    discipline: Discipline,
    /// Dense mode keeps active cells as a prefix; this is its length.
    active_prefix: usize,
    active: usize,
}

fn reserve_cells(capacity: usize) -> Result<Vec<Cell>, BufferError> {
    let mut cells = Vec::new();
    cells
        .try_reserve_exact(capacity)
        .map_err(|e| BufferError::AllocationFailed {
            requested: capacity,
            reason: e.to_string(),
        })?;
    Ok(cells)
}

impl CellPool {
    /// Pool of `capacity` free-floating cells, all scaled by `cell_scale`.
    pub fn dense(capacity: usize, cell_scale: f32) -> Result<Self, BufferError> {
        let mut cells = reserve_cells(capacity)?;
        cells.extend((0..capacity as u32).map(|i| Cell::new(i, Vec3::ZERO, cell_scale)));
        Ok(Self {
            cells,
            discipline: Discipline::Dense,
            active_prefix: 0,
            active: 0,
        })
    }

    /// One cell per grid coordinate, pinned at its world position and scaled
    /// to the grid spacing. Cell index equals the grid's linear index.
    pub fn for_grid(grid: &SpatialGrid) -> Result<Self, BufferError> {
        let capacity = grid.cell_count();
        let mut cells = reserve_cells(capacity)?;
        cells.extend((0..capacity as u32).map(|i| {
            Cell::new(i, grid.grid_to_world(grid.coord_of(i)), grid.spacing())
        }));
        Ok(Self {
            cells,
            discipline: Discipline::Grid,
            active_prefix: 0,
            active: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        self.cells.len()
    }

    pub fn active_count(&self) -> usize {
        self.active
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    /// Active cells in index order.
    pub fn active_cells(&self) -> impl Iterator<Item = &Cell> + '_ {
        let scan = match self.discipline {
            Discipline::Dense => &self.cells[..self.active_prefix],
            Discipline::Grid => &self.cells[..],
        };
        scan.iter().filter(|c| c.active)
    }

    /// Dense discipline: cell `i` takes instance `i`.
    ///
    /// `instances` holds the first `min(batch_len, capacity)` transformed
    /// samples. Cells left over from a larger previous batch are switched off.
    pub fn fill_dense(&mut self, instances: &[InstanceRaw], batch_len: usize) -> FillReport {
        debug_assert_eq!(self.discipline, Discipline::Dense);
        let capacity = self.cells.len();
        let count = instances.len().min(capacity);

        for (cell, inst) in self.cells.iter_mut().zip(&instances[..count]) {
            cell.place(inst);
        }
        for cell in &mut self.cells[count..self.active_prefix.max(count)] {
            cell.active = false;
        }
        self.active_prefix = count;
        self.active = count;

        let overflow = (batch_len > capacity).then(|| {
            let dropped = batch_len - capacity;
            tracing::warn!(dropped, capacity, "Batch exceeds pool capacity; excess points dropped");
            PoolError::Overflow { dropped, capacity }
        });

        FillReport { active: count, overflow }
    }

    /// Grid discipline: every cell within range of a point takes that
    /// point's color. When several points reach the same cell, the one
    /// processed last wins.
    pub fn fill_grid(
        &mut self,
        grid: &SpatialGrid,
        positions: &[Vec3],
        instances: &[InstanceRaw],
    ) -> FillReport {
        self.clear_grid();
        self.light_grid(grid, positions, instances);
        FillReport {
            active: self.active,
            overflow: None,
        }
    }

    /// Switches every grid cell off ahead of a new batch.
    pub fn clear_grid(&mut self) {
        debug_assert_eq!(self.discipline, Discipline::Grid);
        for cell in &mut self.cells {
            cell.active = false;
        }
        self.active = 0;
    }

    /// Applies one window of a batch on top of what earlier windows lit.
    pub fn light_grid(&mut self, grid: &SpatialGrid, positions: &[Vec3], instances: &[InstanceRaw]) {
        debug_assert_eq!(self.discipline, Discipline::Grid);
        debug_assert_eq!(self.cells.len(), grid.cell_count());
        debug_assert_eq!(positions.len(), instances.len());

        let cells = &mut self.cells;
        let active = &mut self.active;
        for (p, inst) in positions.iter().zip(instances) {
            grid.visit_within(*p, |index, _| {
                let cell = &mut cells[index as usize];
                if !cell.active {
                    *active += 1;
                }
                cell.recolor(inst);
            });
        }
    }
}
