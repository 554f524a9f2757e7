//! Local occupancy view of one agent, fed to the decision oracle.

use land_proto::{Position, SenseState, SENSE_COLS, SENSE_PLANES, SENSE_ROWS};

use crate::grid::to_grid_cell;
use crate::position_cache::PositionSnapshot;

pub const SELF_PLANE: usize = 0;
pub const OTHER_PLANE: usize = 1;
/// Part of the wire shape; never populated here.
pub const OBSTACLE_PLANE: usize = 2;

const SENSE_SCALE: f64 = 1.0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensoryGrid {
    cells: [[[bool; SENSE_PLANES]; SENSE_COLS]; SENSE_ROWS],
}

impl Default for SensoryGrid {
    fn default() -> Self {
        Self {
            cells: [[[false; SENSE_PLANES]; SENSE_COLS]; SENSE_ROWS],
        }
    }
}

impl SensoryGrid {
    pub fn empty() -> Self {
        Self::default()
    }

    pub const fn center() -> (usize, usize) {
        (SENSE_ROWS / 2, SENSE_COLS / 2)
    }

    /// Marks a cell; out-of-range coordinates are ignored.
    pub fn set(&mut self, row: usize, col: usize, plane: usize) {
        if let Some(cell) = self
            .cells
            .get_mut(row)
            .and_then(|cols| cols.get_mut(col))
            .and_then(|planes| planes.get_mut(plane))
        {
            *cell = true;
        }
    }

    pub fn is_set(&self, row: usize, col: usize, plane: usize) -> bool {
        self.cells
            .get(row)
            .and_then(|cols| cols.get(col))
            .and_then(|planes| planes.get(plane))
            .copied()
            .unwrap_or(false)
    }

    pub fn count(&self, plane: usize) -> usize {
        self.occupied(plane).len()
    }

    pub fn occupied(&self, plane: usize) -> Vec<(usize, usize)> {
        let mut cells = Vec::new();
        for row in 0..SENSE_ROWS {
            for col in 0..SENSE_COLS {
                if self.is_set(row, col, plane) {
                    cells.push((row, col));
                }
            }
        }
        cells
    }

    pub fn to_state(&self) -> SenseState {
        let mut state = [[[0.0; SENSE_PLANES]; SENSE_COLS]; SENSE_ROWS];
        for (row, cols) in self.cells.iter().enumerate() {
            for (col, planes) in cols.iter().enumerate() {
                for (plane, occupied) in planes.iter().enumerate() {
                    if *occupied {
                        state[row][col][plane] = 1.0;
                    }
                }
            }
        }
        state
    }
}

/// Builds the agent-centred grid. Stale players and players outside the
/// sensing window leave no mark; several players on one cell collapse into
/// a single occupied bit.
pub fn build_sensory_grid(
    agent: &Position,
    players: &PositionSnapshot,
    now_ms: i64,
    stale_window_ms: i64,
) -> SensoryGrid {
    let mut grid = SensoryGrid::empty();
    let (center_row, center_col) = SensoryGrid::center();
    grid.set(center_row, center_col, SELF_PLANE);

    let origin = to_grid_cell(agent.x, agent.y, SENSE_SCALE);
    for record in players.fresh(now_ms, stale_window_ms) {
        let cell = to_grid_cell(record.position.x, record.position.y, SENSE_SCALE);
        let (row_offset, col_offset) = cell.offset_from(origin);
        let Some(row) = centered_index(row_offset, center_row, SENSE_ROWS) else {
            continue;
        };
        let Some(col) = centered_index(col_offset, center_col, SENSE_COLS) else {
            continue;
        };
        grid.set(row, col, OTHER_PLANE);
    }
    grid
}

fn centered_index(offset: i64, center: usize, len: usize) -> Option<usize> {
    let index = offset.checked_add(i64::try_from(center).ok()?)?;
    usize::try_from(index).ok().filter(|index| *index < len)
}
