//! World coordinate to tile grid mapping.
//!
//! `x` maps to columns and grows to the right; `y` maps to rows and grows
//! downward.

pub const TILE_WIDTH: f64 = 32.0;
pub const TILE_HEIGHT: f64 = 32.0;
pub const FIELD_ROWS: usize = 200;
pub const FIELD_COLS: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GridCell {
    pub row: i64,
    pub col: i64,
}

impl GridCell {
    pub fn new(row: i64, col: i64) -> Self {
        Self { row, col }
    }

    /// Offset of `self` relative to `origin`, as `(rows, cols)`.
    pub fn offset_from(self, origin: GridCell) -> (i64, i64) {
        (
            self.row.saturating_sub(origin.row),
            self.col.saturating_sub(origin.col),
        )
    }
}

pub fn to_grid_cell(x: f64, y: f64, scale: f64) -> GridCell {
    GridCell {
        row: (y / (TILE_HEIGHT * scale)).floor() as i64,
        col: (x / (TILE_WIDTH * scale)).floor() as i64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_world_point_to_tile() {
        assert_eq!(to_grid_cell(968.0, 1004.0, 1.0), GridCell::new(31, 30));
    }

    #[test]
    fn tile_edges_belong_to_the_next_tile() {
        assert_eq!(to_grid_cell(31.999, 0.0, 1.0).col, 0);
        assert_eq!(to_grid_cell(32.0, 0.0, 1.0).col, 1);
        assert_eq!(to_grid_cell(0.0, 64.0, 1.0).row, 2);
    }

    #[test]
    fn scale_widens_tiles() {
        assert_eq!(to_grid_cell(968.0, 1004.0, 2.0), GridCell::new(15, 15));
        assert_eq!(to_grid_cell(968.0, 1004.0, 0.5), GridCell::new(62, 60));
    }

    #[test]
    fn negative_coordinates_floor_downward() {
        assert_eq!(to_grid_cell(-1.0, -33.0, 1.0), GridCell::new(-2, -1));
    }

    #[test]
    fn offset_from_is_signed() {
        let origin = GridCell::new(31, 29);
        assert_eq!(GridCell::new(31, 28).offset_from(origin), (0, -1));
        assert_eq!(GridCell::new(33, 29).offset_from(origin), (2, 0));
    }
}
