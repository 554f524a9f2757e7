//! World field tiles, indexed by `(row, col)`.

use std::fmt;
use std::sync::RwLock;

use land_proto::FieldTile;

use crate::grid::{FIELD_COLS, FIELD_ROWS};
use crate::runtime_util::{read_lock, write_lock};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldError {
    OutOfRange { row: usize, col: usize },
    MalformedId { id: String, reason: String },
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldError::OutOfRange { row, col } => write!(
                f,
                "tile ({}, {}) outside field {}x{}",
                row, col, FIELD_ROWS, FIELD_COLS
            ),
            FieldError::MalformedId { id, reason } => {
                write!(f, "malformed tile id {}: {}", id, reason)
            }
        }
    }
}

impl std::error::Error for FieldError {}

/// Splits a `row-RRR-col-CCC` document id into tile coordinates.
pub fn parse_tile_id(id: &str) -> Result<(usize, usize), FieldError> {
    let malformed = |reason: String| FieldError::MalformedId {
        id: id.to_string(),
        reason,
    };
    let parts: Vec<&str> = id.split('-').collect();
    let [row_tag, row, col_tag, col] = parts.as_slice() else {
        return Err(malformed(format!("expected 4 segments, got {}", parts.len())));
    };
    if *row_tag != "row" || *col_tag != "col" {
        return Err(malformed("expected row-RRR-col-CCC".to_string()));
    }
    let row = row
        .parse::<usize>()
        .map_err(|err| malformed(format!("row {row}: {err}")))?;
    let col = col
        .parse::<usize>()
        .map_err(|err| malformed(format!("col {col}: {err}")))?;
    Ok((row, col))
}

#[derive(Debug)]
pub struct FieldMap {
    tiles: RwLock<Vec<Option<FieldTile>>>,
}

impl Default for FieldMap {
    fn default() -> Self {
        Self {
            tiles: RwLock::new(vec![None; FIELD_ROWS * FIELD_COLS]),
        }
    }
}

impl FieldMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a tile at its own `(row, col)`.
    pub fn set(&self, tile: FieldTile) -> Result<(), FieldError> {
        let index = tile_index(tile.row, tile.col)?;
        write_lock(&self.tiles)[index] = Some(tile);
        Ok(())
    }

    /// `Ok(None)` for an in-range tile not yet received.
    pub fn get(&self, row: usize, col: usize) -> Result<Option<FieldTile>, FieldError> {
        let index = tile_index(row, col)?;
        Ok(read_lock(&self.tiles)[index].clone())
    }

    pub fn loaded(&self) -> usize {
        read_lock(&self.tiles).iter().filter(|tile| tile.is_some()).count()
    }
}

fn tile_index(row: usize, col: usize) -> Result<usize, FieldError> {
    if row >= FIELD_ROWS || col >= FIELD_COLS {
        return Err(FieldError::OutOfRange { row, col });
    }
    Ok(row * FIELD_COLS + col)
}
