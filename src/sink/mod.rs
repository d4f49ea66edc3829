//! Bounded working sheet and Parquet part export.
//!
//! A part is staged into a `WorkingSheet` (a header row plus data rows,
//! limited to a fixed number of cells), exported as one Parquet object and
//! then discarded.

pub mod parquet;

pub use parquet::{ArtifactState, PartWriter};

use snafu::prelude::*;

use crate::error::{BlockOffsetSnafu, BlockShapeSnafu, SheetCapacitySnafu, SheetError};

/// Rectangular grid of text cells with a hard cell capacity.
#[derive(Debug)]
pub struct WorkingSheet {
    name: String,
    header: Vec<String>,
    rows: Vec<Vec<String>>,
    max_cells: usize,
}

impl WorkingSheet {
    /// Create a sheet holding only its header row.
    pub fn create(
        name: impl Into<String>,
        header: Vec<String>,
        max_cells: usize,
    ) -> Result<Self, SheetError> {
        let name = name.into();
        ensure!(
            header.len() <= max_cells && !header.is_empty(),
            SheetCapacitySnafu {
                name: name.clone(),
                rows: 1usize,
                columns: header.len(),
                max_cells,
            }
        );
        Ok(Self {
            name,
            header,
            rows: Vec::new(),
            max_cells,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn header(&self) -> &[String] {
        &self.header
    }

    pub fn columns(&self) -> usize {
        self.header.len()
    }

    /// Data rows written so far.
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    /// Append a block of data rows starting at data row `start`.
    ///
    /// Blocks must be contiguous, match the header width and keep the sheet
    /// (header included) within its cell capacity.
    pub fn write_block(&mut self, start: usize, block: Vec<Vec<String>>) -> Result<(), SheetError> {
        ensure!(
            start == self.rows.len(),
            BlockOffsetSnafu {
                name: self.name.clone(),
                start,
                next: self.rows.len(),
            }
        );

        let columns = self.columns();
        if let Some((row, cells)) = block
            .iter()
            .enumerate()
            .find(|(_, cells)| cells.len() != columns)
        {
            return BlockShapeSnafu {
                name: self.name.clone(),
                row: start + row,
                expected: columns,
                actual: cells.len(),
            }
            .fail();
        }

        let total_rows = self.rows.len() + block.len() + 1;
        ensure!(
            total_rows.saturating_mul(columns) <= self.max_cells,
            SheetCapacitySnafu {
                name: self.name.clone(),
                rows: total_rows,
                columns,
                max_cells: self.max_cells,
            }
        );

        self.rows.extend(block);
        Ok(())
    }
}
