//! Output part sizing.
//!
//! Each part is bounded by three independent limits: the working sheet's
//! cell capacity (minus its header row), the policy chunk size and what is
//! left of the invocation's row budget.

use snafu::prelude::*;

use crate::error::{NoCapacitySnafu, SheetError};

/// Limits that apply to the next part.
#[derive(Debug, Clone, Copy)]
pub struct PartitionCaps {
    pub max_cells: usize,
    pub chunk_rows: usize,
    pub budget_remaining: usize,
}

/// Data rows a sheet of `max_cells` can hold next to its header row.
pub fn sink_row_cap(max_cells: usize, columns: usize) -> Result<usize, SheetError> {
    let cap = (max_cells / columns.max(1)).saturating_sub(1);
    ensure!(cap > 0, NoCapacitySnafu { max_cells, columns });
    Ok(cap)
}

/// Rows for the next part: the smallest of the remaining rows and every cap.
pub fn next_part_rows(
    remaining: usize,
    columns: usize,
    caps: &PartitionCaps,
) -> Result<usize, SheetError> {
    let sink_cap = sink_row_cap(caps.max_cells, columns)?;
    Ok(remaining
        .min(sink_cap)
        .min(caps.chunk_rows)
        .min(caps.budget_remaining))
}

/// Object name of part `index` for `output_base`.
pub fn part_name(output_base: &str, index: usize) -> String {
    format!("{output_base}_part{index:03}.parquet")
}
