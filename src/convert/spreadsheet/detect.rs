//! Table-region detection on a worksheet occupancy grid.
//!
//! Pure functions over row/column coordinates (1-based, as in A1 notation).
//! The algorithm:
//!
//! 1. Collect every occupied cell: non-empty values and image anchors.
//! 2. Cluster occupied rows; a row joins the current group while its
//!    distance to the previous occupied row is ≤ [`ROW_GAP_TOLERANCE`].
//! 3. Inside each row group, cluster the union of occupied columns with
//!    distance ≤ [`COL_GAP_TOLERANCE`]. Each column cluster is a candidate.
//! 4. Grow each candidate up and down while a row within the tolerance has
//!    an occupied cell inside the candidate's columns.
//! 5. Merge candidates that ended up overlapping, then drop regions with no
//!    data cells, or with fewer than [`MIN_DATA_CELLS`] data cells inside a
//!    bounding area of at most [`MIN_DATA_CELLS`] cells.
//! 6. Order by (top row, left column).

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// Largest row distance that keeps two occupied rows in one group.
pub const ROW_GAP_TOLERANCE: u32 = 3;
/// Largest column distance that keeps two occupied columns in one region.
pub const COL_GAP_TOLERANCE: u32 = 1;
/// Tiny regions need at least this many data cells to survive.
pub const MIN_DATA_CELLS: usize = 3;

/// Occupied cells of one worksheet.
#[derive(Debug, Clone, Default)]
pub struct SheetOccupancy {
    rows: BTreeMap<u32, BTreeSet<u32>>,
    data: BTreeSet<(u32, u32)>,
}

impl SheetOccupancy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a non-empty value cell.
    pub fn add_value(&mut self, row: u32, col: u32) {
        self.rows.entry(row).or_default().insert(col);
        self.data.insert((row, col));
    }

    /// Mark the anchor cell of an embedded image.
    pub fn add_anchor(&mut self, row: u32, col: u32) {
        self.rows.entry(row).or_default().insert(col);
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn row_has_cell_in(&self, row: u32, min_col: u32, max_col: u32) -> bool {
        self.rows
            .get(&row)
            .map(|cols| cols.range(min_col..=max_col).next().is_some())
            .unwrap_or(false)
    }

    fn data_cells_in(&self, r: &TableRegion) -> usize {
        self.data
            .range((r.min_row, r.min_col)..=(r.max_row, r.max_col))
            .filter(|(_, col)| (r.min_col..=r.max_col).contains(col))
            .count()
    }
}

/// A rectangular data-dense area of one sheet. Bounds are inclusive, 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TableRegion {
    /// 1-based index of the sheet in the workbook.
    pub sheet_index: usize,
    pub min_row: u32,
    pub max_row: u32,
    pub min_col: u32,
    pub max_col: u32,
}

impl TableRegion {
    pub fn width(&self) -> u32 {
        self.max_col - self.min_col + 1
    }

    pub fn height(&self) -> u32 {
        self.max_row - self.min_row + 1
    }

    pub fn area(&self) -> u64 {
        self.width() as u64 * self.height() as u64
    }

    /// Wider than tall, in cells.
    pub fn is_landscape(&self) -> bool {
        self.width() > self.height()
    }

    fn overlaps(&self, other: &TableRegion) -> bool {
        self.min_row <= other.max_row
            && other.min_row <= self.max_row
            && self.min_col <= other.max_col
            && other.min_col <= self.max_col
    }

    fn union(&self, other: &TableRegion) -> TableRegion {
        TableRegion {
            sheet_index: self.sheet_index,
            min_row: self.min_row.min(other.min_row),
            max_row: self.max_row.max(other.max_row),
            min_col: self.min_col.min(other.min_col),
            max_col: self.max_col.max(other.max_col),
        }
    }

    /// `B2:F19`.
    pub fn a1_range(&self) -> String {
        format!(
            "{}{}:{}{}",
            column_letters(self.min_col),
            self.min_row,
            column_letters(self.max_col),
            self.max_row
        )
    }

    /// `$B$2:$F$19`, the form used by print-area definitions.
    pub fn absolute_range(&self) -> String {
        format!(
            "${}${}:${}${}",
            column_letters(self.min_col),
            self.min_row,
            column_letters(self.max_col),
            self.max_row
        )
    }
}

/// Spreadsheet column letters for a 1-based index: 1 → A, 27 → AA.
pub fn column_letters(col: u32) -> String {
    let mut n = col.max(1);
    let mut letters = Vec::new();
    while n > 0 {
        let rem = (n - 1) % 26;
        letters.push(b'A' + rem as u8);
        n = (n - 1) / 26;
    }
    letters.reverse();
    String::from_utf8_lossy(&letters).into_owned()
}

fn cluster(values: impl IntoIterator<Item = u32>, tolerance: u32) -> Vec<(u32, u32)> {
    let mut groups: Vec<(u32, u32)> = Vec::new();
    for v in values {
        match groups.last_mut() {
            Some((_, end)) if v - *end <= tolerance => *end = v,
            _ => groups.push((v, v)),
        }
    }
    groups
}

/// Detect table regions on one sheet.
pub fn detect_regions(occ: &SheetOccupancy, sheet_index: usize) -> Vec<TableRegion> {
    let mut candidates = Vec::new();

    for (top, bottom) in cluster(occ.rows.keys().copied(), ROW_GAP_TOLERANCE) {
        let cols: BTreeSet<u32> = occ
            .rows
            .range(top..=bottom)
            .flat_map(|(_, cols)| cols.iter().copied())
            .collect();

        for (left, right) in cluster(cols, COL_GAP_TOLERANCE) {
            let rows: Vec<u32> = occ
                .rows
                .range(top..=bottom)
                .filter(|(row, _)| occ.row_has_cell_in(**row, left, right))
                .map(|(row, _)| *row)
                .collect();
            let (Some(&min_row), Some(&max_row)) = (rows.first(), rows.last()) else {
                continue;
            };
            candidates.push(expand_rows(
                occ,
                TableRegion {
                    sheet_index,
                    min_row,
                    max_row,
                    min_col: left,
                    max_col: right,
                },
            ));
        }
    }

    let mut regions = merge_overlapping(candidates);
    regions.retain(|r| {
        let data = occ.data_cells_in(r);
        data > 0 && !(data < MIN_DATA_CELLS && r.area() <= MIN_DATA_CELLS as u64)
    });
    regions.sort_by_key(|r| (r.min_row, r.min_col));
    regions
}

fn expand_rows(occ: &SheetOccupancy, mut region: TableRegion) -> TableRegion {
    loop {
        let mut grown = false;
        for step in 1..=ROW_GAP_TOLERANCE {
            let Some(row) = region.min_row.checked_sub(step) else {
                break;
            };
            if row >= 1 && occ.row_has_cell_in(row, region.min_col, region.max_col) {
                region.min_row = row;
                grown = true;
                break;
            }
        }
        for step in 1..=ROW_GAP_TOLERANCE {
            let row = region.max_row.saturating_add(step);
            if occ.row_has_cell_in(row, region.min_col, region.max_col) {
                region.max_row = row;
                grown = true;
                break;
            }
        }
        if !grown {
            return region;
        }
    }
}

fn merge_overlapping(mut regions: Vec<TableRegion>) -> Vec<TableRegion> {
    loop {
        let mut merged = false;
        'outer: for i in 0..regions.len() {
            for j in (i + 1)..regions.len() {
                if regions[i].overlaps(&regions[j]) {
                    let other = regions.remove(j);
                    regions[i] = regions[i].union(&other);
                    merged = true;
                    break 'outer;
                }
            }
        }
        if !merged {
            return regions;
        }
    }
}
