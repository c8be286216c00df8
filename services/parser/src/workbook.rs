//! Spreadsheet access: a workbook read eagerly into dense sheets.
//!
//! calamine auto-detects the format (xls, xlsx, xlsb, ods). Every sheet is
//! copied into a grid addressed by absolute row/column, so cell coordinates
//! in the configuration match what a user sees in the spreadsheet even when
//! the used range does not start at A1.

use std::path::Path;

use anyhow::{Context, Result};
use calamine::{open_workbook_auto, Data, Range, Reader};
use regex::Regex;
use tracing::{debug, warn};

use crate::config::SheetRef;

#[derive(Debug, Clone, PartialEq, Default)]
pub enum Cell {
    #[default]
    Empty,
    Number(f64),
    Text(String),
    Bool(bool),
}

/// Strings standing for "no value" in survey sheets.
const ABSENT_MARKERS: &[&str] = &["", "N/A", "NA", "..", "-"];

impl Cell {
    fn from_data(data: &Data) -> Self {
        match data {
            Data::Empty | Data::Error(_) => Cell::Empty,
            Data::Int(i) => Cell::Number(*i as f64),
            Data::Float(f) => Cell::Number(*f),
            Data::Bool(b) => Cell::Bool(*b),
            Data::String(s) | Data::DateTimeIso(s) | Data::DurationIso(s) => Cell::Text(s.clone()),
            Data::DateTime(dt) => Cell::Number(dt.as_f64()),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Cell::Empty => true,
            Cell::Text(s) => s.trim().is_empty(),
            _ => false,
        }
    }

    /// Trimmed text; numbers are rendered without a trailing `.0`.
    pub fn text(&self) -> Option<String> {
        match self {
            Cell::Empty => None,
            Cell::Text(s) => {
                let s = s.trim();
                (!s.is_empty()).then(|| s.to_string())
            }
            Cell::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => Some(format!("{}", *n as i64)),
            Cell::Number(n) => Some(n.to_string()),
            Cell::Bool(b) => Some(b.to_string()),
        }
    }

    /// Numeric value. Numeric strings are accepted; absent markers and
    /// anything unparseable yield `None`.
    pub fn number(&self) -> Option<f64> {
        match self {
            Cell::Number(n) if !n.is_nan() => Some(*n),
            Cell::Text(s) => {
                let s = s.trim();
                if ABSENT_MARKERS.iter().any(|m| m.eq_ignore_ascii_case(s)) {
                    return None;
                }
                s.parse::<f64>().ok().filter(|n| !n.is_nan())
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Sheet {
    pub name: String,
    rows: Vec<Vec<Cell>>,
    col_count: usize,
}

impl Sheet {
    /// Builds a sheet from literal rows, row 0 first.
    pub fn from_rows(name: &str, rows: Vec<Vec<Cell>>) -> Self {
        let col_count = rows.iter().map(Vec::len).max().unwrap_or(0);
        Self {
            name: name.to_string(),
            rows,
            col_count,
        }
    }

    fn from_range(name: &str, range: &Range<Data>) -> Self {
        let (start_row, start_col) = range.start().unwrap_or((0, 0));
        let (height, width) = range.get_size();
        let row_count = start_row as usize + height;
        let col_count = start_col as usize + width;
        let mut rows = vec![vec![Cell::Empty; col_count]; row_count];
        for (row, col, data) in range.used_cells() {
            rows[start_row as usize + row][start_col as usize + col] = Cell::from_data(data);
        }
        Self {
            name: name.to_string(),
            rows,
            col_count,
        }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn col_count(&self) -> usize {
        self.col_count
    }

    /// Out-of-range coordinates read as empty.
    pub fn cell(&self, row: usize, col: usize) -> &Cell {
        static EMPTY: Cell = Cell::Empty;
        self.rows.get(row).and_then(|r| r.get(col)).unwrap_or(&EMPTY)
    }

    pub fn text(&self, row: usize, col: usize) -> Option<String> {
        self.cell(row, col).text()
    }

    pub fn number(&self, row: usize, col: usize) -> Option<f64> {
        self.cell(row, col).number()
    }
}

#[derive(Debug, Default)]
pub struct Workbook {
    sheets: Vec<Sheet>,
}

impl Workbook {
    /// Opens the file and reads every sheet; the file handle is released on
    /// return. Unreadable sheets are skipped with a warning.
    pub fn open(path: &Path) -> Result<Self> {
        let mut workbook = open_workbook_auto(path)
            .with_context(|| format!("Failed to open workbook {}", path.display()))?;
        let names = workbook.sheet_names().to_vec();
        let mut sheets = Vec::with_capacity(names.len());
        for name in names {
            match workbook.worksheet_range(&name) {
                Ok(range) => {
                    let sheet = Sheet::from_range(&name, &range);
                    debug!(
                        "Loaded sheet '{}' ({} rows x {} cols)",
                        name,
                        sheet.row_count(),
                        sheet.col_count()
                    );
                    sheets.push(sheet);
                }
                Err(e) => warn!("Could not read sheet '{}' of {}: {}", name, path.display(), e),
            }
        }
        Ok(Self { sheets })
    }

    pub fn from_sheets(sheets: Vec<Sheet>) -> Self {
        Self { sheets }
    }

    pub fn sheet_names(&self) -> Vec<&str> {
        self.sheets.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn sheet_by_index(&self, index: usize) -> Option<&Sheet> {
        self.sheets.get(index)
    }

    pub fn sheet_by_name(&self, name: &str) -> Option<&Sheet> {
        self.sheets.iter().find(|s| s.name == name)
    }

    pub fn sheet(&self, sheet: &SheetRef) -> Option<&Sheet> {
        match sheet {
            SheetRef::Index(i) => self.sheet_by_index(*i),
            SheetRef::Name(name) => self.sheet_by_name(name),
        }
    }

    /// Sheets whose name matches `pattern` at its start, in workbook order.
    pub fn sheets_matching(&self, pattern: &Regex) -> Vec<&Sheet> {
        self.sheets
            .iter()
            .filter(|s| pattern.find(&s.name).is_some_and(|m| m.start() == 0))
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn text(s: &str) -> Cell {
        Cell::Text(s.to_string())
    }

    pub(crate) fn num(n: f64) -> Cell {
        Cell::Number(n)
    }

    #[test]
    fn test_cell_number() {
        assert_eq!(num(0.5).number(), Some(0.5));
        assert_eq!(text(" 12.5 ").number(), Some(12.5));
        for absent in ["N/A", "na", "..", "-", "  "] {
            assert_eq!(text(absent).number(), None, "{absent}");
        }
        assert_eq!(text("Yes").number(), None);
        assert_eq!(Cell::Empty.number(), None);
    }

    #[test]
    fn test_cell_text() {
        assert_eq!(num(2015.0).text(), Some("2015".to_string()));
        assert_eq!(num(0.25).text(), Some("0.25".to_string()));
        assert_eq!(text("  FRA ").text(), Some("FRA".to_string()));
        assert_eq!(text("   ").text(), None);
        assert!(text(" ").is_empty());
    }

    #[test]
    fn test_out_of_range_cells_are_empty() {
        let sheet = Sheet::from_rows("s", vec![vec![num(1.0)], vec![num(2.0), num(3.0)]]);
        assert_eq!(sheet.row_count(), 2);
        assert_eq!(sheet.col_count(), 2);
        assert_eq!(sheet.cell(0, 1), &Cell::Empty);
        assert_eq!(sheet.cell(9, 9), &Cell::Empty);
        assert_eq!(sheet.number(1, 1), Some(3.0));
    }

    #[test]
    fn test_sheets_matching_is_anchored() {
        let workbook = Workbook::from_sheets(vec![
            Sheet::from_rows("2014 Scaled", vec![]),
            Sheet::from_rows("Raw 2014", vec![]),
            Sheet::from_rows("Raw 2015", vec![]),
        ]);
        let pattern = Regex::new(r"Raw \d{4}").unwrap();
        let names: Vec<_> = workbook.sheets_matching(&pattern).iter().map(|s| s.name.clone()).collect();
        assert_eq!(names, vec!["Raw 2014", "Raw 2015"]);
        let scaled = Regex::new("Scaled").unwrap();
        assert!(workbook.sheets_matching(&scaled).is_empty());
        assert!(workbook.sheet(&SheetRef::Index(1)).is_some());
        assert!(workbook.sheet(&SheetRef::Name("Nope".into())).is_none());
    }
}
