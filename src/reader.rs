use anyhow::{Context, Result};
use std::path::Path;

use crate::errors::ServerError;

/// Read-side capability over a workbook file. Handles are fully loaded in
/// memory; dropping the handle closes the workbook.
pub trait WorkbookReader: Send + Sync {
    fn open(&self, path: &Path) -> Result<Box<dyn WorkbookHandle>>;
}

pub trait WorkbookHandle: Send + Sync {
    /// Sheet names in workbook order.
    fn sheet_list(&self) -> Vec<String>;

    /// All rows of a sheet as strings; rows are trimmed of trailing empty
    /// cells and the sheet of trailing empty rows.
    fn rows(&self, sheet: &str) -> Result<Vec<Vec<String>>>;

    /// Formula text for a cell, empty when the cell holds none.
    fn cell_formula(&self, sheet: &str, cell_ref: &str) -> Result<String>;
}

/// Production reader backed by umya-spreadsheet.
#[derive(Debug, Clone, Copy, Default)]
pub struct XlsxWorkbookReader;

impl XlsxWorkbookReader {
    pub fn new() -> Self {
        Self
    }
}

impl WorkbookReader for XlsxWorkbookReader {
    fn open(&self, path: &Path) -> Result<Box<dyn WorkbookHandle>> {
        let book = umya_spreadsheet::reader::xlsx::read(path)
            .map_err(|e| ServerError::Io(format!("failed to open {}: {e:?}", path.display())))?;
        Ok(Box::new(XlsxWorkbookHandle { book }))
    }
}

struct XlsxWorkbookHandle {
    book: umya_spreadsheet::Spreadsheet,
}

impl WorkbookHandle for XlsxWorkbookHandle {
    fn sheet_list(&self) -> Vec<String> {
        self.book
            .get_sheet_collection()
            .iter()
            .map(|sheet| sheet.get_name().to_string())
            .collect()
    }

    fn rows(&self, sheet: &str) -> Result<Vec<Vec<String>>> {
        let worksheet = self
            .book
            .get_sheet_by_name(sheet)
            .ok_or_else(|| ServerError::Io(format!("unknown sheet: {sheet}")))?;

        let max_row = worksheet.get_highest_row();
        let max_col = worksheet.get_highest_column();

        let mut rows = Vec::with_capacity(max_row as usize);
        for row in 1..=max_row {
            let mut cells = Vec::with_capacity(max_col as usize);
            for col in 1..=max_col {
                cells.push(worksheet.get_value((col, row)));
            }
            while cells.last().is_some_and(|cell| cell.is_empty()) {
                cells.pop();
            }
            rows.push(cells);
        }
        while rows.last().is_some_and(|row| row.is_empty()) {
            rows.pop();
        }
        Ok(rows)
    }

    fn cell_formula(&self, sheet: &str, cell_ref: &str) -> Result<String> {
        let worksheet = self
            .book
            .get_sheet_by_name(sheet)
            .ok_or_else(|| ServerError::Io(format!("unknown sheet: {sheet}")))?;
        let (col, row) = cell_name_to_coordinates(cell_ref)?;
        Ok(worksheet
            .get_cell((col, row))
            .map(|cell| cell.get_formula().to_string())
            .unwrap_or_default())
    }
}

/// 1-based (col, row) to an A1-style reference.
pub fn coordinates_to_cell_name(col: u32, row: u32) -> String {
    let mut letters = String::new();
    let mut remaining = col;
    while remaining > 0 {
        let rem = (remaining - 1) % 26;
        letters.insert(0, (b'A' + rem as u8) as char);
        remaining = (remaining - 1) / 26;
    }
    format!("{letters}{row}")
}

/// A1-style reference to 1-based (col, row).
pub fn cell_name_to_coordinates(cell_ref: &str) -> Result<(u32, u32)> {
    let split = cell_ref
        .find(|c: char| c.is_ascii_digit())
        .with_context(|| format!("invalid cell reference: {cell_ref}"))?;
    let (letters, digits) = cell_ref.split_at(split);

    anyhow::ensure!(
        !letters.is_empty() && letters.chars().all(|c| c.is_ascii_alphabetic()),
        "invalid cell reference: {cell_ref}"
    );

    let mut col = 0u32;
    for c in letters.chars() {
        col = col * 26 + (c.to_ascii_uppercase() as u32 - 'A' as u32 + 1);
    }
    let row: u32 = digits
        .parse()
        .with_context(|| format!("invalid cell reference: {cell_ref}"))?;
    anyhow::ensure!(row > 0, "invalid cell reference: {cell_ref}");

    Ok((col, row))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cell_name_round_trips() {
        for (col, row, name) in [
            (1, 1, "A1"),
            (26, 10, "Z10"),
            (27, 2, "AA2"),
            (52, 100, "AZ100"),
            (703, 1, "AAA1"),
        ] {
            assert_eq!(coordinates_to_cell_name(col, row), name);
            assert_eq!(cell_name_to_coordinates(name).unwrap(), (col, row));
        }
    }

    #[test]
    fn invalid_cell_names_are_rejected() {
        assert!(cell_name_to_coordinates("").is_err());
        assert!(cell_name_to_coordinates("123").is_err());
        assert!(cell_name_to_coordinates("ABC").is_err());
        assert!(cell_name_to_coordinates("A0").is_err());
    }
}
