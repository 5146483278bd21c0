#![allow(dead_code)]
use anyhow::Result;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use umya_spreadsheet::{Spreadsheet, Worksheet};

use workbook_mcp::config::ServerConfig;
use workbook_mcp::reader::{WorkbookHandle, WorkbookReader};
use workbook_mcp::state::AppState;

#[derive(Clone, Debug)]
pub enum CellVal {
    Text(String),
    Num(f64),
    Formula(String),
    Empty,
}

impl From<&str> for CellVal {
    fn from(s: &str) -> Self {
        CellVal::Text(s.to_string())
    }
}

impl From<f64> for CellVal {
    fn from(n: f64) -> Self {
        CellVal::Num(n)
    }
}

impl From<i32> for CellVal {
    fn from(n: i32) -> Self {
        CellVal::Num(n as f64)
    }
}

pub fn set_cell(sheet: &mut Worksheet, col: u32, row: u32, val: &CellVal) {
    match val {
        CellVal::Text(s) => {
            sheet.get_cell_mut((col, row)).set_value(s.clone());
        }
        CellVal::Num(n) => {
            sheet.get_cell_mut((col, row)).set_value_number(*n);
        }
        CellVal::Formula(f) => {
            sheet.get_cell_mut((col, row)).set_formula(f.clone());
        }
        CellVal::Empty => {}
    }
}

/// Fill a sheet from row 1: headers across the first row, then data rows.
pub fn fill_table<V>(sheet: &mut Worksheet, headers: &[&str], rows: &[Vec<V>])
where
    V: Into<CellVal> + Clone,
{
    for (col_idx, header) in headers.iter().enumerate() {
        set_cell(sheet, col_idx as u32 + 1, 1, &CellVal::from(*header));
    }
    for (row_idx, row) in rows.iter().enumerate() {
        for (col_idx, val) in row.iter().enumerate() {
            let val: CellVal = val.clone().into();
            set_cell(sheet, col_idx as u32 + 1, row_idx as u32 + 2, &val);
        }
    }
}

pub struct TestWorkspace {
    dir: tempfile::TempDir,
}

impl TestWorkspace {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("tempdir"),
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn create_workbook(
        &self,
        name: &str,
        build: impl FnOnce(&mut Spreadsheet),
    ) -> PathBuf {
        let mut book = umya_spreadsheet::new_file();
        build(&mut book);
        let path = self.path(name);
        umya_spreadsheet::writer::xlsx::write(&book, &path).expect("write workbook");
        path
    }

    /// A stub file on disk whose sheet data comes from a fake reader.
    pub fn write_stub(&self, name: &str, contents: &[u8]) -> PathBuf {
        let path = self.path(name);
        std::fs::write(&path, contents).expect("write stub");
        path
    }
}

pub fn app_state() -> Arc<AppState> {
    let config = Arc::new(ServerConfig::default());
    Arc::new(AppState::new(config).expect("app state"))
}

pub fn app_state_with_reader(reader: Arc<dyn WorkbookReader>) -> Arc<AppState> {
    let config = Arc::new(ServerConfig::default());
    Arc::new(AppState::with_reader(config, reader).expect("app state"))
}

type SheetData = Vec<(String, Vec<Vec<String>>)>;

/// In-memory reader for shapes the xlsx writer cannot express (hundreds of
/// sheets, zero sheets). The path must still exist on disk because the
/// server checksums raw bytes.
#[derive(Default)]
pub struct FakeWorkbookReader {
    workbooks: Mutex<HashMap<PathBuf, SheetData>>,
}

impl FakeWorkbookReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, path: &Path, sheets: SheetData) {
        self.workbooks.lock().insert(path.to_path_buf(), sheets);
    }

    pub fn register_named_sheets(&self, path: &Path, names: &[String]) {
        let sheets = names
            .iter()
            .map(|name| (name.clone(), vec![vec![name.clone()]]))
            .collect();
        self.register(path, sheets);
    }
}

impl WorkbookReader for FakeWorkbookReader {
    fn open(&self, path: &Path) -> Result<Box<dyn WorkbookHandle>> {
        let sheets = self
            .workbooks
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no fake workbook registered for {path:?}"))?;
        Ok(Box::new(FakeWorkbookHandle { sheets }))
    }
}

struct FakeWorkbookHandle {
    sheets: SheetData,
}

impl WorkbookHandle for FakeWorkbookHandle {
    fn sheet_list(&self) -> Vec<String> {
        self.sheets.iter().map(|(name, _)| name.clone()).collect()
    }

    fn rows(&self, sheet: &str) -> Result<Vec<Vec<String>>> {
        self.sheets
            .iter()
            .find(|(name, _)| name == sheet)
            .map(|(_, rows)| rows.clone())
            .ok_or_else(|| anyhow::anyhow!("unknown sheet: {sheet}"))
    }

    fn cell_formula(&self, _sheet: &str, _cell_ref: &str) -> Result<String> {
        Ok(String::new())
    }
}

/// The standard small fixture: one sales sheet with text and numerics.
pub fn sales_workbook(workspace: &TestWorkspace, name: &str) -> PathBuf {
    workspace.create_workbook(name, |book| {
        let sheet = book.get_sheet_by_name_mut("Sheet1").unwrap();
        sheet.set_name("Ventes");
        fill_table(
            sheet,
            &["Rayons", "Ventes_HT", "Marges"],
            &[
                vec![CellVal::from("Boucherie"), CellVal::from(1500), CellVal::from(320)],
                vec![CellVal::from("Fromage"), CellVal::from(2750.5), CellVal::from(410)],
                vec![CellVal::from("Legumes"), CellVal::from(980), CellVal::from(150)],
            ],
        );
    })
}
