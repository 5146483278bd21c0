mod quadtree;

pub use quadtree::{QuadTree, Rectangle, SpatialPoint};

use anyhow::Result;
use bloomfilter::Bloom;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

use crate::errors::ServerError;
use crate::model::Delta;
use crate::reader::{WorkbookHandle, cell_name_to_coordinates, coordinates_to_cell_name};

const BLOOM_ITEMS: usize = 100_000;
const BLOOM_FP_RATE: f64 = 0.01;
const QUADTREE_CAPACITY: usize = 10;
const QUADTREE_BOUNDS: Rectangle = Rectangle {
    x: 0.0,
    y: 0.0,
    width: 1000.0,
    height: 1000.0,
};

/// Bulk changes touching more cells than this go through an asynchronous
/// per-sheet rebuild instead of synchronous application.
const BULK_REBUILD_THRESHOLD: usize = 1000;

const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with", "by", "is",
];

/// Cell position; ordering is (sheet, col, row).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Location {
    pub sheet: String,
    pub col: u32,
    pub row: u32,
    pub cell_ref: String,
}

impl Location {
    pub fn new(sheet: &str, col: u32, row: u32) -> Self {
        Self {
            sheet: sheet.to_string(),
            col,
            row,
            cell_ref: coordinates_to_cell_name(col, row),
        }
    }

    /// Parse a "Sheet!A1" reference.
    pub fn parse(reference: &str) -> Option<Self> {
        let (sheet, cell_ref) = reference.split_once('!')?;
        let (col, row) = cell_name_to_coordinates(cell_ref).ok()?;
        Some(Self::new(sheet, col, row))
    }

    pub fn qualified(&self) -> String {
        format!("{}!{}", self.sheet, self.cell_ref)
    }
}

#[derive(Debug, Clone)]
struct NumericKey {
    value: f64,
    location: Location,
}

impl PartialEq for NumericKey {
    fn eq(&self, other: &Self) -> bool {
        self.value.total_cmp(&other.value).is_eq() && self.location == other.location
    }
}

impl Eq for NumericKey {}

impl PartialOrd for NumericKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NumericKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.value
            .total_cmp(&other.value)
            .then_with(|| self.location.cmp(&other.location))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub btree_items: usize,
    pub inverted_tokens: usize,
    pub spatial_points: usize,
    pub last_update: DateTime<Utc>,
    pub delta_buffer_size: usize,
}

struct IndexStores {
    numeric: BTreeSet<NumericKey>,
    inverted: HashMap<String, Vec<Location>>,
    spatial: QuadTree,
    bloom: Bloom<str>,
    last_update: DateTime<Utc>,
    delta_buffer: Vec<Delta>,
}

impl IndexStores {
    fn new() -> Self {
        Self {
            numeric: BTreeSet::new(),
            inverted: HashMap::new(),
            spatial: QuadTree::new(QUADTREE_BOUNDS, QUADTREE_CAPACITY),
            bloom: Bloom::new_for_fp_rate(BLOOM_ITEMS, BLOOM_FP_RATE),
            last_update: Utc::now(),
            delta_buffer: Vec::new(),
        }
    }

    fn insert_cell(&mut self, value: &str, location: Location) {
        if let Some(number) = parse_number(value) {
            self.numeric.insert(NumericKey {
                value: number,
                location: location.clone(),
            });
        } else {
            for token in tokenize(value) {
                self.inverted.entry(token).or_default().push(location.clone());
            }
        }

        self.spatial.insert(SpatialPoint {
            x: (location.col - 1) as f64,
            y: (location.row - 1) as f64,
            value: value.to_string(),
            location,
        });
        self.bloom.set(value);
    }

    fn remove_cell(&mut self, value: &str, location: &Location) {
        if let Some(number) = parse_number(value) {
            self.numeric.remove(&NumericKey {
                value: number,
                location: location.clone(),
            });
        } else {
            for token in tokenize(value) {
                if let Some(postings) = self.inverted.get_mut(&token) {
                    postings.retain(|loc| loc != location);
                    if postings.is_empty() {
                        self.inverted.remove(&token);
                    }
                }
            }
        }
        self.spatial.remove_location(location);
        // The bloom prefilter is additive-only; stale entries only cost
        // false positives.
    }

    fn remove_sheet(&mut self, sheet: &str) {
        self.numeric.retain(|key| key.location.sheet != sheet);
        self.inverted.retain(|_, postings| {
            postings.retain(|loc| loc.sheet != sheet);
            !postings.is_empty()
        });
        self.spatial.retain(|point| point.location.sheet != sheet);
    }
}

/// Four search structures indexed in lockstep behind one reader-writer
/// lock: ordered numeric tree, inverted text index, spatial quadtree, and
/// a bloom prefilter over raw cell strings.
pub struct IndexEngine {
    stores: RwLock<IndexStores>,
}

impl Default for IndexEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexEngine {
    pub fn new() -> Self {
        Self {
            stores: RwLock::new(IndexStores::new()),
        }
    }

    /// Index every non-empty cell of the requested sheets. Checks the
    /// deadline at sheet boundaries.
    pub fn build_from(
        &self,
        reader: &dyn WorkbookHandle,
        sheet_names: &[String],
        deadline: Option<Instant>,
    ) -> Result<()> {
        let started = Utc::now();
        let mut stores = self.stores.write();

        let buffered: Vec<Delta> = std::mem::take(&mut stores.delta_buffer);
        let pending_sheets: Vec<String> = buffered
            .into_iter()
            .filter_map(|delta| match delta {
                Delta::SheetAdd { sheet } => Some(sheet),
                _ => None,
            })
            .filter(|sheet| !sheet_names.contains(sheet))
            .collect();

        for sheet in sheet_names.iter().chain(pending_sheets.iter()) {
            if let Some(deadline) = deadline
                && Instant::now() > deadline
            {
                return Err(ServerError::Cancelled.into());
            }
            index_sheet(&mut stores, reader, sheet)?;
        }

        stores.last_update = started;
        Ok(())
    }

    /// Apply incremental changes. Returns the sheets that exceeded the bulk
    /// threshold and need a background partial rebuild.
    pub fn apply_delta(&self, deltas: &[Delta]) -> Vec<String> {
        let mut stores = self.stores.write();
        let mut rebuild_sheets = Vec::new();

        for delta in deltas {
            match delta {
                Delta::CellUpdate {
                    location,
                    old_value,
                    new_value,
                    ..
                }
                | Delta::FormulaChange {
                    location,
                    old_value,
                    new_value,
                    ..
                } => {
                    // Formula changes are scoped to the cell itself;
                    // dependency propagation is out of scope.
                    let Some(location) = Location::parse(location) else {
                        continue;
                    };
                    if let Some(old) = value_as_text(old_value) {
                        stores.remove_cell(&old, &location);
                    }
                    if let Some(new) = value_as_text(new_value) {
                        stores.insert_cell(&new, location);
                    }
                }
                Delta::SheetAdd { .. } => {
                    stores.delta_buffer.push(delta.clone());
                }
                Delta::BulkChange {
                    sheet,
                    affected_cells,
                } => {
                    if *affected_cells > BULK_REBUILD_THRESHOLD {
                        rebuild_sheets.push(sheet.clone());
                    } else {
                        stores.remove_sheet(sheet);
                        stores.delta_buffer.push(Delta::SheetAdd {
                            sheet: sheet.clone(),
                        });
                    }
                }
            }
        }

        stores.last_update = Utc::now();
        rebuild_sheets
    }

    /// Rebuild one sheet's contributions offline, then swap them in under
    /// the write lock so readers never observe a half-rebuilt sheet.
    pub fn rebuild_sheet(&self, reader: &dyn WorkbookHandle, sheet: &str) -> Result<()> {
        let mut fresh = IndexStores::new();
        index_sheet(&mut fresh, reader, sheet)?;

        let mut stores = self.stores.write();
        stores.remove_sheet(sheet);
        for key in fresh.numeric {
            stores.numeric.insert(key);
        }
        for (token, postings) in fresh.inverted {
            stores.inverted.entry(token).or_default().extend(postings);
        }
        for point in fresh.spatial.query(&QUADTREE_BOUNDS) {
            stores.bloom.set(&point.value);
            stores.spatial.insert(point);
        }
        stores.last_update = Utc::now();
        Ok(())
    }

    /// Schedule partial rebuilds for the given sheets on blocking workers.
    pub fn spawn_partial_rebuilds(
        self: &Arc<Self>,
        reader: Arc<dyn WorkbookHandle>,
        sheets: Vec<String>,
    ) {
        for sheet in sheets {
            let engine = Arc::clone(self);
            let reader = Arc::clone(&reader);
            tokio::task::spawn_blocking(move || {
                if let Err(error) = engine.rebuild_sheet(reader.as_ref(), &sheet) {
                    tracing::warn!(sheet = %sheet, error = %error, "partial rebuild failed");
                }
            });
        }
    }

    /// Conjunctive text search: the bloom prefilter rejects unseen values
    /// outright, then postings of every query token are intersected.
    pub fn search_text(&self, query: &str) -> Vec<Location> {
        let stores = self.stores.read();

        if !stores.bloom.check(query) {
            return Vec::new();
        }

        let tokens = tokenize(query);
        let Some(first) = tokens.first() else {
            return Vec::new();
        };

        let mut results: Vec<Location> = match stores.inverted.get(first) {
            Some(postings) => postings.clone(),
            None => return Vec::new(),
        };

        for token in &tokens[1..] {
            let Some(postings) = stores.inverted.get(token) else {
                return Vec::new();
            };
            results.retain(|loc| postings.contains(loc));
        }

        results
    }

    /// Ascending traversal over `[min, max]` inclusive.
    pub fn search_numeric_range(&self, min: f64, max: f64) -> Vec<Location> {
        let stores = self.stores.read();
        let lower = NumericKey {
            value: min,
            location: Location {
                sheet: String::new(),
                col: 0,
                row: 0,
                cell_ref: String::new(),
            },
        };
        stores
            .numeric
            .range(lower..)
            .take_while(|key| key.value <= max)
            .map(|key| key.location.clone())
            .collect()
    }

    pub fn search_spatial(&self, bounds: &Rectangle) -> Vec<Location> {
        let stores = self.stores.read();
        stores
            .spatial
            .query(bounds)
            .into_iter()
            .map(|point| point.location)
            .collect()
    }

    pub fn stats(&self) -> IndexStats {
        let stores = self.stores.read();
        IndexStats {
            btree_items: stores.numeric.len(),
            inverted_tokens: stores.inverted.len(),
            spatial_points: stores.spatial.len(),
            last_update: stores.last_update,
            delta_buffer_size: stores.delta_buffer.len(),
        }
    }
}

fn index_sheet(stores: &mut IndexStores, reader: &dyn WorkbookHandle, sheet: &str) -> Result<()> {
    let rows = reader.rows(sheet)?;
    for (row_idx, row) in rows.iter().enumerate() {
        for (col_idx, value) in row.iter().enumerate() {
            if value.is_empty() {
                continue;
            }
            let location = Location::new(sheet, col_idx as u32 + 1, row_idx as u32 + 1);
            stores.insert_cell(value, location);
        }
    }
    Ok(())
}

/// Integers and decimals with `.` or `,` separators; spaces are stripped
/// as thousands separators.
pub fn parse_number(value: &str) -> Option<f64> {
    let cleaned = value.trim().replace(' ', "").replace(',', ".");
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok().filter(|n| n.is_finite())
}

/// Lowercased whitespace tokens, minus short tokens and stop words.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split_whitespace()
        .filter(|word| word.len() > 2 && !STOP_WORDS.contains(word))
        .map(str::to_string)
        .collect()
}

fn value_as_text(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
