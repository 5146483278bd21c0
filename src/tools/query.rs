use anyhow::Result;
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::index::{IndexEngine, Location, Rectangle};
use crate::model::{
    AdaptiveResponse, ChunkMetadata, DataChunk, IndexUpdates, ModelContext, Pagination,
    QueryDataResponse, QueryExecution, QueryPerformance, QueryResults, RowContext, Statistics,
    StrategyConfig, Window,
};
use crate::reader::{WorkbookHandle, coordinates_to_cell_name};
use crate::state::{AppState, WorkbookContext};
use crate::tools::QueryDataParams;

/// Wide sheets are cut to this many columns on the scan path.
const SCAN_COL_LIMIT: usize = 20;
/// Side length of the rectangle searched around a NEAR point.
const NEAR_RADIUS: f64 = 5.0;

/// Lenient view over whatever navigation_index JSON the client sends back.
#[derive(Debug, Default, Deserialize)]
struct NavigationIndexView {
    #[serde(default)]
    sheet_index: Vec<SheetIndexView>,
}

#[derive(Debug, Deserialize)]
struct SheetIndexView {
    #[serde(default)]
    sheet_id: String,
    name: String,
    #[serde(default)]
    metadata: Option<SheetMetadataView>,
}

#[derive(Debug, Deserialize)]
struct SheetMetadataView {
    #[serde(default)]
    rows: usize,
}

pub async fn query_data(
    state: Arc<AppState>,
    params: QueryDataParams,
) -> Result<QueryDataResponse> {
    let started = Instant::now();

    let navigation: NavigationIndexView = serde_json::from_value(params.navigation_index.clone())
        .map_err(|e| {
            crate::errors::ServerError::InvalidParams(format!("navigation_index: {e}"))
        })?;

    // Bind to a workbook version when the caller names a file.
    let context = match params.filepath.as_deref() {
        Some(filepath) => Some(state.open_workbook(filepath.as_ref()).await?),
        None => None,
    };
    let current_checksum = context
        .as_ref()
        .map(|c| c.checksum.clone())
        .or_else(|| params.checksum.clone());

    let (offset, window) = match params.continuation_cursor.as_deref() {
        Some(cursor) if !cursor.is_empty() => {
            let data = match current_checksum.as_deref() {
                Some(checksum) => state.cursors.validate_checksum(cursor, checksum)?,
                None => state.cursors.decode(cursor)?,
            };
            (data.offset as usize, data.window)
        }
        _ => (0, None),
    };

    let strategy = select_strategy(&params.query, &navigation, params.optimization_hints.prefer_speed);
    let index_type = detect_index_type(&params.query);

    let engine = current_checksum.as_deref().and_then(|c| state.index_for(c));
    let handle = context.as_ref().map(|c| c.handle.clone());

    let index_started = Instant::now();
    let mut chunks_scanned = Vec::new();
    let mut data = Vec::new();
    let max_results = params.window_config.max_results.max(1);
    // The continuation offset skips results already delivered, so the run
    // collects enough to page past them.
    let collect_limit = offset + max_results;

    match strategy {
        Strategy::Index => {
            if let Some(engine) = engine.as_ref() {
                data = execute_index_query(
                    engine,
                    &params.query,
                    &index_type,
                    handle.as_deref(),
                    collect_limit,
                )?;
            }
        }
        Strategy::Scan => {
            let (scan_data, scanned) =
                execute_scan_query(&navigation, context.as_deref(), &params, collect_limit)?;
            data = scan_data;
            chunks_scanned = scanned;
        }
        Strategy::Hybrid => {
            if let Some(engine) = engine.as_ref() {
                data = execute_index_query(
                    engine,
                    &params.query,
                    &index_type,
                    handle.as_deref(),
                    collect_limit,
                )?;
            }
            let (scan_data, scanned) = execute_scan_query(
                &navigation,
                context.as_deref(),
                &params,
                collect_limit.saturating_sub(data.len()),
            )?;
            data.extend(scan_data);
            chunks_scanned = scanned;
        }
    }
    let data: Vec<DataChunk> = data.into_iter().skip(offset).take(max_results).collect();
    let index_time_ms = index_started.elapsed().as_millis() as u64;

    let used_index = matches!(strategy, Strategy::Index | Strategy::Hybrid);
    let query_execution = QueryExecution {
        used_index,
        index_type: if used_index {
            match strategy {
                Strategy::Hybrid => "hybrid".to_string(),
                _ => index_type.as_str().to_string(),
            }
        } else {
            "none".to_string()
        },
        chunks_scanned,
        strategy: strategy.as_str().to_string(),
        bloom_filter_used: used_index,
    };

    let results = QueryResults { data };

    let token_started = Instant::now();
    let adaptive_response = if params.token_aware {
        adaptive_response(&state, &results)?
    } else {
        AdaptiveResponse::default()
    };
    let token_count_time_ms = token_started.elapsed().as_millis() as u64;

    let pagination = build_pagination(
        &state,
        &params.query,
        current_checksum.as_deref().unwrap_or(""),
        offset,
        window,
        results.data.len(),
        max_results,
    );

    let index_updates = detect_index_updates(&params.query, &results);

    Ok(QueryDataResponse {
        query_execution,
        results,
        statistics: Statistics::default(),
        adaptive_response,
        pagination,
        index_updates,
        performance: QueryPerformance {
            query_time_ms: started.elapsed().as_millis() as u64,
            index_time_ms,
            token_count_time_ms,
        },
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    Index,
    Scan,
    Hybrid,
}

impl Strategy {
    fn as_str(&self) -> &'static str {
        match self {
            Strategy::Index => "index",
            Strategy::Scan => "scan",
            Strategy::Hybrid => "hybrid",
        }
    }
}

fn select_strategy(query: &str, navigation: &NavigationIndexView, prefer_speed: bool) -> Strategy {
    if query.contains('=') && prefer_speed {
        return Strategy::Index;
    }
    if query.contains('*') || query.contains('?') {
        return Strategy::Scan;
    }
    if navigation.sheet_index.len() > 10 {
        return Strategy::Hybrid;
    }
    Strategy::Scan
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IndexType {
    Btree,
    Spatial,
    Inverted,
}

impl IndexType {
    fn as_str(&self) -> &'static str {
        match self {
            IndexType::Btree => "btree",
            IndexType::Spatial => "spatial",
            IndexType::Inverted => "inverted",
        }
    }
}

fn detect_index_type(query: &str) -> IndexType {
    if [">=", "<=", ">", "<"].iter().any(|op| query.contains(op)) {
        return IndexType::Btree;
    }
    if query.contains("NEAR") || query.contains("WITHIN") {
        return IndexType::Spatial;
    }
    IndexType::Inverted
}

fn execute_index_query(
    engine: &IndexEngine,
    query: &str,
    index_type: &IndexType,
    handle: Option<&dyn WorkbookHandle>,
    max_results: usize,
) -> Result<Vec<DataChunk>> {
    let locations = match index_type {
        IndexType::Btree => match parse_numeric_range(query) {
            Some((min, max)) => engine.search_numeric_range(min, max),
            None => Vec::new(),
        },
        IndexType::Spatial => engine.search_spatial(&parse_spatial_bounds(query)),
        IndexType::Inverted => engine.search_text(query),
    };

    let mut rows_cache = SheetRowsCache::new(handle);
    Ok(locations
        .into_iter()
        .take(max_results)
        .map(|location| location_chunk(&location, &mut rows_cache))
        .collect())
}

fn location_chunk(location: &Location, rows_cache: &mut SheetRowsCache) -> DataChunk {
    let value = rows_cache.value_at(location);
    let size = value.as_str().map(str::len).unwrap_or(8) as u64;
    let headers = rows_cache.headers(&location.sheet);

    DataChunk {
        location: location.qualified(),
        window: format!("{}:{}", location.cell_ref, location.cell_ref),
        data_chunk: value,
        metadata: ChunkMetadata {
            size,
            truncated: false,
            compressed: false,
        },
        context: RowContext {
            headers,
            nearby: serde_json::Map::new(),
            formulas: Vec::new(),
        },
    }
}

fn execute_scan_query(
    navigation: &NavigationIndexView,
    context: Option<&WorkbookContext>,
    params: &QueryDataParams,
    max_results: usize,
) -> Result<(Vec<DataChunk>, Vec<String>)> {
    let mut results = Vec::new();
    let mut chunks_scanned = Vec::new();

    let max_sheets = params.window_config.max_sheets_per_call.max(1);
    let max_rows = params.window_config.max_rows_per_sheet.max(1);
    let needle = params.query.to_uppercase();

    for sheet in navigation.sheet_index.iter().take(max_sheets) {
        if results.len() >= max_results {
            break;
        }
        chunks_scanned.push(if sheet.sheet_id.is_empty() {
            sheet.name.clone()
        } else {
            sheet.sheet_id.clone()
        });

        let name_matches = sheet.name.to_uppercase().contains(&needle);

        let Some(context) = context else {
            if name_matches {
                results.push(sheet_summary_chunk(sheet, max_rows));
            }
            continue;
        };

        let Ok(rows) = context.handle.rows(&sheet.name) else {
            continue;
        };

        if name_matches {
            results.push(sheet_window_chunk(&sheet.name, &rows, max_rows));
            continue;
        }

        for (row_idx, row) in rows.iter().take(max_rows).enumerate() {
            if results.len() >= max_results {
                break;
            }
            if row
                .iter()
                .any(|cell| cell.to_uppercase().contains(&needle))
            {
                results.push(row_chunk(&sheet.name, row_idx, row, &rows));
            }
        }
    }

    Ok((results, chunks_scanned))
}

/// Whole-window extraction for a sheet whose name matched the query.
fn sheet_window_chunk(sheet: &str, rows: &[Vec<String>], max_rows: usize) -> DataChunk {
    let mut data = Vec::new();
    for row in rows.iter().take(max_rows) {
        let cells: Vec<Value> = row
            .iter()
            .take(SCAN_COL_LIMIT)
            .map(|cell| cell_value(cell))
            .collect();
        if cells.iter().any(|cell| !cell.is_null()) {
            data.push(Value::Array(cells));
        }
    }

    let headers = rows
        .first()
        .map(|row| row.iter().take(SCAN_COL_LIMIT).cloned().collect())
        .unwrap_or_default();
    let data_len = data.len();

    DataChunk {
        location: format!("{sheet}!A1"),
        window: format!("A1:Z{max_rows}"),
        data_chunk: Value::Array(data),
        metadata: ChunkMetadata {
            size: (data_len * 100) as u64,
            truncated: rows.len() > max_rows,
            compressed: false,
        },
        context: RowContext {
            headers,
            nearby: serde_json::Map::from_iter([(
                "sheet_data".to_string(),
                json!(data_len),
            )]),
            formulas: Vec::new(),
        },
    }
}

/// Metadata-only fallback when no workbook binding was provided.
fn sheet_summary_chunk(sheet: &SheetIndexView, max_rows: usize) -> DataChunk {
    let rows = sheet.metadata.as_ref().map(|m| m.rows).unwrap_or(0);
    DataChunk {
        location: format!("{}!A1", sheet.name),
        window: format!("A1:Z{max_rows}"),
        data_chunk: json!({ "sheet": sheet.name, "rows": rows }),
        metadata: ChunkMetadata {
            size: 64,
            truncated: rows > max_rows,
            compressed: false,
        },
        context: RowContext::default(),
    }
}

fn row_chunk(sheet: &str, row_idx: usize, row: &[String], rows: &[Vec<String>]) -> DataChunk {
    let row_number = row_idx as u32 + 1;
    let last_col = row.len().max(1) as u32;
    let end_ref = coordinates_to_cell_name(last_col, row_number);
    let cells: Vec<Value> = row.iter().map(|cell| cell_value(cell)).collect();

    DataChunk {
        location: format!("{sheet}!A{row_number}"),
        window: format!("A{row_number}:{end_ref}"),
        data_chunk: Value::Array(cells),
        metadata: ChunkMetadata {
            size: row.iter().map(String::len).sum::<usize>() as u64,
            truncated: false,
            compressed: false,
        },
        context: RowContext {
            headers: rows.first().cloned().unwrap_or_default(),
            nearby: serde_json::Map::new(),
            formulas: Vec::new(),
        },
    }
}

/// Numbers become JSON numbers, blanks become null.
fn cell_value(cell: &str) -> Value {
    if cell.is_empty() {
        return Value::Null;
    }
    match crate::index::parse_number(cell) {
        Some(number) => json!(number),
        None => Value::String(cell.to_string()),
    }
}

struct SheetRowsCache<'a> {
    handle: Option<&'a dyn WorkbookHandle>,
    rows: HashMap<String, Vec<Vec<String>>>,
}

impl<'a> SheetRowsCache<'a> {
    fn new(handle: Option<&'a dyn WorkbookHandle>) -> Self {
        Self {
            handle,
            rows: HashMap::new(),
        }
    }

    fn sheet_rows(&mut self, sheet: &str) -> Option<&Vec<Vec<String>>> {
        if !self.rows.contains_key(sheet) {
            let rows = self.handle?.rows(sheet).ok()?;
            self.rows.insert(sheet.to_string(), rows);
        }
        self.rows.get(sheet)
    }

    fn value_at(&mut self, location: &Location) -> Value {
        let Some(rows) = self.sheet_rows(&location.sheet) else {
            return Value::Null;
        };
        rows.get(location.row as usize - 1)
            .and_then(|row| row.get(location.col as usize - 1))
            .map(|cell| cell_value(cell))
            .unwrap_or(Value::Null)
    }

    fn headers(&mut self, sheet: &str) -> Vec<String> {
        self.sheet_rows(sheet)
            .and_then(|rows| rows.first())
            .map(|row| row.iter().take(SCAN_COL_LIMIT).cloned().collect())
            .unwrap_or_default()
    }
}

/// Parse `a BETWEEN x AND y`, `field >= n`, `<=`, `>`, `<` into an
/// inclusive value range.
fn parse_numeric_range(query: &str) -> Option<(f64, f64)> {
    let upper = query.to_uppercase();

    if let Some(idx) = upper.find("BETWEEN") {
        let rest = &upper[idx + "BETWEEN".len()..];
        let mut numbers = extract_numbers(rest);
        let min = numbers.next()?;
        let max = numbers.next()?;
        return Some((min.min(max), min.max(max)));
    }

    for op in [">=", "<=", ">", "<"] {
        if let Some(idx) = upper.find(op) {
            let value = extract_numbers(&upper[idx + op.len()..]).next()?;
            return Some(match op {
                ">=" => (value, f64::MAX),
                "<=" => (f64::MIN, value),
                ">" => (strictly_above(value), f64::MAX),
                _ => (f64::MIN, strictly_below(value)),
            });
        }
    }

    None
}

/// Query syntax uses `.` decimals; commas separate values (NEAR c,r).
fn extract_numbers(text: &str) -> impl Iterator<Item = f64> + '_ {
    text.split(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-'))
        .filter(|token| !token.is_empty())
        .filter_map(|token| token.parse::<f64>().ok())
        .filter(|n| n.is_finite())
}

fn strictly_above(value: f64) -> f64 {
    if value == f64::INFINITY || value.is_nan() {
        return value;
    }
    let bits = value.to_bits();
    if value >= 0.0 {
        f64::from_bits(bits + 1)
    } else {
        f64::from_bits(bits - 1)
    }
}

fn strictly_below(value: f64) -> f64 {
    -strictly_above(-value)
}

/// `WITHIN A1:J10` searches that rectangle; `NEAR c,r` searches a small
/// box around the point; anything else falls back to the origin block.
fn parse_spatial_bounds(query: &str) -> Rectangle {
    let upper = query.to_uppercase();

    if upper.contains("WITHIN") {
        for token in upper.split_whitespace() {
            if let Some((start, end)) = token.split_once(':')
                && let (Ok((min_col, min_row)), Ok((max_col, max_row))) = (
                    crate::reader::cell_name_to_coordinates(start),
                    crate::reader::cell_name_to_coordinates(end),
                )
            {
                return Rectangle::new(
                    (min_col - 1) as f64,
                    (min_row - 1) as f64,
                    (max_col.saturating_sub(min_col) + 1) as f64,
                    (max_row.saturating_sub(min_row) + 1) as f64,
                );
            }
        }
    }

    if upper.contains("NEAR") {
        let mut numbers = extract_numbers(&upper);
        if let (Some(col), Some(row)) = (numbers.next(), numbers.next()) {
            return Rectangle::new(
                (col - NEAR_RADIUS).max(0.0),
                (row - NEAR_RADIUS).max(0.0),
                NEAR_RADIUS * 2.0,
                NEAR_RADIUS * 2.0,
            );
        }
    }

    Rectangle::new(0.0, 0.0, 100.0, 100.0)
}

fn adaptive_response(state: &AppState, results: &QueryResults) -> Result<AdaptiveResponse> {
    let used = state.token_counter.count(results)?;
    let model = crate::tools::detect_model(None);
    let limits = state.token_counter.limits(&model);

    Ok(AdaptiveResponse {
        model_context: ModelContext {
            detected: model,
            limit: limits.context,
            used,
            precise_count: used,
        },
        if_extended: StrategyConfig {
            max_results: 500,
            window_rows: 5000,
            compression: "light".to_string(),
        },
        if_standard: StrategyConfig {
            max_results: 100,
            window_rows: 1000,
            compression: "medium".to_string(),
        },
        if_precise: StrategyConfig {
            max_results: 100,
            window_rows: 800,
            compression: "aggressive".to_string(),
        },
    })
}

fn build_pagination(
    state: &AppState,
    query: &str,
    checksum: &str,
    offset: usize,
    window: Option<Window>,
    result_count: usize,
    max_results: usize,
) -> Pagination {
    if result_count < max_results {
        return Pagination::default();
    }

    let next_offset = offset + max_results;
    let next_window = Window {
        start_row: next_offset as u32,
        end_row: (next_offset + max_results) as u32,
        start_col: window.map(|w| w.start_col).unwrap_or(0),
        end_col: window.map(|w| w.end_col).unwrap_or(100),
    };

    Pagination {
        next_cursor: state
            .cursors
            .query_cursor(query, next_offset as u64, checksum, Some(next_window)),
        ..Pagination::default()
    }
}

fn detect_index_updates(query: &str, results: &QueryResults) -> IndexUpdates {
    let mut new_patterns = Vec::new();

    if results.data.len() > 50 {
        new_patterns.push("high_volume_query".to_string());
    }
    let upper = query.to_uppercase();
    if upper.contains("SUM") || upper.contains("COUNT") {
        new_patterns.push("aggregation_query".to_string());
    }

    IndexUpdates {
        new_patterns,
        suggested_chunks: Vec::new(),
        delta_applied: false,
    }
}
