use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;

use crate::cache::CacheEntry;
use crate::index::IndexEngine;
use crate::model::{
    BuildNavigationResponse, CacheControl, ChunkInfo, Connections, DeltaTracking, NavigationIndex,
    Pagination, SearchIndexSnapshot, SheetIndex, SheetMetadata, TokenTracking, Zone,
};
use crate::reader::{WorkbookHandle, coordinates_to_cell_name};
use crate::state::{AppState, WorkbookContext};
use crate::tools::{BuildNavigationMapParams, detect_model};

/// Fixed row height of a zone.
const ZONE_ROWS: usize = 1000;
/// Zones spanning more rows than this are flagged for compression.
const ZONE_COMPRESS_ROWS: usize = 500;
/// Hot zones are square windows of this side length.
const HOT_ZONE_WINDOW: usize = 10;
const HOT_ZONE_DENSITY: f64 = 0.7;
/// Hot-zone scanning is capped to the leftmost columns.
const HOT_ZONE_COL_LIMIT: usize = 50;
/// First-row / first-column prefix length reported as key points.
const KEY_POINT_PREFIX: usize = 5;

const CACHE_TTL_MATCH_SECS: u64 = 600;
const CACHE_TTL_MISMATCH_SECS: u64 = 300;

pub async fn build_navigation_map(
    state: Arc<AppState>,
    params: BuildNavigationMapParams,
) -> Result<BuildNavigationResponse> {
    let window_size = params.window_size.max(1);

    let context = state.open_workbook(params.filepath.as_ref()).await?;
    let current_checksum = context.checksum.clone();

    let checksum_match = current_checksum == params.checksum;
    let invalidation_required = !checksum_match;
    let cache_key = format!("nav_{current_checksum}");

    // A cursor binds the continuation to the version that minted it.
    let offset = match params.chunk_cursor.as_deref() {
        Some(cursor) if !cursor.is_empty() => {
            let data = state.cursors.validate_checksum(cursor, &current_checksum)?;
            data.offset as usize
        }
        _ => 0,
    };

    if checksum_match
        && offset == 0
        && let Some(cached) = state.cache.get_with_validation(&cache_key, &current_checksum)
        && let Ok(mut response) = serde_json::from_value::<BuildNavigationResponse>(cached)
    {
        response.cache_control.hot_data_extension = true;
        return Ok(response);
    }

    let total_sheets = context.sheet_names.len();
    let end = (offset + window_size).min(total_sheets);
    let window_sheets: Vec<String> = context.sheet_names[offset.min(total_sheets)..end].to_vec();

    let deadline = state
        .config()
        .tool_timeout("build_navigation_map")
        .map(|timeout| Instant::now() + timeout);

    let build_context = context.clone();
    let build_sheets = window_sheets.clone();
    let (sheet_index, engine) = tokio::task::spawn_blocking(move || {
        build_window(&build_context, offset, &build_sheets, deadline)
    })
    .await
    .map_err(|e| crate::errors::ServerError::Internal(format!("navigation task failed: {e}")))??;

    let stats = engine.stats();
    let engine = Arc::new(engine);
    state.register_index(&current_checksum, engine.clone());

    let navigation_index = NavigationIndex {
        checksum_match,
        invalidation_required,
        chunk_info: ChunkInfo {
            current: format!("chunk_{}_{}", offset, end.saturating_sub(1)),
            total_chunks: total_sheets.div_ceil(window_size).max(1),
            sheets_in_chunk: window_sheets,
            streaming_active: params.stream_results,
        },
        sheet_index,
        connections: Connections::default(),
        search_index: SearchIndexSnapshot {
            btree_index: json!({ "items": stats.btree_items }),
            inverted_index: json!({ "tokens": stats.inverted_tokens }),
            spatial_index: json!({ "points": stats.spatial_points }),
            bloom_filter: json!({ "initialized": true }),
        },
        delta_tracking: DeltaTracking {
            last_update: stats.last_update,
            changed_cells: Vec::new(),
            rebuild_required: !checksum_match,
        },
    };

    let token_tracking = track_tokens(&state, &navigation_index, params.token_config.as_ref())?;
    let pagination = build_pagination(
        &state,
        &params,
        &current_checksum,
        offset,
        end,
        total_sheets,
        window_size,
    );
    let cache_control = CacheControl {
        ttl_seconds: if checksum_match {
            CACHE_TTL_MATCH_SECS
        } else {
            CACHE_TTL_MISMATCH_SECS
        },
        invalidate_on_checksum: true,
        hot_data_extension: checksum_match,
        cache_key: cache_key.clone(),
    };

    let response = BuildNavigationResponse {
        navigation_index,
        token_tracking,
        pagination,
        cache_control,
    };

    if checksum_match
        && offset == 0
        && let Ok(value) = serde_json::to_value(&response)
    {
        let size = serde_json::to_vec(&value).map(|v| v.len() as u64).unwrap_or(0);
        let now = Utc::now();
        let ttl = chrono::Duration::seconds(response.cache_control.ttl_seconds as i64);
        state.cache.set_with_metadata(
            &cache_key,
            CacheEntry {
                value,
                size,
                created_at: now,
                expires_at: now + ttl,
                checksum: Some(current_checksum),
            },
        );
    }

    Ok(response)
}

fn build_window(
    context: &WorkbookContext,
    offset: usize,
    sheets: &[String],
    deadline: Option<Instant>,
) -> Result<(Vec<SheetIndex>, IndexEngine)> {
    let handle = context.handle.as_ref();

    let mut sheet_index = Vec::with_capacity(sheets.len());
    for (i, sheet) in sheets.iter().enumerate() {
        if let Some(deadline) = deadline
            && Instant::now() > deadline
        {
            return Err(crate::errors::ServerError::Cancelled.into());
        }
        sheet_index.push(build_sheet_index(handle, sheet, offset + i)?);
    }

    let engine = IndexEngine::new();
    engine.build_from(handle, sheets, deadline)?;

    Ok((sheet_index, engine))
}

fn build_sheet_index(
    handle: &dyn WorkbookHandle,
    sheet: &str,
    sheet_id: usize,
) -> Result<SheetIndex> {
    let rows = handle.rows(sheet)?;

    let total_rows = rows.len();
    let total_cols = rows.iter().map(Vec::len).max().unwrap_or(0);
    let non_empty: usize = rows
        .iter()
        .map(|row| row.iter().filter(|cell| !cell.is_empty()).count())
        .sum();

    let data_density = if total_rows * total_cols > 0 {
        non_empty as f64 / (total_rows * total_cols) as f64
    } else {
        0.0
    };

    let mut has_formulas = false;
    'sample: for row_idx in 0..HOT_ZONE_WINDOW.min(total_rows) {
        for col_idx in 0..HOT_ZONE_WINDOW.min(total_cols) {
            let cell_ref = coordinates_to_cell_name(col_idx as u32 + 1, row_idx as u32 + 1);
            if !handle.cell_formula(sheet, &cell_ref)?.is_empty() {
                has_formulas = true;
                break 'sample;
            }
        }
    }

    Ok(SheetIndex {
        sheet_id: format!("sheet_{sheet_id}"),
        name: sheet.to_string(),
        metadata: SheetMetadata {
            rows: total_rows,
            cols: total_cols,
            data_density,
            has_formulas,
            memory_footprint: non_empty as u64 * 50,
        },
        zones: build_zones(total_rows, total_cols),
        key_points: key_points(&rows),
        hot_zones: hot_zones(&rows),
    })
}

fn build_zones(total_rows: usize, total_cols: usize) -> Vec<Zone> {
    let mut zones = Vec::new();

    let mut start_row = 0usize;
    let mut zone_id = 0usize;
    while start_row < total_rows {
        let end_row = (start_row + ZONE_ROWS).min(total_rows);
        let start_ref = coordinates_to_cell_name(1, start_row as u32 + 1);
        let end_ref = coordinates_to_cell_name(total_cols.max(1) as u32, end_row as u32);

        zones.push(Zone {
            zone_id: format!("zone_{zone_id}"),
            range: format!("{start_ref}:{end_ref}"),
            window_size: ZONE_ROWS,
            compressed: end_row - start_row > ZONE_COMPRESS_ROWS,
        });

        start_row += ZONE_ROWS;
        zone_id += 1;
    }

    zones
}

/// Corner plus the first-row and first-column prefixes.
fn key_points(rows: &[Vec<String>]) -> Vec<String> {
    let mut points = Vec::new();

    if rows.first().is_some_and(|row| !row.is_empty()) {
        points.push("A1".to_string());
    }

    if let Some(first_row) = rows.first() {
        for col_idx in 0..KEY_POINT_PREFIX.min(first_row.len()) {
            points.push(coordinates_to_cell_name(col_idx as u32 + 1, 1));
        }
    }

    for row_idx in 0..KEY_POINT_PREFIX.min(rows.len()) {
        points.push(coordinates_to_cell_name(1, row_idx as u32 + 1));
    }

    points
}

/// Square windows whose non-empty density clears the threshold.
fn hot_zones(rows: &[Vec<String>]) -> Vec<String> {
    let mut zones = Vec::new();
    if rows.len() < HOT_ZONE_WINDOW {
        return zones;
    }

    let mut start_row = 0usize;
    while start_row + HOT_ZONE_WINDOW <= rows.len() {
        let mut start_col = 0usize;
        while start_col < HOT_ZONE_COL_LIMIT {
            if window_density(rows, start_row, start_col) > HOT_ZONE_DENSITY {
                let start_ref =
                    coordinates_to_cell_name(start_col as u32 + 1, start_row as u32 + 1);
                let end_ref = coordinates_to_cell_name(
                    (start_col + HOT_ZONE_WINDOW) as u32,
                    (start_row + HOT_ZONE_WINDOW) as u32,
                );
                zones.push(format!("{start_ref}:{end_ref}"));
            }
            start_col += HOT_ZONE_WINDOW;
        }
        start_row += HOT_ZONE_WINDOW;
    }

    zones
}

fn window_density(rows: &[Vec<String>], start_row: usize, start_col: usize) -> f64 {
    let mut total = 0usize;
    let mut non_empty = 0usize;

    for row in rows.iter().skip(start_row).take(HOT_ZONE_WINDOW) {
        for cell in row.iter().skip(start_col).take(HOT_ZONE_WINDOW) {
            total += 1;
            if !cell.is_empty() {
                non_empty += 1;
            }
        }
    }

    if total == 0 {
        return 0.0;
    }
    non_empty as f64 / total as f64
}

fn track_tokens(
    state: &AppState,
    navigation_index: &NavigationIndex,
    token_config: Option<&super::TokenConfig>,
) -> Result<TokenTracking> {
    let used = state.token_counter.count(navigation_index)?;
    let model = detect_model(token_config);
    let limits = state.token_counter.limits(&model);
    let strategy = state.token_counter.strategy(used, &model);

    Ok(TokenTracking {
        used,
        remaining: limits.safe_buffer as i64 - used as i64,
        compression_applied: strategy.as_str().to_string(),
        optimization: "none".to_string(),
        actual_count: used,
    })
}

#[allow(clippy::too_many_arguments)]
fn build_pagination(
    state: &AppState,
    params: &BuildNavigationMapParams,
    checksum: &str,
    offset: usize,
    end: usize,
    total_sheets: usize,
    window_size: usize,
) -> Pagination {
    let remaining_chunks = (total_sheets.saturating_sub(end)).div_ceil(window_size);

    let next_cursor = if end < total_sheets {
        let next_end = (end + window_size).min(total_sheets);
        state.cursors.navigation_cursor(
            &format!("chunk_{}_{}", end, next_end - 1),
            end as u64,
            checksum,
        )
    } else {
        String::new()
    };

    let previous_cursor = if offset > 0 {
        let prev_start = offset.saturating_sub(window_size);
        state.cursors.navigation_cursor(
            &format!("chunk_{}_{}", prev_start, offset - 1),
            prev_start as u64,
            checksum,
        )
    } else {
        String::new()
    };

    Pagination {
        current_cursor: params.chunk_cursor.clone().unwrap_or_default(),
        next_cursor,
        previous_cursor,
        remaining_chunks,
        estimated_time_remaining: remaining_chunks as u64 * 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid(rows: usize, cols: usize, fill: &str) -> Vec<Vec<String>> {
        vec![vec![fill.to_string(); cols]; rows]
    }

    #[test]
    fn zones_tile_the_sheet_without_gaps() {
        let zones = build_zones(2500, 8);
        assert_eq!(zones.len(), 3);
        assert_eq!(zones[0].range, "A1:H1000");
        assert_eq!(zones[1].range, "A1001:H2000");
        assert_eq!(zones[2].range, "A2001:H2500");
        assert!(zones[0].compressed);
        assert!(!zones[2].compressed);
    }

    #[test]
    fn key_points_cover_corner_and_prefixes() {
        let rows = grid(8, 8, "x");
        let points = key_points(&rows);
        assert_eq!(points[0], "A1");
        assert!(points.contains(&"E1".to_string()));
        assert!(points.contains(&"A5".to_string()));
    }

    #[test]
    fn dense_windows_become_hot_zones() {
        let rows = grid(10, 10, "x");
        let zones = hot_zones(&rows);
        assert_eq!(zones, vec!["A1:J10".to_string()]);
    }

    #[test]
    fn sparse_windows_are_not_hot() {
        let mut rows = grid(10, 10, "");
        for row in rows.iter_mut().take(3) {
            for cell in row.iter_mut() {
                *cell = "x".to_string();
            }
        }
        assert!(hot_zones(&rows).is_empty());
    }
}
