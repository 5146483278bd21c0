use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use crate::cache::CacheEntry;
use crate::model::{
    AnalyzeFileResponse, Chunk, ChunkingStrategy, FileMetadata, IndexSummary, PatternsDetected,
    PerformanceMetrics, TokenLimits, TokenManagement,
};
use crate::reader::{WorkbookHandle, coordinates_to_cell_name};
use crate::state::{AppState, WorkbookContext};
use crate::tools::{AnalyzeFileParams, STREAM_CHUNK_SIZE_BYTES, STREAM_FILE_SIZE_BYTES, detect_model};

/// Sampling caps for complexity scoring and pattern detection.
const SAMPLE_SHEETS: usize = 5;
const SAMPLE_FORMULA_SHEETS: usize = 3;
const SAMPLE_GRID: usize = 10;

/// Rough per-cell payload estimate used for chunk sizing.
const BYTES_PER_CELL: u64 = 50;

pub async fn analyze_file(
    state: Arc<AppState>,
    params: AnalyzeFileParams,
) -> Result<AnalyzeFileResponse> {
    let started = Instant::now();
    let chunk_size = params.chunk_size.max(1);

    let context = state.open_workbook(params.filepath.as_ref()).await?;

    let cache_key = format!("analyze_{}_{}", context.checksum, chunk_size);
    if let Some(cached) = state.cache.get_with_validation(&cache_key, &context.checksum)
        && let Ok(mut response) = serde_json::from_value::<AnalyzeFileResponse>(cached)
    {
        response.performance_metrics.analysis_time_ms = started.elapsed().as_millis() as u64;
        return Ok(response);
    }

    let stream_mode =
        params.stream_mode.unwrap_or(false) || context.size_bytes >= STREAM_FILE_SIZE_BYTES;

    let model_detected = detect_model(None);
    let analysis_context = context.clone();
    let analysis = tokio::task::spawn_blocking(move || analyze_workbook(&analysis_context))
        .await
        .map_err(|e| crate::errors::ServerError::Internal(format!("analysis task failed: {e}")))??;

    let chunks = build_chunks(
        &state,
        &context,
        &analysis.chunk_cell_counts,
        chunk_size,
        stream_mode,
    );

    let has_more = chunks.len() > 1;
    let next_cursor = if has_more {
        state.cursors.chunk_cursor(
            &chunks[1].chunk_id,
            chunks[1].sheets_range[0] as u64,
            &context.checksum,
            None,
        )
    } else {
        String::new()
    };

    let memory_estimate = estimate_memory(context.sheet_names.len());
    let limits = state.token_counter.limits(&model_detected);

    let response = AnalyzeFileResponse {
        metadata: FileMetadata {
            checksum: context.checksum.clone(),
            file_size: context.size_bytes,
            sheets_count: context.sheet_names.len(),
            timestamp: context.modified,
            complexity_score: analysis.complexity_score,
            memory_estimate,
        },
        chunks,
        patterns_detected: analysis.patterns,
        token_management: TokenManagement {
            model_detected: model_detected.clone(),
            counting_method: "tiktoken".to_string(),
            limits: TokenLimits {
                context: limits.context,
                safe_buffer: limits.safe_buffer,
                output_max: limits.output_max,
            },
            chunking_strategy: ChunkingStrategy {
                sheets_per_chunk: chunk_size,
                estimated_tokens: state.token_counter.optimal_chunk(&model_detected, 0.8),
                actual_tokens: 0,
            },
        },
        index_summary: analysis.index_summary,
        next_cursor,
        has_more,
        performance_metrics: PerformanceMetrics {
            analysis_time_ms: started.elapsed().as_millis() as u64,
            memory_used_mb: memory_estimate / (1024 * 1024),
        },
    };

    if let Ok(value) = serde_json::to_value(&response) {
        let size = serde_json::to_vec(&value).map(|v| v.len() as u64).unwrap_or(0);
        let now = Utc::now();
        state.cache.set_with_metadata(
            &cache_key,
            CacheEntry {
                value,
                size,
                created_at: now,
                expires_at: now + chrono::Duration::minutes(5),
                checksum: Some(context.checksum.clone()),
            },
        );
    }

    Ok(response)
}

struct WorkbookAnalysis {
    complexity_score: f64,
    patterns: PatternsDetected,
    index_summary: IndexSummary,
    /// Non-empty cell count per sheet, for chunk size estimates.
    chunk_cell_counts: Vec<u64>,
}

fn analyze_workbook(context: &WorkbookContext) -> Result<WorkbookAnalysis> {
    let handle = context.handle.as_ref();
    let sheet_names = &context.sheet_names;

    let mut complexity = sheet_names.len() as f64 * 0.1;
    let mut data_types = DataTypeHistogram::default();
    let mut chunk_cell_counts = Vec::with_capacity(sheet_names.len());

    for (i, sheet) in sheet_names.iter().enumerate() {
        let rows = handle.rows(sheet)?;

        let mut cells = 0u64;
        for row in &rows {
            cells += row.iter().filter(|cell| !cell.is_empty()).count() as u64;
        }
        chunk_cell_counts.push(cells);

        if i >= SAMPLE_SHEETS {
            continue;
        }

        complexity += rows.len() as f64 * 0.001;
        for (row_idx, row) in rows.iter().take(SAMPLE_GRID).enumerate() {
            for (col_idx, value) in row.iter().take(SAMPLE_GRID).enumerate() {
                data_types.record(value);
                let cell_ref = coordinates_to_cell_name(col_idx as u32 + 1, row_idx as u32 + 1);
                if let Ok(formula) = handle.cell_formula(sheet, &cell_ref)
                    && !formula.is_empty()
                {
                    complexity += 0.1;
                    data_types.formula += 1;
                }
            }
        }
    }

    let patterns = PatternsDetected {
        naming_patterns: naming_patterns(sheet_names),
        data_types: data_types.into_map(),
        structural_groups: structural_groups(sheet_names),
        formula_complexity: formula_complexity(handle, sheet_names)?,
    };

    let mut value_types = serde_json::Map::new();
    value_types.insert("numeric".to_string(), json!(0));
    value_types.insert("text".to_string(), json!(0));
    value_types.insert("formula".to_string(), json!(0));
    value_types.insert("empty".to_string(), json!(0));

    Ok(WorkbookAnalysis {
        complexity_score: complexity.min(10.0),
        patterns,
        index_summary: IndexSummary {
            value_types,
            formula_patterns: Vec::new(),
            sheet_groups: Vec::new(),
            circular_refs: Vec::new(),
        },
        chunk_cell_counts,
    })
}

#[derive(Default)]
struct DataTypeHistogram {
    text: u64,
    numeric: u64,
    formula: u64,
    empty: u64,
}

impl DataTypeHistogram {
    fn record(&mut self, value: &str) {
        if value.is_empty() {
            self.empty += 1;
        } else if crate::index::parse_number(value).is_some() {
            self.numeric += 1;
        } else {
            self.text += 1;
        }
    }

    fn into_map(self) -> serde_json::Map<String, serde_json::Value> {
        let mut map = serde_json::Map::new();
        map.insert("text".to_string(), json!(self.text));
        map.insert("numeric".to_string(), json!(self.numeric));
        map.insert("formula".to_string(), json!(self.formula));
        map.insert("empty".to_string(), json!(self.empty));
        map
    }
}

fn build_chunks(
    state: &AppState,
    context: &WorkbookContext,
    cell_counts: &[u64],
    chunk_size: usize,
    stream_mode: bool,
) -> Vec<Chunk> {
    let sheets_count = context.sheet_names.len();
    let mut chunks = Vec::new();

    let mut lo = 0usize;
    while lo < sheets_count {
        let hi = (lo + chunk_size).min(sheets_count) - 1;
        let chunk_id = format!("chunk_{lo}_{hi}");

        let size_bytes: u64 = cell_counts[lo..=hi].iter().sum::<u64>() * BYTES_PER_CELL;

        chunks.push(Chunk {
            cursor: state
                .cursors
                .chunk_cursor(&chunk_id, lo as u64, &context.checksum, None),
            chunk_id,
            sheets_range: [lo, hi],
            size_bytes,
            streaming_required: stream_mode && size_bytes > STREAM_CHUNK_SIZE_BYTES,
        });

        lo += chunk_size;
    }

    chunks
}

fn naming_patterns(sheet_names: &[String]) -> Vec<String> {
    let mut patterns = BTreeSet::new();

    for name in sheet_names {
        if name.contains('_') {
            patterns.insert("underscore_separated");
        }
        if name.contains(' ') {
            patterns.insert("space_separated");
        }
        if name.chars().next().is_some_and(|c| c.is_ascii_digit()) {
            patterns.insert("starts_with_number");
        }
        if contains_year(name) {
            patterns.insert("contains_year");
        }
    }

    patterns.into_iter().map(str::to_string).collect()
}

/// Four consecutive digits reading as a plausible year.
fn contains_year(name: &str) -> bool {
    let digits: Vec<char> = name.chars().collect();
    digits.windows(4).any(|w| {
        w.iter().all(|c| c.is_ascii_digit())
            && matches!(&w[..2], ['1', '9'] | ['2', '0'])
    })
}

fn structural_groups(sheet_names: &[String]) -> usize {
    let prefixes: BTreeSet<&str> = sheet_names
        .iter()
        .map(|name| {
            let cut = name
                .find(['_', ' '])
                .filter(|&idx| idx > 0)
                .unwrap_or(name.len());
            &name[..cut]
        })
        .collect();
    prefixes.len()
}

fn formula_complexity(handle: &dyn WorkbookHandle, sheet_names: &[String]) -> Result<String> {
    let mut formula_count = 0usize;
    let mut complex_count = 0usize;

    for sheet in sheet_names.iter().take(SAMPLE_FORMULA_SHEETS) {
        let rows = handle.rows(sheet)?;
        for (row_idx, row) in rows.iter().take(SAMPLE_GRID).enumerate() {
            for col_idx in 0..SAMPLE_GRID.min(row.len()) {
                let cell_ref = coordinates_to_cell_name(col_idx as u32 + 1, row_idx as u32 + 1);
                let formula = handle.cell_formula(sheet, &cell_ref)?;
                if formula.is_empty() {
                    continue;
                }
                formula_count += 1;
                if ["IF", "VLOOKUP", "INDEX", "MATCH"]
                    .iter()
                    .any(|f| formula.contains(f))
                {
                    complex_count += 1;
                }
            }
        }
    }

    Ok(if formula_count == 0 {
        "none".to_string()
    } else if complex_count == 0 {
        "simple".to_string()
    } else if complex_count as f64 / formula_count as f64 > 0.3 {
        "complex".to_string()
    } else {
        "mixed".to_string()
    })
}

fn estimate_memory(sheets_count: usize) -> u64 {
    1024 * 1024 + sheets_count as u64 * 500 * 1024
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn naming_patterns_cover_separator_and_year_shapes() {
        let names = vec![
            "ventes_2024".to_string(),
            "Q1 summary".to_string(),
            "2023_archive".to_string(),
        ];
        let patterns = naming_patterns(&names);
        for expected in [
            "contains_year",
            "space_separated",
            "starts_with_number",
            "underscore_separated",
        ] {
            assert!(patterns.iter().any(|p| p == expected), "missing {expected}");
        }
    }

    #[test]
    fn structural_groups_count_distinct_prefixes() {
        let names = vec![
            "ventes_jan".to_string(),
            "ventes_feb".to_string(),
            "marges 2024".to_string(),
            "totaux".to_string(),
        ];
        assert_eq!(structural_groups(&names), 3);
    }

    #[test]
    fn year_detection_requires_a_plausible_century() {
        assert!(contains_year("bilan 2025"));
        assert!(contains_year("archive_1999_q4"));
        assert!(!contains_year("code 4521"));
        assert!(!contains_year("sheet42"));
    }
}
