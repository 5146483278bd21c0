use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CURSOR_VERSION: u32 = 1;

/// Payload carried inside an opaque pagination cursor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorData {
    pub chunk_id: String,
    pub offset: u64,
    pub version: u32,
    pub checksum: String,
    #[serde(rename = "ts")]
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window: Option<Window>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub start_row: u32,
    pub end_row: u32,
    pub start_col: u32,
    pub end_col: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: String,
    pub sheets_range: [usize; 2],
    pub size_bytes: u64,
    pub cursor: String,
    pub streaming_required: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenManagement {
    pub model_detected: String,
    pub counting_method: String,
    pub limits: TokenLimits,
    pub chunking_strategy: ChunkingStrategy,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TokenLimits {
    pub context: usize,
    pub safe_buffer: usize,
    pub output_max: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingStrategy {
    pub sheets_per_chunk: usize,
    pub estimated_tokens: usize,
    pub actual_tokens: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMetadata {
    pub checksum: String,
    pub file_size: u64,
    pub sheets_count: usize,
    pub timestamp: DateTime<Utc>,
    pub complexity_score: f64,
    pub memory_estimate: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternsDetected {
    pub naming_patterns: Vec<String>,
    pub data_types: serde_json::Map<String, serde_json::Value>,
    pub structural_groups: usize,
    pub formula_complexity: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexSummary {
    pub value_types: serde_json::Map<String, serde_json::Value>,
    pub formula_patterns: Vec<String>,
    pub sheet_groups: Vec<String>,
    pub circular_refs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub analysis_time_ms: u64,
    pub memory_used_mb: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzeFileResponse {
    pub metadata: FileMetadata,
    pub chunks: Vec<Chunk>,
    pub patterns_detected: PatternsDetected,
    pub token_management: TokenManagement,
    pub index_summary: IndexSummary,
    pub next_cursor: String,
    pub has_more: bool,
    pub performance_metrics: PerformanceMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SheetMetadata {
    pub rows: usize,
    pub cols: usize,
    pub data_density: f64,
    pub has_formulas: bool,
    pub memory_footprint: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Zone {
    pub zone_id: String,
    pub range: String,
    pub window_size: usize,
    pub compressed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SheetIndex {
    pub sheet_id: String,
    pub name: String,
    pub metadata: SheetMetadata,
    pub zones: Vec<Zone>,
    pub key_points: Vec<String>,
    pub hot_zones: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Connections {
    pub formula_links: Vec<String>,
    pub structural_similarities: Vec<String>,
    pub circular_dependencies: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchIndexSnapshot {
    pub btree_index: serde_json::Value,
    pub inverted_index: serde_json::Value,
    pub spatial_index: serde_json::Value,
    pub bloom_filter: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaTracking {
    pub last_update: DateTime<Utc>,
    pub changed_cells: Vec<String>,
    pub rebuild_required: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkInfo {
    pub current: String,
    pub total_chunks: usize,
    pub sheets_in_chunk: Vec<String>,
    pub streaming_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NavigationIndex {
    pub checksum_match: bool,
    pub invalidation_required: bool,
    pub chunk_info: ChunkInfo,
    pub sheet_index: Vec<SheetIndex>,
    pub connections: Connections,
    pub search_index: SearchIndexSnapshot,
    pub delta_tracking: DeltaTracking,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenTracking {
    pub used: usize,
    pub remaining: i64,
    pub compression_applied: String,
    pub optimization: String,
    pub actual_count: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Pagination {
    pub current_cursor: String,
    pub next_cursor: String,
    pub previous_cursor: String,
    pub remaining_chunks: usize,
    pub estimated_time_remaining: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheControl {
    pub ttl_seconds: u64,
    pub invalidate_on_checksum: bool,
    pub hot_data_extension: bool,
    pub cache_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildNavigationResponse {
    pub navigation_index: NavigationIndex,
    pub token_tracking: TokenTracking,
    pub pagination: Pagination,
    pub cache_control: CacheControl,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryExecution {
    pub used_index: bool,
    pub index_type: String,
    pub chunks_scanned: Vec<String>,
    pub strategy: String,
    pub bloom_filter_used: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataChunk {
    pub location: String,
    pub window: String,
    pub data_chunk: serde_json::Value,
    pub metadata: ChunkMetadata,
    pub context: RowContext,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub size: u64,
    pub truncated: bool,
    pub compressed: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RowContext {
    pub headers: Vec<String>,
    pub nearby: serde_json::Map<String, serde_json::Value>,
    pub formulas: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryResults {
    pub data: Vec<DataChunk>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Statistics {
    pub aggregations: Vec<serde_json::Value>,
    pub patterns: Vec<serde_json::Value>,
    pub outliers: Vec<serde_json::Value>,
    pub formula_evaluations: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelContext {
    pub detected: String,
    pub limit: usize,
    pub used: usize,
    pub precise_count: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub max_results: usize,
    pub window_rows: usize,
    pub compression: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdaptiveResponse {
    pub model_context: ModelContext,
    pub if_extended: StrategyConfig,
    pub if_standard: StrategyConfig,
    pub if_precise: StrategyConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexUpdates {
    pub new_patterns: Vec<String>,
    pub suggested_chunks: Vec<String>,
    pub delta_applied: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryPerformance {
    pub query_time_ms: u64,
    pub index_time_ms: u64,
    pub token_count_time_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryDataResponse {
    pub query_execution: QueryExecution,
    pub results: QueryResults,
    pub statistics: Statistics,
    pub adaptive_response: AdaptiveResponse,
    pub pagination: Pagination,
    pub index_updates: IndexUpdates,
    pub performance: QueryPerformance,
}

/// Incremental change record consumed by the index engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Delta {
    CellUpdate {
        sheet: String,
        location: String,
        old_value: serde_json::Value,
        new_value: serde_json::Value,
    },
    SheetAdd {
        sheet: String,
    },
    FormulaChange {
        sheet: String,
        location: String,
        old_value: serde_json::Value,
        new_value: serde_json::Value,
    },
    BulkChange {
        sheet: String,
        affected_cells: usize,
    },
}
