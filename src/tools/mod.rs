pub mod analyze;
pub mod navigation;
pub mod query;

pub use analyze::analyze_file;
pub use navigation::build_navigation_map;
pub use query::query_data;

use serde::Deserialize;

pub const DEFAULT_CHUNK_SIZE: usize = 50;
pub const DEFAULT_WINDOW_SIZE: usize = 1000;

/// Files at or past this size are always streamed.
pub const STREAM_FILE_SIZE_BYTES: u64 = 100 * 1024 * 1024;
/// Chunks past this estimate require streaming when stream mode is on.
pub const STREAM_CHUNK_SIZE_BYTES: u64 = 10 * 1024 * 1024;

const DEFAULT_MODEL: &str = "standard";

#[derive(Debug, Clone, Deserialize)]
pub struct AnalyzeFileParams {
    pub filepath: String,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default)]
    pub stream_mode: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenConfig {
    #[serde(default)]
    pub model: Option<String>,
}

impl TokenConfig {
    pub fn model_or_default(&self) -> String {
        self.model
            .clone()
            .unwrap_or_else(|| DEFAULT_MODEL.to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BuildNavigationMapParams {
    pub filepath: String,
    pub checksum: String,
    #[serde(default)]
    pub chunk_cursor: Option<String>,
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    #[serde(default)]
    pub stream_results: bool,
    #[serde(default)]
    pub token_config: Option<TokenConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WindowConfig {
    #[serde(default = "default_max_rows_per_sheet")]
    pub max_rows_per_sheet: usize,
    #[serde(default = "default_max_sheets_per_call")]
    pub max_sheets_per_call: usize,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    #[serde(default)]
    pub stream_large_results: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            max_rows_per_sheet: default_max_rows_per_sheet(),
            max_sheets_per_call: default_max_sheets_per_call(),
            max_results: default_max_results(),
            stream_large_results: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OptimizationHints {
    #[serde(default = "default_true")]
    pub prefer_speed: bool,
    #[serde(default)]
    pub prefer_completeness: bool,
}

impl Default for OptimizationHints {
    fn default() -> Self {
        Self {
            prefer_speed: true,
            prefer_completeness: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryDataParams {
    pub query: String,
    pub navigation_index: serde_json::Value,
    #[serde(default)]
    pub continuation_cursor: Option<String>,
    #[serde(default)]
    pub window_config: WindowConfig,
    #[serde(default = "default_true")]
    pub token_aware: bool,
    #[serde(default)]
    pub optimization_hints: OptimizationHints,
    /// Optional workbook binding so the scan path can read real rows and
    /// the index path can find the version's search index.
    #[serde(default)]
    pub filepath: Option<String>,
    #[serde(default)]
    pub checksum: Option<String>,
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_window_size() -> usize {
    DEFAULT_WINDOW_SIZE
}

fn default_max_rows_per_sheet() -> usize {
    1000
}

fn default_max_sheets_per_call() -> usize {
    10
}

fn default_max_results() -> usize {
    100
}

fn default_true() -> bool {
    true
}

/// The transport gives no model hint, so detection falls back to the
/// default profile unless the client's token_config names one.
pub fn detect_model(token_config: Option<&TokenConfig>) -> String {
    token_config
        .map(TokenConfig::model_or_default)
        .unwrap_or_else(|| DEFAULT_MODEL.to_string())
}
