use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_HTTP_BIND: &str = "0.0.0.0:3000";
const DEFAULT_MAX_FILE_SIZE_BYTES: u64 = 500 * 1024 * 1024;
const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 10;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 10_000;
const DEFAULT_CACHE_MEMORY_BYTES: u64 = 100 * 1024 * 1024;
const DEFAULT_CACHE_CLEANUP_INTERVAL_MS: u64 = 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Http,
    Stdio,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Http => write!(f, "http"),
            TransportKind::Stdio => write!(f, "stdio"),
        }
    }
}

/// Per-tool resource limits. Rate and peak memory are reported through
/// get_server_info; the timeout is enforced at dispatch.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ToolLimits {
    pub rate: Option<String>,
    pub timeout_ms: Option<u64>,
    pub max_memory_bytes: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ToolLimitsConfig {
    #[serde(default)]
    pub analyze_file: ToolLimits,
    #[serde(default)]
    pub build_navigation_map: ToolLimits,
    #[serde(default)]
    pub query_data: ToolLimits,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub transport: TransportKind,
    pub http_bind_address: SocketAddr,
    pub max_file_size_bytes: u64,
    pub max_concurrent_requests: usize,
    pub request_timeout: Option<Duration>,
    pub shutdown_grace: Duration,
    pub cache_max_memory_bytes: u64,
    pub cache_cleanup_interval: Duration,
    pub tool_limits: ToolLimitsConfig,
}

impl ServerConfig {
    pub fn from_args(args: CliArgs) -> Result<Self> {
        let CliArgs {
            stdio,
            config,
            http_bind: cli_http_bind,
            max_file_size_bytes: cli_max_file_size,
            max_concurrent_requests: cli_max_concurrent,
            request_timeout_ms: cli_request_timeout_ms,
            cache_memory_bytes: cli_cache_memory,
        } = args;

        let file_config = if let Some(path) = config.as_ref() {
            load_config_file(path)?
        } else {
            PartialConfig::default()
        };

        let PartialConfig {
            http_bind: file_http_bind,
            max_file_size_bytes: file_max_file_size,
            max_concurrent_requests: file_max_concurrent,
            request_timeout_ms: file_request_timeout_ms,
            shutdown_grace_ms: file_shutdown_grace_ms,
            cache_memory_bytes: file_cache_memory,
            cache_cleanup_interval_ms: file_cleanup_interval_ms,
            limits: file_limits,
        } = file_config;

        let transport = if stdio {
            TransportKind::Stdio
        } else {
            TransportKind::Http
        };

        let http_bind_address = cli_http_bind.or(file_http_bind).unwrap_or_else(|| {
            DEFAULT_HTTP_BIND
                .parse()
                .expect("default bind address valid")
        });

        let max_file_size_bytes = cli_max_file_size
            .or(file_max_file_size)
            .unwrap_or(DEFAULT_MAX_FILE_SIZE_BYTES);

        let max_concurrent_requests = cli_max_concurrent
            .or(file_max_concurrent)
            .unwrap_or(DEFAULT_MAX_CONCURRENT_REQUESTS)
            .max(1);

        let request_timeout_ms = cli_request_timeout_ms
            .or(file_request_timeout_ms)
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS);
        let request_timeout = if request_timeout_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(request_timeout_ms))
        };

        let shutdown_grace = Duration::from_millis(
            file_shutdown_grace_ms.unwrap_or(DEFAULT_SHUTDOWN_GRACE_MS),
        );

        let cache_max_memory_bytes = cli_cache_memory
            .or(file_cache_memory)
            .unwrap_or(DEFAULT_CACHE_MEMORY_BYTES)
            .max(1);

        let cache_cleanup_interval = Duration::from_millis(
            file_cleanup_interval_ms
                .unwrap_or(DEFAULT_CACHE_CLEANUP_INTERVAL_MS)
                .max(1_000),
        );

        Ok(Self {
            transport,
            http_bind_address,
            max_file_size_bytes,
            max_concurrent_requests,
            request_timeout,
            shutdown_grace,
            cache_max_memory_bytes,
            cache_cleanup_interval,
            tool_limits: file_limits.unwrap_or_default(),
        })
    }

    /// Effective timeout for a tool: its own limit when set, the request
    /// timeout otherwise. Zero disables.
    pub fn tool_timeout(&self, tool: &str) -> Option<Duration> {
        let tool_ms = match tool {
            "analyze_file" => self.tool_limits.analyze_file.timeout_ms,
            "build_navigation_map" => self.tool_limits.build_navigation_map.timeout_ms,
            "query_data" => self.tool_limits.query_data.timeout_ms,
            _ => None,
        };
        match tool_ms {
            Some(0) => None,
            Some(ms) => Some(Duration::from_millis(ms)),
            None => self.request_timeout,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_args(CliArgs::default()).expect("defaults valid")
    }
}

#[derive(Parser, Debug, Default, Clone)]
#[command(
    name = "workbook-mcp",
    about = "Token-aware analysis server for large spreadsheet workbooks",
    version
)]
pub struct CliArgs {
    #[arg(
        long,
        help = "Run on the line-delimited stdio transport (logs go to stderr only)"
    )]
    pub stdio: bool,

    #[arg(
        long,
        value_name = "FILE",
        help = "Path to a configuration file (YAML or JSON)"
    )]
    pub config: Option<PathBuf>,

    #[arg(
        long,
        env = "WORKBOOK_MCP_HTTP_BIND",
        value_name = "ADDR",
        help = "HTTP bind address when not running in stdio mode"
    )]
    pub http_bind: Option<SocketAddr>,

    #[arg(
        long,
        env = "WORKBOOK_MCP_MAX_FILE_SIZE_BYTES",
        value_name = "BYTES",
        help = "Largest workbook the server will open"
    )]
    pub max_file_size_bytes: Option<u64>,

    #[arg(
        long,
        env = "WORKBOOK_MCP_MAX_CONCURRENT_REQUESTS",
        value_name = "N",
        help = "Maximum in-flight tool calls"
    )]
    pub max_concurrent_requests: Option<usize>,

    #[arg(
        long,
        env = "WORKBOOK_MCP_REQUEST_TIMEOUT_MS",
        value_name = "MS",
        help = "Per-request timeout in milliseconds (0 disables)"
    )]
    pub request_timeout_ms: Option<u64>,

    #[arg(
        long,
        env = "WORKBOOK_MCP_CACHE_MEMORY_BYTES",
        value_name = "BYTES",
        help = "Smart cache memory budget in bytes"
    )]
    pub cache_memory_bytes: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct PartialConfig {
    http_bind: Option<SocketAddr>,
    max_file_size_bytes: Option<u64>,
    max_concurrent_requests: Option<usize>,
    request_timeout_ms: Option<u64>,
    shutdown_grace_ms: Option<u64>,
    cache_memory_bytes: Option<u64>,
    cache_cleanup_interval_ms: Option<u64>,
    limits: Option<ToolLimitsConfig>,
}

fn load_config_file(path: &Path) -> Result<PartialConfig> {
    if !path.exists() {
        anyhow::bail!("config file {:?} does not exist", path);
    }
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {:?}", path))?;
    let ext = path
        .extension()
        .and_then(|os| os.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let parsed = match ext.as_str() {
        "yaml" | "yml" => serde_yaml::from_str(&contents)
            .with_context(|| format!("failed to parse YAML config {:?}", path))?,
        "json" => serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse JSON config {:?}", path))?,
        other => anyhow::bail!("unsupported config extension: {other}"),
    };
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_select_http_transport() {
        let config = ServerConfig::default();
        assert_eq!(config.transport, TransportKind::Http);
        assert_eq!(config.max_concurrent_requests, 10);
        assert_eq!(config.cache_max_memory_bytes, 100 * 1024 * 1024);
        assert!(config.request_timeout.is_some());
    }

    #[test]
    fn stdio_flag_selects_stdio_transport() {
        let config = ServerConfig::from_args(CliArgs {
            stdio: true,
            ..CliArgs::default()
        })
        .unwrap();
        assert_eq!(config.transport, TransportKind::Stdio);
    }

    #[test]
    fn config_file_fills_gaps_and_cli_wins() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.yaml");
        fs::write(
            &path,
            "http_bind: 127.0.0.1:4100\nmax_concurrent_requests: 4\nlimits:\n  query_data:\n    timeout_ms: 5000\n",
        )
        .unwrap();

        let config = ServerConfig::from_args(CliArgs {
            config: Some(path),
            max_concurrent_requests: Some(7),
            ..CliArgs::default()
        })
        .unwrap();

        assert_eq!(config.http_bind_address.port(), 4100);
        assert_eq!(config.max_concurrent_requests, 7);
        assert_eq!(
            config.tool_timeout("query_data"),
            Some(Duration::from_millis(5000))
        );
        // Tools without a dedicated limit fall back to the request timeout.
        assert_eq!(
            config.tool_timeout("analyze_file"),
            Some(Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS))
        );
    }

    #[test]
    fn zero_timeout_disables() {
        let config = ServerConfig::from_args(CliArgs {
            request_timeout_ms: Some(0),
            ..CliArgs::default()
        })
        .unwrap();
        assert_eq!(config.request_timeout, None);
        assert_eq!(config.tool_timeout("query_data"), None);
    }
}
