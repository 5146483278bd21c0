use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::future::Future;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Semaphore;

use crate::errors::{CODE_PARSE_ERROR, ServerError, to_rpc_error};
use crate::state::AppState;
use crate::tools;

pub const PROTOCOL_VERSION: &str = "2024-11-05";
pub const SERVER_NAME: &str = "workbook-mcp";
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub id: Value,
}

#[derive(Debug, Serialize)]
pub struct RpcResponse {
    pub jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    pub id: Value,
}

#[derive(Debug, Serialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl RpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn failure(id: Value, code: i64, message: String) -> Self {
        Self {
            jsonrpc: "2.0",
            result: None,
            error: Some(RpcError { code, message }),
            id,
        }
    }
}

/// Closed method table over the tool set plus the handshake methods.
pub struct AnalysisServer {
    state: Arc<AppState>,
    semaphore: Arc<Semaphore>,
}

impl AnalysisServer {
    pub fn new(state: Arc<AppState>) -> Self {
        let max_concurrent = state.config().max_concurrent_requests;
        Self {
            state,
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
        }
    }

    pub fn state(&self) -> Arc<AppState> {
        self.state.clone()
    }

    /// One request in, one response out. Faults never escape as panics.
    pub async fn handle_request(&self, request: RpcRequest) -> RpcResponse {
        tracing::info!(method = %request.method, "handling request");

        match self.route(&request.method, request.params).await {
            Ok(result) => RpcResponse::success(request.id, result),
            Err(error) => {
                let (code, message) = to_rpc_error(&error);
                tracing::error!(code, error = %message, "request failed");
                RpcResponse::failure(request.id, code, message)
            }
        }
    }

    /// Parse one line of input and produce one line of output.
    pub async fn handle_line(&self, line: &str) -> RpcResponse {
        match serde_json::from_str::<RpcRequest>(line) {
            Ok(request) => self.handle_request(request).await,
            Err(error) => RpcResponse::failure(
                Value::Null,
                CODE_PARSE_ERROR,
                format!("parse error: {error}"),
            ),
        }
    }

    async fn route(&self, method: &str, params: Value) -> Result<Value> {
        match method {
            "initialize" => Ok(self.initialize()),
            "list_tools" => Ok(list_tools()),
            "get_server_info" => Ok(self.server_info()),
            "analyze_file" => {
                let params = parse_params(params)?;
                self.run_tool("analyze_file", tools::analyze_file(self.state(), params))
                    .await
            }
            "build_navigation_map" => {
                let params = parse_params(params)?;
                self.run_tool(
                    "build_navigation_map",
                    tools::build_navigation_map(self.state(), params),
                )
                .await
            }
            "query_data" => {
                let params = parse_params(params)?;
                self.run_tool("query_data", tools::query_data(self.state(), params))
                    .await
            }
            other => Err(ServerError::MethodNotFound(other.to_string()).into()),
        }
    }

    /// Bound concurrency, enforce the tool deadline, and convert panics
    /// into internal errors instead of dropping the request.
    async fn run_tool<F, T>(&self, tool: &'static str, fut: F) -> Result<Value>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Serialize + Send + 'static,
    {
        let _permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ServerError::Internal("server shutting down".to_string()))?;

        let timeout = self.state.config().tool_timeout(tool);
        let mut task = tokio::spawn(fut);

        let joined = match timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut task).await {
                Ok(joined) => joined,
                Err(_) => {
                    task.abort();
                    tracing::warn!(tool, timeout_ms = limit.as_millis() as u64, "tool timed out");
                    return Err(ServerError::DeadlineExceeded(limit.as_millis() as u64).into());
                }
            },
            None => (&mut task).await,
        };

        let result = match joined {
            Ok(result) => result?,
            Err(join_error) if join_error.is_panic() => {
                return Err(ServerError::Internal(format!("tool '{tool}' panicked")).into());
            }
            Err(join_error) => {
                return Err(ServerError::Internal(join_error.to_string()).into());
            }
        };

        Ok(serde_json::to_value(result)?)
    }

    fn initialize(&self) -> Value {
        json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": { "tools": {} },
            "serverInfo": {
                "name": SERVER_NAME,
                "version": SERVER_VERSION,
            },
        })
    }

    fn server_info(&self) -> Value {
        let config = self.state.config();
        json!({
            "name": SERVER_NAME,
            "version": SERVER_VERSION,
            "capabilities": {
                "streaming": true,
                "chunking": true,
                "token_aware": true,
                "compression": true,
                "caching": true,
                "indexing": true,
                "max_file_size": config.max_file_size_bytes,
            },
            "limits": {
                "max_concurrent_requests": config.max_concurrent_requests,
                "request_timeout": config
                    .request_timeout
                    .map(|t| format!("{}ms", t.as_millis()))
                    .unwrap_or_else(|| "none".to_string()),
            },
        })
    }

    /// Line-delimited transport: one JSON object per line on stdin and
    /// stdout, diagnostics on stderr only.
    pub async fn run_stdio(self: Arc<Self>) -> Result<()> {
        let stdin = BufReader::new(tokio::io::stdin());
        let mut stdout = tokio::io::stdout();
        let mut lines = stdin.lines();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }

            let response = self.handle_line(&line).await;
            let mut payload = serde_json::to_vec(&response)?;
            payload.push(b'\n');
            stdout.write_all(&payload).await?;
            stdout.flush().await?;
        }

        Ok(())
    }
}

fn parse_params<T: DeserializeOwned>(params: Value) -> Result<T> {
    serde_json::from_value(params).map_err(|e| ServerError::InvalidParams(e.to_string()).into())
}

pub fn list_tools() -> Value {
    json!({
        "tools": [
            {
                "name": "analyze_file",
                "description": "Analyze workbook metadata and structure with automatic chunking",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "filepath": {
                            "type": "string",
                            "description": "Path to the workbook file",
                        },
                        "chunk_size": {
                            "type": "integer",
                            "description": "Number of sheets per chunk (default: 50)",
                            "default": 50,
                        },
                        "stream_mode": {
                            "type": "boolean",
                            "description": "Enable streaming for large files (forced for >=100MB)",
                        },
                    },
                    "required": ["filepath"],
                },
            },
            {
                "name": "build_navigation_map",
                "description": "Build a navigable index with pagination and streaming",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "filepath": {
                            "type": "string",
                            "description": "Path to the workbook file",
                        },
                        "checksum": {
                            "type": "string",
                            "description": "File checksum for validation",
                        },
                        "chunk_cursor": {
                            "type": "string",
                            "description": "Base64 encoded cursor for pagination",
                        },
                        "window_size": {
                            "type": "integer",
                            "description": "Maximum sheets per call (default: 1000)",
                            "default": 1000,
                        },
                    },
                    "required": ["filepath", "checksum"],
                },
            },
            {
                "name": "query_data",
                "description": "Query multi-sheet data with windowing and streaming",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "query": {
                            "type": "string",
                            "description": "Search query",
                        },
                        "navigation_index": {
                            "type": "object",
                            "description": "Navigation index from build_navigation_map",
                        },
                        "filepath": {
                            "type": "string",
                            "description": "Workbook path for row-level scanning",
                        },
                        "checksum": {
                            "type": "string",
                            "description": "Workbook checksum binding the query to an index version",
                        },
                        "window_config": {
                            "type": "object",
                            "properties": {
                                "max_rows_per_sheet": { "type": "integer", "default": 1000 },
                                "max_sheets_per_call": { "type": "integer", "default": 10 },
                                "max_results": { "type": "integer", "default": 100 },
                            },
                        },
                    },
                    "required": ["query", "navigation_index"],
                },
            },
        ],
    })
}
