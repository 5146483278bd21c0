use thiserror::Error;

/// JSON-RPC error codes for the standard envelope faults.
pub const CODE_PARSE_ERROR: i64 = -32700;
pub const CODE_METHOD_NOT_FOUND: i64 = -32601;
pub const CODE_INVALID_PARAMS: i64 = -32602;
pub const CODE_INTERNAL_ERROR: i64 = -32603;
/// Server-defined faults (cursor, token, compression, cache) live in the
/// implementation-defined range.
pub const CODE_SERVER_ERROR: i64 = -32000;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("unknown method: {0}")]
    MethodNotFound(String),

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("request cancelled")]
    Cancelled,

    #[error("deadline exceeded after {0}ms")]
    DeadlineExceeded(u64),

    #[error("workbook io error: {0}")]
    Io(String),

    #[error("invalid cursor: {0}")]
    CursorInvalid(String),

    #[error("cursor expired")]
    CursorExpired,

    #[error("cursor version mismatch: expected {expected}, got {got}")]
    CursorVersionMismatch { expected: u32, got: u32 },

    #[error("cursor checksum mismatch: cursor {cursor} != current {current}")]
    CursorChecksumMismatch { cursor: String, current: String },

    #[error("token count {count} exceeds safe buffer {limit} for model {model}")]
    TokenLimitExceeded {
        count: usize,
        limit: usize,
        model: String,
    },

    #[error("compression failed: {0}")]
    Compression(String),

    #[error("decompression failed: {0}")]
    Decompression(String),

    #[error("cache memory exhausted: could not free {needed} bytes")]
    CacheMemoryExhausted { needed: u64 },
}

impl ServerError {
    pub fn json_rpc_code(&self) -> i64 {
        match self {
            ServerError::Parse(_) => CODE_PARSE_ERROR,
            ServerError::MethodNotFound(_) => CODE_METHOD_NOT_FOUND,
            ServerError::InvalidParams(_) => CODE_INVALID_PARAMS,
            ServerError::Internal(_) => CODE_INTERNAL_ERROR,
            _ => CODE_SERVER_ERROR,
        }
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        ServerError::InvalidParams(message.into())
    }
}

impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        ServerError::Io(err.to_string())
    }
}

/// Map any error chain onto a JSON-RPC (code, message) pair. Typed faults
/// keep their code; everything else is an internal error.
pub fn to_rpc_error(error: &anyhow::Error) -> (i64, String) {
    match error.downcast_ref::<ServerError>() {
        Some(typed) => (typed.json_rpc_code(), typed.to_string()),
        None => (CODE_INTERNAL_ERROR, error.to_string()),
    }
}
