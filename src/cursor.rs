use anyhow::Result;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE;
use chrono::Utc;

use crate::errors::ServerError;
use crate::model::{CURSOR_VERSION, CursorData, Window};

/// Cursors older than this are rejected.
const MAX_AGE_SECS: i64 = 24 * 60 * 60;

/// Stateless codec for opaque pagination handles. Every encoded cursor is
/// stamped with the process cursor version and the current time; decoding
/// re-validates both.
#[derive(Debug, Clone, Copy, Default)]
pub struct CursorCodec;

impl CursorCodec {
    pub fn new() -> Self {
        Self
    }

    pub fn encode(&self, mut data: CursorData) -> String {
        data.version = CURSOR_VERSION;
        data.timestamp = Utc::now().timestamp();
        let json = serde_json::to_vec(&data).expect("cursor payload serializes");
        URL_SAFE.encode(json)
    }

    pub fn decode(&self, cursor: &str) -> Result<CursorData> {
        if cursor.is_empty() {
            return Err(ServerError::CursorInvalid("empty cursor".into()).into());
        }

        let raw = URL_SAFE
            .decode(cursor)
            .map_err(|e| ServerError::CursorInvalid(format!("malformed base64: {e}")))?;
        let data: CursorData = serde_json::from_slice(&raw)
            .map_err(|e| ServerError::CursorInvalid(format!("malformed payload: {e}")))?;

        if data.version != CURSOR_VERSION {
            return Err(ServerError::CursorVersionMismatch {
                expected: CURSOR_VERSION,
                got: data.version,
            }
            .into());
        }

        if Utc::now().timestamp() - data.timestamp > MAX_AGE_SECS {
            return Err(ServerError::CursorExpired.into());
        }

        Ok(data)
    }

    /// Fail when the cursor was minted against a different workbook version.
    pub fn validate_checksum(&self, cursor: &str, expected: &str) -> Result<CursorData> {
        let data = self.decode(cursor)?;
        if data.checksum != expected {
            return Err(ServerError::CursorChecksumMismatch {
                cursor: data.checksum,
                current: expected.to_string(),
            }
            .into());
        }
        Ok(data)
    }

    pub fn chunk_cursor(
        &self,
        chunk_id: &str,
        offset: u64,
        checksum: &str,
        window: Option<Window>,
    ) -> String {
        self.encode(CursorData {
            chunk_id: chunk_id.to_string(),
            offset,
            version: CURSOR_VERSION,
            checksum: checksum.to_string(),
            timestamp: 0,
            window,
        })
    }

    pub fn navigation_cursor(&self, chunk_id: &str, sheet_offset: u64, checksum: &str) -> String {
        self.chunk_cursor(chunk_id, sheet_offset, checksum, None)
    }

    /// Query continuations reuse the chunk_id slot for the query string.
    pub fn query_cursor(
        &self,
        query: &str,
        offset: u64,
        checksum: &str,
        window: Option<Window>,
    ) -> String {
        self.chunk_cursor(query, offset, checksum, window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trips() {
        let codec = CursorCodec::new();
        let cursor = codec.chunk_cursor(
            "chunk_50_99",
            50,
            "abc123",
            Some(Window {
                start_row: 0,
                end_row: 100,
                start_col: 0,
                end_col: 26,
            }),
        );

        let data = codec.decode(&cursor).unwrap();
        assert_eq!(data.chunk_id, "chunk_50_99");
        assert_eq!(data.offset, 50);
        assert_eq!(data.checksum, "abc123");
        assert_eq!(data.version, CURSOR_VERSION);
        assert_eq!(data.window.unwrap().end_col, 26);
    }

    #[test]
    fn malformed_cursors_fail_typed() {
        let codec = CursorCodec::new();

        let err = codec.decode("not//base64!!").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ServerError>(),
            Some(ServerError::CursorInvalid(_))
        ));

        let garbage = URL_SAFE.encode(b"{\"not\": \"a cursor\"}");
        let err = codec.decode(&garbage).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ServerError>(),
            Some(ServerError::CursorInvalid(_))
        ));
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let codec = CursorCodec::new();
        let mut data = CursorData {
            chunk_id: "chunk_0_49".into(),
            offset: 0,
            version: CURSOR_VERSION,
            checksum: "abc".into(),
            timestamp: 0,
            window: None,
        };
        let cursor = codec.encode(data.clone());

        // Re-encode by hand with a bumped version.
        data.version = CURSOR_VERSION + 1;
        data.timestamp = Utc::now().timestamp();
        let forged = URL_SAFE.encode(serde_json::to_vec(&data).unwrap());

        assert!(codec.decode(&cursor).is_ok());
        let err = codec.decode(&forged).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ServerError>(),
            Some(ServerError::CursorVersionMismatch { .. })
        ));
    }

    #[test]
    fn stale_cursors_expire() {
        let codec = CursorCodec::new();
        let data = CursorData {
            chunk_id: "chunk_0_49".into(),
            offset: 0,
            version: CURSOR_VERSION,
            checksum: "abc".into(),
            timestamp: Utc::now().timestamp() - MAX_AGE_SECS - 60,
            window: None,
        };
        let stale = URL_SAFE.encode(serde_json::to_vec(&data).unwrap());

        let err = codec.decode(&stale).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ServerError>(),
            Some(ServerError::CursorExpired)
        ));
    }

    #[test]
    fn checksum_validation_binds_workbook_version() {
        let codec = CursorCodec::new();
        let cursor = codec.navigation_cursor("chunk_0_49", 0, "v1");

        assert!(codec.validate_checksum(&cursor, "v1").is_ok());
        let err = codec.validate_checksum(&cursor, "v2").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ServerError>(),
            Some(ServerError::CursorChecksumMismatch { .. })
        ));
    }
}
