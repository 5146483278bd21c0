use anyhow::{Context, Result};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde_json::Value;
use std::io::{Read, Write};
use std::sync::Arc;

use crate::errors::ServerError;
use crate::token::TokenCounter;

/// Mid-quality tier for responses approaching the budget.
const BROTLI_MEDIUM_QUALITY: u32 = 4;
/// Maximum quality tier, paired with truncation.
const BROTLI_MAX_QUALITY: u32 = 11;
const BROTLI_LGWIN: u32 = 22;

/// Fields kept first when a mapping has to be cut down.
const PRIORITY_FIELDS: &[&str] = &["metadata", "summary", "index", "pagination"];

/// Token-aware response shaping: serialize, pick a compression tier from
/// the budget ratio, truncate structurally when even maximum compression
/// cannot fit.
pub struct CompressionManager {
    counter: Arc<TokenCounter>,
}

impl CompressionManager {
    pub fn new(counter: Arc<TokenCounter>) -> Self {
        Self { counter }
    }

    /// Returns the encoded body and the method tag that produced it.
    /// `limit` is the model's safe buffer in tokens.
    pub fn optimize(&self, value: &Value, limit: usize) -> Result<(Vec<u8>, String)> {
        let tokens = self.counter.count(value)?;
        let ratio = tokens as f64 / limit as f64;

        if ratio < 0.5 {
            let body = serde_json::to_vec(value).context("serialize response")?;
            return Ok((body, "none".to_string()));
        }

        if ratio < 0.7 {
            return Ok((self.gzip(value)?, "light".to_string()));
        }

        if ratio < 0.9 {
            return Ok((
                self.brotli(value, BROTLI_MEDIUM_QUALITY)?,
                "medium".to_string(),
            ));
        }

        let target = (limit as f64 * 0.7) as usize;
        let truncated = self.truncate(value, target);
        Ok((
            self.brotli(&truncated, BROTLI_MAX_QUALITY)?,
            "aggressive-truncated".to_string(),
        ))
    }

    pub fn decompress(&self, data: &[u8], method: &str) -> Result<Vec<u8>> {
        match method {
            "none" => Ok(data.to_vec()),
            "light" | "gzip" => {
                let mut decoder = GzDecoder::new(data);
                let mut out = Vec::new();
                decoder
                    .read_to_end(&mut out)
                    .map_err(|e| ServerError::Decompression(format!("gzip: {e}")))?;
                Ok(out)
            }
            "medium" | "aggressive" | "aggressive-truncated" => {
                let mut decoder = brotli::Decompressor::new(data, 4096);
                let mut out = Vec::new();
                decoder
                    .read_to_end(&mut out)
                    .map_err(|e| ServerError::Decompression(format!("brotli: {e}")))?;
                Ok(out)
            }
            other => {
                Err(ServerError::Decompression(format!("unknown method: {other}")).into())
            }
        }
    }

    fn gzip(&self, value: &Value) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(value).context("serialize response")?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&json)
            .map_err(|e| ServerError::Compression(format!("gzip: {e}")))?;
        encoder
            .finish()
            .map_err(|e| ServerError::Compression(format!("gzip: {e}")).into())
    }

    fn brotli(&self, value: &Value, quality: u32) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(value).context("serialize response")?;
        let mut out = Vec::new();
        {
            let mut writer =
                brotli::CompressorWriter::new(&mut out, 4096, quality, BROTLI_LGWIN);
            writer
                .write_all(&json)
                .map_err(|e| ServerError::Compression(format!("brotli: {e}")))?;
            writer
                .flush()
                .map_err(|e| ServerError::Compression(format!("brotli: {e}")))?;
        }
        Ok(out)
    }

    /// Structure-aware recursive truncation to a token budget.
    pub fn truncate(&self, value: &Value, target_tokens: usize) -> Value {
        match value {
            Value::Object(map) => self.truncate_map(map, target_tokens),
            Value::Array(items) => self.truncate_list(items, target_tokens),
            Value::String(text) => Value::String(self.truncate_string(text, target_tokens)),
            other => other.clone(),
        }
    }

    fn truncate_map(
        &self,
        map: &serde_json::Map<String, Value>,
        target_tokens: usize,
    ) -> Value {
        let mut result = serde_json::Map::new();
        let mut used = 0usize;
        let mut exhausted = false;

        let priority = PRIORITY_FIELDS
            .iter()
            .copied()
            .filter(|field| map.contains_key(*field));
        let rest = map
            .keys()
            .map(String::as_str)
            .filter(|key| !PRIORITY_FIELDS.contains(key));

        for key in priority.chain(rest) {
            if exhausted {
                break;
            }
            let Some(field) = map.get(key) else { continue };
            let field_tokens = self.counter.count(field).unwrap_or(usize::MAX);

            if used + field_tokens <= target_tokens {
                result.insert(key.to_string(), field.clone());
                used += field_tokens;
            } else {
                // The boundary field gets whatever budget remains.
                let remaining = target_tokens.saturating_sub(used);
                let cut = self.truncate(field, remaining);
                let cut_tokens = self.counter.count(&cut).unwrap_or(0);
                if cut_tokens > 0 && cut_tokens <= remaining {
                    result.insert(key.to_string(), cut);
                    used += cut_tokens;
                }
                exhausted = true;
            }
        }

        let included = result.len();
        result.insert("_truncated".to_string(), Value::Bool(true));
        result.insert("_original_size".to_string(), Value::from(map.len()));
        result.insert("_included_fields".to_string(), Value::from(included));
        Value::Object(result)
    }

    fn truncate_list(&self, items: &[Value], target_tokens: usize) -> Value {
        let mut result = Vec::new();
        let mut used = 0usize;

        for (i, item) in items.iter().enumerate() {
            let item_tokens = self.counter.count(item).unwrap_or(usize::MAX);
            if used + item_tokens <= target_tokens {
                result.push(item.clone());
                used += item_tokens;
                continue;
            }

            let remaining = target_tokens.saturating_sub(used);
            let cut = self.truncate(item, remaining);
            let cut_tokens = self.counter.count(&cut).unwrap_or(0);
            if cut_tokens > 0 && cut_tokens <= remaining {
                result.push(cut);
            }

            if i < items.len() - 1 {
                result.push(serde_json::json!({
                    "_truncated_items": items.len() - i - 1,
                    "_total_items": items.len(),
                }));
            }
            break;
        }

        Value::Array(result)
    }

    fn truncate_string(&self, text: &str, target_tokens: usize) -> String {
        let tokens = self.counter.count_string(text);
        if tokens <= target_tokens {
            return text.to_string();
        }

        // Roughly four characters per token.
        let target_len = target_tokens.saturating_mul(4);
        if target_len >= text.len() {
            return text.to_string();
        }

        let mut boundary = target_len.min(text.len());
        while !text.is_char_boundary(boundary) {
            boundary -= 1;
        }
        let mut cut = &text[..boundary];

        // Prefer a word boundary in the latter half of the prefix.
        if let Some(last_space) = cut.rfind(' ')
            && last_space > target_len / 2
        {
            cut = &cut[..last_space];
        }

        format!("{cut}... [truncated]")
    }
}
