use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use tiktoken_rs::CoreBPE;

use crate::errors::ServerError;

/// Memoized counts are dropped wholesale once the table grows past this.
const COUNT_CACHE_CAP: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelProfile {
    pub context: usize,
    pub safe_buffer: usize,
    pub output_max: usize,
}

const STANDARD: ModelProfile = ModelProfile {
    context: 200_000,
    safe_buffer: 180_000,
    output_max: 64_000,
};

const EXTENDED: ModelProfile = ModelProfile {
    context: 1_000_000,
    safe_buffer: 950_000,
    output_max: 64_000,
};

const PRECISE: ModelProfile = ModelProfile {
    context: 200_000,
    safe_buffer: 180_000,
    output_max: 32_000,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionStrategy {
    None,
    Light,
    Medium,
    Aggressive,
}

impl CompressionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionStrategy::None => "none",
            CompressionStrategy::Light => "light",
            CompressionStrategy::Medium => "medium",
            CompressionStrategy::Aggressive => "aggressive",
        }
    }

    /// Planning-only estimate of tokens surviving this strategy.
    pub fn estimated_ratio(&self) -> f64 {
        match self {
            CompressionStrategy::None => 1.0,
            CompressionStrategy::Light => 0.70,
            CompressionStrategy::Medium => 0.60,
            CompressionStrategy::Aggressive => 0.50,
        }
    }
}

pub struct TokenCounter {
    encoder: CoreBPE,
    cache: Mutex<HashMap<u64, usize>>,
}

impl TokenCounter {
    pub fn new() -> Result<Self> {
        let encoder = tiktoken_rs::cl100k_base().context("failed to load cl100k_base encoder")?;
        Ok(Self {
            encoder,
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// Token count of a value's canonical JSON form.
    pub fn count<T: Serialize>(&self, value: &T) -> Result<usize> {
        let json = serde_json::to_string(value).context("failed to serialize value for counting")?;
        Ok(self.count_cached(&json))
    }

    pub fn count_string(&self, text: &str) -> usize {
        self.count_cached(text)
    }

    fn count_cached(&self, text: &str) -> usize {
        let key = fingerprint(text);
        if let Some(count) = self.cache.lock().get(&key) {
            return *count;
        }

        let count = self.encoder.encode_ordinary(text).len();

        let mut cache = self.cache.lock();
        if cache.len() >= COUNT_CACHE_CAP {
            cache.clear();
        }
        cache.insert(key, count);
        count
    }

    pub fn limits(&self, model: &str) -> ModelProfile {
        match model {
            "extended" => EXTENDED,
            "precise" => PRECISE,
            _ => STANDARD,
        }
    }

    /// Strategy selection by `tokens / safe_buffer`; boundary ratios pick the
    /// higher-compression tier.
    pub fn strategy(&self, tokens: usize, model: &str) -> CompressionStrategy {
        let limits = self.limits(model);
        let ratio = tokens as f64 / limits.safe_buffer as f64;
        if ratio < 0.5 {
            CompressionStrategy::None
        } else if ratio < 0.7 {
            CompressionStrategy::Light
        } else if ratio < 0.9 {
            CompressionStrategy::Medium
        } else {
            CompressionStrategy::Aggressive
        }
    }

    pub fn estimate_compressed<T: Serialize>(
        &self,
        value: &T,
        strategy: CompressionStrategy,
    ) -> Result<usize> {
        let base = self.count(value)?;
        Ok((base as f64 * strategy.estimated_ratio()) as usize)
    }

    pub fn optimal_chunk(&self, model: &str, utilization: f64) -> usize {
        let limits = self.limits(model);
        (limits.safe_buffer as f64 * utilization) as usize
    }

    /// Whether the value overflows one safe buffer, and how many chunks the
    /// overflow needs.
    pub fn needs_chunking<T: Serialize>(&self, value: &T, model: &str) -> Result<(bool, usize)> {
        let count = self.count(value)?;
        let limits = self.limits(model);
        if count <= limits.safe_buffer {
            return Ok((false, 1));
        }
        Ok((true, count.div_ceil(limits.safe_buffer)))
    }

    pub fn validate_limit<T: Serialize>(&self, value: &T, model: &str) -> Result<()> {
        let count = self.count(value)?;
        let limits = self.limits(model);
        if count > limits.safe_buffer {
            return Err(ServerError::TokenLimitExceeded {
                count,
                limit: limits.safe_buffer,
                model: model.to_string(),
            }
            .into());
        }
        Ok(())
    }

    pub fn batch_count<T: Serialize>(&self, items: &[T]) -> Result<Vec<usize>> {
        items.iter().map(|item| self.count(item)).collect()
    }

    /// Drop the memoization table.
    pub fn clean(&self) {
        self.cache.lock().clear();
    }
}

fn fingerprint(text: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn counter() -> TokenCounter {
        TokenCounter::new().expect("encoder")
    }

    #[test]
    fn unknown_model_falls_back_to_standard() {
        let tc = counter();
        assert_eq!(tc.limits("no-such-model"), STANDARD);
        assert_eq!(tc.limits("extended").context, 1_000_000);
        assert_eq!(tc.limits("precise").output_max, 32_000);
    }

    #[test]
    fn strategy_thresholds_choose_higher_tier_at_boundaries() {
        let tc = counter();
        let buffer = STANDARD.safe_buffer;
        assert_eq!(tc.strategy(buffer / 2 - 1, "standard"), CompressionStrategy::None);
        assert_eq!(tc.strategy(buffer / 2, "standard"), CompressionStrategy::Light);
        assert_eq!(
            tc.strategy((buffer as f64 * 0.7) as usize, "standard"),
            CompressionStrategy::Medium
        );
        assert_eq!(
            tc.strategy((buffer as f64 * 0.9) as usize, "standard"),
            CompressionStrategy::Aggressive
        );
    }

    #[test]
    fn counting_is_stable_and_cached() {
        let tc = counter();
        let value = json!({"rows": [1, 2, 3], "name": "quarterly totals"});
        let first = tc.count(&value).unwrap();
        let second = tc.count(&value).unwrap();
        assert_eq!(first, second);
        assert!(first > 0);

        tc.clean();
        assert_eq!(tc.count(&value).unwrap(), first);
    }

    #[test]
    fn chunking_math_matches_safe_buffer() {
        let tc = counter();
        let small = json!({"a": 1});
        let (needed, chunks) = tc.needs_chunking(&small, "standard").unwrap();
        assert!(!needed);
        assert_eq!(chunks, 1);

        assert_eq!(tc.optimal_chunk("standard", 0.8), 144_000);
    }

    #[test]
    fn validate_limit_raises_typed_error() {
        let tc = counter();
        let big = "x ".repeat(400_000);
        let err = tc.validate_limit(&big, "standard").unwrap_err();
        let server_err = err.downcast_ref::<ServerError>().expect("typed");
        assert!(matches!(server_err, ServerError::TokenLimitExceeded { .. }));
    }
}
