use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Upper bound on tracked entries, independent of the memory budget.
const ENTRY_CAPACITY: usize = 4096;

const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);
const HOT_TTL: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone)]
pub struct EvictionPolicy {
    /// First pass drops entries colder than this (access_count < 2).
    pub cold_idle: Duration,
    /// Second pass drops anything idle past this, regardless of access count.
    pub aged_idle: Duration,
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        Self {
            cold_idle: Duration::from_secs(5 * 60),
            aged_idle: Duration::from_secs(15 * 60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub value: serde_json::Value,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub hot_promotions: u64,
}

#[derive(Debug)]
struct HotEntry {
    access_count: u64,
    last_access: Instant,
    ttl: Duration,
    size: u64,
}

struct CacheInner {
    lru: LruCache<String, CacheEntry>,
    hot: HashMap<String, HotEntry>,
    current_memory: u64,
    stats: CacheStats,
}

/// LRU cache with hot-entry TTL extension and strict memory accounting.
/// All bookkeeping (recency, hot counters, memory) moves under one lock so
/// the eviction scan never sees a torn snapshot.
pub struct SmartCache {
    inner: Mutex<CacheInner>,
    max_memory: u64,
    policy: EvictionPolicy,
}

impl SmartCache {
    pub fn new(max_memory_bytes: u64) -> Self {
        Self::with_policy(max_memory_bytes, EvictionPolicy::default())
    }

    pub fn with_policy(max_memory_bytes: u64, policy: EvictionPolicy) -> Self {
        let capacity = NonZeroUsize::new(ENTRY_CAPACITY).expect("nonzero capacity");
        Self {
            inner: Mutex::new(CacheInner {
                lru: LruCache::new(capacity),
                hot: HashMap::new(),
                current_memory: 0,
                stats: CacheStats::default(),
            }),
            max_memory: max_memory_bytes,
            policy,
        }
    }

    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        let mut inner = self.inner.lock();
        match inner.lru.get(key) {
            Some(entry) => {
                let value = entry.value.clone();
                inner.stats.hits += 1;
                Self::touch_hot(&mut inner, key);
                Some(value)
            }
            None => {
                inner.stats.misses += 1;
                None
            }
        }
    }

    /// Returns false when eviction could not make room; the caller keeps
    /// responsibility for the value.
    pub fn set(&self, key: &str, value: serde_json::Value, size: u64) -> bool {
        let now = Utc::now();
        self.set_with_metadata(
            key,
            CacheEntry {
                value,
                size,
                created_at: now,
                expires_at: now + chrono::Duration::from_std(DEFAULT_TTL).expect("ttl fits"),
                checksum: None,
            },
        )
    }

    pub fn set_with_metadata(&self, key: &str, entry: CacheEntry) -> bool {
        let size = entry.size;
        let mut inner = self.inner.lock();

        // Replacing an existing key gives its memory back first.
        if let Some(old) = inner.hot.remove(key) {
            inner.lru.pop(key);
            inner.current_memory = inner.current_memory.saturating_sub(old.size);
        }

        if inner.current_memory + size > self.max_memory
            && !self.evict_for(&mut inner, size)
        {
            return false;
        }

        if let Some((evicted_key, evicted)) = inner.lru.push(key.to_string(), entry) {
            // Capacity overflow from the LRU skeleton itself.
            if evicted_key != key {
                inner.current_memory = inner.current_memory.saturating_sub(evicted.size);
                inner.hot.remove(&evicted_key);
                inner.stats.evictions += 1;
            }
        }
        inner.current_memory += size;
        inner.hot.insert(
            key.to_string(),
            HotEntry {
                access_count: 1,
                last_access: Instant::now(),
                ttl: DEFAULT_TTL,
                size,
            },
        );
        true
    }

    /// A stale checksum or an expired entry invalidates in place and reads
    /// as a miss, so new workbook versions never serve old data.
    pub fn get_with_validation(
        &self,
        key: &str,
        expected_checksum: &str,
    ) -> Option<serde_json::Value> {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.lru.peek(key) else {
            inner.stats.misses += 1;
            return None;
        };

        let expired = Utc::now() > entry.expires_at;
        let mismatched = match entry.checksum.as_deref() {
            Some(checksum) if !expected_checksum.is_empty() => checksum != expected_checksum,
            _ => false,
        };

        if expired || mismatched {
            Self::remove_entry(&mut inner, key);
            inner.stats.misses += 1;
            return None;
        }

        let value = inner.lru.get(key).map(|e| e.value.clone());
        if value.is_some() {
            inner.stats.hits += 1;
            Self::touch_hot(&mut inner, key);
        }
        value
    }

    pub fn delete(&self, key: &str) {
        let mut inner = self.inner.lock();
        Self::remove_entry(&mut inner, key);
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.lru.clear();
        inner.hot.clear();
        inner.current_memory = 0;
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.lock().stats.clone()
    }

    pub fn memory_usage(&self) -> (u64, u64) {
        (self.inner.lock().current_memory, self.max_memory)
    }

    pub fn hit_ratio(&self) -> f64 {
        let stats = self.stats();
        let total = stats.hits + stats.misses;
        if total == 0 {
            return 0.0;
        }
        stats.hits as f64 / total as f64
    }

    /// One sweeper pass: drop entries idle past their ttl.
    pub fn sweep(&self) {
        let mut inner = self.inner.lock();
        let expired: Vec<String> = inner
            .hot
            .iter()
            .filter(|(_, entry)| entry.last_access.elapsed() > entry.ttl)
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            Self::remove_entry(&mut inner, &key);
        }
    }

    pub fn start_sweeper(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                self.sweep();
                tracing::debug!(hit_ratio = self.hit_ratio(), "cache sweep complete");
            }
        })
    }

    fn touch_hot(inner: &mut CacheInner, key: &str) {
        let mut promoted = false;
        if let Some(entry) = inner.hot.get_mut(key) {
            entry.access_count += 1;
            entry.last_access = Instant::now();
            if entry.access_count > 3 && entry.ttl < HOT_TTL {
                entry.ttl = HOT_TTL;
                promoted = true;
            }
        }
        if promoted {
            inner.stats.hot_promotions += 1;
        }
    }

    fn remove_entry(inner: &mut CacheInner, key: &str) {
        if let Some(entry) = inner.hot.remove(key) {
            inner.current_memory = inner.current_memory.saturating_sub(entry.size);
        }
        inner.lru.pop(key);
    }

    /// Two-pass eviction: cold entries first, then anything sufficiently
    /// aged. Returns whether enough memory was freed.
    fn evict_for(&self, inner: &mut CacheInner, needed: u64) -> bool {
        let target = (inner.current_memory + needed).saturating_sub(self.max_memory);
        let mut freed = 0u64;

        let cold: Vec<String> = inner
            .hot
            .iter()
            .filter(|(_, e)| e.access_count < 2 && e.last_access.elapsed() > self.policy.cold_idle)
            .map(|(k, _)| k.clone())
            .collect();
        for key in cold {
            if freed >= target {
                break;
            }
            if let Some(entry) = inner.hot.remove(&key) {
                inner.lru.pop(&key);
                inner.current_memory = inner.current_memory.saturating_sub(entry.size);
                freed += entry.size;
                inner.stats.evictions += 1;
            }
        }

        if freed < target {
            let aged: Vec<String> = inner
                .hot
                .iter()
                .filter(|(_, e)| e.last_access.elapsed() > self.policy.aged_idle)
                .map(|(k, _)| k.clone())
                .collect();
            for key in aged {
                if freed >= target {
                    break;
                }
                if let Some(entry) = inner.hot.remove(&key) {
                    inner.lru.pop(&key);
                    inner.current_memory = inner.current_memory.saturating_sub(entry.size);
                    freed += entry.size;
                    inner.stats.evictions += 1;
                }
            }
        }

        freed >= target
    }
}

/// Last-seen checksum per file path, used to short-circuit re-analysis.
#[derive(Default)]
pub struct ChecksumCache {
    inner: RwLock<HashMap<PathBuf, String>>,
}

impl ChecksumCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, path: &Path, checksum: &str) {
        self.inner
            .write()
            .insert(path.to_path_buf(), checksum.to_string());
    }

    pub fn get(&self, path: &Path) -> Option<String> {
        self.inner.read().get(path).cloned()
    }

    /// Unknown paths count as changed.
    pub fn is_changed(&self, path: &Path, new_checksum: &str) -> bool {
        match self.get(path) {
            Some(old) => old != new_checksum,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn immediate_eviction() -> EvictionPolicy {
        EvictionPolicy {
            cold_idle: Duration::ZERO,
            aged_idle: Duration::ZERO,
        }
    }

    #[test]
    fn memory_accounting_tracks_live_entries() {
        let cache = SmartCache::new(1000);
        assert!(cache.set("a", json!(1), 300));
        assert!(cache.set("b", json!(2), 400));
        assert_eq!(cache.memory_usage().0, 700);

        cache.delete("a");
        assert_eq!(cache.memory_usage().0, 400);

        // Replacing a key releases the old size first.
        assert!(cache.set("b", json!(3), 100));
        assert_eq!(cache.memory_usage().0, 100);

        cache.clear();
        assert_eq!(cache.memory_usage().0, 0);
    }

    #[test]
    fn set_rejects_when_nothing_is_evictable() {
        // Default policy: a freshly written entry is neither cold nor aged.
        let cache = SmartCache::new(100);
        assert!(cache.set("big", json!("x"), 80));
        assert!(!cache.set("more", json!("y"), 30));
        assert_eq!(cache.memory_usage().0, 80);
        assert_eq!(cache.stats().evictions, 0);
    }

    #[test]
    fn eviction_frees_room_and_counts() {
        let cache = SmartCache::with_policy(100, immediate_eviction());
        assert!(cache.set("big", json!("x"), 80));
        assert!(cache.set("more", json!("y"), 30));

        let (used, max) = cache.memory_usage();
        assert!(used <= max);
        assert_eq!(used, 30);
        assert!(cache.stats().evictions > 0);
        assert!(cache.get("big").is_none());
        assert!(cache.get("more").is_some());
    }

    #[test]
    fn hot_entries_get_promoted_after_repeat_hits() {
        let cache = SmartCache::new(1000);
        assert!(cache.set("hot", json!("v"), 10));
        for _ in 0..4 {
            assert!(cache.get("hot").is_some());
        }
        assert_eq!(cache.stats().hot_promotions, 1);

        // Further hits do not re-promote.
        assert!(cache.get("hot").is_some());
        assert_eq!(cache.stats().hot_promotions, 1);
    }

    #[test]
    fn hit_ratio_counts_hits_and_misses() {
        let cache = SmartCache::new(1000);
        assert!(cache.set("k", json!("v"), 10));
        assert!(cache.get("k").is_some());
        assert!(cache.get("missing").is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((cache.hit_ratio() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn checksum_mismatch_invalidates_entry() {
        let cache = SmartCache::new(1000);
        let now = Utc::now();
        assert!(cache.set_with_metadata(
            "nav_v1",
            CacheEntry {
                value: json!({"sheets": 3}),
                size: 64,
                created_at: now,
                expires_at: now + chrono::Duration::minutes(10),
                checksum: Some("v1".into()),
            },
        ));

        assert!(cache.get_with_validation("nav_v1", "v1").is_some());
        assert!(cache.get_with_validation("nav_v1", "v2").is_none());
        // The mismatch deleted the entry.
        assert!(cache.get("nav_v1").is_none());
        assert_eq!(cache.memory_usage().0, 0);
    }

    #[test]
    fn expired_entries_read_as_misses() {
        let cache = SmartCache::new(1000);
        let now = Utc::now();
        assert!(cache.set_with_metadata(
            "old",
            CacheEntry {
                value: json!("v"),
                size: 8,
                created_at: now - chrono::Duration::minutes(20),
                expires_at: now - chrono::Duration::minutes(10),
                checksum: None,
            },
        ));
        assert!(cache.get_with_validation("old", "").is_none());
        assert_eq!(cache.memory_usage().0, 0);
    }

    #[test]
    fn checksum_cache_detects_changes() {
        let cc = ChecksumCache::new();
        let path = Path::new("/data/book.xlsm");
        assert!(cc.is_changed(path, "v1"));
        cc.set(path, "v1");
        assert!(!cc.is_changed(path, "v1"));
        assert!(cc.is_changed(path, "v2"));
    }
}
