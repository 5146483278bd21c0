use anyhow::Result;
use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task;

use crate::cache::{ChecksumCache, SmartCache};
use crate::compression::CompressionManager;
use crate::config::ServerConfig;
use crate::cursor::CursorCodec;
use crate::errors::ServerError;
use crate::index::IndexEngine;
use crate::reader::{WorkbookHandle, WorkbookReader, XlsxWorkbookReader};
use crate::token::TokenCounter;

/// Open workbooks kept warm, independent of the response cache.
const WORKBOOK_CACHE_CAPACITY: usize = 5;

/// One loaded workbook version. A changed checksum means a new context.
pub struct WorkbookContext {
    pub path: PathBuf,
    pub handle: Arc<dyn WorkbookHandle>,
    pub checksum: String,
    pub size_bytes: u64,
    pub modified: DateTime<Utc>,
    pub sheet_names: Vec<String>,
}

pub struct AppState {
    config: Arc<ServerConfig>,
    reader: Arc<dyn WorkbookReader>,
    pub cache: Arc<SmartCache>,
    pub checksums: ChecksumCache,
    pub token_counter: Arc<TokenCounter>,
    pub compressor: CompressionManager,
    pub cursors: CursorCodec,
    workbooks: RwLock<LruCache<PathBuf, Arc<WorkbookContext>>>,
    indexes: RwLock<HashMap<String, Arc<IndexEngine>>>,
}

impl AppState {
    pub fn new(config: Arc<ServerConfig>) -> Result<Self> {
        Self::with_reader(config, Arc::new(XlsxWorkbookReader::new()))
    }

    pub fn with_reader(
        config: Arc<ServerConfig>,
        reader: Arc<dyn WorkbookReader>,
    ) -> Result<Self> {
        let token_counter = Arc::new(TokenCounter::new()?);
        let compressor = CompressionManager::new(token_counter.clone());
        let cache = Arc::new(SmartCache::new(config.cache_max_memory_bytes));
        let capacity = NonZeroUsize::new(WORKBOOK_CACHE_CAPACITY).expect("nonzero capacity");

        Ok(Self {
            config,
            reader,
            cache,
            checksums: ChecksumCache::new(),
            token_counter,
            compressor,
            cursors: CursorCodec::new(),
            workbooks: RwLock::new(LruCache::new(capacity)),
            indexes: RwLock::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> Arc<ServerConfig> {
        self.config.clone()
    }

    /// Open a workbook at its current version. The checksum is recomputed
    /// every time; a cached context is reused only while it still matches.
    pub async fn open_workbook(&self, path: &Path) -> Result<Arc<WorkbookContext>> {
        let path = path.to_path_buf();

        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|e| ServerError::Io(format!("failed to stat {}: {e}", path.display())))?;
        if metadata.len() > self.config.max_file_size_bytes {
            return Err(ServerError::InvalidParams(format!(
                "file {} exceeds max size of {} bytes",
                path.display(),
                self.config.max_file_size_bytes
            ))
            .into());
        }

        let checksum_path = path.clone();
        let checksum = task::spawn_blocking(move || compute_file_checksum(&checksum_path))
            .await
            .map_err(|e| ServerError::Internal(format!("checksum task failed: {e}")))??;

        {
            let mut workbooks = self.workbooks.write();
            if let Some(context) = workbooks.get(&path)
                && context.checksum == checksum
            {
                return Ok(context.clone());
            }
        }

        if self.checksums.is_changed(&path, &checksum) {
            tracing::debug!(path = %path.display(), checksum = %checksum, "workbook version changed");
        }
        self.checksums.set(&path, &checksum);

        let reader = self.reader.clone();
        let load_path = path.clone();
        let load_checksum = checksum.clone();
        let size_bytes = metadata.len();
        let modified = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        let context = task::spawn_blocking(move || -> Result<WorkbookContext> {
            let handle: Arc<dyn WorkbookHandle> = Arc::from(reader.open(&load_path)?);
            let sheet_names = handle.sheet_list();
            Ok(WorkbookContext {
                path: load_path,
                handle,
                checksum: load_checksum,
                size_bytes,
                modified,
                sheet_names,
            })
        })
        .await
        .map_err(|e| ServerError::Internal(format!("workbook load failed: {e}")))??;

        let context = Arc::new(context);
        self.workbooks.write().put(path, context.clone());
        Ok(context)
    }

    pub fn close_workbook(&self, path: &Path) {
        self.workbooks.write().pop(path);
    }

    /// Search index for a workbook version, if one has been built.
    pub fn index_for(&self, checksum: &str) -> Option<Arc<IndexEngine>> {
        self.indexes.read().get(checksum).cloned()
    }

    pub fn register_index(&self, checksum: &str, engine: Arc<IndexEngine>) {
        self.indexes.write().insert(checksum.to_string(), engine);
    }
}

/// SHA-256 over the raw file bytes, streamed.
pub fn compute_file_checksum(path: &Path) -> Result<String> {
    let file = std::fs::File::open(path)
        .map_err(|e| ServerError::Io(format!("failed to open {}: {e}", path.display())))?;
    let mut reader = std::io::BufReader::new(file);
    let mut hasher = Sha256::new();
    std::io::copy(&mut reader, &mut DigestWriter(&mut hasher))
        .map_err(|e| ServerError::Io(format!("failed to read {}: {e}", path.display())))?;
    Ok(format!("{:x}", hasher.finalize()))
}

struct DigestWriter<'a, D: Digest>(&'a mut D);

impl<D: Digest> std::io::Write for DigestWriter<'_, D> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn checksum_is_sha256_of_raw_bytes() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"workbook bytes").unwrap();

        let checksum = compute_file_checksum(file.path()).unwrap();
        let mut hasher = Sha256::new();
        hasher.update(b"workbook bytes");
        assert_eq!(checksum, format!("{:x}", hasher.finalize()));
    }
}
