//! Two-tier cache for LLM invocation results.
//!
//! **L1** – [`DashMap`] keyed by model + chunk content hash (concurrent reads
//! from every worker).
//! **L2** – Optional directory of JSON files, one per key, surviving process
//! restarts. Writes go through a temp file + rename so a crash never leaves a
//! half-written entry behind.
//!
//! Keys never involve the chunk id: chunk ids derive from the whole-document
//! hash, so one edited page renames every chunk, while unchanged page ranges
//! keep their content hash and still hit. The id is stored as metadata.
//! An L2 file whose recorded hash or model disagrees with its key is
//! invalidated and removed. Only successful, parsed invocations are cached;
//! failures never are.

use crate::error::ExtractError;
use crate::pipeline::llm::Invocation;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// What we persist per chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub chunk_id: String,
    pub content_hash: String,
    pub model: String,
    pub invocation: Invocation,
}

impl CacheEntry {
    fn matches(&self, content_hash: &str, model: &str) -> bool {
        self.content_hash == content_hash && self.model == model
    }
}

pub struct ResponseCache {
    memory: DashMap<String, CacheEntry>,
    dir: Option<PathBuf>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl ResponseCache {
    /// L1 only; nothing touches the disk.
    pub fn in_memory() -> Self {
        Self {
            memory: DashMap::new(),
            dir: None,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// L1 backed by JSON files under `dir` (created if missing).
    pub fn persistent(dir: impl AsRef<Path>) -> Result<Self, ExtractError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(|e| ExtractError::OutputWriteFailed {
            path: dir.clone(),
            source: e,
        })?;
        Ok(Self {
            dir: Some(dir),
            ..Self::in_memory()
        })
    }

    fn entry_path(&self, key: &str) -> Option<PathBuf> {
        self.dir.as_ref().map(|d| d.join(format!("{key}.json")))
    }

    /// Look up a valid entry for this content under this model. Promotes L2
    /// hits into L1.
    pub async fn get(&self, content_hash: &str, model: &str) -> Option<Invocation> {
        let key = cache_key(content_hash, model);
        if let Some(entry) = self.memory.get(&key).map(|e| e.value().clone()) {
            debug!("Cache: L1 hit (first seen as {})", entry.chunk_id);
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Some(entry.invocation);
        }

        if let Some(path) = self.entry_path(&key) {
            if let Ok(raw) = tokio::fs::read_to_string(&path).await {
                match serde_json::from_str::<CacheEntry>(&raw) {
                    Ok(entry) if entry.matches(content_hash, model) => {
                        debug!("Cache: L2 hit (first seen as {})", entry.chunk_id);
                        let invocation = entry.invocation.clone();
                        self.memory.insert(key, entry);
                        self.hits.fetch_add(1, Ordering::Relaxed);
                        return Some(invocation);
                    }
                    Ok(entry) => {
                        warn!(
                            "Cache: entry {} records hash {} / model {}; removing",
                            path.display(),
                            entry.content_hash,
                            entry.model
                        );
                        self.invalidate(&key).await;
                    }
                    Err(e) => {
                        warn!("Cache: unreadable entry {}: {}", path.display(), e);
                        self.invalidate(&key).await;
                    }
                }
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Write-through insert into both tiers. Disk failures are logged, not fatal.
    pub async fn insert(
        &self,
        chunk_id: &str,
        content_hash: &str,
        model: &str,
        invocation: &Invocation,
    ) {
        let key = cache_key(content_hash, model);
        let entry = CacheEntry {
            chunk_id: chunk_id.to_string(),
            content_hash: content_hash.to_string(),
            model: model.to_string(),
            invocation: invocation.clone(),
        };

        if let (Some(path), Some(dir)) = (self.entry_path(&key), self.dir.clone()) {
            match serde_json::to_vec_pretty(&entry) {
                Ok(bytes) => {
                    let written =
                        tokio::task::spawn_blocking(move || write_atomic(&dir, &path, &bytes))
                            .await;
                    match written {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => warn!("Cache: failed to persist {}: {}", chunk_id, e),
                        Err(e) => warn!("Cache: persist task failed for {}: {}", chunk_id, e),
                    }
                }
                Err(e) => warn!("Cache: failed to serialise {}: {}", chunk_id, e),
            }
        }

        self.memory.insert(key, entry);
    }

    async fn invalidate(&self, key: &str) {
        debug!("Cache: invalidating stale entry {}", key);
        self.memory.remove(key);
        if let Some(path) = self.entry_path(key) {
            let _ = tokio::fs::remove_file(path).await;
        }
    }

    /// Drop every L1 entry. L2 files are left alone.
    pub fn clear_memory(&self) {
        self.memory.clear();
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.memory.len()
    }

    pub fn is_empty(&self) -> bool {
        self.memory.is_empty()
    }

    pub fn has_persistence(&self) -> bool {
        self.dir.is_some()
    }
}

/// File-name-safe `<model>-<content hash>`.
fn cache_key(content_hash: &str, model: &str) -> String {
    let safe = |s: &str| -> String {
        s.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    };
    format!("{}-{}", safe(model), safe(content_hash))
}

fn write_atomic(dir: &Path, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

impl std::fmt::Debug for ResponseCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseCache")
            .field("entries", &self.memory.len())
            .field("dir", &self.dir)
            .field("hits", &self.hits())
            .field("misses", &self.misses())
            .finish()
    }
}
