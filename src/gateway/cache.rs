//! Two-tier response cache.
//!
//! The memory tier is a small LRU consulted first. The persistent tier sits
//! behind [`PersistentCacheStore`] and is written asynchronously; a missing or
//! failing store only degrades the cache to memory-only behaviour.
//!
//! Entries are keyed by a SHA-256 over the semantic request fields. The request
//! content itself is never written to the persistent tier.

use crate::gateway::types::CacheConfig;
use crate::provider::{GenerationOutput, GenerationRequest};
use anyhow::Context;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs as async_fs;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: String,
    pub output: GenerationOutput,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum CacheStoreError {
    #[error("cache store io failed: {0:#}")]
    Io(anyhow::Error),
    #[error("cache entry is invalid: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("cache entry payload is invalid: {0}")]
    Encoding(String),
    #[error("invalid cache key: {0}")]
    InvalidKey(String),
}

#[async_trait]
pub trait PersistentCacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheStoreError>;
    async fn put(&self, entry: &CacheEntry) -> Result<(), CacheStoreError>;
    async fn delete(&self, key: &str) -> Result<bool, CacheStoreError>;
    /// Remove entries created before `cutoff`; returns how many were removed
    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, CacheStoreError>;
    async fn count(&self) -> Result<usize, CacheStoreError>;
    /// Remove the `n` oldest entries; returns how many were removed
    async fn delete_oldest(&self, n: usize) -> Result<usize, CacheStoreError>;
}

/// Cache key over kind, content, voice, model and parameters.
///
/// Every field is length-prefixed so that adjacent fields cannot run into each
/// other.
pub fn cache_key(request: &GenerationRequest) -> String {
    fn field(hasher: &mut Sha256, value: Option<&str>) {
        match value {
            Some(value) => {
                hasher.update([1u8]);
                hasher.update((value.len() as u64).to_le_bytes());
                hasher.update(value.as_bytes());
            }
            None => hasher.update([0u8]),
        }
    }

    let mut hasher = Sha256::new();
    let kind = match request.kind {
        crate::provider::GenerationKind::Text => "text",
        crate::provider::GenerationKind::Speech => "speech",
    };
    field(&mut hasher, Some(kind));
    field(&mut hasher, Some(&request.content));
    field(&mut hasher, request.voice.as_deref());
    field(&mut hasher, request.model.as_deref());
    hasher.update((request.parameters.len() as u64).to_le_bytes());
    for (name, value) in &request.parameters {
        field(&mut hasher, Some(name));
        field(&mut hasher, Some(value));
    }

    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredEntry {
    key: String,
    created_at: DateTime<Utc>,
    payload: StoredPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StoredPayload {
    Text { text: String },
    Audio { data: String, mime_type: String },
}

impl StoredEntry {
    fn from_entry(entry: &CacheEntry) -> Self {
        let payload = match &entry.output {
            GenerationOutput::Text { text } => StoredPayload::Text { text: text.clone() },
            GenerationOutput::Audio { bytes, mime_type } => StoredPayload::Audio {
                data: STANDARD.encode(bytes),
                mime_type: mime_type.clone(),
            },
        };
        Self {
            key: entry.key.clone(),
            created_at: entry.created_at,
            payload,
        }
    }

    fn into_entry(self) -> Result<CacheEntry, CacheStoreError> {
        let output = match self.payload {
            StoredPayload::Text { text } => GenerationOutput::Text { text },
            StoredPayload::Audio { data, mime_type } => GenerationOutput::Audio {
                bytes: STANDARD
                    .decode(data)
                    .map_err(|e| CacheStoreError::Encoding(e.to_string()))?,
                mime_type,
            },
        };
        Ok(CacheEntry {
            key: self.key,
            output,
            created_at: self.created_at,
        })
    }
}

/// One JSON document per key in a directory
#[derive(Debug, Clone)]
pub struct FileCacheStore {
    dir: PathBuf,
}

impl FileCacheStore {
    /// Open (and create if needed) the cache directory
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, CacheStoreError> {
        let dir = dir.into();
        async_fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create cache directory: {}", dir.display()))
            .map_err(CacheStoreError::Io)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, key: &str) -> Result<PathBuf, CacheStoreError> {
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(CacheStoreError::InvalidKey(key.to_string()));
        }
        Ok(self.dir.join(format!("{}.json", key)))
    }

    async fn read_entry(path: &Path) -> Result<StoredEntry, CacheStoreError> {
        let content = async_fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read cache entry: {}", path.display()))
            .map_err(CacheStoreError::Io)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Every entry file with its creation time; unreadable files report `None`
    async fn list(&self) -> Result<Vec<(PathBuf, Option<DateTime<Utc>>)>, CacheStoreError> {
        let mut entries = Vec::new();
        let mut dir = async_fs::read_dir(&self.dir)
            .await
            .with_context(|| format!("Failed to list cache directory: {}", self.dir.display()))
            .map_err(CacheStoreError::Io)?;

        while let Some(item) = dir
            .next_entry()
            .await
            .context("Failed to read cache directory entry")
            .map_err(CacheStoreError::Io)?
        {
            let path = item.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let created_at = Self::read_entry(&path).await.ok().map(|e| e.created_at);
            entries.push((path, created_at));
        }

        Ok(entries)
    }

    async fn remove(path: &Path) -> Result<(), CacheStoreError> {
        async_fs::remove_file(path)
            .await
            .with_context(|| format!("Failed to remove cache entry: {}", path.display()))
            .map_err(CacheStoreError::Io)
    }
}

#[async_trait]
impl PersistentCacheStore for FileCacheStore {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheStoreError> {
        let path = self.entry_path(key)?;
        if !async_fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(None);
        }
        Self::read_entry(&path).await?.into_entry().map(Some)
    }

    async fn put(&self, entry: &CacheEntry) -> Result<(), CacheStoreError> {
        let path = self.entry_path(&entry.key)?;
        let content = serde_json::to_string(&StoredEntry::from_entry(entry))?;

        // Concurrent writers of one key each need their own temp file
        let temp_path = path.with_extension(format!("json.{}.tmp", Uuid::new_v4().simple()));
        async_fs::write(&temp_path, content)
            .await
            .with_context(|| format!("Failed to write temp file: {}", temp_path.display()))
            .map_err(CacheStoreError::Io)?;
        if let Err(e) = async_fs::rename(&temp_path, &path).await {
            let _ = async_fs::remove_file(&temp_path).await;
            return Err(CacheStoreError::Io(anyhow::Error::new(e).context(format!(
                "Failed to replace cache entry: {}",
                path.display()
            ))));
        }

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheStoreError> {
        let path = self.entry_path(key)?;
        if !async_fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(false);
        }
        Self::remove(&path).await?;
        Ok(true)
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, CacheStoreError> {
        let mut removed = 0;
        for (path, created_at) in self.list().await? {
            // Unreadable entries are dropped along with the expired ones
            if created_at.is_none_or(|at| at < cutoff) {
                Self::remove(&path).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn count(&self) -> Result<usize, CacheStoreError> {
        Ok(self.list().await?.len())
    }

    async fn delete_oldest(&self, n: usize) -> Result<usize, CacheStoreError> {
        let mut entries = self.list().await?;
        entries.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));

        let mut removed = 0;
        for (path, _) in entries.into_iter().take(n) {
            Self::remove(&path).await?;
            removed += 1;
        }
        Ok(removed)
    }
}

/// Counters exposed through [`ResponseCache::stats`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub memory_entries: usize,
    pub memory_hits: u64,
    pub persistent_hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub evictions: u64,
    pub persistent_enabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionReport {
    pub expired: usize,
    pub evicted: usize,
}

#[derive(Debug)]
struct MemoryTier {
    capacity: usize,
    entries: HashMap<String, CacheEntry>,
    /// Least recently used at the front
    order: VecDeque<String>,
}

impl MemoryTier {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
        }
    }

    fn touch(&mut self, key: &str) {
        if let Some(position) = self.order.iter().position(|k| k == key) {
            self.order.remove(position);
        }
        self.order.push_back(key.to_string());
    }

    fn get(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.get(key).cloned()?;
        self.touch(key);
        Some(entry)
    }

    /// Insert and return how many entries were evicted
    fn insert(&mut self, entry: CacheEntry) -> u64 {
        if self.capacity == 0 {
            return 0;
        }

        let key = entry.key.clone();
        self.entries.insert(key.clone(), entry);
        self.touch(&key);

        let mut evicted = 0;
        while self.entries.len() > self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.entries.remove(&oldest);
            evicted += 1;
        }
        evicted
    }

    fn remove(&mut self, key: &str) {
        if self.entries.remove(key).is_some()
            && let Some(position) = self.order.iter().position(|k| k == key)
        {
            self.order.remove(position);
        }
    }

    fn retain_newer_than(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.created_at >= cutoff);
        let entries = &self.entries;
        self.order.retain(|key| entries.contains_key(key));
        before - self.entries.len()
    }
}

#[derive(Debug)]
struct CacheState {
    memory: MemoryTier,
    stats: CacheStats,
}

pub struct ResponseCache {
    config: CacheConfig,
    state: Arc<Mutex<CacheState>>,
    store: Option<Arc<dyn PersistentCacheStore>>,
    mirrors: Mutex<JoinSet<()>>,
}

impl ResponseCache {
    pub fn new(config: CacheConfig, store: Option<Arc<dyn PersistentCacheStore>>) -> Self {
        let store = if config.persistent { store } else { None };
        let state = CacheState {
            memory: MemoryTier::new(config.memory_capacity),
            stats: CacheStats {
                persistent_enabled: store.is_some(),
                ..Default::default()
            },
        };

        Self {
            config,
            state: Arc::new(Mutex::new(state)),
            store,
            mirrors: Mutex::new(JoinSet::new()),
        }
    }

    fn max_age(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.config.max_age)
            .unwrap_or_else(|_| chrono::Duration::days(365 * 100))
    }

    fn is_expired(&self, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        now - entry.created_at > self.max_age()
    }

    pub async fn get(&self, request: &GenerationRequest) -> Option<GenerationOutput> {
        self.get_at(request, Utc::now()).await
    }

    pub(crate) async fn get_at(
        &self,
        request: &GenerationRequest,
        now: DateTime<Utc>,
    ) -> Option<GenerationOutput> {
        let key = cache_key(request);

        {
            let mut state = self.state.lock().await;
            if let Some(entry) = state.memory.get(&key) {
                if !self.is_expired(&entry, now) {
                    state.stats.memory_hits += 1;
                    debug!("Memory cache hit for {}", &key[..12]);
                    return Some(entry.output);
                }
                state.memory.remove(&key);
            }
        }

        let found = match &self.store {
            Some(store) => match store.get(&key).await {
                Ok(found) => found,
                Err(e) => {
                    warn!("Persistent cache read failed: {}", e);
                    None
                }
            },
            None => None,
        };

        let mut state = self.state.lock().await;
        match found {
            Some(entry) if !self.is_expired(&entry, now) => {
                state.stats.persistent_hits += 1;
                state.stats.evictions += state.memory.insert(entry.clone());
                debug!("Persistent cache hit for {}", &key[..12]);
                Some(entry.output)
            }
            Some(_) => {
                state.stats.misses += 1;
                drop(state);
                if let Some(store) = &self.store
                    && let Err(e) = store.delete(&key).await
                {
                    warn!("Failed to purge expired cache entry: {}", e);
                }
                None
            }
            None => {
                state.stats.misses += 1;
                None
            }
        }
    }

    pub async fn put(&self, request: &GenerationRequest, output: GenerationOutput) {
        self.put_at(request, output, Utc::now()).await
    }

    pub(crate) async fn put_at(
        &self,
        request: &GenerationRequest,
        output: GenerationOutput,
        now: DateTime<Utc>,
    ) {
        let entry = CacheEntry {
            key: cache_key(request),
            output,
            created_at: now,
        };

        {
            let mut state = self.state.lock().await;
            state.stats.writes += 1;
            state.stats.evictions += state.memory.insert(entry.clone());
        }

        if let Some(store) = &self.store {
            let store = Arc::clone(store);
            let mut mirrors = self.mirrors.lock().await;
            while mirrors.try_join_next().is_some() {}
            mirrors.spawn(async move {
                if let Err(e) = store.put(&entry).await {
                    warn!("Failed to mirror cache entry: {}", e);
                }
            });
        }
    }

    /// Wait for every pending persistent write
    pub async fn flush(&self) {
        let mut mirrors = self.mirrors.lock().await;
        while let Some(result) = mirrors.join_next().await {
            if let Err(e) = result {
                warn!("Cache mirror task failed: {}", e);
            }
        }
    }

    /// Drop expired entries, then trim the persistent tier to its capacity
    pub async fn compact(&self) -> Result<CompactionReport, CacheStoreError> {
        self.compact_at(Utc::now()).await
    }

    pub(crate) async fn compact_at(
        &self,
        now: DateTime<Utc>,
    ) -> Result<CompactionReport, CacheStoreError> {
        let cutoff = now - self.max_age();
        let memory_expired = self.state.lock().await.memory.retain_newer_than(cutoff);

        let Some(store) = &self.store else {
            return Ok(CompactionReport {
                expired: memory_expired,
                evicted: 0,
            });
        };

        self.flush().await;
        let expired = store.delete_older_than(cutoff).await?;
        let count = store.count().await?;
        let evicted = if count > self.config.persistent_capacity {
            store
                .delete_oldest(count - self.config.persistent_capacity)
                .await?
        } else {
            0
        };

        if expired > 0 || evicted > 0 {
            info!(
                "Cache compaction removed {} expired and {} surplus entries",
                expired, evicted
            );
        }

        Ok(CompactionReport { expired, evicted })
    }

    pub async fn stats(&self) -> CacheStats {
        let state = self.state.lock().await;
        CacheStats {
            memory_entries: state.memory.entries.len(),
            ..state.stats.clone()
        }
    }
}

impl std::fmt::Debug for ResponseCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseCache")
            .field("config", &self.config)
            .field("persistent", &self.store.is_some())
            .finish_non_exhaustive()
    }
}
