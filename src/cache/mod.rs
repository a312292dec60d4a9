//! Content-addressed cache for external tool calls.
//!
//! The [`ToolCache`] maps a call [`Fingerprint`] to the payload the tool
//! returned. Lookups check a bounded in-memory LRU first and fall back to a
//! durable SQLite table, so a restarted worker reuses everything earlier
//! runs already paid for.
//!
//! The cache never decides correctness. Every backend failure is logged and
//! turned into a miss (reads) or a dropped write (writes).
//!
//! # Lifecycle
//!
//! ```ignore
//! use traceforge::cache::{Fingerprint, ToolCache};
//!
//! let cache = Arc::new(ToolCache::open("runs/tool_cache.db", 10_000).await);
//! let fp = Fingerprint::of("google_search", &args);
//! let (payload, cached) = cache.get_or_compute(&fp, "google_search", || call(args)).await?;
//! cache.close().await;
//! ```

pub mod fingerprint;
pub mod memory;
pub mod store;

pub use fingerprint::{canonical_json, Fingerprint};
pub use memory::MemoryCache;
pub use store::SqliteCacheStore;

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

use crate::metrics;

/// A cached payload and when it was first stored.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub payload: Value,
    pub inserted_at: DateTime<Utc>,
}

/// Cache statistics for monitoring and debugging.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    /// Writes lost to a backend failure or a disabled cache.
    pub dropped_writes: u64,
    /// Lookups that waited on an in-flight computation of the same key.
    pub coalesced: u64,
}

impl CacheStats {
    /// Hit rate between 0.0 and 1.0, or 0.0 if no lookups happened.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Default)]
struct SharedCacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    dropped_writes: AtomicU64,
    coalesced: AtomicU64,
}

impl SharedCacheStats {
    fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        metrics::record_cache_lookup(true);
    }

    fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        metrics::record_cache_lookup(false);
    }

    fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            dropped_writes: self.dropped_writes.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
        }
    }
}

type InflightMap = Mutex<HashMap<Fingerprint, Arc<tokio::sync::Mutex<()>>>>;

/// One caller's claim on a per-key lock. Dropping it (normally or because
/// the owning future was cancelled) removes the map entry once nobody else
/// holds the lock.
struct InflightSlot<'a> {
    map: &'a InflightMap,
    fingerprint: &'a Fingerprint,
    key_lock: Arc<tokio::sync::Mutex<()>>,
}

impl<'a> InflightSlot<'a> {
    fn claim(map: &'a InflightMap, fingerprint: &'a Fingerprint) -> Self {
        let key_lock = map
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(fingerprint.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        Self {
            map,
            fingerprint,
            key_lock,
        }
    }
}

impl Drop for InflightSlot<'_> {
    fn drop(&mut self) {
        let mut inflight = self.map.lock().unwrap_or_else(PoisonError::into_inner);
        // Map entry plus ours: nobody else is waiting on this key.
        if Arc::strong_count(&self.key_lock) <= 2 {
            inflight.remove(self.fingerprint);
        }
    }
}

/// Process-wide tool-call cache handle.
///
/// Opened once per process and shared by reference (`Arc<ToolCache>`)
/// with every episode; call [`ToolCache::close`] at shutdown.
pub struct ToolCache {
    memory: MemoryCache,
    store: Option<SqliteCacheStore>,
    enabled: AtomicBool,
    inflight: InflightMap,
    stats: SharedCacheStats,
}

impl ToolCache {
    /// Opens a durable cache at `path`.
    ///
    /// If the database cannot be opened the cache still works, memory only.
    pub async fn open(path: impl AsRef<Path>, memory_entries: usize) -> Self {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                warn!(path = ?parent, error = %e, "Cannot create tool cache directory");
            }
        }
        let store = match SqliteCacheStore::open(&path.to_string_lossy()).await {
            Ok(store) => Some(store),
            Err(e) => {
                warn!(path = ?path, error = %e, "Tool cache unavailable, continuing memory-only");
                None
            }
        };
        Self::with_store(store, memory_entries)
    }

    /// A cache with no durable layer.
    pub fn in_memory(memory_entries: usize) -> Self {
        Self::with_store(None, memory_entries)
    }

    fn with_store(store: Option<SqliteCacheStore>, memory_entries: usize) -> Self {
        Self {
            memory: MemoryCache::new(memory_entries),
            store,
            enabled: AtomicBool::new(true),
            inflight: Mutex::new(HashMap::new()),
            stats: SharedCacheStats::default(),
        }
    }

    pub fn is_durable(&self) -> bool {
        self.store.is_some()
    }

    /// Forces every lookup to miss and every write to be dropped.
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.snapshot()
    }

    /// Number of entries in the durable layer, if there is one.
    pub async fn persisted_entries(&self) -> Option<u64> {
        let store = self.store.as_ref()?;
        match store.count().await {
            Ok(n) => Some(n),
            Err(e) => {
                warn!(error = %e, "Failed to count tool cache entries");
                None
            }
        }
    }

    /// Looks up `fingerprint`. Returns `None` when absent, disabled or failing.
    pub async fn get(&self, fingerprint: &Fingerprint) -> Option<Value> {
        if !self.is_enabled() {
            return None;
        }
        let found = self.lookup(fingerprint).await;
        match found {
            Some(_) => self.stats.hit(),
            None => self.stats.miss(),
        }
        found
    }

    async fn lookup(&self, fingerprint: &Fingerprint) -> Option<Value> {
        if let Some(entry) = self.memory.get(fingerprint) {
            return Some(entry.payload);
        }
        let store = self.store.as_ref()?;
        match store.get(fingerprint).await {
            Ok(Some(entry)) => {
                self.memory
                    .put(fingerprint.clone(), entry.payload.clone(), entry.inserted_at);
                Some(entry.payload)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(fingerprint = %fingerprint, error = %e, "Tool cache read failed, treating as miss");
                None
            }
        }
    }

    /// Stores `payload`. Backend failures drop the write.
    pub async fn put(&self, fingerprint: &Fingerprint, tool: &str, payload: &Value) {
        if !self.is_enabled() {
            self.stats.dropped_writes.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let now = Utc::now();
        self.memory.put(fingerprint.clone(), payload.clone(), now);
        if let Some(store) = &self.store {
            if let Err(e) = store.put(fingerprint, tool, payload, now).await {
                warn!(fingerprint = %fingerprint, tool = tool, error = %e, "Tool cache write dropped");
                self.stats.dropped_writes.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
    }

    /// Read-through lookup with single flight per key.
    ///
    /// Concurrent callers for the same absent fingerprint queue behind one
    /// per-key lock; the first runs `compute`, the rest reuse its stored
    /// result. Errors are returned to the caller that hit them and are not
    /// cached. The boolean is true when the value came from the cache.
    pub async fn get_or_compute<F, Fut, E>(
        &self,
        fingerprint: &Fingerprint,
        tool: &str,
        compute: F,
    ) -> Result<(Value, bool), E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, E>>,
    {
        if !self.is_enabled() {
            return compute().await.map(|value| (value, false));
        }
        if let Some(value) = self.lookup(fingerprint).await {
            self.stats.hit();
            return Ok((value, true));
        }

        let slot = InflightSlot::claim(&self.inflight, fingerprint);
        let _guard = slot.key_lock.lock().await;

        if let Some(value) = self.lookup(fingerprint).await {
            debug!(fingerprint = %fingerprint, "Coalesced with in-flight tool call");
            self.stats.coalesced.fetch_add(1, Ordering::Relaxed);
            self.stats.hit();
            return Ok((value, true));
        }
        self.stats.miss();
        let value = compute().await?;
        self.put(fingerprint, tool, &value).await;
        Ok((value, false))
    }

    /// Closes the durable layer. Further writes only reach memory.
    pub async fn close(&self) {
        if let Some(store) = &self.store {
            store.close().await;
        }
    }
}
