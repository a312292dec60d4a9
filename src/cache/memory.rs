//! Bounded in-memory layer of the tool cache.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use super::{CacheEntry, Fingerprint};

struct MemoryEntry {
    entry: CacheEntry,
    last_accessed: Instant,
}

/// LRU map from fingerprint to payload.
///
/// A capacity of zero disables the layer entirely.
pub struct MemoryCache {
    entries: Mutex<HashMap<Fingerprint, MemoryEntry>>,
    max_entries: usize,
}

impl MemoryCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_entries,
        }
    }

    pub fn get(&self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = entries.get_mut(fingerprint)?;
        slot.last_accessed = Instant::now();
        Some(slot.entry.clone())
    }

    pub fn put(&self, fingerprint: Fingerprint, payload: Value, inserted_at: DateTime<Utc>) {
        if self.max_entries == 0 {
            return;
        }
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if !entries.contains_key(&fingerprint) && entries.len() >= self.max_entries {
            let oldest = entries
                .iter()
                .min_by_key(|(_, slot)| slot.last_accessed)
                .map(|(fp, _)| fp.clone());
            if let Some(fp) = oldest {
                entries.remove(&fp);
            }
        }
        entries.insert(
            fingerprint,
            MemoryEntry {
                entry: CacheEntry {
                    payload,
                    inserted_at,
                },
                last_accessed: Instant::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}
