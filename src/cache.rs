//! In-process metadata cache with TTL and a size cap.

use crate::clock::elapsed_between;
use crate::types::Metadata;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub metadata: Metadata,
    pub timestamp: DateTime<Utc>,
}

/// Metadata cache keyed by lowercase hex.
pub struct MetadataCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    ttl: Duration,
    max_entries: usize,
}

impl MetadataCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            max_entries,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn key(hex: &str) -> String {
        hex.trim().to_ascii_lowercase()
    }

    /// Fresh entry for `hex`, if any.
    pub fn get(&self, hex: &str, now: DateTime<Utc>) -> Option<Metadata> {
        let entries = self.entries.lock();
        entries
            .get(&Self::key(hex))
            .filter(|e| elapsed_between(e.timestamp, now) < self.ttl)
            .map(|e| e.metadata.clone())
    }

    pub fn put(&self, hex: &str, metadata: Metadata, now: DateTime<Utc>) {
        self.entries.lock().insert(
            Self::key(hex),
            CacheEntry {
                metadata,
                timestamp: now,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Drop expired entries, then the oldest ones until under the cap.
    /// Returns the number of entries removed.
    pub fn evict(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();

        entries.retain(|_, e| elapsed_between(e.timestamp, now) < self.ttl);

        if entries.len() > self.max_entries {
            let mut by_age: Vec<(DateTime<Utc>, String)> = entries
                .iter()
                .map(|(k, e)| (e.timestamp, k.clone()))
                .collect();
            by_age.sort();
            let excess = entries.len() - self.max_entries;
            for (_, key) in by_age.into_iter().take(excess) {
                entries.remove(&key);
            }
        }

        before - entries.len()
    }
}
