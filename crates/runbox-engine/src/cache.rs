//! Sharded LRU cache keyed by a SHA-256 of the source text.
//!
//! Each shard is an [`LruCache`] behind its own [`parking_lot::Mutex`]; the
//! shard is chosen by the key's leading bytes modulo the shard count, so
//! concurrent requests for different snippets rarely contend. Entries are
//! immutable once inserted: a second insert for the same key keeps the
//! first value.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};

use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Cache key: SHA-256 digest of the source text.
pub type CacheKey = [u8; 32];

/// Hash `code` into a cache key.
pub fn cache_key(code: &str) -> CacheKey {
    let mut hasher = Sha256::new();
    hasher.update(code.as_bytes());
    hasher.finalize().into()
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CacheStats {
    /// Total capacity across all shards.
    pub capacity: usize,
    /// Number of shards.
    pub shards: usize,
    /// Entries currently stored.
    pub entries: usize,
    /// Lookups that found an entry.
    pub hits: u64,
    /// Lookups that found nothing.
    pub misses: u64,
    /// Entries inserted.
    pub inserts: u64,
    /// Entries evicted to make room.
    pub evictions: u64,
    /// `hits / (hits + misses)`, or 0 with no lookups.
    pub hit_rate: f64,
}

/// A bounded LRU map split into independently locked shards.
pub struct ShardedLru<V> {
    shards: Vec<Mutex<LruCache<CacheKey, V>>>,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,
    evictions: AtomicU64,
}

impl<V: Clone> ShardedLru<V> {
    /// Create a cache holding about `capacity` entries across `shards` shards.
    ///
    /// Both values are clamped to at least 1; each shard holds
    /// `ceil(capacity / shards)` entries.
    pub fn new(capacity: usize, shards: usize) -> Self {
        let shard_count = shards.max(1);
        let per_shard = NonZeroUsize::new(capacity.max(1).div_ceil(shard_count))
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            shards: (0..shard_count)
                .map(|_| Mutex::new(LruCache::new(per_shard)))
                .collect(),
            capacity: per_shard.get() * shard_count,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            inserts: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    fn shard(&self, key: &CacheKey) -> &Mutex<LruCache<CacheKey, V>> {
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&key[..8]);
        let index = u64::from_le_bytes(prefix) % self.shards.len() as u64;
        &self.shards[index as usize]
    }

    /// Look up `key`, promoting it to most recently used.
    pub fn get(&self, key: &CacheKey) -> Option<V> {
        let found = self.shard(key).lock().get(key).cloned();
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    /// Insert `value` unless `key` is already present; returns the stored value.
    pub fn insert(&self, key: CacheKey, value: V) -> V {
        let mut shard = self.shard(&key).lock();
        if let Some(existing) = shard.get(&key) {
            return existing.clone();
        }
        if shard.push(key, value.clone()).is_some() {
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        self.inserts.fetch_add(1, Ordering::Relaxed);
        value
    }

    /// Return the cached value for `key`, or build and insert it.
    ///
    /// `build` runs without holding the shard lock. When two callers race
    /// on the same key, both may build but only the first result is kept
    /// and returned to both.
    pub fn get_or_try_insert_with<E>(
        &self,
        key: CacheKey,
        build: impl FnOnce() -> Result<V, E>,
    ) -> Result<V, E> {
        if let Some(hit) = self.get(&key) {
            return Ok(hit);
        }
        let value = build()?;
        Ok(self.insert(key, value))
    }

    /// Entries currently stored.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheStats {
            capacity: self.capacity,
            shards: self.shards.len(),
            entries: self.len(),
            hits,
            misses,
            inserts: self.inserts.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
        }
    }
}
