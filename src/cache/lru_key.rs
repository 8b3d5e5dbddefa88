//! Normalized-pair-key LRU.
//!
//! Detection builds the "tokenA:tokenB" key on every update; caching the
//! formatted string per (token0, token1) removes the sort + format from the
//! hot path. O(1) add/touch/evict.

use crate::types::normalized_token_key;
use alloy::primitives::Address;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct KeyCacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
}

pub struct PairKeyCache {
    cache: Mutex<lru::LruCache<(Address, Address), Arc<str>>>,
    stats: KeyCacheStats,
}

impl PairKeyCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: Mutex::new(lru::LruCache::new(
                NonZeroUsize::new(capacity.max(1)).unwrap(),
            )),
            stats: KeyCacheStats::default(),
        }
    }

    pub fn key(&self, token0: Address, token1: Address) -> Arc<str> {
        let mut cache = self.cache.lock();
        if let Some(key) = cache.get(&(token0, token1)) {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return Arc::clone(key);
        }
        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        let key: Arc<str> = normalized_token_key(&token0, &token1).into();
        cache.put((token0, token1), Arc::clone(&key));
        key
    }

    pub fn hit_rate(&self) -> f64 {
        let hits = self.stats.hits.load(Ordering::Relaxed) as f64;
        let misses = self.stats.misses.load(Ordering::Relaxed) as f64;
        if hits + misses == 0.0 {
            return 0.0;
        }
        hits / (hits + misses)
    }
}
