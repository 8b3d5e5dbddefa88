//! Tiered price reads: L1 matrix (sub-microsecond) → L2 recent-price store
//! (1–20 ms) → L3 RPC fallback. Hits below L1 are promoted into the matrix
//! immediately. Only L1 is on the hot path; detectors use `read_l1` and the
//! tiered getter is for catch-up and diagnostics.

use crate::cache::price_matrix::{PriceMatrix, PriceRead};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::Arc;

/// A price observed at a moment in time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceAt {
    pub price: f64,
    pub ts_secs: u32,
}

/// A lower cache level the tiered reader can fall back to.
#[async_trait]
pub trait PriceLevel: Send + Sync {
    async fn get(&self, key: &str) -> Option<PriceAt>;
}

/// In-process L2: last N updates per key with a TTL. Shared across detector
/// partitions in the same process; an external KV can stand in behind the
/// same trait when partitions span processes.
pub struct RecentPriceStore {
    history_per_key: usize,
    ttl_secs: u32,
    entries: Mutex<lru::LruCache<String, VecDeque<PriceAt>>>,
}

impl RecentPriceStore {
    pub fn new(max_keys: usize, history_per_key: usize, ttl_secs: u32) -> Self {
        Self {
            history_per_key,
            ttl_secs,
            entries: Mutex::new(lru::LruCache::new(
                NonZeroUsize::new(max_keys.max(1)).unwrap(),
            )),
        }
    }

    /// Defaults from the cache design: 100 updates per pair, 60 s TTL.
    pub fn with_defaults() -> Self {
        Self::new(4_096, 100, 60)
    }

    pub fn record(&self, key: &str, price: f64, ts_secs: u32) {
        let mut entries = self.entries.lock();
        let history = entries.get_or_insert_mut(key.to_string(), VecDeque::new);
        if history.len() >= self.history_per_key {
            history.pop_front();
        }
        history.push_back(PriceAt { price, ts_secs });
    }

    pub fn latest(&self, key: &str, now_secs: u32) -> Option<PriceAt> {
        let mut entries = self.entries.lock();
        let history = entries.get(key)?;
        let last = history.back().copied()?;
        if now_secs.saturating_sub(last.ts_secs) > self.ttl_secs {
            return None;
        }
        Some(last)
    }

    pub fn history(&self, key: &str) -> Vec<PriceAt> {
        let mut entries = self.entries.lock();
        entries
            .get(key)
            .map(|h| h.iter().copied().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl PriceLevel for RecentPriceStore {
    async fn get(&self, key: &str) -> Option<PriceAt> {
        self.latest(key, crate::types::now_secs())
    }
}

pub struct TieredPriceCache {
    l1: Arc<PriceMatrix>,
    l2: Option<Arc<dyn PriceLevel>>,
    l3: Option<Arc<dyn PriceLevel>>,
}

impl TieredPriceCache {
    pub fn new(
        l1: Arc<PriceMatrix>,
        l2: Option<Arc<dyn PriceLevel>>,
        l3: Option<Arc<dyn PriceLevel>>,
    ) -> Self {
        Self { l1, l2, l3 }
    }

    /// Hot-path read: L1 only, no awaits.
    pub fn read_l1(&self, key: &str, now_secs: u32) -> PriceRead {
        self.l1.read(key, now_secs)
    }

    /// Full tiered read. A fresh L1 hit returns immediately; L2/L3 hits are
    /// promoted into L1. A miss everywhere returns None — a cache miss is
    /// never an error.
    pub async fn get(&self, key: &str, now_secs: u32) -> Option<PriceAt> {
        if let PriceRead::Fresh(price) = self.l1.read(key, now_secs) {
            return Some(PriceAt {
                price,
                ts_secs: now_secs,
            });
        }
        for level in [self.l2.as_ref(), self.l3.as_ref()].into_iter().flatten() {
            if let Some(hit) = level.get(key).await {
                self.l1.store(key, hit.price, hit.ts_secs);
                return Some(hit);
            }
        }
        None
    }
}
