//! ML prediction seam.
//!
//! The model itself is external; the detector only consumes this interface.
//! Calls carry a hard 50 ms timeout — a late prediction is a null prediction,
//! never a stall. Results cache for 1 s keyed by (chain, pair, minute
//! bucket); the scan loop pre-fetches predictions for the whole snapshot in
//! parallel.

use crate::stats::CoreStats;
use crate::types::Chain;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

/// Predicted near-term price direction for a pair on a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MlDirection {
    Up,
    Down,
    Neutral,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MlPrediction {
    pub direction: MlDirection,
    pub confidence: f64,
}

#[async_trait]
pub trait MlPredictor: Send + Sync {
    async fn predict(&self, chain: Chain, pair_key: &str) -> Option<MlPrediction>;
}

/// Predictor used when no model is wired up: always null.
pub struct NullPredictor;

#[async_trait]
impl MlPredictor for NullPredictor {
    async fn predict(&self, _chain: Chain, _pair_key: &str) -> Option<MlPrediction> {
        None
    }
}

type CacheKey = (Chain, String, u64);

struct CachedEntry {
    prediction: Option<MlPrediction>,
    cached_at_ms: u64,
}

/// Timeout + cache wrapper around a predictor.
pub struct CachedPredictor {
    inner: Arc<dyn MlPredictor>,
    cache: Mutex<lru::LruCache<CacheKey, CachedEntry>>,
    timeout_ms: u64,
    ttl_ms: u64,
    stats: Arc<CoreStats>,
}

impl CachedPredictor {
    pub fn new(inner: Arc<dyn MlPredictor>, timeout_ms: u64, stats: Arc<CoreStats>) -> Self {
        Self {
            inner,
            cache: Mutex::new(lru::LruCache::new(NonZeroUsize::new(2_048).unwrap())),
            timeout_ms,
            ttl_ms: 1_000,
            stats,
        }
    }

    fn bucket(now_ms: u64) -> u64 {
        now_ms / 60_000 // hour-minute bucket
    }

    /// Predict with the hard timeout; on timeout record it and return None
    /// (the caller proceeds without a prediction).
    pub async fn predict(&self, chain: Chain, pair_key: &str, now_ms: u64) -> Option<MlPrediction> {
        let key = (chain, pair_key.to_string(), Self::bucket(now_ms));
        {
            let mut cache = self.cache.lock();
            if let Some(entry) = cache.get(&key) {
                if now_ms.saturating_sub(entry.cached_at_ms) <= self.ttl_ms {
                    return entry.prediction;
                }
            }
        }

        let result = tokio::time::timeout(
            Duration::from_millis(self.timeout_ms),
            self.inner.predict(chain, pair_key),
        )
        .await;

        let prediction = match result {
            Ok(p) => p,
            Err(_) => {
                self.stats
                    .detection
                    .ml_timeouts
                    .fetch_add(1, Ordering::Relaxed);
                None
            }
        };
        self.cache.lock().put(
            key,
            CachedEntry {
                prediction,
                cached_at_ms: now_ms,
            },
        );
        prediction
    }

    /// Warm the cache for a set of pairs in parallel. Each call keeps its
    /// own hard timeout; stragglers are simply skipped.
    pub async fn prefetch(&self, targets: Vec<(Chain, String)>, now_ms: u64) {
        let futures: Vec<_> = targets
            .into_iter()
            .map(|(chain, key)| self.predict_owned(chain, key, now_ms))
            .collect();
        futures::future::join_all(futures).await;
    }

    async fn predict_owned(&self, chain: Chain, pair_key: String, now_ms: u64) {
        let _ = self.predict(chain, &pair_key, now_ms).await;
    }
}
