//! L1 price matrix: fixed-capacity shared-memory slots for sub-microsecond
//! price reads.
//!
//! Each slot is two independent atomics: price bits (u64) and last-update
//! epoch-seconds (u32). The slot is deliberately NOT a compound record — a
//! reader racing a writer may see the previous price with the new timestamp,
//! but each field is individually consistent and freshness is judged solely
//! by the timestamp. ~16 bytes per slot × 10 000 slots ≈ 160 KB.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use tracing::debug;

pub const DEFAULT_CAPACITY: usize = 10_000;
pub const DEFAULT_STALENESS_SECS: u32 = 60;

struct Slot {
    price_bits: AtomicU64,
    ts_secs: AtomicU32,
}

impl Slot {
    fn empty() -> Self {
        Self {
            price_bits: AtomicU64::new(0),
            ts_secs: AtomicU32::new(0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PriceRead {
    Fresh(f64),
    /// Value present but older than the staleness window.
    Stale(f64),
    Missing,
}

impl PriceRead {
    pub fn fresh(&self) -> Option<f64> {
        match self {
            PriceRead::Fresh(p) => Some(*p),
            _ => None,
        }
    }
}

/// Lock-free for readers; writers allocate slots through the key registry
/// (entry-level CAS, so concurrent writers of a new key agree on one slot)
/// and store both fields with plain atomic writes. When the matrix is full
/// the least-recently-written key's slot is reused.
pub struct PriceMatrix {
    slots: Vec<Slot>,
    registry: DashMap<String, usize>,
    next_slot: AtomicUsize,
    staleness_secs: u32,
    /// Write-order LRU of keys, consulted only on eviction. Approximate by
    /// design: readers never touch it.
    lru: Mutex<lru::LruCache<String, ()>>,
}

impl PriceMatrix {
    pub fn new(capacity: usize, staleness_secs: u32) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: (0..capacity).map(|_| Slot::empty()).collect(),
            registry: DashMap::with_capacity(capacity),
            next_slot: AtomicUsize::new(0),
            staleness_secs,
            lru: Mutex::new(lru::LruCache::new(NonZeroUsize::new(capacity).unwrap())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_STALENESS_SECS)
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    fn slot_for(&self, key: &str) -> usize {
        if let Some(idx) = self.registry.get(key) {
            return *idx;
        }
        // Entry API serializes concurrent allocators of the same key.
        let idx = *self
            .registry
            .entry(key.to_string())
            .or_insert_with(|| self.allocate_slot(key));
        idx
    }

    fn allocate_slot(&self, key: &str) -> usize {
        let idx = self.next_slot.fetch_add(1, Ordering::SeqCst);
        if idx < self.slots.len() {
            self.lru.lock().put(key.to_string(), ());
            return idx;
        }
        // Full: reuse the least-recently-written key's slot.
        self.next_slot.store(self.slots.len(), Ordering::SeqCst);
        let mut lru = self.lru.lock();
        let evicted = lru.pop_lru().map(|(k, _)| k);
        lru.put(key.to_string(), ());
        drop(lru);
        if let Some(old_key) = evicted {
            if let Some((_, old_idx)) = self.registry.remove(&old_key) {
                debug!("price matrix full: evicting {} for {}", old_key, key);
                return old_idx;
            }
        }
        // Registry and LRU disagree (eviction race) — fall back to slot 0.
        0
    }

    /// Write price and timestamp for a key. Two independent atomic stores.
    pub fn store(&self, key: &str, price: f64, ts_secs: u32) {
        let idx = self.slot_for(key);
        let slot = &self.slots[idx];
        slot.price_bits.store(price.to_bits(), Ordering::Release);
        slot.ts_secs.store(ts_secs, Ordering::Release);
        self.lru.lock().promote(key);
    }

    /// Read a key's price, judging freshness only by the timestamp field.
    pub fn read(&self, key: &str, now_secs: u32) -> PriceRead {
        let Some(idx) = self.registry.get(key).map(|r| *r) else {
            return PriceRead::Missing;
        };
        let slot = &self.slots[idx];
        let ts = slot.ts_secs.load(Ordering::Acquire);
        if ts == 0 {
            return PriceRead::Missing;
        }
        let price = f64::from_bits(slot.price_bits.load(Ordering::Acquire));
        if now_secs.saturating_sub(ts) > self.staleness_secs {
            PriceRead::Stale(price)
        } else {
            PriceRead::Fresh(price)
        }
    }
}
