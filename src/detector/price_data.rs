//! Cross-chain price state: chain → dex → normalizedPair → latest update.
//!
//! Each incoming update replaces the prior value. Every N updates a cleanup
//! pass drops entries older than the retention cutoff (memory bound — this
//! is NOT the detection staleness gate, which is much tighter and lives in
//! the scan loop). Snapshots are indexed by pair so scanning is
//! O(pairs × points²) instead of O(chains² · dexes² · pairs).

use crate::types::{Chain, DexName, PriceUpdate};
use alloy::primitives::Address;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Updates between cleanup passes.
const CLEANUP_EVERY: u64 = 1_000;

/// One observed price for a pair on some (chain, dex).
#[derive(Debug, Clone, PartialEq)]
pub struct PricePoint {
    pub chain: Chain,
    pub dex: DexName,
    pub token0: Address,
    pub token1: Address,
    /// Quote-side (token1) decimals, for notional sizing.
    pub decimals1: u8,
    pub price: f64,
    pub timestamp_ms: u64,
}

/// pair key → all points currently known for it.
pub type IndexedSnapshot = HashMap<String, Vec<PricePoint>>;

pub struct PriceDataManager {
    /// chain → (dex → (pair key → update)).
    prices: DashMap<Chain, HashMap<DexName, HashMap<String, PriceUpdate>>>,
    retention_cutoff_ms: u64,
    updates_seen: AtomicU64,
}

impl PriceDataManager {
    pub fn new(retention_cutoff_ms: u64) -> Self {
        Self {
            prices: DashMap::new(),
            retention_cutoff_ms,
            updates_seen: AtomicU64::new(0),
        }
    }

    /// Replace the prior value for (chain, dex, pair).
    pub fn on_update(&self, update: PriceUpdate) {
        let key = update.token_key();
        self.prices
            .entry(update.chain)
            .or_default()
            .entry(update.dex)
            .or_default()
            .insert(key, update);

        let seen = self.updates_seen.fetch_add(1, Ordering::Relaxed) + 1;
        if seen % CLEANUP_EVERY == 0 {
            self.cleanup(crate::types::now_ms());
        }
    }

    /// Drop entries older than the retention cutoff.
    pub fn cleanup(&self, now_ms: u64) {
        let cutoff = self.retention_cutoff_ms;
        let mut dropped = 0usize;
        for mut chain_entry in self.prices.iter_mut() {
            for dex_map in chain_entry.value_mut().values_mut() {
                let before = dex_map.len();
                dex_map.retain(|_, u| now_ms.saturating_sub(u.timestamp_ms) <= cutoff);
                dropped += before - dex_map.len();
            }
        }
        if dropped > 0 {
            debug!("price data cleanup: dropped {} expired entries", dropped);
        }
    }

    /// Build the indexed snapshot from current state.
    pub fn snapshot(&self) -> IndexedSnapshot {
        let mut out: IndexedSnapshot = HashMap::new();
        for chain_entry in self.prices.iter() {
            let chain = *chain_entry.key();
            for (dex, pairs) in chain_entry.value() {
                for (key, update) in pairs {
                    out.entry(key.clone()).or_default().push(PricePoint {
                        chain,
                        dex: *dex,
                        token0: update.token0,
                        token1: update.token1,
                        decimals1: update.decimals1,
                        price: update.mid_price,
                        timestamp_ms: update.timestamp_ms,
                    });
                }
            }
        }
        out
    }

    pub fn point_count(&self) -> usize {
        self.prices
            .iter()
            .map(|c| c.value().values().map(|m| m.len()).sum::<usize>())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::U256;

    fn update(chain: Chain, dex: DexName, price: f64, ts_ms: u64) -> PriceUpdate {
        PriceUpdate {
            chain,
            dex,
            pair_address: Address::repeat_byte(0x10),
            token0: Address::repeat_byte(0x01),
            token1: Address::repeat_byte(0x02),
            decimals0: 18,
            decimals1: 6,
            reserve0: U256::from(1u64),
            reserve1: U256::from(1u64),
            mid_price: price,
            block_number: 1,
            timestamp_ms: ts_ms,
            sequence: 1,
        }
    }

    #[test]
    fn test_replace_prior_value() {
        let data = PriceDataManager::new(300_000);
        data.on_update(update(Chain::Ethereum, DexName::UniswapV3, 2_000.0, 100));
        data.on_update(update(Chain::Ethereum, DexName::UniswapV3, 2_010.0, 200));
        assert_eq!(data.point_count(), 1);

        let snap = data.snapshot();
        let points = snap.values().next().unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].price, 2_010.0);
    }

    #[test]
    fn test_snapshot_indexes_by_pair_across_chains() {
        let data = PriceDataManager::new(300_000);
        data.on_update(update(Chain::Ethereum, DexName::UniswapV3, 2_000.0, 100));
        data.on_update(update(Chain::Arbitrum, DexName::SushiSwap, 2_050.0, 100));
        data.on_update(update(Chain::Base, DexName::Aerodrome, 2_040.0, 100));

        let snap = data.snapshot();
        assert_eq!(snap.len(), 1, "same tokens index to one pair key");
        let points = snap.values().next().unwrap();
        assert_eq!(points.len(), 3);
    }

    #[test]
    fn test_cleanup_drops_old_entries() {
        let data = PriceDataManager::new(300_000);
        data.on_update(update(Chain::Ethereum, DexName::UniswapV3, 2_000.0, 1_000));
        data.on_update(update(Chain::Arbitrum, DexName::SushiSwap, 2_050.0, 500_000));
        data.cleanup(600_000);
        // Ethereum point is 599s old → dropped; Arbitrum point kept.
        assert_eq!(data.point_count(), 1);
        let snap = data.snapshot();
        assert_eq!(snap.values().next().unwrap()[0].chain, Chain::Arbitrum);
    }
}
