//! Four-level swap event filter.
//!
//! Cuts swap-event volume ~93% before anything touches the bus:
//!   1. Edge: watchlist membership + short-window duplicate short-circuit.
//!   2. Value: USD gate (default $10K) with a small sampling escape hatch.
//!   3. Local aggregation: rolling per-pair volume + per-sender MEV tracking.
//!   4. Intelligent publishing: whales immediately, aggregates on window
//!      close, MEV patterns at a slow cadence.
//!
//! The filter is owned by the ingestion task and never blocks reserve-update
//! processing.

use crate::config::FilterConfig;
use crate::types::{Chain, SwapEvent, VolumeAggregate, WhaleAlert};
use alloy::primitives::Address;
use lru::LruCache;
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::num::NonZeroUsize;

/// Swaps from one sender within this many blocks count toward the MEV
/// pattern threshold.
const MEV_WINDOW_BLOCKS: u64 = 2;
/// Same-sender swaps inside the window that flag a bot.
const MEV_SWAP_THRESHOLD: usize = 5;
/// value_usd ≥ 10× whale threshold marks a super-whale.
const SUPER_WHALE_FACTOR: f64 = 10.0;

/// Resolves a swap's USD value. Production backs this with quote-token
/// prices; tests use a constant.
pub trait ValueOracle: Send + Sync {
    fn swap_value_usd(&self, event: &SwapEvent) -> f64;
}

/// Oracle for the common case: both tokens priced against a static USD table
/// (stables and majors), falling back to a per-chain default.
pub struct StaticValueOracle {
    token_usd: HashMap<Address, f64>,
    decimals: HashMap<Address, u8>,
}

impl StaticValueOracle {
    pub fn new(token_usd: HashMap<Address, f64>, decimals: HashMap<Address, u8>) -> Self {
        Self { token_usd, decimals }
    }

    fn side_value(&self, token: &Address, amount: alloy::primitives::U256) -> Option<f64> {
        let usd = *self.token_usd.get(token)?;
        let decimals = *self.decimals.get(token).unwrap_or(&18);
        Some(crate::types::u256_to_f64(amount) / 10f64.powi(decimals as i32) * usd)
    }
}

impl ValueOracle for StaticValueOracle {
    fn swap_value_usd(&self, event: &SwapEvent) -> f64 {
        // Value the inbound side; fall back to the outbound side when the
        // inbound token is unpriced.
        let in_value = self
            .side_value(&event.token0, event.amount0_in)
            .or_else(|| self.side_value(&event.token1, event.amount1_in));
        let out_value = self
            .side_value(&event.token0, event.amount0_out)
            .or_else(|| self.side_value(&event.token1, event.amount1_out));
        in_value.or(out_value).unwrap_or(0.0)
    }
}

/// What the filter decided to publish for a processed event or window tick.
#[derive(Debug, Clone)]
pub enum FilterAction {
    /// Survivor of the funnel — goes to the (reduced) swap-events stream.
    PublishSwap(SwapEvent),
    /// value_usd ≥ whale threshold — published immediately.
    PublishWhale(WhaleAlert),
    /// A volume window closed.
    PublishVolume(VolumeAggregate),
    /// MEV bot pattern, published at the slow cadence.
    PublishMevPattern(MevPattern),
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MevPattern {
    pub chain: Chain,
    pub sender: Address,
    pub swap_count: usize,
    pub window_blocks: u64,
    pub last_seen_ms: u64,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FilterStats {
    pub seen: u64,
    pub rejected_watchlist: u64,
    pub rejected_duplicate: u64,
    pub rejected_value: u64,
    pub sampled_through: u64,
    pub passed: u64,
    pub whales: u64,
}

struct WindowAgg {
    window_start_ms: u64,
    swap_count: u64,
    volume_usd: f64,
}

pub struct SwapEventFilter {
    chain: Chain,
    config: FilterConfig,
    whale_threshold_usd: f64,
    /// fingerprint → first-seen ms.
    recent: LruCache<String, u64>,
    windows: HashMap<Address, WindowAgg>,
    /// sender → recent (block, ms) observations.
    senders: HashMap<Address, VecDeque<(u64, u64)>>,
    mev_flagged: HashMap<Address, usize>,
    mev_last_published_ms: u64,
    pub stats: FilterStats,
}

impl SwapEventFilter {
    pub fn new(chain: Chain, config: FilterConfig, whale_threshold_usd: f64) -> Self {
        Self {
            chain,
            config,
            whale_threshold_usd,
            recent: LruCache::new(NonZeroUsize::new(4_096).unwrap()),
            windows: HashMap::new(),
            senders: HashMap::new(),
            mev_flagged: HashMap::new(),
            mev_last_published_ms: 0,
            stats: FilterStats::default(),
        }
    }

    /// Run one event through levels 1-4. `in_watchlist` is the edge check
    /// (the pair registry lookup belongs to the caller, which owns it).
    pub fn process(
        &mut self,
        mut event: SwapEvent,
        in_watchlist: bool,
        oracle: &dyn ValueOracle,
        now_ms: u64,
    ) -> Vec<FilterAction> {
        self.stats.seen += 1;

        // Level 1: edge.
        if !in_watchlist {
            self.stats.rejected_watchlist += 1;
            return Vec::new();
        }
        let fingerprint = event.fingerprint();
        if let Some(first_seen) = self.recent.get(&fingerprint) {
            if now_ms.saturating_sub(*first_seen) < self.config.dedupe_window_ms {
                self.stats.rejected_duplicate += 1;
                return Vec::new();
            }
        }
        self.recent.put(fingerprint, now_ms);

        // Level 2: value (decode once, gate or sample through).
        event.value_usd = oracle.swap_value_usd(&event);
        if event.value_usd < self.config.min_amount_usd {
            if rand::thread_rng().gen::<f64>() >= self.config.sampling_rate {
                self.stats.rejected_value += 1;
                return Vec::new();
            }
            self.stats.sampled_through += 1;
        }
        self.stats.passed += 1;

        // Level 3: local aggregation — no publish per swap.
        let mut actions = Vec::new();
        actions.extend(self.aggregate(&event, now_ms));
        self.track_sender(&event);

        // Level 4: intelligent publishing.
        if event.value_usd >= self.whale_threshold_usd {
            self.stats.whales += 1;
            actions.push(FilterAction::PublishWhale(WhaleAlert {
                chain: event.chain,
                dex: event.dex,
                pair_address: event.pair_address,
                token0: event.token0,
                token1: event.token1,
                value_usd: event.value_usd,
                direction: event.direction(),
                super_whale: event.value_usd >= self.whale_threshold_usd * SUPER_WHALE_FACTOR,
                tx_hash: event.tx_hash.clone(),
                timestamp_ms: event.timestamp_ms,
            }));
        }
        actions.push(FilterAction::PublishSwap(event));
        actions
    }

    /// Accumulate into the pair's rolling window; close it when it expires.
    fn aggregate(&mut self, event: &SwapEvent, now_ms: u64) -> Option<FilterAction> {
        let window = self.windows.entry(event.pair_address).or_insert(WindowAgg {
            window_start_ms: now_ms,
            swap_count: 0,
            volume_usd: 0.0,
        });
        let mut closed = None;
        if now_ms.saturating_sub(window.window_start_ms) >= self.config.aggregation_window_ms {
            closed = Some(FilterAction::PublishVolume(VolumeAggregate {
                chain: self.chain,
                pair_address: event.pair_address,
                window_start_ms: window.window_start_ms,
                window_end_ms: now_ms,
                swap_count: window.swap_count,
                volume_usd: window.volume_usd,
            }));
            window.window_start_ms = now_ms;
            window.swap_count = 0;
            window.volume_usd = 0.0;
        }
        window.swap_count += 1;
        window.volume_usd += event.value_usd;
        closed
    }

    /// Track per-sender activity for MEV bot detection: ≥5 swaps from the
    /// same sender within 2 blocks.
    fn track_sender(&mut self, event: &SwapEvent) {
        let history = self.senders.entry(event.sender).or_default();
        history.push_back((event.block_number, event.timestamp_ms));
        while let Some((block, _)) = history.front() {
            if event.block_number.saturating_sub(*block) > MEV_WINDOW_BLOCKS {
                history.pop_front();
            } else {
                break;
            }
        }
        if history.len() >= MEV_SWAP_THRESHOLD {
            self.mev_flagged.insert(event.sender, history.len());
        }
    }

    /// Time-driven publishing: closes expired volume windows and, at the MEV
    /// cadence, flushes flagged senders. Call from the owner's interval tick.
    pub fn poll(&mut self, now_ms: u64) -> Vec<FilterAction> {
        let mut actions = Vec::new();

        let expired: Vec<Address> = self
            .windows
            .iter()
            .filter(|(_, w)| {
                w.swap_count > 0
                    && now_ms.saturating_sub(w.window_start_ms) >= self.config.aggregation_window_ms
            })
            .map(|(pair, _)| *pair)
            .collect();
        for pair in expired {
            if let Some(window) = self.windows.get_mut(&pair) {
                actions.push(FilterAction::PublishVolume(VolumeAggregate {
                    chain: self.chain,
                    pair_address: pair,
                    window_start_ms: window.window_start_ms,
                    window_end_ms: now_ms,
                    swap_count: window.swap_count,
                    volume_usd: window.volume_usd,
                }));
                window.window_start_ms = now_ms;
                window.swap_count = 0;
                window.volume_usd = 0.0;
            }
        }

        if !self.mev_flagged.is_empty()
            && now_ms.saturating_sub(self.mev_last_published_ms) >= self.config.mev_publish_cadence_ms
        {
            self.mev_last_published_ms = now_ms;
            for (sender, count) in self.mev_flagged.drain() {
                actions.push(FilterAction::PublishMevPattern(MevPattern {
                    chain: self.chain,
                    sender,
                    swap_count: count,
                    window_blocks: MEV_WINDOW_BLOCKS,
                    last_seen_ms: now_ms,
                }));
            }
        }
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::U256;

    struct FixedOracle(f64);

    impl ValueOracle for FixedOracle {
        fn swap_value_usd(&self, _event: &SwapEvent) -> f64 {
            self.0
        }
    }

    fn config() -> FilterConfig {
        FilterConfig {
            min_amount_usd: 10_000.0,
            sampling_rate: 0.0, // deterministic: nothing samples through
            aggregation_window_ms: 5_000,
            mev_publish_cadence_ms: 30_000,
            dedupe_window_ms: 3_000,
        }
    }

    fn swap(tx: &str, log_index: u64, block: u64, sender_byte: u8, ts: u64) -> SwapEvent {
        SwapEvent {
            chain: Chain::Polygon,
            dex: DexName::QuickSwap,
            pair_address: Address::repeat_byte(0x10),
            token0: Address::repeat_byte(0x01),
            token1: Address::repeat_byte(0x02),
            sender: Address::repeat_byte(sender_byte),
            amount0_in: U256::from(1),
            amount1_in: U256::ZERO,
            amount0_out: U256::ZERO,
            amount1_out: U256::from(1),
            value_usd: 0.0,
            tx_hash: tx.to_string(),
            log_index,
            block_number: block,
            timestamp_ms: ts,
        }
    }

    use crate::types::DexName;

    #[test]
    fn test_watchlist_rejection() {
        let mut filter = SwapEventFilter::new(Chain::Polygon, config(), 50_000.0);
        let actions = filter.process(swap("0xa", 0, 1, 1, 0), false, &FixedOracle(1e6), 0);
        assert!(actions.is_empty());
        assert_eq!(filter.stats.rejected_watchlist, 1);
    }

    #[test]
    fn test_duplicate_short_circuit() {
        let mut filter = SwapEventFilter::new(Chain::Polygon, config(), 50_000.0);
        let oracle = FixedOracle(20_000.0);
        let first = filter.process(swap("0xa", 0, 1, 1, 0), true, &oracle, 0);
        assert!(!first.is_empty());
        // Same (pair, tx, log index) inside the window → dropped.
        let dup = filter.process(swap("0xa", 0, 1, 1, 100), true, &oracle, 100);
        assert!(dup.is_empty());
        assert_eq!(filter.stats.rejected_duplicate, 1);
        // Outside the window the fingerprint is allowed again.
        let later = filter.process(swap("0xa", 0, 1, 1, 5_000), true, &oracle, 5_000);
        assert!(!later.is_empty());
    }

    #[test]
    fn test_value_gate() {
        let mut filter = SwapEventFilter::new(Chain::Polygon, config(), 50_000.0);
        let actions = filter.process(swap("0xa", 0, 1, 1, 0), true, &FixedOracle(500.0), 0);
        assert!(actions.is_empty());
        assert_eq!(filter.stats.rejected_value, 1);

        let actions = filter.process(swap("0xb", 0, 1, 1, 0), true, &FixedOracle(10_000.0), 0);
        assert_eq!(actions.len(), 1); // swap publish only, no whale
        assert!(matches!(actions[0], FilterAction::PublishSwap(_)));
    }

    #[test]
    fn test_sampling_escape_hatch() {
        let mut cfg = config();
        cfg.sampling_rate = 1.0; // every small swap samples through
        let mut filter = SwapEventFilter::new(Chain::Polygon, cfg, 50_000.0);
        let actions = filter.process(swap("0xa", 0, 1, 1, 0), true, &FixedOracle(5.0), 0);
        assert!(!actions.is_empty());
        assert_eq!(filter.stats.sampled_through, 1);
    }

    #[test]
    fn test_whale_published_immediately() {
        let mut filter = SwapEventFilter::new(Chain::Polygon, config(), 50_000.0);
        let actions = filter.process(swap("0xa", 0, 1, 1, 0), true, &FixedOracle(60_000.0), 0);
        let whale = actions
            .iter()
            .find_map(|a| match a {
                FilterAction::PublishWhale(w) => Some(w),
                _ => None,
            })
            .expect("whale expected");
        assert!(!whale.super_whale);
        assert_eq!(whale.value_usd, 60_000.0);

        // 10× threshold → super whale.
        let actions = filter.process(swap("0xb", 0, 1, 1, 0), true, &FixedOracle(500_000.0), 0);
        let whale = actions
            .iter()
            .find_map(|a| match a {
                FilterAction::PublishWhale(w) => Some(w),
                _ => None,
            })
            .unwrap();
        assert!(whale.super_whale);
    }

    #[test]
    fn test_volume_window_close_on_poll() {
        let mut filter = SwapEventFilter::new(Chain::Polygon, config(), 50_000.0);
        let oracle = FixedOracle(20_000.0);
        filter.process(swap("0xa", 0, 1, 1, 0), true, &oracle, 0);
        filter.process(swap("0xb", 0, 1, 1, 10), true, &oracle, 10);

        assert!(filter.poll(4_999).is_empty());
        let actions = filter.poll(5_000);
        assert_eq!(actions.len(), 1);
        match &actions[0] {
            FilterAction::PublishVolume(v) => {
                assert_eq!(v.swap_count, 2);
                assert!((v.volume_usd - 40_000.0).abs() < 1e-9);
            }
            other => panic!("wrong action: {:?}", other),
        }
    }

    #[test]
    fn test_mev_pattern_detection_and_cadence() {
        let mut filter = SwapEventFilter::new(Chain::Polygon, config(), 50_000.0);
        let oracle = FixedOracle(20_000.0);
        // 5 swaps from the same sender across 2 blocks.
        for i in 0..5u64 {
            filter.process(
                swap(&format!("0x{}", i), i, 100 + (i % 2), 9, i * 10),
                true,
                &oracle,
                i * 10,
            );
        }
        // Inside the cadence: nothing published yet at t=0 baseline... the
        // first poll after flagging publishes (last published = 0, now ≥ 30s).
        let actions = filter.poll(30_000);
        let pattern = actions
            .iter()
            .find_map(|a| match a {
                FilterAction::PublishMevPattern(p) => Some(p),
                _ => None,
            })
            .expect("mev pattern expected");
        assert!(pattern.swap_count >= 5);
        assert_eq!(pattern.sender, Address::repeat_byte(9));

        // Cadence respected: immediately after, nothing more to publish.
        assert!(filter
            .poll(31_000)
            .iter()
            .all(|a| !matches!(a, FilterAction::PublishMevPattern(_))));
    }

    #[test]
    fn test_distant_blocks_do_not_flag_mev() {
        let mut filter = SwapEventFilter::new(Chain::Polygon, config(), 50_000.0);
        let oracle = FixedOracle(20_000.0);
        for i in 0..5u64 {
            // 10 blocks apart — window keeps only the latest.
            filter.process(
                swap(&format!("0x{}", i), i, 100 + i * 10, 9, i),
                true,
                &oracle,
                i,
            );
        }
        assert!(filter
            .poll(30_000)
            .iter()
            .all(|a| !matches!(a, FilterAction::PublishMevPattern(_))));
    }
}
