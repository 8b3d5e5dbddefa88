//! Per-chain detector.
//!
//! Driven by decoded reserve updates: overwrite the pair's reserves, refresh
//! the L1 matrix, then scan every same-token pair on the chain for two-leg
//! spreads (same DEX = intra-DEX fee-tier gaps, different DEX = cross-DEX).
//! Triangular cycles through the updated pair are scanned as well; the
//! ingestion wiring offloads that heavier scan to a blocking worker when one
//! is available.
//!
//! Pairs register lazily from factory PairCreated events — subscriptions are
//! factory-level, so the subscription count stays flat as pairs grow.

use crate::cache::{GasPriceCache, PairKeyCache, PriceMatrix, RecentPriceStore};
use crate::config::ChainConfig;
use crate::detector::slippage;
use crate::detector::TokenPricer;
use crate::stats::CoreStats;
use crate::types::{
    f64_to_raw, now_ms, u256_to_f64, Chain, DexName, Opportunity, OpportunityKind, PriceUpdate,
    SwapStep, TokenPair,
};
use alloy::primitives::{Address, U256};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Fraction of the constraining reserve used as trade size.
const TRADE_SIZE_FRACTION: f64 = 0.01;
/// Neighbor cap for the triangular scan, bounds the per-update fan-out.
const TRIANGULAR_NEIGHBOR_CAP: usize = 16;

/// Pair indices for one chain. Single writer (the owning chain's ingestion),
/// many readers; reads take per-shard locks only long enough to clone a
/// snapshot, so detection never races a half-written reserve pair.
pub struct PairRegistry {
    by_address: DashMap<Address, TokenPair>,
    /// normalized token key → pair addresses sharing those tokens.
    by_tokens: DashMap<String, Vec<Address>>,
    /// token address → pair addresses containing it (triangular adjacency).
    by_token: DashMap<Address, Vec<Address>>,
    /// per-pair monotone sequence numbers.
    sequences: DashMap<Address, u64>,
}

impl PairRegistry {
    pub fn new() -> Self {
        Self {
            by_address: DashMap::new(),
            by_tokens: DashMap::new(),
            by_token: DashMap::new(),
            sequences: DashMap::new(),
        }
    }

    /// Register a pair. Identity is immutable: a second registration of the
    /// same address is ignored.
    pub fn register(&self, pair: TokenPair) -> bool {
        if self.by_address.contains_key(&pair.pair_address) {
            return false;
        }
        let key = pair.token_key();
        let address = pair.pair_address;
        let (token0, token1) = (pair.token0, pair.token1);
        self.by_address.insert(address, pair);
        self.by_tokens.entry(key).or_default().push(address);
        self.by_token.entry(token0).or_default().push(address);
        self.by_token.entry(token1).or_default().push(address);
        true
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.by_address.contains_key(address)
    }

    pub fn len(&self) -> usize {
        self.by_address.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_address.is_empty()
    }

    pub fn snapshot(&self, address: &Address) -> Option<TokenPair> {
        self.by_address.get(address).map(|p| p.clone())
    }

    /// Snapshots of every pair sharing the token key.
    pub fn same_token_pairs(&self, key: &str) -> Vec<TokenPair> {
        let Some(addresses) = self.by_tokens.get(key) else {
            return Vec::new();
        };
        addresses
            .iter()
            .filter_map(|a| self.snapshot(a))
            .collect()
    }

    pub fn pairs_with_token(&self, token: &Address) -> Vec<Address> {
        self.by_token
            .get(token)
            .map(|v| v.clone())
            .unwrap_or_default()
    }

    /// Overwrite reserves (only the owning ingestion calls this) and return
    /// a post-update snapshot plus the bumped sequence number.
    pub fn update_reserves(
        &self,
        address: &Address,
        reserve0: U256,
        reserve1: U256,
        block_number: u64,
        ts_ms: u64,
    ) -> Option<(TokenPair, u64)> {
        let mut pair = self.by_address.get_mut(address)?;
        pair.reserve0 = reserve0;
        pair.reserve1 = reserve1;
        pair.last_update_block = block_number;
        pair.last_update_ts_ms = ts_ms;
        let snapshot = pair.clone();
        drop(pair);
        let mut seq = self.sequences.entry(*address).or_insert(0);
        *seq += 1;
        Some((snapshot, *seq))
    }
}

impl Default for PairRegistry {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ChainDetector {
    chain: Chain,
    min_profit_usd: f64,
    min_profit_pct: f64,
    confidence: f64,
    expiry_ms: u64,
    gas_estimate_units: u64,
    /// factory address → DEX, for lazy registration.
    factories: HashMap<Address, DexName>,
    /// DEX → router, for path construction.
    routers: HashMap<DexName, Address>,
    registry: PairRegistry,
    matrix: Arc<PriceMatrix>,
    /// L2: recent-price history, kept warm alongside the matrix.
    recent: Arc<RecentPriceStore>,
    gas: Arc<GasPriceCache>,
    pricer: Arc<dyn TokenPricer>,
    key_cache: Arc<PairKeyCache>,
    stats: Arc<CoreStats>,
    is_stopping: AtomicBool,
}

impl ChainDetector {
    pub fn new(
        config: &ChainConfig,
        matrix: Arc<PriceMatrix>,
        recent: Arc<RecentPriceStore>,
        gas: Arc<GasPriceCache>,
        pricer: Arc<dyn TokenPricer>,
        key_cache: Arc<PairKeyCache>,
        stats: Arc<CoreStats>,
    ) -> Self {
        let factories = config
            .dexes
            .iter()
            .map(|d| (d.factory, d.dex))
            .collect::<HashMap<_, _>>();
        let routers = config
            .dexes
            .iter()
            .map(|d| (d.dex, d.router))
            .collect::<HashMap<_, _>>();
        Self {
            chain: config.chain,
            min_profit_usd: config.min_profit_usd,
            min_profit_pct: config.min_profit_pct,
            confidence: config.confidence,
            expiry_ms: config.expiry_ms,
            gas_estimate_units: config.gas_estimate_units,
            factories,
            routers,
            registry: PairRegistry::new(),
            matrix,
            recent,
            gas,
            pricer,
            key_cache,
            stats,
            is_stopping: AtomicBool::new(false),
        }
    }

    pub fn chain(&self) -> Chain {
        self.chain
    }

    pub fn registry(&self) -> &PairRegistry {
        &self.registry
    }

    /// Cooperative stop: new dispatches are ignored from here on.
    pub fn stop(&self) {
        self.is_stopping.store(true, Ordering::SeqCst);
    }

    pub fn is_stopping(&self) -> bool {
        self.is_stopping.load(Ordering::SeqCst)
    }

    pub fn register_pair(&self, pair: TokenPair) -> bool {
        let registered = self.registry.register(pair);
        if registered {
            self.stats
                .ingestion
                .pairs_registered
                .fetch_add(1, Ordering::Relaxed);
        }
        registered
    }

    /// Lazy registration from a factory PairCreated event. Token decimals
    /// are unknown until the metadata backfill runs; 18 is the safe default
    /// for price *comparison* since both sides of a spread share the pair.
    pub fn register_from_factory(
        &self,
        factory: &Address,
        token0: Address,
        token1: Address,
        pair: Address,
        block_number: u64,
    ) -> bool {
        let Some(dex) = self.factories.get(factory).copied() else {
            return false;
        };
        let registered = self.register_pair(TokenPair {
            pair_address: pair,
            chain: self.chain,
            dex,
            token0,
            token1,
            decimals0: 18,
            decimals1: 18,
            reserve0: U256::ZERO,
            reserve1: U256::ZERO,
            last_update_block: block_number,
            last_update_ts_ms: 0,
        });
        if registered {
            info!(
                "{}: new {} pair {:?} registered from factory",
                self.chain, dex, pair
            );
        }
        registered
    }

    /// Handle a decoded Sync: overwrite reserves, refresh the L1 matrix, and
    /// scan for two-leg opportunities. Returns None for unknown pairs or
    /// after stop().
    pub fn on_reserve_sync(
        &self,
        pair_address: &Address,
        reserve0: U256,
        reserve1: U256,
        block_number: u64,
    ) -> Option<(PriceUpdate, Vec<Opportunity>)> {
        if self.is_stopping() {
            return None;
        }
        let ts_ms = now_ms();
        let (updated, sequence) =
            self.registry
                .update_reserves(pair_address, reserve0, reserve1, block_number, ts_ms)?;
        self.stats
            .detection
            .reserve_syncs
            .fetch_add(1, Ordering::Relaxed);

        let mid_price = updated.mid_price();
        let pair_key = self.key_cache.key(updated.token0, updated.token1);
        let matrix_key = format!("{}:{}:{}", self.chain, updated.dex, pair_key);
        self.matrix
            .store(&matrix_key, mid_price, (ts_ms / 1_000) as u32);
        self.recent
            .record(&matrix_key, mid_price, (ts_ms / 1_000) as u32);

        let update = PriceUpdate {
            chain: self.chain,
            dex: updated.dex,
            pair_address: *pair_address,
            token0: updated.token0,
            token1: updated.token1,
            decimals0: updated.decimals0,
            decimals1: updated.decimals1,
            reserve0,
            reserve1,
            mid_price,
            block_number,
            timestamp_ms: ts_ms,
            sequence,
        };

        let opportunities = self.scan_two_leg(&updated, &pair_key, ts_ms);
        Some((update, opportunities))
    }

    /// Two-leg scan: compare the updated pair against every other pair with
    /// the same tokens. The updated snapshot and each counterpart snapshot
    /// are local copies — a concurrent reserve write just means the next
    /// Sync triggers another scan.
    fn scan_two_leg(&self, updated: &TokenPair, pair_key: &str, ts_ms: u64) -> Vec<Opportunity> {
        let mut out = Vec::new();
        if updated.mid_price() <= 0.0 {
            return out;
        }
        for other in self.registry.same_token_pairs(pair_key) {
            if other.pair_address == updated.pair_address {
                continue;
            }
            if other.mid_price() <= 0.0 {
                continue;
            }
            let (buy, sell) = if updated.mid_price() <= other.mid_price() {
                (updated, &other)
            } else {
                (&other, updated)
            };
            if let Some(opp) = self.evaluate_route(buy, sell, ts_ms) {
                out.push(opp);
            }
        }
        out
    }

    /// Evaluate one buy-cheap/sell-expensive route. The cycle starts and
    /// ends in token1: token1 → token0 on the low-mid pool, token0 → token1
    /// on the high-mid pool.
    fn evaluate_route(
        &self,
        buy: &TokenPair,
        sell: &TokenPair,
        ts_ms: u64,
    ) -> Option<Opportunity> {
        let buy_mid = buy.mid_price();
        let sell_mid = sell.mid_price();
        if buy_mid <= 0.0 || sell_mid <= buy_mid {
            return None;
        }

        let token1_usd = self.pricer.usd_price(self.chain, &buy.token1)?;
        let decimals1 = buy.decimals1 as i32;
        let buy_reserve1 = u256_to_f64(buy.reserve1) / 10f64.powi(decimals1);
        let sell_reserve1 = u256_to_f64(sell.reserve1) / 10f64.powi(decimals1);
        if buy_reserve1 <= 0.0 || sell_reserve1 <= 0.0 {
            return None;
        }

        // Size against the thinner side.
        let amount_in = buy_reserve1.min(sell_reserve1) * TRADE_SIZE_FRACTION;
        let amount_in_usd = amount_in * token1_usd;

        // Legs at mid with per-DEX fees; execution drift, price impact, and
        // thin liquidity all enter through the slippage term below.
        let fee_keep = (1.0 - buy.dex.fee_fraction()) * (1.0 - sell.dex.fee_fraction());
        let amount_out = amount_in * (sell_mid / buy_mid) * fee_keep;
        let gross_profit_usd = (amount_out - amount_in) * token1_usd;

        let min_liquidity_usd = 2.0 * buy_reserve1.min(sell_reserve1) * token1_usd;
        let slip = slippage::dynamic_slippage(
            amount_in,
            buy_reserve1,
            sell_reserve1,
            min_liquidity_usd,
        );
        let gas_usd = self
            .gas
            .estimate_gas_cost_usd(self.chain, self.gas_estimate_units);
        let net_profit_usd = gross_profit_usd - slip * amount_in_usd - gas_usd;
        let profit_pct = if amount_in_usd > 0.0 {
            net_profit_usd / amount_in_usd * 100.0
        } else {
            return None;
        };

        if net_profit_usd < self.min_profit_usd || profit_pct < self.min_profit_pct {
            debug!(
                "{}: route {}→{} below threshold (net ${:.2}, {:.3}%)",
                self.chain, buy.dex, sell.dex, net_profit_usd, profit_pct
            );
            return None;
        }

        let kind = if buy.dex == sell.dex {
            OpportunityKind::IntraDex
        } else {
            OpportunityKind::CrossDex
        };
        let amount_in_raw = f64_to_raw(amount_in, buy.decimals1);
        let amount_out_raw = f64_to_raw(amount_out, buy.decimals1);
        let path = self.build_two_leg_path(buy, sell, amount_in_raw);

        info!(
            "{}: {} opportunity {} | buy {} @ {:.6} | sell {} @ {:.6} | net ${:.2} ({:.2}%)",
            self.chain, kind, buy.token_key(), buy.dex, buy_mid, sell.dex, sell_mid,
            net_profit_usd, profit_pct
        );

        Some(Opportunity {
            id: Opportunity::fingerprint(
                kind,
                self.chain,
                self.chain,
                buy.dex,
                sell.dex,
                &buy.token1,
                &buy.token1,
                amount_in_usd,
                ts_ms,
            ),
            kind,
            buy_chain: self.chain,
            sell_chain: self.chain,
            buy_dex: buy.dex,
            sell_dex: sell.dex,
            token_in: buy.token1,
            token_out: buy.token1,
            path,
            amount_in: amount_in_raw,
            expected_amount_out: amount_out_raw,
            expected_profit_usd: net_profit_usd,
            profit_percentage: profit_pct,
            gas_estimate_usd: gas_usd,
            confidence: self.confidence,
            whale_triggered: false,
            ml_confidence_boost: 1.0,
            flash_protocol: None,
            detected_at_ms: ts_ms,
            expires_at_ms: ts_ms + self.expiry_ms,
        })
    }

    fn build_two_leg_path(
        &self,
        buy: &TokenPair,
        sell: &TokenPair,
        amount_in: U256,
    ) -> Vec<SwapStep> {
        let buy_router = self.routers.get(&buy.dex).copied().unwrap_or(Address::ZERO);
        let sell_router = self.routers.get(&sell.dex).copied().unwrap_or(Address::ZERO);
        vec![
            SwapStep {
                router: buy_router,
                token_in: buy.token1,
                token_out: buy.token0,
                amount_in,
                data: Vec::new(),
            },
            SwapStep {
                router: sell_router,
                token_in: sell.token0,
                token_out: sell.token1,
                amount_in: U256::ZERO, // chained from the previous leg
                data: Vec::new(),
            },
        ]
    }

    /// Triangular scan through the updated pair: cycles a → b → c → a where
    /// (a, b) is the updated pair. This is the heavier path — callers run it
    /// on a worker when one is available (see ingestion wiring).
    pub fn scan_triangular(&self, pair_address: &Address) -> Vec<Opportunity> {
        if self.is_stopping() {
            return Vec::new();
        }
        let Some(updated) = self.registry.snapshot(pair_address) else {
            return Vec::new();
        };
        let ts_ms = now_ms();
        let mut out = Vec::new();

        // Both orientations through the updated pair: a → b → c → a.
        for (a, b) in [
            (updated.token0, updated.token1),
            (updated.token1, updated.token0),
        ] {
            for leg2_addr in self
                .registry
                .pairs_with_token(&b)
                .into_iter()
                .take(TRIANGULAR_NEIGHBOR_CAP)
            {
                if leg2_addr == updated.pair_address {
                    continue;
                }
                let Some(leg2) = self.registry.snapshot(&leg2_addr) else {
                    continue;
                };
                let c = if leg2.token0 == b {
                    leg2.token1
                } else if leg2.token1 == b {
                    leg2.token0
                } else {
                    continue;
                };
                if c == a {
                    continue;
                }
                // Close the cycle: need a (c, a) pair.
                let close_key = crate::types::normalized_token_key(&c, &a);
                for leg3 in self.registry.same_token_pairs(&close_key) {
                    if let Some(opp) =
                        self.evaluate_triangle(&updated, &leg2, &leg3, a, b, c, ts_ms)
                    {
                        out.push(opp);
                    }
                }
            }
        }
        out
    }

    #[allow(clippy::too_many_arguments)]
    fn evaluate_triangle(
        &self,
        leg1: &TokenPair,
        leg2: &TokenPair,
        leg3: &TokenPair,
        a: Address,
        b: Address,
        c: Address,
        ts_ms: u64,
    ) -> Option<Opportunity> {
        let a_usd = self.pricer.usd_price(self.chain, &a)?;
        let reserve_a = reserve_of(leg1, &a)?;
        if reserve_a <= 0.0 {
            return None;
        }
        let amount_in = reserve_a * TRADE_SIZE_FRACTION;

        let after_leg1 = mid_leg_out(leg1, &a, &b, amount_in)?;
        let after_leg2 = mid_leg_out(leg2, &b, &c, after_leg1)?;
        let after_leg3 = mid_leg_out(leg3, &c, &a, after_leg2)?;

        let gross_profit = after_leg3 - amount_in;
        let gross_profit_usd = gross_profit * a_usd;
        let amount_in_usd = amount_in * a_usd;

        let gas_usd = self
            .gas
            .estimate_gas_cost_usd(self.chain, crate::cache::GasPreset::TriangularArb.units());
        // Three legs of impact: approximate with the first and last legs'
        // reserves plus the liquidity floor across the cycle.
        let min_liq_usd = 2.0 * reserve_a * a_usd;
        let slip = slippage::dynamic_slippage(
            amount_in,
            reserve_a,
            reserve_of(leg3, &a).unwrap_or(reserve_a),
            min_liq_usd,
        );
        let net_profit_usd = gross_profit_usd - slip * amount_in_usd - gas_usd;
        let profit_pct = net_profit_usd / amount_in_usd * 100.0;

        if net_profit_usd < self.min_profit_usd || profit_pct < self.min_profit_pct {
            return None;
        }

        let path = vec![
            SwapStep {
                router: self.routers.get(&leg1.dex).copied().unwrap_or(Address::ZERO),
                token_in: a,
                token_out: b,
                amount_in: f64_to_raw(amount_in, decimals_of(leg1, &a)),
                data: Vec::new(),
            },
            SwapStep {
                router: self.routers.get(&leg2.dex).copied().unwrap_or(Address::ZERO),
                token_in: b,
                token_out: c,
                amount_in: U256::ZERO,
                data: Vec::new(),
            },
            SwapStep {
                router: self.routers.get(&leg3.dex).copied().unwrap_or(Address::ZERO),
                token_in: c,
                token_out: a,
                amount_in: U256::ZERO,
                data: Vec::new(),
            },
        ];

        Some(Opportunity {
            id: Opportunity::fingerprint(
                OpportunityKind::Triangular,
                self.chain,
                self.chain,
                leg1.dex,
                leg3.dex,
                &a,
                &a,
                amount_in_usd,
                ts_ms,
            ),
            kind: OpportunityKind::Triangular,
            buy_chain: self.chain,
            sell_chain: self.chain,
            buy_dex: leg1.dex,
            sell_dex: leg3.dex,
            token_in: a,
            token_out: a,
            path,
            amount_in: f64_to_raw(amount_in, decimals_of(leg1, &a)),
            expected_amount_out: f64_to_raw(after_leg3, decimals_of(leg1, &a)),
            expected_profit_usd: net_profit_usd,
            profit_percentage: profit_pct,
            gas_estimate_usd: gas_usd,
            confidence: self.confidence * 0.9,
            whale_triggered: false,
            ml_confidence_boost: 1.0,
            flash_protocol: None,
            detected_at_ms: ts_ms,
            expires_at_ms: ts_ms + self.expiry_ms,
        })
    }
}

fn decimals_of(pair: &TokenPair, token: &Address) -> u8 {
    if *token == pair.token0 {
        pair.decimals0
    } else {
        pair.decimals1
    }
}

/// Human-unit reserve of `token` in `pair`, or None if the token is absent.
fn reserve_of(pair: &TokenPair, token: &Address) -> Option<f64> {
    if *token == pair.token0 {
        Some(u256_to_f64(pair.reserve0) / 10f64.powi(pair.decimals0 as i32))
    } else if *token == pair.token1 {
        Some(u256_to_f64(pair.reserve1) / 10f64.powi(pair.decimals1 as i32))
    } else {
        None
    }
}

/// Mid-price leg output (human units) from token_in to token_out with the
/// pool's fee applied.
fn mid_leg_out(pair: &TokenPair, token_in: &Address, token_out: &Address, amount: f64) -> Option<f64> {
    let mid = pair.mid_price();
    if mid <= 0.0 {
        return None;
    }
    let rate = if *token_in == pair.token0 && *token_out == pair.token1 {
        mid
    } else if *token_in == pair.token1 && *token_out == pair.token0 {
        1.0 / mid
    } else {
        return None;
    };
    Some(amount * rate * (1.0 - pair.dex.fee_fraction()))
}
