//! Gas price cache.
//!
//! One fee query per chain per 60 s refresh. On query failure the entry is
//! marked stale but keeps serving — profitability math degrades gracefully
//! instead of stalling detection. Fallback constants cover chains that have
//! never refreshed.

use crate::error::CoreError;
use crate::types::Chain;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub const REFRESH_INTERVAL_MS: u64 = 60_000;

/// Gas-unit presets for the profit estimator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GasPreset {
    SimpleSwap,
    ComplexSwap,
    TriangularArb,
    MultiLegBase,
    MultiLegPerHop,
}

impl GasPreset {
    pub fn units(&self) -> u64 {
        match self {
            GasPreset::SimpleSwap => 150_000,
            GasPreset::ComplexSwap => 200_000,
            GasPreset::TriangularArb => 450_000,
            GasPreset::MultiLegBase => 100_000,
            GasPreset::MultiLegPerHop => 150_000,
        }
    }

    /// Units for an N-hop multi-leg path.
    pub fn multi_leg_units(hops: u64) -> u64 {
        GasPreset::MultiLegBase.units() + hops * GasPreset::MultiLegPerHop.units()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GasQuote {
    pub gas_price_gwei: f64,
    pub native_usd: f64,
    pub updated_at_ms: u64,
    /// True when the last refresh failed and this is carried-over data.
    pub stale: bool,
}

/// Source of (gas price gwei, native token USD) per chain — one RPC fee-data
/// call in production, a fixture in tests.
#[async_trait]
pub trait FeeSource: Send + Sync {
    async fn fee_data(&self, chain: Chain) -> Result<(f64, f64), CoreError>;
}

pub struct GasPriceCache {
    quotes: DashMap<Chain, GasQuote>,
    fallbacks: HashMap<Chain, (f64, f64)>,
}

impl GasPriceCache {
    /// `fallbacks`: per-chain (gas gwei, native USD) constants served until
    /// the first successful refresh.
    pub fn new(fallbacks: HashMap<Chain, (f64, f64)>) -> Self {
        Self {
            quotes: DashMap::new(),
            fallbacks,
        }
    }

    pub fn quote(&self, chain: Chain) -> GasQuote {
        if let Some(q) = self.quotes.get(&chain) {
            return *q;
        }
        let (gwei, usd) = self.fallbacks.get(&chain).copied().unwrap_or((30.0, 1.0));
        GasQuote {
            gas_price_gwei: gwei,
            native_usd: usd,
            updated_at_ms: 0,
            stale: true,
        }
    }

    /// gasUsd = gasUnits · gasPriceGwei · nativeUsd / 1e9
    pub fn estimate_gas_cost_usd(&self, chain: Chain, gas_units: u64) -> f64 {
        let q = self.quote(chain);
        gas_units as f64 * q.gas_price_gwei * q.native_usd / 1e9
    }

    pub fn estimate_preset_usd(&self, chain: Chain, preset: GasPreset) -> f64 {
        self.estimate_gas_cost_usd(chain, preset.units())
    }

    /// Refresh one chain from the source. On error, mark stale but keep the
    /// old numbers.
    pub async fn refresh(&self, chain: Chain, source: &dyn FeeSource) {
        match source.fee_data(chain).await {
            Ok((gwei, usd)) => {
                self.quotes.insert(
                    chain,
                    GasQuote {
                        gas_price_gwei: gwei,
                        native_usd: usd,
                        updated_at_ms: crate::types::now_ms(),
                        stale: false,
                    },
                );
                debug!("gas refresh {}: {} gwei, native ${}", chain, gwei, usd);
            }
            Err(e) => {
                warn!("gas refresh {} failed: {} — serving stale data", chain, e);
                if let Some(mut q) = self.quotes.get_mut(&chain) {
                    q.stale = true;
                }
            }
        }
    }

    /// Periodic refresh for a set of chains until the shutdown token flips.
    pub async fn run_refresh_loop(
        self: Arc<Self>,
        chains: Vec<Chain>,
        source: Arc<dyn FeeSource>,
        shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        let mut shutdown = shutdown;
        let mut tick = tokio::time::interval(Duration::from_millis(REFRESH_INTERVAL_MS));
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    for chain in &chains {
                        self.refresh(*chain, source.as_ref()).await;
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }
}
