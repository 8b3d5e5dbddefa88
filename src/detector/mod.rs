//! Detection: per-chain detectors (intra-DEX and cross-DEX scans driven by
//! reserve updates) and the cross-chain detector (periodic indexed-snapshot
//! scans gated by staleness, ML, confidence, and pre-validation).

pub mod bridge_cost;
pub mod chain_detector;
pub mod confidence;
pub mod cross_chain;
pub mod ml;
pub mod prevalidation;
pub mod price_data;
pub mod publisher;
pub mod slippage;

pub use chain_detector::{ChainDetector, PairRegistry};
pub use cross_chain::CrossChainDetector;
pub use publisher::OpportunityPublisher;

use crate::types::Chain;
use alloy::primitives::Address;
use std::collections::HashMap;

/// USD price source for individual tokens. Detection only needs rough
/// pricing (sizing, notional, liquidity penalties) — the profit math itself
/// stays in token units.
pub trait TokenPricer: Send + Sync {
    fn usd_price(&self, chain: Chain, token: &Address) -> Option<f64>;
}

/// Static table pricer: stables and majors priced at config load, refreshed
/// out of band. Unknown tokens return None and their pairs are skipped for
/// USD-denominated gates.
pub struct StaticTokenPricer {
    prices: HashMap<Address, f64>,
}

impl StaticTokenPricer {
    pub fn new(prices: HashMap<Address, f64>) -> Self {
        Self { prices }
    }
}

impl TokenPricer for StaticTokenPricer {
    fn usd_price(&self, _chain: Chain, token: &Address) -> Option<f64> {
        self.prices.get(token).copied()
    }
}
