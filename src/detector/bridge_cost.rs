//! Bridge cost and latency estimation for cross-chain routes.
//!
//! Estimates come from a source behind a timeout; a late or failed estimate
//! degrades to a conservative default rather than blocking the scan loop.

use crate::types::Chain;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

/// Conservative default when no route data is available: expensive enough
/// that only a clearly-profitable spread survives it.
pub const DEFAULT_ESTIMATE: BridgeEstimate = BridgeEstimate {
    fee_usd: 25.0,
    latency_ms: 600_000,
};

const ESTIMATE_TIMEOUT_MS: u64 = 50;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BridgeEstimate {
    pub fee_usd: f64,
    pub latency_ms: u64,
}

#[async_trait]
pub trait BridgeCostSource: Send + Sync {
    async fn estimate(&self, from: Chain, to: Chain) -> Option<BridgeEstimate>;
}

/// Static route table, seeded from config or operational data.
pub struct StaticBridgeTable {
    routes: HashMap<(Chain, Chain), BridgeEstimate>,
}

impl StaticBridgeTable {
    pub fn new(routes: HashMap<(Chain, Chain), BridgeEstimate>) -> Self {
        Self { routes }
    }

    /// Rough mainnet route costs; L2↔L2 is cheap, anything touching
    /// Ethereum mainnet or Solana costs more.
    pub fn with_defaults() -> Self {
        let mut routes = HashMap::new();
        let l2s = [Chain::Arbitrum, Chain::Optimism, Chain::Base];
        for a in l2s {
            for b in l2s {
                if a != b {
                    routes.insert(
                        (a, b),
                        BridgeEstimate {
                            fee_usd: 2.0,
                            latency_ms: 120_000,
                        },
                    );
                }
            }
            routes.insert(
                (Chain::Ethereum, a),
                BridgeEstimate {
                    fee_usd: 12.0,
                    latency_ms: 900_000,
                },
            );
            routes.insert(
                (a, Chain::Ethereum),
                BridgeEstimate {
                    fee_usd: 8.0,
                    latency_ms: 900_000,
                },
            );
        }
        Self::new(routes)
    }
}

#[async_trait]
impl BridgeCostSource for StaticBridgeTable {
    async fn estimate(&self, from: Chain, to: Chain) -> Option<BridgeEstimate> {
        self.routes.get(&(from, to)).copied()
    }
}

/// Estimate with the race-with-timeout contract: timeout or miss returns the
/// conservative default.
pub async fn estimate_with_timeout(
    source: &dyn BridgeCostSource,
    from: Chain,
    to: Chain,
) -> BridgeEstimate {
    match tokio::time::timeout(
        Duration::from_millis(ESTIMATE_TIMEOUT_MS),
        source.estimate(from, to),
    )
    .await
    {
        Ok(Some(estimate)) => estimate,
        _ => DEFAULT_ESTIMATE,
    }
}
