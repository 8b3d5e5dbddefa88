//! Pre-flight transaction simulation.
//!
//! Abstracts over multiple providers (full-EVM service, plain eth_call,
//! local fork). Each attempt picks the healthiest provider and carries a
//! latency budget; failures and timeouts fall through to the next provider.
//! When every provider is down the pipeline proceeds WITHOUT simulation —
//! a simulation outage must never stop execution.

use crate::error::CoreError;
use crate::execution::rpc::ChainRpc;
use crate::execution::TxRequest;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum SimOutcome {
    Success {
        gas_used: Option<u64>,
        return_data: Vec<u8>,
    },
    Revert {
        reason: String,
    },
}

#[async_trait]
pub trait SimulationProvider: Send + Sync {
    fn name(&self) -> &'static str;
    /// Health in [0, 1]; the service tries providers healthiest-first.
    fn health(&self) -> f64;
    async fn simulate(&self, request: &TxRequest) -> Result<SimOutcome, CoreError>;
}

/// Success/failure-ratio health shared by the provider impls.
#[derive(Default)]
pub struct ProviderHealthMeter {
    successes: AtomicU64,
    failures: AtomicU64,
}

impl ProviderHealthMeter {
    pub fn on_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn score(&self) -> f64 {
        let ok = self.successes.load(Ordering::Relaxed) as f64;
        let bad = self.failures.load(Ordering::Relaxed) as f64;
        if ok + bad == 0.0 {
            return 0.5;
        }
        ok / (ok + bad)
    }
}

/// Generic eth_call provider: cheap, available everywhere, catches plain
/// reverts (no state-diff or bundle semantics).
pub struct EthCallProvider {
    rpc: Arc<dyn ChainRpc>,
    health: ProviderHealthMeter,
}

impl EthCallProvider {
    pub fn new(rpc: Arc<dyn ChainRpc>) -> Self {
        Self {
            rpc,
            health: ProviderHealthMeter::default(),
        }
    }
}

#[async_trait]
impl SimulationProvider for EthCallProvider {
    fn name(&self) -> &'static str {
        "eth_call"
    }

    fn health(&self) -> f64 {
        self.health.score()
    }

    async fn simulate(&self, request: &TxRequest) -> Result<SimOutcome, CoreError> {
        match self.rpc.call(request, None).await {
            Ok(return_data) => {
                self.health.on_success();
                Ok(SimOutcome::Success {
                    gas_used: None,
                    return_data,
                })
            }
            // eth_call surfaces reverts as Validation errors.
            Err(CoreError::Validation(reason)) => {
                self.health.on_success();
                Ok(SimOutcome::Revert { reason })
            }
            Err(e) => {
                self.health.on_failure();
                Err(e)
            }
        }
    }
}

pub struct SimulationService {
    providers: Vec<Arc<dyn SimulationProvider>>,
    max_latency_ms: u64,
}

impl SimulationService {
    pub fn new(providers: Vec<Arc<dyn SimulationProvider>>, max_latency_ms: u64) -> Self {
        Self {
            providers,
            max_latency_ms,
        }
    }

    /// Simulate with fallback. `None` means no provider could answer —
    /// callers proceed unsimulated.
    pub async fn simulate(&self, request: &TxRequest) -> Option<SimOutcome> {
        let mut ordered: Vec<&Arc<dyn SimulationProvider>> = self.providers.iter().collect();
        ordered.sort_by(|a, b| {
            b.health()
                .partial_cmp(&a.health())
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        for provider in ordered {
            let attempt = tokio::time::timeout(
                Duration::from_millis(self.max_latency_ms),
                provider.simulate(request),
            )
            .await;
            match attempt {
                Ok(Ok(outcome)) => {
                    debug!("simulation via {}: {:?}", provider.name(), outcome);
                    return Some(outcome);
                }
                Ok(Err(e)) => {
                    warn!("simulation provider {} failed: {} — falling back", provider.name(), e);
                }
                Err(_) => {
                    warn!(
                        "simulation provider {} exceeded {}ms — falling back",
                        provider.name(),
                        self.max_latency_ms
                    );
                }
            }
        }
        None
    }
}

/// Adapter for detection-time pre-validation: builds the opportunity's
/// transaction through the strategy router and checks revenue with the
/// cheap provider chain. "Could not tell" maps to Err, which the
/// pre-validator treats as a pass (fail-open).
pub struct SimulationRevenueVerifier {
    service: Arc<SimulationService>,
    router: crate::execution::strategy::StrategyRouter,
    wallets: std::collections::HashMap<crate::types::Chain, alloy::primitives::Address>,
    executors: std::collections::HashMap<crate::types::Chain, alloy::primitives::Address>,
}

impl SimulationRevenueVerifier {
    pub fn new(
        service: Arc<SimulationService>,
        router: crate::execution::strategy::StrategyRouter,
        wallets: std::collections::HashMap<crate::types::Chain, alloy::primitives::Address>,
        executors: std::collections::HashMap<crate::types::Chain, alloy::primitives::Address>,
    ) -> Self {
        Self {
            service,
            router,
            wallets,
            executors,
        }
    }
}

#[async_trait]
impl crate::detector::prevalidation::RevenueSimulator for SimulationRevenueVerifier {
    async fn verify(&self, opportunity: &crate::types::Opportunity) -> Result<bool, CoreError> {
        let chain = opportunity.buy_chain;
        let (Some(wallet), Some(executor)) =
            (self.wallets.get(&chain), self.executors.get(&chain))
        else {
            return Err(CoreError::Validation(format!(
                "no wallet/executor for {}",
                chain
            )));
        };
        let strategy = self
            .router
            .select(opportunity)
            .ok_or_else(|| CoreError::Validation("no strategy for opportunity".into()))?;
        let request = strategy
            .build_request(opportunity, *wallet, *executor)
            .ok_or_else(|| CoreError::Validation("request build failed".into()))?;
        match self.service.simulate(&request).await {
            Some(SimOutcome::Success { .. }) => Ok(true),
            Some(SimOutcome::Revert { .. }) => Ok(false),
            None => Err(CoreError::Transient("all simulation providers down".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Chain;
    use alloy::primitives::{Address, U256};

    fn request() -> TxRequest {
        TxRequest {
            chain: Chain::Ethereum,
            from: Address::ZERO,
            to: Address::repeat_byte(1),
            value: U256::ZERO,
            data: vec![0xab],
            gas_limit: 200_000,
            nonce: None,
            priority_fee_gwei: None,
        }
    }

    struct FixedProvider {
        name: &'static str,
        health: f64,
        result: Result<SimOutcome, ()>,
        delay_ms: u64,
    }

    #[async_trait]
    impl SimulationProvider for FixedProvider {
        fn name(&self) -> &'static str {
            self.name
        }
        fn health(&self) -> f64 {
            self.health
        }
        async fn simulate(&self, _request: &TxRequest) -> Result<SimOutcome, CoreError> {
            if self.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            }
            self.result
                .clone()
                .map_err(|_| CoreError::Transient("provider down".into()))
        }
    }

    #[tokio::test]
    async fn test_healthiest_provider_first() {
        let service = SimulationService::new(
            vec![
                Arc::new(FixedProvider {
                    name: "weak",
                    health: 0.2,
                    result: Ok(SimOutcome::Revert {
                        reason: "weak".into(),
                    }),
                    delay_ms: 0,
                }),
                Arc::new(FixedProvider {
                    name: "strong",
                    health: 0.9,
                    result: Ok(SimOutcome::Success {
                        gas_used: Some(100),
                        return_data: vec![],
                    }),
                    delay_ms: 0,
                }),
            ],
            500,
        );
        match service.simulate(&request()).await {
            Some(SimOutcome::Success { gas_used, .. }) => assert_eq!(gas_used, Some(100)),
            other => panic!("expected strong provider's result, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fallback_on_error() {
        let service = SimulationService::new(
            vec![
                Arc::new(FixedProvider {
                    name: "down",
                    health: 0.9,
                    result: Err(()),
                    delay_ms: 0,
                }),
                Arc::new(FixedProvider {
                    name: "backup",
                    health: 0.1,
                    result: Ok(SimOutcome::Revert {
                        reason: "INSUFFICIENT_OUTPUT_AMOUNT".into(),
                    }),
                    delay_ms: 0,
                }),
            ],
            500,
        );
        match service.simulate(&request()).await {
            Some(SimOutcome::Revert { reason }) => {
                assert_eq!(reason, "INSUFFICIENT_OUTPUT_AMOUNT")
            }
            other => panic!("expected backup revert, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_timeout_falls_through() {
        let service = SimulationService::new(
            vec![
                Arc::new(FixedProvider {
                    name: "slow",
                    health: 0.9,
                    result: Ok(SimOutcome::Success {
                        gas_used: None,
                        return_data: vec![],
                    }),
                    delay_ms: 400,
                }),
                Arc::new(FixedProvider {
                    name: "fast",
                    health: 0.1,
                    result: Ok(SimOutcome::Success {
                        gas_used: Some(7),
                        return_data: vec![],
                    }),
                    delay_ms: 0,
                }),
            ],
            50,
        );
        match service.simulate(&request()).await {
            Some(SimOutcome::Success { gas_used, .. }) => assert_eq!(gas_used, Some(7)),
            other => panic!("expected fast provider, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_total_outage_returns_none() {
        let service = SimulationService::new(
            vec![Arc::new(FixedProvider {
                name: "down",
                health: 0.9,
                result: Err(()),
                delay_ms: 0,
            })],
            50,
        );
        assert!(service.simulate(&request()).await.is_none());
    }

    #[tokio::test]
    async fn test_eth_call_provider_maps_revert() {
        let rpc = Arc::new(crate::execution::rpc::mock::MockRpc::new(0));
        *rpc.call_result.lock() = Err("execution reverted: SLIPPAGE".into());
        let provider = EthCallProvider::new(rpc);
        match provider.simulate(&request()).await.unwrap() {
            SimOutcome::Revert { reason } => assert!(reason.contains("SLIPPAGE")),
            other => panic!("expected revert, got {:?}", other),
        }
    }
}
