//! Execution strategies.
//!
//! One small interface — analyze then build — behind a router that selects
//! by opportunity kind. Strategies only construct transactions; the engine
//! owns simulation, nonce allocation, submission, and outcome recording, so
//! every strategy goes through the same gates.

use crate::cache::GasPreset;
use crate::execution::calldata::{self, FlashCallParams};
use crate::execution::TxRequest;
use crate::types::{now_secs, u256_to_f64, Opportunity, OpportunityKind};
use alloy::primitives::{Address, U256};
use std::sync::Arc;

/// Flash-swap deadline slack.
const FLASH_DEADLINE_SECS: u64 = 60;

#[derive(Debug, Clone, Copy)]
pub struct StrategyDecision {
    pub proceed: bool,
    /// Downside beyond gas if the trade fails (0 for atomic routes that
    /// revert whole).
    pub expected_loss_usd: f64,
    pub gas_units: u64,
}

pub trait Strategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn supports(&self, opportunity: &Opportunity) -> bool;
    fn analyze(&self, opportunity: &Opportunity) -> StrategyDecision;
    /// Build the transaction. None when the opportunity is missing what the
    /// strategy needs (no executor deployed, absent protocol tag, ...).
    fn build_request(
        &self,
        opportunity: &Opportunity,
        wallet: Address,
        executor: Address,
    ) -> Option<TxRequest>;
}

fn half_profit_raw(opportunity: &Opportunity) -> U256 {
    if opportunity.expected_amount_out > opportunity.amount_in {
        (opportunity.expected_amount_out - opportunity.amount_in) / U256::from(2)
    } else {
        U256::from(1u64)
    }
}

fn notional_usd(opportunity: &Opportunity) -> f64 {
    if opportunity.profit_percentage > 0.0 {
        opportunity.expected_profit_usd / (opportunity.profit_percentage / 100.0)
    } else {
        u256_to_f64(opportunity.amount_in)
    }
}

/// Same-chain two-leg arbitrage through the executor contract. Atomic:
/// the contract reverts on loss, so the downside is gas only.
pub struct DirectArbStrategy;

impl Strategy for DirectArbStrategy {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn supports(&self, opportunity: &Opportunity) -> bool {
        matches!(
            opportunity.kind,
            OpportunityKind::IntraDex | OpportunityKind::CrossDex
        )
    }

    fn analyze(&self, _opportunity: &Opportunity) -> StrategyDecision {
        StrategyDecision {
            proceed: true,
            expected_loss_usd: 0.0,
            gas_units: GasPreset::ComplexSwap.units(),
        }
    }

    fn build_request(
        &self,
        opportunity: &Opportunity,
        wallet: Address,
        executor: Address,
    ) -> Option<TxRequest> {
        let data = calldata::encode_execute_arbitrage(
            &FlashCallParams {
                asset: opportunity.token_in,
                amount: opportunity.amount_in,
                min_profit: half_profit_raw(opportunity),
                pool: None,
                deadline_secs: None,
            },
            &opportunity.path,
        );
        Some(TxRequest {
            chain: opportunity.buy_chain,
            from: wallet,
            to: executor,
            value: U256::ZERO,
            data,
            gas_limit: GasPreset::ComplexSwap.units(),
            nonce: None,
            priority_fee_gwei: None,
        })
    }
}

/// Flash-loan arbitrage: calldata encoding dispatches on the protocol tag
/// carried by the opportunity.
pub struct FlashLoanStrategy;

impl Strategy for FlashLoanStrategy {
    fn name(&self) -> &'static str {
        "flash-loan"
    }

    fn supports(&self, opportunity: &Opportunity) -> bool {
        opportunity.kind == OpportunityKind::FlashLoan && opportunity.flash_protocol.is_some()
    }

    fn analyze(&self, _opportunity: &Opportunity) -> StrategyDecision {
        StrategyDecision {
            proceed: true,
            expected_loss_usd: 0.0,
            gas_units: GasPreset::ComplexSwap.units() + 100_000, // loan overhead
        }
    }

    fn build_request(
        &self,
        opportunity: &Opportunity,
        wallet: Address,
        executor: Address,
    ) -> Option<TxRequest> {
        let protocol = opportunity.flash_protocol?;
        // The flash-swap pool for V3-style loans is the first leg's venue.
        let pool = opportunity.path.first().map(|s| s.router);
        let data = calldata::encode_flash_arbitrage(
            protocol,
            &FlashCallParams {
                asset: opportunity.token_in,
                amount: opportunity.amount_in,
                min_profit: half_profit_raw(opportunity),
                pool,
                deadline_secs: Some(now_secs() as u64 + FLASH_DEADLINE_SECS),
            },
            &opportunity.path,
        )?;
        Some(TxRequest {
            chain: opportunity.buy_chain,
            from: wallet,
            to: executor,
            value: U256::ZERO,
            data,
            gas_limit: GasPreset::ComplexSwap.units() + 100_000,
            nonce: None,
            priority_fee_gwei: None,
        })
    }
}

/// Triangular cycle on one chain.
pub struct TriangularStrategy;

impl Strategy for TriangularStrategy {
    fn name(&self) -> &'static str {
        "triangular"
    }

    fn supports(&self, opportunity: &Opportunity) -> bool {
        matches!(
            opportunity.kind,
            OpportunityKind::Triangular | OpportunityKind::MultiLeg
        )
    }

    fn analyze(&self, opportunity: &Opportunity) -> StrategyDecision {
        let hops = opportunity.path.len() as u64;
        let gas_units = if hops <= 3 {
            GasPreset::TriangularArb.units()
        } else {
            GasPreset::multi_leg_units(hops)
        };
        StrategyDecision {
            proceed: true,
            expected_loss_usd: 0.0,
            gas_units,
        }
    }

    fn build_request(
        &self,
        opportunity: &Opportunity,
        wallet: Address,
        executor: Address,
    ) -> Option<TxRequest> {
        let decision = self.analyze(opportunity);
        let data = calldata::encode_execute_arbitrage(
            &FlashCallParams {
                asset: opportunity.token_in,
                amount: opportunity.amount_in,
                min_profit: half_profit_raw(opportunity),
                pool: None,
                deadline_secs: None,
            },
            &opportunity.path,
        );
        Some(TxRequest {
            chain: opportunity.buy_chain,
            from: wallet,
            to: executor,
            value: U256::ZERO,
            data,
            gas_limit: decision.gas_units,
            nonce: None,
            priority_fee_gwei: None,
        })
    }
}

/// Cross-chain: submit the buy leg; the bridge-and-sell half runs outside
/// the atomic boundary, so the downside is inventory risk, not just gas.
pub struct CrossChainStrategy;

impl Strategy for CrossChainStrategy {
    fn name(&self) -> &'static str {
        "cross-chain"
    }

    fn supports(&self, opportunity: &Opportunity) -> bool {
        opportunity.kind == OpportunityKind::CrossChain
    }

    fn analyze(&self, opportunity: &Opportunity) -> StrategyDecision {
        StrategyDecision {
            proceed: true,
            expected_loss_usd: notional_usd(opportunity) * 0.01,
            gas_units: GasPreset::SimpleSwap.units(),
        }
    }

    fn build_request(
        &self,
        opportunity: &Opportunity,
        wallet: Address,
        executor: Address,
    ) -> Option<TxRequest> {
        let first_leg = opportunity.path.first()?;
        let data = calldata::encode_execute_arbitrage(
            &FlashCallParams {
                asset: first_leg.token_in,
                amount: opportunity.amount_in,
                min_profit: U256::from(1u64),
                pool: None,
                deadline_secs: None,
            },
            std::slice::from_ref(first_leg),
        );
        Some(TxRequest {
            chain: opportunity.buy_chain,
            from: wallet,
            to: executor,
            value: U256::ZERO,
            data,
            gas_limit: GasPreset::SimpleSwap.units(),
            nonce: None,
            priority_fee_gwei: None,
        })
    }
}

/// Mean-reversion/statistical entries, behind the feature flag.
pub struct StatisticalStrategy;

impl Strategy for StatisticalStrategy {
    fn name(&self) -> &'static str {
        "statistical"
    }

    fn supports(&self, opportunity: &Opportunity) -> bool {
        opportunity.kind == OpportunityKind::Statistical
    }

    fn analyze(&self, opportunity: &Opportunity) -> StrategyDecision {
        StrategyDecision {
            proceed: true,
            // Directional: the position can lose, size the downside like
            // the upside.
            expected_loss_usd: opportunity.expected_profit_usd,
            gas_units: GasPreset::SimpleSwap.units(),
        }
    }

    fn build_request(
        &self,
        opportunity: &Opportunity,
        wallet: Address,
        executor: Address,
    ) -> Option<TxRequest> {
        let first_leg = opportunity.path.first()?;
        let data = calldata::encode_execute_arbitrage(
            &FlashCallParams {
                asset: first_leg.token_in,
                amount: opportunity.amount_in,
                min_profit: U256::from(1u64),
                pool: None,
                deadline_secs: None,
            },
            &opportunity.path,
        );
        Some(TxRequest {
            chain: opportunity.buy_chain,
            from: wallet,
            to: executor,
            value: U256::ZERO,
            data,
            gas_limit: GasPreset::SimpleSwap.units(),
            nonce: None,
            priority_fee_gwei: None,
        })
    }
}

pub struct StrategyRouter {
    strategies: Vec<Arc<dyn Strategy>>,
}

impl StrategyRouter {
    pub fn new(strategies: Vec<Arc<dyn Strategy>>) -> Self {
        Self { strategies }
    }

    /// The full set, with statistical arbitrage behind its flag.
    pub fn standard(statistical_enabled: bool) -> Self {
        let mut strategies: Vec<Arc<dyn Strategy>> = vec![
            Arc::new(DirectArbStrategy),
            Arc::new(FlashLoanStrategy),
            Arc::new(TriangularStrategy),
            Arc::new(CrossChainStrategy),
        ];
        if statistical_enabled {
            strategies.push(Arc::new(StatisticalStrategy));
        }
        Self::new(strategies)
    }

    pub fn select(&self, opportunity: &Opportunity) -> Option<Arc<dyn Strategy>> {
        self.strategies
            .iter()
            .find(|s| s.supports(opportunity))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Chain, DexName, FlashLoanProtocol, SwapStep};

    fn opportunity(kind: OpportunityKind) -> Opportunity {
        Opportunity {
            id: "op".into(),
            kind,
            buy_chain: Chain::Arbitrum,
            sell_chain: Chain::Arbitrum,
            buy_dex: DexName::Camelot,
            sell_dex: DexName::SushiSwap,
            token_in: Address::repeat_byte(0x02),
            token_out: Address::repeat_byte(0x02),
            path: vec![
                SwapStep {
                    router: Address::repeat_byte(0xe1),
                    token_in: Address::repeat_byte(0x02),
                    token_out: Address::repeat_byte(0x01),
                    amount_in: U256::from(1_000u64),
                    data: Vec::new(),
                },
                SwapStep {
                    router: Address::repeat_byte(0xe2),
                    token_in: Address::repeat_byte(0x01),
                    token_out: Address::repeat_byte(0x02),
                    amount_in: U256::ZERO,
                    data: Vec::new(),
                },
            ],
            amount_in: U256::from(1_000u64),
            expected_amount_out: U256::from(1_050u64),
            expected_profit_usd: 20.0,
            profit_percentage: 2.0,
            gas_estimate_usd: 1.0,
            confidence: 0.8,
            whale_triggered: false,
            ml_confidence_boost: 1.0,
            flash_protocol: None,
            detected_at_ms: 0,
            expires_at_ms: 10_000,
        }
    }

    #[test]
    fn test_router_selects_by_kind() {
        let router = StrategyRouter::standard(false);
        assert_eq!(
            router.select(&opportunity(OpportunityKind::CrossDex)).unwrap().name(),
            "direct"
        );
        assert_eq!(
            router.select(&opportunity(OpportunityKind::IntraDex)).unwrap().name(),
            "direct"
        );
        assert_eq!(
            router.select(&opportunity(OpportunityKind::Triangular)).unwrap().name(),
            "triangular"
        );
        assert_eq!(
            router.select(&opportunity(OpportunityKind::CrossChain)).unwrap().name(),
            "cross-chain"
        );
        // Statistical is off by default.
        assert!(router.select(&opportunity(OpportunityKind::Statistical)).is_none());
        assert!(StrategyRouter::standard(true)
            .select(&opportunity(OpportunityKind::Statistical))
            .is_some());
    }

    #[test]
    fn test_flash_requires_protocol_tag() {
        let router = StrategyRouter::standard(false);
        let untagged = opportunity(OpportunityKind::FlashLoan);
        assert!(router.select(&untagged).is_none());

        let mut tagged = opportunity(OpportunityKind::FlashLoan);
        tagged.flash_protocol = Some(FlashLoanProtocol::AaveV3);
        let strategy = router.select(&tagged).unwrap();
        assert_eq!(strategy.name(), "flash-loan");
        let request = strategy
            .build_request(&tagged, Address::repeat_byte(0xaa), Address::repeat_byte(0xcc))
            .unwrap();
        assert_eq!(request.chain, Chain::Arbitrum);
        assert!(!request.data.is_empty());
    }

    #[test]
    fn test_direct_request_targets_executor() {
        let strategy = DirectArbStrategy;
        let opp = opportunity(OpportunityKind::CrossDex);
        let wallet = Address::repeat_byte(0xaa);
        let executor = Address::repeat_byte(0xcc);
        let request = strategy.build_request(&opp, wallet, executor).unwrap();
        assert_eq!(request.from, wallet);
        assert_eq!(request.to, executor);
        assert_eq!(request.value, U256::ZERO);
        assert!(request.data.len() > 4);
        // Atomic: no expected loss beyond gas.
        assert_eq!(strategy.analyze(&opp).expected_loss_usd, 0.0);
    }

    #[test]
    fn test_cross_chain_carries_inventory_risk() {
        let strategy = CrossChainStrategy;
        let opp = opportunity(OpportunityKind::CrossChain);
        let decision = strategy.analyze(&opp);
        // 2% on $20 profit → $1000 notional → 1% inventory risk = $10.
        assert!((decision.expected_loss_usd - 10.0).abs() < 1e-6);
    }

    #[test]
    fn test_multi_leg_gas_scales_with_hops() {
        let strategy = TriangularStrategy;
        let mut opp = opportunity(OpportunityKind::MultiLeg);
        opp.path = (0..5)
            .map(|_| SwapStep {
                router: Address::ZERO,
                token_in: Address::ZERO,
                token_out: Address::ZERO,
                amount_in: U256::ZERO,
                data: Vec::new(),
            })
            .collect();
        let decision = strategy.analyze(&opp);
        assert_eq!(decision.gas_units, 100_000 + 5 * 150_000);
    }
}
