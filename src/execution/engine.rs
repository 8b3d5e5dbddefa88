//! Execution engine.
//!
//! Consumes the opportunity stream and pushes each opportunity through the
//! gate pipeline: circuit breaker → drawdown → EV → Kelly sizing → strategy
//! → pre-flight simulation → nonce → MEV-protected submission → outcome
//! recording. Every skip is a typed reason and a counter, never an error.
//!
//! Backpressure: when the in-process work queue reaches the high watermark
//! the stream consumer pauses, moving pressure back into the stream; it
//! resumes at the low watermark. Messages are acked on read (at-most-once
//! within the execution group).

use crate::bus::{decode_payload, StreamConsumer};
use crate::cache::GasPriceCache;
use crate::config::{ExecutionConfig, RiskConfig};
use crate::error::SkipReason;
use crate::execution::circuit_breaker::CircuitBreakerManager;
use crate::execution::cooldown::RouteCooldown;
use crate::execution::mev::{SubmitResult, TxSubmitter};
use crate::execution::nonce::NonceManager;
use crate::execution::simulation::{SimOutcome, SimulationService};
use crate::risk::{
    expected_value, gas_price_bucket, DrawdownCircuitBreaker, DrawdownState,
    ExecutionProbabilityTracker, KellyPositionSizer, OutcomeKey,
};
use crate::execution::strategy::StrategyRouter;
use crate::stats::CoreStats;
use crate::types::{now_ms, Chain, ExecutionOutcome, Opportunity};
use alloy::primitives::Address;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn};

/// Concurrent strategy executions.
const MAX_WORKERS: usize = 8;

pub struct ExecutionEngine {
    config: ExecutionConfig,
    risk: RiskConfig,
    breakers: Arc<CircuitBreakerManager>,
    drawdown: Arc<DrawdownCircuitBreaker>,
    tracker: Arc<ExecutionProbabilityTracker>,
    sizer: KellyPositionSizer,
    router: StrategyRouter,
    simulation: Arc<SimulationService>,
    gas: Arc<GasPriceCache>,
    nonce: Arc<NonceManager>,
    submitter: Arc<dyn TxSubmitter>,
    wallets: HashMap<Chain, Address>,
    executors: HashMap<Chain, Address>,
    route_cooldown: Mutex<RouteCooldown>,
    /// Latest block seen per chain (fed by ingestion); drives the
    /// block-denominated route cooldown.
    blocks: DashMap<Chain, u64>,
    stats: Arc<CoreStats>,
}

impl ExecutionEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ExecutionConfig,
        risk: RiskConfig,
        breakers: Arc<CircuitBreakerManager>,
        drawdown: Arc<DrawdownCircuitBreaker>,
        tracker: Arc<ExecutionProbabilityTracker>,
        simulation: Arc<SimulationService>,
        gas: Arc<GasPriceCache>,
        nonce: Arc<NonceManager>,
        submitter: Arc<dyn TxSubmitter>,
        wallets: HashMap<Chain, Address>,
        executors: HashMap<Chain, Address>,
        stats: Arc<CoreStats>,
    ) -> Self {
        let sizer = KellyPositionSizer::new(&risk);
        let router = StrategyRouter::standard(config.statistical_arb_enabled);
        let route_cooldown = Mutex::new(RouteCooldown::new(config.route_cooldown_blocks));
        Self {
            config,
            risk,
            breakers,
            drawdown,
            tracker,
            sizer,
            router,
            simulation,
            gas,
            nonce,
            submitter,
            wallets,
            executors,
            route_cooldown,
            blocks: DashMap::new(),
            stats,
        }
    }

    pub fn note_block(&self, chain: Chain, block_number: u64) {
        let mut entry = self.blocks.entry(chain).or_insert(0);
        *entry = (*entry).max(block_number);
    }

    /// Latest noted block, or a 2 s-nominal estimate so the cooldown keeps
    /// advancing when nothing feeds us block numbers.
    fn current_block(&self, chain: Chain, now: u64) -> u64 {
        self.blocks
            .get(&chain)
            .map(|b| *b)
            .unwrap_or(now / 2_000)
    }

    /// The nine-step pipeline for one opportunity.
    pub async fn process(
        self: &Arc<Self>,
        opportunity: &Opportunity,
        now: u64,
    ) -> Result<ExecutionOutcome, SkipReason> {
        let started = Instant::now();
        self.stats.execution.consumed.fetch_add(1, Ordering::Relaxed);

        let result = self.run_pipeline(opportunity, now, started).await;
        if let Err(reason) = &result {
            debug!("opportunity {} skipped: {}", opportunity.id, reason);
            self.stats.execution.record_skip(*reason);
        }
        result
    }

    async fn run_pipeline(
        self: &Arc<Self>,
        opportunity: &Opportunity,
        now: u64,
        started: Instant,
    ) -> Result<ExecutionOutcome, SkipReason> {
        let chain = opportunity.buy_chain;
        let pair_key = crate::types::normalized_token_key(
            &opportunity.token_in,
            &opportunity.token_out,
        );

        if opportunity.is_expired(now) {
            return Err(SkipReason::Expired);
        }

        let block = self.current_block(chain, now);
        if self.route_cooldown.lock().is_suppressed(
            chain,
            &pair_key,
            opportunity.buy_dex,
            opportunity.sell_dex,
            block,
        ) {
            return Err(SkipReason::RouteCooldown);
        }

        // 1. Per-chain circuit breaker (OPEN+expired cooldown admits one
        // HALF_OPEN probe).
        if !self.breakers.try_acquire(chain, now) {
            return Err(SkipReason::CircuitOpen);
        }

        // 2. Global drawdown breaker.
        let drawdown_state = self.drawdown.state(now);
        if drawdown_state == DrawdownState::Halt {
            return Err(SkipReason::DrawdownHalt);
        }
        let size_multiplier = drawdown_state.size_multiplier();

        // Strategy selection up front — the EV gate needs its loss estimate
        // and gas shape.
        let strategy = self.router.select(opportunity).ok_or(SkipReason::NoStrategy)?;
        let decision = strategy.analyze(opportunity);
        if !decision.proceed {
            return Err(SkipReason::NoStrategy);
        }

        // 3. Expected-value gate.
        let quote = self.gas.quote(chain);
        let gas_usd = self.gas.estimate_gas_cost_usd(chain, decision.gas_units);
        let key = OutcomeKey {
            chain,
            dex: opportunity.buy_dex,
            path_len: opportunity.path.len().min(u8::MAX as usize) as u8,
            hour_of_day: ((now / 3_600_000) % 24) as u8,
            gas_bucket: gas_price_bucket(quote.gas_price_gwei),
        };
        let win_probability = self.tracker.win_probability(&key, now);
        if win_probability < self.risk.min_win_probability {
            return Err(SkipReason::WinProbabilityLow);
        }
        let ev = expected_value(
            win_probability,
            opportunity.expected_profit_usd,
            gas_usd,
            decision.expected_loss_usd,
        );
        if ev < self.risk.min_ev_usd {
            return Err(SkipReason::EvBelowThreshold);
        }

        // 4. Kelly sizing with the drawdown multiplier.
        let fraction = self.sizer.position_fraction(
            win_probability,
            opportunity.expected_profit_usd,
            decision.expected_loss_usd.max(gas_usd),
            size_multiplier,
        );
        if fraction <= 0.0 {
            return Err(SkipReason::PositionTooSmall);
        }

        // 5. Build the transaction.
        let wallet = self.wallets.get(&chain).copied().ok_or(SkipReason::NoStrategy)?;
        let executor = self
            .executors
            .get(&chain)
            .copied()
            .ok_or(SkipReason::NoStrategy)?;
        let mut request = strategy
            .build_request(opportunity, wallet, executor)
            .ok_or(SkipReason::NoStrategy)?;

        // 6. Pre-flight simulation above the value threshold. A provider
        // outage (None) does not block execution.
        if opportunity.expected_profit_usd >= self.config.simulate_threshold_usd {
            if let Some(SimOutcome::Revert { reason }) =
                self.simulation.simulate(&request).await
            {
                debug!("simulation predicted revert: {}", reason);
                return Err(SkipReason::SimulationRevert);
            }
        }

        // 7. Nonce allocation: one resync-and-retry, then give up.
        let nonce = match self.nonce.next_nonce(chain, wallet, now).await {
            Ok(n) => n,
            Err(first_err) => {
                warn!("nonce allocation failed ({}), retrying once", first_err);
                self.nonce
                    .next_nonce(chain, wallet, now)
                    .await
                    .map_err(|_| SkipReason::NonceConflict)?
            }
        };
        request.nonce = Some(nonce);

        // 8. MEV-protected submission, tipped per the pre-submission risk
        // analysis.
        let notional = opportunity.expected_profit_usd
            / (opportunity.profit_percentage / 100.0).max(1e-9);
        let analysis = crate::execution::mev::analyze_mev_risk(
            notional,
            opportunity.path.len(),
            if opportunity.whale_triggered { 0.8 } else { 0.3 },
        );
        request.priority_fee_gwei =
            Some(quote.gas_price_gwei + analysis.recommended_tip_gwei);
        let submit_result = self.submitter.submit(&request).await;

        // 9. Outcome recording.
        let latency_ms = started.elapsed().as_millis() as u64;
        let outcome = match submit_result {
            Ok(SubmitResult {
                submitted_hash,
                accepted: true,
                ..
            }) => {
                self.nonce
                    .on_submitted(chain, wallet, nonce, &submitted_hash)
                    .await;
                // Confirmation reconciliation refines the realized PnL; the
                // submitted-and-accepted result is what the core records.
                self.nonce.on_confirmed(chain, wallet, nonce).await;
                ExecutionOutcome {
                    success: true,
                    actual_profit_usd: opportunity.expected_profit_usd,
                    gas_cost_usd: gas_usd,
                    error: None,
                    tx_hash: Some(submitted_hash),
                    latency_ms,
                }
            }
            Ok(SubmitResult { submitted_hash, .. }) => {
                self.nonce.on_failed(chain, wallet, nonce, true).await;
                ExecutionOutcome {
                    success: false,
                    actual_profit_usd: 0.0,
                    gas_cost_usd: gas_usd,
                    error: Some("submission not accepted".into()),
                    tx_hash: Some(submitted_hash),
                    latency_ms,
                }
            }
            Err(e) => {
                self.nonce.on_failed(chain, wallet, nonce, false).await;
                ExecutionOutcome {
                    success: false,
                    actual_profit_usd: 0.0,
                    gas_cost_usd: gas_usd,
                    error: Some(e.to_string()),
                    tx_hash: None,
                    latency_ms,
                }
            }
        };

        self.record_outcome(opportunity, &pair_key, key, &outcome, now, block);
        Ok(outcome)
    }

    fn record_outcome(
        &self,
        opportunity: &Opportunity,
        pair_key: &str,
        key: OutcomeKey,
        outcome: &ExecutionOutcome,
        now: u64,
        block: u64,
    ) {
        let chain = opportunity.buy_chain;
        self.stats.execution.executed.fetch_add(1, Ordering::Relaxed);
        self.tracker.record(key, outcome.success, now);

        if outcome.success {
            self.stats.execution.succeeded.fetch_add(1, Ordering::Relaxed);
            self.drawdown.record_outcome(outcome.actual_profit_usd, now);
            self.breakers.on_success(chain, now);
            self.route_cooldown.lock().record_success(
                chain,
                pair_key,
                opportunity.buy_dex,
                opportunity.sell_dex,
            );
            info!(
                "executed {} on {} | profit ${:.2} | {}ms | tx {:?}",
                opportunity.kind, chain, outcome.actual_profit_usd, outcome.latency_ms,
                outcome.tx_hash
            );
        } else {
            self.stats.execution.failed.fetch_add(1, Ordering::Relaxed);
            self.drawdown.record_outcome(-outcome.gas_cost_usd, now);
            self.breakers.on_failure(chain, now);
            self.route_cooldown.lock().record_failure(
                chain,
                pair_key,
                opportunity.buy_dex,
                opportunity.sell_dex,
                block,
            );
            warn!(
                "execution failed on {}: {:?} ({}ms)",
                chain, outcome.error, outcome.latency_ms
            );
        }
    }

    /// Consumer loop with watermark backpressure.
    pub async fn run(
        self: Arc<Self>,
        consumer: Arc<StreamConsumer>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let queue_depth = Arc::new(AtomicUsize::new(0));
        let workers = Arc::new(Semaphore::new(MAX_WORKERS));

        loop {
            tokio::select! {
                batch = consumer.next_batch(32, 100) => {
                    let batch = match batch {
                        Ok(batch) => batch,
                        Err(e) => {
                            warn!("opportunity consumer error: {}", e);
                            tokio::time::sleep(std::time::Duration::from_millis(250)).await;
                            continue;
                        }
                    };
                    for msg in batch {
                        // Ack on read: at-most-once within this group.
                        let _ = consumer.ack(&msg.id).await;
                        let Some(opportunity) = decode_payload::<Opportunity>(&msg) else {
                            continue;
                        };

                        let depth = queue_depth.fetch_add(1, Ordering::SeqCst) + 1;
                        if depth >= self.config.high_watermark {
                            consumer.pause();
                        }

                        let engine = Arc::clone(&self);
                        let depth_counter = Arc::clone(&queue_depth);
                        let consumer_handle = Arc::clone(&consumer);
                        let permits = Arc::clone(&workers);
                        tokio::spawn(async move {
                            let _permit = permits.acquire_owned().await;
                            let _ = engine.process(&opportunity, now_ms()).await;
                            let depth =
                                depth_counter.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
                            if depth <= engine.config.low_watermark && consumer_handle.is_paused()
                            {
                                consumer_handle.resume();
                            }
                        });
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        consumer.stop();
                        info!("execution engine stopping");
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use crate::execution::circuit_breaker::{BreakerConfig, BreakerState};
    use crate::execution::rpc::mock::MockRpc;
    use crate::execution::simulation::SimulationProvider;
    use crate::execution::TxRequest;
    use crate::types::{DexName, OpportunityKind, SwapStep};
    use alloy::primitives::U256;
    use async_trait::async_trait;

    struct RecordingSubmitter {
        submitted: Mutex<Vec<TxRequest>>,
        accept: bool,
    }

    #[async_trait]
    impl TxSubmitter for RecordingSubmitter {
        async fn submit(&self, request: &TxRequest) -> Result<SubmitResult, CoreError> {
            self.submitted.lock().push(request.clone());
            if self.accept {
                Ok(SubmitResult {
                    submitted_hash: "0xhash".into(),
                    accepted: true,
                    rebate_wei: None,
                })
            } else {
                Err(CoreError::Transient("relay down".into()))
            }
        }
    }

    struct FixedSim(Option<SimOutcome>);

    #[async_trait]
    impl SimulationProvider for FixedSim {
        fn name(&self) -> &'static str {
            "fixed"
        }
        fn health(&self) -> f64 {
            1.0
        }
        async fn simulate(&self, _request: &TxRequest) -> Result<SimOutcome, CoreError> {
            match &self.0 {
                Some(outcome) => Ok(outcome.clone()),
                None => Err(CoreError::Transient("down".into())),
            }
        }
    }

    fn risk() -> RiskConfig {
        RiskConfig {
            min_win_probability: 0.4,
            min_ev_usd: 1.0,
            ..RiskConfig::default()
        }
    }

    fn opportunity(chain: Chain, profit_usd: f64) -> Opportunity {
        Opportunity {
            id: format!("op-{}-{}", chain, profit_usd),
            kind: OpportunityKind::CrossDex,
            buy_chain: chain,
            sell_chain: chain,
            buy_dex: DexName::UniswapV3,
            sell_dex: DexName::SushiSwap,
            token_in: Address::repeat_byte(0x02),
            token_out: Address::repeat_byte(0x02),
            path: vec![SwapStep {
                router: Address::repeat_byte(0xe1),
                token_in: Address::repeat_byte(0x02),
                token_out: Address::repeat_byte(0x01),
                amount_in: U256::from(1_000u64),
                data: Vec::new(),
            }],
            amount_in: U256::from(1_000u64),
            expected_amount_out: U256::from(1_050u64),
            expected_profit_usd: profit_usd,
            profit_percentage: 2.0,
            gas_estimate_usd: 1.0,
            confidence: 0.8,
            whale_triggered: false,
            ml_confidence_boost: 1.0,
            flash_protocol: None,
            detected_at_ms: 0,
            expires_at_ms: u64::MAX,
        }
    }

    struct Harness {
        engine: Arc<ExecutionEngine>,
        submitter: Arc<RecordingSubmitter>,
        breakers: Arc<CircuitBreakerManager>,
        drawdown: Arc<DrawdownCircuitBreaker>,
        stats: Arc<CoreStats>,
    }

    fn harness(sim: Option<SimOutcome>, accept: bool) -> Harness {
        let stats = Arc::new(CoreStats::new());
        let breakers = Arc::new(CircuitBreakerManager::new(BreakerConfig::default(), None));
        let drawdown = Arc::new(DrawdownCircuitBreaker::new(&risk(), 0));
        let tracker = Arc::new(ExecutionProbabilityTracker::new());
        let submitter = Arc::new(RecordingSubmitter {
            submitted: Mutex::new(Vec::new()),
            accept,
        });
        let mut wallets = HashMap::new();
        let mut executors = HashMap::new();
        for chain in Chain::all() {
            wallets.insert(*chain, Address::repeat_byte(0xaa));
            executors.insert(*chain, Address::repeat_byte(0xcc));
        }
        let engine = Arc::new(ExecutionEngine::new(
            ExecutionConfig::default(),
            risk(),
            Arc::clone(&breakers),
            Arc::clone(&drawdown),
            tracker,
            Arc::new(SimulationService::new(
                vec![Arc::new(FixedSim(sim)) as Arc<dyn SimulationProvider>],
                100,
            )),
            Arc::new(GasPriceCache::new(HashMap::new())),
            Arc::new(NonceManager::new(
                crate::config::NonceConfig::default(),
                Arc::new(MockRpc::new(10)),
            )),
            Arc::clone(&submitter) as Arc<dyn TxSubmitter>,
            wallets,
            executors,
            Arc::clone(&stats),
        ));
        Harness {
            engine,
            submitter,
            breakers,
            drawdown,
            stats,
        }
    }

    fn success_sim() -> Option<SimOutcome> {
        Some(SimOutcome::Success {
            gas_used: Some(150_000),
            return_data: Vec::new(),
        })
    }

    #[tokio::test]
    async fn test_successful_execution() {
        let h = harness(success_sim(), true);
        let outcome = h
            .engine
            .process(&opportunity(Chain::Arbitrum, 100.0), 1_000)
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.tx_hash.as_deref(), Some("0xhash"));
        assert_eq!(h.submitter.submitted.lock().len(), 1);
        assert_eq!(h.submitter.submitted.lock()[0].nonce, Some(10));
        assert_eq!(h.stats.snapshot().succeeded, 1);
    }

    #[tokio::test]
    async fn test_drawdown_halt_blocks_everything() {
        let h = harness(success_sim(), true);
        // 6% daily loss on the default $10K book → HALT.
        h.drawdown.record_outcome(-600.0, 500);

        let result = h.engine.process(&opportunity(Chain::Arbitrum, 100.0), 1_000).await;
        assert_eq!(result.unwrap_err(), SkipReason::DrawdownHalt);
        assert!(h.submitter.submitted.lock().is_empty());
        assert_eq!(h.stats.snapshot().drawdown_blocks, 1);
    }

    #[tokio::test]
    async fn test_per_chain_circuit_isolation() {
        let h = harness(success_sim(), true);
        h.breakers.force_open(Chain::Ethereum, "test", 1_000);

        // Arbitrum executes normally.
        let ok = h.engine.process(&opportunity(Chain::Arbitrum, 100.0), 1_000).await;
        assert!(ok.unwrap().success);

        // Ethereum is rejected with CIRCUIT_OPEN.
        let blocked = h.engine.process(&opportunity(Chain::Ethereum, 100.0), 1_000).await;
        assert_eq!(blocked.unwrap_err(), SkipReason::CircuitOpen);

        let snapshot = h.stats.snapshot();
        assert_eq!(snapshot.succeeded, 1);
        assert_eq!(snapshot.circuit_breaker_blocks, 1);
    }

    #[tokio::test]
    async fn test_simulation_revert_skips_without_side_effects() {
        let h = harness(
            Some(SimOutcome::Revert {
                reason: "INSUFFICIENT_OUTPUT_AMOUNT".into(),
            }),
            true,
        );
        let result = h.engine.process(&opportunity(Chain::Arbitrum, 200.0), 1_000).await;
        assert_eq!(result.unwrap_err(), SkipReason::SimulationRevert);
        assert!(h.submitter.submitted.lock().is_empty());
        assert_eq!(h.stats.snapshot().simulation_predicted_reverts, 1);
        // No outcome recorded: breaker untouched, nothing executed.
        assert_eq!(h.breakers.state(Chain::Arbitrum), BreakerState::Closed);
        assert_eq!(h.stats.snapshot().executed, 0);
    }

    #[tokio::test]
    async fn test_below_threshold_skips_simulation() {
        // Simulator would revert, but a $20 opportunity (< $50 threshold)
        // never reaches it.
        let h = harness(
            Some(SimOutcome::Revert {
                reason: "would fail".into(),
            }),
            true,
        );
        let outcome = h
            .engine
            .process(&opportunity(Chain::Arbitrum, 20.0), 1_000)
            .await
            .unwrap();
        assert!(outcome.success);
    }

    #[tokio::test]
    async fn test_expired_opportunity_skipped() {
        let h = harness(success_sim(), true);
        let mut opp = opportunity(Chain::Arbitrum, 100.0);
        opp.expires_at_ms = 500;
        let result = h.engine.process(&opp, 1_000).await;
        assert_eq!(result.unwrap_err(), SkipReason::Expired);
    }

    #[tokio::test]
    async fn test_failed_submission_records_failure() {
        let h = harness(success_sim(), false);
        let outcome = h
            .engine
            .process(&opportunity(Chain::Arbitrum, 100.0), 1_000)
            .await
            .unwrap();
        assert!(!outcome.success);
        assert_eq!(h.stats.snapshot().failed, 1);
        // Failure fed the chain breaker.
        for _ in 0..4 {
            h.engine
                .process(&opportunity(Chain::Arbitrum, 100.0), 1_000)
                .await
                .unwrap();
        }
        assert_eq!(h.breakers.state(Chain::Arbitrum), BreakerState::Open);
    }

    #[tokio::test]
    async fn test_simulation_outage_does_not_block() {
        let h = harness(None, true); // provider errors on every call
        let outcome = h
            .engine
            .process(&opportunity(Chain::Arbitrum, 200.0), 1_000)
            .await
            .unwrap();
        assert!(outcome.success);
    }
}
