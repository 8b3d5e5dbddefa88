//! Cross-chain detector.
//!
//! A periodic scan (100 ms prod / 200 ms dev) over an indexed snapshot of
//! every (chain, dex, pair) price the bus has delivered. For each pair the
//! widest cross-chain spread is gated, in order, by: the hard staleness
//! cutoff (no boost can override it), the ML prediction (50 ms hard
//! timeout), confidence, pre-validation, and bridge cost. Survivors publish
//! with a fingerprint; the publisher deduplicates.

use crate::bus::{decode_payload, StreamConsumer};
use crate::cache::{GasPreset, GasPriceCache};
use crate::config::DetectorConfig;
use crate::detector::bridge_cost::{estimate_with_timeout, BridgeCostSource};
use crate::detector::confidence::{self, ConfidenceInputs, SignalAlignment};
use crate::detector::ml::{CachedPredictor, MlDirection};
use crate::detector::price_data::{PriceDataManager, PricePoint};
use crate::detector::publisher::OpportunityPublisher;
use crate::detector::TokenPricer;
use crate::stats::CoreStats;
use crate::types::{
    f64_to_raw, now_ms, Chain, Opportunity, OpportunityKind, PriceUpdate, SwapStep, WhaleAlert,
};
use alloy::primitives::{Address, U256};
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

/// Default notional committed to a cross-chain route, USD.
const DEFAULT_NOTIONAL_USD: f64 = 1_000.0;
/// Cross-chain opportunities live longer than same-chain ones — bridging is
/// slow and the execution side re-validates anyway.
const CROSS_CHAIN_EXPIRY_MS: u64 = 30_000;
/// Whale signals older than this no longer influence confidence.
const WHALE_SIGNAL_TTL_MS: u64 = 60_000;

pub struct CrossChainDetector {
    config: DetectorConfig,
    data: Arc<PriceDataManager>,
    ml: Arc<CachedPredictor>,
    prevalidator: Arc<crate::detector::prevalidation::PreValidator>,
    bridge: Arc<dyn BridgeCostSource>,
    publisher: Arc<OpportunityPublisher>,
    gas: Arc<GasPriceCache>,
    pricer: Arc<dyn TokenPricer>,
    /// pair key → most recent whale alert.
    whales: Mutex<lru::LruCache<String, WhaleAlert>>,
    notional_usd: f64,
    stats: Arc<CoreStats>,
    is_stopping: AtomicBool,
}

impl CrossChainDetector {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: DetectorConfig,
        data: Arc<PriceDataManager>,
        ml: Arc<CachedPredictor>,
        prevalidator: Arc<crate::detector::prevalidation::PreValidator>,
        bridge: Arc<dyn BridgeCostSource>,
        publisher: Arc<OpportunityPublisher>,
        gas: Arc<GasPriceCache>,
        pricer: Arc<dyn TokenPricer>,
        stats: Arc<CoreStats>,
    ) -> Self {
        Self {
            config,
            data,
            ml,
            prevalidator,
            bridge,
            publisher,
            gas,
            pricer,
            whales: Mutex::new(lru::LruCache::new(NonZeroUsize::new(1_024).unwrap())),
            notional_usd: DEFAULT_NOTIONAL_USD,
            stats,
            is_stopping: AtomicBool::new(false),
        }
    }

    pub fn stop(&self) {
        self.is_stopping.store(true, Ordering::SeqCst);
    }

    pub fn on_price_update(&self, update: PriceUpdate) {
        self.data.on_update(update);
    }

    pub fn on_whale_alert(&self, alert: WhaleAlert) {
        self.whales.lock().put(alert.token_key(), alert);
    }

    /// One scan pass. Returns the opportunities that cleared every gate.
    pub async fn detect_once(&self, now_ms: u64) -> Vec<Opportunity> {
        if self.is_stopping.load(Ordering::SeqCst) {
            return Vec::new();
        }
        let snapshot = self.data.snapshot();

        // Warm the ML cache for the whole snapshot in parallel — each call
        // carries its own hard timeout, so this is bounded.
        let targets: Vec<(Chain, String)> = snapshot
            .iter()
            .flat_map(|(key, points)| {
                points
                    .iter()
                    .map(|p| (p.chain, key.clone()))
                    .collect::<Vec<_>>()
            })
            .collect();
        self.ml.prefetch(targets, now_ms).await;

        let mut out = Vec::new();
        for (pair_key, points) in snapshot {
            if let Some(opportunity) = self.scan_pair(&pair_key, &points, now_ms).await {
                out.push(opportunity);
            }
        }
        out
    }

    async fn scan_pair(
        &self,
        pair_key: &str,
        points: &[PricePoint],
        now_ms: u64,
    ) -> Option<Opportunity> {
        // Widest spread across chains.
        let mut best: Option<(&PricePoint, &PricePoint)> = None;
        for low in points {
            if low.price <= 0.0 {
                continue;
            }
            for high in points {
                if low.chain == high.chain || high.price <= low.price {
                    continue;
                }
                let better = match best {
                    None => true,
                    Some((bl, bh)) => {
                        (high.price - low.price) / low.price > (bh.price - bl.price) / bl.price
                    }
                };
                if better {
                    best = Some((low, high));
                }
            }
        }
        let (low, high) = best?;

        // Hard staleness gate — both endpoints, unconditionally. No
        // confidence boost can resurrect a stale pair.
        let cutoff = self.config.detection_stale_cutoff_ms;
        let low_age = now_ms.saturating_sub(low.timestamp_ms);
        let high_age = now_ms.saturating_sub(high.timestamp_ms);
        if low_age > cutoff || high_age > cutoff {
            self.stats
                .detection
                .stale_pair_rejections
                .fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let raw_profit_pct = (high.price - low.price) / low.price * 100.0;
        if raw_profit_pct < self.config.min_cross_chain_profit_pct {
            return None;
        }

        // ML gate: cached, hard 50 ms timeout; a late prediction is null.
        let prediction = self.ml.predict(low.chain, pair_key, now_ms).await;
        let ml_signal = prediction.map(|p| {
            let alignment = match p.direction {
                MlDirection::Up => SignalAlignment::Aligned,
                MlDirection::Down => SignalAlignment::Opposed,
                MlDirection::Neutral => SignalAlignment::Neutral,
            };
            (alignment, p.confidence)
        });

        let whale_signal = {
            let mut whales = self.whales.lock();
            whales.get(pair_key).and_then(|alert| {
                if now_ms.saturating_sub(alert.timestamp_ms) > WHALE_SIGNAL_TTL_MS {
                    return None;
                }
                let alignment = whale_alignment(alert, low.chain, high.chain);
                Some((alignment, alert.super_whale))
            })
        };

        let result = confidence::calculate(&ConfidenceInputs {
            profit_pct: raw_profit_pct,
            price_age_ms: low_age.max(high_age),
            ml: ml_signal,
            whale: whale_signal,
        });
        if result.confidence < self.config.min_confidence {
            return None;
        }

        // Bridge cost + both legs' gas, netted out of the notional's profit.
        let bridge = estimate_with_timeout(self.bridge.as_ref(), low.chain, high.chain).await;
        let gas_usd = self.gas.estimate_preset_usd(low.chain, GasPreset::SimpleSwap)
            + self.gas.estimate_preset_usd(high.chain, GasPreset::SimpleSwap);
        let gross_usd = self.notional_usd * raw_profit_pct / 100.0;
        let net_profit_usd = gross_usd - bridge.fee_usd - gas_usd;
        if net_profit_usd <= 0.0 {
            debug!(
                "{}: spread {:.2}% eaten by bridge ${:.2} + gas ${:.2}",
                pair_key, raw_profit_pct, bridge.fee_usd, gas_usd
            );
            return None;
        }

        let quote_usd = self.pricer.usd_price(low.chain, &low.token1)?;
        let amount_in = f64_to_raw(self.notional_usd / quote_usd, low.decimals1);

        let opportunity = self.build_opportunity(
            low,
            high,
            amount_in,
            net_profit_usd,
            raw_profit_pct,
            gas_usd,
            result.confidence,
            result.ml_factor,
            whale_signal.is_some(),
            now_ms,
        );

        // Detection-time pre-validation: sampled, budgeted, fail-open.
        if !self.prevalidator.validate(&opportunity).await {
            return None;
        }

        info!(
            "cross-chain {} | buy {}@{:.6} sell {}@{:.6} | net ${:.2} conf {:.2}",
            pair_key, low.chain, low.price, high.chain, high.price,
            net_profit_usd, result.confidence
        );
        Some(opportunity)
    }

    #[allow(clippy::too_many_arguments)]
    fn build_opportunity(
        &self,
        low: &PricePoint,
        high: &PricePoint,
        amount_in: U256,
        net_profit_usd: f64,
        profit_pct: f64,
        gas_usd: f64,
        confidence: f64,
        ml_factor: f64,
        whale_triggered: bool,
        now_ms: u64,
    ) -> Opportunity {
        let path = vec![
            SwapStep {
                router: Address::ZERO, // resolved by the execution strategy
                token_in: low.token1,
                token_out: low.token0,
                amount_in,
                data: Vec::new(),
            },
            SwapStep {
                router: Address::ZERO,
                token_in: high.token0,
                token_out: high.token1,
                amount_in: U256::ZERO,
                data: Vec::new(),
            },
        ];
        Opportunity {
            id: Opportunity::fingerprint(
                OpportunityKind::CrossChain,
                low.chain,
                high.chain,
                low.dex,
                high.dex,
                &low.token1,
                &high.token1,
                self.notional_usd,
                now_ms,
            ),
            kind: OpportunityKind::CrossChain,
            buy_chain: low.chain,
            sell_chain: high.chain,
            buy_dex: low.dex,
            sell_dex: high.dex,
            token_in: low.token1,
            token_out: high.token1,
            path,
            amount_in,
            expected_amount_out: amount_in + f64_to_raw(net_profit_usd, low.decimals1),
            expected_profit_usd: net_profit_usd,
            profit_percentage: profit_pct,
            gas_estimate_usd: gas_usd,
            confidence,
            whale_triggered,
            ml_confidence_boost: ml_factor,
            flash_protocol: None,
            detected_at_ms: now_ms,
            expires_at_ms: now_ms + CROSS_CHAIN_EXPIRY_MS,
        }
    }

    /// Drive the detector: consume price updates and whale alerts, scan on
    /// the configured interval, publish survivors.
    pub async fn run(
        self: Arc<Self>,
        price_consumer: StreamConsumer,
        whale_consumer: StreamConsumer,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut tick =
            tokio::time::interval(Duration::from_millis(self.config.detection_interval_ms));
        loop {
            tokio::select! {
                batch = price_consumer.next_batch(256, 20) => {
                    match batch {
                        Ok(batch) => {
                            for msg in batch {
                                if let Some(update) = decode_payload::<PriceUpdate>(&msg) {
                                    self.on_price_update(update);
                                }
                                let _ = price_consumer.ack(&msg.id).await;
                            }
                        }
                        Err(_) => tokio::time::sleep(Duration::from_millis(250)).await,
                    }
                }
                batch = whale_consumer.next_batch(64, 20) => {
                    match batch {
                        Ok(batch) => {
                            for msg in batch {
                                if let Some(alert) = decode_payload::<WhaleAlert>(&msg) {
                                    self.on_whale_alert(alert);
                                }
                                let _ = whale_consumer.ack(&msg.id).await;
                            }
                        }
                        Err(_) => tokio::time::sleep(Duration::from_millis(250)).await,
                    }
                }
                _ = tick.tick() => {
                    let now = now_ms();
                    let found = self.detect_once(now).await;
                    for opportunity in &found {
                        self.publisher.publish(opportunity, now).await;
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        self.stop();
                        price_consumer.stop();
                        whale_consumer.stop();
                        return;
                    }
                }
            }
        }
    }
}

/// Whale alignment relative to a buy-low/sell-high route: buying pressure on
/// the cheap chain (or selling pressure on the expensive one) supports the
/// spread converging while we hold.
fn whale_alignment(alert: &WhaleAlert, buy_chain: Chain, sell_chain: Chain) -> SignalAlignment {
    use crate::types::SwapDirection;
    if alert.chain == buy_chain {
        match alert.direction {
            SwapDirection::Buy => SignalAlignment::Aligned,
            SwapDirection::Sell => SignalAlignment::Opposed,
        }
    } else if alert.chain == sell_chain {
        match alert.direction {
            SwapDirection::Sell => SignalAlignment::Aligned,
            SwapDirection::Buy => SignalAlignment::Opposed,
        }
    } else {
        SignalAlignment::Neutral
    }
}
