//! Chain ingestion: WS subscriptions → decoder → detector + swap filter →
//! bus. One instance per chain; the chain's detector lives in-process so a
//! Sync event goes from socket to published opportunity without touching
//! the bus in between.

pub mod decoder;
pub mod swap_filter;
pub mod ws_manager;

pub use swap_filter::{FilterAction, StaticValueOracle, SwapEventFilter, ValueOracle};
pub use ws_manager::{SubscriptionTopic, WsEvent, WsManager};

use crate::bus::{encode_payload, streams, BatchingProducer, EventBatcher};
use crate::config::ChainConfig;
use crate::detector::{ChainDetector, OpportunityPublisher};
use crate::ingestion::decoder::{decode_log, DecodedEvent};
use crate::stats::CoreStats;
use crate::types::{now_ms, Chain, PriceUpdate, SwapEvent};
use alloy::primitives::{Address, U256};
use alloy::rpc::types::Filter;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Housekeeping cadence for the swap filter's windows.
const FILTER_POLL_MS: u64 = 1_000;
/// Same-pair price updates inside this window coalesce into one message.
const PRICE_BATCH_WAIT_MS: u64 = 5;
const PRICE_BATCH_MAX: usize = 16;

/// Factory-level subscriptions: one PairCreated filter over all factory
/// addresses plus chain-wide Sync and Swap topic filters. Three
/// subscriptions per chain regardless of how many pairs are watched.
pub fn build_topics(config: &ChainConfig) -> Vec<SubscriptionTopic> {
    let mut topics = Vec::new();
    let factories: Vec<Address> = config.dexes.iter().map(|d| d.factory).collect();
    if !factories.is_empty() {
        topics.push(SubscriptionTopic {
            name: "factory-pair-created".into(),
            filter: Filter::new()
                .address(factories)
                .event_signature(decoder::PAIR_CREATED_TOPIC),
        });
    }
    topics.push(SubscriptionTopic {
        name: "pool-sync".into(),
        filter: Filter::new().event_signature(decoder::SYNC_TOPIC),
    });
    topics.push(SubscriptionTopic {
        name: "pool-swap".into(),
        filter: Filter::new().event_signature(decoder::SWAP_TOPIC),
    });
    topics
}

pub struct ChainIngestion {
    chain: Chain,
    detector: Arc<ChainDetector>,
    filter: SwapEventFilter,
    oracle: Arc<dyn ValueOracle>,
    producer: Arc<BatchingProducer>,
    publisher: Arc<OpportunityPublisher>,
    /// Coalesces same-pair updates: a burst of Syncs on one pair becomes
    /// one downstream message carrying the latest state.
    price_batcher: EventBatcher<Address, PriceUpdate>,
    stats: Arc<CoreStats>,
}

impl ChainIngestion {
    pub fn new(
        chain: Chain,
        detector: Arc<ChainDetector>,
        filter: SwapEventFilter,
        oracle: Arc<dyn ValueOracle>,
        producer: Arc<BatchingProducer>,
        publisher: Arc<OpportunityPublisher>,
        stats: Arc<CoreStats>,
    ) -> Self {
        Self {
            chain,
            detector,
            filter,
            oracle,
            producer,
            publisher,
            price_batcher: EventBatcher::new(PRICE_BATCH_MAX, PRICE_BATCH_WAIT_MS),
            stats,
        }
    }

    /// Consume WS events until shutdown. The WS manager runs as its own
    /// task and feeds `events`.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<WsEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut housekeeping = tokio::time::interval(Duration::from_millis(FILTER_POLL_MS));
        info!("{}: ingestion pipeline running", self.chain);
        loop {
            let batch_deadline = self.price_batcher.next_deadline();
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Some(event) => self.handle_ws_event(event).await,
                        None => {
                            warn!("{}: WS event channel closed", self.chain);
                            break;
                        }
                    }
                }
                _ = async {
                    match batch_deadline {
                        Some(at) => tokio::time::sleep_until(at.into()).await,
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    let expired = self.price_batcher.poll_expired(Instant::now());
                    for (_, batch) in expired {
                        self.publish_coalesced(batch).await;
                    }
                }
                _ = housekeeping.tick() => {
                    let actions = self.filter.poll(now_ms());
                    for action in actions {
                        self.publish_filter_action(action).await;
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        // Flush whatever the batcher still holds before going quiet.
        for (_, batch) in self.price_batcher.stop() {
            self.publish_coalesced(batch).await;
        }
        self.detector.stop();
        info!("{}: ingestion pipeline stopped", self.chain);
    }

    async fn handle_ws_event(&mut self, event: WsEvent) {
        match event {
            WsEvent::Message { log, .. } => {
                self.stats.ingestion.ws_messages.fetch_add(1, Ordering::Relaxed);
                match decode_log(&log) {
                    Ok(Some(decoded)) => self.handle_decoded(decoded).await,
                    Ok(None) => {}
                    Err(e) => {
                        self.stats
                            .ingestion
                            .decode_failures
                            .fetch_add(1, Ordering::Relaxed);
                        debug!("{}: dropped malformed log: {}", self.chain, e);
                    }
                }
            }
            WsEvent::Subscribed { provider, topics } => {
                info!("{}: subscribed to {} topics via {}", self.chain, topics, provider);
            }
            WsEvent::Reconnected { provider, attempt } => {
                self.stats.ingestion.reconnects.fetch_add(1, Ordering::Relaxed);
                info!("{}: reconnected via {} (attempt {})", self.chain, provider, attempt);
            }
            WsEvent::RateLimited { provider, cooldown_ms } => {
                self.stats.ingestion.rate_limits.fetch_add(1, Ordering::Relaxed);
                warn!("{}: {} rate limited, excluded {}ms", self.chain, provider, cooldown_ms);
            }
            WsEvent::StaleConnection { provider, last_message_age_ms } => {
                self.stats
                    .ingestion
                    .stale_rotations
                    .fetch_add(1, Ordering::Relaxed);
                warn!(
                    "{}: {} stale ({}ms silent), rotating",
                    self.chain, provider, last_message_age_ms
                );
            }
            WsEvent::DataGap { from_block, to_block } => {
                self.stats.ingestion.data_gaps.fetch_add(1, Ordering::Relaxed);
                warn!("{}: data gap blocks {}..{}", self.chain, from_block, to_block);
            }
            WsEvent::SubscriptionRecoveryPartial { failed_topics } => {
                warn!(
                    "{}: {} topics failed to resubscribe: {:?}",
                    self.chain,
                    failed_topics.len(),
                    failed_topics
                );
            }
        }
    }

    async fn handle_decoded(&mut self, decoded: DecodedEvent) {
        match decoded {
            DecodedEvent::ReserveSync {
                pair,
                reserve0,
                reserve1,
                block_number,
            } => {
                self.handle_sync(pair, reserve0, reserve1, block_number).await;
            }
            DecodedEvent::Swap {
                pair,
                sender,
                amount0_in,
                amount1_in,
                amount0_out,
                amount1_out,
                block_number,
                tx_hash,
                log_index,
            } => {
                let snapshot = self.detector.registry().snapshot(&pair);
                let in_watchlist = snapshot.is_some();
                let (dex, token0, token1) = snapshot
                    .map(|p| (p.dex, p.token0, p.token1))
                    .unwrap_or((crate::types::DexName::UniswapV2, Address::ZERO, Address::ZERO));
                let event = SwapEvent {
                    chain: self.chain,
                    dex,
                    pair_address: pair,
                    token0,
                    token1,
                    sender,
                    amount0_in,
                    amount1_in,
                    amount0_out,
                    amount1_out,
                    value_usd: 0.0, // set by the filter's value stage
                    tx_hash,
                    log_index,
                    block_number,
                    timestamp_ms: now_ms(),
                };
                let actions =
                    self.filter
                        .process(event, in_watchlist, self.oracle.as_ref(), now_ms());
                for action in actions {
                    self.publish_filter_action(action).await;
                }
            }
            DecodedEvent::PairCreated {
                factory,
                token0,
                token1,
                pair,
                block_number,
            } => {
                self.detector
                    .register_from_factory(&factory, token0, token1, pair, block_number);
            }
        }
    }

    async fn handle_sync(&mut self, pair: Address, reserve0: U256, reserve1: U256, block: u64) {
        let started = Instant::now();
        let Some((update, opportunities)) =
            self.detector.on_reserve_sync(&pair, reserve0, reserve1, block)
        else {
            return;
        };
        // Same-pair bursts coalesce; a full bucket flushes immediately.
        if let Some(batch) = self.price_batcher.push(pair, update, Instant::now()) {
            self.publish_coalesced(batch).await;
        }
        let now = now_ms();
        for opportunity in &opportunities {
            self.publisher.publish(opportunity, now).await;
        }
        self.stats
            .detection_latency
            .record(started.elapsed().as_millis() as u64);

        // Heavier multi-leg scan runs off the update-driven loop on a
        // blocking worker; if the pool can't take it, fall back inline.
        let detector = Arc::clone(&self.detector);
        let publisher = Arc::clone(&self.publisher);
        let handle = tokio::task::spawn_blocking(move || detector.scan_triangular(&pair));
        match handle.await {
            Ok(found) => {
                let now = now_ms();
                for opportunity in &found {
                    publisher.publish(opportunity, now).await;
                }
            }
            Err(e) => {
                debug!("{}: triangular scan worker failed ({}), running inline", self.chain, e);
                let found = self.detector.scan_triangular(&pair);
                let now = now_ms();
                for opportunity in &found {
                    self.publisher.publish(opportunity, now).await;
                }
            }
        }
    }

    /// Publish the latest update of a coalesced same-pair batch.
    async fn publish_coalesced(&self, batch: Vec<PriceUpdate>) {
        let coalesced = batch.len();
        let Some(update) = batch.into_iter().last() else {
            return;
        };
        let fields = encode_payload(
            &update,
            &[
                ("chain", update.chain.to_string()),
                ("dex", update.dex.to_string()),
                ("coalesced", coalesced.to_string()),
            ],
        );
        self.producer.publish(streams::PRICE_UPDATES, fields).await;
        self.stats
            .detection
            .price_updates_published
            .fetch_add(1, Ordering::Relaxed);
    }

    async fn publish_filter_action(&self, action: FilterAction) {
        match action {
            FilterAction::PublishSwap(event) => {
                let fields =
                    encode_payload(&event, &[("chain", event.chain.to_string())]);
                self.producer.publish(streams::SWAP_EVENTS, fields).await;
            }
            FilterAction::PublishWhale(alert) => {
                let fields = encode_payload(
                    &alert,
                    &[
                        ("chain", alert.chain.to_string()),
                        ("value_usd", format!("{:.0}", alert.value_usd)),
                    ],
                );
                self.producer.publish(streams::WHALE_ALERTS, fields).await;
            }
            FilterAction::PublishVolume(aggregate) => {
                let fields =
                    encode_payload(&aggregate, &[("chain", aggregate.chain.to_string())]);
                self.producer
                    .publish(streams::VOLUME_AGGREGATES, fields)
                    .await;
            }
            FilterAction::PublishMevPattern(pattern) => {
                let fields = encode_payload(
                    &pattern,
                    &[
                        ("chain", pattern.chain.to_string()),
                        ("type", "mev_pattern".to_string()),
                    ],
                );
                self.producer.publish(streams::SWAP_EVENTS, fields).await;
            }
        }
    }
}
