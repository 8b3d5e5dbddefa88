//! WebSocket subscription manager (per chain).
//!
//! Maintains a live log subscription against one of several providers,
//! auto-recovers from rate limits, disconnects, and silent stalls, and
//! rotates to the healthiest fallback. Factory-level subscriptions keep the
//! total subscription count flat (~25 across all chains) regardless of how
//! many pairs are watched.

use crate::config::WsConfig;
use crate::types::Chain;
use alloy::providers::{Provider, ProviderBuilder, WsConnect};
use alloy::rpc::types::{Filter, Log};
use futures::stream::{SelectAll, StreamExt};
use rand::Rng;
use std::pin::Pin;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Base provider-exclusion cooldown; doubles per repeat exclusion.
const EXCLUSION_BASE_MS: u64 = 30_000;
/// Exclusion cooldown cap.
const EXCLUSION_MAX_MS: u64 = 300_000;
/// Consecutive good messages that reset the reconnect attempt counter.
const ATTEMPT_RESET_STREAK: u32 = 3;
/// Per-topic resubscribe timeout after a reconnect.
const SUBSCRIBE_TIMEOUT_MS: u64 = 5_000;

/// A named subscription topic (factory or pool event class).
#[derive(Debug, Clone)]
pub struct SubscriptionTopic {
    pub name: String,
    pub filter: Filter,
}

/// Events emitted by the manager. `Message` carries raw logs for the
/// decoder; the rest are operational signals for stats and health.
#[derive(Debug)]
pub enum WsEvent {
    Message { chain: Chain, log: Log },
    Subscribed { provider: String, topics: usize },
    Reconnected { provider: String, attempt: u32 },
    RateLimited { provider: String, cooldown_ms: u64 },
    StaleConnection { provider: String, last_message_age_ms: u64 },
    DataGap { from_block: u64, to_block: u64 },
    SubscriptionRecoveryPartial { failed_topics: Vec<String> },
}

/// Classify an error payload as a rate limit: JSON-RPC codes -32005/-32016,
/// WS close codes 1008/1013, or known message patterns.
pub fn is_rate_limit(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("-32005")
        || lower.contains("-32016")
        || lower.contains("1008")
        || lower.contains("1013")
        || lower.contains("rate limit")
        || lower.contains("too many requests")
}

/// delay = min(base · mult^attempt, max) · (1 + U(0, jitter))
pub fn reconnect_delay(config: &WsConfig, attempt: u32, rng: &mut impl Rng) -> Duration {
    let raw = config.reconnect_base_ms as f64 * config.backoff_multiplier.powi(attempt as i32);
    let capped = raw.min(config.reconnect_max_ms as f64);
    let jitter = 1.0 + rng.gen_range(0.0..=config.jitter_fraction);
    Duration::from_millis((capped * jitter) as u64)
}

/// Exclusion cooldown: 30 s doubling per repeat, capped at 5 min.
pub fn exclusion_cooldown_ms(exclusion_count: u32) -> u64 {
    (EXCLUSION_BASE_MS.saturating_mul(2u64.saturating_pow(exclusion_count.saturating_sub(1))))
        .min(EXCLUSION_MAX_MS)
}

/// Per-provider health. The weighted score (latency 30% / reliability 40% /
/// freshness 60%, normalized to 1.0) ranks fallbacks — it selects, it never
/// excludes; exclusion is only ever rate-limit driven.
#[derive(Debug)]
pub struct ProviderHealth {
    pub url: String,
    latency_ewma_ms: f64,
    messages: u64,
    errors: u64,
    last_message_at: Option<Instant>,
    excluded_until: Option<Instant>,
    exclusion_count: u32,
}

impl ProviderHealth {
    pub fn new(url: String) -> Self {
        Self {
            url,
            latency_ewma_ms: 100.0,
            messages: 0,
            errors: 0,
            last_message_at: None,
            excluded_until: None,
            exclusion_count: 0,
        }
    }

    pub fn on_message(&mut self, latency_ms: f64, now: Instant) {
        self.messages += 1;
        self.latency_ewma_ms = 0.9 * self.latency_ewma_ms + 0.1 * latency_ms;
        self.last_message_at = Some(now);
    }

    pub fn on_error(&mut self) {
        self.errors += 1;
    }

    pub fn exclude(&mut self, now: Instant) -> u64 {
        self.exclusion_count += 1;
        let cooldown = exclusion_cooldown_ms(self.exclusion_count);
        self.excluded_until = Some(now + Duration::from_millis(cooldown));
        cooldown
    }

    pub fn is_excluded(&self, now: Instant) -> bool {
        self.excluded_until.map_or(false, |until| now < until)
    }

    /// Weighted health in [0, 1].
    pub fn score(&self, now: Instant) -> f64 {
        let latency = (1.0 - (self.latency_ewma_ms / 1_000.0).min(1.0)).max(0.0);
        let total = (self.messages + self.errors) as f64;
        let reliability = if total == 0.0 {
            0.5
        } else {
            self.messages as f64 / total
        };
        let freshness = match self.last_message_at {
            None => 0.5,
            Some(at) => {
                let age = now.duration_since(at).as_secs_f64();
                (1.0 - (age / 60.0).min(1.0)).max(0.0)
            }
        };
        (0.3 * latency + 0.4 * reliability + 0.6 * freshness) / 1.3
    }
}

/// Pick the non-excluded provider with the highest score.
pub fn select_provider(providers: &[ProviderHealth], now: Instant) -> Option<usize> {
    providers
        .iter()
        .enumerate()
        .filter(|(_, p)| !p.is_excluded(now))
        .max_by(|(_, a), (_, b)| {
            a.score(now)
                .partial_cmp(&b.score(now))
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|(i, _)| i)
}

pub struct WsManager {
    chain: Chain,
    config: WsConfig,
    providers: Vec<ProviderHealth>,
    topics: Vec<SubscriptionTopic>,
    events: mpsc::Sender<WsEvent>,
    last_block_seen: u64,
    ever_connected: bool,
}

impl WsManager {
    pub fn new(
        chain: Chain,
        primary_url: String,
        fallback_urls: Vec<String>,
        config: WsConfig,
        topics: Vec<SubscriptionTopic>,
        events: mpsc::Sender<WsEvent>,
    ) -> Self {
        let mut providers = vec![ProviderHealth::new(primary_url)];
        providers.extend(fallback_urls.into_iter().map(ProviderHealth::new));
        Self {
            chain,
            config,
            providers,
            topics,
            events,
            last_block_seen: 0,
            ever_connected: false,
        }
    }

    /// Connect/subscribe/read until shutdown. Never returns Err for network
    /// trouble — only when every send into the pipeline fails (pipeline gone).
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        let mut attempt: u32 = 0;

        loop {
            if *shutdown.borrow() {
                return;
            }

            let now = Instant::now();
            let provider_idx = match select_provider(&self.providers, now) {
                Some(i) => i,
                None => {
                    // Every provider cooling down: wait out the shortest
                    // exclusion rather than hammering anyone.
                    warn!("{}: all providers in exclusion window", self.chain);
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    continue;
                }
            };
            let url = self.providers[provider_idx].url.clone();

            match self
                .run_session(provider_idx, &url, &mut attempt, &mut shutdown)
                .await
            {
                SessionEnd::Shutdown => return,
                SessionEnd::PipelineClosed => {
                    error!("{}: event pipeline closed — ingestion exiting", self.chain);
                    return;
                }
                SessionEnd::RateLimited => {
                    let cooldown = self.providers[provider_idx].exclude(Instant::now());
                    let _ = self
                        .events
                        .send(WsEvent::RateLimited {
                            provider: url.clone(),
                            cooldown_ms: cooldown,
                        })
                        .await;
                    attempt += 1;
                }
                SessionEnd::Stale { age_ms } => {
                    let _ = self
                        .events
                        .send(WsEvent::StaleConnection {
                            provider: url.clone(),
                            last_message_age_ms: age_ms,
                        })
                        .await;
                    self.providers[provider_idx].on_error();
                    attempt += 1;
                }
                SessionEnd::Disconnected => {
                    self.providers[provider_idx].on_error();
                    attempt += 1;
                }
            }

            let delay = {
                let mut rng = rand::thread_rng();
                reconnect_delay(&self.config, attempt, &mut rng)
            };
            debug!(
                "{}: reconnecting in {:?} (attempt {})",
                self.chain, delay, attempt
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => { if *shutdown.borrow() { return; } }
            }
        }
    }

    async fn run_session(
        &mut self,
        provider_idx: usize,
        url: &str,
        attempt: &mut u32,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        let provider = match ProviderBuilder::new().connect_ws(WsConnect::new(url)).await {
            Ok(p) => p,
            Err(e) => {
                let msg = e.to_string();
                warn!("{}: WS connect to {} failed: {}", self.chain, url, msg);
                return if is_rate_limit(&msg) {
                    SessionEnd::RateLimited
                } else {
                    SessionEnd::Disconnected
                };
            }
        };

        // Resubscribe every topic with a per-topic timeout; partial failure
        // is reported, not fatal.
        let mut streams: SelectAll<Pin<Box<dyn futures::Stream<Item = Log> + Send>>> =
            SelectAll::new();
        let mut failed_topics = Vec::new();
        for topic in &self.topics {
            let subscribe = provider.subscribe_logs(&topic.filter);
            match tokio::time::timeout(Duration::from_millis(SUBSCRIBE_TIMEOUT_MS), subscribe)
                .await
            {
                Ok(Ok(sub)) => streams.push(Box::pin(sub.into_stream())),
                Ok(Err(e)) => {
                    warn!("{}: subscribe {} failed: {}", self.chain, topic.name, e);
                    failed_topics.push(topic.name.clone());
                }
                Err(_) => {
                    warn!("{}: subscribe {} timed out", self.chain, topic.name);
                    failed_topics.push(topic.name.clone());
                }
            }
        }
        if !failed_topics.is_empty() {
            let count = failed_topics.len();
            if self
                .events
                .send(WsEvent::SubscriptionRecoveryPartial { failed_topics })
                .await
                .is_err()
            {
                return SessionEnd::PipelineClosed;
            }
            if count == self.topics.len() {
                // Nothing subscribed — treat as a failed session.
                return SessionEnd::Disconnected;
            }
        }

        if self
            .events
            .send(WsEvent::Subscribed {
                provider: url.to_string(),
                topics: self.topics.len(),
            })
            .await
            .is_err()
        {
            return SessionEnd::PipelineClosed;
        }
        if self.ever_connected {
            info!("{}: reconnected to {} (attempt {})", self.chain, url, *attempt);
            if self
                .events
                .send(WsEvent::Reconnected {
                    provider: url.to_string(),
                    attempt: *attempt,
                })
                .await
                .is_err()
            {
                return SessionEnd::PipelineClosed;
            }
        } else {
            info!("{}: subscribed via {}", self.chain, url);
        }
        self.ever_connected = true;

        let staleness = Duration::from_millis(self.chain.ws_staleness_threshold_ms());
        let mut good_streak: u32 = 0;
        let mut gap_reported = false;
        let mut last_message = Instant::now();

        loop {
            tokio::select! {
                maybe_log = tokio::time::timeout(staleness, streams.next()) => {
                    match maybe_log {
                        Ok(Some(log)) => {
                            let now = Instant::now();
                            let latency = now.duration_since(last_message).as_millis() as f64;
                            last_message = now;
                            self.providers[provider_idx].on_message(latency.min(1_000.0), now);

                            if let Some(block) = log.block_number {
                                // First block after a reconnect: report the
                                // range we were dark for.
                                if !gap_reported {
                                    gap_reported = true;
                                    if self.last_block_seen > 0 && block > self.last_block_seen + 1 {
                                        if self.events.send(WsEvent::DataGap {
                                            from_block: self.last_block_seen,
                                            to_block: block,
                                        }).await.is_err() {
                                            return SessionEnd::PipelineClosed;
                                        }
                                    }
                                }
                                self.last_block_seen = self.last_block_seen.max(block);
                            }

                            good_streak = good_streak.saturating_add(1);
                            if good_streak == ATTEMPT_RESET_STREAK {
                                // Healthy again; future disconnects restart
                                // backoff from the base delay.
                                *attempt = 0;
                            }

                            if self.events.send(WsEvent::Message {
                                chain: self.chain,
                                log,
                            }).await.is_err() {
                                return SessionEnd::PipelineClosed;
                            }
                        }
                        Ok(None) => {
                            warn!("{}: subscription stream ended", self.chain);
                            return SessionEnd::Disconnected;
                        }
                        Err(_) => {
                            let age_ms = last_message.elapsed().as_millis() as u64;
                            warn!(
                                "{}: no messages for {}ms (threshold {}ms) — rotating provider",
                                self.chain, age_ms, staleness.as_millis()
                            );
                            return SessionEnd::Stale { age_ms };
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return SessionEnd::Shutdown;
                    }
                }
            }
        }
    }
}

enum SessionEnd {
    Shutdown,
    PipelineClosed,
    RateLimited,
    Stale { age_ms: u64 },
    Disconnected,
}
