//! Opportunity publisher with time-bounded fingerprint deduplication.
//!
//! A duplicate publish inside the window returns false without touching the
//! bus — the dedupe check is the cheap guard in front of every producer
//! write, shared by the chain detectors and the cross-chain detector.

use crate::bus::{encode_payload, streams, BatchingProducer};
use crate::stats::CoreStats;
use crate::types::Opportunity;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

pub struct OpportunityPublisher {
    producer: Arc<BatchingProducer>,
    /// fingerprint → first-published ms.
    seen: Mutex<lru::LruCache<String, u64>>,
    window_ms: u64,
    stats: Arc<CoreStats>,
}

impl OpportunityPublisher {
    pub fn new(producer: Arc<BatchingProducer>, window_ms: u64, stats: Arc<CoreStats>) -> Self {
        Self {
            producer,
            seen: Mutex::new(lru::LruCache::new(NonZeroUsize::new(8_192).unwrap())),
            window_ms,
            stats,
        }
    }

    /// Publish to the opportunity stream. Returns false for duplicates
    /// (fingerprint seen inside the window) — no bus contact in that case.
    pub async fn publish(&self, opportunity: &Opportunity, now_ms: u64) -> bool {
        {
            let mut seen = self.seen.lock();
            if let Some(first) = seen.get(&opportunity.id) {
                if now_ms.saturating_sub(*first) < self.window_ms {
                    self.stats
                        .detection
                        .duplicates_suppressed
                        .fetch_add(1, Ordering::Relaxed);
                    return false;
                }
            }
            seen.put(opportunity.id.clone(), now_ms);
        }

        let fields = encode_payload(
            opportunity,
            &[
                ("kind", opportunity.kind.to_string()),
                ("buy_chain", opportunity.buy_chain.to_string()),
                ("sell_chain", opportunity.sell_chain.to_string()),
            ],
        );
        let accepted = self.producer.publish(streams::OPPORTUNITIES, fields).await;
        if accepted {
            self.stats
                .detection
                .opportunities_published
                .fetch_add(1, Ordering::Relaxed);
        }
        accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{MemoryBackend, StreamBackend, StreamBus};
    use crate::types::{Chain, DexName, OpportunityKind};
    use alloy::primitives::{Address, U256};

    fn opportunity(id: &str) -> Opportunity {
        Opportunity {
            id: id.to_string(),
            kind: OpportunityKind::CrossDex,
            buy_chain: Chain::Polygon,
            sell_chain: Chain::Polygon,
            buy_dex: DexName::QuickSwap,
            sell_dex: DexName::SushiSwap,
            token_in: Address::ZERO,
            token_out: Address::ZERO,
            path: Vec::new(),
            amount_in: U256::from(1u64),
            expected_amount_out: U256::from(2u64),
            expected_profit_usd: 20.0,
            profit_percentage: 1.0,
            gas_estimate_usd: 0.1,
            confidence: 0.7,
            whale_triggered: false,
            ml_confidence_boost: 1.0,
            flash_protocol: None,
            detected_at_ms: 0,
            expires_at_ms: 10_000,
        }
    }

    async fn setup() -> (StreamBus, OpportunityPublisher, Arc<BatchingProducer>) {
        let backend = Arc::new(MemoryBackend::new()) as Arc<dyn StreamBackend>;
        let bus = StreamBus::new(backend, 1);
        let producer = Arc::new(BatchingProducer::new(bus.clone(), 64, 1, 16));
        let publisher = OpportunityPublisher::new(
            Arc::clone(&producer),
            5_000,
            Arc::new(CoreStats::new()),
        );
        (bus, publisher, producer)
    }

    #[tokio::test]
    async fn test_duplicate_inside_window_returns_false() {
        let (bus, publisher, producer) = setup().await;
        assert!(publisher.publish(&opportunity("fp-1"), 1_000).await);
        assert!(!publisher.publish(&opportunity("fp-1"), 2_000).await);
        producer.flush().await;
        assert_eq!(bus.stream_len(streams::OPPORTUNITIES).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_same_fingerprint_after_window_republishes() {
        let (bus, publisher, producer) = setup().await;
        assert!(publisher.publish(&opportunity("fp-1"), 1_000).await);
        assert!(publisher.publish(&opportunity("fp-1"), 7_000).await);
        producer.flush().await;
        assert_eq!(bus.stream_len(streams::OPPORTUNITIES).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_distinct_fingerprints_both_publish() {
        let (bus, publisher, producer) = setup().await;
        assert!(publisher.publish(&opportunity("fp-1"), 1_000).await);
        assert!(publisher.publish(&opportunity("fp-2"), 1_000).await);
        producer.flush().await;
        assert_eq!(bus.stream_len(streams::OPPORTUNITIES).await.unwrap(), 2);
    }
}
