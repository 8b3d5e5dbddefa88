//! Event bus: a persisted append-only log of named streams with consumer
//! groups (Redis Streams semantics), batched producer writes, and blocking
//! consumer reads with backpressure.
//!
//! Ingestion, detection, and execution only ever talk to each other through
//! this layer.

pub mod backend;
pub mod batcher;
pub mod client;
pub mod consumer;
pub mod producer;

pub use backend::{BusError, Fields, MemoryBackend, RedisBackend, StreamBackend, StreamMessage};
pub use batcher::EventBatcher;
pub use client::StreamBus;
pub use consumer::StreamConsumer;
pub use producer::{BatchingProducer, DeadLetter};

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Stream names shared with external collaborators. These are part of the
/// contract — renaming one breaks the coordinator and analytics.
pub mod streams {
    pub const PRICE_UPDATES: &str = "stream:price-updates";
    pub const SWAP_EVENTS: &str = "stream:swap-events";
    pub const OPPORTUNITIES: &str = "stream:opportunities";
    pub const WHALE_ALERTS: &str = "stream:whale-alerts";
    pub const VOLUME_AGGREGATES: &str = "stream:volume-aggregates";
    pub const HEALTH: &str = "stream:health";
    pub const EXECUTION_REQUESTS: &str = "stream:execution-requests";
    pub const PENDING_OPPORTUNITIES: &str = "stream:pending-opportunities";
    pub const CIRCUIT_BREAKER: &str = "stream:circuit-breaker";
    pub const SYSTEM_FAILOVER: &str = "stream:system-failover";
}

/// Consumer group names (also contract).
pub mod consumer_groups {
    pub const EXECUTION_ENGINE: &str = "execution-engine-group";
    pub const CROSS_CHAIN_DETECTOR: &str = "cross-chain-detector-group";
    pub const ANALYTICS: &str = "analytics-group";
}

/// Canonical payload: `data` = JSON body, plus any scalar fields passed for
/// server-side filtering.
pub fn encode_payload<T: Serialize>(body: &T, scalars: &[(&str, String)]) -> Fields {
    let mut fields = Vec::with_capacity(1 + scalars.len());
    fields.push((
        "data".to_string(),
        serde_json::to_string(body).unwrap_or_else(|_| "{}".to_string()),
    ));
    for (k, v) in scalars {
        fields.push((k.to_string(), v.clone()));
    }
    fields
}

/// Decode the `data` field of a message back into a typed body.
pub fn decode_payload<T: DeserializeOwned>(msg: &StreamMessage) -> Option<T> {
    let data = msg
        .fields
        .iter()
        .find(|(k, _)| k == "data")
        .map(|(_, v)| v.as_str())?;
    serde_json::from_str(data).ok()
}
