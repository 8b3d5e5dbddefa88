//! Multi-chain DEX arbitrage detection and execution core.
//!
//! Four subsystems connected only through the event bus: chain ingestion
//! (WS subscriptions → decoded reserve updates), the bus itself (Redis
//! Streams semantics), detection (per-chain and cross-chain), and the
//! execution pipeline (risk gates, simulation, nonce, MEV submission).

pub mod bus;
pub mod cache;
pub mod config;
pub mod detector;
pub mod error;
pub mod execution;
pub mod health;
pub mod ingestion;
pub mod risk;
pub mod stats;
pub mod types;

// Re-export commonly used types
pub use config::{load_config, AppConfig};
pub use error::{CoreError, SkipReason};
pub use stats::CoreStats;
pub use types::{Chain, DexName, Opportunity, OpportunityKind, PriceUpdate, SwapEvent, TokenPair};
