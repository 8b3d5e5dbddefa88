//! Risk gates for the execution pipeline: empirical win probability,
//! expected value, Kelly position sizing, and the global drawdown breaker.

pub mod drawdown;
pub mod ev;
pub mod kelly;
pub mod tracker;

pub use drawdown::{DrawdownCircuitBreaker, DrawdownState};
pub use ev::expected_value;
pub use kelly::KellyPositionSizer;
pub use tracker::{gas_price_bucket, ExecutionProbabilityTracker, OutcomeKey};
