//! Error taxonomy and typed skip reasons.
//!
//! Hot-path operations never raise across component boundaries — they return
//! a typed result carrying success or a reason. `anyhow` is reserved for
//! init/start/stop paths.

use thiserror::Error;

/// Core error taxonomy. Transient variants are retried with backoff;
/// RateLimited triggers provider rotation and cooldown, never fatal;
/// Validation errors are counted and dropped; Fatal surfaces to the operator
/// and the owning service enters a degraded state.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("transient I/O: {0}")]
    Transient(String),

    #[error("rate limited by {provider}: cooldown {cooldown_ms}ms")]
    RateLimited { provider: String, cooldown_ms: u64 },

    #[error("validation: {0}")]
    Validation(String),

    #[error("bus backend unavailable after retry budget: {0}")]
    BackendUnavailable(String),

    #[error("deadline exceeded: {0}")]
    Timeout(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl CoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, CoreError::Transient(_) | CoreError::Timeout(_))
    }
}

/// Policy rejects from the execution pipeline. These are recorded, not raised;
/// a skip is normal operation, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SkipReason {
    /// Per-chain circuit breaker is OPEN and cooldown has not expired.
    CircuitOpen,
    /// Drawdown breaker is in HALT.
    DrawdownHalt,
    /// Expected value below the configured threshold.
    EvBelowThreshold,
    /// Win probability below the configured minimum.
    WinProbabilityLow,
    /// Kelly-sized position fell below the minimum trade fraction.
    PositionTooSmall,
    /// Pre-flight simulation predicted a revert.
    SimulationRevert,
    /// Opportunity expired before execution started.
    Expired,
    /// Fingerprint already seen inside the dedupe window.
    DuplicateOpportunity,
    /// Route is suppressed by the escalating route cooldown.
    RouteCooldown,
    /// No strategy supports this opportunity kind on this chain.
    NoStrategy,
    /// Nonce allocation failed after one resync retry.
    NonceConflict,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::CircuitOpen => "CIRCUIT_OPEN",
            SkipReason::DrawdownHalt => "DRAWDOWN_HALT",
            SkipReason::EvBelowThreshold => "EV_BELOW_THRESHOLD",
            SkipReason::WinProbabilityLow => "WIN_PROBABILITY_LOW",
            SkipReason::PositionTooSmall => "POSITION_TOO_SMALL",
            SkipReason::SimulationRevert => "SIMULATION_REVERT",
            SkipReason::Expired => "EXPIRED",
            SkipReason::DuplicateOpportunity => "DUPLICATE_OPPORTUNITY",
            SkipReason::RouteCooldown => "ROUTE_COOLDOWN",
            SkipReason::NoStrategy => "NO_STRATEGY",
            SkipReason::NonceConflict => "NONCE_CONFLICT",
        }
    }
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
