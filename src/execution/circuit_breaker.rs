//! Per-chain circuit breakers.
//!
//! Lazy-created, fully independent instances: a failing chain opens its own
//! breaker and never affects any other chain's execution. Transitions are
//! emitted as events for the circuit-breaker stream; operators can force a
//! breaker open or closed out of band.

use crate::types::Chain;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub cooldown_ms: u64,
    pub half_open_max_attempts: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_ms: 300_000,
            half_open_max_attempts: 1,
        }
    }
}

/// Transition event for the circuit-breaker stream.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerTransition {
    pub chain: Chain,
    pub from: BreakerState,
    pub to: BreakerState,
    pub reason: String,
    pub ts_ms: u64,
}

struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at_ms: u64,
    half_open_attempts: u32,
}

impl Inner {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at_ms: 0,
            half_open_attempts: 0,
        }
    }
}

pub struct CircuitBreakerManager {
    config: BreakerConfig,
    breakers: DashMap<Chain, Inner>,
    /// Transition sink; wired to the bus by the service, unbounded so state
    /// changes never block on backpressure.
    events: Option<mpsc::UnboundedSender<BreakerTransition>>,
}

impl CircuitBreakerManager {
    pub fn new(config: BreakerConfig, events: Option<mpsc::UnboundedSender<BreakerTransition>>) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
            events,
        }
    }

    fn emit(&self, chain: Chain, from: BreakerState, to: BreakerState, reason: &str, now_ms: u64) {
        if from == to {
            return;
        }
        info!(
            "circuit breaker {}: {:?} → {:?} ({})",
            chain, from, to, reason
        );
        if let Some(events) = &self.events {
            let _ = events.send(BreakerTransition {
                chain,
                from,
                to,
                reason: reason.to_string(),
                ts_ms: now_ms,
            });
        }
    }

    pub fn state(&self, chain: Chain) -> BreakerState {
        self.breakers
            .get(&chain)
            .map(|b| b.state)
            .unwrap_or(BreakerState::Closed)
    }

    /// Gate an execution attempt. OPEN with unexpired cooldown → false;
    /// OPEN with expired cooldown transitions to HALF_OPEN and admits probes
    /// up to the half-open attempt limit.
    pub fn try_acquire(&self, chain: Chain, now_ms: u64) -> bool {
        let mut breaker = self.breakers.entry(chain).or_insert_with(Inner::new);
        match breaker.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                if now_ms.saturating_sub(breaker.opened_at_ms) >= self.config.cooldown_ms {
                    let from = breaker.state;
                    breaker.state = BreakerState::HalfOpen;
                    breaker.half_open_attempts = 1;
                    self.emit(chain, from, BreakerState::HalfOpen, "cooldown elapsed", now_ms);
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if breaker.half_open_attempts < self.config.half_open_max_attempts {
                    breaker.half_open_attempts += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Success resets the failure count; a HALF_OPEN probe success closes.
    pub fn on_success(&self, chain: Chain, now_ms: u64) {
        let mut breaker = self.breakers.entry(chain).or_insert_with(Inner::new);
        let from = breaker.state;
        breaker.consecutive_failures = 0;
        if breaker.state == BreakerState::HalfOpen {
            breaker.state = BreakerState::Closed;
            breaker.half_open_attempts = 0;
            self.emit(chain, from, BreakerState::Closed, "probe succeeded", now_ms);
        }
    }

    /// HALF_OPEN failure reopens immediately; CLOSED failures open at the
    /// threshold.
    pub fn on_failure(&self, chain: Chain, now_ms: u64) {
        let mut breaker = self.breakers.entry(chain).or_insert_with(Inner::new);
        let from = breaker.state;
        breaker.consecutive_failures += 1;
        match breaker.state {
            BreakerState::HalfOpen => {
                breaker.state = BreakerState::Open;
                breaker.opened_at_ms = now_ms;
                breaker.half_open_attempts = 0;
                self.emit(chain, from, BreakerState::Open, "probe failed", now_ms);
            }
            BreakerState::Closed
                if breaker.consecutive_failures >= self.config.failure_threshold =>
            {
                breaker.state = BreakerState::Open;
                breaker.opened_at_ms = now_ms;
                warn!(
                    "circuit breaker {}: {} consecutive failures",
                    chain, breaker.consecutive_failures
                );
                self.emit(chain, from, BreakerState::Open, "failure threshold", now_ms);
            }
            _ => {}
        }
    }

    /// Operator override: open immediately.
    pub fn force_open(&self, chain: Chain, reason: &str, now_ms: u64) {
        let mut breaker = self.breakers.entry(chain).or_insert_with(Inner::new);
        let from = breaker.state;
        breaker.state = BreakerState::Open;
        breaker.opened_at_ms = now_ms;
        breaker.half_open_attempts = 0;
        self.emit(chain, from, BreakerState::Open, reason, now_ms);
    }

    /// Operator override: close and clear failure history.
    pub fn force_close(&self, chain: Chain, now_ms: u64) {
        let mut breaker = self.breakers.entry(chain).or_insert_with(Inner::new);
        let from = breaker.state;
        breaker.state = BreakerState::Closed;
        breaker.consecutive_failures = 0;
        breaker.half_open_attempts = 0;
        self.emit(chain, from, BreakerState::Closed, "forced close", now_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> CircuitBreakerManager {
        CircuitBreakerManager::new(BreakerConfig::default(), None)
    }

    #[test]
    fn test_opens_at_failure_threshold() {
        let m = manager();
        for _ in 0..4 {
            m.on_failure(Chain::Ethereum, 1_000);
            assert_eq!(m.state(Chain::Ethereum), BreakerState::Closed);
        }
        m.on_failure(Chain::Ethereum, 1_000);
        assert_eq!(m.state(Chain::Ethereum), BreakerState::Open);
        assert!(!m.try_acquire(Chain::Ethereum, 2_000));
    }

    #[test]
    fn test_per_chain_isolation() {
        let m = manager();
        for _ in 0..5 {
            m.on_failure(Chain::Ethereum, 1_000);
        }
        assert_eq!(m.state(Chain::Ethereum), BreakerState::Open);
        // Arbitrum is untouched.
        assert_eq!(m.state(Chain::Arbitrum), BreakerState::Closed);
        assert!(m.try_acquire(Chain::Arbitrum, 1_000));
        assert!(!m.try_acquire(Chain::Ethereum, 1_000));
    }

    #[test]
    fn test_half_open_probe_cycle() {
        let m = manager();
        for _ in 0..5 {
            m.on_failure(Chain::Base, 1_000);
        }
        // Cooldown not elapsed.
        assert!(!m.try_acquire(Chain::Base, 1_000 + 299_999));
        // Cooldown elapsed → one probe admitted.
        assert!(m.try_acquire(Chain::Base, 1_000 + 300_000));
        assert_eq!(m.state(Chain::Base), BreakerState::HalfOpen);
        // Only one probe while half-open.
        assert!(!m.try_acquire(Chain::Base, 1_000 + 300_001));

        // Probe success → CLOSED.
        m.on_success(Chain::Base, 1_000 + 300_002);
        assert_eq!(m.state(Chain::Base), BreakerState::Closed);
        assert!(m.try_acquire(Chain::Base, 1_000 + 300_003));
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let m = manager();
        for _ in 0..5 {
            m.on_failure(Chain::Base, 1_000);
        }
        assert!(m.try_acquire(Chain::Base, 1_000 + 300_000));
        m.on_failure(Chain::Base, 1_000 + 300_001);
        assert_eq!(m.state(Chain::Base), BreakerState::Open);
        // New cooldown runs from the reopen.
        assert!(!m.try_acquire(Chain::Base, 1_000 + 300_002));
        assert!(m.try_acquire(Chain::Base, 1_000 + 600_001 + 1));
    }

    #[test]
    fn test_force_open_then_force_close() {
        let m = manager();
        for _ in 0..3 {
            m.on_failure(Chain::Polygon, 1_000);
        }
        m.force_open(Chain::Polygon, "operator", 2_000);
        assert_eq!(m.state(Chain::Polygon), BreakerState::Open);
        // force_close returns to CLOSED regardless of prior failures.
        m.force_close(Chain::Polygon, 3_000);
        assert_eq!(m.state(Chain::Polygon), BreakerState::Closed);
        assert!(m.try_acquire(Chain::Polygon, 3_001));
        // Failure history was cleared: threshold counts from zero again.
        for _ in 0..4 {
            m.on_failure(Chain::Polygon, 4_000);
        }
        assert_eq!(m.state(Chain::Polygon), BreakerState::Closed);
    }

    #[test]
    fn test_success_resets_failures_in_closed() {
        let m = manager();
        for _ in 0..4 {
            m.on_failure(Chain::Ethereum, 1_000);
        }
        m.on_success(Chain::Ethereum, 1_001);
        for _ in 0..4 {
            m.on_failure(Chain::Ethereum, 1_002);
        }
        assert_eq!(m.state(Chain::Ethereum), BreakerState::Closed);
    }

    #[test]
    fn test_transition_events_emitted() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let m = CircuitBreakerManager::new(BreakerConfig::default(), Some(tx));
        for _ in 0..5 {
            m.on_failure(Chain::Ethereum, 1_000);
        }
        let event = rx.try_recv().unwrap();
        assert_eq!(event.chain, Chain::Ethereum);
        assert_eq!(event.from, BreakerState::Closed);
        assert_eq!(event.to, BreakerState::Open);
    }
}
