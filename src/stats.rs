//! Process-wide counters and latency tracking.
//!
//! Counters are plain atomics bumped from hot paths; aggregation endpoints
//! take a snapshot. Detection latency goes through a fixed-size ring buffer
//! so the hot path never allocates.

use crate::error::SkipReason;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Fixed-size latency ring. Overwrites oldest samples once full.
pub struct LatencyRing {
    samples: Mutex<RingState>,
}

struct RingState {
    buf: Vec<u64>,
    next: usize,
    len: usize,
}

impl LatencyRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: Mutex::new(RingState {
                buf: vec![0; capacity.max(1)],
                next: 0,
                len: 0,
            }),
        }
    }

    pub fn record(&self, latency_ms: u64) {
        let mut state = self.samples.lock();
        let capacity = state.buf.len();
        let next = state.next;
        state.buf[next] = latency_ms;
        state.next = (next + 1) % capacity;
        state.len = (state.len + 1).min(capacity);
    }

    /// (p50, p95, p99) over the current window; zeros when empty.
    pub fn percentiles(&self) -> (u64, u64, u64) {
        let state = self.samples.lock();
        if state.len == 0 {
            return (0, 0, 0);
        }
        let mut sorted: Vec<u64> = state.buf[..state.len].to_vec();
        sorted.sort_unstable();
        let pick = |p: f64| sorted[((sorted.len() - 1) as f64 * p) as usize];
        (pick(0.50), pick(0.95), pick(0.99))
    }
}

#[derive(Default)]
pub struct IngestionStats {
    pub ws_messages: AtomicU64,
    pub decode_failures: AtomicU64,
    pub reconnects: AtomicU64,
    pub rate_limits: AtomicU64,
    pub stale_rotations: AtomicU64,
    pub data_gaps: AtomicU64,
    pub pairs_registered: AtomicU64,
}

#[derive(Default)]
pub struct DetectionStats {
    pub reserve_syncs: AtomicU64,
    pub price_updates_published: AtomicU64,
    pub opportunities_published: AtomicU64,
    pub duplicates_suppressed: AtomicU64,
    pub stale_pair_rejections: AtomicU64,
    pub ml_timeouts: AtomicU64,
    pub prevalidation_runs: AtomicU64,
    pub prevalidation_rejects: AtomicU64,
}

#[derive(Default)]
pub struct ExecutionStats {
    pub consumed: AtomicU64,
    pub executed: AtomicU64,
    pub succeeded: AtomicU64,
    pub failed: AtomicU64,
    pub circuit_breaker_blocks: AtomicU64,
    pub drawdown_blocks: AtomicU64,
    pub ev_blocks: AtomicU64,
    pub win_probability_blocks: AtomicU64,
    pub position_blocks: AtomicU64,
    pub simulation_predicted_reverts: AtomicU64,
    pub expired: AtomicU64,
    pub duplicates: AtomicU64,
    pub route_cooldown_blocks: AtomicU64,
    pub no_strategy: AtomicU64,
    pub nonce_conflicts: AtomicU64,
}

impl ExecutionStats {
    pub fn record_skip(&self, reason: SkipReason) {
        let counter = match reason {
            SkipReason::CircuitOpen => &self.circuit_breaker_blocks,
            SkipReason::DrawdownHalt => &self.drawdown_blocks,
            SkipReason::EvBelowThreshold => &self.ev_blocks,
            SkipReason::WinProbabilityLow => &self.win_probability_blocks,
            SkipReason::PositionTooSmall => &self.position_blocks,
            SkipReason::SimulationRevert => &self.simulation_predicted_reverts,
            SkipReason::Expired => &self.expired,
            SkipReason::DuplicateOpportunity => &self.duplicates,
            SkipReason::RouteCooldown => &self.route_cooldown_blocks,
            SkipReason::NoStrategy => &self.no_strategy,
            SkipReason::NonceConflict => &self.nonce_conflicts,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct CoreStats {
    pub ingestion: IngestionStats,
    pub detection: DetectionStats,
    pub execution: ExecutionStats,
    pub detection_latency: LatencyRing,
}

impl CoreStats {
    pub fn new() -> Self {
        Self {
            ingestion: IngestionStats::default(),
            detection: DetectionStats::default(),
            execution: ExecutionStats::default(),
            detection_latency: LatencyRing::new(1_024),
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let (p50, p95, p99) = self.detection_latency.percentiles();
        StatsSnapshot {
            ws_messages: load(&self.ingestion.ws_messages),
            decode_failures: load(&self.ingestion.decode_failures),
            reconnects: load(&self.ingestion.reconnects),
            rate_limits: load(&self.ingestion.rate_limits),
            stale_rotations: load(&self.ingestion.stale_rotations),
            data_gaps: load(&self.ingestion.data_gaps),
            pairs_registered: load(&self.ingestion.pairs_registered),
            reserve_syncs: load(&self.detection.reserve_syncs),
            price_updates_published: load(&self.detection.price_updates_published),
            opportunities_published: load(&self.detection.opportunities_published),
            duplicates_suppressed: load(&self.detection.duplicates_suppressed),
            stale_pair_rejections: load(&self.detection.stale_pair_rejections),
            consumed: load(&self.execution.consumed),
            executed: load(&self.execution.executed),
            succeeded: load(&self.execution.succeeded),
            failed: load(&self.execution.failed),
            circuit_breaker_blocks: load(&self.execution.circuit_breaker_blocks),
            drawdown_blocks: load(&self.execution.drawdown_blocks),
            simulation_predicted_reverts: load(&self.execution.simulation_predicted_reverts),
            detection_latency_p50_ms: p50,
            detection_latency_p95_ms: p95,
            detection_latency_p99_ms: p99,
        }
    }
}

impl Default for CoreStats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub ws_messages: u64,
    pub decode_failures: u64,
    pub reconnects: u64,
    pub rate_limits: u64,
    pub stale_rotations: u64,
    pub data_gaps: u64,
    pub pairs_registered: u64,
    pub reserve_syncs: u64,
    pub price_updates_published: u64,
    pub opportunities_published: u64,
    pub duplicates_suppressed: u64,
    pub stale_pair_rejections: u64,
    pub consumed: u64,
    pub executed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub circuit_breaker_blocks: u64,
    pub drawdown_blocks: u64,
    pub simulation_predicted_reverts: u64,
    pub detection_latency_p50_ms: u64,
    pub detection_latency_p95_ms: u64,
    pub detection_latency_p99_ms: u64,
}
