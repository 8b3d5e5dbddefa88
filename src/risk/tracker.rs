//! Execution probability tracker.
//!
//! Rolling outcome history per (chain, dex, path length, hour-of-day, gas
//! bucket). Until a key has enough samples its win probability is the
//! uninformative default — the EV gate then leans entirely on the profit
//! and cost estimates.

use crate::types::{Chain, DexName};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

pub const DEFAULT_WIN_PROBABILITY: f64 = 0.5;
pub const MIN_SAMPLES: usize = 10;
/// Entries per key.
const MAX_ENTRIES: usize = 1_000;
/// Outcomes older than this no longer count.
const RELEVANCE_MS: u64 = 7 * 24 * 60 * 60 * 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OutcomeKey {
    pub chain: Chain,
    pub dex: DexName,
    pub path_len: u8,
    pub hour_of_day: u8,
    pub gas_bucket: u8,
}

/// Coarse gas-price bucket so similar market regimes share a key.
pub fn gas_price_bucket(gas_price_gwei: f64) -> u8 {
    if gas_price_gwei < 10.0 {
        0
    } else if gas_price_gwei < 30.0 {
        1
    } else if gas_price_gwei < 100.0 {
        2
    } else if gas_price_gwei < 300.0 {
        3
    } else {
        4
    }
}

struct Record {
    success: bool,
    at_ms: u64,
}

pub struct ExecutionProbabilityTracker {
    outcomes: Mutex<HashMap<OutcomeKey, VecDeque<Record>>>,
}

impl ExecutionProbabilityTracker {
    pub fn new() -> Self {
        Self {
            outcomes: Mutex::new(HashMap::new()),
        }
    }

    pub fn record(&self, key: OutcomeKey, success: bool, now_ms: u64) {
        let mut outcomes = self.outcomes.lock();
        let history = outcomes.entry(key).or_default();
        if history.len() >= MAX_ENTRIES {
            history.pop_front();
        }
        history.push_back(Record { success, at_ms: now_ms });
    }

    /// wins / total over the relevance window, or the default below the
    /// minimum sample count.
    pub fn win_probability(&self, key: &OutcomeKey, now_ms: u64) -> f64 {
        let outcomes = self.outcomes.lock();
        let Some(history) = outcomes.get(key) else {
            return DEFAULT_WIN_PROBABILITY;
        };
        let mut wins = 0usize;
        let mut total = 0usize;
        for record in history {
            if now_ms.saturating_sub(record.at_ms) > RELEVANCE_MS {
                continue;
            }
            total += 1;
            if record.success {
                wins += 1;
            }
        }
        if total < MIN_SAMPLES {
            return DEFAULT_WIN_PROBABILITY;
        }
        wins as f64 / total as f64
    }
}

impl Default for ExecutionProbabilityTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> OutcomeKey {
        OutcomeKey {
            chain: Chain::Arbitrum,
            dex: DexName::Camelot,
            path_len: 2,
            hour_of_day: 14,
            gas_bucket: 1,
        }
    }

    #[test]
    fn test_default_below_min_samples() {
        let tracker = ExecutionProbabilityTracker::new();
        assert_eq!(tracker.win_probability(&key(), 0), DEFAULT_WIN_PROBABILITY);

        for i in 0..(MIN_SAMPLES - 1) {
            tracker.record(key(), true, i as u64);
        }
        assert_eq!(
            tracker.win_probability(&key(), 1_000),
            DEFAULT_WIN_PROBABILITY
        );
    }

    #[test]
    fn test_probability_once_sampled() {
        let tracker = ExecutionProbabilityTracker::new();
        for i in 0..20 {
            tracker.record(key(), i % 4 != 0, i); // 15 wins / 20
        }
        let p = tracker.win_probability(&key(), 1_000);
        assert!((p - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_old_outcomes_age_out() {
        let tracker = ExecutionProbabilityTracker::new();
        // 20 old losses, 12 recent wins.
        for i in 0..20 {
            tracker.record(key(), false, i);
        }
        let recent_start = RELEVANCE_MS + 1_000_000;
        for i in 0..12 {
            tracker.record(key(), true, recent_start + i);
        }
        let p = tracker.win_probability(&key(), recent_start + 1_000_000);
        assert_eq!(p, 1.0);
    }

    #[test]
    fn test_keys_are_independent() {
        let tracker = ExecutionProbabilityTracker::new();
        for i in 0..20 {
            tracker.record(key(), false, i);
        }
        let other = OutcomeKey {
            hour_of_day: 15,
            ..key()
        };
        assert_eq!(
            tracker.win_probability(&other, 1_000),
            DEFAULT_WIN_PROBABILITY
        );
        assert_eq!(tracker.win_probability(&key(), 1_000), 0.0);
    }

    #[test]
    fn test_history_bounded() {
        let tracker = ExecutionProbabilityTracker::new();
        for i in 0..(MAX_ENTRIES as u64 + 500) {
            tracker.record(key(), true, i);
        }
        let outcomes = tracker.outcomes.lock();
        assert_eq!(outcomes.get(&key()).unwrap().len(), MAX_ENTRIES);
    }

    #[test]
    fn test_gas_buckets() {
        assert_eq!(gas_price_bucket(5.0), 0);
        assert_eq!(gas_price_bucket(15.0), 1);
        assert_eq!(gas_price_bucket(50.0), 2);
        assert_eq!(gas_price_bucket(200.0), 3);
        assert_eq!(gas_price_bucket(500.0), 4);
    }
}
