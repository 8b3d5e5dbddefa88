//! Route-level cooldown with escalating backoff.
//!
//! Cheaper and narrower than the per-chain circuit breaker: after a route
//! (pair tokens + buy/sell DEX) fails, it is suppressed for a number of
//! blocks that escalates 5× per repeat failure up to a cap, so structurally
//! dead spreads stop being hammered while one-off failures recover fast.
//! A success removes the entry outright.

use crate::types::{Chain, DexName};
use std::collections::HashMap;
use tracing::{debug, info};

type RouteKey = (Chain, String, DexName, DexName);

/// Escalation multiplier per failure.
const ESCALATION_FACTOR: u64 = 5;
/// Cooldown cap in blocks.
const DEFAULT_MAX_COOLDOWN: u64 = 1_800;

struct CooldownEntry {
    last_failed_block: u64,
    cooldown_blocks: u64,
    failure_count: u32,
}

pub struct RouteCooldown {
    entries: HashMap<RouteKey, CooldownEntry>,
    initial_cooldown: u64,
    max_cooldown: u64,
}

impl RouteCooldown {
    /// `initial_cooldown` = blocks suppressed after the first failure
    /// (0 disables the tracker entirely).
    pub fn new(initial_cooldown: u64) -> Self {
        Self {
            entries: HashMap::new(),
            initial_cooldown,
            max_cooldown: DEFAULT_MAX_COOLDOWN,
        }
    }

    fn key(chain: Chain, pair_key: &str, buy: DexName, sell: DexName) -> RouteKey {
        (chain, pair_key.to_string(), buy, sell)
    }

    pub fn is_suppressed(
        &self,
        chain: Chain,
        pair_key: &str,
        buy: DexName,
        sell: DexName,
        current_block: u64,
    ) -> bool {
        if self.initial_cooldown == 0 {
            return false;
        }
        match self.entries.get(&Self::key(chain, pair_key, buy, sell)) {
            Some(entry) => current_block < entry.last_failed_block + entry.cooldown_blocks,
            None => false,
        }
    }

    pub fn record_failure(
        &mut self,
        chain: Chain,
        pair_key: &str,
        buy: DexName,
        sell: DexName,
        block: u64,
    ) {
        if self.initial_cooldown == 0 {
            return;
        }
        let entry = self
            .entries
            .entry(Self::key(chain, pair_key, buy, sell))
            .or_insert(CooldownEntry {
                last_failed_block: block,
                cooldown_blocks: 0,
                failure_count: 0,
            });
        entry.failure_count += 1;
        entry.last_failed_block = block;
        let escalated = self.initial_cooldown.saturating_mul(
            ESCALATION_FACTOR.saturating_pow(entry.failure_count.saturating_sub(1)),
        );
        entry.cooldown_blocks = escalated.min(self.max_cooldown);
        debug!(
            "route cooldown {} {}→{}: fail #{}, suppressed {} blocks",
            pair_key, buy, sell, entry.failure_count, entry.cooldown_blocks
        );
    }

    /// Instant reset on success.
    pub fn record_success(&mut self, chain: Chain, pair_key: &str, buy: DexName, sell: DexName) {
        if self
            .entries
            .remove(&Self::key(chain, pair_key, buy, sell))
            .is_some()
        {
            info!("route cooldown reset: {} {}→{}", pair_key, buy, sell);
        }
    }

    /// Drop expired entries to bound memory; call every ~100 blocks.
    pub fn cleanup(&mut self, current_block: u64) {
        self.entries
            .retain(|_, e| current_block < e.last_failed_block + e.cooldown_blocks);
    }

    pub fn active_count(&self) -> usize {
        self.entries.len()
    }
}
