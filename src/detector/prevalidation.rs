//! Detection-time pre-validation.
//!
//! A sampled, budgeted revenue check against a cheap simulation provider
//! (generic eth_call class — premium simulation quota is reserved for
//! execution time). Hard latency cap, monthly budget, and FAIL-OPEN
//! everywhere: pre-validation may only ever drop opportunities the simulator
//! positively refuted; errors, timeouts, and exhausted budgets let the
//! opportunity through.

use crate::config::PreValidationConfig;
use crate::error::CoreError;
use crate::stats::CoreStats;
use crate::types::Opportunity;
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Cheap revenue verifier. `Ok(true)` = revenue confirmed, `Ok(false)` =
/// positively refuted, `Err` = could not tell (treated as pass).
#[async_trait]
pub trait RevenueSimulator: Send + Sync {
    async fn verify(&self, opportunity: &Opportunity) -> Result<bool, CoreError>;
}

pub struct PreValidator {
    config: PreValidationConfig,
    simulator: Arc<dyn RevenueSimulator>,
    used_this_month: AtomicU64,
    /// year * 100 + month of the budget window.
    budget_month: Mutex<u32>,
    stats: Arc<CoreStats>,
}

impl PreValidator {
    pub fn new(
        config: PreValidationConfig,
        simulator: Arc<dyn RevenueSimulator>,
        stats: Arc<CoreStats>,
    ) -> Self {
        Self {
            config,
            simulator,
            used_this_month: AtomicU64::new(0),
            budget_month: Mutex::new(current_month_key()),
            stats,
        }
    }

    /// Returns false only when the simulator positively refuted the
    /// opportunity. Everything else passes.
    pub async fn validate(&self, opportunity: &Opportunity) -> bool {
        if opportunity.expected_profit_usd < self.config.value_floor_usd {
            return true;
        }
        if rand::thread_rng().gen::<f64>() >= self.config.sample_rate {
            return true;
        }
        if !self.try_consume_budget() {
            debug!("pre-validation budget exhausted — passing through");
            return true;
        }

        self.stats
            .detection
            .prevalidation_runs
            .fetch_add(1, Ordering::Relaxed);

        let verdict = tokio::time::timeout(
            Duration::from_millis(self.config.max_latency_ms),
            self.simulator.verify(opportunity),
        )
        .await;

        match verdict {
            Ok(Ok(true)) => true,
            Ok(Ok(false)) => {
                self.stats
                    .detection
                    .prevalidation_rejects
                    .fetch_add(1, Ordering::Relaxed);
                false
            }
            Ok(Err(e)) => {
                warn!("pre-validation error — fail-open: {}", e);
                true
            }
            Err(_) => {
                debug!(
                    "pre-validation exceeded {}ms — fail-open",
                    self.config.max_latency_ms
                );
                true
            }
        }
    }

    /// Budget accounting: resets at the calendar-month boundary; returns
    /// false once the month's allowance is spent.
    fn try_consume_budget(&self) -> bool {
        let month = current_month_key();
        {
            let mut window = self.budget_month.lock();
            if *window != month {
                *window = month;
                self.used_this_month.store(0, Ordering::SeqCst);
            }
        }
        let used = self.used_this_month.fetch_add(1, Ordering::SeqCst);
        if used >= self.config.monthly_budget {
            // Over-counted by one; not worth a CAS loop for a budget gate.
            return false;
        }
        true
    }

    #[cfg(test)]
    fn force_budget_spent(&self) {
        self.used_this_month
            .store(self.config.monthly_budget, Ordering::SeqCst);
    }
}

fn current_month_key() -> u32 {
    use chrono::Datelike;
    let now = chrono::Utc::now();
    now.year() as u32 * 100 + now.month()
}
