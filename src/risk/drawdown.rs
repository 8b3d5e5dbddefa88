//! Global drawdown circuit breaker.
//!
//! One state machine over the whole book:
//!   NORMAL (×1.0) → CAUTION (×0.75) at 3% daily drawdown
//!   CAUTION → HALT (×0.0) at 5% daily drawdown or 5 consecutive losses
//!   HALT → RECOVERY (×0.5) after the cooldown (default 1 h)
//!   RECOVERY → NORMAL after 3 consecutive wins
//!   any state → NORMAL at UTC midnight rollover

use crate::config::RiskConfig;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

const DAY_MS: u64 = 24 * 60 * 60 * 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DrawdownState {
    Normal,
    Caution,
    Halt,
    Recovery,
}

impl DrawdownState {
    pub fn size_multiplier(&self) -> f64 {
        match self {
            DrawdownState::Normal => 1.0,
            DrawdownState::Caution => 0.75,
            DrawdownState::Halt => 0.0,
            DrawdownState::Recovery => 0.5,
        }
    }
}

struct Inner {
    state: DrawdownState,
    daily_pnl_usd: f64,
    consecutive_losses: u32,
    recovery_wins: u32,
    halted_at_ms: u64,
    /// UTC day of the current accounting window.
    day_key: u64,
}

pub struct DrawdownCircuitBreaker {
    total_capital_usd: f64,
    caution_drawdown: f64,
    halt_drawdown: f64,
    consecutive_loss_halt: u32,
    cooldown_ms: u64,
    recovery_wins_required: u32,
    inner: Mutex<Inner>,
}

impl DrawdownCircuitBreaker {
    pub fn new(config: &RiskConfig, now_ms: u64) -> Self {
        Self {
            total_capital_usd: config.total_capital_usd,
            caution_drawdown: config.caution_drawdown,
            halt_drawdown: config.max_daily_loss,
            consecutive_loss_halt: config.consecutive_loss_halt,
            cooldown_ms: config.halt_cooldown_ms,
            recovery_wins_required: config.recovery_wins_required,
            inner: Mutex::new(Inner {
                state: DrawdownState::Normal,
                daily_pnl_usd: 0.0,
                consecutive_losses: 0,
                recovery_wins: 0,
                halted_at_ms: 0,
                day_key: now_ms / DAY_MS,
            }),
        }
    }

    /// Current state, applying lazy transitions (day rollover, HALT cooldown
    /// expiry). Cheap enough for the per-opportunity hot path.
    pub fn state(&self, now_ms: u64) -> DrawdownState {
        let mut inner = self.inner.lock();
        self.apply_time_transitions(&mut inner, now_ms);
        inner.state
    }

    pub fn size_multiplier(&self, now_ms: u64) -> f64 {
        self.state(now_ms).size_multiplier()
    }

    pub fn daily_pnl_usd(&self) -> f64 {
        self.inner.lock().daily_pnl_usd
    }

    /// Feed a terminal execution outcome into the book.
    pub fn record_outcome(&self, pnl_usd: f64, now_ms: u64) {
        let mut inner = self.inner.lock();
        self.apply_time_transitions(&mut inner, now_ms);

        inner.daily_pnl_usd += pnl_usd;
        if pnl_usd < 0.0 {
            inner.consecutive_losses += 1;
            inner.recovery_wins = 0;
        } else {
            inner.consecutive_losses = 0;
            if inner.state == DrawdownState::Recovery {
                inner.recovery_wins += 1;
                if inner.recovery_wins >= self.recovery_wins_required {
                    info!(
                        "drawdown breaker: RECOVERY → NORMAL after {} wins",
                        inner.recovery_wins
                    );
                    inner.state = DrawdownState::Normal;
                    inner.recovery_wins = 0;
                }
            }
        }

        // Breach triggers only evaluate on losing updates: a winning trade
        // never moves the state toward CAUTION/HALT even while the daily
        // book is still under water (otherwise RECOVERY → NORMAL would
        // re-halt instantly on the same book).
        if pnl_usd >= 0.0 {
            return;
        }
        let drawdown = if inner.daily_pnl_usd < 0.0 {
            -inner.daily_pnl_usd / self.total_capital_usd
        } else {
            0.0
        };

        match inner.state {
            DrawdownState::Normal if drawdown >= self.caution_drawdown => {
                warn!(
                    "drawdown breaker: NORMAL → CAUTION (drawdown {:.1}%)",
                    drawdown * 100.0
                );
                inner.state = DrawdownState::Caution;
            }
            _ => {}
        }
        // The percentage trigger can fire in the same update that entered
        // CAUTION (a large single loss passes through CAUTION instantly).
        // It does not fire from RECOVERY — the day's drawdown is already on
        // the book there, and only a fresh loss streak sends it back.
        let pct_halt = matches!(
            inner.state,
            DrawdownState::Normal | DrawdownState::Caution
        ) && drawdown >= self.halt_drawdown;
        let streak_halt = inner.state != DrawdownState::Halt
            && inner.consecutive_losses >= self.consecutive_loss_halt;
        if pct_halt || streak_halt {
            warn!(
                "drawdown breaker: → HALT (drawdown {:.1}%, {} consecutive losses)",
                drawdown * 100.0,
                inner.consecutive_losses
            );
            inner.state = DrawdownState::Halt;
            inner.halted_at_ms = now_ms;
        }
    }

    fn apply_time_transitions(&self, inner: &mut Inner, now_ms: u64) {
        // Daily rollover: fresh book, any state returns to NORMAL.
        let day = now_ms / DAY_MS;
        if day != inner.day_key {
            inner.day_key = day;
            inner.daily_pnl_usd = 0.0;
            inner.consecutive_losses = 0;
            inner.recovery_wins = 0;
            if inner.state != DrawdownState::Normal {
                info!("drawdown breaker: daily rollover → NORMAL");
                inner.state = DrawdownState::Normal;
            }
            return;
        }
        // HALT serves its cooldown, then trades at reduced size.
        if inner.state == DrawdownState::Halt
            && now_ms.saturating_sub(inner.halted_at_ms) >= self.cooldown_ms
        {
            info!("drawdown breaker: HALT cooldown elapsed → RECOVERY");
            inner.state = DrawdownState::Recovery;
            inner.recovery_wins = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RiskConfig {
        RiskConfig {
            total_capital_usd: 10_000.0,
            ..RiskConfig::default()
        }
    }

    #[test]
    fn test_normal_to_caution_at_three_percent() {
        let breaker = DrawdownCircuitBreaker::new(&config(), 0);
        breaker.record_outcome(-250.0, 1_000);
        assert_eq!(breaker.state(1_000), DrawdownState::Normal);
        breaker.record_outcome(-60.0, 2_000); // -310 → 3.1%
        assert_eq!(breaker.state(2_000), DrawdownState::Caution);
        assert_eq!(breaker.size_multiplier(2_000), 0.75);
    }

    #[test]
    fn test_caution_to_halt_at_five_percent() {
        let breaker = DrawdownCircuitBreaker::new(&config(), 0);
        breaker.record_outcome(-400.0, 1_000); // 4% → CAUTION
        assert_eq!(breaker.state(1_000), DrawdownState::Caution);
        breaker.record_outcome(-150.0, 2_000); // 5.5% → HALT
        assert_eq!(breaker.state(2_000), DrawdownState::Halt);
        assert_eq!(breaker.size_multiplier(2_000), 0.0);
    }

    #[test]
    fn test_consecutive_losses_halt() {
        let breaker = DrawdownCircuitBreaker::new(&config(), 0);
        // Five small losses in a row halt even though the drawdown (0.5%)
        // never reaches the percentage thresholds.
        for i in 0..4 {
            breaker.record_outcome(-10.0, 1_000 + i);
            assert_ne!(breaker.state(1_000 + i), DrawdownState::Halt);
        }
        breaker.record_outcome(-10.0, 2_000);
        assert_eq!(breaker.state(2_000), DrawdownState::Halt);
    }

    #[test]
    fn test_halt_cooldown_then_recovery_then_normal() {
        let breaker = DrawdownCircuitBreaker::new(&config(), 0);
        breaker.record_outcome(-600.0, 1_000); // 6% → HALT
        assert_eq!(breaker.state(1_000), DrawdownState::Halt);

        // Still halted inside the cooldown.
        assert_eq!(breaker.state(1_000 + 3_599_999), DrawdownState::Halt);
        // Cooldown elapsed → RECOVERY at half size.
        let after = 1_000 + 3_600_000;
        assert_eq!(breaker.state(after), DrawdownState::Recovery);
        assert_eq!(breaker.size_multiplier(after), 0.5);

        // Three consecutive wins → NORMAL.
        breaker.record_outcome(5.0, after + 1);
        breaker.record_outcome(5.0, after + 2);
        assert_eq!(breaker.state(after + 2), DrawdownState::Recovery);
        breaker.record_outcome(5.0, after + 3);
        assert_eq!(breaker.state(after + 3), DrawdownState::Normal);
    }

    #[test]
    fn test_loss_resets_recovery_wins() {
        let breaker = DrawdownCircuitBreaker::new(&config(), 0);
        breaker.record_outcome(-600.0, 1_000);
        let after = 1_000 + 3_600_000;
        assert_eq!(breaker.state(after), DrawdownState::Recovery);
        breaker.record_outcome(5.0, after + 1);
        breaker.record_outcome(5.0, after + 2);
        breaker.record_outcome(-1.0, after + 3); // streak broken
        breaker.record_outcome(5.0, after + 4);
        breaker.record_outcome(5.0, after + 5);
        assert_eq!(breaker.state(after + 5), DrawdownState::Recovery);
        breaker.record_outcome(5.0, after + 6);
        assert_eq!(breaker.state(after + 6), DrawdownState::Normal);
    }

    #[test]
    fn test_daily_rollover_resets_everything() {
        let breaker = DrawdownCircuitBreaker::new(&config(), 0);
        breaker.record_outcome(-600.0, 1_000);
        assert_eq!(breaker.state(1_000), DrawdownState::Halt);

        // Next UTC day: state and book reset regardless of cooldown.
        let next_day = DAY_MS + 1;
        assert_eq!(breaker.state(next_day), DrawdownState::Normal);
        assert_eq!(breaker.daily_pnl_usd(), 0.0);
    }

    #[test]
    fn test_scenario_drawdown_halt_blocks() {
        // 10 ETH-equivalent book, 5% max: -0.6 ETH equivalent halts.
        let risk = RiskConfig {
            total_capital_usd: 10.0, // capital denominated in ETH units
            ..RiskConfig::default()
        };
        let breaker = DrawdownCircuitBreaker::new(&risk, 0);
        breaker.record_outcome(-0.6, 1_000);
        assert_eq!(breaker.state(1_000), DrawdownState::Halt);
        assert_eq!(breaker.size_multiplier(2_000), 0.0);
    }
}
