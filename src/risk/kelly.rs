//! Kelly position sizing.
//!
//! f* = (p·b − q) / b with b = expectedProfit / expectedLoss, scaled by the
//! configured multiplier (half-Kelly by default) and clamped to the
//! always-enforced bounds: never above maxSingleTradeFraction, and anything
//! below minTradeFraction sizes to zero (skip).

use crate::config::RiskConfig;

pub struct KellyPositionSizer {
    kelly_multiplier: f64,
    max_single_trade_fraction: f64,
    min_trade_fraction: f64,
    total_capital_usd: f64,
}

impl KellyPositionSizer {
    pub fn new(config: &RiskConfig) -> Self {
        Self {
            kelly_multiplier: config.kelly_multiplier,
            max_single_trade_fraction: config.max_single_trade_fraction,
            min_trade_fraction: config.min_trade_fraction,
            total_capital_usd: config.total_capital_usd,
        }
    }

    /// Fraction of total capital to commit, after the Kelly multiplier, the
    /// drawdown size multiplier, and the hard bounds. Returns 0.0 when the
    /// trade should be skipped.
    pub fn position_fraction(
        &self,
        win_probability: f64,
        expected_profit_usd: f64,
        expected_loss_usd: f64,
        drawdown_multiplier: f64,
    ) -> f64 {
        if expected_loss_usd <= 0.0 || expected_profit_usd <= 0.0 {
            return 0.0;
        }
        let p = win_probability.clamp(0.0, 1.0);
        let q = 1.0 - p;
        let b = expected_profit_usd / expected_loss_usd;
        let raw = (p * b - q) / b;
        if raw <= 0.0 {
            return 0.0;
        }
        let scaled = raw * self.kelly_multiplier * drawdown_multiplier;
        let capped = scaled.min(self.max_single_trade_fraction);
        if capped < self.min_trade_fraction {
            return 0.0;
        }
        capped
    }

    pub fn position_usd(
        &self,
        win_probability: f64,
        expected_profit_usd: f64,
        expected_loss_usd: f64,
        drawdown_multiplier: f64,
    ) -> f64 {
        self.position_fraction(
            win_probability,
            expected_profit_usd,
            expected_loss_usd,
            drawdown_multiplier,
        ) * self.total_capital_usd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sizer() -> KellyPositionSizer {
        KellyPositionSizer::new(&RiskConfig::default())
    }

    #[test]
    fn test_positive_edge_sizes_up_to_cap() {
        // p=0.8, b=2 → f* = (1.6 - 0.2)/2 = 0.7; half-Kelly 0.35 → capped 0.02
        let f = sizer().position_fraction(0.8, 200.0, 100.0, 1.0);
        assert_eq!(f, 0.02);
    }

    #[test]
    fn test_negative_edge_is_zero() {
        // p=0.3, b=1 → f* = (0.3 - 0.7)/1 < 0
        assert_eq!(sizer().position_fraction(0.3, 100.0, 100.0, 1.0), 0.0);
    }

    #[test]
    fn test_below_min_fraction_skips() {
        // Tiny edge: p=0.505, b=1 → f* = 0.01; half-Kelly 0.005 → above min.
        // With a drawdown multiplier of 0.1 it falls below min → 0.
        let f = sizer().position_fraction(0.505, 100.0, 100.0, 0.1);
        assert_eq!(f, 0.0);
    }

    #[test]
    fn test_drawdown_multiplier_scales() {
        // p=0.6, b=1 → f* = 0.2; half-Kelly 0.1 → cap 0.02.
        let normal = sizer().position_fraction(0.6, 100.0, 100.0, 1.0);
        assert_eq!(normal, 0.02);
        // CAUTION multiplier shrinks raw sizing but the cap still binds.
        let caution = sizer().position_fraction(0.6, 100.0, 100.0, 0.75);
        assert_eq!(caution, 0.02);
        // HALT multiplier zeroes everything.
        assert_eq!(sizer().position_fraction(0.6, 100.0, 100.0, 0.0), 0.0);
    }

    #[test]
    fn test_degenerate_inputs() {
        assert_eq!(sizer().position_fraction(0.8, 0.0, 100.0, 1.0), 0.0);
        assert_eq!(sizer().position_fraction(0.8, 100.0, 0.0, 1.0), 0.0);
    }

    #[test]
    fn test_position_usd() {
        let usd = sizer().position_usd(0.8, 200.0, 100.0, 1.0);
        // 0.02 × $10,000 default capital
        assert!((usd - 200.0).abs() < 1e-9);
    }
}
