//! Expected value of an execution attempt.
//!
//! EV = p · expectedProfit − (1 − p) · (gasCost + expectedLoss)
//!
//! A failed attempt still pays gas (reverts burn it) and may eat partial
//! loss on non-atomic routes, so the downside is gas + expected loss, not
//! just forgone profit.

pub fn expected_value(
    win_probability: f64,
    expected_profit_usd: f64,
    gas_cost_usd: f64,
    expected_loss_usd: f64,
) -> f64 {
    let p = win_probability.clamp(0.0, 1.0);
    p * expected_profit_usd - (1.0 - p) * (gas_cost_usd + expected_loss_usd)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_certain_win_is_full_profit() {
        assert_eq!(expected_value(1.0, 100.0, 10.0, 20.0), 100.0);
    }

    #[test]
    fn test_certain_loss_is_full_downside() {
        assert_eq!(expected_value(0.0, 100.0, 10.0, 20.0), -30.0);
    }

    #[test]
    fn test_symmetric_case() {
        // p=0.5: 0.5*100 - 0.5*30 = 35
        assert!((expected_value(0.5, 100.0, 10.0, 20.0) - 35.0).abs() < 1e-9);
    }

    #[test]
    fn test_probability_clamped() {
        assert_eq!(
            expected_value(1.5, 100.0, 10.0, 20.0),
            expected_value(1.0, 100.0, 10.0, 20.0)
        );
    }

    #[test]
    fn test_negative_ev_for_thin_edge_high_gas() {
        let ev = expected_value(0.55, 5.0, 12.0, 5.0);
        assert!(ev < 0.0);
    }
}
