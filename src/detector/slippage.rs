//! Dynamic slippage model.
//!
//! slippage = base + priceImpactIn + priceImpactOut + liquidityPenalty
//! where impact = amountIn / (reserveIn + amountIn) and the liquidity
//! penalty is a step function of pool USD liquidity. Thin pools (< $100K)
//! are penalized hard enough that marginal spreads never clear them.

/// Base slippage applied to every route.
pub const BASE_SLIPPAGE: f64 = 0.001;

/// amountIn / (reserveIn + amountIn). Zero-reserve pools return full impact.
pub fn price_impact(amount_in: f64, reserve_in: f64) -> f64 {
    if amount_in <= 0.0 {
        return 0.0;
    }
    if reserve_in <= 0.0 {
        return 1.0;
    }
    amount_in / (reserve_in + amount_in)
}

/// Step penalty by pool USD liquidity.
pub fn liquidity_penalty(liquidity_usd: f64) -> f64 {
    if liquidity_usd < 50_000.0 {
        0.03
    } else if liquidity_usd < 100_000.0 {
        0.015
    } else if liquidity_usd < 500_000.0 {
        0.005
    } else {
        0.001
    }
}

/// Total dynamic slippage for a two-leg route. The smaller of the two pools'
/// liquidity drives the penalty.
pub fn dynamic_slippage(
    amount_in: f64,
    buy_reserve_in: f64,
    sell_reserve_in: f64,
    min_liquidity_usd: f64,
) -> f64 {
    BASE_SLIPPAGE
        + price_impact(amount_in, buy_reserve_in)
        + price_impact(amount_in, sell_reserve_in)
        + liquidity_penalty(min_liquidity_usd)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_price_impact_formula() {
        // 1% of the pool in → just under 1% impact
        let impact = price_impact(1_000.0, 100_000.0);
        assert!((impact - 1_000.0 / 101_000.0).abs() < 1e-12);
        assert_eq!(price_impact(0.0, 100_000.0), 0.0);
        assert_eq!(price_impact(100.0, 0.0), 1.0);
    }

    #[test]
    fn test_liquidity_penalty_steps() {
        assert_eq!(liquidity_penalty(10_000.0), 0.03);
        assert_eq!(liquidity_penalty(99_999.0), 0.015);
        assert_eq!(liquidity_penalty(100_000.0), 0.005);
        assert_eq!(liquidity_penalty(499_999.0), 0.005);
        assert_eq!(liquidity_penalty(2_000_000.0), 0.001);
    }

    #[test]
    fn test_thin_pools_penalized_harder() {
        let thin = dynamic_slippage(100.0, 1e6, 1e6, 40_000.0);
        let deep = dynamic_slippage(100.0, 1e6, 1e6, 5_000_000.0);
        assert!(thin > deep);
        assert!((thin - deep - (0.03 - 0.001)).abs() < 1e-12);
    }

    #[test]
    fn test_slippage_grows_with_size() {
        let small = dynamic_slippage(100.0, 1e6, 1e6, 5e6);
        let large = dynamic_slippage(50_000.0, 1e6, 1e6, 5e6);
        assert!(large > small);
    }
}
