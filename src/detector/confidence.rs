//! Confidence calculation for cross-chain opportunities.
//!
//! base = min(1, profit% / ceiling), then an age penalty, then multiplicative
//! ML and whale factors. The combined boost is hard-capped at 1.5 so stacked
//! signals can never push a marginal spread past the thresholds, and the
//! final value is clamped to [0, 1].

/// profit% at which base confidence saturates.
pub const PROFIT_CEILING_PCT: f64 = 5.0;
/// ML factor applies only at or above this model confidence.
pub const ML_MIN_CONFIDENCE: f64 = 0.6;
pub const ML_ALIGNED_BOOST: f64 = 1.15;
pub const ML_OPPOSED_PENALTY: f64 = 0.9;
pub const WHALE_ALIGNED_BOOST: f64 = 1.15;
pub const WHALE_OPPOSED_PENALTY: f64 = 0.85;
pub const SUPER_WHALE_BOOST: f64 = 1.25;
/// Hard cap on the combined multiplicative boost.
pub const MAX_TOTAL_BOOST: f64 = 1.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAlignment {
    Aligned,
    Opposed,
    Neutral,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConfidenceInputs {
    pub profit_pct: f64,
    /// Age of the older of the two price points.
    pub price_age_ms: u64,
    /// ML signal, if a prediction arrived in time.
    pub ml: Option<(SignalAlignment, f64)>,
    /// Whale signal: alignment + super-whale flag.
    pub whale: Option<(SignalAlignment, bool)>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConfidenceResult {
    pub confidence: f64,
    /// Combined multiplicative factor actually applied (≤ 1.5).
    pub total_boost: f64,
    /// The ML component of the boost, recorded on the opportunity.
    pub ml_factor: f64,
}

pub fn calculate(inputs: &ConfidenceInputs) -> ConfidenceResult {
    let base = (inputs.profit_pct / PROFIT_CEILING_PCT).clamp(0.0, 1.0);

    let age_minutes = inputs.price_age_ms as f64 / 60_000.0;
    let age_penalty = (1.0 - age_minutes * 0.1).max(0.1);
    let penalized = base * age_penalty;

    let ml_factor = match inputs.ml {
        Some((SignalAlignment::Aligned, conf)) if conf >= ML_MIN_CONFIDENCE => ML_ALIGNED_BOOST,
        Some((SignalAlignment::Opposed, conf)) if conf >= ML_MIN_CONFIDENCE => ML_OPPOSED_PENALTY,
        _ => 1.0,
    };

    let whale_factor = match inputs.whale {
        Some((_, true)) => SUPER_WHALE_BOOST,
        Some((SignalAlignment::Aligned, _)) => WHALE_ALIGNED_BOOST,
        Some((SignalAlignment::Opposed, _)) => WHALE_OPPOSED_PENALTY,
        _ => 1.0,
    };

    let total_boost = (ml_factor * whale_factor).min(MAX_TOTAL_BOOST);
    ConfidenceResult {
        confidence: (penalized * total_boost).clamp(0.0, 1.0),
        total_boost,
        ml_factor,
    }
}
