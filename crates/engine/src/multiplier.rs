//! Smart DCA multiplier — how much more to buy on dips and in bear markets
//!
//! The same function sizes live purchases and every backtest day, so it never
//! fails: missing reference data degrades to the base amount.

use rust_decimal::Decimal;

use crate::types::{MultiplierResult, MultiplierTier};

pub const BASE_TIER_LABEL: &str = "Base";

/// Compute the purchase multiplier for today's price.
///
/// - `high_30_day <= 0` means no reference high: multiplier 1.0, tier Base.
/// - `ma_200_day <= 0` means not enough history: never a bear market.
/// - The bear boost is added to the tier multiplier, then capped at `max_cap`.
/// - Amounts beyond the decimal range saturate instead of panicking.
pub fn calculate(
    current_price: Decimal,
    base_amount: Decimal,
    high_30_day: Decimal,
    ma_200_day: Decimal,
    tiers: &[MultiplierTier],
    bear_boost_factor: Decimal,
    max_cap: Decimal,
) -> MultiplierResult {
    if high_30_day <= Decimal::ZERO {
        return base_result(base_amount, high_30_day, ma_200_day);
    }

    // Out-of-range quotients only happen far outside [0, 1], so they clamp the same way
    let drop_percentage = match high_30_day
        .checked_sub(current_price)
        .and_then(|d| d.checked_div(high_30_day))
    {
        Some(drop) => drop.max(Decimal::ZERO).min(Decimal::ONE),
        None if current_price < high_30_day => Decimal::ONE,
        None => Decimal::ZERO,
    };

    // Highest qualifying threshold wins regardless of declaration order
    let tier = tiers
        .iter()
        .filter(|t| t.drop_percentage <= drop_percentage)
        .max_by(|a, b| a.drop_percentage.cmp(&b.drop_percentage));

    let (tier_multiplier, tier_label) = match tier {
        Some(t) => (t.multiplier, t.label()),
        None => (Decimal::ONE, BASE_TIER_LABEL.to_string()),
    };

    let is_bear_market = ma_200_day > Decimal::ZERO && current_price < ma_200_day;
    let bear_boost = if is_bear_market {
        bear_boost_factor
    } else {
        Decimal::ZERO
    };

    let raw_multiplier = tier_multiplier.saturating_add(bear_boost);
    let multiplier = raw_multiplier.min(max_cap);

    MultiplierResult {
        multiplier,
        tier_label,
        tier_multiplier,
        bear_boost,
        raw_multiplier,
        is_bear_market,
        bear_boost_applied: is_bear_market,
        drop_percentage,
        high_30_day,
        ma_200_day,
        final_amount: base_amount.saturating_mul(multiplier),
    }
}

/// The "no multiplier applied" result, also used when reference data is unavailable
pub fn base_result(
    base_amount: Decimal,
    high_30_day: Decimal,
    ma_200_day: Decimal,
) -> MultiplierResult {
    MultiplierResult {
        multiplier: Decimal::ONE,
        tier_label: BASE_TIER_LABEL.to_string(),
        tier_multiplier: Decimal::ONE,
        bear_boost: Decimal::ZERO,
        raw_multiplier: Decimal::ONE,
        is_bear_market: false,
        bear_boost_applied: false,
        drop_percentage: Decimal::ZERO,
        high_30_day,
        ma_200_day,
        final_amount: base_amount,
    }
}
