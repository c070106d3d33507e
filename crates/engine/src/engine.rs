//! Day-by-day DCA backtesting engine
//!
//! Replays a daily price series for three strategies:
//! - smart DCA sized by [`multiplier::calculate`]
//! - fixed DCA spending the base amount every day
//! - fixed DCA spending a constant amount chosen so its lifetime spend
//!   matches smart DCA (isolates timing from capital deployed)
//!
//! All running totals use checked arithmetic: amounts outside the decimal
//! range surface as `InvalidArgument` rather than a panic.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::debug;

use crate::error::BacktestError;
use crate::multiplier::{self, BASE_TIER_LABEL};
use crate::types::*;

type Calc<T> = Result<T, BacktestError>;

fn overflow() -> BacktestError {
    BacktestError::InvalidArgument("amounts exceed the representable decimal range".to_string())
}

fn add(a: Decimal, b: Decimal) -> Calc<Decimal> {
    a.checked_add(b).ok_or_else(overflow)
}

fn sub(a: Decimal, b: Decimal) -> Calc<Decimal> {
    a.checked_sub(b).ok_or_else(overflow)
}

fn mul(a: Decimal, b: Decimal) -> Calc<Decimal> {
    a.checked_mul(b).ok_or_else(overflow)
}

fn div(a: Decimal, b: Decimal) -> Calc<Decimal> {
    a.checked_div(b).ok_or_else(overflow)
}

/// Running totals for one strategy
#[derive(Default)]
struct StrategyState {
    cumulative_usd: Decimal,
    cumulative_btc: Decimal,
    peak_pnl: Option<Decimal>,
    max_drawdown: Decimal,
}

impl StrategyState {
    /// Spend `usd` at `price`; returns the quantity bought
    fn buy(&mut self, usd: Decimal, price: Decimal) -> Calc<Decimal> {
        let btc = units_for(usd, price)?;
        self.cumulative_usd = add(self.cumulative_usd, usd)?;
        self.cumulative_btc = add(self.cumulative_btc, btc)?;
        Ok(btc)
    }

    fn cost_basis(&self) -> Calc<Decimal> {
        if self.cumulative_btc > Decimal::ZERO {
            div(self.cumulative_usd, self.cumulative_btc)
        } else {
            Ok(Decimal::ZERO)
        }
    }

    /// Value holdings at `close` and update the drawdown of unrealized P&L
    fn mark(&mut self, close: Decimal) -> Calc<Decimal> {
        let value = mul(self.cumulative_btc, close)?;
        let pnl = sub(value, self.cumulative_usd)?;

        let peak = match self.peak_pnl {
            Some(p) if p >= pnl => p,
            _ => pnl,
        };
        self.peak_pnl = Some(peak);

        if self.cumulative_usd > Decimal::ZERO {
            let drawdown = mul(div(sub(peak, pnl)?, self.cumulative_usd)?, dec!(100))?;
            if drawdown > self.max_drawdown {
                self.max_drawdown = drawdown;
            }
        }
        Ok(value)
    }

    fn metrics(&self, final_price: Decimal) -> Calc<StrategyMetrics> {
        let portfolio_value = mul(self.cumulative_btc, final_price)?;
        let return_percent = if self.cumulative_usd > Decimal::ZERO {
            pct_delta(portfolio_value, self.cumulative_usd)?
        } else {
            Decimal::ZERO
        };

        Ok(StrategyMetrics {
            total_invested: self.cumulative_usd,
            total_btc: self.cumulative_btc,
            avg_cost_basis: self.cost_basis()?,
            portfolio_value,
            return_percent,
            max_drawdown: self.max_drawdown,
        })
    }
}

fn units_for(usd: Decimal, price: Decimal) -> Calc<Decimal> {
    if price > Decimal::ZERO {
        div(usd, price)
    } else {
        Ok(Decimal::ZERO)
    }
}

/// Percentage difference of `value` against `reference`, 0 when the reference is 0
fn pct_delta(value: Decimal, reference: Decimal) -> Calc<Decimal> {
    if reference.is_zero() {
        Ok(Decimal::ZERO)
    } else {
        mul(div(sub(value, reference)?, reference)?, dec!(100))
    }
}

/// Backtesting engine that simulates one purchase per day
pub struct BacktestEngine;

impl BacktestEngine {
    /// Run a backtest on the given daily prices with the specified config.
    ///
    /// Empty price data is an error, as are amounts so large that the running
    /// totals leave the decimal range. Identical inputs always produce identical outputs.
    pub fn run(
        config: &BacktestConfig,
        price_data: &[DailyPriceData],
    ) -> Result<BacktestResult, BacktestError> {
        let (first, last) = match (price_data.first(), price_data.last()) {
            (Some(f), Some(l)) => (f, l),
            _ => {
                return Err(BacktestError::InvalidArgument(
                    "price data must not be empty".to_string(),
                ))
            }
        };

        let lookback = config.high_lookback_days.max(1);
        let ma_period = config.bear_market_ma_period.max(1);
        let base = config.base_daily_amount;

        // Debug level: sweeps run thousands of these
        debug!(
            days = price_data.len(),
            base = %base,
            lookback,
            ma_period,
            "Starting DCA backtest"
        );

        let mut smart = StrategyState::default();
        let mut same_base = StrategyState::default();
        let mut tier_breakdown = seed_tier_breakdown(&config.tiers);
        let mut purchase_log: Vec<PurchaseLogEntry> = Vec::with_capacity(price_data.len());
        let mut ma_sum = Decimal::ZERO;

        // Pass 1: smart DCA and the same-base fixed strategy
        for (i, day) in price_data.iter().enumerate() {
            let price = day.close;

            let window_start = (i + 1).saturating_sub(lookback);
            let high = price_data[window_start..=i]
                .iter()
                .map(|d| d.close)
                .max()
                .unwrap_or(Decimal::ZERO);

            ma_sum = add(ma_sum, price)?;
            if i >= ma_period {
                ma_sum = sub(ma_sum, price_data[i - ma_period].close)?;
            }
            // Warm-up: report 0 until a full window exists
            let ma = if i + 1 >= ma_period {
                ma_sum / Decimal::from(ma_period)
            } else {
                Decimal::ZERO
            };

            let m = multiplier::calculate(
                price,
                base,
                high,
                ma,
                &config.tiers,
                config.bear_boost_factor,
                config.max_multiplier_cap,
            );

            let smart_usd = mul(base, m.multiplier)?;
            let smart_btc = smart.buy(smart_usd, price)?;
            let smart_value = smart.mark(price)?;

            let same_base_btc = same_base.buy(base, price)?;
            same_base.mark(price)?;

            if m.tier_label != BASE_TIER_LABEL {
                if let Some(entry) = tier_breakdown.iter_mut().find(|e| e.tier == m.tier_label) {
                    entry.trigger_count += 1;
                    entry.extra_usd_spent = add(entry.extra_usd_spent, sub(smart_usd, base)?)?;
                    entry.extra_btc_acquired =
                        add(entry.extra_btc_acquired, sub(smart_btc, same_base_btc)?)?;
                }
            }

            purchase_log.push(PurchaseLogEntry {
                date: day.date,
                price,
                high_30_day: high,
                ma_200_day: ma,
                multiplier: m.multiplier,
                tier: m.tier_label,
                is_bear_market: m.is_bear_market,
                smart_usd,
                smart_btc,
                smart_cumulative_usd: smart.cumulative_usd,
                smart_cumulative_btc: smart.cumulative_btc,
                smart_cost_basis: smart.cost_basis()?,
                smart_portfolio_value: smart_value,
                same_base_usd: base,
                same_base_btc,
                same_base_cumulative_usd: same_base.cumulative_usd,
                same_base_cumulative_btc: same_base.cumulative_btc,
                match_total_usd: Decimal::ZERO,
                match_total_btc: Decimal::ZERO,
                match_total_cumulative_usd: Decimal::ZERO,
                match_total_cumulative_btc: Decimal::ZERO,
            });
        }

        // Pass 2: fixed DCA with the same lifetime spend as smart DCA
        let match_total_daily_amount = smart.cumulative_usd / Decimal::from(price_data.len());
        let mut match_total = StrategyState::default();
        for (day, entry) in price_data.iter().zip(purchase_log.iter_mut()) {
            let btc = match_total.buy(match_total_daily_amount, day.close)?;
            match_total.mark(day.close)?;

            entry.match_total_usd = match_total_daily_amount;
            entry.match_total_btc = btc;
            entry.match_total_cumulative_usd = match_total.cumulative_usd;
            entry.match_total_cumulative_btc = match_total.cumulative_btc;
        }

        let final_price = last.close;
        let smart_dca = smart.metrics(final_price)?;
        let fixed_dca_same_base = same_base.metrics(final_price)?;
        let fixed_dca_match_total = match_total.metrics(final_price)?;
        let comparison = compare(&smart_dca, &fixed_dca_same_base, &fixed_dca_match_total)?;

        tier_breakdown.retain(|e| e.trigger_count > 0);

        debug!(
            smart_invested = %smart_dca.total_invested,
            smart_return = %smart_dca.return_percent,
            efficiency = %comparison.efficiency_ratio,
            "DCA backtest complete"
        );

        Ok(BacktestResult {
            start_date: first.date,
            end_date: last.date,
            total_days: price_data.len(),
            final_price,
            match_total_daily_amount,
            smart_dca,
            fixed_dca_same_base,
            fixed_dca_match_total,
            comparison,
            tier_breakdown,
            purchase_log,
        })
    }
}

/// One entry per distinct tier label, ordered by threshold
fn seed_tier_breakdown(tiers: &[MultiplierTier]) -> Vec<TierBreakdownEntry> {
    let mut sorted = tiers.to_vec();
    sorted.sort_by(|a, b| a.drop_percentage.cmp(&b.drop_percentage));

    let mut entries: Vec<TierBreakdownEntry> = Vec::with_capacity(sorted.len());
    for tier in sorted {
        let label = tier.label();
        if entries.iter().all(|e| e.tier != label) {
            entries.push(TierBreakdownEntry {
                tier: label,
                trigger_count: 0,
                extra_usd_spent: Decimal::ZERO,
                extra_btc_acquired: Decimal::ZERO,
            });
        }
    }
    entries
}

fn compare(
    smart: &StrategyMetrics,
    same_base: &StrategyMetrics,
    match_total: &StrategyMetrics,
) -> Calc<ComparisonMetrics> {
    let efficiency_ratio = if same_base.return_percent.is_zero() {
        Decimal::ZERO
    } else {
        div(smart.return_percent, same_base.return_percent)?
    };

    Ok(ComparisonMetrics {
        cost_basis_delta_vs_same_base: pct_delta(smart.avg_cost_basis, same_base.avg_cost_basis)?,
        cost_basis_delta_vs_match_total: pct_delta(
            smart.avg_cost_basis,
            match_total.avg_cost_basis,
        )?,
        extra_btc_percent_vs_same_base: pct_delta(smart.total_btc, same_base.total_btc)?,
        extra_btc_percent_vs_match_total: pct_delta(smart.total_btc, match_total.total_btc)?,
        efficiency_ratio,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate};
    use rust_decimal_macros::dec;

    fn make_days(prices: &[Decimal]) -> Vec<DailyPriceData> {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        prices
            .iter()
            .enumerate()
            .map(|(i, &p)| DailyPriceData {
                date: start + Duration::days(i as i64),
                open: p,
                high: p,
                low: p,
                close: p,
                volume: dec!(1),
            })
            .collect()
    }

    fn wave(days: usize) -> Vec<Decimal> {
        // Deterministic rise, crash and recovery
        (0..days)
            .map(|i| {
                let i = i as i64;
                let p = if i < days as i64 / 3 {
                    100 + i * 2
                } else if i < 2 * days as i64 / 3 {
                    100 + days as i64 / 3 * 2 - (i - days as i64 / 3) * 3
                } else {
                    60 + (i - 2 * days as i64 / 3) * 2
                };
                Decimal::from(p.max(10))
            })
            .collect()
    }

    #[test]
    fn test_empty_price_data_is_rejected() {
        let result = BacktestEngine::run(&BacktestConfig::default(), &[]);
        assert!(matches!(result, Err(BacktestError::InvalidArgument(_))));
    }

    #[test]
    fn test_flat_prices_spend_base_every_day() {
        let data = make_days(&[dec!(100); 5]);
        let result = BacktestEngine::run(&BacktestConfig::default(), &data).unwrap();

        assert_eq!(result.total_days, 5);
        for entry in &result.purchase_log {
            assert_eq!(entry.smart_usd, dec!(10));
            assert_eq!(entry.multiplier, Decimal::ONE);
            assert_eq!(entry.tier, BASE_TIER_LABEL);
            // 5 days < 200-day window
            assert_eq!(entry.ma_200_day, Decimal::ZERO);
        }
        assert_eq!(result.smart_dca.total_invested, dec!(50));
        assert_eq!(result.smart_dca.total_btc, dec!(0.5));
        assert_eq!(result.smart_dca.avg_cost_basis, dec!(100));
        assert_eq!(result.smart_dca.return_percent, Decimal::ZERO);
        assert_eq!(result.match_total_daily_amount, dec!(10));
        assert_eq!(result.comparison.efficiency_ratio, Decimal::ZERO);
        assert!(result.tier_breakdown.is_empty());
    }

    #[test]
    fn test_sliding_high_and_ma_windows() {
        let data = make_days(&[dec!(10), dec!(30), dec!(20), dec!(5)]);
        let config = BacktestConfig {
            high_lookback_days: 2,
            bear_market_ma_period: 3,
            ..Default::default()
        };
        let result = BacktestEngine::run(&config, &data).unwrap();
        let log = &result.purchase_log;

        assert_eq!(log[0].high_30_day, dec!(10));
        assert_eq!(log[1].high_30_day, dec!(30));
        assert_eq!(log[2].high_30_day, dec!(30));
        assert_eq!(log[3].high_30_day, dec!(20));

        assert_eq!(log[0].ma_200_day, Decimal::ZERO);
        assert_eq!(log[1].ma_200_day, Decimal::ZERO);
        assert_eq!(log[2].ma_200_day, dec!(20));
        assert_eq!(log[3].ma_200_day, dec!(55) / dec!(3));
    }

    #[test]
    fn test_dip_triggers_tier_and_breakdown() {
        // 100 then 85: 15% drop → 2.0x tier, MA warm-up so no bear boost
        let data = make_days(&[dec!(100), dec!(85)]);
        let result = BacktestEngine::run(&BacktestConfig::default(), &data).unwrap();

        let day2 = &result.purchase_log[1];
        assert_eq!(day2.tier, ">= 10%");
        assert_eq!(day2.multiplier, dec!(2.0));
        assert_eq!(day2.smart_usd, dec!(20));

        assert_eq!(result.tier_breakdown.len(), 1);
        let tier = &result.tier_breakdown[0];
        assert_eq!(tier.tier, ">= 10%");
        assert_eq!(tier.trigger_count, 1);
        assert_eq!(tier.extra_usd_spent, dec!(10));
        let expected_extra = dec!(10) / dec!(85);
        assert!((tier.extra_btc_acquired - expected_extra).abs() < dec!(0.0000000001));
    }

    #[test]
    fn test_match_total_spends_same_as_smart() {
        let data = make_days(&wave(300));
        let result = BacktestEngine::run(&BacktestConfig::default(), &data).unwrap();

        let diff = (result.fixed_dca_match_total.total_invested
            - result.smart_dca.total_invested)
            .abs();
        assert!(diff < dec!(0.000001), "match-total drifted by {diff}");
        assert!(result.smart_dca.total_invested > result.fixed_dca_same_base.total_invested);
        assert_eq!(
            result.fixed_dca_same_base.total_invested,
            dec!(10) * Decimal::from(300)
        );
    }

    #[test]
    fn test_smart_dca_buys_cheaper_on_crash() {
        let data = make_days(&wave(300));
        let result = BacktestEngine::run(&BacktestConfig::default(), &data).unwrap();

        assert!(result.comparison.cost_basis_delta_vs_match_total < Decimal::ZERO);
        assert!(result.comparison.extra_btc_percent_vs_match_total > Decimal::ZERO);
        assert!(!result.tier_breakdown.is_empty());
    }

    #[test]
    fn test_drawdown_is_positive_percentage() {
        let data = make_days(&[dec!(100), dec!(100), dec!(50), dec!(100)]);
        let result = BacktestEngine::run(&BacktestConfig::default(), &data).unwrap();

        // same-base after day 3: 0.4 BTC worth 20 against 30 cost, pnl fell 10 from its peak of 0
        assert_eq!(
            result.fixed_dca_same_base.max_drawdown,
            dec!(10) / dec!(30) * dec!(100)
        );
        assert!(result.smart_dca.max_drawdown > Decimal::ZERO);
    }

    #[test]
    fn test_run_is_deterministic() {
        let data = make_days(&wave(400));
        let config = BacktestConfig::default();
        let a = BacktestEngine::run(&config, &data).unwrap();
        let b = BacktestEngine::run(&config, &data).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_overflowing_amount_is_rejected() {
        let data = make_days(&[dec!(100), dec!(80)]);
        let config = BacktestConfig {
            base_daily_amount: Decimal::MAX / dec!(2),
            ..Default::default()
        };
        let result = BacktestEngine::run(&config, &data);
        assert!(matches!(result, Err(BacktestError::InvalidArgument(_))));
    }

    #[test]
    fn test_zero_price_day_does_not_panic() {
        let data = make_days(&[dec!(100), Decimal::ZERO, dec!(100)]);
        let result = BacktestEngine::run(&BacktestConfig::default(), &data).unwrap();
        assert_eq!(result.purchase_log[1].smart_btc, Decimal::ZERO);
    }
}
