//! Types shared by the multiplier, the backtest engine and the sweep

use chrono::{DateTime, NaiveDate};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// A single candlestick (OHLCV) as returned by the market data API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Kline {
    pub open_time: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub close_time: i64,
}

/// One calendar day of prices.
///
/// Backtests index these positionally: callers supply one entry per day,
/// ordered, without duplicate dates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyPriceData {
    pub date: NaiveDate,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl DailyPriceData {
    /// Convert a daily kline, dating it by its UTC open time
    pub fn from_kline(kline: &Kline) -> Option<Self> {
        let date = DateTime::from_timestamp_millis(kline.open_time)?.date_naive();
        Some(Self {
            date,
            open: kline.open,
            high: kline.high,
            low: kline.low,
            close: kline.close,
            volume: kline.volume,
        })
    }
}

/// A price-drop threshold mapped to a purchase-size multiplier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MultiplierTier {
    /// Drop from the reference high as a fraction in [0, 1]
    pub drop_percentage: Decimal,
    pub multiplier: Decimal,
}

impl MultiplierTier {
    pub fn new(drop_percentage: Decimal, multiplier: Decimal) -> Self {
        Self {
            drop_percentage,
            multiplier,
        }
    }

    /// Display label, e.g. `>= 10%`
    pub fn label(&self) -> String {
        format!(">= {}%", (self.drop_percentage * dec!(100)).normalize())
    }
}

/// Production tier set: 5% → 1.5x, 10% → 2.0x, 20% → 3.0x
pub fn default_tiers() -> Vec<MultiplierTier> {
    vec![
        MultiplierTier::new(dec!(0.05), dec!(1.5)),
        MultiplierTier::new(dec!(0.10), dec!(2.0)),
        MultiplierTier::new(dec!(0.20), dec!(3.0)),
    ]
}

/// Output of the multiplier calculation, with the inputs that produced it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiplierResult {
    /// Final, capped multiplier
    pub multiplier: Decimal,
    pub tier_label: String,
    /// Multiplier contributed by the selected tier (1.0 for Base)
    pub tier_multiplier: Decimal,
    /// Additive boost applied (0 when not in a bear market)
    pub bear_boost: Decimal,
    /// `tier_multiplier + bear_boost` before capping
    pub raw_multiplier: Decimal,
    pub is_bear_market: bool,
    pub bear_boost_applied: bool,
    /// Drop from the reference high as a fraction in [0, 1]
    pub drop_percentage: Decimal,
    pub high_30_day: Decimal,
    pub ma_200_day: Decimal,
    /// `base_amount * multiplier`
    pub final_amount: Decimal,
}

/// Configuration for one simulation run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestConfig {
    pub base_daily_amount: Decimal,
    pub high_lookback_days: usize,
    pub bear_market_ma_period: usize,
    pub bear_boost_factor: Decimal,
    pub max_multiplier_cap: Decimal,
    pub tiers: Vec<MultiplierTier>,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            base_daily_amount: dec!(10),
            high_lookback_days: 30,
            bear_market_ma_period: 200,
            bear_boost_factor: dec!(1.5),
            max_multiplier_cap: dec!(4.5),
            tiers: default_tiers(),
        }
    }
}

/// Lifetime metrics of one strategy over a backtest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyMetrics {
    pub total_invested: Decimal,
    pub total_btc: Decimal,
    pub avg_cost_basis: Decimal,
    /// Holdings valued at the final day's close
    pub portfolio_value: Decimal,
    pub return_percent: Decimal,
    /// Largest drop of unrealized P&L from its running peak, as % of cost (positive)
    pub max_drawdown: Decimal,
}

/// Smart DCA measured against both fixed baselines
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonMetrics {
    /// `(smart.avg - fixed.avg) / fixed.avg * 100`; negative means smart bought cheaper
    pub cost_basis_delta_vs_same_base: Decimal,
    pub cost_basis_delta_vs_match_total: Decimal,
    /// `(smart.btc - fixed.btc) / fixed.btc * 100`
    pub extra_btc_percent_vs_same_base: Decimal,
    pub extra_btc_percent_vs_match_total: Decimal,
    /// `smart.return_percent / same_base.return_percent`, 0 when the denominator is 0
    pub efficiency_ratio: Decimal,
}

/// How often a tier fired and what it bought beyond the base amount
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierBreakdownEntry {
    pub tier: String,
    pub trigger_count: u32,
    pub extra_usd_spent: Decimal,
    pub extra_btc_acquired: Decimal,
}

/// One day of the simulation, for all three strategies
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurchaseLogEntry {
    pub date: NaiveDate,
    pub price: Decimal,
    pub high_30_day: Decimal,
    pub ma_200_day: Decimal,
    pub multiplier: Decimal,
    pub tier: String,
    pub is_bear_market: bool,

    pub smart_usd: Decimal,
    pub smart_btc: Decimal,
    pub smart_cumulative_usd: Decimal,
    pub smart_cumulative_btc: Decimal,
    pub smart_cost_basis: Decimal,
    pub smart_portfolio_value: Decimal,

    pub same_base_usd: Decimal,
    pub same_base_btc: Decimal,
    pub same_base_cumulative_usd: Decimal,
    pub same_base_cumulative_btc: Decimal,

    pub match_total_usd: Decimal,
    pub match_total_btc: Decimal,
    pub match_total_cumulative_usd: Decimal,
    pub match_total_cumulative_btc: Decimal,
}

/// Result of a backtest run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestResult {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub total_days: usize,
    pub final_price: Decimal,
    /// Constant daily spend of the match-total baseline
    pub match_total_daily_amount: Decimal,
    pub smart_dca: StrategyMetrics,
    pub fixed_dca_same_base: StrategyMetrics,
    pub fixed_dca_match_total: StrategyMetrics,
    pub comparison: ComparisonMetrics,
    pub tier_breakdown: Vec<TierBreakdownEntry>,
    pub purchase_log: Vec<PurchaseLogEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_label_is_whole_percent() {
        assert_eq!(MultiplierTier::new(dec!(0.10), dec!(2.0)).label(), ">= 10%");
        assert_eq!(MultiplierTier::new(dec!(0.05), dec!(1.5)).label(), ">= 5%");
        assert_eq!(MultiplierTier::new(dec!(0.125), dec!(2.5)).label(), ">= 12.5%");
    }

    #[test]
    fn test_daily_price_from_kline() {
        // 2024-01-02T00:00:00Z
        let kline = Kline {
            open_time: 1_704_153_600_000,
            open: dec!(1),
            high: dec!(2),
            low: dec!(0.5),
            close: dec!(1.5),
            volume: dec!(10),
            close_time: 1_704_239_999_999,
        };
        let day = DailyPriceData::from_kline(&kline).unwrap();
        assert_eq!(day.date, NaiveDate::from_ymd_opt(2024, 1, 2).unwrap());
        assert_eq!(day.close, dec!(1.5));
    }

    #[test]
    fn test_default_config_matches_production() {
        let config = BacktestConfig::default();
        assert_eq!(config.base_daily_amount, dec!(10));
        assert_eq!(config.high_lookback_days, 30);
        assert_eq!(config.bear_market_ma_period, 200);
        assert_eq!(config.tiers.len(), 3);
    }
}
