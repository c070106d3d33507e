//! Runtime configuration read from `DCA_*` environment variables

use chrono::NaiveTime;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use std::str::FromStr;

use crate::error::DcaError;
use crate::execution::ExecutionSettings;
use crate::types::{BacktestConfig, MultiplierTier};

pub const DEFAULT_TIERS: &str = "0.05:1.5,0.10:2.0,0.20:3.0";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DcaConfig {
    pub db_path: String,
    pub asset: String,
    pub quote: String,
    /// Binance symbol used for prices and candles
    pub market_symbol: String,
    pub base_daily_amount: Decimal,
    /// UTC time the daily execution window opens
    pub buy_time: NaiveTime,
    pub dry_run: bool,
    pub high_lookback_days: usize,
    pub bear_market_ma_period: usize,
    pub bear_boost_factor: Decimal,
    pub max_multiplier_cap: Decimal,
    pub tiers: Vec<MultiplierTier>,
    /// Starting quote balance of the paper exchange
    pub paper_balance: Decimal,
}

impl DcaConfig {
    pub fn from_env() -> Result<Self, DcaError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key/value source; missing keys take their defaults
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, DcaError> {
        let text = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let config = Self {
            db_path: text("DCA_DB_PATH", "data/dca.db"),
            asset: text("DCA_ASSET", "BTC"),
            quote: text("DCA_QUOTE", "USDC"),
            market_symbol: text("DCA_MARKET_SYMBOL", "BTCUSDT"),
            base_daily_amount: env_or(&lookup, "DCA_BASE_DAILY_AMOUNT", "10")?,
            buy_time: parse_buy_time(&text("DCA_BUY_TIME", "00:05"))?,
            dry_run: parse_bool("DCA_DRY_RUN", &text("DCA_DRY_RUN", "true"))?,
            high_lookback_days: env_or(&lookup, "DCA_HIGH_LOOKBACK_DAYS", "30")?,
            bear_market_ma_period: env_or(&lookup, "DCA_BEAR_MA_PERIOD", "200")?,
            bear_boost_factor: env_or(&lookup, "DCA_BEAR_BOOST_FACTOR", "1.5")?,
            max_multiplier_cap: env_or(&lookup, "DCA_MAX_MULTIPLIER_CAP", "4.5")?,
            tiers: parse_tiers(&text("DCA_TIERS", DEFAULT_TIERS))?,
            paper_balance: env_or(&lookup, "DCA_PAPER_BALANCE", "1000")?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), DcaError> {
        let fail = |msg: &str| Err(DcaError::Config(msg.to_string()));
        if self.base_daily_amount <= Decimal::ZERO {
            return fail("DCA_BASE_DAILY_AMOUNT must be positive");
        }
        if self.high_lookback_days == 0 {
            return fail("DCA_HIGH_LOOKBACK_DAYS must be at least 1");
        }
        if self.bear_market_ma_period == 0 {
            return fail("DCA_BEAR_MA_PERIOD must be at least 1");
        }
        if self.bear_boost_factor < Decimal::ZERO {
            return fail("DCA_BEAR_BOOST_FACTOR must not be negative");
        }
        if self.max_multiplier_cap <= Decimal::ZERO {
            return fail("DCA_MAX_MULTIPLIER_CAP must be positive");
        }
        if self.paper_balance < Decimal::ZERO {
            return fail("DCA_PAPER_BALANCE must not be negative");
        }
        if self.asset.is_empty() || self.market_symbol.is_empty() {
            return fail("DCA_ASSET and DCA_MARKET_SYMBOL must not be empty");
        }
        Ok(())
    }

    /// Production strategy parameters as a backtest config
    pub fn backtest_config(&self) -> BacktestConfig {
        BacktestConfig {
            base_daily_amount: self.base_daily_amount,
            high_lookback_days: self.high_lookback_days,
            bear_market_ma_period: self.bear_market_ma_period,
            bear_boost_factor: self.bear_boost_factor,
            max_multiplier_cap: self.max_multiplier_cap,
            tiers: self.tiers.clone(),
        }
    }

    pub fn execution_settings(&self) -> ExecutionSettings {
        ExecutionSettings::from_backtest_config(
            &self.asset,
            &self.market_symbol,
            &self.backtest_config(),
            self.dry_run,
        )
    }
}

fn env_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: &str,
) -> Result<T, DcaError>
where
    T::Err: std::fmt::Display,
{
    let raw = lookup(key).unwrap_or_else(|| default.to_string());
    parse_value(key, &raw)
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> Result<T, DcaError>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|e| DcaError::Config(format!("{key}='{raw}': {e}")))
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, DcaError> {
    match raw.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(DcaError::Config(format!("{key}='{raw}' is not a boolean"))),
    }
}

fn parse_buy_time(raw: &str) -> Result<NaiveTime, DcaError> {
    NaiveTime::parse_from_str(raw.trim(), "%H:%M")
        .map_err(|e| DcaError::Config(format!("DCA_BUY_TIME='{raw}' is not HH:MM: {e}")))
}

/// Parse `drop:multiplier` pairs, e.g. `0.05:1.5,0.10:2.0`
pub fn parse_tiers(raw: &str) -> Result<Vec<MultiplierTier>, DcaError> {
    let mut tiers = Vec::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (drop, multiplier) = pair
            .split_once(':')
            .ok_or_else(|| DcaError::Config(format!("tier '{pair}' is not drop:multiplier")))?;
        let drop: Decimal = parse_value("DCA_TIERS", drop)?;
        let multiplier: Decimal = parse_value("DCA_TIERS", multiplier)?;

        if drop < Decimal::ZERO || drop > dec!(1) {
            return Err(DcaError::Config(format!(
                "tier drop {drop} must be a fraction within [0, 1]"
            )));
        }
        if multiplier <= Decimal::ZERO {
            return Err(DcaError::Config(format!(
                "tier multiplier {multiplier} must be positive"
            )));
        }
        tiers.push(MultiplierTier::new(drop, multiplier));
    }
    Ok(tiers)
}
