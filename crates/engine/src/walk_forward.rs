//! Walk-forward validation — does a configuration hold up out of sample?
//!
//! History is split once into an earlier train segment and a later test
//! segment. Both are backtested independently; a large drop in return or
//! efficiency on the test segment flags the configuration as overfit.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::engine::BacktestEngine;
use crate::error::BacktestError;
use crate::types::{BacktestConfig, BacktestResult, DailyPriceData};

pub const DEFAULT_TRAIN_RATIO: Decimal = dec!(0.70);
/// Either split shorter than this is not worth validating
pub const MIN_SPLIT_DAYS: usize = 30;
/// Test return this many percentage points below train return is overfit
pub const RETURN_DEGRADATION_LIMIT: Decimal = dec!(-20);
pub const EFFICIENCY_DEGRADATION_LIMIT: Decimal = dec!(-0.3);

/// Summary metrics of one segment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentMetrics {
    pub days: usize,
    pub return_percent: Decimal,
    pub efficiency_ratio: Decimal,
    pub avg_cost_basis: Decimal,
    pub extra_btc_percent: Decimal,
}

impl SegmentMetrics {
    fn from_result(result: &BacktestResult) -> Self {
        Self {
            days: result.total_days,
            return_percent: result.smart_dca.return_percent,
            efficiency_ratio: result.comparison.efficiency_ratio,
            avg_cost_basis: result.smart_dca.avg_cost_basis,
            extra_btc_percent: result.comparison.extra_btc_percent_vs_same_base,
        }
    }
}

/// Train/test comparison for one configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalkForwardEntry {
    pub config: BacktestConfig,
    pub train: SegmentMetrics,
    pub test: SegmentMetrics,
    /// `test.return_percent - train.return_percent`
    pub return_degradation: Decimal,
    /// `test.efficiency_ratio - train.efficiency_ratio`
    pub efficiency_degradation: Decimal,
    pub overfit_warning: bool,
}

/// Aggregate over a set of configurations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalkForwardSummary {
    pub train_ratio: Decimal,
    pub entries: Vec<WalkForwardEntry>,
    pub validated: usize,
    pub overfit: usize,
    pub insufficient_data: usize,
}

/// Validate one configuration.
///
/// Returns `Ok(None)` when either split has fewer than [`MIN_SPLIT_DAYS`] days.
/// A ratio outside (0, 1) is a caller error.
pub fn validate(
    config: &BacktestConfig,
    full_data: &[DailyPriceData],
    train_ratio: Decimal,
) -> Result<Option<WalkForwardEntry>, BacktestError> {
    if train_ratio <= Decimal::ZERO || train_ratio >= Decimal::ONE {
        return Err(BacktestError::InvalidArgument(format!(
            "train ratio must be between 0 and 1, got {train_ratio}"
        )));
    }

    let split = split_index(full_data.len(), train_ratio);
    let (train_data, test_data) = full_data.split_at(split);
    if train_data.len() < MIN_SPLIT_DAYS || test_data.len() < MIN_SPLIT_DAYS {
        return Ok(None);
    }

    let train = SegmentMetrics::from_result(&BacktestEngine::run(config, train_data)?);
    let test = SegmentMetrics::from_result(&BacktestEngine::run(config, test_data)?);

    let return_degradation = test.return_percent - train.return_percent;
    let efficiency_degradation = test.efficiency_ratio - train.efficiency_ratio;
    let overfit_warning = return_degradation < RETURN_DEGRADATION_LIMIT
        || efficiency_degradation < EFFICIENCY_DEGRADATION_LIMIT;

    Ok(Some(WalkForwardEntry {
        config: config.clone(),
        train,
        test,
        return_degradation,
        efficiency_degradation,
        overfit_warning,
    }))
}

/// Validate every configuration and count the outcomes
pub fn validate_all(
    configs: &[BacktestConfig],
    full_data: &[DailyPriceData],
    train_ratio: Decimal,
) -> Result<WalkForwardSummary, BacktestError> {
    let mut entries = Vec::with_capacity(configs.len());
    let mut insufficient_data = 0usize;

    for config in configs {
        match validate(config, full_data, train_ratio)? {
            Some(entry) => entries.push(entry),
            None => insufficient_data += 1,
        }
    }

    let overfit = entries.iter().filter(|e| e.overfit_warning).count();

    info!(
        configs = configs.len(),
        validated = entries.len(),
        overfit,
        insufficient_data,
        "Walk-forward validation complete"
    );

    Ok(WalkForwardSummary {
        train_ratio,
        validated: entries.len(),
        overfit,
        insufficient_data,
        entries,
    })
}

/// `floor(len * ratio)`
fn split_index(len: usize, ratio: Decimal) -> usize {
    (Decimal::from(len) * ratio).floor().to_usize().unwrap_or(0)
}
