//! Parameter sweep over smart DCA configurations
//!
//! Expands parameter axes into a cartesian product of [`BacktestConfig`]s,
//! backtests them in bounded parallel batches, ranks the results and keeps
//! full detail only for the best few.

use futures_util::future::join_all;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Ordering as CmpOrdering;
use std::fmt;
use std::str::FromStr;
use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc,
};
use tracing::{info, warn};

use crate::engine::BacktestEngine;
use crate::error::BacktestError;
use crate::types::{
    default_tiers, BacktestConfig, BacktestResult, DailyPriceData, MultiplierTier,
    PurchaseLogEntry, TierBreakdownEntry,
};
use crate::walk_forward::{self, WalkForwardSummary, DEFAULT_TRAIN_RATIO};

/// Configurations that keep their tier breakdown and day log
pub const TOP_DETAIL_COUNT: usize = 5;
pub const DEFAULT_MAX_COMBINATIONS: usize = 3000;
pub const MAX_COMBINATIONS_CEILING: usize = 10_000;
const MIN_BATCH_SIZE: usize = 4;
const MAX_BATCH_SIZE: usize = 16;

// ============================================================================
// Types
// ============================================================================

/// Metric used to order sweep results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RankBy {
    /// Descending efficiency ratio
    Efficiency,
    /// Ascending smart DCA average cost basis
    CostBasis,
    /// Descending extra BTC vs. the same-base fixed strategy
    ExtraBtc,
    /// Descending smart DCA return percent
    ReturnPct,
}

impl FromStr for RankBy {
    type Err = BacktestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "efficiency" => Ok(RankBy::Efficiency),
            "costBasis" | "cost_basis" => Ok(RankBy::CostBasis),
            "extraBtc" | "extra_btc" => Ok(RankBy::ExtraBtc),
            "returnPct" | "return_pct" => Ok(RankBy::ReturnPct),
            other => Err(BacktestError::Validation(format!(
                "unknown rankBy '{other}' (expected efficiency, costBasis, extraBtc or returnPct)"
            ))),
        }
    }
}

impl fmt::Display for RankBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RankBy::Efficiency => write!(f, "efficiency"),
            RankBy::CostBasis => write!(f, "costBasis"),
            RankBy::ExtraBtc => write!(f, "extraBtc"),
            RankBy::ReturnPct => write!(f, "returnPct"),
        }
    }
}

/// Named parameter ranges
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepPreset {
    Conservative,
    Full,
}

impl FromStr for SweepPreset {
    type Err = BacktestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "conservative" => Ok(SweepPreset::Conservative),
            "full" => Ok(SweepPreset::Full),
            other => Err(BacktestError::Validation(format!(
                "unknown preset '{other}' (expected conservative or full)"
            ))),
        }
    }
}

/// Parameter ranges to sweep. Empty axes fall back to the preset, then to the defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SweepRequest {
    pub preset: Option<String>,
    #[serde(default)]
    pub base_daily_amounts: Vec<Decimal>,
    #[serde(default)]
    pub high_lookback_days: Vec<usize>,
    #[serde(default)]
    pub bear_market_ma_periods: Vec<usize>,
    #[serde(default)]
    pub bear_boost_factors: Vec<Decimal>,
    #[serde(default)]
    pub max_multiplier_caps: Vec<Decimal>,
    #[serde(default)]
    pub tier_sets: Vec<Vec<MultiplierTier>>,
    pub rank_by: Option<String>,
    pub max_combinations: Option<usize>,
    pub walk_forward: Option<bool>,
    pub train_ratio: Option<Decimal>,
}

/// A validated sweep, ready to execute
#[derive(Debug, Clone)]
pub struct SweepPlan {
    pub configs: Vec<BacktestConfig>,
    pub rank_by: RankBy,
    pub walk_forward: bool,
    pub train_ratio: Decimal,
}

/// Tier breakdown and day log, kept for top-ranked configurations only
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepDetail {
    pub tier_breakdown: Vec<TierBreakdownEntry>,
    pub purchase_log: Vec<PurchaseLogEntry>,
}

/// Summary of one configuration's backtest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepRunResult {
    pub rank: usize,
    /// SHA-256 of the serialized config
    pub config_hash: String,
    pub config: BacktestConfig,
    pub smart_total_invested: Decimal,
    pub smart_total_btc: Decimal,
    pub smart_avg_cost_basis: Decimal,
    pub smart_return_percent: Decimal,
    pub smart_max_drawdown: Decimal,
    pub same_base_return_percent: Decimal,
    pub efficiency_ratio: Decimal,
    pub extra_btc_percent_vs_same_base: Decimal,
    pub cost_basis_delta_vs_same_base: Decimal,
    pub detail: Option<SweepDetail>,
}

impl SweepRunResult {
    fn from_result(config: BacktestConfig, result: &BacktestResult) -> Self {
        Self {
            rank: 0,
            config_hash: config_hash(&config),
            smart_total_invested: result.smart_dca.total_invested,
            smart_total_btc: result.smart_dca.total_btc,
            smart_avg_cost_basis: result.smart_dca.avg_cost_basis,
            smart_return_percent: result.smart_dca.return_percent,
            smart_max_drawdown: result.smart_dca.max_drawdown,
            same_base_return_percent: result.fixed_dca_same_base.return_percent,
            efficiency_ratio: result.comparison.efficiency_ratio,
            extra_btc_percent_vs_same_base: result.comparison.extra_btc_percent_vs_same_base,
            cost_basis_delta_vs_same_base: result.comparison.cost_basis_delta_vs_same_base,
            config,
            detail: None,
        }
    }
}

/// Ranked sweep output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepOutcome {
    pub rank_by: RankBy,
    pub total_combinations: usize,
    pub total_days: usize,
    /// Every configuration in rank order, summaries only
    pub results: Vec<SweepRunResult>,
    /// The best [`TOP_DETAIL_COUNT`] configurations with full detail
    pub top: Vec<SweepRunResult>,
    pub walk_forward: Option<WalkForwardSummary>,
}

/// Shared progress tracker between API handler and sweep task
pub struct SweepProgress {
    pub running: AtomicBool,
    pub total_combinations: AtomicU32,
    pub completed: AtomicU32,
    pub cancelled: AtomicBool,
}

impl SweepProgress {
    pub fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            total_combinations: AtomicU32::new(0),
            completed: AtomicU32::new(0),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Claim the tracker for a new sweep; false if one is already running
    pub fn try_start(&self, total: usize) -> bool {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.total_combinations
            .store(u32::try_from(total).unwrap_or(u32::MAX), Ordering::Relaxed);
        self.completed.store(0, Ordering::Relaxed);
        self.cancelled.store(false, Ordering::Relaxed);
        true
    }

    /// Like [`try_start`](Self::try_start), but the sweep is finished when the
    /// returned claim is dropped, including when its task is aborted
    pub fn claim(self: &Arc<Self>, total: usize) -> Option<SweepClaim> {
        self.try_start(total).then(|| SweepClaim {
            progress: Arc::clone(self),
        })
    }

    pub fn finish(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Get progress as percentage
    pub fn progress_pct(&self) -> f32 {
        let total = self.total_combinations.load(Ordering::Relaxed);
        let done = self.completed.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            (done as f32 / total as f32) * 100.0
        }
    }
}

/// Exclusive hold on a [`SweepProgress`]
pub struct SweepClaim {
    progress: Arc<SweepProgress>,
}

impl SweepClaim {
    pub fn progress(&self) -> &SweepProgress {
        &self.progress
    }
}

impl Drop for SweepClaim {
    fn drop(&mut self) {
        self.progress.finish();
    }
}

impl Default for SweepProgress {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Presets and grid generation
// ============================================================================

/// Gentler ladder for cautious accumulation
pub fn gentle_tiers() -> Vec<MultiplierTier> {
    vec![
        MultiplierTier::new(dec!(0.05), dec!(1.25)),
        MultiplierTier::new(dec!(0.10), dec!(1.5)),
        MultiplierTier::new(dec!(0.20), dec!(2.0)),
    ]
}

pub fn aggressive_tiers() -> Vec<MultiplierTier> {
    vec![
        MultiplierTier::new(dec!(0.05), dec!(2.0)),
        MultiplierTier::new(dec!(0.10), dec!(3.0)),
        MultiplierTier::new(dec!(0.20), dec!(4.0)),
    ]
}

/// Ignores shallow dips entirely
pub fn deep_dip_tiers() -> Vec<MultiplierTier> {
    vec![
        MultiplierTier::new(dec!(0.10), dec!(1.5)),
        MultiplierTier::new(dec!(0.20), dec!(2.5)),
        MultiplierTier::new(dec!(0.30), dec!(4.0)),
    ]
}

impl SweepRequest {
    /// Fill axes the caller left empty from a named preset
    pub fn with_preset(mut self, preset: SweepPreset) -> Self {
        let (lookbacks, mas, boosts, caps, tier_sets): (
            Vec<usize>,
            Vec<usize>,
            Vec<Decimal>,
            Vec<Decimal>,
            Vec<Vec<MultiplierTier>>,
        ) = match preset {
            SweepPreset::Conservative => (
                vec![21, 30, 45],
                vec![150, 200],
                vec![dec!(1.0), dec!(1.5)],
                vec![dec!(3.5), dec!(4.5)],
                vec![default_tiers(), gentle_tiers()],
            ),
            SweepPreset::Full => (
                vec![14, 21, 30, 45, 60, 90],
                vec![50, 100, 150, 200],
                vec![dec!(0), dec!(0.5), dec!(1.0), dec!(1.5), dec!(2.0)],
                vec![dec!(3.0), dec!(3.5), dec!(4.0), dec!(4.5), dec!(5.0)],
                vec![
                    default_tiers(),
                    gentle_tiers(),
                    aggressive_tiers(),
                    deep_dip_tiers(),
                ],
            ),
        };

        if self.high_lookback_days.is_empty() {
            self.high_lookback_days = lookbacks;
        }
        if self.bear_market_ma_periods.is_empty() {
            self.bear_market_ma_periods = mas;
        }
        if self.bear_boost_factors.is_empty() {
            self.bear_boost_factors = boosts;
        }
        if self.max_multiplier_caps.is_empty() {
            self.max_multiplier_caps = caps;
        }
        if self.tier_sets.is_empty() {
            self.tier_sets = tier_sets;
        }
        self
    }
}

fn axis_or_default<T: Clone>(values: &[T], default: T) -> Vec<T> {
    if values.is_empty() {
        vec![default]
    } else {
        values.to_vec()
    }
}

/// Expand the request into the full cartesian product of configurations.
///
/// Order: base amount × lookback × MA period × bear boost × cap × tier set.
pub fn generate_combinations(
    request: &SweepRequest,
    defaults: &BacktestConfig,
) -> Vec<BacktestConfig> {
    let amounts = axis_or_default(&request.base_daily_amounts, defaults.base_daily_amount);
    let lookbacks = axis_or_default(&request.high_lookback_days, defaults.high_lookback_days);
    let mas = axis_or_default(&request.bear_market_ma_periods, defaults.bear_market_ma_period);
    let boosts = axis_or_default(&request.bear_boost_factors, defaults.bear_boost_factor);
    let caps = axis_or_default(&request.max_multiplier_caps, defaults.max_multiplier_cap);
    let tier_sets = axis_or_default(&request.tier_sets, defaults.tiers.clone());

    let mut grid = Vec::with_capacity(combination_count(request).unwrap_or(0));

    for &amount in &amounts {
        for &lookback in &lookbacks {
            for &ma in &mas {
                for &boost in &boosts {
                    for &cap in &caps {
                        for tiers in &tier_sets {
                            grid.push(BacktestConfig {
                                base_daily_amount: amount,
                                high_lookback_days: lookback,
                                bear_market_ma_period: ma,
                                bear_boost_factor: boost,
                                max_multiplier_cap: cap,
                                tiers: tiers.clone(),
                            });
                        }
                    }
                }
            }
        }
    }
    grid
}

/// Size of the cartesian product; `None` when it overflows `usize`.
/// Unset axes count as one value.
pub fn combination_count(request: &SweepRequest) -> Option<usize> {
    [
        request.base_daily_amounts.len(),
        request.high_lookback_days.len(),
        request.bear_market_ma_periods.len(),
        request.bear_boost_factors.len(),
        request.max_multiplier_caps.len(),
        request.tier_sets.len(),
    ]
    .into_iter()
    .try_fold(1usize, |acc, len| acc.checked_mul(len.max(1)))
}

/// Reject malformed axis values before any simulation work
fn validate_axes(request: &SweepRequest) -> Result<(), BacktestError> {
    let invalid = |msg: String| Err(BacktestError::Validation(msg));

    if let Some(a) = request.base_daily_amounts.iter().find(|a| **a <= Decimal::ZERO) {
        return invalid(format!("base daily amount must be positive, got {a}"));
    }
    if request.high_lookback_days.contains(&0) {
        return invalid("high lookback days must be at least 1".to_string());
    }
    if request.bear_market_ma_periods.contains(&0) {
        return invalid("bear market MA period must be at least 1".to_string());
    }
    if let Some(b) = request.bear_boost_factors.iter().find(|b| **b < Decimal::ZERO) {
        return invalid(format!("bear boost factor must not be negative, got {b}"));
    }
    if let Some(c) = request.max_multiplier_caps.iter().find(|c| **c <= Decimal::ZERO) {
        return invalid(format!("max multiplier cap must be positive, got {c}"));
    }
    for tier in request.tier_sets.iter().flatten() {
        if tier.drop_percentage < Decimal::ZERO || tier.drop_percentage > Decimal::ONE {
            return invalid(format!(
                "tier drop percentage must be within [0, 1], got {}",
                tier.drop_percentage
            ));
        }
        if tier.multiplier <= Decimal::ZERO {
            return invalid(format!(
                "tier multiplier must be positive, got {}",
                tier.multiplier
            ));
        }
    }
    Ok(())
}

/// Resolve the preset, validate everything and expand the grid
pub fn prepare_sweep(
    request: SweepRequest,
    defaults: &BacktestConfig,
) -> Result<SweepPlan, BacktestError> {
    let request = match request.preset.as_deref() {
        Some(name) => {
            let preset = SweepPreset::from_str(name)?;
            request.with_preset(preset)
        }
        None => request,
    };

    let rank_by = match request.rank_by.as_deref() {
        Some(s) => RankBy::from_str(s)?,
        None => RankBy::Efficiency,
    };

    let max_combinations = request.max_combinations.unwrap_or(DEFAULT_MAX_COMBINATIONS);
    if max_combinations == 0 || max_combinations > MAX_COMBINATIONS_CEILING {
        return Err(BacktestError::Validation(format!(
            "maxCombinations must be between 1 and {MAX_COMBINATIONS_CEILING}, got {max_combinations}"
        )));
    }

    let train_ratio = request.train_ratio.unwrap_or(DEFAULT_TRAIN_RATIO);
    if train_ratio <= Decimal::ZERO || train_ratio >= Decimal::ONE {
        return Err(BacktestError::Validation(format!(
            "train ratio must be between 0 and 1, got {train_ratio}"
        )));
    }

    validate_axes(&request)?;

    match combination_count(&request) {
        Some(count) if count <= max_combinations => {}
        Some(count) => {
            return Err(BacktestError::Validation(format!(
                "sweep expands to {count} combinations, above the limit of {max_combinations}"
            )));
        }
        None => {
            return Err(BacktestError::Validation(format!(
                "sweep expands to more combinations than can be counted, limit is {max_combinations}"
            )));
        }
    }

    let configs = generate_combinations(&request, defaults);

    Ok(SweepPlan {
        configs,
        rank_by,
        walk_forward: request.walk_forward.unwrap_or(false),
        train_ratio,
    })
}

// ============================================================================
// Execution
// ============================================================================

/// Backtests per batch: available processors clamped to [4, 16]
pub fn batch_size() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(MIN_BATCH_SIZE)
        .clamp(MIN_BATCH_SIZE, MAX_BATCH_SIZE)
}

/// Deterministic fingerprint of a config
pub fn config_hash(config: &BacktestConfig) -> String {
    let json = serde_json::to_string(config).unwrap_or_default();
    format!("{:x}", Sha256::digest(json.as_bytes()))
}

/// Ordering for `rank_by`, best first
pub fn compare_results(rank_by: RankBy, a: &SweepRunResult, b: &SweepRunResult) -> CmpOrdering {
    match rank_by {
        RankBy::Efficiency => b.efficiency_ratio.cmp(&a.efficiency_ratio),
        RankBy::CostBasis => a.smart_avg_cost_basis.cmp(&b.smart_avg_cost_basis),
        RankBy::ExtraBtc => b
            .extra_btc_percent_vs_same_base
            .cmp(&a.extra_btc_percent_vs_same_base),
        RankBy::ReturnPct => b.smart_return_percent.cmp(&a.smart_return_percent),
    }
}

/// Run every config in bounded parallel batches and rank the results.
///
/// Each batch runs on the blocking pool and is awaited as a whole before the
/// next one starts. Returns all results (summary only) and the top
/// [`TOP_DETAIL_COUNT`] with detail.
pub async fn execute_sweep(
    configs: Vec<BacktestConfig>,
    price_data: Arc<Vec<DailyPriceData>>,
    rank_by: RankBy,
    progress: &SweepProgress,
) -> Result<(Vec<SweepRunResult>, Vec<SweepRunResult>), BacktestError> {
    if price_data.is_empty() {
        return Err(BacktestError::InvalidArgument(
            "price data must not be empty".to_string(),
        ));
    }

    let batch = batch_size();
    info!(
        combinations = configs.len(),
        batch_size = batch,
        rank_by = %rank_by,
        "Starting parameter sweep"
    );

    // (config index, summary) pairs; the index keeps ties in generation order
    let mut summaries: Vec<(usize, SweepRunResult)> = Vec::with_capacity(configs.len());
    let mut best: Vec<(usize, SweepRunResult)> = Vec::with_capacity(TOP_DETAIL_COUNT + batch);

    for (batch_no, chunk) in configs.chunks(batch).enumerate() {
        if progress.cancelled.load(Ordering::Relaxed) {
            warn!("Sweep cancelled");
            return Err(BacktestError::InvalidArgument("sweep cancelled".to_string()));
        }

        let offset = batch_no * batch;
        let handles = chunk.iter().cloned().enumerate().map(|(i, config)| {
            let data = Arc::clone(&price_data);
            tokio::task::spawn_blocking(move || {
                let result = BacktestEngine::run(&config, &data);
                (offset + i, config, result)
            })
        });

        for joined in join_all(handles).await {
            let (index, config, result) = joined.map_err(|e| {
                BacktestError::InvalidArgument(format!("backtest task failed: {e}"))
            })?;
            let result = result?;

            let summary = SweepRunResult::from_result(config, &result);
            let mut detailed = summary.clone();
            detailed.detail = Some(SweepDetail {
                tier_breakdown: result.tier_breakdown,
                purchase_log: result.purchase_log,
            });
            summaries.push((index, summary));
            best.push((index, detailed));
        }

        // Keep only the running top few so detail memory stays bounded
        best.sort_by(|a, b| compare_results(rank_by, &a.1, &b.1).then(a.0.cmp(&b.0)));
        best.truncate(TOP_DETAIL_COUNT);

        progress
            .completed
            .fetch_add(u32::try_from(chunk.len()).unwrap_or(u32::MAX), Ordering::Relaxed);
    }

    summaries.sort_by(|a, b| compare_results(rank_by, &a.1, &b.1).then(a.0.cmp(&b.0)));
    let results: Vec<SweepRunResult> = summaries
        .into_iter()
        .enumerate()
        .map(|(i, (_, mut s))| {
            s.rank = i + 1;
            s
        })
        .collect();

    let top: Vec<SweepRunResult> = best
        .into_iter()
        .enumerate()
        .map(|(i, (_, mut s))| {
            s.rank = i + 1;
            s
        })
        .collect();

    if let Some(winner) = top.first() {
        info!(
            rank = 1,
            efficiency = %winner.efficiency_ratio,
            return_pct = %winner.smart_return_percent,
            avg_cost = %winner.smart_avg_cost_basis,
            "Best configuration found"
        );
    }

    Ok((results, top))
}

/// Prepare, execute and optionally walk-forward validate a sweep
pub async fn run_sweep(
    request: SweepRequest,
    defaults: &BacktestConfig,
    price_data: Vec<DailyPriceData>,
    progress: &SweepProgress,
) -> Result<SweepOutcome, BacktestError> {
    let plan = prepare_sweep(request, defaults)?;
    run_plan(plan, price_data, progress).await
}

/// Execute an already validated plan
pub async fn run_plan(
    plan: SweepPlan,
    price_data: Vec<DailyPriceData>,
    progress: &SweepProgress,
) -> Result<SweepOutcome, BacktestError> {
    let total_combinations = plan.configs.len();
    let total_days = price_data.len();
    let price_data = Arc::new(price_data);

    let (results, top) =
        execute_sweep(plan.configs, Arc::clone(&price_data), plan.rank_by, progress).await?;

    let walk_forward = if plan.walk_forward {
        let ranked_configs: Vec<BacktestConfig> =
            results.iter().map(|r| r.config.clone()).collect();
        let data = Arc::clone(&price_data);
        let ratio = plan.train_ratio;
        let summary = tokio::task::spawn_blocking(move || {
            walk_forward::validate_all(&ranked_configs, &data, ratio)
        })
        .await
        .map_err(|e| BacktestError::InvalidArgument(format!("walk-forward task failed: {e}")))??;
        Some(summary)
    } else {
        None
    };

    Ok(SweepOutcome {
        rank_by: plan.rank_by,
        total_combinations,
        total_days,
        results,
        top,
        walk_forward,
    })
}
