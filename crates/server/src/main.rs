//! Smart DCA — dip-weighted daily accumulation with backtesting
//!
//! Usage:
//!   smart-dca serve --port 3001                   — HTTP API + daily scheduler
//!   smart-dca backtest --days 730                 — Backtest production settings
//!   smart-dca sweep --preset conservative         — Rank parameter combinations
//!   smart-dca execute --date 2025-01-31           — Run one purchase now

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::{Days, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use engine::{
    prepare_sweep, run_plan, BacktestEngine, BinanceClient, CandlePriceHistory, DailyPriceData,
    DcaConfig, DcaExecutionService, DcaScheduler, ExchangeClient, MultiplierTier,
    OutboxEventPublisher, PaperExchange, Purchase, SqliteLock, SqlitePurchaseStore, SweepProgress,
    SweepRequest,
};
use persistence::repository::{OutboxRepository, PurchaseRepository};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

const APP_VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "-", env!("GIT_HASH"));
const DEFAULT_HISTORY_DAYS: u64 = 730;
const DEFAULT_PURCHASE_LIMIT: i64 = 30;
const MAX_PURCHASE_LIMIT: i64 = 500;

#[derive(Parser)]
#[command(name = "smart-dca")]
#[command(about = "Dip-weighted daily accumulation with backtesting", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch the HTTP API and the daily purchase scheduler
    Serve {
        /// Host to bind to
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
        /// Port to listen on
        #[arg(short, long, default_value_t = 3001)]
        port: u16,
    },
    /// Backtest the configured strategy against fixed DCA
    Backtest {
        /// Days of history ending yesterday
        #[arg(long, default_value_t = DEFAULT_HISTORY_DAYS)]
        days: u64,
    },
    /// Sweep strategy parameters and rank the results
    Sweep {
        /// Days of history ending yesterday
        #[arg(long, default_value_t = DEFAULT_HISTORY_DAYS)]
        days: u64,
        /// Preset: conservative, full
        #[arg(long, default_value = "conservative")]
        preset: String,
        /// Ranking: efficiency, costBasis, extraBtc, returnPct
        #[arg(long, default_value = "efficiency")]
        rank_by: String,
        /// Also run walk-forward validation
        #[arg(long)]
        walk_forward: bool,
        /// Number of top results to print
        #[arg(long, default_value_t = 10)]
        top_n: usize,
    },
    /// Run the daily purchase once, outside the scheduler
    Execute {
        /// Purchase date (defaults to today, UTC)
        #[arg(long)]
        date: Option<NaiveDate>,
    },
}

#[derive(Clone)]
struct AppState {
    config: Arc<DcaConfig>,
    binance: Arc<BinanceClient>,
    db: Arc<persistence::Database>,
    exchange: Arc<dyn ExchangeClient>,
    execution: Arc<DcaExecutionService>,
    sweep_progress: Arc<SweepProgress>,
    shutdown: CancellationToken,
}

type ApiResult = Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)>;

fn api_error(
    status: StatusCode,
    message: impl Into<String>,
) -> (StatusCode, Json<serde_json::Value>) {
    (
        status,
        Json(serde_json::json!({
            "success": false,
            "message": message.into(),
        })),
    )
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = if verbose {
        EnvFilter::new("debug,engine=debug,smart_dca=debug")
    } else {
        EnvFilter::new("info,engine=info,smart_dca=info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).compact())
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = DcaConfig::from_env()?;

    match cli.command {
        Commands::Serve { host, port } => {
            cmd_serve(config, &host, port).await?;
        }
        Commands::Backtest { days } => {
            cmd_backtest(config, days).await?;
        }
        Commands::Sweep {
            days,
            preset,
            rank_by,
            walk_forward,
            top_n,
        } => {
            cmd_sweep(config, days, preset, rank_by, walk_forward, top_n).await?;
        }
        Commands::Execute { date } => {
            cmd_execute(config, date).await?;
        }
    }

    Ok(())
}

// ============================================================================
// Wiring
// ============================================================================

async fn open_database(config: &DcaConfig) -> anyhow::Result<persistence::Database> {
    let db = persistence::Database::new(&config.db_path).await.map_err(|e| {
        error!("Failed to initialize database: {}", e);
        anyhow::anyhow!("Database initialization failed: {}", e)
    })?;
    info!("Database initialized: {}", config.db_path);
    Ok(db)
}

fn build_exchange(config: &DcaConfig, binance: &Arc<BinanceClient>) -> Arc<PaperExchange> {
    Arc::new(PaperExchange::new(
        binance.clone(),
        &config.market_symbol,
        config.paper_balance,
    ))
}

fn build_execution_service(
    config: &DcaConfig,
    db: &persistence::Database,
    binance: &Arc<BinanceClient>,
    exchange: Arc<dyn ExchangeClient>,
) -> DcaExecutionService {
    let pool = db.pool_clone();
    DcaExecutionService::new(
        exchange,
        Arc::new(CandlePriceHistory::new(binance.clone())),
        Arc::new(SqliteLock::new(pool.clone())),
        Arc::new(SqlitePurchaseStore::new(pool.clone())),
        Arc::new(OutboxEventPublisher::new(pool)),
        config.execution_settings(),
    )
}

/// `days` days ending yesterday (UTC)
fn default_range(days: u64) -> (NaiveDate, NaiveDate) {
    let today = Utc::now().date_naive();
    let end = today.pred_opt().unwrap_or(today);
    let start = end
        .checked_sub_days(Days::new(days.saturating_sub(1)))
        .unwrap_or(end);
    (start, end)
}

async fn fetch_history(
    binance: &BinanceClient,
    symbol: &str,
    start: NaiveDate,
    end: NaiveDate,
) -> anyhow::Result<Vec<DailyPriceData>> {
    let data = binance.get_daily_prices(symbol, start, end).await?;
    if data.is_empty() {
        anyhow::bail!("No price data for {} between {} and {}", symbol, start, end);
    }
    Ok(data)
}

// ============================================================================
// Serve command — Axum web server + scheduler
// ============================================================================

async fn cmd_serve(config: DcaConfig, host: &str, port: u16) -> anyhow::Result<()> {
    info!("Smart DCA v{} starting...", APP_VERSION);

    let db = open_database(&config).await?;
    let binance = Arc::new(BinanceClient::new());
    let exchange: Arc<dyn ExchangeClient> = build_exchange(&config, &binance);
    let execution = Arc::new(build_execution_service(
        &config,
        &db,
        &binance,
        exchange.clone(),
    ));
    let shutdown = CancellationToken::new();

    let scheduler = DcaScheduler::new(execution.clone(), config.buy_time);
    let scheduler_handle = {
        let token = shutdown.clone();
        tokio::spawn(async move { scheduler.run(token).await })
    };

    let state = AppState {
        config: Arc::new(config),
        binance,
        db: Arc::new(db),
        exchange,
        execution,
        sweep_progress: Arc::new(SweepProgress::new()),
        shutdown: shutdown.clone(),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/health", get(api_health))
        .route("/backtest", post(api_backtest))
        .route("/backtest/sweep", post(api_sweep))
        .route("/backtest/sweep/status", get(api_sweep_status))
        .route("/backtest/sweep/cancel", post(api_sweep_cancel))
        .route("/dca/purchases", get(api_purchases))
        .route("/dca/status", get(api_dca_status))
        .route("/dca/execute", post(api_execute))
        .route("/dca/events", get(api_pending_events))
        .with_state(state.clone());

    let app = Router::new().nest("/api", api_routes).layer(cors);

    let addr: std::net::SocketAddr = format!("{}:{}", host, port).parse()?;
    println!("\n=== Smart DCA v{} ===", APP_VERSION);
    println!("Listening on http://{}", addr);
    println!("\nEndpoints:");
    println!("  GET  /api/health                  - Health check");
    println!("  POST /api/backtest                - Backtest a configuration");
    println!("  POST /api/backtest/sweep          - Parameter sweep (ranked)");
    println!("  GET  /api/backtest/sweep/status   - Poll sweep progress");
    println!("  POST /api/backtest/sweep/cancel   - Cancel running sweep");
    println!("  GET  /api/dca/purchases           - Recent purchases");
    println!("  GET  /api/dca/status              - Scheduler and account status");
    println!("  POST /api/dca/execute             - Run today's purchase now");
    println!("  GET  /api/dca/events              - Undispatched domain events");
    println!(
        "\n  Asset: {} ({}), buy time {} UTC, dry run: {}",
        state.config.asset, state.config.quote, state.config.buy_time, state.config.dry_run
    );
    println!("  Database: {}", state.config.db_path);
    println!("\nPress Ctrl+C to stop\n");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    if let Err(e) = scheduler_handle.await {
        warn!("Scheduler task ended abnormally: {}", e);
    }
    info!("Smart DCA stopped");

    Ok(())
}

async fn shutdown_signal(token: CancellationToken) {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl+C received, shutting down");
            token.cancel();
        }
        _ = token.cancelled() => {}
    }
}

// ============================================================================
// CLI commands
// ============================================================================

async fn cmd_backtest(config: DcaConfig, days: u64) -> anyhow::Result<()> {
    let binance = BinanceClient::new();
    let (start, end) = default_range(days);
    let data = fetch_history(&binance, &config.market_symbol, start, end).await?;

    let backtest_config = config.backtest_config();
    let result =
        tokio::task::spawn_blocking(move || BacktestEngine::run(&backtest_config, &data)).await??;

    println!(
        "\nBacktest {} → {} ({} days), final price {}",
        result.start_date, result.end_date, result.total_days, result.final_price
    );
    println!(
        "  {:<22} {:>12} {:>14} {:>12} {:>9} {:>9}",
        "Strategy", "Invested", "Units", "Avg cost", "Return%", "MaxDD%"
    );
    println!("  {}", "-".repeat(84));
    for (name, m) in [
        ("Smart DCA", &result.smart_dca),
        ("Fixed (same base)", &result.fixed_dca_same_base),
        ("Fixed (match total)", &result.fixed_dca_match_total),
    ] {
        println!(
            "  {:<22} {:>12} {:>14} {:>12} {:>9} {:>9}",
            name,
            m.total_invested.round_dp(2),
            m.total_btc.round_dp(8),
            m.avg_cost_basis.round_dp(2),
            m.return_percent.round_dp(2),
            m.max_drawdown.round_dp(2),
        );
    }

    let c = &result.comparison;
    println!(
        "\n  Cost basis vs same base: {}%   vs match total: {}%",
        c.cost_basis_delta_vs_same_base.round_dp(2),
        c.cost_basis_delta_vs_match_total.round_dp(2)
    );
    println!(
        "  Extra units vs same base: {}%  vs match total: {}%   efficiency {}",
        c.extra_btc_percent_vs_same_base.round_dp(2),
        c.extra_btc_percent_vs_match_total.round_dp(2),
        c.efficiency_ratio.round_dp(3)
    );

    println!("\n  Tier breakdown:");
    for tier in &result.tier_breakdown {
        println!(
            "    {:<8} {:>5} days  extra ${:>10}  extra units {}",
            tier.tier,
            tier.trigger_count,
            tier.extra_usd_spent.round_dp(2),
            tier.extra_btc_acquired.round_dp(8)
        );
    }

    Ok(())
}

async fn cmd_sweep(
    config: DcaConfig,
    days: u64,
    preset: String,
    rank_by: String,
    walk_forward: bool,
    top_n: usize,
) -> anyhow::Result<()> {
    let request = SweepRequest {
        preset: Some(preset),
        rank_by: Some(rank_by),
        walk_forward: Some(walk_forward),
        ..Default::default()
    };
    let plan = prepare_sweep(request, &config.backtest_config())?;

    let binance = BinanceClient::new();
    let (start, end) = default_range(days);
    let data = fetch_history(&binance, &config.market_symbol, start, end).await?;

    let progress = SweepProgress::new();
    let outcome = run_plan(plan, data, &progress).await?;

    println!(
        "\nSweep: {} combinations over {} days, ranked by {}",
        outcome.total_combinations, outcome.total_days, outcome.rank_by
    );
    println!(
        "  {:>4}  {:>5} {:>5} {:>6} {:>5} {:>6}  {:>10} {:>9} {:>10}",
        "#", "Look", "MA", "Boost", "Cap", "Tiers", "Efficiency", "Return%", "Avg cost"
    );
    println!("  {}", "-".repeat(80));
    for r in outcome.results.iter().take(top_n) {
        println!(
            "  {:>4}  {:>5} {:>5} {:>6} {:>5} {:>6}  {:>10} {:>9} {:>10}",
            r.rank,
            r.config.high_lookback_days,
            r.config.bear_market_ma_period,
            r.config.bear_boost_factor,
            r.config.max_multiplier_cap,
            r.config.tiers.len(),
            r.efficiency_ratio.round_dp(3),
            r.smart_return_percent.round_dp(2),
            r.smart_avg_cost_basis.round_dp(2),
        );
    }

    if let Some(wf) = &outcome.walk_forward {
        println!(
            "\n  Walk-forward ({} train): {} validated, {} overfit, {} insufficient data",
            wf.train_ratio, wf.validated, wf.overfit, wf.insufficient_data
        );
    }

    Ok(())
}

async fn cmd_execute(config: DcaConfig, date: Option<NaiveDate>) -> anyhow::Result<()> {
    let db = open_database(&config).await?;
    let binance = Arc::new(BinanceClient::new());
    let exchange = build_exchange(&config, &binance);
    let service = build_execution_service(&config, &db, &binance, exchange);

    let date = date.unwrap_or_else(|| Utc::now().date_naive());
    let token = CancellationToken::new();
    let outcome = service.execute_daily_purchase(date, &token).await?;

    println!("\n{} → {}", date, serde_json::to_string_pretty(&outcome)?);
    Ok(())
}

// ============================================================================
// API Handlers — Backtesting
// ============================================================================

/// GET /api/health
async fn api_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "smart-dca",
        "version": APP_VERSION,
    }))
}

/// Backtest parameters; anything omitted uses the production configuration
#[derive(Debug, Default, Deserialize)]
struct BacktestRequest {
    start_date: Option<NaiveDate>,
    end_date: Option<NaiveDate>,
    base_daily_amount: Option<Decimal>,
    high_lookback_days: Option<usize>,
    bear_market_ma_period: Option<usize>,
    bear_boost_factor: Option<Decimal>,
    max_multiplier_cap: Option<Decimal>,
    tiers: Option<Vec<MultiplierTier>>,
}

fn resolve_range(
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
) -> Result<(NaiveDate, NaiveDate), (StatusCode, Json<serde_json::Value>)> {
    let (default_start, default_end) = default_range(DEFAULT_HISTORY_DAYS);
    let end = end.unwrap_or(default_end);
    let start = start.unwrap_or_else(|| {
        end.checked_sub_days(Days::new(DEFAULT_HISTORY_DAYS - 1))
            .unwrap_or(default_start)
    });
    if start > end {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            format!("start_date {} is after end_date {}", start, end),
        ));
    }
    Ok((start, end))
}

async fn load_history(
    state: &AppState,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<Vec<DailyPriceData>, (StatusCode, Json<serde_json::Value>)> {
    fetch_history(&state.binance, &state.config.market_symbol, start, end)
        .await
        .map_err(|e| {
            error!("Failed to fetch price history: {}", e);
            api_error(StatusCode::BAD_GATEWAY, format!("Failed to fetch market data: {}", e))
        })
}

/// POST /api/backtest
async fn api_backtest(
    State(state): State<AppState>,
    Json(request): Json<BacktestRequest>,
) -> ApiResult {
    let (start, end) = resolve_range(request.start_date, request.end_date)?;

    let defaults = state.config.backtest_config();
    let config = engine::BacktestConfig {
        base_daily_amount: request.base_daily_amount.unwrap_or(defaults.base_daily_amount),
        high_lookback_days: request.high_lookback_days.unwrap_or(defaults.high_lookback_days),
        bear_market_ma_period: request
            .bear_market_ma_period
            .unwrap_or(defaults.bear_market_ma_period),
        bear_boost_factor: request.bear_boost_factor.unwrap_or(defaults.bear_boost_factor),
        max_multiplier_cap: request.max_multiplier_cap.unwrap_or(defaults.max_multiplier_cap),
        tiers: request.tiers.unwrap_or(defaults.tiers),
    };
    if config.base_daily_amount <= Decimal::ZERO || config.max_multiplier_cap <= Decimal::ZERO {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "base_daily_amount and max_multiplier_cap must be positive",
        ));
    }

    let data = load_history(&state, start, end).await?;
    let total_days = data.len();

    info!(%start, %end, days = total_days, "Running backtest");
    let run_config = config.clone();
    let result = tokio::task::spawn_blocking(move || BacktestEngine::run(&run_config, &data))
        .await
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, e.to_string()))?;

    Ok(Json(serde_json::json!({
        "config": config,
        "start_date": start,
        "end_date": end,
        "total_days": total_days,
        "result": result,
    })))
}

#[derive(Debug, Deserialize)]
struct SweepBody {
    start_date: Option<NaiveDate>,
    end_date: Option<NaiveDate>,
    #[serde(flatten)]
    request: SweepRequest,
}

/// POST /api/backtest/sweep — validated up front, then run in its own task
///
/// The task outlives a dropped request, and its claim frees the progress
/// tracker whichever way it ends.
async fn api_sweep(State(state): State<AppState>, Json(body): Json<SweepBody>) -> ApiResult {
    let (start, end) = resolve_range(body.start_date, body.end_date)?;
    let plan = prepare_sweep(body.request, &state.config.backtest_config())
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, e.to_string()))?;

    let Some(claim) = state.sweep_progress.claim(plan.configs.len()) else {
        let pct = state.sweep_progress.progress_pct();
        return Err(api_error(
            StatusCode::CONFLICT,
            format!("Sweep already in progress ({:.0}% complete)", pct),
        ));
    };

    let task_state = state.clone();
    let handle = tokio::spawn(async move {
        let data = load_history(&task_state, start, end).await?;
        run_plan(plan, data, claim.progress())
            .await
            .map_err(|e| api_error(StatusCode::BAD_REQUEST, e.to_string()))
    });

    let outcome = handle
        .await
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))??;
    Ok(Json(serde_json::json!({
        "success": true,
        "start_date": start,
        "end_date": end,
        "sweep": outcome,
    })))
}

/// GET /api/backtest/sweep/status
async fn api_sweep_status(State(state): State<AppState>) -> Json<serde_json::Value> {
    let progress = &state.sweep_progress;
    Json(serde_json::json!({
        "running": progress.is_running(),
        "progress_pct": progress.progress_pct(),
        "completed": progress.completed.load(std::sync::atomic::Ordering::Relaxed),
        "total": progress.total_combinations.load(std::sync::atomic::Ordering::Relaxed),
    }))
}

/// POST /api/backtest/sweep/cancel
async fn api_sweep_cancel(State(state): State<AppState>) -> Json<serde_json::Value> {
    state
        .sweep_progress
        .cancelled
        .store(true, std::sync::atomic::Ordering::Relaxed);
    info!("Sweep cancel requested via API");
    Json(serde_json::json!({
        "success": true,
        "message": "Cancel requested"
    }))
}

// ============================================================================
// API Handlers — Live DCA
// ============================================================================

#[derive(Deserialize)]
struct LimitParams {
    limit: Option<i64>,
}

#[derive(Deserialize)]
struct PurchaseParams {
    limit: Option<i64>,
    /// All attempts for one date instead of the most recent ones
    date: Option<NaiveDate>,
}

/// GET /api/dca/purchases?limit=&date=
async fn api_purchases(
    State(state): State<AppState>,
    Query(params): Query<PurchaseParams>,
) -> ApiResult {
    let purchases = match params.date {
        Some(date) => PurchaseRepository::new(state.db.pool())
            .get_by_date(&date.to_string())
            .await
            .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
            .into_iter()
            .map(Purchase::try_from)
            .collect::<Result<Vec<_>, _>>(),
        None => {
            let limit = params
                .limit
                .unwrap_or(DEFAULT_PURCHASE_LIMIT)
                .clamp(1, MAX_PURCHASE_LIMIT);
            state.execution.store().recent(limit).await
        }
    }
    .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok(Json(serde_json::json!({
        "count": purchases.len(),
        "purchases": purchases,
    })))
}

/// GET /api/dca/status
async fn api_dca_status(State(state): State<AppState>) -> ApiResult {
    let config = &state.config;
    let now = Utc::now();

    let last_success = state
        .execution
        .store()
        .last_successful_execution_date()
        .await
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    let balance = match state.exchange.get_balance().await {
        Ok(b) => Some(b),
        Err(e) => {
            warn!("Balance unavailable: {}", e);
            None
        }
    };

    Ok(Json(serde_json::json!({
        "asset": config.asset,
        "quote": config.quote,
        "market_symbol": config.market_symbol,
        "dry_run": config.dry_run,
        "buy_time_utc": config.buy_time.format("%H:%M").to_string(),
        "in_execution_window": engine::scheduler::in_execution_window(now, config.buy_time),
        "last_successful_execution_date": last_success,
        "balance": balance,
        "strategy": config.backtest_config(),
    })))
}

/// POST /api/dca/execute — run today's purchase immediately
async fn api_execute(State(state): State<AppState>) -> ApiResult {
    let today = Utc::now().date_naive();
    info!(date = %today, "Manual purchase requested via API");

    let token = state.shutdown.child_token();
    match state.execution.execute_daily_purchase(today, &token).await {
        Ok(outcome) => Ok(Json(serde_json::json!({
            "success": true,
            "date": today,
            "result": outcome,
        }))),
        Err(e) => {
            error!(date = %today, error = %e, "Manual purchase failed");
            Err(api_error(StatusCode::BAD_GATEWAY, e.to_string()))
        }
    }
}

/// GET /api/dca/events?limit= — outbox entries not yet dispatched
async fn api_pending_events(
    State(state): State<AppState>,
    Query(params): Query<LimitParams>,
) -> ApiResult {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_PURCHASE_LIMIT)
        .clamp(1, MAX_PURCHASE_LIMIT);
    let events = OutboxRepository::new(state.db.pool())
        .get_pending(limit)
        .await
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok(Json(serde_json::json!({
        "count": events.len(),
        "events": events,
    })))
}
