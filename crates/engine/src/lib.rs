//! Smart DCA engine: dip-weighted daily accumulation
//!
//! Provides:
//! - Multiplier calculator (drop tiers + bear-market boost, capped)
//! - Backtest engine comparing smart DCA with two fixed-amount baselines
//! - Walk-forward validation and parallel parameter sweeps
//! - Live daily purchase service, scheduler and their collaborators
//! - Binance public API client and a paper-trading exchange

pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod execution;
pub mod lock;
pub mod multiplier;
pub mod price_history;
pub mod purchase;
pub mod scheduler;
pub mod store;
pub mod sweep;
pub mod types;
pub mod walk_forward;

// Re-exports for convenience
pub use api::{BinanceClient, PaperExchange};
pub use config::DcaConfig;
pub use engine::BacktestEngine;
pub use error::{classify, BacktestError, DcaError, ErrorClass, ExchangeError};
pub use execution::{
    DcaExecutionService, EventPublisher, ExchangeClient, ExecutionOutcome, ExecutionSettings,
    PriceHistory, PurchaseStore,
};
pub use lock::{DistributedLock, InMemoryLock, LockLease};
pub use price_history::{CandlePriceHistory, CandleSource};
pub use purchase::{DomainEvent, Purchase, PurchaseStatus};
pub use scheduler::{DcaScheduler, PurchaseExecutor, RetryPolicy};
pub use store::{OutboxEventPublisher, SqliteLock, SqlitePurchaseStore};
pub use sweep::{
    prepare_sweep, run_plan, run_sweep, RankBy, SweepClaim, SweepOutcome, SweepPlan, SweepPreset,
    SweepProgress, SweepRequest,
};
pub use types::*;
pub use walk_forward::{WalkForwardEntry, WalkForwardSummary};
