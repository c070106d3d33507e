//! Live daily purchase: lock, guard, size, order, persist.
//!
//! Collaborators (exchange, price history, store, event publisher, lock) are
//! traits so the same flow runs against the paper exchange, SQLite and test fakes.

use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{DcaError, ExchangeError};
use crate::lock::DistributedLock;
use crate::multiplier;
use crate::purchase::{DomainEvent, Purchase, PurchaseStatus};
use crate::types::{BacktestConfig, MultiplierResult, MultiplierTier};

pub const LOCK_TTL: Duration = Duration::from_secs(5 * 60);
/// Below this balance there is nothing worth doing
pub const MIN_BALANCE: Decimal = dec!(1.0);
pub const MIN_ORDER_VALUE: Decimal = dec!(10.0);
/// IOC limit price sits this far above mid
pub const SLIPPAGE: Decimal = dec!(0.05);

pub const SKIP_ALREADY_PURCHASED: &str = "Already purchased today";
pub const SKIP_INSUFFICIENT_BALANCE: &str = "Insufficient balance";

// ============================================================================
// Collaborators
// ============================================================================

/// A tradable spot asset from exchange metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpotAsset {
    pub name: String,
    pub index: u32,
    /// Lot precision: quantities are truncated to this many decimals
    pub sz_decimals: u32,
}

/// Immediate-or-cancel limit order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpotOrder {
    pub asset_index: u32,
    pub is_buy: bool,
    pub size: Decimal,
    pub limit_price: Decimal,
}

/// Per-order status reported by the exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Filled {
        total_sz: Decimal,
        avg_px: Decimal,
        oid: Option<u64>,
    },
    Resting {
        oid: Option<u64>,
    },
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderResponse {
    pub statuses: Vec<OrderStatus>,
    /// Response body as received, for audit
    pub raw: String,
}

#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Available quote balance
    async fn get_balance(&self) -> Result<Decimal, ExchangeError>;
    async fn get_spot_price(&self, symbol: &str) -> Result<Decimal, ExchangeError>;
    async fn get_spot_metadata(&self) -> Result<Vec<SpotAsset>, ExchangeError>;
    async fn place_spot_order(&self, order: &SpotOrder) -> Result<OrderResponse, ExchangeError>;
}

/// Reference levels for the multiplier; `0` means not enough history
#[async_trait]
pub trait PriceHistory: Send + Sync {
    async fn high(&self, symbol: &str, days: usize) -> Result<Decimal, ExchangeError>;
    async fn sma(&self, symbol: &str, period: usize) -> Result<Decimal, ExchangeError>;
}

/// Fire-and-forget notifications that are not tied to a purchase row
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish_direct(&self, event: &DomainEvent) -> Result<(), DcaError>;
}

#[async_trait]
pub trait PurchaseStore: Send + Sync {
    /// Filled/partially filled live purchase for the date
    async fn find_successful_for_date(&self, date: NaiveDate)
        -> Result<Option<Purchase>, DcaError>;

    /// Persist the purchase and enqueue its domain event atomically; returns the id
    async fn save(&self, purchase: &Purchase) -> Result<i64, DcaError>;

    async fn recent(&self, limit: i64) -> Result<Vec<Purchase>, DcaError>;

    async fn last_successful_execution_date(&self) -> Result<Option<NaiveDate>, DcaError>;
}

// ============================================================================
// Service
// ============================================================================

/// What to buy and how to size it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSettings {
    /// Spot asset name in exchange metadata
    pub asset: String,
    /// Symbol for price and history lookups
    pub market_symbol: String,
    pub base_daily_amount: Decimal,
    pub high_lookback_days: usize,
    pub bear_market_ma_period: usize,
    pub bear_boost_factor: Decimal,
    pub max_multiplier_cap: Decimal,
    pub tiers: Vec<MultiplierTier>,
    pub dry_run: bool,
}

impl ExecutionSettings {
    pub fn from_backtest_config(
        asset: impl Into<String>,
        market_symbol: impl Into<String>,
        config: &BacktestConfig,
        dry_run: bool,
    ) -> Self {
        Self {
            asset: asset.into(),
            market_symbol: market_symbol.into(),
            base_daily_amount: config.base_daily_amount,
            high_lookback_days: config.high_lookback_days,
            bear_market_ma_period: config.bear_market_ma_period,
            bear_boost_factor: config.bear_boost_factor,
            max_multiplier_cap: config.max_multiplier_cap,
            tiers: config.tiers.clone(),
            dry_run,
        }
    }
}

/// Result of one invocation that did not error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    /// Another attempt holds the lock for this date
    LockUnavailable,
    Skipped { reason: String },
    Recorded {
        status: PurchaseStatus,
        purchase_id: i64,
    },
}

pub struct DcaExecutionService {
    exchange: Arc<dyn ExchangeClient>,
    history: Arc<dyn PriceHistory>,
    lock: Arc<dyn DistributedLock>,
    store: Arc<dyn PurchaseStore>,
    events: Arc<dyn EventPublisher>,
    settings: ExecutionSettings,
}

fn ensure_active(token: &CancellationToken) -> Result<(), DcaError> {
    if token.is_cancelled() {
        Err(DcaError::Cancelled)
    } else {
        Ok(())
    }
}

/// `price * (1 + SLIPPAGE)`, rounded to cents
pub fn limit_price(price: Decimal) -> Decimal {
    (price * (Decimal::ONE + SLIPPAGE)).round_dp(2)
}

/// `usd / price` truncated toward zero to `sz_decimals`
pub fn order_quantity(usd: Decimal, price: Decimal, sz_decimals: u32) -> Decimal {
    if price <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    (usd / price).round_dp_with_strategy(sz_decimals, RoundingStrategy::ToZero)
}

impl DcaExecutionService {
    pub fn new(
        exchange: Arc<dyn ExchangeClient>,
        history: Arc<dyn PriceHistory>,
        lock: Arc<dyn DistributedLock>,
        store: Arc<dyn PurchaseStore>,
        events: Arc<dyn EventPublisher>,
        settings: ExecutionSettings,
    ) -> Self {
        Self {
            exchange,
            history,
            lock,
            store,
            events,
            settings,
        }
    }

    pub fn settings(&self) -> &ExecutionSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<dyn PurchaseStore> {
        &self.store
    }

    /// Run the purchase for `date` under the per-date lock.
    ///
    /// Skips return `Ok`. Errors are left for the caller to classify; an
    /// exchange failure during order placement is persisted as `Failed` first.
    pub async fn execute_daily_purchase(
        &self,
        date: NaiveDate,
        token: &CancellationToken,
    ) -> Result<ExecutionOutcome, DcaError> {
        ensure_active(token)?;

        let key = format!("dca-purchase-{date}");
        let Some(lease) = self.lock.acquire(&key, LOCK_TTL).await? else {
            info!(date = %date, "Purchase lock held elsewhere, skipping");
            return Ok(ExecutionOutcome::LockUnavailable);
        };

        let outcome = self.execute_locked(date, token).await;

        if let Err(e) = self.lock.release(&lease).await {
            warn!(date = %date, error = %e, "Failed to release purchase lock");
        }
        outcome
    }

    async fn execute_locked(
        &self,
        date: NaiveDate,
        token: &CancellationToken,
    ) -> Result<ExecutionOutcome, DcaError> {
        let settings = &self.settings;

        if !settings.dry_run {
            if let Some(existing) = self.store.find_successful_for_date(date).await? {
                debug!(date = %date, id = ?existing.id, "Found existing purchase");
                return self.skip(date, SKIP_ALREADY_PURCHASED).await;
            }
        }

        ensure_active(token)?;
        let balance = self.exchange.get_balance().await?;
        if balance < MIN_BALANCE {
            return self.skip(date, SKIP_INSUFFICIENT_BALANCE).await;
        }

        ensure_active(token)?;
        let price = self.exchange.get_spot_price(&settings.market_symbol).await?;
        let multiplier = self.compute_multiplier(price).await;

        let usd_amount = balance.min(multiplier.final_amount);
        if usd_amount < MIN_ORDER_VALUE {
            let reason = format!(
                "Amount {} below minimum order value {}",
                usd_amount.round_dp(2),
                MIN_ORDER_VALUE
            );
            return self.skip(date, &reason).await;
        }

        ensure_active(token)?;
        let metadata = self.exchange.get_spot_metadata().await?;
        let asset = metadata
            .iter()
            .find(|a| a.name == settings.asset)
            .ok_or_else(|| ExchangeError::AssetNotListed(settings.asset.clone()))?;

        let quantity = order_quantity(usd_amount, price, asset.sz_decimals);
        if quantity <= Decimal::ZERO {
            let reason = format!("Quantity for {usd_amount} rounds to zero");
            return self.skip(date, &reason).await;
        }

        let mut purchase = Purchase::new(date, &settings.asset, price, &multiplier, settings.dry_run);

        if settings.dry_run {
            purchase.mark_filled(quantity, price, quantity, None);
            let id = self.store.save(&purchase).await?;
            info!(
                date = %date,
                usd = %usd_amount,
                quantity = %quantity,
                multiplier = %multiplier.multiplier,
                tier = %multiplier.tier_label,
                "[DRY RUN] Simulated purchase"
            );
            return Ok(ExecutionOutcome::Recorded {
                status: purchase.status,
                purchase_id: id,
            });
        }

        let order = SpotOrder {
            asset_index: asset.index,
            is_buy: true,
            size: quantity,
            limit_price: limit_price(price),
        };

        ensure_active(token)?;
        let response = match self.exchange.place_spot_order(&order).await {
            Ok(response) => response,
            Err(e) => {
                error!(date = %date, error = %e, "Order placement failed");
                purchase.mark_failed(e.to_string());
                self.store.save(&purchase).await?;
                return Err(e.into());
            }
        };

        match response.statuses.first() {
            Some(OrderStatus::Filled {
                total_sz,
                avg_px,
                oid,
            }) => {
                purchase.mark_filled(*total_sz, *avg_px, quantity, oid.map(|o| o.to_string()));
                info!(
                    date = %date,
                    quantity = %total_sz,
                    avg_price = %avg_px,
                    cost = %purchase.cost,
                    multiplier = %multiplier.multiplier,
                    tier = %multiplier.tier_label,
                    status = %purchase.status,
                    "Purchase filled"
                );
            }
            Some(OrderStatus::Resting { oid }) => {
                warn!(date = %date, oid = ?oid, "IOC order is resting on the book");
                purchase.mark_resting(oid.map(|o| o.to_string()));
            }
            Some(OrderStatus::Error(msg)) => {
                error!(date = %date, error = %msg, "Order rejected");
                purchase.mark_failed(msg.clone());
            }
            None => {
                error!(date = %date, "Order response carried no status");
                purchase.mark_failed("no fill or resting status in response");
            }
        }

        let raw = response.raw;
        let purchase = purchase.with_raw_response(Some(raw.clone()));
        // The order is on the exchange now; a retry would buy again
        let id = match self.store.save(&purchase).await {
            Ok(id) => id,
            Err(e) => {
                error!(
                    date = %date,
                    order_id = ?purchase.order_id,
                    status = %purchase.status,
                    raw = %raw,
                    error = %e,
                    "Order executed but could not be persisted"
                );
                return Err(DcaError::PostOrderPersist {
                    order_id: purchase.order_id.clone(),
                    reason: e.to_string(),
                });
            }
        };

        Ok(ExecutionOutcome::Recorded {
            status: purchase.status,
            purchase_id: id,
        })
    }

    /// Multiplier for `price`, or the plain base amount if reference data is unavailable
    async fn compute_multiplier(&self, price: Decimal) -> MultiplierResult {
        let settings = &self.settings;
        let symbol = settings.market_symbol.as_str();

        let reference = async {
            let high = self.history.high(symbol, settings.high_lookback_days).await?;
            let ma = self.history.sma(symbol, settings.bear_market_ma_period).await?;
            Ok::<_, ExchangeError>((high, ma))
        }
        .await;

        match reference {
            Ok((high, ma)) => multiplier::calculate(
                price,
                settings.base_daily_amount,
                high,
                ma,
                &settings.tiers,
                settings.bear_boost_factor,
                settings.max_multiplier_cap,
            ),
            Err(e) => {
                warn!(error = %e, "Price history unavailable, using base amount");
                multiplier::base_result(settings.base_daily_amount, Decimal::ZERO, Decimal::ZERO)
            }
        }
    }

    async fn skip(&self, date: NaiveDate, reason: &str) -> Result<ExecutionOutcome, DcaError> {
        info!(date = %date, reason, "Purchase skipped");
        let event = DomainEvent::PurchaseSkipped {
            date,
            reason: reason.to_string(),
        };
        if let Err(e) = self.events.publish_direct(&event).await {
            warn!(date = %date, error = %e, "Failed to publish skip event");
        }
        Ok(ExecutionOutcome::Skipped {
            reason: reason.to_string(),
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::{classify, ErrorClass};
    use crate::lock::InMemoryLock;
    use crate::types::default_tiers;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    pub(crate) struct FakeExchange {
        pub balance: Decimal,
        pub price: Decimal,
        pub assets: Vec<SpotAsset>,
        /// `None` makes order placement fail with a 503
        pub response: Option<Vec<OrderStatus>>,
        pub fill_ratio: Decimal,
        pub orders: Mutex<Vec<SpotOrder>>,
    }

    impl FakeExchange {
        pub fn filling() -> Self {
            Self {
                balance: dec!(1000),
                price: dec!(85000),
                assets: vec![SpotAsset {
                    name: "BTC".into(),
                    index: 10_000,
                    sz_decimals: 5,
                }],
                response: Some(Vec::new()),
                fill_ratio: Decimal::ONE,
                orders: Mutex::new(Vec::new()),
            }
        }

        pub fn order_count(&self) -> usize {
            self.orders.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ExchangeClient for FakeExchange {
        async fn get_balance(&self) -> Result<Decimal, ExchangeError> {
            Ok(self.balance)
        }

        async fn get_spot_price(&self, _symbol: &str) -> Result<Decimal, ExchangeError> {
            Ok(self.price)
        }

        async fn get_spot_metadata(&self) -> Result<Vec<SpotAsset>, ExchangeError> {
            Ok(self.assets.clone())
        }

        async fn place_spot_order(
            &self,
            order: &SpotOrder,
        ) -> Result<OrderResponse, ExchangeError> {
            self.orders.lock().unwrap().push(order.clone());
            // Widen the window for concurrent callers
            tokio::time::sleep(Duration::from_millis(20)).await;
            match &self.response {
                None => Err(ExchangeError::Http {
                    status: 503,
                    body: "unavailable".into(),
                }),
                Some(statuses) if statuses.is_empty() => Ok(OrderResponse {
                    statuses: vec![OrderStatus::Filled {
                        total_sz: order.size * self.fill_ratio,
                        avg_px: self.price,
                        oid: Some(1),
                    }],
                    raw: r#"{"status":"ok"}"#.into(),
                }),
                Some(statuses) => Ok(OrderResponse {
                    statuses: statuses.clone(),
                    raw: r#"{"status":"ok"}"#.into(),
                }),
            }
        }
    }

    pub(crate) struct FakeHistory {
        pub high: Decimal,
        pub ma: Decimal,
        pub fail: bool,
    }

    #[async_trait]
    impl PriceHistory for FakeHistory {
        async fn high(&self, _symbol: &str, _days: usize) -> Result<Decimal, ExchangeError> {
            if self.fail {
                return Err(ExchangeError::Transport("candles unavailable".into()));
            }
            Ok(self.high)
        }

        async fn sma(&self, _symbol: &str, _period: usize) -> Result<Decimal, ExchangeError> {
            Ok(self.ma)
        }
    }

    #[derive(Default)]
    pub(crate) struct FakeStore {
        pub purchases: Mutex<Vec<Purchase>>,
        /// Number of upcoming `save` calls that fail
        pub failing_saves: AtomicUsize,
    }

    #[async_trait]
    impl PurchaseStore for FakeStore {
        async fn find_successful_for_date(
            &self,
            date: NaiveDate,
        ) -> Result<Option<Purchase>, DcaError> {
            Ok(self
                .purchases
                .lock()
                .unwrap()
                .iter()
                .find(|p| p.purchase_date == date && p.status.is_success() && !p.is_dry_run)
                .cloned())
        }

        async fn save(&self, purchase: &Purchase) -> Result<i64, DcaError> {
            let failing = self
                .failing_saves
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
            if failing.is_ok() {
                return Err(DcaError::Store("database is locked".into()));
            }
            let mut purchases = self.purchases.lock().unwrap();
            let mut saved = purchase.clone();
            saved.id = Some(purchases.len() as i64 + 1);
            purchases.push(saved);
            Ok(purchases.len() as i64)
        }

        async fn recent(&self, limit: i64) -> Result<Vec<Purchase>, DcaError> {
            let purchases = self.purchases.lock().unwrap();
            Ok(purchases.iter().rev().take(limit as usize).cloned().collect())
        }

        async fn last_successful_execution_date(&self) -> Result<Option<NaiveDate>, DcaError> {
            Ok(self
                .purchases
                .lock()
                .unwrap()
                .iter()
                .filter(|p| p.status.is_success() && !p.is_dry_run)
                .map(|p| p.purchase_date)
                .max())
        }
    }

    #[derive(Default)]
    pub(crate) struct FakeEvents {
        pub events: Mutex<Vec<DomainEvent>>,
    }

    #[async_trait]
    impl EventPublisher for FakeEvents {
        async fn publish_direct(&self, event: &DomainEvent) -> Result<(), DcaError> {
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    struct Harness {
        service: Arc<DcaExecutionService>,
        exchange: Arc<FakeExchange>,
        store: Arc<FakeStore>,
        events: Arc<FakeEvents>,
    }

    fn settings(dry_run: bool) -> ExecutionSettings {
        ExecutionSettings {
            asset: "BTC".into(),
            market_symbol: "BTCUSDT".into(),
            base_daily_amount: dec!(10),
            high_lookback_days: 30,
            bear_market_ma_period: 200,
            bear_boost_factor: dec!(1.5),
            max_multiplier_cap: dec!(4.5),
            tiers: default_tiers(),
            dry_run,
        }
    }

    fn harness(exchange: FakeExchange, history: FakeHistory, dry_run: bool) -> Harness {
        let exchange = Arc::new(exchange);
        let store = Arc::new(FakeStore::default());
        let events = Arc::new(FakeEvents::default());
        let service = Arc::new(DcaExecutionService::new(
            exchange.clone(),
            Arc::new(history),
            Arc::new(InMemoryLock::new()),
            store.clone(),
            events.clone(),
            settings(dry_run),
        ));
        Harness {
            service,
            exchange,
            store,
            events,
        }
    }

    fn dip_history() -> FakeHistory {
        FakeHistory {
            high: dec!(100000),
            ma: dec!(90000),
            fail: false,
        }
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 1).unwrap()
    }

    #[test]
    fn test_sizing_helpers() {
        assert_eq!(limit_price(dec!(85000)), dec!(89250.00));
        assert_eq!(limit_price(dec!(0.333)), dec!(0.35));
        assert_eq!(order_quantity(dec!(35), dec!(85000), 5), dec!(0.00041));
        assert_eq!(order_quantity(dec!(35), Decimal::ZERO, 5), Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_live_purchase_is_sized_and_filled() {
        let h = harness(FakeExchange::filling(), dip_history(), false);
        let outcome = h
            .service
            .execute_daily_purchase(day(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            ExecutionOutcome::Recorded {
                status: PurchaseStatus::Filled,
                ..
            }
        ));

        let orders = h.exchange.orders.lock().unwrap().clone();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].asset_index, 10_000);
        assert_eq!(orders[0].size, dec!(0.00041));
        assert_eq!(orders[0].limit_price, dec!(89250.00));

        let purchases = h.store.purchases.lock().unwrap();
        assert_eq!(purchases[0].multiplier, dec!(3.5));
        assert_eq!(purchases[0].tier, ">= 10%");
        assert!(purchases[0].raw_response.is_some());
    }

    #[tokio::test]
    async fn test_concurrent_calls_buy_once() {
        let h = harness(FakeExchange::filling(), dip_history(), false);
        let token = CancellationToken::new();

        let (a, b) = tokio::join!(
            h.service.execute_daily_purchase(day(), &token),
            h.service.execute_daily_purchase(day(), &token)
        );
        a.unwrap();
        b.unwrap();

        // A third call after both finished hits the idempotency check
        let third = h.service.execute_daily_purchase(day(), &token).await.unwrap();
        assert_eq!(
            third,
            ExecutionOutcome::Skipped {
                reason: SKIP_ALREADY_PURCHASED.into()
            }
        );

        let filled = h
            .store
            .purchases
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.status.is_success())
            .count();
        assert_eq!(filled, 1);
        assert_eq!(h.exchange.order_count(), 1);
    }

    #[tokio::test]
    async fn test_insufficient_balance_skips_with_event() {
        let mut exchange = FakeExchange::filling();
        exchange.balance = dec!(0.5);
        let h = harness(exchange, dip_history(), false);

        let outcome = h
            .service
            .execute_daily_purchase(day(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ExecutionOutcome::Skipped {
                reason: SKIP_INSUFFICIENT_BALANCE.into()
            }
        );
        assert_eq!(h.exchange.order_count(), 0);
        assert_eq!(h.events.events.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_amount_below_minimum_skips() {
        // Balance caps the $35 order at $5
        let mut exchange = FakeExchange::filling();
        exchange.balance = dec!(5);
        let h = harness(exchange, dip_history(), false);

        let outcome = h
            .service
            .execute_daily_purchase(day(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(outcome, ExecutionOutcome::Skipped { .. }));
        assert_eq!(h.exchange.order_count(), 0);
        assert!(h.store.purchases.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_history_failure_falls_back_to_base() {
        let history = FakeHistory {
            high: dec!(100000),
            ma: dec!(90000),
            fail: true,
        };
        let h = harness(FakeExchange::filling(), history, false);
        h.service
            .execute_daily_purchase(day(), &CancellationToken::new())
            .await
            .unwrap();

        let purchases = h.store.purchases.lock().unwrap();
        assert_eq!(purchases[0].multiplier, Decimal::ONE);
        assert_eq!(purchases[0].tier, "Base");
        // $10 / 85000 truncated to 5 decimals
        assert_eq!(purchases[0].quantity, dec!(0.00011));
    }

    #[tokio::test]
    async fn test_dry_run_records_without_ordering() {
        let h = harness(FakeExchange::filling(), dip_history(), true);
        let token = CancellationToken::new();

        for _ in 0..2 {
            let outcome = h.service.execute_daily_purchase(day(), &token).await.unwrap();
            assert!(matches!(outcome, ExecutionOutcome::Recorded { .. }));
        }

        assert_eq!(h.exchange.order_count(), 0);
        let purchases = h.store.purchases.lock().unwrap();
        assert_eq!(purchases.len(), 2);
        assert!(purchases.iter().all(|p| p.is_dry_run));
    }

    #[tokio::test]
    async fn test_partial_fill_is_recorded() {
        let mut exchange = FakeExchange::filling();
        exchange.fill_ratio = dec!(0.5);
        let h = harness(exchange, dip_history(), false);

        let outcome = h
            .service
            .execute_daily_purchase(day(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            ExecutionOutcome::Recorded {
                status: PurchaseStatus::PartiallyFilled,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_resting_order_is_recorded() {
        let mut exchange = FakeExchange::filling();
        exchange.response = Some(vec![OrderStatus::Resting { oid: Some(77) }]);
        let h = harness(exchange, dip_history(), false);

        let outcome = h
            .service
            .execute_daily_purchase(day(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            ExecutionOutcome::Recorded {
                status: PurchaseStatus::Resting,
                ..
            }
        ));
        let purchases = h.store.purchases.lock().unwrap();
        assert_eq!(purchases[0].order_id.as_deref(), Some("77"));
    }

    #[tokio::test]
    async fn test_exchange_failure_is_persisted_and_returned() {
        let mut exchange = FakeExchange::filling();
        exchange.response = None;
        let h = harness(exchange, dip_history(), false);

        let err = h
            .service
            .execute_daily_purchase(day(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DcaError::Exchange(ExchangeError::Http { status: 503, .. })));

        let purchases = h.store.purchases.lock().unwrap();
        assert_eq!(purchases.len(), 1);
        assert_eq!(purchases[0].status, PurchaseStatus::Failed);
        assert!(purchases[0].failure_reason.is_some());
    }

    #[tokio::test]
    async fn test_unsaved_fill_is_not_retried() {
        let h = harness(FakeExchange::filling(), dip_history(), false);
        h.store.failing_saves.store(1, Ordering::SeqCst);

        let err = h
            .service
            .execute_daily_purchase(day(), &CancellationToken::new())
            .await
            .unwrap_err();
        match &err {
            DcaError::PostOrderPersist { order_id, .. } => {
                assert_eq!(order_id.as_deref(), Some("1"))
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(classify(&err), ErrorClass::Permanent);
        assert_eq!(h.exchange.order_count(), 1);
    }

    #[tokio::test]
    async fn test_unlisted_asset_is_an_error() {
        let mut exchange = FakeExchange::filling();
        exchange.assets.clear();
        let h = harness(exchange, dip_history(), false);

        let err = h
            .service
            .execute_daily_purchase(day(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DcaError::Exchange(ExchangeError::AssetNotListed(_))));
    }

    #[tokio::test]
    async fn test_cancelled_token_stops_before_network() {
        let h = harness(FakeExchange::filling(), dip_history(), false);
        let token = CancellationToken::new();
        token.cancel();

        let err = h
            .service
            .execute_daily_purchase(day(), &token)
            .await
            .unwrap_err();
        assert!(matches!(err, DcaError::Cancelled));
        assert_eq!(h.exchange.order_count(), 0);
    }
}
