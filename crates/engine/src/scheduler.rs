//! Daily purchase scheduler
//!
//! Polls every five minutes. Inside the ten-minute window that opens at the
//! configured buy time it runs the purchase, retrying transient failures
//! with exponential backoff. Outside the window a tick does nothing.

use async_trait::async_trait;
use chrono::{DateTime, Days, NaiveDate, NaiveTime, Utc};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{classify, DcaError, ErrorClass};
use crate::execution::{DcaExecutionService, ExecutionOutcome};

pub const TICK_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const EXECUTION_WINDOW_MINUTES: i64 = 10;

/// The piece of the live flow the scheduler drives
#[async_trait]
pub trait PurchaseExecutor: Send + Sync {
    async fn execute(
        &self,
        date: NaiveDate,
        token: &CancellationToken,
    ) -> Result<ExecutionOutcome, DcaError>;

    async fn last_successful_execution_date(&self) -> Result<Option<NaiveDate>, DcaError>;
}

#[async_trait]
impl PurchaseExecutor for DcaExecutionService {
    async fn execute(
        &self,
        date: NaiveDate,
        token: &CancellationToken,
    ) -> Result<ExecutionOutcome, DcaError> {
        self.execute_daily_purchase(date, token).await
    }

    async fn last_successful_execution_date(&self) -> Result<Option<NaiveDate>, DcaError> {
        self.store().last_successful_execution_date().await
    }
}

/// Purchase date whose execution window contains `now`, if any.
///
/// A window opening late in the day may run past midnight; it still belongs
/// to the day it opened on.
pub fn execution_date(now: DateTime<Utc>, buy_time: NaiveTime) -> Option<NaiveDate> {
    let today = now.date_naive();
    let window = chrono::Duration::minutes(EXECUTION_WINDOW_MINUTES);

    [Some(today), today.checked_sub_days(Days::new(1))]
        .into_iter()
        .flatten()
        .find(|day| {
            let opens = day.and_time(buy_time).and_utc();
            now >= opens && now < opens + window
        })
}

pub fn in_execution_window(now: DateTime<Utc>, buy_time: NaiveTime) -> bool {
    execution_date(now, buy_time).is_some()
}

/// Exponential backoff with jitter: `base * 2^attempt + rand(0..=max_jitter)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_jitter: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let backoff = self.base_delay * 2u32.saturating_pow(attempt);
        let jitter_ms = self.max_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        backoff + Duration::from_millis(jitter)
    }
}

pub struct DcaScheduler {
    executor: Arc<dyn PurchaseExecutor>,
    buy_time: NaiveTime,
    retry: RetryPolicy,
    tick_interval: Duration,
}

impl DcaScheduler {
    pub fn new(executor: Arc<dyn PurchaseExecutor>, buy_time: NaiveTime) -> Self {
        Self {
            executor,
            buy_time,
            retry: RetryPolicy::default(),
            tick_interval: TICK_INTERVAL,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_tick_interval(mut self, tick_interval: Duration) -> Self {
        self.tick_interval = tick_interval;
        self
    }

    /// Poll until the token is cancelled
    pub async fn run(&self, token: CancellationToken) {
        info!(
            buy_time = %self.buy_time,
            tick_secs = self.tick_interval.as_secs(),
            "DCA scheduler started"
        );

        loop {
            self.tick(Utc::now(), &token).await;

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.tick_interval) => {}
            }
        }

        info!("DCA scheduler stopped");
    }

    /// One poll at `now`; returns the outcome when a purchase was attempted and completed
    pub async fn tick(
        &self,
        now: DateTime<Utc>,
        token: &CancellationToken,
    ) -> Option<ExecutionOutcome> {
        let date = execution_date(now, self.buy_time)?;

        match self.executor.last_successful_execution_date().await {
            Ok(Some(last)) if last >= date => {
                debug!(date = %date, "Already executed for this date");
                return None;
            }
            Ok(_) => {}
            // The execution service re-checks under its lock
            Err(e) => warn!(error = %e, "Could not read last execution date"),
        }

        self.run_with_retry(date, token).await
    }

    async fn run_with_retry(
        &self,
        date: NaiveDate,
        token: &CancellationToken,
    ) -> Option<ExecutionOutcome> {
        let mut attempt = 0u32;

        loop {
            let err = match self.executor.execute(date, token).await {
                Ok(outcome) => {
                    debug!(date = %date, outcome = ?outcome, "Daily purchase finished");
                    return Some(outcome);
                }
                Err(e) => e,
            };

            match classify(&err) {
                ErrorClass::Skip => {
                    info!(date = %date, "Daily purchase interrupted by shutdown");
                    return None;
                }
                ErrorClass::Permanent => {
                    error!(date = %date, error = %err, "Daily purchase failed permanently");
                    return None;
                }
                ErrorClass::Transient if attempt >= self.retry.max_retries => {
                    error!(
                        date = %date,
                        attempts = attempt + 1,
                        error = %err,
                        "Daily purchase failed, giving up for this window"
                    );
                    return None;
                }
                ErrorClass::Transient => {
                    attempt += 1;
                    let delay = self.retry.delay(attempt);
                    warn!(
                        date = %date,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Daily purchase failed, retrying"
                    );

                    tokio::select! {
                        _ = token.cancelled() => return None,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExchangeError;
    use crate::purchase::PurchaseStatus;
    use chrono::TimeZone;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    struct ScriptedExecutor {
        results: Mutex<VecDeque<Result<ExecutionOutcome, DcaError>>>,
        calls: AtomicU32,
        last_success: Option<NaiveDate>,
    }

    impl ScriptedExecutor {
        fn new(results: Vec<Result<ExecutionOutcome, DcaError>>) -> Self {
            Self {
                results: Mutex::new(results.into()),
                calls: AtomicU32::new(0),
                last_success: None,
            }
        }
    }

    #[async_trait]
    impl PurchaseExecutor for ScriptedExecutor {
        async fn execute(
            &self,
            _date: NaiveDate,
            _token: &CancellationToken,
        ) -> Result<ExecutionOutcome, DcaError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(DcaError::Store("script exhausted".into())))
        }

        async fn last_successful_execution_date(&self) -> Result<Option<NaiveDate>, DcaError> {
            Ok(self.last_success)
        }
    }

    fn buy_time() -> NaiveTime {
        NaiveTime::from_hms_opt(0, 5, 0).unwrap()
    }

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, h, m, s).unwrap()
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            max_jitter: Duration::ZERO,
        }
    }

    fn transient() -> Result<ExecutionOutcome, DcaError> {
        Err(DcaError::Exchange(ExchangeError::Transport("reset".into())))
    }

    fn recorded() -> Result<ExecutionOutcome, DcaError> {
        Ok(ExecutionOutcome::Recorded {
            status: PurchaseStatus::Filled,
            purchase_id: 1,
        })
    }

    fn scheduler(executor: Arc<ScriptedExecutor>) -> DcaScheduler {
        DcaScheduler::new(executor, buy_time()).with_retry_policy(fast_retry())
    }

    #[test]
    fn test_execution_window_bounds() {
        assert!(!in_execution_window(at(0, 4, 59), buy_time()));
        assert!(in_execution_window(at(0, 5, 0), buy_time()));
        assert!(in_execution_window(at(0, 14, 59), buy_time()));
        assert!(!in_execution_window(at(0, 15, 0), buy_time()));
        assert!(!in_execution_window(at(12, 0, 0), buy_time()));
    }

    #[test]
    fn test_window_crossing_midnight_keeps_its_date() {
        let late = NaiveTime::from_hms_opt(23, 55, 0).unwrap();
        let date = execution_date(at(0, 2, 0), late).unwrap();
        assert_eq!(date, NaiveDate::from_ymd_opt(2024, 5, 31).unwrap());
    }

    #[test]
    fn test_retry_delay_doubles() {
        let policy = RetryPolicy::default();
        for attempt in 1..=3 {
            let delay = policy.delay(attempt);
            let backoff = Duration::from_secs(1) * 2u32.pow(attempt);
            assert!(delay >= backoff);
            assert!(delay <= backoff + Duration::from_millis(500));
        }
    }

    #[tokio::test]
    async fn test_outside_window_does_nothing() {
        let executor = Arc::new(ScriptedExecutor::new(vec![recorded()]));
        let outcome = scheduler(executor.clone())
            .tick(at(9, 0, 0), &CancellationToken::new())
            .await;
        assert!(outcome.is_none());
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let executor = Arc::new(ScriptedExecutor::new(vec![
            transient(),
            transient(),
            recorded(),
        ]));
        let outcome = scheduler(executor.clone())
            .tick(at(0, 6, 0), &CancellationToken::new())
            .await;
        assert!(matches!(outcome, Some(ExecutionOutcome::Recorded { .. })));
        assert_eq!(executor.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let executor = Arc::new(ScriptedExecutor::new(vec![
            transient(),
            transient(),
            transient(),
            transient(),
            recorded(),
        ]));
        let outcome = scheduler(executor.clone())
            .tick(at(0, 6, 0), &CancellationToken::new())
            .await;
        assert!(outcome.is_none());
        assert_eq!(executor.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let executor = Arc::new(ScriptedExecutor::new(vec![Err(DcaError::Exchange(
            ExchangeError::Http {
                status: 422,
                body: "invalid size".into(),
            },
        ))]));
        let outcome = scheduler(executor.clone())
            .tick(at(0, 6, 0), &CancellationToken::new())
            .await;
        assert!(outcome.is_none());
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_completed_date_is_not_reexecuted() {
        let mut executor = ScriptedExecutor::new(vec![recorded()]);
        executor.last_success = Some(NaiveDate::from_ymd_opt(2024, 6, 1).unwrap());
        let executor = Arc::new(executor);

        let outcome = scheduler(executor.clone())
            .tick(at(0, 6, 0), &CancellationToken::new())
            .await;
        assert!(outcome.is_none());
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_fill_that_fails_to_save_is_bought_once() {
        use crate::execution::tests::{FakeEvents, FakeExchange, FakeHistory, FakeStore};
        use crate::execution::{DcaExecutionService, ExecutionSettings};
        use crate::lock::InMemoryLock;
        use crate::types::BacktestConfig;
        use rust_decimal_macros::dec;
        use std::sync::atomic::AtomicUsize;

        let exchange = Arc::new(FakeExchange::filling());
        let store = Arc::new(FakeStore {
            failing_saves: AtomicUsize::new(1),
            ..Default::default()
        });
        let service = Arc::new(DcaExecutionService::new(
            exchange.clone(),
            Arc::new(FakeHistory {
                high: dec!(100000),
                ma: dec!(90000),
                fail: false,
            }),
            Arc::new(InMemoryLock::new()),
            store.clone(),
            Arc::new(FakeEvents::default()),
            ExecutionSettings::from_backtest_config(
                "BTC",
                "BTCUSDT",
                &BacktestConfig::default(),
                false,
            ),
        ));

        let outcome = DcaScheduler::new(service, buy_time())
            .with_retry_policy(fast_retry())
            .tick(at(0, 6, 0), &CancellationToken::new())
            .await;

        assert!(outcome.is_none());
        assert_eq!(exchange.order_count(), 1);
        assert!(store.purchases.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let executor = Arc::new(ScriptedExecutor::new(Vec::new()));
        let scheduler = Arc::new(scheduler(executor));
        let token = CancellationToken::new();

        let handle = {
            let scheduler = scheduler.clone();
            let token = token.clone();
            tokio::spawn(async move { scheduler.run(token).await })
        };
        token.cancel();

        let joined = tokio::time::timeout(Duration::from_secs(5), handle).await;
        assert!(joined.is_ok());
    }
}
