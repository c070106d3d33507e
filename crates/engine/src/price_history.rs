//! Reference levels for the live multiplier, derived from daily candles

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::ExchangeError;
use crate::execution::PriceHistory;
use crate::types::DailyPriceData;

/// Anything that can serve recent daily candles
#[async_trait]
pub trait CandleSource: Send + Sync {
    /// Candles from `days` days ago through today, oldest first
    async fn recent_daily_candles(
        &self,
        symbol: &str,
        days: usize,
    ) -> Result<Vec<DailyPriceData>, ExchangeError>;
}

struct CachedCloses {
    day: NaiveDate,
    /// Widest window fetched for `day`
    span: usize,
    closes: Vec<Decimal>,
}

/// N-day high and M-day SMA of completed daily closes.
///
/// Today's candle is still open and is ignored. Fetches are cached per
/// symbol until the UTC date changes.
pub struct CandlePriceHistory {
    source: Arc<dyn CandleSource>,
    cache: Mutex<HashMap<String, CachedCloses>>,
}

impl CandlePriceHistory {
    pub fn new(source: Arc<dyn CandleSource>) -> Self {
        Self {
            source,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// The last `days` completed closes (fewer if history is short)
    async fn closes(&self, symbol: &str, days: usize) -> Result<Vec<Decimal>, ExchangeError> {
        let today = Utc::now().date_naive();
        let mut cache = self.cache.lock().await;

        let fresh = cache
            .get(symbol)
            .is_some_and(|c| c.day == today && c.span >= days);

        if !fresh {
            let candles = self.source.recent_daily_candles(symbol, days + 1).await?;
            let closes: Vec<Decimal> = candles
                .iter()
                .filter(|c| c.date < today)
                .map(|c| c.close)
                .collect();
            debug!(symbol, days, fetched = closes.len(), "Refreshed daily closes");
            cache.insert(
                symbol.to_string(),
                CachedCloses {
                    day: today,
                    span: days,
                    closes,
                },
            );
        }

        let closes = cache
            .get(symbol)
            .map(|c| {
                let skip = c.closes.len().saturating_sub(days);
                c.closes[skip..].to_vec()
            })
            .unwrap_or_default();
        Ok(closes)
    }
}

#[async_trait]
impl PriceHistory for CandlePriceHistory {
    async fn high(&self, symbol: &str, days: usize) -> Result<Decimal, ExchangeError> {
        let closes = self.closes(symbol, days).await?;
        Ok(closes.into_iter().max().unwrap_or(Decimal::ZERO))
    }

    async fn sma(&self, symbol: &str, period: usize) -> Result<Decimal, ExchangeError> {
        if period == 0 {
            return Ok(Decimal::ZERO);
        }
        let closes = self.closes(symbol, period).await?;
        if closes.len() < period {
            return Ok(Decimal::ZERO);
        }
        let sum: Decimal = closes.iter().sum();
        Ok(sum / Decimal::from(period))
    }
}
