//! Binance public API client for market data (no authentication required)

use async_trait::async_trait;
use chrono::{Days, NaiveDate, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;
use tracing::{debug, info};

use crate::error::ExchangeError;
use crate::price_history::CandleSource;
use crate::types::{DailyPriceData, Kline};

const DEFAULT_BASE_URL: &str = "https://api.binance.com";
const MAX_KLINES_PER_REQUEST: u32 = 1000;
const DAILY_INTERVAL: &str = "1d";

/// Binance public market data client
#[derive(Clone)]
pub struct BinanceClient {
    client: Client,
    base_url: String,
}

/// Raw kline data from Binance API (array of arrays)
#[derive(Debug, Deserialize)]
#[allow(dead_code)]
struct RawKline(
    i64,    // 0: Open time
    String, // 1: Open
    String, // 2: High
    String, // 3: Low
    String, // 4: Close
    String, // 5: Volume
    i64,    // 6: Close time
    String, // 7: Quote asset volume
    u64,    // 8: Number of trades
    String, // 9: Taker buy base
    String, // 10: Taker buy quote
    String, // 11: Ignore
);

/// Binance ticker price response
#[derive(Debug, Deserialize)]
#[allow(dead_code)]
struct TickerPrice {
    symbol: String,
    price: String,
}

impl Default for BinanceClient {
    fn default() -> Self {
        Self::new()
    }
}

impl BinanceClient {
    /// Create a new Binance client with default base URL
    pub fn new() -> Self {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    async fn get_checked(&self, url: &str) -> Result<reqwest::Response, ExchangeError> {
        let response = self.client.get(url).send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ExchangeError::Http { status, body });
        }
        Ok(response)
    }

    /// Fetch klines (candlestick data) for a symbol
    pub async fn get_klines(
        &self,
        symbol: &str,
        interval: &str,
        start_time: Option<i64>,
        end_time: Option<i64>,
        limit: Option<u32>,
    ) -> Result<Vec<Kline>, ExchangeError> {
        let mut url = format!(
            "{}/api/v3/klines?symbol={}&interval={}",
            self.base_url, symbol, interval
        );

        if let Some(start) = start_time {
            url.push_str(&format!("&startTime={}", start));
        }
        if let Some(end) = end_time {
            url.push_str(&format!("&endTime={}", end));
        }

        let limit = limit.unwrap_or(500).min(MAX_KLINES_PER_REQUEST);
        url.push_str(&format!("&limit={}", limit));

        debug!(symbol, interval, "Fetching klines from Binance");

        let raw_klines: Vec<RawKline> = self.get_checked(&url).await?.json().await?;

        let klines: Vec<Kline> = raw_klines
            .into_iter()
            .filter_map(|raw| {
                Some(Kline {
                    open_time: raw.0,
                    open: Decimal::from_str(&raw.1).ok()?,
                    high: Decimal::from_str(&raw.2).ok()?,
                    low: Decimal::from_str(&raw.3).ok()?,
                    close: Decimal::from_str(&raw.4).ok()?,
                    volume: Decimal::from_str(&raw.5).ok()?,
                    close_time: raw.6,
                })
            })
            .collect();

        debug!(count = klines.len(), "Fetched klines");
        Ok(klines)
    }

    /// Fetch klines with automatic pagination for ranges > 1000 bars
    pub async fn get_klines_paginated(
        &self,
        symbol: &str,
        interval: &str,
        start_time: i64,
        end_time: i64,
    ) -> Result<Vec<Kline>, ExchangeError> {
        let mut all_klines = Vec::new();
        let mut current_start = start_time;

        loop {
            if current_start >= end_time {
                break;
            }

            let klines = self
                .get_klines(
                    symbol,
                    interval,
                    Some(current_start),
                    Some(end_time),
                    Some(MAX_KLINES_PER_REQUEST),
                )
                .await?;

            if klines.is_empty() {
                break;
            }

            let last_close_time = klines.last().map(|k| k.close_time).unwrap_or(end_time);
            all_klines.extend(klines);

            // Move start to after the last candle
            current_start = last_close_time + 1;

            // Small delay to respect rate limits
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }

        Ok(all_klines)
    }

    /// Daily candles for `start..=end` (UTC), one entry per date, oldest first
    pub async fn get_daily_prices(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DailyPriceData>, ExchangeError> {
        if end < start {
            return Ok(Vec::new());
        }

        let start_ms = start.and_hms_opt(0, 0, 0).map(|t| t.and_utc().timestamp_millis());
        let end_ms = end.and_hms_opt(23, 59, 59).map(|t| t.and_utc().timestamp_millis());
        let (Some(start_ms), Some(end_ms)) = (start_ms, end_ms) else {
            return Ok(Vec::new());
        };

        info!(symbol, %start, %end, "Fetching daily prices from Binance");
        let klines = self
            .get_klines_paginated(symbol, DAILY_INTERVAL, start_ms, end_ms)
            .await?;

        let mut days: Vec<DailyPriceData> =
            klines.iter().filter_map(DailyPriceData::from_kline).collect();
        days.sort_by_key(|d| d.date);
        days.dedup_by_key(|d| d.date);

        info!(days = days.len(), "Daily price fetch complete");
        Ok(days)
    }

    /// Get current price for a symbol
    pub async fn get_price(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        let url = format!("{}/api/v3/ticker/price?symbol={}", self.base_url, symbol);

        let ticker: TickerPrice = self.get_checked(&url).await?.json().await?;
        Decimal::from_str(&ticker.price).map_err(|e| {
            ExchangeError::Transport(format!("invalid price '{}': {}", ticker.price, e))
        })
    }
}

#[async_trait]
impl CandleSource for BinanceClient {
    async fn recent_daily_candles(
        &self,
        symbol: &str,
        days: usize,
    ) -> Result<Vec<DailyPriceData>, ExchangeError> {
        let today = Utc::now().date_naive();
        let start = today
            .checked_sub_days(Days::new(days as u64))
            .unwrap_or(NaiveDate::MIN);
        self.get_daily_prices(symbol, start, today).await
    }
}
