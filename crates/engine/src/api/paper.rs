//! Paper-trading exchange: real prices, simulated balance and fills

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::info;

use crate::api::BinanceClient;
use crate::error::ExchangeError;
use crate::execution::{ExchangeClient, OrderResponse, OrderStatus, SpotAsset, SpotOrder};

/// Source of live mid prices
#[async_trait]
pub trait SpotPriceSource: Send + Sync {
    async fn spot_price(&self, symbol: &str) -> Result<Decimal, ExchangeError>;
}

#[async_trait]
impl SpotPriceSource for BinanceClient {
    async fn spot_price(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        self.get_price(symbol).await
    }
}

/// Spot listings known to the paper exchange
pub fn default_spot_assets() -> Vec<SpotAsset> {
    vec![
        SpotAsset {
            name: "BTC".into(),
            index: 10_000,
            sz_decimals: 5,
        },
        SpotAsset {
            name: "ETH".into(),
            index: 10_001,
            sz_decimals: 4,
        },
    ]
}

struct PaperAccount {
    balance: Decimal,
    holdings: HashMap<u32, Decimal>,
    next_oid: u64,
}

/// Fills IOC orders at the current mid price if the limit allows it.
///
/// `market_symbol` is the price feed symbol used for fills; every order is
/// priced against it.
pub struct PaperExchange {
    prices: Arc<dyn SpotPriceSource>,
    market_symbol: String,
    assets: Vec<SpotAsset>,
    account: Mutex<PaperAccount>,
}

impl PaperExchange {
    pub fn new(
        prices: Arc<dyn SpotPriceSource>,
        market_symbol: impl Into<String>,
        starting_balance: Decimal,
    ) -> Self {
        Self {
            prices,
            market_symbol: market_symbol.into(),
            assets: default_spot_assets(),
            account: Mutex::new(PaperAccount {
                balance: starting_balance,
                holdings: HashMap::new(),
                next_oid: 1,
            }),
        }
    }

    /// Units held of a listed asset
    pub fn holdings(&self, asset_index: u32) -> Decimal {
        self.account
            .lock()
            .map(|a| a.holdings.get(&asset_index).copied().unwrap_or_default())
            .unwrap_or_default()
    }

    fn fill(&self, order: &SpotOrder, mid: Decimal) -> Result<OrderStatus, ExchangeError> {
        let mut account = self
            .account
            .lock()
            .map_err(|e| ExchangeError::Transport(e.to_string()))?;

        let crosses = if order.is_buy {
            mid <= order.limit_price
        } else {
            mid >= order.limit_price
        };
        if !crosses {
            return Ok(OrderStatus::Error(
                "Order could not immediately match against any resting orders".into(),
            ));
        }

        let notional = order.size * mid;
        let held = account.holdings.get(&order.asset_index).copied().unwrap_or_default();
        if order.is_buy && notional > account.balance {
            return Ok(OrderStatus::Error("Insufficient balance for order".into()));
        }
        if !order.is_buy && order.size > held {
            return Ok(OrderStatus::Error("Insufficient holdings for order".into()));
        }

        if order.is_buy {
            account.balance -= notional;
            account.holdings.insert(order.asset_index, held + order.size);
        } else {
            account.balance += notional;
            account.holdings.insert(order.asset_index, held - order.size);
        }

        let oid = account.next_oid;
        account.next_oid += 1;

        Ok(OrderStatus::Filled {
            total_sz: order.size,
            avg_px: mid,
            oid: Some(oid),
        })
    }
}

#[async_trait]
impl ExchangeClient for PaperExchange {
    async fn get_balance(&self) -> Result<Decimal, ExchangeError> {
        self.account
            .lock()
            .map(|a| a.balance)
            .map_err(|e| ExchangeError::Transport(e.to_string()))
    }

    async fn get_spot_price(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        self.prices.spot_price(symbol).await
    }

    async fn get_spot_metadata(&self) -> Result<Vec<SpotAsset>, ExchangeError> {
        Ok(self.assets.clone())
    }

    async fn place_spot_order(&self, order: &SpotOrder) -> Result<OrderResponse, ExchangeError> {
        if !self.assets.iter().any(|a| a.index == order.asset_index) {
            return Err(ExchangeError::Rejected(format!(
                "unknown asset index {}",
                order.asset_index
            )));
        }

        let mid = self.prices.spot_price(&self.market_symbol).await?;
        let status = self.fill(order, mid)?;

        info!(
            asset = order.asset_index,
            size = %order.size,
            mid = %mid,
            status = ?status,
            "[PAPER] Order processed"
        );

        let raw = serde_json::json!({ "status": "ok", "paper": true, "statuses": [&status] })
            .to_string();
        Ok(OrderResponse {
            statuses: vec![status],
            raw,
        })
    }
}
