//! Purchase aggregate and the domain events it raises

use chrono::{DateTime, NaiveDate, Utc};
use persistence::repository::PurchaseRecord;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::DcaError;
use crate::types::MultiplierResult;

/// Outcome of one purchase attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurchaseStatus {
    Filled,
    PartiallyFilled,
    /// Order accepted but not matched; unexpected for IOC
    Resting,
    Failed,
}

impl PurchaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PurchaseStatus::Filled => "filled",
            PurchaseStatus::PartiallyFilled => "partially_filled",
            PurchaseStatus::Resting => "resting",
            PurchaseStatus::Failed => "failed",
        }
    }

    /// Counts as "bought today" for idempotency
    pub fn is_success(&self) -> bool {
        matches!(self, PurchaseStatus::Filled | PurchaseStatus::PartiallyFilled)
    }
}

impl fmt::Display for PurchaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PurchaseStatus {
    type Err = DcaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "filled" => Ok(PurchaseStatus::Filled),
            "partially_filled" => Ok(PurchaseStatus::PartiallyFilled),
            "resting" => Ok(PurchaseStatus::Resting),
            "failed" => Ok(PurchaseStatus::Failed),
            other => Err(DcaError::Store(format!("unknown purchase status '{other}'"))),
        }
    }
}

/// Events raised by the live purchase flow and queued through the outbox
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    PurchaseSkipped {
        date: NaiveDate,
        reason: String,
    },
    PurchaseCompleted {
        date: NaiveDate,
        status: PurchaseStatus,
        price: Decimal,
        quantity: Decimal,
        cost: Decimal,
        multiplier: Decimal,
        tier: String,
        is_dry_run: bool,
    },
    PurchaseResting {
        date: NaiveDate,
        order_id: Option<String>,
    },
    PurchaseFailed {
        date: NaiveDate,
        reason: String,
    },
}

impl DomainEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            DomainEvent::PurchaseSkipped { .. } => "purchase_skipped",
            DomainEvent::PurchaseCompleted { .. } => "purchase_completed",
            DomainEvent::PurchaseResting { .. } => "purchase_resting",
            DomainEvent::PurchaseFailed { .. } => "purchase_failed",
        }
    }

    /// JSON payload stored in the outbox
    pub fn payload(&self) -> Result<String, DcaError> {
        serde_json::to_string(self).map_err(|e| DcaError::Store(e.to_string()))
    }
}

/// One daily purchase attempt.
///
/// Created as `Failed` with no reason; the execution flow records the real
/// outcome with one of the `mark_*` methods before saving.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Purchase {
    pub id: Option<i64>,
    pub purchase_date: NaiveDate,
    pub executed_at: DateTime<Utc>,
    pub symbol: String,
    /// Mid price at decision time
    pub price: Decimal,
    pub cost: Decimal,
    pub quantity: Decimal,
    pub multiplier: Decimal,
    pub tier: String,
    pub drop_percentage: Decimal,
    pub high_30_day: Decimal,
    pub ma_200_day: Decimal,
    pub is_bear_market: bool,
    pub status: PurchaseStatus,
    pub is_dry_run: bool,
    pub order_id: Option<String>,
    pub failure_reason: Option<String>,
    /// Exchange response kept for audit
    pub raw_response: Option<String>,
}

impl Purchase {
    pub fn new(
        purchase_date: NaiveDate,
        symbol: impl Into<String>,
        price: Decimal,
        multiplier: &MultiplierResult,
        is_dry_run: bool,
    ) -> Self {
        Self {
            id: None,
            purchase_date,
            executed_at: Utc::now(),
            symbol: symbol.into(),
            price,
            cost: Decimal::ZERO,
            quantity: Decimal::ZERO,
            multiplier: multiplier.multiplier,
            tier: multiplier.tier_label.clone(),
            drop_percentage: multiplier.drop_percentage,
            high_30_day: multiplier.high_30_day,
            ma_200_day: multiplier.ma_200_day,
            is_bear_market: multiplier.is_bear_market,
            status: PurchaseStatus::Failed,
            is_dry_run,
            order_id: None,
            failure_reason: None,
            raw_response: None,
        }
    }

    /// Record a fill; anything below `requested` is a partial fill
    pub fn mark_filled(
        &mut self,
        filled_size: Decimal,
        avg_price: Decimal,
        requested: Decimal,
        order_id: Option<String>,
    ) {
        self.quantity = filled_size;
        self.cost = filled_size * avg_price;
        self.order_id = order_id;
        self.failure_reason = None;
        self.status = if filled_size < requested {
            PurchaseStatus::PartiallyFilled
        } else {
            PurchaseStatus::Filled
        };
    }

    pub fn mark_resting(&mut self, order_id: Option<String>) {
        self.order_id = order_id;
        self.status = PurchaseStatus::Resting;
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        self.failure_reason = Some(reason.into());
        self.status = PurchaseStatus::Failed;
    }

    pub fn with_raw_response(mut self, raw: Option<String>) -> Self {
        self.raw_response = raw;
        self
    }

    /// Event describing the recorded outcome
    pub fn domain_event(&self) -> DomainEvent {
        match self.status {
            PurchaseStatus::Filled | PurchaseStatus::PartiallyFilled => {
                DomainEvent::PurchaseCompleted {
                    date: self.purchase_date,
                    status: self.status,
                    price: self.price,
                    quantity: self.quantity,
                    cost: self.cost,
                    multiplier: self.multiplier,
                    tier: self.tier.clone(),
                    is_dry_run: self.is_dry_run,
                }
            }
            PurchaseStatus::Resting => DomainEvent::PurchaseResting {
                date: self.purchase_date,
                order_id: self.order_id.clone(),
            },
            PurchaseStatus::Failed => DomainEvent::PurchaseFailed {
                date: self.purchase_date,
                reason: self
                    .failure_reason
                    .clone()
                    .unwrap_or_else(|| "unknown".to_string()),
            },
        }
    }

    pub fn to_record(&self) -> PurchaseRecord {
        PurchaseRecord {
            id: self.id,
            purchase_date: self.purchase_date.to_string(),
            executed_at: self.executed_at.timestamp_millis(),
            symbol: self.symbol.clone(),
            price: self.price.to_string(),
            cost: self.cost.to_string(),
            quantity: self.quantity.to_string(),
            multiplier: self.multiplier.to_string(),
            tier: self.tier.clone(),
            drop_percentage: self.drop_percentage.to_string(),
            high_30_day: self.high_30_day.to_string(),
            ma_200_day: self.ma_200_day.to_string(),
            is_bear_market: self.is_bear_market,
            status: self.status.as_str().to_string(),
            is_dry_run: self.is_dry_run,
            order_id: self.order_id.clone(),
            failure_reason: self.failure_reason.clone(),
            raw_response: self.raw_response.clone(),
        }
    }
}

fn parse_decimal(field: &str, value: &str) -> Result<Decimal, DcaError> {
    Decimal::from_str(value)
        .map_err(|e| DcaError::Store(format!("invalid {field} '{value}': {e}")))
}

impl TryFrom<PurchaseRecord> for Purchase {
    type Error = DcaError;

    fn try_from(r: PurchaseRecord) -> Result<Self, Self::Error> {
        let purchase_date = NaiveDate::parse_from_str(&r.purchase_date, "%Y-%m-%d")
            .map_err(|e| DcaError::Store(format!("invalid purchase date: {e}")))?;
        let executed_at = DateTime::from_timestamp_millis(r.executed_at)
            .ok_or_else(|| DcaError::Store(format!("invalid timestamp {}", r.executed_at)))?;

        Ok(Self {
            id: r.id,
            purchase_date,
            executed_at,
            price: parse_decimal("price", &r.price)?,
            cost: parse_decimal("cost", &r.cost)?,
            quantity: parse_decimal("quantity", &r.quantity)?,
            multiplier: parse_decimal("multiplier", &r.multiplier)?,
            drop_percentage: parse_decimal("drop_percentage", &r.drop_percentage)?,
            high_30_day: parse_decimal("high_30_day", &r.high_30_day)?,
            ma_200_day: parse_decimal("ma_200_day", &r.ma_200_day)?,
            status: PurchaseStatus::from_str(&r.status)?,
            symbol: r.symbol,
            tier: r.tier,
            is_bear_market: r.is_bear_market,
            is_dry_run: r.is_dry_run,
            order_id: r.order_id,
            failure_reason: r.failure_reason,
            raw_response: r.raw_response,
        })
    }
}
