//! Purchase repository — one row per daily execution attempt

use crate::DbResult;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

/// State key holding the date of the last filled, non-dry-run purchase
pub const LAST_SUCCESS_KEY: &str = "last_successful_execution_date";

/// Status values considered a completed purchase for idempotency purposes
pub const SUCCESS_STATUSES: [&str; 2] = ["filled", "partially_filled"];

/// A persisted purchase attempt
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PurchaseRecord {
    pub id: Option<i64>,
    /// Calendar date in `YYYY-MM-DD`
    pub purchase_date: String,
    /// Unix milliseconds
    pub executed_at: i64,
    pub symbol: String,
    pub price: String,
    pub cost: String,
    pub quantity: String,
    pub multiplier: String,
    pub tier: String,
    pub drop_percentage: String,
    pub high_30_day: String,
    pub ma_200_day: String,
    pub is_bear_market: bool,
    pub status: String,
    pub is_dry_run: bool,
    pub order_id: Option<String>,
    pub failure_reason: Option<String>,
    pub raw_response: Option<String>,
}

impl PurchaseRecord {
    pub fn is_success(&self) -> bool {
        SUCCESS_STATUSES.contains(&self.status.as_str())
    }
}

/// Repository for purchase history and the execution-state fact stored next to it
pub struct PurchaseRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> PurchaseRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a purchase together with its domain event in one transaction.
    ///
    /// Filled/partially filled live purchases also advance
    /// `last_successful_execution_date`. Returns the new purchase id.
    pub async fn save_with_event(
        &self,
        record: &PurchaseRecord,
        event_type: &str,
        event_payload: &str,
    ) -> DbResult<i64> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"INSERT INTO dca_purchases
                (purchase_date, executed_at, symbol, price, cost, quantity, multiplier, tier,
                 drop_percentage, high_30_day, ma_200_day, is_bear_market, status, is_dry_run,
                 order_id, failure_reason, raw_response)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
            "#,
        )
        .bind(&record.purchase_date)
        .bind(record.executed_at)
        .bind(&record.symbol)
        .bind(&record.price)
        .bind(&record.cost)
        .bind(&record.quantity)
        .bind(&record.multiplier)
        .bind(&record.tier)
        .bind(&record.drop_percentage)
        .bind(&record.high_30_day)
        .bind(&record.ma_200_day)
        .bind(record.is_bear_market)
        .bind(&record.status)
        .bind(record.is_dry_run)
        .bind(&record.order_id)
        .bind(&record.failure_reason)
        .bind(&record.raw_response)
        .execute(&mut *tx)
        .await?;
        let id = result.last_insert_rowid();

        sqlx::query("INSERT INTO dca_outbox (event_type, payload) VALUES (?1, ?2)")
            .bind(event_type)
            .bind(event_payload)
            .execute(&mut *tx)
            .await?;

        if record.is_success() && !record.is_dry_run {
            // ISO dates compare lexicographically, so MAX keeps the newest date
            sqlx::query(
                r#"INSERT INTO dca_execution_state (state_key, state_value, updated_at)
                   VALUES (?1, ?2, strftime('%s', 'now'))
                   ON CONFLICT(state_key) DO UPDATE SET
                     state_value = MAX(dca_execution_state.state_value, excluded.state_value),
                     updated_at = strftime('%s', 'now')
                "#,
            )
            .bind(LAST_SUCCESS_KEY)
            .bind(&record.purchase_date)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(id)
    }

    /// Find the filled/partially filled live purchase for a date, if any
    pub async fn find_successful_for_date(&self, date: &str) -> DbResult<Option<PurchaseRecord>> {
        let record = sqlx::query_as::<_, PurchaseRecord>(
            r#"SELECT * FROM dca_purchases
               WHERE purchase_date = ?1
                 AND status IN ('filled', 'partially_filled')
                 AND is_dry_run = 0
               ORDER BY id DESC
               LIMIT 1"#,
        )
        .bind(date)
        .fetch_optional(self.pool)
        .await?;

        Ok(record)
    }

    /// All attempts for a date, oldest first
    pub async fn get_by_date(&self, date: &str) -> DbResult<Vec<PurchaseRecord>> {
        let records = sqlx::query_as::<_, PurchaseRecord>(
            "SELECT * FROM dca_purchases WHERE purchase_date = ?1 ORDER BY id ASC",
        )
        .bind(date)
        .fetch_all(self.pool)
        .await?;

        Ok(records)
    }

    /// Most recent attempts, newest first
    pub async fn get_recent(&self, limit: i64) -> DbResult<Vec<PurchaseRecord>> {
        let records = sqlx::query_as::<_, PurchaseRecord>(
            "SELECT * FROM dca_purchases ORDER BY executed_at DESC, id DESC LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(self.pool)
        .await?;

        Ok(records)
    }

    pub async fn last_successful_execution_date(&self) -> DbResult<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT state_value FROM dca_execution_state WHERE state_key = ?1")
                .bind(LAST_SUCCESS_KEY)
                .fetch_optional(self.pool)
                .await?;

        Ok(row.map(|(v,)| v))
    }
}
