//! Outbox repository — domain events waiting to be dispatched

use crate::DbResult;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

/// A queued domain event
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct OutboxRecord {
    pub id: i64,
    pub event_type: String,
    pub payload: String,
    pub created_at: Option<i64>,
    pub dispatched_at: Option<i64>,
}

pub struct OutboxRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> OutboxRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Queue an event outside of any purchase transaction
    pub async fn enqueue(&self, event_type: &str, payload: &str) -> DbResult<i64> {
        let result = sqlx::query("INSERT INTO dca_outbox (event_type, payload) VALUES (?1, ?2)")
            .bind(event_type)
            .bind(payload)
            .execute(self.pool)
            .await?;

        Ok(result.last_insert_rowid())
    }

    /// Undispatched events, oldest first
    pub async fn get_pending(&self, limit: i64) -> DbResult<Vec<OutboxRecord>> {
        let records = sqlx::query_as::<_, OutboxRecord>(
            "SELECT * FROM dca_outbox WHERE dispatched_at IS NULL ORDER BY id ASC LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(self.pool)
        .await?;

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;

    #[tokio::test]
    async fn test_pending_events_are_oldest_first() {
        let db = Database::in_memory().await.unwrap();
        let repo = OutboxRepository::new(db.pool());

        let first = repo
            .enqueue("purchase_skipped", r#"{"reason":"Insufficient balance"}"#)
            .await
            .unwrap();
        repo.enqueue("purchase_skipped", r#"{"reason":"Already purchased today"}"#)
            .await
            .unwrap();

        let pending = repo.get_pending(10).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].id, first);
        assert!(pending[0].dispatched_at.is_none());
        assert!(pending[1].payload.contains("Already purchased"));

        let limited = repo.get_pending(1).await.unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].id, first);
    }
}
