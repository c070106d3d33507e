//! SQLite-backed collaborators for the live purchase flow

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use persistence::repository::{LockRepository, OutboxRepository, PurchaseRepository};
use persistence::SqlitePool;
use std::time::Duration;
use tracing::debug;

use crate::error::DcaError;
use crate::execution::{EventPublisher, PurchaseStore};
use crate::lock::{owner_token, DistributedLock, LockLease};
use crate::purchase::{DomainEvent, Purchase};

pub struct SqlitePurchaseStore {
    pool: SqlitePool,
}

impl SqlitePurchaseStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PurchaseStore for SqlitePurchaseStore {
    async fn find_successful_for_date(
        &self,
        date: NaiveDate,
    ) -> Result<Option<Purchase>, DcaError> {
        let repo = PurchaseRepository::new(&self.pool);
        repo.find_successful_for_date(&date.to_string())
            .await?
            .map(Purchase::try_from)
            .transpose()
    }

    async fn save(&self, purchase: &Purchase) -> Result<i64, DcaError> {
        let event = purchase.domain_event();
        let payload = event.payload()?;
        let repo = PurchaseRepository::new(&self.pool);
        let id = repo
            .save_with_event(&purchase.to_record(), event.event_type(), &payload)
            .await?;
        debug!(id, date = %purchase.purchase_date, status = %purchase.status, "Saved purchase");
        Ok(id)
    }

    async fn recent(&self, limit: i64) -> Result<Vec<Purchase>, DcaError> {
        let repo = PurchaseRepository::new(&self.pool);
        repo.get_recent(limit)
            .await?
            .into_iter()
            .map(Purchase::try_from)
            .collect()
    }

    async fn last_successful_execution_date(&self) -> Result<Option<NaiveDate>, DcaError> {
        let repo = PurchaseRepository::new(&self.pool);
        repo.last_successful_execution_date()
            .await?
            .map(|s| {
                NaiveDate::parse_from_str(&s, "%Y-%m-%d")
                    .map_err(|e| DcaError::Store(format!("invalid execution date '{s}': {e}")))
            })
            .transpose()
    }
}

/// Lease row per key in `dca_locks`; works across processes sharing the database file
pub struct SqliteLock {
    pool: SqlitePool,
}

impl SqliteLock {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DistributedLock for SqliteLock {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockLease>, DcaError> {
        let owner = owner_token();
        let now_ms = Utc::now().timestamp_millis();
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let expires_at_ms = now_ms.saturating_add(ttl_ms);

        let acquired = LockRepository::new(&self.pool)
            .try_acquire(key, &owner, now_ms, expires_at_ms)
            .await
            .map_err(|e| DcaError::Lock(e.to_string()))?;

        Ok(acquired.then(|| LockLease {
            key: key.to_string(),
            owner,
        }))
    }

    async fn release(&self, lease: &LockLease) -> Result<(), DcaError> {
        let released = LockRepository::new(&self.pool)
            .release(&lease.key, &lease.owner)
            .await
            .map_err(|e| DcaError::Lock(e.to_string()))?;
        if !released {
            debug!(key = %lease.key, "Lease already expired or taken over");
        }
        Ok(())
    }
}

/// Writes events straight to the outbox, outside any purchase transaction
pub struct OutboxEventPublisher {
    pool: SqlitePool,
}

impl OutboxEventPublisher {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventPublisher for OutboxEventPublisher {
    async fn publish_direct(&self, event: &DomainEvent) -> Result<(), DcaError> {
        let payload = event.payload()?;
        OutboxRepository::new(&self.pool)
            .enqueue(event.event_type(), &payload)
            .await?;
        Ok(())
    }
}
