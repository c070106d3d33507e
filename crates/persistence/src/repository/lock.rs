//! Lock repository — expiring leases used as a cross-process mutex

use crate::DbResult;
use sqlx::SqlitePool;

pub struct LockRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> LockRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Try to take the lease for `key` until `expires_at_ms`.
    ///
    /// Succeeds when no lease exists or the current one expired at or before `now_ms`.
    pub async fn try_acquire(
        &self,
        key: &str,
        owner: &str,
        now_ms: i64,
        expires_at_ms: i64,
    ) -> DbResult<bool> {
        let result = sqlx::query(
            r#"INSERT INTO dca_locks (lock_key, owner, expires_at)
               VALUES (?1, ?2, ?3)
               ON CONFLICT(lock_key) DO UPDATE SET
                 owner = excluded.owner,
                 expires_at = excluded.expires_at
               WHERE dca_locks.expires_at <= ?4
            "#,
        )
        .bind(key)
        .bind(owner)
        .bind(expires_at_ms)
        .bind(now_ms)
        .execute(self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Release a lease; only the owner that took it can release it
    pub async fn release(&self, key: &str, owner: &str) -> DbResult<bool> {
        let result = sqlx::query("DELETE FROM dca_locks WHERE lock_key = ?1 AND owner = ?2")
            .bind(key)
            .bind(owner)
            .execute(self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;

    #[tokio::test]
    async fn test_lock_is_exclusive_until_expiry() {
        let db = Database::in_memory().await.unwrap();
        let repo = LockRepository::new(db.pool());

        assert!(repo.try_acquire("dca-purchase-2025-01-10", "a", 1_000, 301_000).await.unwrap());
        assert!(!repo.try_acquire("dca-purchase-2025-01-10", "b", 2_000, 302_000).await.unwrap());

        // Different key is independent
        assert!(repo.try_acquire("dca-purchase-2025-01-11", "b", 2_000, 302_000).await.unwrap());

        // After expiry another owner may take over
        assert!(repo.try_acquire("dca-purchase-2025-01-10", "b", 301_000, 601_000).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_requires_owner() {
        let db = Database::in_memory().await.unwrap();
        let repo = LockRepository::new(db.pool());

        assert!(repo.try_acquire("k", "a", 0, 1_000).await.unwrap());
        assert!(!repo.release("k", "b").await.unwrap());
        assert!(repo.release("k", "a").await.unwrap());
        assert!(repo.try_acquire("k", "b", 10, 1_010).await.unwrap());
    }
}
