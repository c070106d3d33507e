//! Mutual exclusion for one purchase date across attempts and processes

use async_trait::async_trait;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::DcaError;

/// A held lock; pass back to [`DistributedLock::release`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockLease {
    pub key: String,
    /// Random token identifying this holder
    pub owner: String,
}

#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Take the lock for `ttl`; `Ok(None)` when someone else holds an unexpired lease
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockLease>, DcaError>;

    /// Release a lease. Releasing an expired or stolen lease is not an error.
    async fn release(&self, lease: &LockLease) -> Result<(), DcaError>;
}

/// Random 128-bit hex owner token
pub fn owner_token() -> String {
    let mut rng = rand::thread_rng();
    format!("{:016x}{:016x}", rng.gen::<u64>(), rng.gen::<u64>())
}

/// Lock for a single process
#[derive(Default)]
pub struct InMemoryLock {
    leases: Mutex<HashMap<String, (String, Instant)>>,
}

impl InMemoryLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DistributedLock for InMemoryLock {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockLease>, DcaError> {
        let mut leases = self
            .leases
            .lock()
            .map_err(|e| DcaError::Lock(e.to_string()))?;
        let now = Instant::now();

        if let Some((_, expires_at)) = leases.get(key) {
            if *expires_at > now {
                return Ok(None);
            }
        }

        let owner = owner_token();
        leases.insert(key.to_string(), (owner.clone(), now + ttl));
        Ok(Some(LockLease {
            key: key.to_string(),
            owner,
        }))
    }

    async fn release(&self, lease: &LockLease) -> Result<(), DcaError> {
        let mut leases = self
            .leases
            .lock()
            .map_err(|e| DcaError::Lock(e.to_string()))?;
        if leases.get(&lease.key).map(|(owner, _)| owner == &lease.owner) == Some(true) {
            leases.remove(&lease.key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_second_acquire_fails_until_release() {
        let lock = InMemoryLock::new();
        let ttl = Duration::from_secs(60);

        let lease = lock.acquire("dca-purchase-2024-01-01", ttl).await.unwrap().unwrap();
        assert!(lock.acquire("dca-purchase-2024-01-01", ttl).await.unwrap().is_none());
        assert!(lock.acquire("dca-purchase-2024-01-02", ttl).await.unwrap().is_some());

        lock.release(&lease).await.unwrap();
        assert!(lock.acquire("dca-purchase-2024-01-01", ttl).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_taken() {
        let lock = InMemoryLock::new();
        let first = lock
            .acquire("k", Duration::from_millis(0))
            .await
            .unwrap()
            .unwrap();
        let second = lock
            .acquire("k", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert_ne!(first.owner, second.owner);

        // Stale holder must not drop the new lease
        lock.release(&first).await.unwrap();
        assert!(lock.acquire("k", Duration::from_secs(60)).await.unwrap().is_none());
    }
}
