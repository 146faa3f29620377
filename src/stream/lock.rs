//! TTL-bounded distributed locks.
//!
//! A lock is acquired with an owner token and released with a
//! compare-and-delete on that token, so a holder whose lease has lapsed can
//! never delete the lock of the instance that took over.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::LockError;

const RELEASE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

/// What happened when a lock was released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// We still owned the lock and deleted it.
    Released,
    /// The lease had lapsed; the lock expired or now belongs to someone else.
    Lost,
    /// Nothing to release: never acquired or already released.
    NotHeld,
}

/// A lock handle returned by a `LockProvider`.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    fn name(&self) -> &str;

    fn is_acquired(&self) -> bool;

    /// Releases the lock. Calling it again returns `ReleaseOutcome::NotHeld`.
    async fn release(&mut self) -> Result<ReleaseOutcome, LockError>;
}

/// Hands out named locks. Acquisition never waits.
#[async_trait]
pub trait LockProvider: Send + Sync {
    async fn acquire_lock(
        &self,
        name: &str,
        ttl: Duration,
    ) -> Result<Box<dyn DistributedLock>, LockError>;
}

fn ttl_millis(name: &str, ttl: Duration) -> Result<u64, LockError> {
    let millis = ttl.as_millis() as u64;
    if millis == 0 {
        return Err(LockError::InvalidRequest {
            name: name.to_string(),
            reason: "ttl must be at least one millisecond".to_string(),
        });
    }
    Ok(millis)
}

/// Locks stored as Redis keys (`SET NX PX`).
#[derive(Clone)]
pub struct RedisLockProvider {
    redis: ConnectionManager,
}

impl RedisLockProvider {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl LockProvider for RedisLockProvider {
    async fn acquire_lock(
        &self,
        name: &str,
        ttl: Duration,
    ) -> Result<Box<dyn DistributedLock>, LockError> {
        let millis = ttl_millis(name, ttl)?;
        let token = Uuid::new_v4().to_string();

        let mut conn = self.redis.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(name)
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(millis)
            .query_async(&mut conn)
            .await?;

        Ok(Box::new(RedisLock {
            redis: self.redis.clone(),
            name: name.to_string(),
            token,
            acquired: reply.is_some(),
        }))
    }
}

struct RedisLock {
    redis: ConnectionManager,
    name: String,
    token: String,
    acquired: bool,
}

#[async_trait]
impl DistributedLock for RedisLock {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_acquired(&self) -> bool {
        self.acquired
    }

    async fn release(&mut self) -> Result<ReleaseOutcome, LockError> {
        if !self.acquired {
            return Ok(ReleaseOutcome::NotHeld);
        }

        let mut conn = self.redis.clone();
        let deleted: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(&self.name)
            .arg(&self.token)
            .invoke_async(&mut conn)
            .await?;
        self.acquired = false;

        Ok(if deleted == 1 {
            ReleaseOutcome::Released
        } else {
            ReleaseOutcome::Lost
        })
    }
}

#[derive(Debug)]
struct Lease {
    token: String,
    expires_at: Instant,
}

/// Process-local lock provider.
///
/// Clones share the same lock table, so several clones behave like several
/// workers talking to one lock service. Expiry follows tokio's clock.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLockProvider {
    leases: Arc<Mutex<HashMap<String, Lease>>>,
}

impl InMemoryLockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a live lease exists for `name`.
    pub fn is_locked(&self, name: &str) -> bool {
        let leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        leases
            .get(name)
            .is_some_and(|lease| lease.expires_at > Instant::now())
    }
}

#[async_trait]
impl LockProvider for InMemoryLockProvider {
    async fn acquire_lock(
        &self,
        name: &str,
        ttl: Duration,
    ) -> Result<Box<dyn DistributedLock>, LockError> {
        ttl_millis(name, ttl)?;
        let now = Instant::now();
        let token = Uuid::new_v4().to_string();

        let acquired = {
            let mut leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
            match leases.get(name) {
                Some(lease) if lease.expires_at > now => false,
                _ => {
                    leases.insert(
                        name.to_string(),
                        Lease {
                            token: token.clone(),
                            expires_at: now + ttl,
                        },
                    );
                    true
                }
            }
        };

        Ok(Box::new(InMemoryLock {
            leases: Arc::clone(&self.leases),
            name: name.to_string(),
            token,
            acquired,
        }))
    }
}

struct InMemoryLock {
    leases: Arc<Mutex<HashMap<String, Lease>>>,
    name: String,
    token: String,
    acquired: bool,
}

#[async_trait]
impl DistributedLock for InMemoryLock {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_acquired(&self) -> bool {
        self.acquired
    }

    async fn release(&mut self) -> Result<ReleaseOutcome, LockError> {
        if !self.acquired {
            return Ok(ReleaseOutcome::NotHeld);
        }
        self.acquired = false;

        let mut leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        let owned = leases
            .get(&self.name)
            .is_some_and(|lease| lease.token == self.token);
        if !owned {
            return Ok(ReleaseOutcome::Lost);
        }

        let lease = leases.remove(&self.name);
        Ok(match lease {
            Some(lease) if lease.expires_at > Instant::now() => ReleaseOutcome::Released,
            _ => ReleaseOutcome::Lost,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_lock_is_exclusive_until_released() {
        let provider = InMemoryLockProvider::new();
        let ttl = Duration::from_secs(10);

        let mut first = provider.acquire_lock("lock:g-p0", ttl).await.unwrap();
        assert!(first.is_acquired());

        let second = provider.acquire_lock("lock:g-p0", ttl).await.unwrap();
        assert!(!second.is_acquired());

        assert_eq!(first.release().await.unwrap(), ReleaseOutcome::Released);
        assert_eq!(first.release().await.unwrap(), ReleaseOutcome::NotHeld);

        let third = provider.acquire_lock("lock:g-p0", ttl).await.unwrap();
        assert!(third.is_acquired());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lapsed_lease_does_not_delete_new_owner() {
        let worker_a = InMemoryLockProvider::new();
        let worker_b = worker_a.clone();
        let ttl = Duration::from_secs(10);

        let mut stale = worker_a.acquire_lock("lock:g-p0", ttl).await.unwrap();
        tokio::time::sleep(Duration::from_secs(11)).await;

        let fresh = worker_b.acquire_lock("lock:g-p0", ttl).await.unwrap();
        assert!(fresh.is_acquired());

        assert_eq!(stale.release().await.unwrap(), ReleaseOutcome::Lost);
        assert!(worker_b.is_locked("lock:g-p0"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lease_reports_lost() {
        let provider = InMemoryLockProvider::new();
        let mut lock = provider
            .acquire_lock("lock:g-p1", Duration::from_secs(1))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!provider.is_locked("lock:g-p1"));
        assert_eq!(lock.release().await.unwrap(), ReleaseOutcome::Lost);
    }

    #[tokio::test]
    async fn test_zero_ttl_is_rejected() {
        let provider = InMemoryLockProvider::new();
        let result = provider.acquire_lock("lock:g-p0", Duration::ZERO).await;
        assert!(matches!(result, Err(LockError::InvalidRequest { .. })));
    }

    #[tokio::test]
    #[ignore = "requires a running Redis server (REDIS_URL)"]
    async fn test_redis_lock_round_trip() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".into());
        let client = redis::Client::open(url).unwrap();
        let provider = RedisLockProvider::new(ConnectionManager::new(client).await.unwrap());
        let name = format!("lock:test-{}", Uuid::new_v4());

        let mut first = provider.acquire_lock(&name, Duration::from_secs(5)).await.unwrap();
        assert!(first.is_acquired());
        assert!(!provider
            .acquire_lock(&name, Duration::from_secs(5))
            .await
            .unwrap()
            .is_acquired());

        assert_eq!(first.release().await.unwrap(), ReleaseOutcome::Released);
        assert_eq!(first.release().await.unwrap(), ReleaseOutcome::NotHeld);
    }

    #[tokio::test]
    #[ignore = "requires a running Redis server (REDIS_URL)"]
    async fn test_redis_lapsed_lock_reports_lost() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".into());
        let client = redis::Client::open(url).unwrap();
        let provider = RedisLockProvider::new(ConnectionManager::new(client).await.unwrap());
        let name = format!("lock:test-{}", Uuid::new_v4());

        let mut stale = provider.acquire_lock(&name, Duration::from_millis(100)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        let mut fresh = provider.acquire_lock(&name, Duration::from_secs(5)).await.unwrap();
        assert!(fresh.is_acquired());

        assert_eq!(stale.release().await.unwrap(), ReleaseOutcome::Lost);
        assert_eq!(fresh.release().await.unwrap(), ReleaseOutcome::Released);
    }
}
