// Sweep lease: keeps concurrent engine instances from sweeping at the same time

use crate::db::RedisPool;
use crate::errors::StorageError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Lease resource name used by the reconciliation sweep
pub const SWEEP_LEASE_RESOURCE: &str = "sweep:deadline-alerts";

/// Distributed lock for exclusive access to a named resource
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Try to take the lock. `Ok(None)` means another holder has it.
    async fn acquire(&self, resource: &str, ttl: Duration) -> Result<Option<LockGuard>, StorageError>;
}

enum GuardBackend {
    Redis(RedisPool),
    Local(Arc<Mutex<HashMap<String, LocalEntry>>>),
}

/// Lock guard that releases the lock when dropped
pub struct LockGuard {
    resource: String,
    token: String,
    backend: GuardBackend,
}

impl LockGuard {
    pub fn resource(&self) -> &str {
        &self.resource
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("resource", &self.resource)
            .field("token", &self.token)
            .finish()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        match &self.backend {
            GuardBackend::Redis(pool) => {
                let resource = self.resource.clone();
                let token = self.token.clone();
                let pool = pool.clone();

                tokio::spawn(async move {
                    if let Err(e) = release_lock(&pool, &resource, &token).await {
                        warn!(
                            resource = %resource,
                            error = %e,
                            "Failed to release lock on drop"
                        );
                    }
                });
            }
            GuardBackend::Local(held) => {
                let mut held = held.lock().unwrap_or_else(|e| e.into_inner());
                if held.get(&self.resource).map(|entry| entry.token.as_str()) == Some(self.token.as_str()) {
                    held.remove(&self.resource);
                }
            }
        }
    }
}

/// Redis lock using `SET NX EX` with owner-checked release
pub struct RedLock {
    pool: RedisPool,
    retry_count: u32,
    retry_delay: Duration,
}

impl RedLock {
    /// A lock that gives up after the first failed attempt
    pub fn new(pool: RedisPool) -> Self {
        Self {
            pool,
            retry_count: 1,
            retry_delay: Duration::from_millis(200),
        }
    }

    pub fn with_retry(pool: RedisPool, retry_count: u32, retry_delay: Duration) -> Self {
        Self {
            pool,
            retry_count: retry_count.max(1),
            retry_delay,
        }
    }

    async fn try_acquire_once(
        &self,
        resource: &str,
        ttl: Duration,
    ) -> Result<Option<LockGuard>, StorageError> {
        let mut conn = self.pool.get_connection();
        let key = format!("lock:{}", resource);
        let token = Uuid::new_v4().to_string();

        let result: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(&token)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map_err(|e| StorageError::RedisError(format!("Failed to acquire lock: {}", e)))?;

        if result.is_none() {
            return Ok(None);
        }

        debug!(resource = %resource, ttl_seconds = ttl.as_secs(), "Lock acquired");
        Ok(Some(LockGuard {
            resource: resource.to_string(),
            token,
            backend: GuardBackend::Redis(self.pool.clone()),
        }))
    }
}

#[async_trait]
impl DistributedLock for RedLock {
    #[instrument(skip(self), fields(resource = %resource, ttl_seconds = ?ttl.as_secs()))]
    async fn acquire(&self, resource: &str, ttl: Duration) -> Result<Option<LockGuard>, StorageError> {
        let mut attempts = 0;

        loop {
            attempts += 1;
            if let Some(guard) = self.try_acquire_once(resource, ttl).await? {
                info!(resource = %resource, attempts, "Lock acquired successfully");
                return Ok(Some(guard));
            }

            if attempts >= self.retry_count {
                debug!(resource = %resource, attempts, "Lock held elsewhere");
                return Ok(None);
            }

            sleep(self.retry_delay).await;
        }
    }
}

/// Delete the key only if it still holds our token
async fn release_lock(pool: &RedisPool, resource: &str, token: &str) -> Result<(), StorageError> {
    let mut conn = pool.get_connection();
    let key = format!("lock:{}", resource);

    let script = r#"
        if redis.call("get", KEYS[1]) == ARGV[1] then
            return redis.call("del", KEYS[1])
        else
            return 0
        end
    "#;

    let result: i32 = redis::Script::new(script)
        .key(&key)
        .arg(token)
        .invoke_async(&mut conn)
        .await
        .map_err(|e| StorageError::RedisError(format!("Failed to release lock: {}", e)))?;

    if result == 1 {
        debug!(resource = %resource, "Lock released");
    } else {
        warn!(resource = %resource, "Lock was not owned or already expired");
    }

    Ok(())
}

struct LocalEntry {
    token: String,
    expires_at: Instant,
}

/// Process-local lock, for single-instance deployments and tests
#[derive(Clone, Default)]
pub struct LocalLock {
    held: Arc<Mutex<HashMap<String, LocalEntry>>>,
}

impl LocalLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DistributedLock for LocalLock {
    async fn acquire(&self, resource: &str, ttl: Duration) -> Result<Option<LockGuard>, StorageError> {
        let now = Instant::now();
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(entry) = held.get(resource) {
            if entry.expires_at > now {
                return Ok(None);
            }
        }

        let token = Uuid::new_v4().to_string();
        held.insert(
            resource.to_string(),
            LocalEntry {
                token: token.clone(),
                expires_at: now + ttl,
            },
        );

        Ok(Some(LockGuard {
            resource: resource.to_string(),
            token,
            backend: GuardBackend::Local(self.held.clone()),
        }))
    }
}
