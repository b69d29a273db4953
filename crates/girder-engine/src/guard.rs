//! Concurrency guard
//!
//! A database-backed advisory lock with TTL. Prevents two workers from
//! simultaneously executing the same logical unit; crash recovery rides
//! on lazy expiry at the next acquire attempt.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use girder_core::RunId;
use girder_storage::{ExecutionStore, LockRow, StoreError};

/// Configuration for lock acquisition polling
#[derive(Debug, Clone)]
pub struct GuardConfig {
    /// Default lock TTL when the caller does not supply one
    pub default_ttl: Duration,

    /// Poll interval while waiting on a held lock
    pub poll_interval: Duration,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(60),
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// DB-backed advisory lock with TTL
#[derive(Clone)]
pub struct ConcurrencyGuard {
    store: Arc<dyn ExecutionStore>,
    config: GuardConfig,
}

impl ConcurrencyGuard {
    pub fn new(store: Arc<dyn ExecutionStore>) -> Self {
        Self {
            store,
            config: GuardConfig::default(),
        }
    }

    pub fn with_config(store: Arc<dyn ExecutionStore>, config: GuardConfig) -> Self {
        Self { store, config }
    }

    /// Try to acquire `key` for `owner`, polling up to `timeout`.
    ///
    /// A zero timeout makes exactly one attempt. Stale rows past their
    /// TTL are reaped inside the store's atomic acquire.
    pub async fn acquire(
        &self,
        key: &str,
        owner: RunId,
        ttl: Duration,
        timeout: Duration,
    ) -> Result<bool, StoreError> {
        let started = Instant::now();
        loop {
            if self.store.try_acquire_lock(key, owner, ttl).await? {
                debug!(key, %owner, "acquired lock");
                return Ok(true);
            }
            let elapsed = started.elapsed();
            if elapsed >= timeout {
                return Ok(false);
            }
            let wait = self.config.poll_interval.min(timeout - elapsed);
            tokio::time::sleep(wait).await;
        }
    }

    /// Acquire with the configured default TTL and a single attempt
    pub async fn try_acquire(&self, key: &str, owner: RunId) -> Result<bool, StoreError> {
        self.acquire(key, owner, self.config.default_ttl, Duration::ZERO)
            .await
    }

    /// Release the lock if `owner` still holds it
    pub async fn release(&self, key: &str, owner: RunId) -> Result<bool, StoreError> {
        let released = self.store.release_lock(key, owner).await?;
        if released {
            debug!(key, %owner, "released lock");
        }
        Ok(released)
    }

    pub async fn is_held(&self, key: &str) -> Result<bool, StoreError> {
        self.store.is_lock_held(key).await
    }

    /// Reap all expired locks, returning the count removed
    pub async fn cleanup_expired(&self) -> Result<u64, StoreError> {
        self.store.cleanup_expired_locks().await
    }

    pub async fn list_active(&self) -> Result<Vec<LockRow>, StoreError> {
        self.store.list_active_locks().await
    }

    pub fn default_ttl(&self) -> Duration {
        self.config.default_ttl
    }
}
