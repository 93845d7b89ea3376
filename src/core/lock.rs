// src/core/lock.rs

//! A mutual-exclusion primitive built on the shared store: acquisition is an
//! atomic create-if-absent carrying a caller token, release is an atomic
//! compare-and-delete of that token.

use crate::config::LockConfig;
use crate::core::BrokerError;
use crate::core::metrics;
use crate::core::store::script::{COMPARE_AND_DELETE, Script};
use crate::core::store::{KvStore, RespValue};
use bytes::Bytes;
use lazy_static::lazy_static;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

lazy_static! {
    static ref RELEASE_SCRIPT: Script = Script::new(COMPARE_AND_DELETE);
}

#[derive(Debug, Clone)]
pub struct DistributedLock {
    store: Arc<dyn KvStore>,
    config: LockConfig,
}

impl DistributedLock {
    pub fn new(store: Arc<dyn KvStore>, config: LockConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// A single acquisition attempt. Returns true if `key` now holds `token`.
    pub async fn try_acquire(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, BrokerError> {
        self.store
            .set_nx(key, Bytes::from(token.to_owned()), ttl)
            .await
    }

    /// Acquires `key` for `token`, retrying up to `max_retries` times with a
    /// randomized backoff that grows with the retry index. Exhaustion yields
    /// `LockAcquireTimeout`; store failures are returned as they occur.
    pub async fn acquire(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
        max_retries: u32,
    ) -> Result<(), BrokerError> {
        for attempt in 0..=max_retries {
            if self.try_acquire(key, token, ttl).await? {
                if attempt > 0 {
                    debug!("Acquired lock '{}' after {} retries", key, attempt);
                }
                return Ok(());
            }
            if attempt < max_retries {
                tokio::time::sleep(self.config.backoff(attempt)).await;
            }
        }
        metrics::LOCK_ACQUIRE_FAILURES_TOTAL.inc();
        warn!("Gave up acquiring lock '{}' after {} retries", key, max_retries);
        Err(BrokerError::LockAcquireTimeout(key.to_string()))
    }

    /// Acquires `key` with the configured TTL and retry budget and returns a
    /// guard holding a fresh token.
    pub async fn lock(&self, key: &str) -> Result<LockGuard, BrokerError> {
        let token = uuid::Uuid::new_v4().to_string();
        self.acquire(key, &token, self.config.ttl, self.config.max_retries)
            .await?;
        Ok(LockGuard {
            lock: self.clone(),
            key: key.to_string(),
            token,
            released: false,
        })
    }

    /// Deletes `key` only if it still holds `token`. Returns false, changing
    /// nothing, when the lock expired or belongs to someone else.
    pub async fn release(&self, key: &str, token: &str) -> Result<bool, BrokerError> {
        let reply = self
            .store
            .eval_atomic(
                &RELEASE_SCRIPT,
                &[key.to_string()],
                &[Bytes::from(token.to_owned())],
            )
            .await?;
        Ok(matches!(reply, RespValue::Integer(n) if n > 0))
    }
}

/// A held lock. Call `release` to give it up; a guard dropped without being
/// released frees the lock in the background.
#[derive(Debug)]
pub struct LockGuard {
    lock: DistributedLock,
    key: String,
    token: String,
    released: bool,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub async fn release(mut self) -> Result<bool, BrokerError> {
        self.released = true;
        self.lock.release(&self.key, &self.token).await
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let lock = self.lock.clone();
        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);
        handle.spawn(async move {
            if let Err(e) = lock.release(&key, &token).await {
                warn!("Failed to release lock '{}' in background: {}", key, e);
            }
        });
    }
}
