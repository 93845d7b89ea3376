// src/core/store/memory/mod.rs

//! An in-process `KvStore` for single-node deployments and tests.

mod keyspace;
mod scripting;

pub use keyspace::{Keyspace, NUM_SHARDS, SetCondition, StoredValue};

use super::{KvStore, RespValue, Script};
use crate::core::BrokerError;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;

/// Default wall-clock budget for a single script.
pub const DEFAULT_SCRIPT_TIMEOUT: Duration = Duration::from_secs(5);
const SCRIPT_MEMORY_LIMIT: usize = 16 * 1024 * 1024;

/// A sharded in-memory keyspace with TTLs and atomic Lua scripting.
///
/// Ordinary operations take the gate shared and lock a single shard. Scripts
/// take the gate exclusively for their whole run, which is what makes them
/// atomic with respect to everything else.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
}

#[derive(Debug)]
struct MemoryInner {
    gate: RwLock<()>,
    keyspace: Arc<Keyspace>,
    script_timeout: Duration,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_script_timeout(DEFAULT_SCRIPT_TIMEOUT)
    }

    pub fn with_script_timeout(script_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                gate: RwLock::new(()),
                keyspace: Arc::new(Keyspace::new()),
                script_timeout,
            }),
        }
    }

    /// Actively drops expired keys. Reads already ignore them; this reclaims
    /// their memory.
    pub fn purge_expired(&self) -> usize {
        let _shared = self.inner.gate.read();
        self.inner.keyspace.purge_expired()
    }

    /// Number of stored keys, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        let _shared = self.inner.gate.read();
        self.inner.keyspace.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn set(
        &self,
        key: &str,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> Result<(), BrokerError> {
        let _shared = self.inner.gate.read();
        self.inner
            .keyspace
            .set(key, value, ttl, SetCondition::Always);
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: Bytes, ttl: Duration) -> Result<bool, BrokerError> {
        let _shared = self.inner.gate.read();
        Ok(self
            .inner
            .keyspace
            .set(key, value, Some(ttl), SetCondition::IfAbsent))
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, BrokerError> {
        let _shared = self.inner.gate.read();
        self.inner.keyspace.get(key)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, BrokerError> {
        let _shared = self.inner.gate.read();
        Ok(self.inner.keyspace.expire(key, ttl))
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, BrokerError> {
        let _shared = self.inner.gate.read();
        let ms = self.inner.keyspace.pttl(key);
        Ok((ms >= 0).then(|| Duration::from_millis(ms as u64)))
    }

    async fn delete(&self, key: &str) -> Result<bool, BrokerError> {
        let _shared = self.inner.gate.read();
        Ok(self.inner.keyspace.delete(key))
    }

    async fn eval_atomic(
        &self,
        script: &Script,
        keys: &[String],
        args: &[Bytes],
    ) -> Result<RespValue, BrokerError> {
        let inner = Arc::clone(&self.inner);
        let source = script.source().to_owned();
        let keys = keys.to_vec();
        let args = args.to_vec();

        // `mlua::Lua` runs synchronously, so the whole evaluation happens on a
        // blocking thread.
        let task = tokio::task::spawn_blocking(move || {
            let _exclusive = inner.gate.write();
            scripting::run(
                &inner.keyspace,
                &source,
                &keys,
                &args,
                SCRIPT_MEMORY_LIMIT,
                inner.script_timeout,
            )
        });

        match tokio::time::timeout(self.inner.script_timeout, task).await {
            Ok(Ok(result)) => result?.into_result(),
            Ok(Err(join_err)) => Err(BrokerError::Internal(format!(
                "Lua execution task panicked: {join_err}"
            ))),
            Err(_) => Err(BrokerError::Store(format!(
                "script did not finish within {:?}",
                self.inner.script_timeout
            ))),
        }
    }

    async fn incr(&self, key: &str) -> Result<i64, BrokerError> {
        let _shared = self.inner.gate.read();
        self.inner.keyspace.incr_by(key, 1)
    }

    async fn hash_set(&self, key: &str, field: &str, value: Bytes) -> Result<bool, BrokerError> {
        let _shared = self.inner.gate.read();
        self.inner.keyspace.hash_set(key, field, value)
    }

    async fn hash_get_all(&self, key: &str) -> Result<Vec<(String, Bytes)>, BrokerError> {
        let _shared = self.inner.gate.read();
        self.inner.keyspace.hash_get_all(key)
    }

    async fn hash_delete(&self, key: &str, field: &str) -> Result<bool, BrokerError> {
        let _shared = self.inner.gate.read();
        self.inner.keyspace.hash_delete(key, field)
    }

    async fn sorted_set_add(
        &self,
        key: &str,
        members: &[(f64, String)],
    ) -> Result<usize, BrokerError> {
        let _shared = self.inner.gate.read();
        self.inner.keyspace.sorted_set_add(key, members)
    }

    async fn sorted_set_range(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<String>, BrokerError> {
        let _shared = self.inner.gate.read();
        self.inner.keyspace.sorted_set_range(key, start, stop)
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}
