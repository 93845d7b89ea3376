// src/core/store/mod.rs

//! The shared key-value store every broker node coordinates through.
//!
//! Presence records, distributed locks and sequences are all expressed in
//! terms of the `KvStore` trait. Two backends implement it: `MemoryStore`, an
//! in-process keyspace for single-node deployments and tests, and `RespStore`,
//! a pooled client for any Redis-compatible server.

pub mod keys;
pub mod memory;
pub mod resp;
pub mod resp_client;
pub mod script;

pub use memory::MemoryStore;
pub use resp::{RespFrame, RespFrameCodec, RespValue};
pub use resp_client::RespStore;
pub use script::Script;

use crate::config::{StoreBackend, StoreConfig};
use crate::core::BrokerError;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

/// Operations the broker needs from the shared store. Every method is a single
/// round trip and is atomic on its own; multi-key atomicity goes through
/// `eval_atomic`.
#[async_trait]
pub trait KvStore: Send + Sync + Debug {
    /// Sets `key` to `value`, replacing any previous value and TTL.
    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>)
    -> Result<(), BrokerError>;

    /// Sets `key` only if it does not exist. Returns true if the value was set.
    async fn set_nx(&self, key: &str, value: Bytes, ttl: Duration) -> Result<bool, BrokerError>;

    async fn get(&self, key: &str) -> Result<Option<Bytes>, BrokerError>;

    /// Resets the TTL of an existing key. Returns false if the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, BrokerError>;

    /// Remaining TTL, or `None` if the key is absent or has no expiry.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, BrokerError>;

    async fn delete(&self, key: &str) -> Result<bool, BrokerError>;

    /// Runs `script` atomically with respect to every other store operation.
    async fn eval_atomic(
        &self,
        script: &Script,
        keys: &[String],
        args: &[Bytes],
    ) -> Result<RespValue, BrokerError>;

    /// Atomically increments an integer counter, creating it at zero.
    async fn incr(&self, key: &str) -> Result<i64, BrokerError>;

    /// Sets a hash field. Returns true if the field is new.
    async fn hash_set(&self, key: &str, field: &str, value: Bytes) -> Result<bool, BrokerError>;

    async fn hash_get_all(&self, key: &str) -> Result<Vec<(String, Bytes)>, BrokerError>;

    async fn hash_delete(&self, key: &str, field: &str) -> Result<bool, BrokerError>;

    /// Adds or updates sorted-set members. Returns the number of new members.
    async fn sorted_set_add(&self, key: &str, members: &[(f64, String)])
    -> Result<usize, BrokerError>;

    /// Members by ascending score over an inclusive rank range; negative ranks
    /// count from the end.
    async fn sorted_set_range(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<String>, BrokerError>;

    async fn ping(&self) -> Result<(), BrokerError>;
}

/// Builds the store backend selected by the configuration.
pub async fn open_store(config: &StoreConfig) -> Result<Arc<dyn KvStore>, BrokerError> {
    match config.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryStore::with_script_timeout(
            config.script_timeout,
        ))),
        StoreBackend::Resp => {
            let store = RespStore::new(config.clone());
            store.ping().await?;
            Ok(Arc::new(store))
        }
    }
}
