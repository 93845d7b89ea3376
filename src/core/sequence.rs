// src/core/sequence.rs

//! Monotonic per-conversation counters. Values come either one at a time from
//! an atomic store increment, or in lock-guarded batches served from a local
//! cache so that hot conversations do not hit the store for every message.
//!
//! A crash loses the unissued tail of a batch; values are never issued twice.
//! The two modes must not be mixed on the same sequence id.

use crate::core::BrokerError;
use crate::core::lock::DistributedLock;
use crate::core::store::{KvStore, keys};
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// The locally cached state of one batched sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceRecord {
    pub app_id: String,
    pub sequence_id: String,
    /// The last value handed out.
    pub current_value: u64,
    pub batch_size: u64,
    /// The last value of the reserved range.
    end: u64,
}

impl SequenceRecord {
    fn new(app_id: &str, sequence_id: &str, batch_size: u64) -> Self {
        Self {
            app_id: app_id.to_string(),
            sequence_id: sequence_id.to_string(),
            current_value: 0,
            batch_size,
            end: 0,
        }
    }

    /// Values still reserved but not yet handed out.
    pub fn remaining(&self) -> u64 {
        self.end - self.current_value
    }
}

#[derive(Debug)]
pub struct SequenceAllocator {
    store: Arc<dyn KvStore>,
    lock: DistributedLock,
    batch_size: u64,
    cache: DashMap<(String, String), Arc<Mutex<SequenceRecord>>>,
}

fn parse_counter(raw: Option<Bytes>) -> Result<u64, BrokerError> {
    match raw {
        None => Ok(0),
        Some(raw) => Ok(std::str::from_utf8(&raw)?.parse::<u64>()?),
    }
}

impl SequenceAllocator {
    pub fn new(store: Arc<dyn KvStore>, lock: DistributedLock, batch_size: u64) -> Self {
        Self {
            store,
            lock,
            batch_size: batch_size.max(1),
            cache: DashMap::new(),
        }
    }

    /// Atomically increments the sequence and returns the new value.
    pub async fn increment(&self, app_id: &str, seq_id: &str) -> Result<u64, BrokerError> {
        let value = self.store.incr(&keys::sequence(app_id, seq_id)).await?;
        u64::try_from(value)
            .map_err(|_| BrokerError::Store(format!("sequence '{seq_id}' went negative")))
    }

    /// Reserves `size` values and returns the first of them. The counter is
    /// read and advanced under the sequence's distributed lock.
    pub async fn allocate_batch(
        &self,
        app_id: &str,
        seq_id: &str,
        size: u64,
    ) -> Result<u64, BrokerError> {
        if size == 0 {
            return Err(BrokerError::InvalidRequest("batch size must be positive".into()));
        }
        let counter_key = keys::sequence(app_id, seq_id);
        let guard = self
            .lock
            .lock(&keys::lock(app_id, &format!("seq:{seq_id}")))
            .await?;

        let reserved = async {
            let current = parse_counter(self.store.get(&counter_key).await?)?;
            let end = current
                .checked_add(size)
                .ok_or_else(|| BrokerError::Store(format!("sequence '{seq_id}' overflowed")))?;
            self.store
                .set(&counter_key, Bytes::from(end.to_string()), None)
                .await?;
            Ok::<u64, BrokerError>(current + 1)
        }
        .await;

        guard.release().await?;
        let start = reserved?;
        debug!(
            "Reserved sequence range {}..={} for {}/{}",
            start,
            start + size - 1,
            app_id,
            seq_id
        );
        Ok(start)
    }

    /// Hands out the next value from the local batch, refilling it with
    /// `allocate_batch` when exhausted.
    pub async fn next_value(&self, app_id: &str, seq_id: &str) -> Result<u64, BrokerError> {
        let slot = self
            .cache
            .entry((app_id.to_string(), seq_id.to_string()))
            .or_insert_with(|| {
                Arc::new(Mutex::new(SequenceRecord::new(
                    app_id,
                    seq_id,
                    self.batch_size,
                )))
            })
            .clone();

        let mut record = slot.lock().await;
        if record.remaining() == 0 {
            let start = self
                .allocate_batch(app_id, seq_id, record.batch_size)
                .await?;
            record.current_value = start - 1;
            record.end = start + record.batch_size - 1;
        }
        record.current_value += 1;
        Ok(record.current_value)
    }

    /// A copy of the cached record, if the sequence has been used locally.
    pub async fn record(&self, app_id: &str, seq_id: &str) -> Option<SequenceRecord> {
        let slot = self
            .cache
            .get(&(app_id.to_string(), seq_id.to_string()))
            .map(|s| Arc::clone(s.value()))?;
        let record = slot.lock().await;
        Some(record.clone())
    }
}
