// src/core/presence.rs

//! TTL-backed presence records in the shared store: which broker nodes are
//! alive, and which broker currently holds each device session.
//!
//! A record's existence means "believed live as of its last refresh". TTL
//! expiry is the eviction signal; records are only deleted explicitly on
//! logout or clean shutdown.

use crate::config::LockConfig;
use crate::core::BrokerError;
use crate::core::session::{DeviceType, Identity, Label, Session};
use crate::core::store::script::{COMPARE_AND_DELETE_WITH_INDEX, Script};
use crate::core::store::{KvStore, RespValue, keys};
use bytes::Bytes;
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

lazy_static! {
    static ref REMOVE_SESSION_SCRIPT: Script = Script::new(COMPARE_AND_DELETE_WITH_INDEX);
}

/// Liveness record of one broker node.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BrokerInfo {
    pub addr: String,
    /// Unix milliseconds.
    pub start_at: i64,
}

impl BrokerInfo {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            start_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// What other nodes need to know about a logged-in device session.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub app_id: String,
    pub user_id: u64,
    pub os: String,
    pub device: DeviceType,
    pub label: Label,
    pub broker_addr: String,
    pub conn_id: u64,
    /// Unix milliseconds.
    pub connect_time: i64,
    /// Unix milliseconds.
    pub login_time: i64,
}

impl SessionSnapshot {
    /// Captures a logged-in session; `None` before login.
    pub fn from_session(session: &Session, broker_addr: &str) -> Option<Self> {
        let identity = session.identity()?;
        Some(Self::for_identity(session, &identity, broker_addr))
    }

    /// Describes `session` as it will look once bound to `identity`.
    pub fn for_identity(session: &Session, identity: &Identity, broker_addr: &str) -> Self {
        Self {
            app_id: identity.app_id.clone(),
            user_id: identity.user_id,
            os: identity.os.clone(),
            device: identity.device,
            label: identity.label.clone(),
            broker_addr: broker_addr.to_string(),
            conn_id: session.fd(),
            connect_time: session.connect_time().timestamp_millis(),
            login_time: identity.login_time.timestamp_millis(),
        }
    }

    /// True if this record describes connection `conn_id` on `broker_addr`.
    pub fn is_held_by(&self, broker_addr: &str, conn_id: u64) -> bool {
        self.broker_addr == broker_addr && self.conn_id == conn_id
    }

    fn to_bytes(&self) -> Result<Bytes, BrokerError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }
}

fn require_label(label: &Label) -> Result<(&str, u64), BrokerError> {
    if label.is_empty() {
        return Err(BrokerError::InvalidRequest("empty device label".into()));
    }
    label
        .parts()
        .map(|(app_id, user_id, _)| (app_id, user_id))
        .ok_or_else(|| BrokerError::InvalidRequest(format!("malformed device label '{label}'")))
}

#[derive(Debug, Clone)]
pub struct PresenceRegistry {
    store: Arc<dyn KvStore>,
    session_ttl: Duration,
    broker_ttl: Duration,
    /// Retry budget and backoff for presence writes.
    retry: LockConfig,
}

impl PresenceRegistry {
    pub fn new(store: Arc<dyn KvStore>, session_ttl: Duration, broker_ttl: Duration) -> Self {
        Self {
            store,
            session_ttl,
            broker_ttl,
            retry: LockConfig::default(),
        }
    }

    /// Replaces the retry budget and backoff used for presence writes.
    pub fn with_retry(mut self, retry: LockConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Runs `write`, retrying transient store failures with backoff. The last
    /// error is returned once the retries are exhausted.
    async fn write_with_retry<F, Fut>(&self, what: &str, write: F) -> Result<(), BrokerError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<(), BrokerError>>,
    {
        let mut attempt = 0;
        loop {
            match write().await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt < self.retry.max_retries => {
                    debug!("Writing {} failed (attempt {}): {}", what, attempt + 1, e);
                    tokio::time::sleep(self.retry.backoff(attempt)).await;
                    attempt += 1;
                }
                Err(e) => {
                    if attempt > 0 {
                        warn!("Writing {} failed after {} retries: {}", what, attempt, e);
                    }
                    return Err(e);
                }
            }
        }
    }

    pub fn session_ttl(&self) -> Duration {
        self.session_ttl
    }

    // --- Brokers ---

    /// Writes the liveness record and adds the broker to the roster.
    pub async fn register_broker(&self, info: &BrokerInfo) -> Result<(), BrokerError> {
        let payload = Bytes::from(serde_json::to_vec(info)?);
        let key = keys::broker(&info.addr);
        let roster = [(info.start_at as f64, info.addr.clone())];
        self.write_with_retry(&key, || async {
            self.store
                .set(&key, payload.clone(), Some(self.broker_ttl))
                .await?;
            self.store
                .sorted_set_add(keys::broker_roster(), &roster)
                .await?;
            Ok(())
        })
        .await
    }

    /// Extends the liveness record. Returns false if it already expired, in
    /// which case the broker must register again.
    pub async fn refresh_broker(&self, addr: &str) -> Result<bool, BrokerError> {
        self.store.expire(&keys::broker(addr), self.broker_ttl).await
    }

    pub async fn unregister_broker(&self, addr: &str) -> Result<bool, BrokerError> {
        self.store.delete(&keys::broker(addr)).await
    }

    pub async fn get_broker(&self, addr: &str) -> Result<Option<BrokerInfo>, BrokerError> {
        match self.store.get(&keys::broker(addr)).await? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    /// Every roster entry whose liveness record still exists, oldest first.
    pub async fn list_brokers(&self) -> Result<Vec<BrokerInfo>, BrokerError> {
        let roster = self
            .store
            .sorted_set_range(keys::broker_roster(), 0, -1)
            .await?;
        let mut live = Vec::with_capacity(roster.len());
        for addr in roster {
            if let Some(info) = self.get_broker(&addr).await? {
                live.push(info);
            }
        }
        Ok(live)
    }

    // --- Sessions ---

    /// Writes the presence record for `label`. Last write wins.
    pub async fn store_session(
        &self,
        label: &Label,
        snapshot: &SessionSnapshot,
    ) -> Result<(), BrokerError> {
        let (app_id, _) = require_label(label)?;
        let key = keys::session(app_id, label.as_str());
        let payload = snapshot.to_bytes()?;
        self.write_with_retry(&key, || async {
            self.store
                .set(&key, payload.clone(), Some(self.session_ttl))
                .await
        })
        .await
    }

    /// Extends the presence record and its user's device index without
    /// touching their contents. Returns false if the record already expired.
    pub async fn refresh_session(&self, label: &Label) -> Result<bool, BrokerError> {
        let (app_id, user_id) = require_label(label)?;
        let alive = self
            .store
            .expire(&keys::session(app_id, label.as_str()), self.session_ttl)
            .await?;
        if alive {
            self.store
                .expire(&keys::device_index(app_id, user_id), self.session_ttl)
                .await?;
        }
        Ok(alive)
    }

    pub async fn load_session(&self, label: &Label) -> Result<Option<SessionSnapshot>, BrokerError> {
        let (app_id, _) = require_label(label)?;
        match self
            .store
            .get(&keys::session(app_id, label.as_str()))
            .await?
        {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    /// Records `label` among the live devices of `(app_id, user_id)`.
    pub async fn store_device_index(
        &self,
        app_id: &str,
        user_id: u64,
        label: &Label,
        snapshot: &SessionSnapshot,
    ) -> Result<(), BrokerError> {
        require_label(label)?;
        let key = keys::device_index(app_id, user_id);
        let payload = snapshot.to_bytes()?;
        self.write_with_retry(&key, || async {
            self.store
                .hash_set(&key, label.as_str(), payload.clone())
                .await?;
            self.store.expire(&key, self.session_ttl).await?;
            Ok(())
        })
        .await
    }

    /// The live device sessions of a user. Index entries whose presence record
    /// has expired are pruned along the way.
    pub async fn user_devices(
        &self,
        app_id: &str,
        user_id: u64,
    ) -> Result<Vec<SessionSnapshot>, BrokerError> {
        let key = keys::device_index(app_id, user_id);
        let mut live = Vec::new();
        for (field, _) in self.store.hash_get_all(&key).await? {
            let label = Label::from_raw(field);
            match self.load_session(&label).await {
                Ok(Some(snapshot)) => live.push(snapshot),
                Ok(None) | Err(BrokerError::InvalidRequest(_)) => {
                    debug!("Pruning stale device '{}' from {}", label, key);
                    self.store.hash_delete(&key, label.as_str()).await?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(live)
    }

    /// Deletes the presence record and its index entry, but only while the
    /// record still holds `snapshot`. Returns false if another session has
    /// taken the label over in the meantime.
    pub async fn remove_session(&self, snapshot: &SessionSnapshot) -> Result<bool, BrokerError> {
        let (app_id, user_id) = require_label(&snapshot.label)?;
        let reply = self
            .store
            .eval_atomic(
                &REMOVE_SESSION_SCRIPT,
                &[
                    keys::session(app_id, snapshot.label.as_str()),
                    keys::device_index(app_id, user_id),
                ],
                &[
                    snapshot.to_bytes()?,
                    Bytes::from(snapshot.label.as_str().to_owned()),
                ],
            )
            .await?;
        Ok(matches!(reply, RespValue::Integer(n) if n > 0))
    }
}
