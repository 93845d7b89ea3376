// src/core/state/collaborators.rs

//! Seams to the systems the broker consumes but does not implement: signature
//! verification and cross-node delivery.

use crate::core::BrokerError;
use crate::core::presence::SessionSnapshot;
use crate::core::protocol::{Envelope, MessageBody};
use crate::core::store::{KvStore, keys};
use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::Arc;
use tracing::debug;

/// Resolves a login signature to a user id.
#[async_trait]
pub trait Authenticator: Send + Sync + Debug {
    /// Returns the user id the signature belongs to, or `SessionNotFound` if
    /// the signature is unknown.
    async fn authenticate(&self, app_id: &str, sig: &str) -> Result<u64, BrokerError>;
}

/// Looks signatures up in the shared store, where the login service writes
/// them as `im:<appId>:user:sig:<signature> -> userId`.
#[derive(Debug, Clone)]
pub struct StoreAuthenticator {
    store: Arc<dyn KvStore>,
}

impl StoreAuthenticator {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Authenticator for StoreAuthenticator {
    async fn authenticate(&self, app_id: &str, sig: &str) -> Result<u64, BrokerError> {
        if app_id.is_empty() || sig.is_empty() {
            return Err(BrokerError::SessionNotFound);
        }
        let Some(raw) = self.store.get(&keys::signature(app_id, sig)).await? else {
            return Err(BrokerError::SessionNotFound);
        };
        match std::str::from_utf8(&raw)?.trim().parse::<u64>() {
            Ok(user_id) if user_id != 0 => Ok(user_id),
            _ => Err(BrokerError::SessionNotFound),
        }
    }
}

/// Carries traffic to sessions held by other broker nodes.
#[async_trait]
pub trait Relay: Send + Sync + Debug {
    /// Delivers `envelope` to the session described by `target`.
    async fn forward(&self, target: &SessionSnapshot, envelope: Envelope)
    -> Result<(), BrokerError>;

    /// Hands a group message to the fan-out service.
    async fn forward_group(&self, message: &MessageBody) -> Result<(), BrokerError>;

    /// Asks the node holding `target` to close it; its label was taken over.
    async fn kick(&self, target: &SessionSnapshot) -> Result<(), BrokerError>;
}

/// A relay for single-node deployments. Remote traffic cannot be carried, so
/// every call is refused with `NoHandlerSupport` and callers count it as
/// dropped.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogRelay;

fn no_relay() -> BrokerError {
    BrokerError::NoHandlerSupport("no relay configured".into())
}

#[async_trait]
impl Relay for LogRelay {
    async fn forward(
        &self,
        target: &SessionSnapshot,
        envelope: Envelope,
    ) -> Result<(), BrokerError> {
        debug!(
            "No relay configured; dropping {} frame for {} on {}",
            envelope.kind, target.label, target.broker_addr
        );
        Err(no_relay())
    }

    async fn forward_group(&self, message: &MessageBody) -> Result<(), BrokerError> {
        debug!(
            "No relay configured; dropping group message {} for group {}",
            message.id, message.group_id
        );
        Err(no_relay())
    }

    async fn kick(&self, target: &SessionSnapshot) -> Result<(), BrokerError> {
        debug!(
            "No relay configured; cannot kick {} on {}",
            target.label, target.broker_addr
        );
        Err(no_relay())
    }
}
