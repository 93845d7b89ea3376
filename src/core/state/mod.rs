// src/core/state/mod.rs

//! Defines `BrokerState`, the context object through which every shared
//! service is injected: configuration, store, presence registry, locks,
//! sequences, local sessions and the external collaborators.

mod collaborators;

pub use collaborators::{Authenticator, LogRelay, Relay, StoreAuthenticator};

use crate::config::Config;
use crate::core::BrokerError;
use crate::core::lock::DistributedLock;
use crate::core::metrics;
use crate::core::presence::{BrokerInfo, PresenceRegistry, SessionSnapshot};
use crate::core::protocol::{Envelope, Event, EventBody, MessageBody, PresenceChange};
use crate::core::sequence::SequenceAllocator;
use crate::core::session::{Label, Session, SessionRegistry};
use crate::core::store::KvStore;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// Delivery route, used as the metrics label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display, strum_macros::IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum Route {
    Local,
    Relay,
    Dropped,
}

#[derive(Debug)]
pub struct BrokerState {
    pub config: Arc<Config>,
    pub broker: BrokerInfo,
    pub store: Arc<dyn KvStore>,
    pub presence: PresenceRegistry,
    pub locks: DistributedLock,
    pub sequences: SequenceAllocator,
    pub sessions: SessionRegistry,
    pub authenticator: Arc<dyn Authenticator>,
    pub relay: Arc<dyn Relay>,
    next_conn_id: AtomicU64,
}

impl BrokerState {
    /// Builds the state with the store-backed authenticator and no relay.
    pub fn new(config: Arc<Config>, store: Arc<dyn KvStore>) -> Self {
        let authenticator = Arc::new(StoreAuthenticator::new(Arc::clone(&store)));
        Self::with_collaborators(config, store, authenticator, Arc::new(LogRelay))
    }

    pub fn with_collaborators(
        config: Arc<Config>,
        store: Arc<dyn KvStore>,
        authenticator: Arc<dyn Authenticator>,
        relay: Arc<dyn Relay>,
    ) -> Self {
        let broker = BrokerInfo::new(config.advertise_addr());
        let presence = PresenceRegistry::new(
            Arc::clone(&store),
            config.session.presence_ttl,
            config.broker.ttl,
        )
        .with_retry(config.lock.clone());
        let locks = DistributedLock::new(Arc::clone(&store), config.lock.clone());
        let sequences =
            SequenceAllocator::new(Arc::clone(&store), locks.clone(), config.sequence.batch_size);
        Self {
            config,
            broker,
            store,
            presence,
            locks,
            sequences,
            sessions: SessionRegistry::new(),
            authenticator,
            relay,
            next_conn_id: AtomicU64::new(1),
        }
    }

    /// Allocates a broker-local connection id.
    pub fn next_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Closes `session`: evicts its presence record, tells the user's other
    /// devices, drops it from the local registry and stops its I/O task.
    /// Only the first call for a session does anything; it returns true.
    pub async fn close_session(&self, session: &Arc<Session>, reason: &str) -> bool {
        if !session.begin_close(reason) {
            return false;
        }
        info!("Closing session {} ({}): {}", session.fd(), session.addr(), reason);

        if let Some(snapshot) = SessionSnapshot::from_session(session, &self.broker.addr) {
            match self.presence.remove_session(&snapshot).await {
                Ok(true) => debug!("Evicted presence of {}", snapshot.label),
                Ok(false) => debug!(
                    "Presence of {} already taken over or expired",
                    snapshot.label
                ),
                Err(e) => warn!("Failed to evict presence of {}: {}", snapshot.label, e),
            }
            let event = Event::UserLogout(self.presence_change(&snapshot));
            self.notify_user(&snapshot.app_id, snapshot.user_id, event, Some(&snapshot.label))
                .await;
            if session.is_login() {
                metrics::LOGGED_IN_SESSIONS.dec();
            }
        }

        if let Some(entry) = self.sessions.remove(session.fd()) {
            let _ = entry.kill.send(());
        }
        session.finish_close();
        true
    }

    /// Routes a message to every live device of its recipient. Group messages
    /// go to the relay. This is also the entry point for messages consumed
    /// from the external queue. Returns the number of devices reached.
    pub async fn deliver(&self, message: &MessageBody) -> Result<usize, BrokerError> {
        if message.group_id != 0 && message.to == 0 {
            let forwarded = self.relay.forward_group(message).await;
            let route = if forwarded.is_ok() {
                Route::Relay
            } else {
                Route::Dropped
            };
            metrics::DELIVERIES_TOTAL
                .with_label_values(&[<&str>::from(route)])
                .inc();
            forwarded?;
            return Ok(0);
        }
        let envelope = Envelope::request(message.clone(), false);
        self.route(&message.app_id, message.to, envelope, None).await
    }

    /// Pushes a one-way event to every live device of `(app_id, user_id)`
    /// except `exclude`. Failures are logged, never returned.
    pub async fn notify_user(
        &self,
        app_id: &str,
        user_id: u64,
        event: Event,
        exclude: Option<&Label>,
    ) -> usize {
        let envelope = EventBody::new(uuid::Uuid::new_v4().to_string(), event).notify();
        match self.route(app_id, user_id, envelope, exclude).await {
            Ok(n) => n,
            Err(e) => {
                warn!("Failed to notify {}/{}: {}", app_id, user_id, e);
                0
            }
        }
    }

    /// Sends `envelope` to each live device of a user: directly when the
    /// session is on this node, through the relay otherwise.
    pub async fn route(
        &self,
        app_id: &str,
        user_id: u64,
        envelope: Envelope,
        exclude: Option<&Label>,
    ) -> Result<usize, BrokerError> {
        let targets = self.presence.user_devices(app_id, user_id).await?;
        let mut reached = 0;
        for target in targets {
            if exclude.is_some_and(|l| *l == target.label) {
                continue;
            }
            let route = if target.broker_addr == self.broker.addr {
                match self.sessions.get(target.conn_id) {
                    Some(entry) if entry.push(envelope.clone()) => Route::Local,
                    _ => Route::Dropped,
                }
            } else {
                match self.relay.forward(&target, envelope.clone()).await {
                    Ok(()) => Route::Relay,
                    Err(e) => {
                        warn!("Relay to {} failed: {}", target.broker_addr, e);
                        Route::Dropped
                    }
                }
            };
            metrics::DELIVERIES_TOTAL
                .with_label_values(&[<&str>::from(route)])
                .inc();
            if route != Route::Dropped {
                reached += 1;
            }
        }
        Ok(reached)
    }

    pub fn presence_change(&self, snapshot: &SessionSnapshot) -> PresenceChange {
        PresenceChange {
            app_id: snapshot.app_id.clone(),
            user_id: snapshot.user_id,
            label: snapshot.label.to_string(),
            broker: snapshot.broker_addr.clone(),
            at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Closes every local session; used on shutdown.
    pub async fn close_all(&self, reason: &str) -> usize {
        let mut closed = 0;
        for session in self.sessions.sessions() {
            if self.close_session(&session, reason).await {
                closed += 1;
            }
        }
        closed
    }
}
