// tests/integration/test_helpers.rs

//! Test helpers and utilities for integration tests

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use spinelchat::config::Config;
use spinelchat::core::BrokerError;
use spinelchat::core::handler::{Dispatcher, Outcome};
use spinelchat::core::presence::SessionSnapshot;
use spinelchat::core::protocol::{
    Body, CommandBody, CommandRequest, Envelope, LoginRequest, LogoutRequest, MessageBody,
};
use spinelchat::core::session::{ConnectionEntry, DeviceType, Label, Session};
use spinelchat::core::state::{Authenticator, BrokerState, LogRelay, Relay, StoreAuthenticator};
use spinelchat::core::store::{KvStore, MemoryStore, keys};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, reload};

/// TestContext provides a broker backed by an in-process store.
pub struct TestContext {
    pub state: Arc<BrokerState>,
    pub store: MemoryStore,
    pub dispatcher: Dispatcher,
}

/// A connection registered with the broker, minus the socket.
pub struct TestConnection {
    pub session: Arc<Session>,
    pub outbound: mpsc::Receiver<Envelope>,
    pub kill: broadcast::Receiver<()>,
}

impl TestConnection {
    /// Every envelope pushed to this connection so far.
    pub fn drain(&mut self) -> Vec<Envelope> {
        let mut pushed = Vec::new();
        while let Ok(envelope) = self.outbound.try_recv() {
            pushed.push(envelope);
        }
        pushed
    }
}

impl TestContext {
    /// Creates a new test context with default configuration
    pub async fn new() -> Self {
        Self::with_config(Config::default()).await
    }

    /// Creates a new test context with custom configuration
    pub async fn with_config(config: Config) -> Self {
        Self::with_collaborators(config, None, Arc::new(LogRelay)).await
    }

    /// Creates a test context with a custom relay and, optionally, a custom
    /// authenticator in place of the store-backed one.
    pub async fn with_collaborators(
        config: Config,
        authenticator: Option<Arc<dyn Authenticator>>,
        relay: Arc<dyn Relay>,
    ) -> Self {
        let env_filter = EnvFilter::new("warn");
        let (filter, _reload_handle) = reload::Layer::new(env_filter);

        // Initialize tracing (ignore error if already initialized)
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_test_writer())
            .try_init();

        let store = MemoryStore::new();
        let shared: Arc<dyn KvStore> = Arc::new(store.clone());
        let authenticator: Arc<dyn Authenticator> = match authenticator {
            Some(authenticator) => authenticator,
            None => Arc::new(StoreAuthenticator::new(shared.clone())),
        };
        let state = Arc::new(BrokerState::with_collaborators(
            Arc::new(config),
            shared,
            authenticator,
            relay,
        ));
        state
            .presence
            .register_broker(&state.broker)
            .await
            .expect("broker registration failed");

        Self {
            dispatcher: Dispatcher::new(state.clone()),
            state,
            store,
        }
    }

    /// Registers a connection the way the connection handler does.
    pub fn connect(&self) -> TestConnection {
        let conn_id = self.state.next_conn_id();
        let addr: SocketAddr = format!("127.0.0.1:{}", 40000 + conn_id)
            .parse()
            .expect("valid address");
        let session = Arc::new(Session::new(conn_id, addr));
        let (outbound_tx, outbound) = mpsc::channel(64);
        let (kill_tx, kill) = broadcast::channel(1);
        self.state.sessions.insert(ConnectionEntry {
            session: session.clone(),
            outbound: outbound_tx,
            kill: kill_tx,
        });
        TestConnection {
            session,
            outbound,
            kill,
        }
    }

    /// Writes the signature record the login service would have written.
    pub async fn seed_signature(&self, app_id: &str, sig: &str, user_id: u64) {
        self.store
            .set(
                &keys::signature(app_id, sig),
                Bytes::from(user_id.to_string()),
                None,
            )
            .await
            .expect("seeding signature failed");
    }

    /// Sends a login command and returns the response envelope.
    pub async fn login(
        &self,
        conn: &TestConnection,
        id: &str,
        app_id: &str,
        sig: &str,
        os: &str,
    ) -> Envelope {
        let request = CommandBody::request(
            id,
            CommandRequest::Login(LoginRequest {
                app_id: app_id.into(),
                sig: sig.into(),
                os: os.into(),
            }),
        );
        let outcome = self
            .dispatcher
            .handle(&conn.session, Envelope::request(request, true))
            .await;
        outcome.reply.expect("login must be answered")
    }

    /// Seeds a signature and logs `conn` in with it.
    pub async fn login_as(&self, conn: &TestConnection, app_id: &str, user_id: u64, os: &str) {
        let sig = format!("sig-{user_id}-{}", conn.session.fd());
        self.seed_signature(app_id, &sig, user_id).await;
        let reply = self.login(conn, "login", app_id, &sig, os).await;
        let Body::Command(body) = reply.body else {
            panic!("expected a command reply, got {:?}", reply);
        };
        assert!(body.is_success(), "login failed: {} {}", body.code, body.message);
    }

    /// Sends a logout command and returns the dispatcher outcome.
    pub async fn logout(&self, conn: &TestConnection, id: &str) -> Outcome {
        let request = CommandBody::request(id, CommandRequest::Logout(LogoutRequest {}));
        self.dispatcher
            .handle(&conn.session, Envelope::request(request, true))
            .await
    }
}

/// A relay that records what it was asked to carry instead of sending it.
#[derive(Debug, Default)]
pub struct RecordingRelay {
    pub forwarded: Mutex<Vec<(SessionSnapshot, Envelope)>>,
    pub kicked: Mutex<Vec<SessionSnapshot>>,
}

#[async_trait]
impl Relay for RecordingRelay {
    async fn forward(
        &self,
        target: &SessionSnapshot,
        envelope: Envelope,
    ) -> Result<(), BrokerError> {
        self.forwarded.lock().push((target.clone(), envelope));
        Ok(())
    }

    async fn forward_group(&self, _message: &MessageBody) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn kick(&self, target: &SessionSnapshot) -> Result<(), BrokerError> {
        self.kicked.lock().push(target.clone());
        Ok(())
    }
}

/// A snapshot of `label` held by connection `conn_id` on another broker.
pub fn remote_snapshot(app_id: &str, user_id: u64, os: &str, conn_id: u64) -> SessionSnapshot {
    let label = Label::new(app_id, user_id, os);
    SessionSnapshot {
        app_id: app_id.into(),
        user_id,
        os: os.into(),
        device: DeviceType::from_os(os).expect("known os"),
        label,
        broker_addr: REMOTE_BROKER.into(),
        conn_id,
        connect_time: 0,
        login_time: 0,
    }
}

pub const REMOTE_BROKER: &str = "10.0.0.2:8090";
