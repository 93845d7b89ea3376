// src/server/context.rs

use crate::core::state::BrokerState;
use crate::core::store::MemoryStore;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{Semaphore, broadcast};
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tracing_subscriber::{filter::EnvFilter, reload};

pub type LogReloadHandle = Arc<reload::Handle<EnvFilter, tracing_subscriber::Registry>>;

/// Holds all the initialized state required to run the server's main loop.
pub struct ServerContext {
    pub state: Arc<BrokerState>,
    /// Set when the broker runs on the in-process store, which needs its own
    /// expiry task.
    pub memory_store: Option<MemoryStore>,
    pub listener: TcpListener,
    pub shutdown_tx: broadcast::Sender<()>,
    pub background_tasks: JoinSet<Result<(), anyhow::Error>>,
    pub acceptor: Option<TlsAcceptor>,
    pub connection_permits: Arc<Semaphore>,
    /// Where the configuration came from; re-read for `log_level` on SIGHUP.
    pub config_path: Option<String>,
    pub log_reload_handle: LogReloadHandle,
}
