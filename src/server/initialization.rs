// src/server/initialization.rs

//! Handles the complete server initialization process: opening the store,
//! building the broker state, registering this node and binding the listener.

use super::context::{LogReloadHandle, ServerContext};
use crate::config::{Config, StoreBackend};
use crate::core::state::BrokerState;
use crate::core::store::{self, KvStore, MemoryStore};
use anyhow::{Context, Result, anyhow};
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{Semaphore, broadcast};
use tokio::task::JoinSet;
use tokio_rustls::{TlsAcceptor, rustls};
use tracing::{info, warn};

/// Initializes all server components before starting the main loop.
pub async fn setup(
    config: Config,
    config_path: Option<String>,
    log_reload_handle: LogReloadHandle,
) -> Result<ServerContext> {
    log_startup_info(&config);
    let (shutdown_tx, _) = broadcast::channel(1);

    let acceptor = setup_tls(&config)?;
    let (store, memory_store) = open_store(&config).await?;

    let config = Arc::new(config);
    let state = Arc::new(BrokerState::new(Arc::clone(&config), store));
    info!("Broker state initialized.");

    state
        .presence
        .register_broker(&state.broker)
        .await
        .with_context(|| format!("Failed to register broker {}", state.broker.addr))?;
    info!("Registered broker {} in the roster.", state.broker.addr);

    let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
    info!(
        "SpinelChat broker listening on {}:{}",
        config.host, config.port
    );
    let connection_permits = Arc::new(Semaphore::new(config.max_clients));

    Ok(ServerContext {
        state,
        memory_store,
        listener,
        shutdown_tx,
        background_tasks: JoinSet::new(),
        acceptor,
        connection_permits,
        config_path,
        log_reload_handle,
    })
}

/// Opens the configured store. The in-process store is also returned by
/// value so its expiry task can be spawned.
async fn open_store(config: &Config) -> Result<(Arc<dyn KvStore>, Option<MemoryStore>)> {
    match config.store.backend {
        StoreBackend::Memory => {
            warn!("Using the in-process store; presence is not shared with other brokers.");
            let memory = MemoryStore::with_script_timeout(config.store.script_timeout);
            Ok((Arc::new(memory.clone()), Some(memory)))
        }
        StoreBackend::Resp => {
            let store = store::open_store(&config.store)
                .await
                .with_context(|| format!("Failed to reach store at {}", config.store.addr))?;
            info!("Connected to store at {}.", config.store.addr);
            Ok((store, None))
        }
    }
}

/// Sets up the TLS acceptor if TLS is enabled in the configuration.
fn setup_tls(config: &Config) -> Result<Option<TlsAcceptor>> {
    if config.tls.enabled {
        info!("TLS is enabled. Loading certificate and key.");
        let certs = load_certs(&config.tls.cert_path)?;
        let key = load_key(&config.tls.key_path)?;
        let server_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)?;
        Ok(Some(TlsAcceptor::from(Arc::new(server_config))))
    } else {
        Ok(None)
    }
}

/// Loads TLS certificates from a PEM file.
fn load_certs(path: &str) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let cert_file = File::open(path)
        .map_err(|e| anyhow!("Failed to open certificate file '{}': {}", path, e))?;
    let mut cert_reader = BufReader::new(cert_file);
    let certs = rustls_pemfile::certs(&mut cert_reader).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(anyhow!("No certificates found in '{}'", path));
    }
    Ok(certs)
}

/// Loads a private key from a PEM file.
fn load_key(path: &str) -> Result<rustls::pki_types::PrivateKeyDer<'static>> {
    let key_file = File::open(path)
        .map_err(|e| anyhow!("Failed to open private key file '{}': {}", path, e))?;
    let mut key_reader = BufReader::new(key_file);
    rustls_pemfile::private_key(&mut key_reader)?
        .ok_or_else(|| anyhow!("No private key found in key file '{}'", path))
}

/// Logs key configuration parameters at startup.
fn log_startup_info(config: &Config) {
    info!(
        "Advertising as {} (liveness TTL {:?}, refreshed every {:?}).",
        config.advertise_addr(),
        config.broker.ttl,
        config.broker.refresh_interval
    );
    info!(
        "Heartbeat timeout {:?}, presence TTL {:?}, wire format {:?}.",
        config.session.heartbeat_timeout, config.session.presence_ttl, config.protocol.format
    );
    info!("Accepting at most {} clients.", config.max_clients);
}
