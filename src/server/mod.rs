// src/server/mod.rs

use crate::config::Config;
use anyhow::Result;
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tokio_util::either::Either;

mod connection_loop;
mod context;
mod initialization;
mod metrics_server;
mod spawner;

pub use context::{LogReloadHandle, ServerContext};

/// A client socket, either plain TCP or TLS over TCP.
pub type ClientStream = Either<TcpStream, TlsStream<TcpStream>>;

/// The main server startup function, orchestrating all setup phases.
pub async fn run(
    config: Config,
    config_path: Option<String>,
    log_reload_handle: LogReloadHandle,
) -> Result<()> {
    // 1. Open the store, build the broker state, bind the listener.
    let mut server_context = initialization::setup(config, config_path, log_reload_handle).await?;

    // 2. Spawn all background tasks.
    spawner::spawn_all(&mut server_context);

    // 3. Accept connections until shutdown.
    connection_loop::run(server_context).await;

    Ok(())
}
