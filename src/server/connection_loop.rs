// src/server/connection_loop.rs

//! Contains the main server loop for accepting connections and handling graceful shutdown.

use super::ClientStream;
use super::context::ServerContext;
use crate::config::Config;
use crate::connection::ConnectionHandler;
use crate::core::metrics;
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinSet;
use tokio_util::either::Either;
use tracing::{error, info, warn};
use tracing_subscriber::filter::EnvFilter;

const SHUTDOWN_REASON: &str = "broker shutting down";

/// The main server loop that accepts connections and handles graceful shutdown.
pub async fn run(mut ctx: ServerContext) {
    let mut client_tasks = JoinSet::new();

    let (mut sigint, mut sigterm, mut sighup) = match (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
        signal(SignalKind::hangup()),
    ) {
        (Ok(i), Ok(t), Ok(h)) => (i, t, h),
        (i, t, h) => {
            let err = i.err().or(t.err()).or(h.err());
            error!("Failed to register signal handlers: {:?}", err);
            return;
        }
    };

    loop {
        tokio::select! {
            biased;

            _ = sigint.recv() => {
                info!("SIGINT received, initiating graceful shutdown.");
                break;
            }
            _ = sigterm.recv() => {
                info!("SIGTERM received, initiating graceful shutdown.");
                break;
            }
            _ = sighup.recv() => {
                reload_log_level(&ctx);
            }

            Some(res) = ctx.background_tasks.join_next() => {
                match res {
                    Ok(Ok(())) => warn!("A background task finished unexpectedly without an error."),
                    Ok(Err(e)) => { error!("CRITICAL: Background task failed: {}. Shutting down.", e); break; }
                    Err(e) => { error!("CRITICAL: Background task panicked: {e:?}. Shutting down."); break; }
                }
            },

            res = ctx.listener.accept() => {
                let (socket, addr) = match res {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        continue;
                    }
                };
                metrics::CONNECTIONS_RECEIVED_TOTAL.inc();
                let Ok(permit) = ctx.connection_permits.clone().try_acquire_owned() else {
                    warn!("Rejecting connection from {}: max_clients reached.", addr);
                    continue;
                };
                if let Err(e) = socket.set_nodelay(true) {
                    warn!("Failed to set TCP_NODELAY for {}: {}", addr, e);
                }
                info!("Accepted new connection from: {}", addr);
                metrics::CONNECTED_CLIENTS.inc();

                let conn_id = ctx.state.next_conn_id();
                let state = ctx.state.clone();
                let shutdown_rx = ctx.shutdown_tx.subscribe();
                let acceptor = ctx.acceptor.clone();

                client_tasks.spawn(async move {
                    let _permit = permit;
                    let stream: ClientStream = match acceptor {
                        Some(acceptor) => match acceptor.accept(socket).await {
                            Ok(tls_stream) => {
                                info!("TLS handshake successful for {addr}");
                                Either::Right(tls_stream)
                            }
                            Err(e) => {
                                warn!("TLS handshake error for {addr}: {e}");
                                metrics::CONNECTED_CLIENTS.dec();
                                return;
                            }
                        },
                        None => Either::Left(socket),
                    };
                    let mut handler = ConnectionHandler::new(stream, addr, state, conn_id, shutdown_rx);
                    if let Err(e) = handler.run().await {
                        warn!("Connection from {} terminated unexpectedly: {}", addr, e);
                    }
                });
            },

            Some(res) = client_tasks.join_next() => {
                if let Err(e) = res
                    && e.is_panic()
                {
                    error!("A client handler panicked: {e:?}");
                }
            },
        }
    }

    info!("Shutting down. Closing all sessions.");
    let closed = ctx.state.close_all(SHUTDOWN_REASON).await;
    info!("Closed {} session(s).", closed);

    if ctx.shutdown_tx.send(()).is_err() {
        error!("Failed to send shutdown signal. Some tasks may not terminate gracefully.");
    }

    if tokio::time::timeout(Duration::from_secs(5), async {
        while client_tasks.join_next().await.is_some() {}
    })
    .await
    .is_err()
    {
        warn!("Timed out waiting for connections to drain; aborting them.");
        client_tasks.shutdown().await;
    }
    info!("All client connections closed.");

    match ctx.state.presence.unregister_broker(&ctx.state.broker.addr).await {
        Ok(_) => info!("Unregistered broker {}.", ctx.state.broker.addr),
        Err(e) => warn!("Failed to unregister broker {}: {}", ctx.state.broker.addr, e),
    }

    info!("Waiting for background tasks to finish...");
    if tokio::time::timeout(Duration::from_secs(10), async {
        while ctx.background_tasks.join_next().await.is_some() {}
    })
    .await
    .is_err()
    {
        warn!("Timed out waiting for background tasks to finish cleanly.");
    };
    info!("Broker shutdown complete.");
}

/// Re-reads `log_level` from the configuration file and applies it. `RUST_LOG`
/// still takes precedence when set.
fn reload_log_level(ctx: &ServerContext) {
    if std::env::var("RUST_LOG").is_ok() {
        info!("SIGHUP received; RUST_LOG is set, keeping the current log filter.");
        return;
    }
    let Some(path) = ctx.config_path.as_deref() else {
        info!("SIGHUP received; no configuration file to reload.");
        return;
    };
    let level = match Config::from_file(path) {
        Ok(config) => config.log_level,
        Err(e) => {
            warn!("SIGHUP received but '{}' could not be reloaded: {:#}", path, e);
            return;
        }
    };
    match EnvFilter::try_new(&level) {
        Ok(filter) => match ctx.log_reload_handle.reload(filter) {
            Ok(()) => info!("SIGHUP received; log level set to '{}'.", level),
            Err(e) => warn!("Failed to apply log level '{}': {}", level, e),
        },
        Err(e) => warn!("Invalid log level '{}': {}", level, e),
    }
}
