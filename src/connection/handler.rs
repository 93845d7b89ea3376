// src/connection/handler.rs

//! Defines the `ConnectionHandler` which manages the full lifecycle of a client connection.

use super::guard::{ConnectionGuard, DISCONNECTED_REASON};
use crate::core::BrokerError;
use crate::core::handler::Dispatcher;
use crate::core::metrics;
use crate::core::protocol::{Envelope, EnvelopeCodec};
use crate::core::session::{ConnectionEntry, Session};
use crate::core::state::BrokerState;
use crate::server::ClientStream;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

/// Manages the full lifecycle of a client connection.
pub struct ConnectionHandler {
    framed: Framed<ClientStream, EnvelopeCodec>,
    state: Arc<BrokerState>,
    dispatcher: Dispatcher,
    session: Arc<Session>,
    /// Envelopes pushed to this connection by other sessions or the broker.
    outbound_rx: mpsc::Receiver<Envelope>,
    /// Fired when the session is closed from outside this task.
    kill_rx: broadcast::Receiver<()>,
    shutdown_rx: broadcast::Receiver<()>,
}

impl ConnectionHandler {
    /// Creates the handler and registers the connection with the broker.
    pub fn new(
        socket: ClientStream,
        addr: SocketAddr,
        state: Arc<BrokerState>,
        conn_id: u64,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        let codec = EnvelopeCodec::new(
            state.config.protocol.format,
            state.config.protocol.max_frame_size,
        );
        let session = Arc::new(Session::new(conn_id, addr));
        let (outbound_tx, outbound_rx) = mpsc::channel(state.config.session.outbound_buffer);
        let (kill_tx, kill_rx) = broadcast::channel(1);
        state.sessions.insert(ConnectionEntry {
            session: Arc::clone(&session),
            outbound: outbound_tx,
            kill: kill_tx,
        });

        Self {
            framed: Framed::new(socket, codec),
            dispatcher: Dispatcher::new(Arc::clone(&state)),
            state,
            session,
            outbound_rx,
            kill_rx,
            shutdown_rx,
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// The main event loop for the connection, handling incoming frames, pushed
    /// frames and signals.
    pub async fn run(&mut self) -> Result<(), BrokerError> {
        let _guard = ConnectionGuard::new(Arc::clone(&self.state), Arc::clone(&self.session));
        let conn_id = self.session.fd();

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown_rx.recv() => {
                    info!("Connection {} received shutdown signal.", conn_id);
                    break;
                }
                _ = self.kill_rx.recv() => {
                    debug!("Connection {} was closed by the broker.", conn_id);
                    self.flush_outbound().await?;
                    break;
                }
                Some(envelope) = self.outbound_rx.recv() => {
                    self.framed.send(envelope).await?;
                }
                result = self.framed.next() => {
                    match result {
                        Some(Ok(Ok(envelope))) => {
                            let outcome = self.dispatcher.handle(&self.session, envelope).await;
                            if let Some(reply) = outcome.reply {
                                self.framed.send(reply).await?;
                            }
                            if let Some(reason) = outcome.close {
                                self.state.close_session(&self.session, &reason).await;
                                self.flush_outbound().await?;
                                break;
                            }
                        }
                        Some(Ok(Err(e))) => {
                            metrics::DECODE_ERRORS_TOTAL.inc();
                            debug!("Connection {}: undecodable frame: {}", conn_id, e);
                            self.framed.send(Dispatcher::decode_failure(&e)).await?;
                        }
                        Some(Err(e)) => {
                            if is_normal_disconnect(&e) {
                                debug!("Connection {} closed by peer: {}", conn_id, e);
                            } else {
                                warn!("Connection error for {}: {}", conn_id, e);
                            }
                            break;
                        }
                        None => {
                            debug!("Connection {} closed by peer.", conn_id);
                            break;
                        }
                    }
                }
            }
        }

        self.state
            .close_session(&self.session, DISCONNECTED_REASON)
            .await;
        Ok(())
    }

    /// Writes whatever was queued for this connection before it was closed.
    async fn flush_outbound(&mut self) -> Result<(), BrokerError> {
        while let Ok(envelope) = self.outbound_rx.try_recv() {
            self.framed.feed(envelope).await?;
        }
        self.framed.flush().await
    }
}

/// Helper function to check for non-critical disconnection errors.
fn is_normal_disconnect(e: &BrokerError) -> bool {
    matches!(e, BrokerError::Io(arc_err) if matches!(
        arc_err.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionAborted
    ))
}
