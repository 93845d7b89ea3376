// src/core/tasks/heartbeat_sweeper.rs

use crate::core::BrokerError;
use crate::core::metrics;
use crate::core::state::BrokerState;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Periodically closes every session whose last heartbeat is older than the
/// configured timeout.
pub struct HeartbeatSweeperTask {
    state: Arc<BrokerState>,
}

impl HeartbeatSweeperTask {
    pub fn new(state: Arc<BrokerState>) -> Self {
        Self { state }
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let period = self.state.config.session.sweep_interval;
        info!("Heartbeat sweeper task started (every {:?}).", period);
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let closed = self.sweep_once().await;
                    if closed > 0 {
                        debug!("Heartbeat sweep closed {} session(s).", closed);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Heartbeat sweeper task shutting down.");
                    return;
                }
            }
        }
    }

    /// Runs one sweep and returns how many sessions it closed.
    pub async fn sweep_once(&self) -> usize {
        let timeout = self.state.config.session.heartbeat_timeout;
        let mut closed = 0;
        for session in self.state.sessions.sessions() {
            if session.is_closed() || session.idle_for() <= timeout {
                continue;
            }
            let reason = BrokerError::HeartbeatTimeout(timeout).to_string();
            if self.state.close_session(&session, &reason).await {
                metrics::HEARTBEAT_TIMEOUTS_TOTAL.inc();
                info!("Session {} ({}) timed out.", session.fd(), session.addr());
                closed += 1;
            }
        }
        closed
    }
}
