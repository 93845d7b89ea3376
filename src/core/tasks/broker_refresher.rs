// src/core/tasks/broker_refresher.rs

use crate::core::state::BrokerState;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Keeps this node's liveness record alive for as long as the node runs.
pub struct BrokerRefresherTask {
    state: Arc<BrokerState>,
}

impl BrokerRefresherTask {
    pub fn new(state: Arc<BrokerState>) -> Self {
        Self { state }
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let period = self.state.config.broker.refresh_interval;
        info!("Broker refresher task started (every {:?}).", period);
        let mut interval = tokio::time::interval(period);
        // The first tick fires immediately; registration already happened.
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.refresh_once().await;
                }
                _ = shutdown_rx.recv() => {
                    info!("Broker refresher task shutting down.");
                    return;
                }
            }
        }
    }

    /// Extends the liveness record, registering again if it already expired.
    pub async fn refresh_once(&self) {
        let presence = &self.state.presence;
        let info = &self.state.broker;
        match presence.refresh_broker(&info.addr).await {
            Ok(true) => debug!("Refreshed liveness of broker {}", info.addr),
            Ok(false) => {
                warn!("Liveness record of broker {} expired; registering again", info.addr);
                if let Err(e) = presence.register_broker(info).await {
                    warn!("Failed to re-register broker {}: {}", info.addr, e);
                }
            }
            Err(e) => warn!("Failed to refresh broker {}: {}", info.addr, e),
        }
    }
}
