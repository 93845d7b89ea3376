// src/core/tasks/store_purger.rs

use crate::core::metrics;
use crate::core::store::MemoryStore;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Actively expires keys of the in-process store, so that records nobody
/// reads again still release their memory.
pub struct StorePurgerTask {
    store: MemoryStore,
    interval: Duration,
}

impl StorePurgerTask {
    pub fn new(store: MemoryStore, interval: Duration) -> Self {
        Self { store, interval }
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!("Store purger task started.");
        let mut interval = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let purged = self.store.purge_expired();
                    if purged > 0 {
                        metrics::EXPIRED_KEYS_TOTAL.inc_by(purged as f64);
                        debug!("Purged {} expired keys.", purged);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Store purger task shutting down.");
                    return;
                }
            }
        }
    }
}
