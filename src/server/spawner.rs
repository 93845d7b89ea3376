// src/server/spawner.rs

//! Spawns all of the broker's long-running background tasks.

use super::context::ServerContext;
use super::metrics_server;
use crate::core::tasks::{
    broker_refresher::BrokerRefresherTask, heartbeat_sweeper::HeartbeatSweeperTask,
    store_purger::StorePurgerTask,
};
use tracing::info;

/// Spawns all background tasks into the context's JoinSet.
pub fn spawn_all(ctx: &mut ServerContext) {
    let state = &ctx.state;
    let shutdown_tx = &ctx.shutdown_tx;
    let background_tasks = &mut ctx.background_tasks;

    // --- Metrics Server ---
    if state.config.metrics.enabled {
        let port = state.config.metrics.port;
        let shutdown_rx_metrics = shutdown_tx.subscribe();
        background_tasks.spawn(async move {
            metrics_server::run_metrics_server(port, shutdown_rx_metrics).await
        });
    } else {
        info!("Prometheus metrics server is disabled in the configuration.");
    }

    // --- Presence Maintenance ---
    let refresher = BrokerRefresherTask::new(state.clone());
    let shutdown_rx_refresh = shutdown_tx.subscribe();
    background_tasks.spawn(async move {
        refresher.run(shutdown_rx_refresh).await;
        Ok(())
    });

    let sweeper = HeartbeatSweeperTask::new(state.clone());
    let shutdown_rx_sweep = shutdown_tx.subscribe();
    background_tasks.spawn(async move {
        sweeper.run(shutdown_rx_sweep).await;
        Ok(())
    });

    // --- Store Maintenance ---
    if let Some(memory_store) = ctx.memory_store.clone() {
        let purger = StorePurgerTask::new(memory_store, state.config.store.purge_interval);
        let shutdown_rx_purge = shutdown_tx.subscribe();
        background_tasks.spawn(async move {
            purger.run(shutdown_rx_purge).await;
            Ok(())
        });
    }

    info!("All background tasks have been spawned.");
}
