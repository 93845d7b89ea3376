// src/connection/guard.rs

//! Defines `ConnectionGuard`, an RAII guard for connection resource management.

use crate::core::metrics;
use crate::core::session::Session;
use crate::core::state::BrokerState;
use std::sync::Arc;
use tracing::debug;

/// Reason recorded on sessions whose socket went away under them.
pub const DISCONNECTED_REASON: &str = "connection closed";

/// Ensures a connection's session is closed and its slot released however the
/// connection handler's scope is exited, including on error or panic.
pub struct ConnectionGuard {
    state: Arc<BrokerState>,
    session: Arc<Session>,
}

impl ConnectionGuard {
    pub(crate) fn new(state: Arc<BrokerState>, session: Arc<Session>) -> Self {
        Self { state, session }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        metrics::CONNECTED_CLIENTS.dec();
        debug!(
            "ConnectionGuard dropping, cleaning up connection {} ({})",
            self.session.fd(),
            self.session.addr()
        );

        if self.session.is_closed() {
            // Whoever closed it also evicted it; only the local slot may remain.
            self.state.sessions.remove(self.session.fd());
            return;
        }

        // Presence eviction needs the store, so it runs on the runtime.
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let state = Arc::clone(&self.state);
                let session = Arc::clone(&self.session);
                handle.spawn(async move {
                    state.close_session(&session, DISCONNECTED_REASON).await;
                });
            }
            Err(_) => {
                let _ = self.session.begin_close(DISCONNECTED_REASON);
                self.state.sessions.remove(self.session.fd());
                self.session.finish_close();
            }
        }
    }
}
