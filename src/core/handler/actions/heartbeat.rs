// src/core/handler/actions/heartbeat.rs

use super::command::REPLACED_REASON;
use crate::core::BrokerError;
use crate::core::presence::SessionSnapshot;
use crate::core::protocol::{CommandBody, Envelope, HeartbeatBody};
use crate::core::session::{Identity, Session};
use crate::core::state::BrokerState;
use crate::core::store::keys;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Records the heartbeat, extends the session's presence when logged in and
/// echoes the heartbeat. A presence failure is reported as a `Heartbeat` error
/// in a command response, since heartbeats carry no correlation id.
pub async fn handle(state: &BrokerState, session: &Arc<Session>, body: HeartbeatBody) -> Envelope {
    session.touch();
    match refresh_presence(state, session).await {
        Ok(()) => body.wrap(),
        Err(e) => {
            warn!("Heartbeat of session {} failed: {}", session.fd(), e);
            CommandBody::failure(String::new(), &BrokerError::Heartbeat(e.to_string())).wrap()
        }
    }
}

async fn refresh_presence(state: &BrokerState, session: &Arc<Session>) -> Result<(), BrokerError> {
    if !session.is_login() {
        return Ok(());
    }
    let Some(identity) = session.identity() else {
        return Ok(());
    };
    if state.presence.refresh_session(&identity.label).await? {
        return Ok(());
    }

    // The record expired between two heartbeats. Publishing it again changes
    // the label's holder, so it goes through the label lock like a login.
    debug!(
        "Presence of {} expired before refresh, writing it again",
        identity.label
    );
    let guard = state
        .locks
        .lock(&keys::label_lock(&identity.app_id, identity.label.as_str()))
        .await?;
    let restored = restore_presence(state, session, &identity).await;
    if let Err(e) = guard.release().await {
        warn!("Failed to release presence lock for {}: {}", identity.label, e);
    }

    if !restored? {
        state.close_session(session, REPLACED_REASON).await;
    }
    Ok(())
}

/// Runs under the label lock. Writes the record back unless another session
/// took the label over while it was absent; returns false in that case.
async fn restore_presence(
    state: &BrokerState,
    session: &Arc<Session>,
    identity: &Identity,
) -> Result<bool, BrokerError> {
    if let Some(current) = state.presence.load_session(&identity.label).await?
        && !current.is_held_by(&state.broker.addr, session.fd())
    {
        info!(
            "Label {} now held by {} on {}, not restoring session {}",
            identity.label,
            current.conn_id,
            current.broker_addr,
            session.fd()
        );
        return Ok(false);
    }

    let snapshot = SessionSnapshot::for_identity(session, identity, &state.broker.addr);
    state
        .presence
        .store_session(&identity.label, &snapshot)
        .await?;
    state
        .presence
        .store_device_index(&identity.app_id, identity.user_id, &identity.label, &snapshot)
        .await?;
    Ok(true)
}
