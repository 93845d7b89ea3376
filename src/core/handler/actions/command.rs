// src/core/handler/actions/command.rs

//! Login and logout. Login binds an authenticated identity to the session and
//! takes over the device label from whichever session held it before.

use super::require_login;
use crate::core::BrokerError;
use crate::core::presence::SessionSnapshot;
use crate::core::protocol::{
    CommandBody, CommandPayload, CommandReply, CommandRequest, Envelope, Event, EventBody,
    LoginReply, LoginRequest, LogoutReply,
};
use crate::core::session::{DeviceType, Identity, Label, Session};
use crate::core::state::BrokerState;
use crate::core::store::keys;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Reason recorded on a session that lost its label to a newer login.
pub const REPLACED_REASON: &str = "replaced by a newer login";

/// Handles one command body. Returns the response and, for a successful
/// logout, the reason the connection should now be closed with.
pub async fn handle(
    state: &BrokerState,
    session: &Arc<Session>,
    body: CommandBody,
) -> (Envelope, Option<String>) {
    session.begin_authentication();
    match &body.payload {
        CommandPayload::Request(CommandRequest::Login(req)) => {
            let result = login(state, session, req).await;
            if let Err(e) = &result {
                info!("Login on session {} rejected: {}", session.fd(), e);
            }
            (body.response(result.map(CommandReply::Login)).wrap(), None)
        }
        CommandPayload::Request(CommandRequest::Logout(_)) => match logout(session) {
            Ok(reply) => (
                body.response(Ok(CommandReply::Logout(reply))).wrap(),
                Some("logout".to_string()),
            ),
            Err(e) => (body.response(Err(e)).wrap(), None),
        },
        CommandPayload::Reply(reply) => {
            let err = BrokerError::NoHandlerSupport(format!("{} reply from a client", reply.code()));
            (body.response(Err(err)).wrap(), None)
        }
        CommandPayload::Empty => {
            let err = BrokerError::NoHandlerSupport("command without a request".into());
            (body.response(Err(err)).wrap(), None)
        }
    }
}

async fn login(
    state: &BrokerState,
    session: &Arc<Session>,
    req: &LoginRequest,
) -> Result<LoginReply, BrokerError> {
    if session.is_login() {
        return Err(BrokerError::InvalidRequest(
            "session is already logged in".into(),
        ));
    }
    let user_id = state.authenticator.authenticate(&req.app_id, &req.sig).await?;

    let label = Label::new(&req.app_id, user_id, &req.os);
    let device = match DeviceType::from_os(&req.os) {
        Some(device) if !label.is_empty() => device,
        _ => {
            return Err(BrokerError::InvalidRequest(format!(
                "unsupported os '{}'",
                req.os
            )));
        }
    };
    let identity = Identity {
        app_id: req.app_id.clone(),
        user_id,
        os: req.os.clone(),
        device,
        label,
        login_time: Utc::now(),
    };

    let guard = state
        .locks
        .lock(&keys::label_lock(&identity.app_id, identity.label.as_str()))
        .await?;
    let taken = take_over(state, session, &identity).await;
    if let Err(e) = guard.release().await {
        warn!("Failed to release takeover lock for {}: {}", identity.label, e);
    }
    let snapshot = taken?;

    info!(
        "Session {} ({}) logged in as {}",
        session.fd(),
        session.addr(),
        identity.label
    );
    let event = Event::UserLogin(state.presence_change(&snapshot));
    state
        .notify_user(&identity.app_id, user_id, event, Some(&identity.label))
        .await;

    Ok(LoginReply {
        app_id: identity.app_id,
        user_id,
    })
}

/// Runs under the label lock: evicts the previous holder of the label, then
/// publishes this session as the holder.
async fn take_over(
    state: &BrokerState,
    session: &Arc<Session>,
    identity: &Identity,
) -> Result<SessionSnapshot, BrokerError> {
    if let Some(previous) = state.presence.load_session(&identity.label).await?
        && !previous.is_held_by(&state.broker.addr, session.fd())
    {
        kick(state, &previous).await;
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

    // Bound before the login is marked: once marked, a close unbinds it.
    state.sessions.bind_label(identity.label.clone(), session.fd());
    if !session.mark_logged_in(identity.clone()) {
        // The connection went away while we were logging it in.
        state.sessions.unbind_label(&identity.label, session.fd());
        if let Err(e) = state.presence.remove_session(&snapshot).await {
            warn!("Failed to withdraw presence of {}: {}", identity.label, e);
        }
        return Err(BrokerError::SessionNotFound);
    }
    Ok(snapshot)
}

/// Closes the session described by `previous`, wherever it lives.
async fn kick(state: &BrokerState, previous: &SessionSnapshot) {
    if previous.broker_addr != state.broker.addr {
        info!(
            "Label {} taken over from {} on {}",
            previous.label, previous.conn_id, previous.broker_addr
        );
        if let Err(e) = state.relay.kick(previous).await {
            warn!("Failed to kick {} on {}: {}", previous.label, previous.broker_addr, e);
        }
        return;
    }

    let Some(entry) = state.sessions.get(previous.conn_id) else {
        debug!(
            "Previous holder {} of {} is no longer connected",
            previous.conn_id, previous.label
        );
        return;
    };
    info!("Label {} taken over from local session {}", previous.label, previous.conn_id);
    let event = Event::UserLogout(state.presence_change(previous));
    entry.push(EventBody::new(uuid::Uuid::new_v4().to_string(), event).notify());
    state.close_session(&entry.session, REPLACED_REASON).await;
}

fn logout(session: &Session) -> Result<LogoutReply, BrokerError> {
    let identity = require_login(session)?;
    info!("Session {} ({}) logging out", session.fd(), identity.label);
    Ok(LogoutReply {
        app_id: identity.app_id,
        user_id: identity.user_id,
    })
}
