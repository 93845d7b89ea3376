// src/core/handler/actions/event.rs

use super::require_login;
use crate::core::BrokerError;
use crate::core::protocol::{CommandBody, Envelope, Event, EventBody};
use crate::core::session::Session;
use crate::core::state::BrokerState;
use std::sync::Arc;
use tracing::debug;

/// Routes a client-originated friend event to its addressee. Presence events
/// are emitted by brokers only and are refused when a client sends one.
///
/// Event bodies have no status fields, so a refusal is answered with a
/// `Command` response carrying the event's id. Clients correlate refusals
/// by id, not by envelope type.
pub async fn handle(
    state: &BrokerState,
    session: &Arc<Session>,
    body: EventBody,
    need_ack: bool,
) -> Option<Envelope> {
    match forward(state, session, &body).await {
        Ok(stamped) => need_ack.then(|| stamped.wrap()),
        Err(e) => {
            debug!("Event {} from session {} refused: {}", body.id, session.fd(), e);
            Some(CommandBody::failure(body.id.clone(), &e).wrap())
        }
    }
}

async fn forward(
    state: &BrokerState,
    session: &Session,
    body: &EventBody,
) -> Result<EventBody, BrokerError> {
    let identity = require_login(session)?;

    let mut event = body.event.clone();
    let to = match &mut event {
        Event::FriendAdd(req) => {
            req.app_id.clone_from(&identity.app_id);
            req.from = identity.user_id;
            req.to
        }
        Event::FriendAddAgree(reply) | Event::FriendAddReject(reply) => {
            reply.app_id.clone_from(&identity.app_id);
            reply.from = identity.user_id;
            reply.to
        }
        Event::UserLogin(_) | Event::UserLogout(_) => {
            return Err(BrokerError::NoHandlerSupport(format!(
                "{} event from a client",
                body.kind()
            )));
        }
    };
    if to == 0 {
        return Err(BrokerError::InvalidRequest("event has no recipient".into()));
    }

    let stamped = EventBody::new(body.id.clone(), event);
    let reached = state
        .route(&identity.app_id, to, stamped.clone().notify(), None)
        .await?;
    debug!("Event {} ({}) reached {} device(s)", stamped.id, stamped.kind(), reached);
    Ok(stamped)
}
