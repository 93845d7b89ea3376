// src/core/handler/actions/message.rs

use super::require_login;
use crate::core::BrokerError;
use crate::core::protocol::{Envelope, MessageBody};
use crate::core::session::Session;
use crate::core::state::BrokerState;
use chrono::Utc;
use std::sync::Arc;
use tracing::debug;

/// Accepts a chat message from a logged-in session and delivers it.
/// Successful messages are acknowledged only when the client asked for it;
/// failures are always reported.
pub async fn handle(
    state: &BrokerState,
    session: &Arc<Session>,
    message: MessageBody,
    need_ack: bool,
) -> Option<Envelope> {
    match accept(state, session, &message).await {
        Ok(accepted) => need_ack.then(|| message.response(Ok(accepted)).wrap()),
        Err(e) => {
            debug!("Message {} from session {} refused: {}", message.id, session.fd(), e);
            Some(message.failure(&e).wrap())
        }
    }
}

async fn accept(
    state: &BrokerState,
    session: &Session,
    message: &MessageBody,
) -> Result<MessageBody, BrokerError> {
    let identity = require_login(session)?;
    message.validate()?;

    let mut accepted = message.clone();
    accepted.from = identity.user_id;
    accepted.app_id = identity.app_id;
    accepted.server_time = Utc::now().timestamp_millis();
    if accepted.conversation_id.is_empty() {
        accepted.conversation_id = conversation_key(&accepted);
    }
    accepted.sequence = state
        .sequences
        .next_value(&accepted.app_id, &accepted.conversation_id)
        .await?;

    let reached = state.deliver(&accepted).await?;
    debug!(
        "Message {} ({}#{}) reached {} device(s)",
        accepted.id, accepted.conversation_id, accepted.sequence, reached
    );
    Ok(accepted)
}

/// The sequence key for a message that names no conversation: the group, or
/// the unordered pair of users.
pub fn conversation_key(message: &MessageBody) -> String {
    if message.group_id != 0 {
        return format!("g:{}", message.group_id);
    }
    let (low, high) = if message.from <= message.to {
        (message.from, message.to)
    } else {
        (message.to, message.from)
    };
    format!("u:{low}:{high}")
}
