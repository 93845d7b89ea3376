// src/core/handler/actions/mod.rs

// One module per body kind. The dispatcher reaches them via `actions::kind::handle`.
pub mod command;
pub mod event;
pub mod heartbeat;
pub mod message;

use crate::core::BrokerError;
use crate::core::session::{Identity, Session};

/// The identity of a logged-in session, or `SessionNotFound`.
pub(super) fn require_login(session: &Session) -> Result<Identity, BrokerError> {
    if !session.is_login() {
        return Err(BrokerError::SessionNotFound);
    }
    session.identity().ok_or(BrokerError::SessionNotFound)
}
