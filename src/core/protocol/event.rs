// src/core/protocol/event.rs

//! One-way events. Friend events originate from clients and are routed to the
//! addressed user; presence events are emitted by the broker itself.

use super::envelope::Envelope;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    UserLogin,
    UserLogout,
    FriendAdd,
    FriendAddAgree,
    FriendAddReject,
}

/// Announces that one of a user's devices came online or went away.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
#[serde(rename_all = "camelCase")]
pub struct PresenceChange {
    pub app_id: String,
    pub user_id: u64,
    pub label: String,
    pub broker: String,
    pub at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
#[serde(rename_all = "camelCase")]
pub struct FriendRequest {
    #[serde(default)]
    pub app_id: String,
    #[serde(default)]
    pub from: u64,
    pub to: u64,
    #[serde(default)]
    pub remark: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
#[serde(rename_all = "camelCase")]
pub struct FriendReply {
    #[serde(default)]
    pub app_id: String,
    #[serde(default)]
    pub from: u64,
    pub to: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub enum Event {
    #[serde(rename = "USER_LOGIN")]
    UserLogin(PresenceChange),
    #[serde(rename = "USER_LOGOUT")]
    UserLogout(PresenceChange),
    #[serde(rename = "FRIEND_ADD")]
    FriendAdd(FriendRequest),
    #[serde(rename = "FRIEND_ADD_AGREE")]
    FriendAddAgree(FriendReply),
    #[serde(rename = "FRIEND_ADD_REJECT")]
    FriendAddReject(FriendReply),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::UserLogin(_) => EventKind::UserLogin,
            Event::UserLogout(_) => EventKind::UserLogout,
            Event::FriendAdd(_) => EventKind::FriendAdd,
            Event::FriendAddAgree(_) => EventKind::FriendAddAgree,
            Event::FriendAddReject(_) => EventKind::FriendAddReject,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct EventBody {
    pub id: String,
    pub event: Event,
}

impl EventBody {
    pub fn new(id: impl Into<String>, event: Event) -> Self {
        Self {
            id: id.into(),
            event,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.event.kind()
    }

    /// Lifts the event into a push envelope addressed to a connection.
    pub fn notify(self) -> Envelope {
        Envelope::request(self, false)
    }

    /// Lifts the event into a response envelope.
    pub fn wrap(self) -> Envelope {
        Envelope::response(self)
    }
}
