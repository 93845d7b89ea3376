// src/core/protocol/command.rs

//! Request/response commands. A request carries a named request struct; the
//! response carries the matching reply on success, or only a status on failure.

use super::envelope::Envelope;
use crate::core::errors::{BrokerError, CODE_OK, ErrorStatus};
use serde::{Deserialize, Serialize};

/// The commands a client can issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display, strum_macros::EnumString)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandCode {
    UserLogin,
    UserLogout,
}

/// Login request. `os` names the client platform and selects the device slot
/// (Mobile or Desktop) the session occupies. It has no fallback: a missing
/// or unrecognized `os` is rejected with `InvalidRequest` even when the
/// signature is valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    pub app_id: String,
    pub sig: String,
    #[serde(default)]
    pub os: String,
}

#[derive(
    Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct LogoutRequest {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
#[serde(rename_all = "camelCase")]
pub struct LoginReply {
    pub app_id: String,
    pub user_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
#[serde(rename_all = "camelCase")]
pub struct LogoutReply {
    pub app_id: String,
    pub user_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub enum CommandRequest {
    #[serde(rename = "USER_LOGIN")]
    Login(LoginRequest),
    #[serde(rename = "USER_LOGOUT")]
    Logout(LogoutRequest),
}

impl CommandRequest {
    pub fn code(&self) -> CommandCode {
        match self {
            CommandRequest::Login(_) => CommandCode::UserLogin,
            CommandRequest::Logout(_) => CommandCode::UserLogout,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub enum CommandReply {
    #[serde(rename = "USER_LOGIN")]
    Login(LoginReply),
    #[serde(rename = "USER_LOGOUT")]
    Logout(LogoutReply),
}

impl CommandReply {
    pub fn code(&self) -> CommandCode {
        match self {
            CommandReply::Login(_) => CommandCode::UserLogin,
            CommandReply::Logout(_) => CommandCode::UserLogout,
        }
    }
}

#[derive(
    Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
#[serde(rename_all = "camelCase")]
pub enum CommandPayload {
    #[default]
    Empty,
    Request(CommandRequest),
    Reply(CommandReply),
}

/// A command request or its response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
#[serde(rename_all = "camelCase")]
pub struct CommandBody {
    /// Correlation id chosen by the requester and echoed in the response.
    pub id: String,
    #[serde(default)]
    pub code: i32,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub payload: CommandPayload,
}

impl CommandBody {
    /// Builds a request-flavored body.
    pub fn request(id: impl Into<String>, request: CommandRequest) -> Self {
        Self {
            id: id.into(),
            code: CODE_OK,
            message: String::new(),
            payload: CommandPayload::Request(request),
        }
    }

    /// Returns the request this body carries, if it is request-flavored.
    pub fn request_payload(&self) -> Option<&CommandRequest> {
        match &self.payload {
            CommandPayload::Request(req) => Some(req),
            _ => None,
        }
    }

    /// Returns the reply this body carries, if it is a successful response.
    pub fn reply(&self) -> Option<&CommandReply> {
        match &self.payload {
            CommandPayload::Reply(reply) => Some(reply),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == CODE_OK
    }

    /// Builds the response to this request. On success the reply is attached
    /// with code `0`; on failure the error is formatted into a status and no
    /// reply is attached.
    pub fn response(&self, result: Result<CommandReply, BrokerError>) -> Self {
        match result {
            Ok(reply) => Self {
                id: self.id.clone(),
                code: CODE_OK,
                message: String::new(),
                payload: CommandPayload::Reply(reply),
            },
            Err(err) => Self::failure(self.id.clone(), &err),
        }
    }

    /// Builds a status-only failure response for the given correlation id.
    pub fn failure(id: impl Into<String>, err: &BrokerError) -> Self {
        let status = ErrorStatus::from(err);
        Self {
            id: id.into(),
            code: status.code,
            message: status.message,
            payload: CommandPayload::Empty,
        }
    }

    /// Lifts the body into a response envelope.
    pub fn wrap(self) -> Envelope {
        Envelope::response(self)
    }
}
