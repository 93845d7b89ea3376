// src/core/protocol/message.rs

//! Chat messages and their acknowledgements.

use super::envelope::Envelope;
use crate::core::errors::{BrokerError, CODE_OK, ErrorStatus};
use serde::{Deserialize, Serialize};

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    bincode::Encode,
    bincode::Decode,
    strum_macros::Display,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ContentType {
    #[default]
    Text,
    Image,
    Audio,
    Video,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct TextContent {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct ImageContent {
    pub url: String,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
#[serde(rename_all = "camelCase")]
pub struct AudioContent {
    pub url: String,
    pub duration_secs: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
#[serde(rename_all = "camelCase")]
pub struct VideoContent {
    pub url: String,
    pub duration_secs: u32,
    #[serde(default)]
    pub cover_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageContent {
    Text(TextContent),
    Image(ImageContent),
    Audio(AudioContent),
    Video(VideoContent),
}

impl MessageContent {
    pub fn content_type(&self) -> ContentType {
        match self {
            MessageContent::Text(_) => ContentType::Text,
            MessageContent::Image(_) => ContentType::Image,
            MessageContent::Audio(_) => ContentType::Audio,
            MessageContent::Video(_) => ContentType::Video,
        }
    }
}

/// A chat message. The same shape doubles as the acknowledgement sent back to
/// the sender, in which case `code`/`reason` hold the status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
#[serde(rename_all = "camelCase")]
pub struct MessageBody {
    pub id: String,
    #[serde(default)]
    pub conversation_id: String,
    #[serde(default)]
    pub from: u64,
    #[serde(default)]
    pub to: u64,
    #[serde(default)]
    pub group_id: u64,
    #[serde(default)]
    pub app_id: String,
    #[serde(default)]
    pub sequence: u64,
    #[serde(default)]
    pub client_time: i64,
    #[serde(default)]
    pub server_time: i64,
    #[serde(default)]
    pub content_type: ContentType,
    #[serde(default)]
    pub content: Option<MessageContent>,
    #[serde(default)]
    pub code: i32,
    #[serde(default)]
    pub reason: String,
}

impl MessageBody {
    /// Builds a one-to-one message request. Broker-owned fields (`from`,
    /// `appId`, `sequence`, `serverTime`) are stamped on arrival.
    pub fn new(
        id: impl Into<String>,
        conversation_id: impl Into<String>,
        to: u64,
        content: MessageContent,
    ) -> Self {
        Self {
            id: id.into(),
            conversation_id: conversation_id.into(),
            from: 0,
            to,
            group_id: 0,
            app_id: String::new(),
            sequence: 0,
            client_time: chrono::Utc::now().timestamp_millis(),
            server_time: 0,
            content_type: content.content_type(),
            content: Some(content),
            code: CODE_OK,
            reason: String::new(),
        }
    }

    /// Checks that an inbound message is deliverable: it carries content, the
    /// declared content type matches it, and it names a recipient.
    pub fn validate(&self) -> Result<(), BrokerError> {
        let Some(content) = &self.content else {
            return Err(BrokerError::InvalidRequest("message has no content".into()));
        };
        if content.content_type() != self.content_type {
            return Err(BrokerError::InvalidRequest(format!(
                "content type {} does not match {} content",
                self.content_type,
                content.content_type()
            )));
        }
        if self.to == 0 && self.group_id == 0 {
            return Err(BrokerError::InvalidRequest(
                "message has neither a recipient nor a group".into(),
            ));
        }
        Ok(())
    }

    pub fn is_success(&self) -> bool {
        self.code == CODE_OK
    }

    /// Builds the acknowledgement for this message. On success the accepted
    /// message is attached with code `0`; on failure only the status is kept.
    pub fn response(&self, result: Result<MessageBody, BrokerError>) -> Self {
        match result {
            Ok(accepted) => Self {
                id: self.id.clone(),
                code: CODE_OK,
                reason: String::new(),
                ..accepted
            },
            Err(err) => self.failure(&err),
        }
    }

    /// Builds a status-only acknowledgement carrying no content.
    pub fn failure(&self, err: &BrokerError) -> Self {
        let status = ErrorStatus::from(err);
        Self {
            id: self.id.clone(),
            conversation_id: self.conversation_id.clone(),
            from: self.from,
            to: self.to,
            group_id: self.group_id,
            app_id: self.app_id.clone(),
            sequence: 0,
            client_time: self.client_time,
            server_time: chrono::Utc::now().timestamp_millis(),
            content_type: self.content_type,
            content: None,
            code: status.code,
            reason: status.message,
        }
    }

    /// Lifts the body into a response envelope.
    pub fn wrap(self) -> Envelope {
        Envelope::response(self)
    }
}
