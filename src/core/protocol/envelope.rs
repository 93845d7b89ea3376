// src/core/protocol/envelope.rs

//! Defines the `Envelope`, the outer frame that carries exactly one typed body
//! together with its direction and acknowledgement flag.

use super::command::CommandBody;
use super::event::EventBody;
use super::heartbeat::HeartbeatBody;
use super::message::MessageBody;
use crate::core::BrokerError;

/// The direction of an envelope. Wire values are `1` and `2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display)]
#[repr(u8)]
pub enum Flow {
    Request = 1,
    Response = 2,
}

impl TryFrom<u8> for Flow {
    type Error = BrokerError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Flow::Request),
            2 => Ok(Flow::Response),
            other => Err(BrokerError::Decode(format!("unknown flow {other}"))),
        }
    }
}

/// The type discriminator of an envelope body. Wire values are `1` through `4`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display, strum_macros::AsRefStr)]
#[repr(u8)]
pub enum BodyKind {
    Heartbeat = 1,
    Command = 2,
    Message = 3,
    Event = 4,
}

impl TryFrom<u8> for BodyKind {
    type Error = BrokerError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(BodyKind::Heartbeat),
            2 => Ok(BodyKind::Command),
            3 => Ok(BodyKind::Message),
            4 => Ok(BodyKind::Event),
            other => Err(BrokerError::Decode(format!("unknown body type {other}"))),
        }
    }
}

/// The typed payload of an envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Heartbeat(HeartbeatBody),
    Command(CommandBody),
    Message(MessageBody),
    Event(EventBody),
}

impl Body {
    /// Returns the discriminator matching this body's runtime kind.
    pub fn kind(&self) -> BodyKind {
        match self {
            Body::Heartbeat(_) => BodyKind::Heartbeat,
            Body::Command(_) => BodyKind::Command,
            Body::Message(_) => BodyKind::Message,
            Body::Event(_) => BodyKind::Event,
        }
    }
}

impl From<HeartbeatBody> for Body {
    fn from(body: HeartbeatBody) -> Self {
        Body::Heartbeat(body)
    }
}

impl From<CommandBody> for Body {
    fn from(body: CommandBody) -> Self {
        Body::Command(body)
    }
}

impl From<MessageBody> for Body {
    fn from(body: MessageBody) -> Self {
        Body::Message(body)
    }
}

impl From<EventBody> for Body {
    fn from(body: EventBody) -> Self {
        Body::Event(body)
    }
}

/// The outer frame exchanged between clients and brokers.
///
/// `kind` is redundant with the body's runtime kind; the constructors keep
/// them in agreement and the codec refuses to encode an envelope where they
/// differ.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub flow: Flow,
    pub kind: BodyKind,
    pub need_ack: bool,
    pub body: Body,
}

impl Envelope {
    /// Builds an envelope whose discriminator is taken from the body.
    pub fn new(flow: Flow, need_ack: bool, body: impl Into<Body>) -> Self {
        let body = body.into();
        Self {
            flow,
            kind: body.kind(),
            need_ack,
            body,
        }
    }

    /// Builds a request envelope, used both by clients and by the broker when it
    /// pushes messages or events to a connection.
    pub fn request(body: impl Into<Body>, need_ack: bool) -> Self {
        Self::new(Flow::Request, need_ack, body)
    }

    /// Builds a response envelope.
    pub fn response(body: impl Into<Body>) -> Self {
        Self::new(Flow::Response, false, body)
    }

    /// Returns the correlation id of the body, if the body kind carries one.
    pub fn correlation_id(&self) -> Option<&str> {
        match &self.body {
            Body::Heartbeat(_) => None,
            Body::Command(c) => Some(&c.id),
            Body::Message(m) => Some(&m.id),
            Body::Event(e) => Some(&e.id),
        }
    }

    /// Verifies that the declared discriminator agrees with the body.
    pub fn check_consistency(&self) -> Result<(), BrokerError> {
        if self.kind != self.body.kind() {
            return Err(BrokerError::Encode(format!(
                "envelope declares type {} but carries a {} body",
                self.kind,
                self.body.kind()
            )));
        }
        Ok(())
    }
}
