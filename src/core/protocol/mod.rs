// src/core/protocol/mod.rs

//! The client-facing envelope protocol: one frame type carrying heartbeats,
//! commands, messages and events.

pub mod codec;
pub mod command;
pub mod envelope;
pub mod event;
pub mod heartbeat;
pub mod message;

pub use codec::{EnvelopeCodec, WireFormat, decode, encode};
pub use command::{
    CommandBody, CommandCode, CommandPayload, CommandReply, CommandRequest, LoginReply,
    LoginRequest, LogoutReply, LogoutRequest,
};
pub use envelope::{Body, BodyKind, Envelope, Flow};
pub use event::{Event, EventBody, EventKind, FriendReply, FriendRequest, PresenceChange};
pub use heartbeat::HeartbeatBody;
pub use message::{
    AudioContent, ContentType, ImageContent, MessageBody, MessageContent, TextContent,
    VideoContent,
};
