// src/connection/mod.rs

//! Manages the lifecycle of a single client connection: framing, dispatch of
//! inbound envelopes, delivery of pushed envelopes and cleanup.

mod guard;
mod handler;

pub use guard::ConnectionGuard;
pub use handler::ConnectionHandler;
