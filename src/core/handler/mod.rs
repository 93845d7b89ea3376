// src/core/handler/mod.rs

//! Turns decoded inbound envelopes into broker actions and their responses.

mod actions;

pub mod dispatcher;

pub use dispatcher::{Dispatcher, Outcome};
