// src/core/mod.rs

//! The central module containing the core logic and data structures of the
//! SpinelChat broker.

pub mod errors;
pub mod handler;
pub mod lock;
pub mod metrics;
pub mod presence;
pub mod protocol;
pub mod sequence;
pub mod session;
pub mod state;
pub mod store;
pub mod tasks;

pub use errors::{BrokerError, ErrorStatus};
pub use protocol::Envelope;
