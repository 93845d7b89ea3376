// src/core/protocol/heartbeat.rs

use super::envelope::Envelope;
use serde::{Deserialize, Serialize};

/// A keep-alive signal. The value is a counter or timestamp chosen by the
/// client and echoed back unchanged.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct HeartbeatBody {
    pub value: i64,
}

impl HeartbeatBody {
    pub fn new(value: i64) -> Self {
        Self { value }
    }

    /// Lifts the heartbeat into a response envelope echoing the same value.
    pub fn wrap(self) -> Envelope {
        Envelope::response(self)
    }
}
