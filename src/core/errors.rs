// src/core/errors.rs

//! Defines the primary error type for the broker and the uniform mapping from
//! errors to the `(code, message)` status carried on the wire.

use std::error::Error as StdError;
use std::num::ParseIntError;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// The status code reported for a successful command or message.
pub const CODE_OK: i32 = 0;
/// The status code reported for any error the broker does not recognize as a
/// domain error. The original message is preserved as the detail.
pub const CODE_UNRECOGNIZED: i32 = 9999;

/// The main error enum, representing all possible failures within the broker.
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("encode error: {0}")]
    Encode(String),

    #[error("no handler support for {0}")]
    NoHandlerSupport(String),

    #[error("heartbeat error: {0}")]
    Heartbeat(String),

    #[error("heartbeat timeout: no heartbeat for {0:?}")]
    HeartbeatTimeout(Duration),

    #[error("store error: {0}")]
    Store(String),

    #[error("timed out acquiring lock '{0}'")]
    LockAcquireTimeout(String),

    #[error("session not found")]
    SessionNotFound,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("Internal Error: {0}")]
    Internal(String),
}

impl BrokerError {
    /// Returns the stable wire code for domain errors, or `None` for errors the
    /// broker does not classify.
    pub fn code(&self) -> Option<i32> {
        match self {
            BrokerError::Decode(_) => Some(1001),
            BrokerError::Encode(_) => Some(1002),
            BrokerError::NoHandlerSupport(_) => Some(1003),
            BrokerError::Heartbeat(_) => Some(1004),
            BrokerError::HeartbeatTimeout(_) => Some(1005),
            BrokerError::Store(_) => Some(1006),
            BrokerError::LockAcquireTimeout(_) => Some(1007),
            BrokerError::SessionNotFound => Some(1008),
            BrokerError::InvalidRequest(_) => Some(1009),
            BrokerError::Io(_) | BrokerError::Internal(_) => None,
        }
    }

    /// Returns true if this error must tear down the connection it occurred on.
    /// Everything else is reported back to the client as a response.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BrokerError::HeartbeatTimeout(_) | BrokerError::Io(_))
    }

    /// Returns true for store and transport failures that may succeed when
    /// retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, BrokerError::Store(_) | BrokerError::Io(_))
    }
}

/// The `(code, message)` pair carried by command and message responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorStatus {
    pub code: i32,
    pub message: String,
}

impl ErrorStatus {
    /// Formats any error into a wire status. Domain errors keep their stable
    /// code; anything else is reported as unrecognized with its message intact.
    pub fn from_error(err: &(dyn StdError + 'static)) -> Self {
        if let Some(broker_err) = err.downcast_ref::<BrokerError>() {
            return Self::from(broker_err);
        }
        Self {
            code: CODE_UNRECOGNIZED,
            message: format!("unrecognized error: {err}"),
        }
    }
}

impl From<&BrokerError> for ErrorStatus {
    fn from(err: &BrokerError) -> Self {
        match err.code() {
            Some(code) => Self {
                code,
                message: err.to_string(),
            },
            None => Self {
                code: CODE_UNRECOGNIZED,
                message: format!("unrecognized error: {err}"),
            },
        }
    }
}

// `std::io::Error` is not cloneable, so it is shared behind an `Arc`.
impl Clone for BrokerError {
    fn clone(&self) -> Self {
        match self {
            BrokerError::Io(e) => BrokerError::Io(Arc::clone(e)),
            BrokerError::Decode(s) => BrokerError::Decode(s.clone()),
            BrokerError::Encode(s) => BrokerError::Encode(s.clone()),
            BrokerError::NoHandlerSupport(s) => BrokerError::NoHandlerSupport(s.clone()),
            BrokerError::Heartbeat(s) => BrokerError::Heartbeat(s.clone()),
            BrokerError::HeartbeatTimeout(d) => BrokerError::HeartbeatTimeout(*d),
            BrokerError::Store(s) => BrokerError::Store(s.clone()),
            BrokerError::LockAcquireTimeout(s) => BrokerError::LockAcquireTimeout(s.clone()),
            BrokerError::SessionNotFound => BrokerError::SessionNotFound,
            BrokerError::InvalidRequest(s) => BrokerError::InvalidRequest(s.clone()),
            BrokerError::Internal(s) => BrokerError::Internal(s.clone()),
        }
    }
}

impl PartialEq for BrokerError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (BrokerError::Io(e1), BrokerError::Io(e2)) => e1.to_string() == e2.to_string(),
            (BrokerError::Decode(s1), BrokerError::Decode(s2)) => s1 == s2,
            (BrokerError::Encode(s1), BrokerError::Encode(s2)) => s1 == s2,
            (BrokerError::NoHandlerSupport(s1), BrokerError::NoHandlerSupport(s2)) => s1 == s2,
            (BrokerError::Heartbeat(s1), BrokerError::Heartbeat(s2)) => s1 == s2,
            (BrokerError::HeartbeatTimeout(d1), BrokerError::HeartbeatTimeout(d2)) => d1 == d2,
            (BrokerError::Store(s1), BrokerError::Store(s2)) => s1 == s2,
            (BrokerError::LockAcquireTimeout(s1), BrokerError::LockAcquireTimeout(s2)) => s1 == s2,
            (BrokerError::InvalidRequest(s1), BrokerError::InvalidRequest(s2)) => s1 == s2,
            (BrokerError::Internal(s1), BrokerError::Internal(s2)) => s1 == s2,
            _ => core::mem::discriminant(self) == core::mem::discriminant(other),
        }
    }
}

// --- From trait implementations for easy error conversion ---

impl From<std::io::Error> for BrokerError {
    fn from(e: std::io::Error) -> Self {
        BrokerError::Io(Arc::new(e))
    }
}

impl From<std::str::Utf8Error> for BrokerError {
    fn from(e: std::str::Utf8Error) -> Self {
        BrokerError::Decode(format!("invalid utf-8: {e}"))
    }
}

impl From<std::string::FromUtf8Error> for BrokerError {
    fn from(e: std::string::FromUtf8Error) -> Self {
        BrokerError::Decode(format!("invalid utf-8: {e}"))
    }
}

impl From<ParseIntError> for BrokerError {
    fn from(e: ParseIntError) -> Self {
        BrokerError::Store(format!("value is not an integer: {e}"))
    }
}

impl From<bincode::error::DecodeError> for BrokerError {
    fn from(e: bincode::error::DecodeError) -> Self {
        BrokerError::Decode(e.to_string())
    }
}

impl From<bincode::error::EncodeError> for BrokerError {
    fn from(e: bincode::error::EncodeError) -> Self {
        BrokerError::Encode(e.to_string())
    }
}

impl From<mlua::Error> for BrokerError {
    fn from(e: mlua::Error) -> Self {
        // Errors raised from inside `redis.call` travel through Lua as external
        // errors; surface the original instead of the Lua wrapper.
        let mut source: Option<&(dyn StdError + 'static)> = e.source();
        while let Some(err) = source {
            if let Some(broker_err) = err.downcast_ref::<BrokerError>() {
                return broker_err.clone();
            }
            source = err.source();
        }
        BrokerError::Store(format!("script error: {e}"))
    }
}

impl From<BrokerError> for mlua::Error {
    fn from(e: BrokerError) -> Self {
        mlua::Error::external(e)
    }
}

// JSON only crosses the store boundary implicitly (presence records); the
// codec maps its JSON failures explicitly.
impl From<serde_json::Error> for BrokerError {
    fn from(e: serde_json::Error) -> Self {
        BrokerError::Store(format!("malformed record: {e}"))
    }
}
