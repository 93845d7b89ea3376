// src/core/session/mod.rs

//! The connection-local session: who is on the other end of a socket and
//! where that connection is in its lifecycle.
//!
//! A `Session` is shared between the connection's I/O task, the dispatcher and
//! the heartbeat sweeper, so every mutable field is independently safe under
//! concurrent access.

pub mod label;
pub mod registry;

pub use label::{DeviceType, Label};
pub use registry::{ConnectionEntry, SessionRegistry};

use crate::core::metrics;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::time::Duration;
use strum_macros::Display;
use tokio::time::Instant;

/// Lifecycle phases, in the only order they can be visited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Display)]
#[repr(u8)]
pub enum SessionPhase {
    Connected = 0,
    Authenticating = 1,
    LoggedIn = 2,
    Closing = 3,
    Closed = 4,
}

impl SessionPhase {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SessionPhase::Connected,
            1 => SessionPhase::Authenticating,
            2 => SessionPhase::LoggedIn,
            3 => SessionPhase::Closing,
            _ => SessionPhase::Closed,
        }
    }
}

/// The authenticated identity bound to a session at login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub app_id: String,
    pub user_id: u64,
    pub os: String,
    pub device: DeviceType,
    pub label: Label,
    pub login_time: DateTime<Utc>,
}

#[derive(Debug)]
pub struct Session {
    fd: u64,
    addr: SocketAddr,
    connect_time: DateTime<Utc>,
    identity: RwLock<Option<Identity>>,
    is_login: AtomicBool,
    is_closed: AtomicBool,
    /// Milliseconds since `clock_origin` at the last heartbeat.
    last_heartbeat: AtomicU64,
    clock_origin: Instant,
    phase: AtomicU8,
    close_reason: Mutex<Option<String>>,
}

impl Session {
    pub fn new(fd: u64, addr: SocketAddr) -> Self {
        Self {
            fd,
            addr,
            connect_time: Utc::now(),
            identity: RwLock::new(None),
            is_login: AtomicBool::new(false),
            is_closed: AtomicBool::new(false),
            last_heartbeat: AtomicU64::new(0),
            clock_origin: Instant::now(),
            phase: AtomicU8::new(SessionPhase::Connected as u8),
            close_reason: Mutex::new(None),
        }
    }

    /// The broker-local connection id.
    pub fn fd(&self) -> u64 {
        self.fd
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn connect_time(&self) -> DateTime<Utc> {
        self.connect_time
    }

    pub fn phase(&self) -> SessionPhase {
        SessionPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub fn identity(&self) -> Option<Identity> {
        self.identity.read().clone()
    }

    pub fn label(&self) -> Option<Label> {
        self.identity.read().as_ref().map(|i| i.label.clone())
    }

    pub fn is_login(&self) -> bool {
        self.is_login.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.is_closed.load(Ordering::Acquire)
    }

    /// Records a heartbeat at the current instant.
    pub fn touch(&self) {
        let elapsed = self.clock_origin.elapsed().as_millis() as u64;
        self.last_heartbeat.store(elapsed, Ordering::Release);
    }

    pub fn last_heartbeat(&self) -> Instant {
        self.clock_origin + Duration::from_millis(self.last_heartbeat.load(Ordering::Acquire))
    }

    /// Time since the last heartbeat, or since accept if none arrived yet.
    pub fn idle_for(&self) -> Duration {
        Instant::now().saturating_duration_since(self.last_heartbeat())
    }

    /// Moves `Connected` to `Authenticating`. Later calls are no-ops.
    pub fn begin_authentication(&self) {
        let _ = self.phase.compare_exchange(
            SessionPhase::Connected as u8,
            SessionPhase::Authenticating as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Binds `identity` and moves to `LoggedIn`. Returns false, binding
    /// nothing, if the session already started closing. Serialized with
    /// `begin_close`, so a close either sees the login or prevents it.
    pub fn mark_logged_in(&self, identity: Identity) -> bool {
        let mut slot = self.identity.write();
        if self.is_closed() {
            return false;
        }
        let advanced = self
            .phase
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |p| {
                (p <= SessionPhase::LoggedIn as u8).then_some(SessionPhase::LoggedIn as u8)
            })
            .is_ok();
        if advanced {
            *slot = Some(identity);
            if !self.is_login.swap(true, Ordering::AcqRel) {
                metrics::LOGGED_IN_SESSIONS.inc();
            }
        }
        advanced
    }

    /// Marks the session closed and moves it to `Closing`. Returns true only
    /// for the single caller that actually closed it.
    pub fn begin_close(&self, reason: &str) -> bool {
        let _slot = self.identity.write();
        if self
            .is_closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        *self.close_reason.lock() = Some(reason.to_string());
        self.phase
            .store(SessionPhase::Closing as u8, Ordering::Release);
        true
    }

    /// Completes the close once presence eviction is done.
    pub fn finish_close(&self) {
        self.is_login.store(false, Ordering::Release);
        self.phase.store(SessionPhase::Closed as u8, Ordering::Release);
    }

    pub fn close_reason(&self) -> Option<String> {
        self.close_reason.lock().clone()
    }
}
