// src/core/session/registry.rs

//! The broker-local table of live connections, indexed by connection id and by
//! device label.

use super::{Label, Session};
use crate::core::protocol::Envelope;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

/// Everything needed to reach one local connection.
#[derive(Debug, Clone)]
pub struct ConnectionEntry {
    pub session: Arc<Session>,
    /// Frames queued here are written by the connection's I/O task.
    pub outbound: mpsc::Sender<Envelope>,
    /// Fired to make the I/O task stop reading and tear the socket down.
    pub kill: broadcast::Sender<()>,
}

impl ConnectionEntry {
    /// Queues `envelope` without waiting. Returns false if the connection is
    /// gone or its queue is full.
    pub fn push(&self, envelope: Envelope) -> bool {
        self.outbound.try_send(envelope).is_ok()
    }
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    connections: DashMap<u64, ConnectionEntry>,
    labels: DashMap<Label, u64>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, entry: ConnectionEntry) {
        self.connections.insert(entry.session.fd(), entry);
    }

    pub fn get(&self, fd: u64) -> Option<ConnectionEntry> {
        self.connections.get(&fd).map(|e| e.value().clone())
    }

    /// Removes the connection and any label still pointing at it.
    pub fn remove(&self, fd: u64) -> Option<ConnectionEntry> {
        let entry = self.connections.remove(&fd).map(|(_, e)| e)?;
        if let Some(label) = entry.session.label() {
            self.unbind_label(&label, fd);
        }
        Some(entry)
    }

    /// Points `label` at connection `fd`, returning the connection it pointed
    /// at before, if any.
    pub fn bind_label(&self, label: Label, fd: u64) -> Option<u64> {
        self.labels.insert(label, fd).filter(|&prev| prev != fd)
    }

    /// Clears `label` only while it still points at `fd`.
    pub fn unbind_label(&self, label: &Label, fd: u64) -> bool {
        self.labels.remove_if(label, |_, &bound| bound == fd).is_some()
    }

    pub fn by_label(&self, label: &Label) -> Option<ConnectionEntry> {
        let fd = *self.labels.get(label)?;
        self.get(fd)
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.connections
            .iter()
            .map(|e| Arc::clone(&e.value().session))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
