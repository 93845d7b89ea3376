// src/core/store/keys.rs

//! Builders for every key the broker writes to the shared store. All key
//! formats live here so that every node agrees on them.

/// Liveness record of one broker node.
pub fn broker(addr: &str) -> String {
    format!("im:broker:{addr}")
}

/// Sorted set of every broker that ever registered, scored by start time.
pub fn broker_roster() -> &'static str {
    "im:brokers"
}

/// Presence record of one device session.
pub fn session(app_id: &str, label: &str) -> String {
    format!("im:{app_id}:user:conn:{label}")
}

/// Hash from device label to session snapshot for one user.
pub fn device_index(app_id: &str, user_id: u64) -> String {
    format!("im:{app_id}:user:clients:{user_id}")
}

/// Counter backing a sequence.
pub fn sequence(app_id: &str, seq_id: &str) -> String {
    format!("im:{app_id}:seq:{seq_id}")
}

/// Distributed lock guarding `resource`.
pub fn lock(app_id: &str, resource: &str) -> String {
    format!("im:{app_id}:lock:{resource}")
}

/// Lock serializing every change of holder for a device label.
pub fn label_lock(app_id: &str, label: &str) -> String {
    lock(app_id, &format!("label:{label}"))
}

/// Signature record resolving a login signature to a user id.
pub fn signature(app_id: &str, sig: &str) -> String {
    format!("im:{app_id}:user:sig:{sig}")
}
