// src/core/session/label.rs

//! Device labels: the `appId#userId#deviceType` key identifying one device
//! slot of one user. A user holds at most one session per label.

use serde::{Deserialize, Serialize};
use std::fmt;
use strum_macros::{Display, EnumString};

/// The class of device a session runs on, derived from the client's OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize)]
pub enum DeviceType {
    Mobile,
    Desktop,
}

impl DeviceType {
    /// Maps a client OS name to its device class, case-insensitively.
    /// Unknown names map to `None`.
    pub fn from_os(os: &str) -> Option<Self> {
        match os.trim().to_ascii_lowercase().as_str() {
            "ios" | "ipados" | "android" | "harmonyos" => Some(DeviceType::Mobile),
            "windows" | "macos" | "mac" | "osx" | "linux" | "web" => Some(DeviceType::Desktop),
            _ => None,
        }
    }
}

/// A device label. The empty label means "no valid device slot" and is never
/// used as a storage or routing key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Label(String);

impl Label {
    /// Builds the label for `(app_id, user_id, os)`. The result is empty if
    /// `app_id` is empty, `user_id` is zero, or the OS is unknown.
    pub fn new(app_id: &str, user_id: u64, os: &str) -> Self {
        match DeviceType::from_os(os) {
            Some(device) if !app_id.is_empty() && user_id != 0 => {
                Self(format!("{app_id}#{user_id}#{device}"))
            }
            _ => Self::default(),
        }
    }

    /// Wraps a label read back from the store. Use `parts` to validate it.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Splits a non-empty label back into its parts.
    pub fn parts(&self) -> Option<(&str, u64, DeviceType)> {
        let mut it = self.0.rsplitn(3, '#');
        let device = it.next()?.parse().ok()?;
        let user_id = it.next()?.parse().ok()?;
        let app_id = it.next()?;
        Some((app_id, user_id, device))
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Label {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
