//! Adapter State
//!
//! Connection state machine and the signals the adapter publishes.

use serde::{Deserialize, Serialize};

use crate::error::SessionError;
use crate::events::{Signal, SignalKind};

/// Connection state of an adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No link, or the provider gave up
    Stopped,
    /// Link created, waiting for the first connect
    Connecting,
    /// Namespace connected
    Connected,
    /// Connection lost, provider retrying
    Reconnecting,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Stopped
    }
}

impl ConnectionState {
    /// Whether a link is held, whatever its progress
    pub fn is_active(&self) -> bool {
        !matches!(self, Self::Stopped)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

/// Canonical signals published by a [`ConnectionAdapter`](super::ConnectionAdapter)
#[derive(Debug, Clone, PartialEq)]
pub enum AdapterSignal {
    Connected,
    Disconnected { reason: String },
    Error(SessionError),
}

impl Signal for AdapterSignal {
    fn kind(&self) -> SignalKind {
        match self {
            Self::Connected => SignalKind::Connected,
            Self::Disconnected { .. } => SignalKind::Disconnected,
            Self::Error(_) => SignalKind::Error,
        }
    }
}
