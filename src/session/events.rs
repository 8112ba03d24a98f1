//! Session Signals
//!
//! Lifecycle signals re-emitted by a session to its listeners.

use super::lifecycle::Session;
use crate::adapter::AdapterSignal;
use crate::error::SessionError;
use crate::events::{Signal, SignalKind};

/// Signals published by a [`Session`]
#[derive(Debug, Clone)]
pub enum SessionSignal {
    /// The namespace (re)connected
    Connected(Session),
    /// The namespace lost its connection
    Disconnected { reason: String },
    /// Connection failure, transient or terminal
    Error(SessionError),
}

impl SessionSignal {
    /// Re-home an adapter signal onto `session`
    pub(crate) fn relay(session: Session, signal: &AdapterSignal) -> Self {
        match signal {
            AdapterSignal::Connected => Self::Connected(session),
            AdapterSignal::Disconnected { reason } => Self::Disconnected { reason: reason.clone() },
            AdapterSignal::Error(err) => Self::Error(err.clone()),
        }
    }

    /// The error carried by an `Error` signal
    pub fn error(&self) -> Option<&SessionError> {
        match self {
            Self::Error(err) => Some(err),
            _ => None,
        }
    }
}

impl Signal for SessionSignal {
    fn kind(&self) -> SignalKind {
        match self {
            Self::Connected(_) => SignalKind::Connected,
            Self::Disconnected { .. } => SignalKind::Disconnected,
            Self::Error(_) => SignalKind::Error,
        }
    }
}
