//! Session Error Types
//!
//! Every failure the session reports, from connection setup to ack correlation.

use thiserror::Error;

/// Session-specific errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    // Connection errors
    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("reconnect error")]
    ReconnectError { description: Option<String> },

    #[error("reconnect failed")]
    ReconnectFailed,

    #[error("disconnect without reconnection")]
    DisconnectWithoutReconnection { reason: String },

    // Messaging errors
    #[error("Ack timeout for \"{action}\" after {timeout_ms}ms")]
    AckTimeout { action: String, timeout_ms: u64 },

    #[error("try to send: \"{action}\" without socket")]
    SendWithoutConnection { action: String },

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Lifecycle errors
    #[error("Session destroyed")]
    Destroyed,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SessionError {
    /// Whether the error ends the connection attempt for good.
    ///
    /// Transient errors are reported while the provider keeps retrying.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionError::ConnectFailed(_)
                | SessionError::ReconnectFailed
                | SessionError::DisconnectWithoutReconnection { .. }
                | SessionError::Destroyed
        )
    }

    /// Whether the provider is still retrying after this error
    pub fn is_transient(&self) -> bool {
        matches!(self, SessionError::ReconnectError { .. })
    }
}

impl From<url::ParseError> for SessionError {
    fn from(err: url::ParseError) -> Self {
        SessionError::InvalidConfig(format!("Invalid URL: {}", err))
    }
}

impl From<toml::de::Error> for SessionError {
    fn from(err: toml::de::Error) -> Self {
        SessionError::InvalidConfig(err.to_string())
    }
}

/// Result type alias for session operations
pub type SessionResult<T> = Result<T, SessionError>;
