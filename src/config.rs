//! Session Configuration
//!
//! Options recognized by a session, the connection options handed to the
//! provider, and composition of namespace URLs from host, port and namespace.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use url::Url;

use crate::error::{SessionError, SessionResult};

/// Root namespace identity
pub const ROOT_NAMESPACE: &str = "/";

/// Default wait for an ack before the callback receives a timeout
pub const DEFAULT_ACK_TIMEOUT_MS: u64 = 500;

/// Whole milliseconds of `duration`, saturating at `u64::MAX`
pub(crate) fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Transport mechanisms a provider may negotiate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// HTTP long-polling
    Polling,
    /// Persistent WebSocket
    WebSocket,
}

/// Options forwarded to the connection provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectOptions {
    /// Always create a dedicated manager instead of sharing one per endpoint
    pub force_new: bool,
    /// Let the provider reconnect after a failure
    pub reconnection_enabled: bool,
    /// Reconnection attempts before giving up (`None` retries forever)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconnection_attempts: Option<u32>,
    /// Open the connection as soon as the manager is created
    pub auto_connect: bool,
    /// Handshake timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Server path the provider connects to
    pub path: String,
    /// Allowed transports in negotiation order
    pub transports: Vec<TransportKind>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            force_new: false,
            reconnection_enabled: true,
            reconnection_attempts: None,
            auto_connect: true,
            connect_timeout_ms: 20_000,
            path: "/socket.io".to_string(),
            transports: vec![TransportKind::Polling, TransportKind::WebSocket],
        }
    }
}

impl ConnectOptions {
    /// Copy of these options restricted to the single WebSocket transport
    pub fn websocket_only(&self) -> Self {
        Self {
            transports: vec![TransportKind::WebSocket],
            ..self.clone()
        }
    }
}

/// Complete session configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Host, optionally prefixed with a scheme (`https://live.example.com`)
    pub host: String,
    pub port: u16,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub connection: ConnectOptions,
    #[serde(default = "default_true")]
    pub use_ack_timers: bool,
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
}

fn default_namespace() -> String {
    ROOT_NAMESPACE.to_string()
}

fn default_true() -> bool {
    true
}

fn default_ack_timeout_ms() -> u64 {
    DEFAULT_ACK_TIMEOUT_MS
}

impl SessionConfig {
    /// Create a configuration for the root namespace with default options
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            namespace: default_namespace(),
            connection: ConnectOptions::default(),
            use_ack_timers: true,
            ack_timeout_ms: DEFAULT_ACK_TIMEOUT_MS,
        }
    }

    /// Set the namespace
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Set the connection options
    pub fn with_connection(mut self, connection: ConnectOptions) -> Self {
        self.connection = connection;
        self
    }

    /// Set the default ack timeout
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout_ms = duration_millis(timeout);
        self
    }

    /// Enable or disable ack timers
    pub fn with_ack_timers(mut self, enabled: bool) -> Self {
        self.use_ack_timers = enabled;
        self
    }

    /// Parse a configuration from TOML text
    pub fn from_toml_str(text: &str) -> SessionResult<Self> {
        let config: SessionConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> SessionResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            SessionError::InvalidConfig(format!("Cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    /// Check the configuration for values no provider can use
    pub fn validate(&self) -> SessionResult<()> {
        if self.host.trim().is_empty() {
            return Err(SessionError::InvalidConfig("host is empty".to_string()));
        }
        if self.port == 0 {
            return Err(SessionError::InvalidConfig("port must be non-zero".to_string()));
        }
        if self.use_ack_timers && self.ack_timeout_ms == 0 {
            return Err(SessionError::InvalidConfig(
                "ack_timeout_ms must be non-zero when ack timers are enabled".to_string(),
            ));
        }
        Endpoint::new(&self.host, self.port)?;
        Ok(())
    }

    /// Default ack timeout as a duration
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    /// Endpoint described by host and port
    pub fn endpoint(&self) -> SessionResult<Endpoint> {
        Endpoint::new(&self.host, self.port)
    }
}

/// Target endpoint: one physical connection, shared by every namespace on it
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    scheme: String,
    host: String,
    port: u16,
}

impl Endpoint {
    /// Build an endpoint from a host (with or without scheme) and a port
    pub fn new(host: &str, port: u16) -> SessionResult<Self> {
        let host = host.trim().trim_end_matches('/');
        let (scheme, host) = match host.split_once("://") {
            Some((scheme, rest)) => (scheme.to_ascii_lowercase(), rest),
            None => ("http".to_string(), host),
        };
        if host.is_empty() {
            return Err(SessionError::InvalidConfig("host is empty".to_string()));
        }

        let endpoint = Self {
            scheme,
            host: host.to_string(),
            port,
        };
        Url::parse(&endpoint.base_url())?;
        Ok(endpoint)
    }

    /// Well-known port of a scheme
    pub fn default_port(scheme: &str) -> Option<u16> {
        match scheme {
            "http" | "ws" => Some(80),
            "https" | "wss" => Some(443),
            _ => None,
        }
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `scheme://host[:port]`, port omitted when it is the scheme default.
    ///
    /// This string keys shared managers.
    pub fn base_url(&self) -> String {
        if Self::default_port(&self.scheme) == Some(self.port) {
            format!("{}://{}", self.scheme, self.host)
        } else {
            format!("{}://{}:{}", self.scheme, self.host, self.port)
        }
    }

    /// Path a namespace occupies on the endpoint: `/` for root, `/<name>` otherwise
    pub fn namespace_path(namespace: &str) -> String {
        let name = namespace.trim_start_matches('/');
        if name.is_empty() {
            ROOT_NAMESPACE.to_string()
        } else {
            format!("/{}", name)
        }
    }

    /// Full URL of a namespace on this endpoint
    pub fn namespace_url(&self, namespace: &str) -> SessionResult<Url> {
        let url = Url::parse(&format!("{}{}", self.base_url(), Self::namespace_path(namespace)))?;
        Ok(url)
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.base_url())
    }
}
