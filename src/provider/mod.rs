//! Connection Provider
//!
//! The collaborator contract the session is written against. A provider owns
//! the physical transport (framing, TLS, encoding, reconnection backoff); this
//! crate only drives it through these traits.
//!
//! - [`Connector`] creates managers, one per physical connection
//! - [`Manager`] multiplexes namespaces and reports connection-level events
//! - [`Socket`] is one namespace on a manager
//! - [`ManagerPool`] shares managers per endpoint and tears them down when
//!   their last namespace leaves
//!
//! Implementations must tolerate `off` being called from inside a handler
//! they are currently dispatching.

pub mod pool;

#[cfg(any(test, feature = "memory-provider"))]
pub mod memory;

use serde_json::Value;
use std::sync::Arc;
use url::Url;

use crate::config::ConnectOptions;
use crate::error::SessionResult;
use crate::events::ListenerId;

pub use pool::{ManagerPool, PoolLease};

/// Reason a provider reports for a disconnect requested by the client itself
pub const CLIENT_DISCONNECT_REASON: &str = "io client disconnect";

/// Connection state of a manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Closed,
    Opening,
    Open,
}

/// Connection-level events reported by a manager
#[derive(Debug, Clone, PartialEq)]
pub enum ManagerEvent {
    /// The physical connection is open
    Open,
    /// An attempt to open the connection failed
    ConnectError(String),
    /// An attempt to open the connection timed out
    ConnectTimeout,
    /// Reconnected after `n` attempts
    Reconnect(u32),
    /// About to attempt reconnection number `n`
    ReconnectAttempt(u32),
    /// Reconnection number `n` is in progress
    Reconnecting(u32),
    /// A reconnection attempt failed
    ReconnectError(String),
    /// Every reconnection attempt failed
    ReconnectFailed,
}

/// Lifecycle events reported by a namespace socket
#[derive(Debug, Clone, PartialEq)]
pub enum SocketEvent {
    Connect,
    Disconnect(String),
    Error(String),
    Reconnect(u32),
    ReconnectAttempt(u32),
    Reconnecting(u32),
    ReconnectError(Option<String>),
    ReconnectFailed,
}

/// Handler for an inbound protocol message
pub type MessageHandler = Arc<dyn Fn(&[Value]) + Send + Sync>;

/// One-shot response to an emitted message
pub type SocketAck = Box<dyn FnOnce(Vec<Value>) + Send>;

/// Handler for socket lifecycle events
pub type SocketEventHandler = Arc<dyn Fn(&SocketEvent) + Send + Sync>;

/// Handler for manager events
pub type ManagerEventHandler = Arc<dyn Fn(&ManagerEvent) + Send + Sync>;

/// Creates managers; one call per physical connection
pub trait Connector: Send + Sync {
    /// Create a manager for an endpoint URL
    fn connect(&self, endpoint: &Url, options: &ConnectOptions) -> SessionResult<Arc<dyn Manager>>;
}

/// One physical connection multiplexing namespaces
pub trait Manager: Send + Sync {
    /// Endpoint URL this manager connects to
    fn uri(&self) -> String;

    fn ready_state(&self) -> ReadyState;

    /// Whether the connection opens without an explicit `Socket::open`
    fn auto_connect(&self) -> bool;

    /// Whether the reconnection policy is enabled
    fn reconnection(&self) -> bool;

    /// Socket for a namespace path (`/`, `/name`) on this connection
    fn socket(&self, namespace: &str) -> SessionResult<Arc<dyn Socket>>;

    /// Delete a namespace entry from the registry
    fn remove_namespace(&self, namespace: &str);

    /// Namespaces currently registered
    fn namespace_count(&self) -> usize;

    fn on(&self, handler: ManagerEventHandler) -> ListenerId;

    fn off(&self, id: ListenerId) -> bool;

    /// Tear down the physical connection
    fn close(&self);
}

/// One namespace on a manager
pub trait Socket: Send + Sync {
    /// Session id assigned by the server, while connected
    fn id(&self) -> Option<String>;

    fn namespace(&self) -> String;

    fn connected(&self) -> bool;

    /// Ask the manager to connect this namespace
    fn open(&self);

    fn disconnect(&self);

    /// Register for lifecycle events
    fn subscribe(&self, handler: SocketEventHandler) -> ListenerId;

    /// Register for a protocol message
    fn on(&self, event: &str, handler: MessageHandler) -> ListenerId;

    fn off(&self, id: ListenerId) -> bool;

    fn remove_all_listeners(&self);

    /// Send a message, optionally asking the peer for a one-shot response
    fn emit(&self, action: &str, data: Value, ack: Option<SocketAck>);
}
