//! Socket Session
//!
//! Client-side lifecycle management for reconnecting, multiplexed namespace
//! connections:
//! - [`Session`]: start/stop, protocol handlers, sends with ack timeouts
//! - [`ConnectionAdapter`]: one namespace link translated into canonical signals
//! - [`ManagerPool`]: managers shared per endpoint, closed with their last namespace
//!
//! The physical transport is supplied through the [`provider`] traits.

pub mod adapter;
pub mod config;
pub mod error;
pub mod events;
pub mod provider;
pub mod session;
pub mod timers;

pub use adapter::{AdapterSignal, ConnectionAdapter, ConnectionState};
pub use config::{ConnectOptions, Endpoint, SessionConfig, TransportKind};
pub use error::{SessionError, SessionResult};
pub use events::{ListenerId, SignalKind};
pub use provider::{Connector, Manager, ManagerPool, Socket};
pub use session::{Session, SessionSignal};
pub use timers::TimerRegistry;
