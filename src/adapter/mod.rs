//! Connection Adapter Module
//!
//! One namespace link per adapter, translated into canonical signals.

mod connection;
mod state;

pub use connection::{AckCallback, ConnectionAdapter, StartCallback};
pub use state::{AdapterSignal, ConnectionState};
