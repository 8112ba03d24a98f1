//! Session Module
//!
//! The session façade, its re-emitted signals and ack correlation.

pub mod ack;
pub mod events;
mod lifecycle;

pub use ack::{AckSlot, AckTable, PendingAck};
pub use events::SessionSignal;
pub use lifecycle::Session;
