//! Signals
//!
//! Canonical lifecycle signals and the typed listener table both the adapter
//! and the session publish them through.

use dashmap::DashMap;
use log::debug;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// Handle returned by every `on`-style registration, used to unregister
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl ListenerId {
    /// Allocate a process-unique id
    pub fn next() -> Self {
        Self(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// The closed set of lifecycle signals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Connected,
    Disconnected,
    Error,
}

impl SignalKind {
    pub const ALL: [SignalKind; 3] = [SignalKind::Connected, SignalKind::Disconnected, SignalKind::Error];
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connected => write!(f, "connected"),
            Self::Disconnected => write!(f, "disconnected"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// A value that can be published through a [`SignalHub`]
pub trait Signal: Send + Sync {
    fn kind(&self) -> SignalKind;
}

/// Callback registered for one signal kind
pub type SignalHandler<S> = Arc<dyn Fn(&S) + Send + Sync>;

/// Typed listener table keyed by [`ListenerId`]
pub struct SignalHub<S: Signal> {
    listeners: DashMap<ListenerId, (SignalKind, SignalHandler<S>)>,
}

impl<S: Signal> SignalHub<S> {
    pub fn new() -> Self {
        Self {
            listeners: DashMap::new(),
        }
    }

    /// Register a handler for one kind of signal
    pub fn on(&self, kind: SignalKind, handler: SignalHandler<S>) -> ListenerId {
        let id = ListenerId::next();
        self.listeners.insert(id, (kind, handler));
        id
    }

    /// Remove a handler, returning whether it was registered
    pub fn off(&self, id: ListenerId) -> bool {
        self.listeners.remove(&id).is_some()
    }

    /// Deliver a signal to every handler registered for its kind.
    ///
    /// Handlers are snapshotted first and may register or remove listeners.
    pub fn emit(&self, signal: &S) -> usize {
        let kind = signal.kind();
        let mut handlers: Vec<(ListenerId, SignalHandler<S>)> = self
            .listeners
            .iter()
            .filter(|entry| entry.value().0 == kind)
            .map(|entry| (*entry.key(), entry.value().1.clone()))
            .collect();
        handlers.sort_by_key(|(id, _)| *id);

        if handlers.is_empty() {
            debug!("No listeners for {} signal", kind);
        }

        for (_, handler) in &handlers {
            handler(signal);
        }
        handlers.len()
    }

    /// Number of handlers registered for a kind
    pub fn listener_count(&self, kind: SignalKind) -> usize {
        self.listeners.iter().filter(|entry| entry.value().0 == kind).count()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub fn clear(&self) {
        self.listeners.clear();
    }
}

impl<S: Signal> Default for SignalHub<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug)]
    enum Probe {
        Up,
        Down,
    }

    impl Signal for Probe {
        fn kind(&self) -> SignalKind {
            match self {
                Probe::Up => SignalKind::Connected,
                Probe::Down => SignalKind::Disconnected,
            }
        }
    }

    #[test]
    fn test_emit_reaches_matching_kind_only() {
        let hub: SignalHub<Probe> = SignalHub::new();
        let ups = Arc::new(AtomicUsize::new(0));
        let counter = ups.clone();
        hub.on(
            SignalKind::Connected,
            Arc::new(move |_: &Probe| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        assert_eq!(hub.emit(&Probe::Up), 1);
        assert_eq!(hub.emit(&Probe::Down), 0);
        assert_eq!(ups.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_off_unbinds() {
        let hub: SignalHub<Probe> = SignalHub::new();
        let id = hub.on(SignalKind::Connected, Arc::new(|_: &Probe| {}));
        assert_eq!(hub.listener_count(SignalKind::Connected), 1);
        assert!(hub.off(id));
        assert!(!hub.off(id));
        assert!(hub.is_empty());
    }

    #[test]
    fn test_handler_may_unregister_itself() {
        let hub: Arc<SignalHub<Probe>> = Arc::new(SignalHub::new());
        let slot: Arc<parking_lot::Mutex<Option<ListenerId>>> = Arc::new(parking_lot::Mutex::new(None));

        let hub_ref = hub.clone();
        let slot_ref = slot.clone();
        let id = hub.on(
            SignalKind::Connected,
            Arc::new(move |_: &Probe| {
                if let Some(id) = slot_ref.lock().take() {
                    hub_ref.off(id);
                }
            }),
        );
        *slot.lock() = Some(id);

        assert_eq!(hub.emit(&Probe::Up), 1);
        assert_eq!(hub.emit(&Probe::Up), 0);
    }
}
