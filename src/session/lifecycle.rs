//! Session
//!
//! The public face of a namespace connection: start/stop around one adapter,
//! a protocol handler table bound on start, and sends whose ack callback runs
//! exactly once under a timeout.

use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use url::Url;
use uuid::Uuid;

use super::ack::AckTable;
use super::events::SessionSignal;
use crate::adapter::{AckCallback, AdapterSignal, ConnectionAdapter, ConnectionState};
use crate::config::{duration_millis, SessionConfig};
use crate::error::{SessionError, SessionResult};
use crate::events::{ListenerId, SignalHub, SignalKind};
use crate::provider::{Connector, ManagerPool, MessageHandler};
use crate::timers::TimerRegistry;

struct SessionInner {
    id: Uuid,
    ack_timeout: Duration,
    use_timers: bool,
    adapter: ConnectionAdapter,
    /// Message name -> handler, bound onto the adapter at start
    protocol_handlers: Mutex<HashMap<String, MessageHandler>>,
    /// Relays bound on the adapter while started
    lifecycle_listeners: Mutex<Vec<ListenerId>>,
    signals: SignalHub<SessionSignal>,
    /// Timers created through `create_timer`
    timers: TimerRegistry,
    /// Timers bounding pending acks, out of reach of user timer names
    ack_timers: TimerRegistry,
    acks: AckTable,
    namespace: RwLock<String>,
    destroyed: AtomicBool,
}

/// Client session for one namespace of an endpoint.
///
/// Cloning yields another handle to the same session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Create a session whose manager is shared process-wide per endpoint
    pub fn new(config: SessionConfig, connector: Arc<dyn Connector>) -> SessionResult<Self> {
        Self::with_pool(config, connector, ManagerPool::shared())
    }

    /// Create a session drawing managers from `pool`
    pub fn with_pool(
        config: SessionConfig,
        connector: Arc<dyn Connector>,
        pool: Arc<ManagerPool>,
    ) -> SessionResult<Self> {
        config.validate()?;
        let adapter = ConnectionAdapter::new(&config, connector, pool)?;
        let id = Uuid::new_v4();
        info!("Session {} created for {}", id, adapter.url()?);

        Ok(Self {
            inner: Arc::new(SessionInner {
                id,
                ack_timeout: config.ack_timeout(),
                use_timers: config.use_ack_timers,
                adapter,
                protocol_handlers: Mutex::new(HashMap::new()),
                lifecycle_listeners: Mutex::new(Vec::new()),
                signals: SignalHub::new(),
                timers: TimerRegistry::new(),
                ack_timers: TimerRegistry::new(),
                acks: AckTable::new(),
                namespace: RwLock::new(config.namespace),
                destroyed: AtomicBool::new(false),
            }),
        })
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Register a handler for an inbound protocol message.
    ///
    /// Handlers are bound at `start`; registering on a started session only
    /// takes effect after the next restart.
    pub fn register_protocol_handler<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(&[Value]) + Send + Sync + 'static,
    {
        let name = name.into();
        if self.inner.adapter.is_linked() {
            warn!(
                "Session {}: protocol handler {} registered after start; bound at next start",
                self.inner.id, name
            );
        }
        self.inner.protocol_handlers.lock().insert(name, Arc::new(handler));
    }

    /// Remove a protocol handler, unbinding it from a live connection too
    pub fn unregister_protocol_handler(&self, name: &str) -> bool {
        let removed = self.inner.protocol_handlers.lock().remove(name).is_some();
        if removed {
            self.inner.adapter.proxy_off(name);
        }
        removed
    }

    /// Start connecting. `on_ready` runs exactly once unless `stop` or
    /// `destroy` comes first, in which case it is dropped.
    pub fn start<F>(&self, on_ready: F)
    where
        F: FnOnce(SessionResult<()>) + Send + 'static,
    {
        let inner = &self.inner;
        if inner.destroyed.load(Ordering::SeqCst) {
            warn!("Session {}: start after destroy", inner.id);
            on_ready(Err(SessionError::Destroyed));
            return;
        }
        if inner.adapter.is_linked() || !inner.lifecycle_listeners.lock().is_empty() {
            debug!("Session {}: restarting", inner.id);
            self.stop();
        }

        let weak = Arc::downgrade(inner);
        let relays: Vec<ListenerId> = SignalKind::ALL
            .iter()
            .map(|kind| inner.adapter.on(*kind, relay_to(weak.clone())))
            .collect();
        inner.lifecycle_listeners.lock().extend(relays);

        let handlers: Vec<(String, MessageHandler)> = inner
            .protocol_handlers
            .lock()
            .iter()
            .map(|(name, handler)| (name.clone(), handler.clone()))
            .collect();
        debug!("Session {}: binding {} protocol handlers", inner.id, handlers.len());
        for (name, handler) in handlers {
            inner.adapter.proxy_on(name, handler);
        }

        info!("Session {}: starting {}", inner.id, self.namespace());
        inner.adapter.start(on_ready);
    }

    /// Start and wait for the first connection attempt to settle
    pub async fn connect(&self) -> SessionResult<()> {
        let (tx, rx) = oneshot::channel();
        self.start(move |result| {
            let _ = tx.send(result);
        });
        rx.await.unwrap_or(Err(SessionError::Cancelled))
    }

    /// Disconnect and release the connection. Safe to call when never started.
    pub fn stop(&self) {
        let inner = &self.inner;
        let names: Vec<String> = inner.protocol_handlers.lock().keys().cloned().collect();
        for name in &names {
            inner.adapter.proxy_off(name);
        }

        inner.adapter.stop();

        let relays: Vec<ListenerId> = inner.lifecycle_listeners.lock().drain(..).collect();
        for id in relays {
            inner.adapter.off(id);
        }
        debug!("Session {} stopped", inner.id);
    }

    /// Send a message.
    ///
    /// With an ack and timers enabled, the ack receives the response or
    /// [`SessionError::AckTimeout`] after the configured timeout, whichever
    /// comes first. Without timers the ack waits for the response alone.
    pub fn send(&self, action: &str, data: Value, ack: Option<AckCallback>) {
        match ack {
            Some(ack) if self.inner.use_timers => {
                self.send_with_timeout(action, data, self.inner.ack_timeout, ack);
            }
            ack => {
                if self.inner.destroyed.load(Ordering::SeqCst) {
                    warn!("Session {}: send {} after destroy", self.inner.id, action);
                    if let Some(ack) = ack {
                        ack(Err(SessionError::Destroyed));
                    }
                    return;
                }
                self.inner.adapter.send(action, data, ack);
            }
        }
    }

    /// Send without asking for a response
    pub fn emit(&self, action: &str, data: Value) {
        self.send(action, data, None);
    }

    /// Send with an ack bounded by `timeout` instead of the configured default
    pub fn send_with_timeout(&self, action: &str, data: Value, timeout: Duration, ack: AckCallback) {
        let inner = &self.inner;
        if inner.destroyed.load(Ordering::SeqCst) {
            warn!("Session {}: send {} after destroy", inner.id, action);
            ack(Err(SessionError::Destroyed));
            return;
        }

        let pending = inner.acks.insert(action, timeout, ack);
        let seq = pending.seq();

        let weak = Arc::downgrade(inner);
        let armed = inner.ack_timers.create(pending.timer_name(), timeout, move || {
            let Some(inner) = weak.upgrade() else { return };
            if let Some(pending) = inner.acks.remove(seq) {
                warn!(
                    "Session {}: no ack for {} within {:?}",
                    inner.id,
                    pending.action(),
                    pending.timeout()
                );
                pending.resolve(Err(SessionError::AckTimeout {
                    action: pending.action().to_string(),
                    timeout_ms: duration_millis(pending.timeout()),
                }));
            }
        });
        if let Err(e) = armed {
            error!("Session {}: cannot arm ack timer for {}: {}", inner.id, action, e);
            if let Some(pending) = inner.acks.remove(seq) {
                pending.resolve(Err(e));
            }
            return;
        }

        let weak: Weak<SessionInner> = Arc::downgrade(inner);
        inner.adapter.send(
            action,
            data,
            Some(Box::new(move |result| {
                let Some(inner) = weak.upgrade() else { return };
                let Some(pending) = inner.acks.remove(seq) else {
                    debug!("Session {}: late ack #{} ignored", inner.id, seq);
                    return;
                };
                inner.ack_timers.clear(pending.timer_name());
                debug!(
                    "Session {}: ack for {} after {:?}",
                    inner.id,
                    pending.action(),
                    pending.elapsed()
                );
                pending.resolve(result);
            })),
        );
    }

    /// Send and wait for the ack.
    ///
    /// With timers disabled this waits until the peer answers.
    pub async fn request(&self, action: &str, data: Value) -> SessionResult<Vec<Value>> {
        let (tx, rx) = oneshot::channel();
        self.send(
            action,
            data,
            Some(Box::new(move |result| {
                let _ = tx.send(result);
            })),
        );
        rx.await.unwrap_or(Err(SessionError::Cancelled))
    }

    /// Cancel every timer and pending ack without running them, then tear
    /// the connection down. Idempotent.
    pub fn destroy(&self) {
        let inner = &self.inner;
        if inner.destroyed.swap(true, Ordering::SeqCst) {
            debug!("Session {} already destroyed", inner.id);
            return;
        }

        let timers = inner.timers.close() + inner.ack_timers.close();
        let pending = inner.acks.drain();
        for ack in &pending {
            ack.cancel();
        }

        self.stop();
        inner.adapter.destroy();
        inner.protocol_handlers.lock().clear();
        inner.signals.clear();

        info!(
            "Session {} destroyed ({} timers, {} pending acks dropped)",
            inner.id,
            timers,
            pending.len()
        );
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }

    pub fn namespace(&self) -> String {
        self.inner.namespace.read().clone()
    }

    /// Rename the namespace; applies at the next `start`
    pub fn set_namespace(&self, namespace: impl Into<String>) {
        let namespace = namespace.into();
        *self.inner.namespace.write() = namespace.clone();
        self.inner.adapter.set_namespace(namespace);
    }

    /// Listen for a lifecycle signal
    pub fn on<F>(&self, kind: SignalKind, handler: F) -> ListenerId
    where
        F: Fn(&SessionSignal) + Send + Sync + 'static,
    {
        self.inner.signals.on(kind, Arc::new(handler))
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.inner.signals.off(id)
    }

    /// Start a named timer, replacing a pending one of the same name
    pub fn create_timer<F>(&self, name: impl Into<String>, delay: Duration, callback: F) -> SessionResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.timers.create(name, delay, callback)
    }

    pub fn clear_timer(&self, name: &str) -> bool {
        self.inner.timers.clear(name)
    }

    /// Outstanding timers, ack timers included
    pub fn timer_count(&self) -> usize {
        self.inner.timers.len() + self.inner.ack_timers.len()
    }

    pub fn pending_acks(&self) -> usize {
        self.inner.acks.len()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.adapter.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn socket_id(&self) -> Option<String> {
        self.inner.adapter.socket_id()
    }

    pub fn url(&self) -> SessionResult<Url> {
        self.inner.adapter.url()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("namespace", &*self.inner.namespace.read())
            .field("state", &self.state())
            .finish()
    }
}

fn relay_to(weak: Weak<SessionInner>) -> impl Fn(&AdapterSignal) + Send + Sync + 'static {
    move |signal: &AdapterSignal| {
        let Some(inner) = weak.upgrade() else { return };
        let session = Session { inner };
        let relayed = SessionSignal::relay(session.clone(), signal);
        session.inner.signals.emit(&relayed);
    }
}
