//! Connection Adapter
//!
//! Owns the one socket/manager pair of a session. Sequences the open
//! handshake, maps provider events onto [`AdapterSignal`]s and hands the
//! namespace back to the pool on stop.

use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use url::Url;

use super::state::{AdapterSignal, ConnectionState};
use crate::config::{ConnectOptions, Endpoint, SessionConfig};
use crate::error::{SessionError, SessionResult};
use crate::events::{ListenerId, SignalHub, SignalKind};
use crate::provider::{
    Connector, Manager, ManagerEvent, ManagerPool, MessageHandler, PoolLease, ReadyState, Socket, SocketAck,
    SocketEvent, CLIENT_DISCONNECT_REASON,
};

const SOCKET_LOG: &str = "socket_session::socket";
const MANAGER_LOG: &str = "socket_session::manager";

/// Completion callback of [`ConnectionAdapter::start`]
pub type StartCallback = Box<dyn FnOnce(SessionResult<()>) + Send>;

/// One-shot response callback of [`ConnectionAdapter::send`]
pub type AckCallback = Box<dyn FnOnce(SessionResult<Vec<Value>>) + Send>;

/// Pending wait for the manager to open
struct OpenWait {
    manager: Arc<dyn Manager>,
    listener: Mutex<Option<ListenerId>>,
    callback: Mutex<Option<StartCallback>>,
}

impl OpenWait {
    /// Register a one-shot listener for `open` / `connect_error`
    fn attach(manager: Arc<dyn Manager>, callback: StartCallback) -> Arc<Self> {
        let wait = Arc::new(Self {
            manager: manager.clone(),
            listener: Mutex::new(None),
            callback: Mutex::new(Some(callback)),
        });

        let weak: Weak<OpenWait> = Arc::downgrade(&wait);
        let reconnection_manager = manager.clone();
        let id = manager.on(Arc::new(move |event: &ManagerEvent| {
            let Some(wait) = weak.upgrade() else { return };
            match event {
                ManagerEvent::Open => wait.complete(Ok(())),
                ManagerEvent::ConnectError(reason) => {
                    if reconnection_manager.reconnection() {
                        debug!(target: MANAGER_LOG, "connect_error ({}), provider keeps retrying", reason);
                        wait.complete(Ok(()));
                    } else {
                        wait.complete(Err(SessionError::ConnectFailed(reason.clone())));
                    }
                }
                _ => {}
            }
        }));
        *wait.listener.lock() = Some(id);
        wait
    }

    fn detach(&self) {
        let id = self.listener.lock().take();
        if let Some(id) = id {
            self.manager.off(id);
        }
    }

    fn complete(&self, result: SessionResult<()>) {
        self.detach();
        let callback = self.callback.lock().take();
        if let Some(callback) = callback {
            callback(result);
        }
    }

    /// Drop the callback uninvoked; returns whether one was still pending
    fn cancel(&self) -> bool {
        self.detach();
        self.callback.lock().take().is_some()
    }
}

/// Everything held while a namespace is open
struct Link {
    lease: PoolLease,
    socket_listener: ListenerId,
    manager_listener: ListenerId,
    /// Message name -> listener bound on the socket
    proxy_listeners: HashMap<String, ListenerId>,
    open_wait: Option<Arc<OpenWait>>,
}

struct AdapterInner {
    endpoint: Endpoint,
    namespace: RwLock<String>,
    options: ConnectOptions,
    connector: Arc<dyn Connector>,
    pool: Arc<ManagerPool>,
    signals: SignalHub<AdapterSignal>,
    proxies: Mutex<HashMap<String, MessageHandler>>,
    link: Mutex<Option<Link>>,
    state: RwLock<ConnectionState>,
    /// Id recorded on the last `connect`
    socket_id: RwLock<Option<String>>,
}

impl AdapterInner {
    fn current_socket(&self) -> Option<Arc<dyn Socket>> {
        self.link.lock().as_ref().map(|link| link.lease.socket().clone())
    }

    fn current_manager(&self) -> Option<Arc<dyn Manager>> {
        self.link.lock().as_ref().map(|link| link.lease.manager().clone())
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = std::mem::replace(&mut *self.state.write(), state);
        if previous != state {
            debug!("Adapter {} state: {} -> {}", self.namespace.read(), previous, state);
        }
    }

    fn on_socket_event(&self, event: &SocketEvent) {
        let namespace = self.namespace.read().clone();
        match event {
            SocketEvent::Connect => {
                let id = self.current_socket().and_then(|socket| socket.id());
                info!(target: SOCKET_LOG, "connect {} ({})", namespace, id.as_deref().unwrap_or("-"));
                *self.socket_id.write() = id;
                self.set_state(ConnectionState::Connected);
                self.signals.emit(&AdapterSignal::Connected);
            }
            SocketEvent::Disconnect(reason) => {
                let id = self.socket_id.read().clone();
                info!(
                    target: SOCKET_LOG,
                    "disconnect {} ({}): {}",
                    namespace,
                    id.as_deref().unwrap_or("-"),
                    reason
                );
                let client_initiated = reason == CLIENT_DISCONNECT_REASON;
                let reconnection = self
                    .current_manager()
                    .map(|manager| manager.reconnection())
                    .unwrap_or(false);

                if client_initiated {
                    self.signals.emit(&AdapterSignal::Disconnected { reason: reason.clone() });
                } else if reconnection {
                    self.set_state(ConnectionState::Reconnecting);
                    self.signals.emit(&AdapterSignal::Disconnected { reason: reason.clone() });
                } else {
                    self.set_state(ConnectionState::Stopped);
                    self.signals.emit(&AdapterSignal::Disconnected { reason: reason.clone() });
                    error!(target: SOCKET_LOG, "disconnect without reconnection on {}", namespace);
                    self.signals.emit(&AdapterSignal::Error(SessionError::DisconnectWithoutReconnection {
                        reason: reason.clone(),
                    }));
                }
            }
            SocketEvent::Error(message) => {
                warn!(target: SOCKET_LOG, "error on {}: {}", namespace, message);
                self.signals
                    .emit(&AdapterSignal::Error(SessionError::Transport(message.clone())));
            }
            SocketEvent::Reconnect(attempt) => {
                info!(target: SOCKET_LOG, "reconnect {} after {} attempts", namespace, attempt);
            }
            SocketEvent::ReconnectAttempt(attempt) => {
                debug!(target: SOCKET_LOG, "reconnect_attempt {} #{}", namespace, attempt);
            }
            SocketEvent::Reconnecting(attempt) => {
                debug!(target: SOCKET_LOG, "reconnecting {} #{}", namespace, attempt);
                self.set_state(ConnectionState::Reconnecting);
            }
            SocketEvent::ReconnectError(description) => {
                warn!(
                    target: SOCKET_LOG,
                    "reconnect error on {}: {}",
                    namespace,
                    description.as_deref().unwrap_or("unknown")
                );
                self.signals.emit(&AdapterSignal::Error(SessionError::ReconnectError {
                    description: description.clone(),
                }));
            }
            SocketEvent::ReconnectFailed => {
                error!(target: SOCKET_LOG, "reconnect failed on {}", namespace);
                self.set_state(ConnectionState::Stopped);
                self.signals.emit(&AdapterSignal::Error(SessionError::ReconnectFailed));
            }
        }
    }

    /// Unbind everything a link holds and hand the namespace back to the pool
    fn release_link(&self, link: Link) {
        let Link {
            lease,
            socket_listener,
            manager_listener,
            proxy_listeners,
            open_wait,
        } = link;

        if let Some(wait) = open_wait {
            if wait.cancel() {
                debug!("Dropped pending start callback for {}", lease.namespace());
            }
        }

        let socket = lease.socket().clone();
        socket.disconnect();
        for (_, id) in proxy_listeners {
            socket.off(id);
        }
        socket.off(socket_listener);
        socket.remove_all_listeners();
        lease.manager().off(manager_listener);
        *self.socket_id.write() = None;

        let namespace = lease.namespace().to_string();
        if self.pool.release(lease) {
            info!("Released {}; manager closed", namespace);
        } else {
            debug!("Released {}; manager still in use", namespace);
        }
    }
}

impl Drop for AdapterInner {
    fn drop(&mut self) {
        if let Some(link) = self.link.get_mut().take() {
            debug!("Adapter dropped while linked; releasing {}", link.lease.namespace());
            self.release_link(link);
        }
    }
}

/// Owns the physical connection of one namespace
pub struct ConnectionAdapter {
    inner: Arc<AdapterInner>,
}

impl ConnectionAdapter {
    /// Create a stopped adapter for the endpoint and namespace of `config`
    pub fn new(config: &SessionConfig, connector: Arc<dyn Connector>, pool: Arc<ManagerPool>) -> SessionResult<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(AdapterInner {
                endpoint: config.endpoint()?,
                namespace: RwLock::new(config.namespace.clone()),
                options: config.connection.clone(),
                connector,
                pool,
                signals: SignalHub::new(),
                proxies: Mutex::new(HashMap::new()),
                link: Mutex::new(None),
                state: RwLock::new(ConnectionState::Stopped),
                socket_id: RwLock::new(None),
            }),
        })
    }

    /// Open the namespace and report the outcome of the first attempt once.
    ///
    /// `callback` receives `Ok` once the manager is open, or right away when
    /// it already is. A failed attempt is an error only when the manager will
    /// not reconnect. A `stop` before either drops the callback.
    pub fn start<F>(&self, callback: F)
    where
        F: FnOnce(SessionResult<()>) + Send + 'static,
    {
        let callback: StartCallback = Box::new(callback);
        let inner = &self.inner;

        if inner.link.lock().is_some() {
            debug!("Adapter already linked; stopping before restart");
            self.stop();
        }

        let namespace = self.namespace();
        let options = inner.options.websocket_only();
        match inner.endpoint.namespace_url(&namespace) {
            Ok(url) => info!("Connecting to {}", url),
            Err(e) => warn!("Cannot compose URL for {}: {}", namespace, e),
        }

        let lease = match inner.pool.open(inner.connector.as_ref(), &inner.endpoint, &namespace, &options) {
            Ok(lease) => lease,
            Err(e) => {
                error!("Failed to open {} on {}: {}", namespace, inner.endpoint, e);
                inner.signals.emit(&AdapterSignal::Error(e.clone()));
                callback(Err(e));
                return;
            }
        };
        let socket = lease.socket().clone();
        let manager = lease.manager().clone();

        let uri = manager.uri();
        let manager_listener = manager.on(Arc::new(move |event: &ManagerEvent| log_manager_event(&uri, event)));

        let weak = Arc::downgrade(inner);
        let socket_listener = socket.subscribe(Arc::new(move |event: &SocketEvent| {
            if let Some(inner) = weak.upgrade() {
                inner.on_socket_event(event);
            }
        }));

        let proxies: Vec<(String, MessageHandler)> = inner
            .proxies
            .lock()
            .iter()
            .map(|(name, handler)| (name.clone(), handler.clone()))
            .collect();
        let proxy_listeners = proxies
            .into_iter()
            .map(|(name, handler)| {
                let id = socket.on(&name, handler);
                (name, id)
            })
            .collect();

        inner.set_state(ConnectionState::Connecting);

        let (open_wait, ready_now) = if manager.ready_state() == ReadyState::Open {
            (None, Some(callback))
        } else {
            (Some(OpenWait::attach(manager.clone(), callback)), None)
        };

        *inner.link.lock() = Some(Link {
            lease,
            socket_listener,
            manager_listener,
            proxy_listeners,
            open_wait,
        });

        if !socket.connected() && !manager.auto_connect() {
            socket.open();
        }

        if let Some(callback) = ready_now {
            debug!("Manager {} already open", manager.uri());
            callback(Ok(()));
        }
    }

    /// Tear the link down. Safe to call when never started.
    pub fn stop(&self) {
        let link = self.inner.link.lock().take();
        self.inner.set_state(ConnectionState::Stopped);
        match link {
            Some(link) => self.inner.release_link(link),
            None => debug!("Adapter {} not linked; nothing to stop", self.namespace()),
        }
    }

    /// Emit a message. Without a link the ack receives
    /// [`SessionError::SendWithoutConnection`] right away.
    pub fn send(&self, action: &str, data: Value, ack: Option<AckCallback>) {
        match self.inner.current_socket() {
            Some(socket) => {
                let ack = ack.map(|ack| -> SocketAck { Box::new(move |values: Vec<Value>| ack(Ok(values))) });
                socket.emit(action, data, ack);
            }
            None => {
                let err = SessionError::SendWithoutConnection {
                    action: action.to_string(),
                };
                error!("{}", err);
                if let Some(ack) = ack {
                    ack(Err(err));
                }
            }
        }
    }

    /// Register a pass-through handler, binding it at once when linked
    pub fn proxy_on(&self, name: impl Into<String>, handler: MessageHandler) {
        let name = name.into();
        if self
            .inner
            .proxies
            .lock()
            .insert(name.clone(), handler.clone())
            .is_some()
        {
            debug!("Replacing proxy handler {}", name);
        }

        let live = {
            let mut link = self.inner.link.lock();
            link.as_mut()
                .map(|link| (link.lease.socket().clone(), link.proxy_listeners.remove(&name)))
        };
        let Some((socket, previous)) = live else { return };

        if let Some(previous) = previous {
            socket.off(previous);
        }
        let id = socket.on(&name, handler);

        let bound = {
            let mut link = self.inner.link.lock();
            match link.as_mut() {
                Some(link) if Arc::ptr_eq(link.lease.socket(), &socket) => {
                    link.proxy_listeners.insert(name, id);
                    true
                }
                _ => false,
            }
        };
        if !bound {
            socket.off(id);
        }
    }

    /// Remove a pass-through handler, detaching it from a live socket
    pub fn proxy_off(&self, name: &str) -> bool {
        let removed = self.inner.proxies.lock().remove(name).is_some();
        let live = {
            let mut link = self.inner.link.lock();
            link.as_mut().and_then(|link| {
                link.proxy_listeners
                    .remove(name)
                    .map(|id| (link.lease.socket().clone(), id))
            })
        };
        if let Some((socket, id)) = live {
            socket.off(id);
        }
        removed
    }

    /// Number of registered pass-through handlers
    pub fn proxy_count(&self) -> usize {
        self.inner.proxies.lock().len()
    }

    /// Stop, then forget proxies and signal listeners
    pub fn destroy(&self) {
        self.stop();
        self.inner.proxies.lock().clear();
        self.inner.signals.clear();
    }

    pub fn on<F>(&self, kind: SignalKind, handler: F) -> ListenerId
    where
        F: Fn(&AdapterSignal) + Send + Sync + 'static,
    {
        self.inner.signals.on(kind, Arc::new(handler))
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.inner.signals.off(id)
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.read()
    }

    pub fn is_linked(&self) -> bool {
        self.inner.link.lock().is_some()
    }

    pub fn namespace(&self) -> String {
        self.inner.namespace.read().clone()
    }

    /// Rename the namespace; a live link keeps its namespace until restarted
    pub fn set_namespace(&self, namespace: impl Into<String>) {
        let namespace = namespace.into();
        if self.is_linked() {
            warn!(
                "Namespace changed to {} while linked; takes effect at next start",
                namespace
            );
        }
        *self.inner.namespace.write() = namespace;
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    /// URL of the configured namespace
    pub fn url(&self) -> SessionResult<Url> {
        self.inner.endpoint.namespace_url(&self.namespace())
    }

    /// Id assigned on the last connect, cleared on stop
    pub fn socket_id(&self) -> Option<String> {
        self.inner.socket_id.read().clone()
    }
}

fn log_manager_event(uri: &str, event: &ManagerEvent) {
    match event {
        ManagerEvent::Open => info!(target: MANAGER_LOG, "open {}", uri),
        ManagerEvent::ConnectError(reason) => warn!(target: MANAGER_LOG, "connect_error {}: {}", uri, reason),
        ManagerEvent::ConnectTimeout => warn!(target: MANAGER_LOG, "connect_timeout {}", uri),
        ManagerEvent::Reconnect(attempt) => info!(target: MANAGER_LOG, "reconnect {} after {} attempts", uri, attempt),
        ManagerEvent::ReconnectAttempt(attempt) => debug!(target: MANAGER_LOG, "reconnect_attempt {} #{}", uri, attempt),
        ManagerEvent::Reconnecting(attempt) => debug!(target: MANAGER_LOG, "reconnecting {} #{}", uri, attempt),
        ManagerEvent::ReconnectError(reason) => warn!(target: MANAGER_LOG, "reconnect_error {}: {}", uri, reason),
        ManagerEvent::ReconnectFailed => error!(target: MANAGER_LOG, "reconnect_failed {}", uri),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::memory::{MemoryConnector, MemoryManager, MemorySocket};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config(options: ConnectOptions) -> SessionConfig {
        SessionConfig::new("http://localhost", 22223)
            .with_namespace("live")
            .with_connection(options)
    }

    fn adapter(connector: &Arc<MemoryConnector>, pool: &Arc<ManagerPool>, options: ConnectOptions) -> ConnectionAdapter {
        ConnectionAdapter::new(&config(options), connector.clone(), pool.clone()).unwrap()
    }

    fn record(adapter: &ConnectionAdapter) -> Arc<Mutex<Vec<AdapterSignal>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        for kind in SignalKind::ALL {
            let log = log.clone();
            adapter.on(kind, move |signal| log.lock().push(signal.clone()));
        }
        log
    }

    fn results() -> (Arc<Mutex<Vec<SessionResult<()>>>>, impl FnOnce(SessionResult<()>) + Send + 'static) {
        let results = Arc::new(Mutex::new(Vec::new()));
        let sink = results.clone();
        (results, move |result| sink.lock().push(result))
    }

    fn live(connector: &MemoryConnector) -> (Arc<MemoryManager>, Arc<MemorySocket>) {
        let manager = connector.last_manager().unwrap();
        let socket = manager.memory_socket("/live").unwrap();
        (manager, socket)
    }

    fn no_reconnection() -> ConnectOptions {
        ConnectOptions {
            reconnection_enabled: false,
            ..ConnectOptions::default()
        }
    }

    #[test]
    fn test_start_reports_ready_on_open() {
        let connector = Arc::new(MemoryConnector::new());
        let pool = Arc::new(ManagerPool::new());
        let adapter = adapter(&connector, &pool, ConnectOptions::default());
        let signals = record(&adapter);
        let (outcomes, callback) = results();

        adapter.start(callback);
        assert_eq!(adapter.state(), ConnectionState::Connecting);
        assert!(outcomes.lock().is_empty());

        let (manager, _) = live(&connector);
        manager.complete_open();

        assert_eq!(*outcomes.lock(), vec![Ok(())]);
        assert_eq!(*signals.lock(), vec![AdapterSignal::Connected]);
        assert_eq!(adapter.state(), ConnectionState::Connected);
        assert!(adapter.socket_id().is_some());
        assert_eq!(manager.options().transports, vec![crate::config::TransportKind::WebSocket]);
    }

    #[test]
    fn test_connect_error_without_reconnection_fails_once() {
        let connector = Arc::new(MemoryConnector::new());
        let pool = Arc::new(ManagerPool::new());
        let adapter = adapter(&connector, &pool, no_reconnection());
        let signals = record(&adapter);
        let (outcomes, callback) = results();

        adapter.start(callback);
        let (manager, _) = live(&connector);
        manager.fail_open("ECONNREFUSED");
        manager.fail_open("ECONNREFUSED");

        assert_eq!(
            *outcomes.lock(),
            vec![Err(SessionError::ConnectFailed("ECONNREFUSED".into()))]
        );
        assert!(signals.lock().is_empty());
    }

    #[test]
    fn test_connect_error_with_reconnection_reports_ready_then_exhausts() {
        let connector = Arc::new(MemoryConnector::new());
        let pool = Arc::new(ManagerPool::new());
        let options = ConnectOptions {
            reconnection_attempts: Some(1),
            ..ConnectOptions::default()
        };
        let adapter = adapter(&connector, &pool, options);
        let signals = record(&adapter);
        let (outcomes, callback) = results();

        adapter.start(callback);
        let (manager, _) = live(&connector);
        manager.fail_open("ECONNREFUSED");
        assert_eq!(*outcomes.lock(), vec![Ok(())]);

        assert_eq!(manager.exhaust_reconnection("ECONNREFUSED"), 1);
        assert!(!manager.fail_reconnect("ECONNREFUSED"));

        let signals = signals.lock();
        assert_eq!(
            *signals,
            vec![
                AdapterSignal::Error(SessionError::ReconnectError {
                    description: Some("ECONNREFUSED".into())
                }),
                AdapterSignal::Error(SessionError::ReconnectFailed),
            ]
        );
        let terminal = signals
            .iter()
            .filter(|s| matches!(s, AdapterSignal::Error(e) if e.is_terminal()))
            .count();
        assert_eq!(terminal, 1);
        assert_eq!(adapter.state(), ConnectionState::Stopped);
    }

    #[test]
    fn test_open_manager_completes_immediately() {
        let connector = Arc::new(MemoryConnector::new());
        let pool = Arc::new(ManagerPool::new());
        let first = adapter(&connector, &pool, ConnectOptions::default());
        first.start(|_| {});
        connector.last_manager().unwrap().complete_open();

        let second = ConnectionAdapter::new(
            &SessionConfig::new("http://localhost", 22223).with_namespace("chat"),
            connector.clone(),
            pool.clone(),
        )
        .unwrap();
        let (outcomes, callback) = results();
        second.start(callback);

        assert_eq!(*outcomes.lock(), vec![Ok(())]);
        assert_eq!(connector.managers_created(), 1);
    }

    #[test]
    fn test_stop_before_open_drops_callback() {
        let connector = Arc::new(MemoryConnector::new());
        let pool = Arc::new(ManagerPool::new());
        let adapter = adapter(&connector, &pool, ConnectOptions::default());
        let (outcomes, callback) = results();

        adapter.start(callback);
        let (manager, socket) = live(&connector);
        adapter.stop();

        manager.complete_open();
        assert!(outcomes.lock().is_empty());
        assert!(manager.is_closed());
        assert_eq!(manager.listener_count(), 0);
        assert_eq!(socket.lifecycle_listener_count(), 0);
        assert_eq!(adapter.state(), ConnectionState::Stopped);
    }

    #[test]
    fn test_stop_without_start() {
        let connector = Arc::new(MemoryConnector::new());
        let pool = Arc::new(ManagerPool::new());
        let adapter = adapter(&connector, &pool, ConnectOptions::default());
        adapter.stop();
        assert_eq!(adapter.state(), ConnectionState::Stopped);
        assert!(!adapter.is_linked());
    }

    #[test]
    fn test_restart_keeps_single_link() {
        let connector = Arc::new(MemoryConnector::new());
        let pool = Arc::new(ManagerPool::new());
        let adapter = adapter(&connector, &pool, ConnectOptions::default());

        adapter.start(|_| {});
        adapter.start(|_| {});
        assert_eq!(pool.manager_count(), 1);
        assert!(connector.managers()[0].is_closed());
    }

    #[test]
    fn test_send_without_socket_reports_error() {
        let connector = Arc::new(MemoryConnector::new());
        let pool = Arc::new(ManagerPool::new());
        let adapter = adapter(&connector, &pool, ConnectOptions::default());
        let outcome = Arc::new(Mutex::new(None));
        let sink = outcome.clone();

        adapter.send(
            "update",
            json!({"score": 1}),
            Some(Box::new(move |result| *sink.lock() = Some(result))),
        );

        assert_eq!(
            *outcome.lock(),
            Some(Err(SessionError::SendWithoutConnection {
                action: "update".into()
            }))
        );
    }

    #[test]
    fn test_send_wraps_response() {
        let connector = Arc::new(MemoryConnector::new());
        let pool = Arc::new(ManagerPool::new());
        let adapter = adapter(&connector, &pool, ConnectOptions::default());
        adapter.start(|_| {});
        let (manager, socket) = live(&connector);
        manager.complete_open();

        let outcome = Arc::new(Mutex::new(None));
        let sink = outcome.clone();
        adapter.send(
            "ping",
            json!({}),
            Some(Box::new(move |result| *sink.lock() = Some(result))),
        );
        adapter.send("fire", json!(1), None);

        assert_eq!(socket.pending_ack_count(), 1);
        assert!(socket.respond("ping", vec![json!("pong")]));
        assert_eq!(*outcome.lock(), Some(Ok(vec![json!("pong")])));
        assert_eq!(socket.sent().len(), 2);
    }

    #[test]
    fn test_proxy_handlers_follow_the_socket() {
        let connector = Arc::new(MemoryConnector::new());
        let pool = Arc::new(ManagerPool::new());
        let adapter = adapter(&connector, &pool, ConnectOptions::default());
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = hits.clone();
        adapter.proxy_on(
            "chat",
            Arc::new(move |_: &[Value]| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        adapter.start(|_| {});
        let (_, socket) = live(&connector);

        assert_eq!(socket.deliver("chat", &[json!("hi")]), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let counter = hits.clone();
        adapter.proxy_on(
            "chat",
            Arc::new(move |_: &[Value]| {
                counter.fetch_add(10, Ordering::SeqCst);
            }),
        );
        assert_eq!(socket.handler_count("chat"), 1);
        socket.deliver("chat", &[]);
        assert_eq!(hits.load(Ordering::SeqCst), 11);

        assert!(adapter.proxy_off("chat"));
        assert_eq!(socket.deliver("chat", &[]), 0);
        assert!(!adapter.proxy_off("chat"));
    }

    #[test]
    fn test_disconnect_without_reconnection_is_an_error() {
        let connector = Arc::new(MemoryConnector::new());
        let pool = Arc::new(ManagerPool::new());
        let adapter = adapter(&connector, &pool, no_reconnection());
        let signals = record(&adapter);
        adapter.start(|_| {});
        let (manager, _) = live(&connector);
        manager.complete_open();

        manager.drop_connection("transport close");

        assert_eq!(
            *signals.lock(),
            vec![
                AdapterSignal::Connected,
                AdapterSignal::Disconnected {
                    reason: "transport close".into()
                },
                AdapterSignal::Error(SessionError::DisconnectWithoutReconnection {
                    reason: "transport close".into()
                }),
            ]
        );
        assert_eq!(adapter.state(), ConnectionState::Stopped);
    }

    #[test]
    fn test_client_disconnect_is_not_an_error() {
        let connector = Arc::new(MemoryConnector::new());
        let pool = Arc::new(ManagerPool::new());
        let adapter = adapter(&connector, &pool, no_reconnection());
        let signals = record(&adapter);
        adapter.start(|_| {});
        connector.last_manager().unwrap().complete_open();

        adapter.stop();
        assert_eq!(
            *signals.lock(),
            vec![
                AdapterSignal::Connected,
                AdapterSignal::Disconnected {
                    reason: CLIENT_DISCONNECT_REASON.into()
                },
            ]
        );
        assert!(adapter.socket_id().is_none());
    }

    #[test]
    fn test_reconnect_refires_connected() {
        let connector = Arc::new(MemoryConnector::new());
        let pool = Arc::new(ManagerPool::new());
        let adapter = adapter(&connector, &pool, ConnectOptions::default());
        let signals = record(&adapter);
        adapter.start(|_| {});
        let (manager, _) = live(&connector);
        manager.complete_open();

        manager.drop_connection("ping timeout");
        assert_eq!(adapter.state(), ConnectionState::Reconnecting);
        manager.complete_reconnect();

        assert_eq!(adapter.state(), ConnectionState::Connected);
        let connected = signals
            .lock()
            .iter()
            .filter(|s| **s == AdapterSignal::Connected)
            .count();
        assert_eq!(connected, 2);
    }

    #[test]
    fn test_socket_error_maps_to_transport() {
        let connector = Arc::new(MemoryConnector::new());
        let pool = Arc::new(ManagerPool::new());
        let adapter = adapter(&connector, &pool, ConnectOptions::default());
        let signals = record(&adapter);
        adapter.start(|_| {});
        connector.last_manager().unwrap().socket_error("unauthorized");

        assert_eq!(
            *signals.lock(),
            vec![AdapterSignal::Error(SessionError::Transport("unauthorized".into()))]
        );
    }

    #[test]
    fn test_shared_manager_outlives_first_stop() {
        let connector = Arc::new(MemoryConnector::new());
        let pool = Arc::new(ManagerPool::new());
        let first = adapter(&connector, &pool, ConnectOptions::default());
        let second = ConnectionAdapter::new(
            &SessionConfig::new("http://localhost", 22223),
            connector.clone(),
            pool.clone(),
        )
        .unwrap();

        first.start(|_| {});
        second.start(|_| {});
        let manager = connector.last_manager().unwrap();
        assert_eq!(connector.managers_created(), 1);

        first.stop();
        assert!(!manager.is_closed());
        second.stop();
        assert!(manager.is_closed());
    }

    #[test]
    fn test_manual_connect_asks_socket_to_open() {
        let connector = Arc::new(MemoryConnector::new());
        let pool = Arc::new(ManagerPool::new());
        let options = ConnectOptions {
            auto_connect: false,
            ..ConnectOptions::default()
        };
        let adapter = adapter(&connector, &pool, options);
        adapter.start(|_| {});
        assert_eq!(connector.last_manager().unwrap().open_requests(), 1);
    }

    #[test]
    fn test_provider_refusal_reports_error() {
        let connector = Arc::new(MemoryConnector::new());
        connector.refuse_connections("no route to host");
        let pool = Arc::new(ManagerPool::new());
        let adapter = adapter(&connector, &pool, ConnectOptions::default());
        let signals = record(&adapter);
        let (outcomes, callback) = results();

        adapter.start(callback);

        let expected = SessionError::ConnectFailed("no route to host".into());
        assert_eq!(*outcomes.lock(), vec![Err(expected.clone())]);
        assert_eq!(*signals.lock(), vec![AdapterSignal::Error(expected)]);
        assert!(!adapter.is_linked());
    }

    #[test]
    fn test_destroy_clears_listeners_and_proxies() {
        let connector = Arc::new(MemoryConnector::new());
        let pool = Arc::new(ManagerPool::new());
        let adapter = adapter(&connector, &pool, ConnectOptions::default());
        let signals = record(&adapter);
        adapter.proxy_on("chat", Arc::new(|_: &[Value]| {}));
        adapter.start(|_| {});

        adapter.destroy();
        assert_eq!(adapter.proxy_count(), 0);
        assert_eq!(pool.manager_count(), 0);

        adapter.start(|_| {});
        connector.last_manager().unwrap().complete_open();
        assert!(signals.lock().is_empty());
    }

    #[test]
    fn test_namespace_rename_applies_at_next_start() {
        let connector = Arc::new(MemoryConnector::new());
        let pool = Arc::new(ManagerPool::new());
        let adapter = adapter(&connector, &pool, ConnectOptions::default());
        assert_eq!(adapter.url().unwrap().as_str(), "http://localhost:22223/live");

        adapter.start(|_| {});
        adapter.set_namespace("chat");
        assert!(connector.last_manager().unwrap().memory_socket("/live").is_some());

        adapter.start(|_| {});
        assert!(connector.last_manager().unwrap().memory_socket("/chat").is_some());
        assert_eq!(adapter.url().unwrap().as_str(), "http://localhost:22223/chat");
    }
}
