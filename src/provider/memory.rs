//! In-Memory Provider
//!
//! A connection provider with no network underneath. Tests drive it by hand:
//! open or fail the connection, drop it, deliver inbound messages and answer
//! acks. The reconnection policy follows the connect options so exhaustion can
//! be exercised without timers.

use dashmap::DashMap;
use log::debug;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use url::Url;

use super::{
    Connector, Manager, ManagerEvent, ManagerEventHandler, MessageHandler, ReadyState, Socket, SocketAck,
    SocketEvent, SocketEventHandler, CLIENT_DISCONNECT_REASON,
};
use crate::config::ConnectOptions;
use crate::error::{SessionError, SessionResult};
use crate::events::ListenerId;

/// Connector handing out [`MemoryManager`]s
#[derive(Default)]
pub struct MemoryConnector {
    managers: Mutex<Vec<Arc<MemoryManager>>>,
    refusal: Mutex<Option<String>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following `connect` fail synchronously
    pub fn refuse_connections(&self, reason: impl Into<String>) {
        *self.refusal.lock() = Some(reason.into());
    }

    pub fn accept_connections(&self) {
        *self.refusal.lock() = None;
    }

    pub fn managers_created(&self) -> usize {
        self.managers.lock().len()
    }

    pub fn last_manager(&self) -> Option<Arc<MemoryManager>> {
        self.managers.lock().last().cloned()
    }

    pub fn managers(&self) -> Vec<Arc<MemoryManager>> {
        self.managers.lock().clone()
    }
}

impl Connector for MemoryConnector {
    fn connect(&self, endpoint: &Url, options: &ConnectOptions) -> SessionResult<Arc<dyn Manager>> {
        if let Some(reason) = self.refusal.lock().clone() {
            return Err(SessionError::ConnectFailed(reason));
        }
        let manager = MemoryManager::new(endpoint.as_str(), options.clone());
        self.managers.lock().push(manager.clone());
        let manager: Arc<dyn Manager> = manager;
        Ok(manager)
    }
}

/// Manager of the in-memory provider
pub struct MemoryManager {
    me: Weak<MemoryManager>,
    uri: String,
    options: ConnectOptions,
    ready: Mutex<ReadyState>,
    listeners: DashMap<ListenerId, ManagerEventHandler>,
    sockets: Mutex<HashMap<String, Arc<MemorySocket>>>,
    closed: AtomicBool,
    open_requests: AtomicUsize,
    reconnect_attempts: AtomicU32,
    exhausted: AtomicBool,
}

impl MemoryManager {
    pub fn new(uri: impl Into<String>, options: ConnectOptions) -> Arc<Self> {
        let ready = if options.auto_connect {
            ReadyState::Opening
        } else {
            ReadyState::Closed
        };
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            uri: uri.into(),
            options,
            ready: Mutex::new(ready),
            listeners: DashMap::new(),
            sockets: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            open_requests: AtomicUsize::new(0),
            reconnect_attempts: AtomicU32::new(0),
            exhausted: AtomicBool::new(false),
        })
    }

    /// Options the manager was created with
    pub fn options(&self) -> &ConnectOptions {
        &self.options
    }

    /// Open the connection and connect every registered namespace
    pub fn complete_open(&self) {
        let was_open = {
            let mut ready = self.ready.lock();
            let was_open = *ready == ReadyState::Open;
            *ready = ReadyState::Open;
            was_open
        };
        self.exhausted.store(false, Ordering::SeqCst);
        if !was_open {
            self.dispatch(&ManagerEvent::Open);
        }
        for socket in self.socket_list() {
            socket.connect_now();
        }
    }

    /// Fail the initial connection attempt
    pub fn fail_open(&self, reason: &str) {
        *self.ready.lock() = ReadyState::Closed;
        self.dispatch(&ManagerEvent::ConnectError(reason.to_string()));
    }

    /// Run one failed reconnection attempt.
    ///
    /// Returns false when reconnection is disabled or already exhausted.
    pub fn fail_reconnect(&self, reason: &str) -> bool {
        if !self.options.reconnection_enabled || self.exhausted.load(Ordering::SeqCst) {
            return false;
        }
        let attempt = self.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        *self.ready.lock() = ReadyState::Opening;

        self.dispatch(&ManagerEvent::ReconnectAttempt(attempt));
        self.broadcast(&SocketEvent::ReconnectAttempt(attempt));
        self.dispatch(&ManagerEvent::Reconnecting(attempt));
        self.broadcast(&SocketEvent::Reconnecting(attempt));

        *self.ready.lock() = ReadyState::Closed;
        self.dispatch(&ManagerEvent::ReconnectError(reason.to_string()));
        self.broadcast(&SocketEvent::ReconnectError(Some(reason.to_string())));

        if let Some(limit) = self.options.reconnection_attempts {
            if attempt >= limit {
                self.exhausted.store(true, Ordering::SeqCst);
                self.dispatch(&ManagerEvent::ReconnectFailed);
                self.broadcast(&SocketEvent::ReconnectFailed);
            }
        }
        true
    }

    /// Fail reconnection attempts until the policy gives up; returns attempts made.
    ///
    /// With unlimited attempts only a single attempt is run.
    pub fn exhaust_reconnection(&self, reason: &str) -> u32 {
        let mut made = 0;
        while self.fail_reconnect(reason) {
            made += 1;
            if self.options.reconnection_attempts.is_none() {
                break;
            }
        }
        made
    }

    /// Successful reconnection after a drop
    pub fn complete_reconnect(&self) {
        let attempt = self.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        self.dispatch(&ManagerEvent::ReconnectAttempt(attempt));
        self.broadcast(&SocketEvent::ReconnectAttempt(attempt));
        self.complete_open();
        self.dispatch(&ManagerEvent::Reconnect(attempt));
        self.broadcast(&SocketEvent::Reconnect(attempt));
        self.reconnect_attempts.store(0, Ordering::SeqCst);
    }

    /// Lose the physical connection
    pub fn drop_connection(&self, reason: &str) {
        *self.ready.lock() = if self.options.reconnection_enabled {
            ReadyState::Opening
        } else {
            ReadyState::Closed
        };
        for socket in self.socket_list() {
            socket.drop_now(reason);
        }
    }

    /// Socket-level error on every namespace
    pub fn socket_error(&self, reason: &str) {
        self.broadcast(&SocketEvent::Error(reason.to_string()));
    }

    pub fn memory_socket(&self, namespace: &str) -> Option<Arc<MemorySocket>> {
        self.sockets.lock().get(namespace).cloned()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Explicit `Socket::open` calls received
    pub fn open_requests(&self) -> usize {
        self.open_requests.load(Ordering::SeqCst)
    }

    /// Reconnection attempts in the current failure streak
    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::SeqCst)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    fn request_open(&self) {
        self.open_requests.fetch_add(1, Ordering::SeqCst);
        let mut ready = self.ready.lock();
        if *ready == ReadyState::Closed {
            *ready = ReadyState::Opening;
        }
    }

    fn socket_list(&self) -> Vec<Arc<MemorySocket>> {
        self.sockets.lock().values().cloned().collect()
    }

    fn dispatch(&self, event: &ManagerEvent) {
        let handlers: Vec<ManagerEventHandler> = self.listeners.iter().map(|entry| entry.value().clone()).collect();
        debug!("memory manager {} -> {:?} ({} listeners)", self.uri, event, handlers.len());
        for handler in handlers {
            handler(event);
        }
    }

    fn broadcast(&self, event: &SocketEvent) {
        for socket in self.socket_list() {
            socket.fire(event);
        }
    }
}

impl Manager for MemoryManager {
    fn uri(&self) -> String {
        self.uri.clone()
    }

    fn ready_state(&self) -> ReadyState {
        *self.ready.lock()
    }

    fn auto_connect(&self) -> bool {
        self.options.auto_connect
    }

    fn reconnection(&self) -> bool {
        self.options.reconnection_enabled
    }

    fn socket(&self, namespace: &str) -> SessionResult<Arc<dyn Socket>> {
        if self.is_closed() {
            return Err(SessionError::Transport(format!("manager {} is closed", self.uri)));
        }
        let socket: Arc<dyn Socket> = self
            .sockets
            .lock()
            .entry(namespace.to_string())
            .or_insert_with(|| Arc::new(MemorySocket::new(namespace, self.me.clone())))
            .clone();
        Ok(socket)
    }

    fn remove_namespace(&self, namespace: &str) {
        self.sockets.lock().remove(namespace);
    }

    fn namespace_count(&self) -> usize {
        self.sockets.lock().len()
    }

    fn on(&self, handler: ManagerEventHandler) -> ListenerId {
        let id = ListenerId::next();
        self.listeners.insert(id, handler);
        id
    }

    fn off(&self, id: ListenerId) -> bool {
        self.listeners.remove(&id).is_some()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        *self.ready.lock() = ReadyState::Closed;
    }
}

/// Namespace socket of the in-memory provider
pub struct MemorySocket {
    namespace: String,
    manager: Weak<MemoryManager>,
    id: Mutex<Option<String>>,
    connected: AtomicBool,
    lifecycle: DashMap<ListenerId, SocketEventHandler>,
    handlers: DashMap<ListenerId, (String, MessageHandler)>,
    sent: Mutex<Vec<(String, Value)>>,
    pending_acks: Mutex<Vec<(String, SocketAck)>>,
    echo: AtomicBool,
}

impl MemorySocket {
    fn new(namespace: &str, manager: Weak<MemoryManager>) -> Self {
        Self {
            namespace: namespace.to_string(),
            manager,
            id: Mutex::new(None),
            connected: AtomicBool::new(false),
            lifecycle: DashMap::new(),
            handlers: DashMap::new(),
            sent: Mutex::new(Vec::new()),
            pending_acks: Mutex::new(Vec::new()),
            echo: AtomicBool::new(false),
        }
    }

    /// Answer every ack-requesting emit immediately with the emitted data
    pub fn set_echo(&self, echo: bool) {
        self.echo.store(echo, Ordering::SeqCst);
    }

    /// Mark connected and report `connect`
    pub fn connect_now(&self) {
        if self.connected.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.id.lock() = Some(uuid::Uuid::new_v4().simple().to_string());
        self.fire(&SocketEvent::Connect);
    }

    fn drop_now(&self, reason: &str) {
        if self.connected.swap(false, Ordering::SeqCst) {
            *self.id.lock() = None;
            self.fire(&SocketEvent::Disconnect(reason.to_string()));
        }
    }

    /// Deliver an inbound protocol message
    pub fn deliver(&self, event: &str, args: &[Value]) -> usize {
        let handlers: Vec<MessageHandler> = self
            .handlers
            .iter()
            .filter(|entry| entry.value().0 == event)
            .map(|entry| entry.value().1.clone())
            .collect();
        for handler in &handlers {
            handler(args);
        }
        handlers.len()
    }

    /// Answer the oldest pending ack for `action`
    pub fn respond(&self, action: &str, values: Vec<Value>) -> bool {
        let ack = {
            let mut pending = self.pending_acks.lock();
            pending
                .iter()
                .position(|(name, _)| name == action)
                .map(|index| pending.remove(index).1)
        };
        match ack {
            Some(ack) => {
                ack(values);
                true
            }
            None => false,
        }
    }

    /// Messages emitted so far
    pub fn sent(&self) -> Vec<(String, Value)> {
        self.sent.lock().clone()
    }

    pub fn pending_ack_count(&self) -> usize {
        self.pending_acks.lock().len()
    }

    pub fn lifecycle_listener_count(&self) -> usize {
        self.lifecycle.len()
    }

    pub fn handler_count(&self, event: &str) -> usize {
        self.handlers.iter().filter(|entry| entry.value().0 == event).count()
    }

    /// Report a lifecycle event to subscribers
    pub fn fire(&self, event: &SocketEvent) {
        let handlers: Vec<SocketEventHandler> = self.lifecycle.iter().map(|entry| entry.value().clone()).collect();
        for handler in handlers {
            handler(event);
        }
    }
}

impl Socket for MemorySocket {
    fn id(&self) -> Option<String> {
        self.id.lock().clone()
    }

    fn namespace(&self) -> String {
        self.namespace.clone()
    }

    fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn open(&self) {
        if let Some(manager) = self.manager.upgrade() {
            manager.request_open();
        }
    }

    fn disconnect(&self) {
        self.drop_now(CLIENT_DISCONNECT_REASON);
    }

    fn subscribe(&self, handler: SocketEventHandler) -> ListenerId {
        let id = ListenerId::next();
        self.lifecycle.insert(id, handler);
        id
    }

    fn on(&self, event: &str, handler: MessageHandler) -> ListenerId {
        let id = ListenerId::next();
        self.handlers.insert(id, (event.to_string(), handler));
        id
    }

    fn off(&self, id: ListenerId) -> bool {
        self.lifecycle.remove(&id).is_some() || self.handlers.remove(&id).is_some()
    }

    fn remove_all_listeners(&self) {
        self.lifecycle.clear();
        self.handlers.clear();
    }

    fn emit(&self, action: &str, data: Value, ack: Option<SocketAck>) {
        self.sent.lock().push((action.to_string(), data.clone()));
        if let Some(ack) = ack {
            if self.echo.load(Ordering::SeqCst) {
                ack(vec![data]);
            } else {
                self.pending_acks.lock().push((action.to_string(), ack));
            }
        }
    }
}
