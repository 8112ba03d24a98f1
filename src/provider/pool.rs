//! Manager Pool
//!
//! Reference-counted sharing of managers per endpoint. A manager lives while
//! at least one namespace is registered on it.

use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock};

use super::{Connector, Manager, Socket};
use crate::config::{ConnectOptions, Endpoint, ROOT_NAMESPACE};
use crate::error::SessionResult;

static SHARED_POOL: OnceLock<Arc<ManagerPool>> = OnceLock::new();

struct PoolEntry {
    /// Endpoint key (`scheme://host[:port]`)
    endpoint: String,
    manager: Arc<dyn Manager>,
    /// Namespace paths registered through this pool
    namespaces: HashSet<String>,
}

#[derive(Default)]
struct PoolState {
    entries: HashMap<u64, PoolEntry>,
    /// Endpoint key -> manager id, for managers open to sharing
    shared: HashMap<String, u64>,
    next_id: u64,
}

/// One namespace registered on one pooled manager
pub struct PoolLease {
    manager_id: u64,
    endpoint: String,
    namespace: String,
    socket: Arc<dyn Socket>,
    manager: Arc<dyn Manager>,
}

impl PoolLease {
    pub fn socket(&self) -> &Arc<dyn Socket> {
        &self.socket
    }

    pub fn manager(&self) -> &Arc<dyn Manager> {
        &self.manager
    }

    /// Namespace path (`/` or `/name`)
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl std::fmt::Debug for PoolLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolLease")
            .field("manager_id", &self.manager_id)
            .field("endpoint", &self.endpoint)
            .field("namespace", &self.namespace)
            .finish()
    }
}

/// Pool of managers keyed by endpoint
pub struct ManagerPool {
    state: Mutex<PoolState>,
    /// Serializes manager creation so one endpoint never gets two shared managers
    creating: Mutex<()>,
}

impl ManagerPool {
    /// Create an empty, private pool
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PoolState::default()),
            creating: Mutex::new(()),
        }
    }

    /// The process-wide pool
    pub fn shared() -> Arc<ManagerPool> {
        SHARED_POOL.get_or_init(|| Arc::new(ManagerPool::new())).clone()
    }

    /// Register a namespace on a manager for `endpoint`, creating the manager if needed.
    ///
    /// A shared manager is reused unless `force_new` is set or the namespace is
    /// already registered on it; such managers stay dedicated and are never
    /// handed to other callers. The namespace is reserved before the provider
    /// is asked for its socket, so a concurrent `release` cannot close the
    /// manager underneath.
    pub fn open(
        &self,
        connector: &dyn Connector,
        endpoint: &Endpoint,
        namespace: &str,
        options: &ConnectOptions,
    ) -> SessionResult<PoolLease> {
        let key = endpoint.base_url();
        let path = Endpoint::namespace_path(namespace);

        if !options.force_new {
            if let Some((id, manager)) = self.reserve_shared(&key, &path) {
                debug!("Reusing manager {} for {}{}", id, key, path);
                return self.attach(id, manager, key, path);
            }
        }

        let creating = self.creating.lock();
        if !options.force_new {
            if let Some((id, manager)) = self.reserve_shared(&key, &path) {
                drop(creating);
                debug!("Reusing manager {} for {}{}", id, key, path);
                return self.attach(id, manager, key, path);
            }
        }

        let url = endpoint.namespace_url(ROOT_NAMESPACE)?;
        let manager = connector.connect(&url, options)?;

        let (id, dedicated) = {
            let mut state = self.state.lock();
            let id = state.next_id;
            state.next_id += 1;
            state.entries.insert(
                id,
                PoolEntry {
                    endpoint: key.clone(),
                    manager: manager.clone(),
                    namespaces: HashSet::from([path.clone()]),
                },
            );
            let dedicated = options.force_new || state.shared.contains_key(&key);
            if !dedicated {
                state.shared.insert(key.clone(), id);
            }
            (id, dedicated)
        };
        drop(creating);

        info!(
            "Created manager {} for {} ({})",
            id,
            key,
            if dedicated { "dedicated" } else { "shared" }
        );
        self.attach(id, manager, key, path)
    }

    /// Remove a namespace registration; closes the manager once no namespace is left.
    ///
    /// A manager still carrying namespaces registered outside the pool stays
    /// pooled and open. Returns whether the manager was torn down.
    pub fn release(&self, lease: PoolLease) -> bool {
        lease.manager.remove_namespace(&lease.namespace);

        let now_empty = {
            let mut state = self.state.lock();
            match state.entries.get_mut(&lease.manager_id) {
                Some(entry) => {
                    entry.namespaces.remove(&lease.namespace);
                    entry.namespaces.is_empty()
                }
                None => false,
            }
        };
        if !now_empty {
            debug!(
                "Released {} on manager {}; manager stays open",
                lease.namespace, lease.manager_id
            );
            return false;
        }

        let foreign = lease.manager.namespace_count();
        if foreign > 0 {
            warn!(
                "Manager {} for {} still has {} namespaces outside the pool; keeping it open",
                lease.manager_id, lease.endpoint, foreign
            );
            return false;
        }

        match self.remove_if_unused(lease.manager_id) {
            Some(manager) => {
                info!("Closing manager {} for {}", lease.manager_id, lease.endpoint);
                manager.close();
                true
            }
            None => {
                debug!("Manager {} was claimed again before closing", lease.manager_id);
                false
            }
        }
    }

    /// Number of live managers
    pub fn manager_count(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Namespaces registered on the shared manager for an endpoint
    pub fn shared_namespaces(&self, endpoint: &Endpoint) -> Vec<String> {
        let state = self.state.lock();
        let mut namespaces: Vec<String> = state
            .shared
            .get(&endpoint.base_url())
            .and_then(|id| state.entries.get(id))
            .map(|entry| entry.namespaces.iter().cloned().collect())
            .unwrap_or_default();
        namespaces.sort();
        namespaces
    }

    /// Reserve `path` on the shared manager for `key` unless it is already taken there
    fn reserve_shared(&self, key: &str, path: &str) -> Option<(u64, Arc<dyn Manager>)> {
        let mut state = self.state.lock();
        let id = *state.shared.get(key)?;
        let entry = state.entries.get_mut(&id)?;
        if !entry.namespaces.insert(path.to_string()) {
            return None;
        }
        Some((id, entry.manager.clone()))
    }

    /// Ask the manager for the reserved namespace's socket, undoing the reservation on failure
    fn attach(
        &self,
        manager_id: u64,
        manager: Arc<dyn Manager>,
        endpoint: String,
        namespace: String,
    ) -> SessionResult<PoolLease> {
        match manager.socket(&namespace) {
            Ok(socket) => Ok(PoolLease {
                manager_id,
                endpoint,
                namespace,
                socket,
                manager,
            }),
            Err(e) => {
                warn!("Manager {} refused namespace {}: {}", manager_id, namespace, e);
                let emptied = {
                    let mut state = self.state.lock();
                    match state.entries.get_mut(&manager_id) {
                        Some(entry) => {
                            entry.namespaces.remove(&namespace);
                            entry.namespaces.is_empty()
                        }
                        None => false,
                    }
                };
                if emptied && manager.namespace_count() == 0 {
                    if let Some(manager) = self.remove_if_unused(manager_id) {
                        manager.close();
                    }
                }
                Err(e)
            }
        }
    }

    /// Drop the entry if its namespace set is still empty
    fn remove_if_unused(&self, manager_id: u64) -> Option<Arc<dyn Manager>> {
        let mut state = self.state.lock();
        let unused = state
            .entries
            .get(&manager_id)
            .map(|entry| entry.namespaces.is_empty())
            .unwrap_or(false);
        if !unused {
            return None;
        }
        let entry = state.entries.remove(&manager_id)?;
        if state.shared.get(&entry.endpoint) == Some(&manager_id) {
            state.shared.remove(&entry.endpoint);
        }
        Some(entry.manager)
    }
}

impl Default for ManagerPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::memory::MemoryConnector;

    fn endpoint() -> Endpoint {
        Endpoint::new("http://localhost", 22223).unwrap()
    }

    #[test]
    fn test_namespaces_share_one_manager() {
        let connector = MemoryConnector::new();
        let pool = ManagerPool::new();
        let options = ConnectOptions::default();

        let root = pool.open(&connector, &endpoint(), "/", &options).unwrap();
        let live = pool.open(&connector, &endpoint(), "live", &options).unwrap();

        assert_eq!(pool.manager_count(), 1);
        assert_eq!(connector.managers_created(), 1);
        assert_eq!(pool.shared_namespaces(&endpoint()), vec!["/", "/live"]);

        assert!(!pool.release(root));
        let manager = connector.last_manager().unwrap();
        assert!(!manager.is_closed());

        assert!(pool.release(live));
        assert!(manager.is_closed());
        assert_eq!(pool.manager_count(), 0);
    }

    #[test]
    fn test_force_new_never_displaces_shared_manager() {
        let connector = MemoryConnector::new();
        let pool = ManagerPool::new();
        let shared = pool.open(&connector, &endpoint(), "/", &ConnectOptions::default()).unwrap();

        let forced = ConnectOptions {
            force_new: true,
            ..ConnectOptions::default()
        };
        let dedicated = pool.open(&connector, &endpoint(), "/", &forced).unwrap();
        assert_eq!(pool.manager_count(), 2);

        assert!(pool.release(dedicated));
        assert_eq!(pool.shared_namespaces(&endpoint()), vec!["/"]);
        assert!(pool.release(shared));
    }

    #[test]
    fn test_same_namespace_twice_gets_dedicated_manager() {
        let connector = MemoryConnector::new();
        let pool = ManagerPool::new();
        let options = ConnectOptions::default();

        let first = pool.open(&connector, &endpoint(), "live", &options).unwrap();
        let second = pool.open(&connector, &endpoint(), "/live", &options).unwrap();
        assert_eq!(connector.managers_created(), 2);

        assert!(pool.release(second));
        assert_eq!(pool.shared_namespaces(&endpoint()), vec!["/live"]);
        assert!(pool.release(first));
    }

    #[test]
    fn test_refused_namespace_rolls_back_reservation() {
        let connector = MemoryConnector::new();
        let pool = ManagerPool::new();
        let options = ConnectOptions::default();
        let root = pool.open(&connector, &endpoint(), "/", &options).unwrap();

        connector.last_manager().unwrap().close();
        assert!(pool.open(&connector, &endpoint(), "live", &options).is_err());

        assert_eq!(pool.shared_namespaces(&endpoint()), vec!["/"]);
        assert!(pool.release(root));
        assert_eq!(pool.manager_count(), 0);
    }

    #[test]
    fn test_foreign_namespace_keeps_manager_pooled() {
        let connector = MemoryConnector::new();
        let pool = ManagerPool::new();
        let options = ConnectOptions::default();
        let root = pool.open(&connector, &endpoint(), "/", &options).unwrap();
        let manager = connector.last_manager().unwrap();
        manager.socket("/foreign").unwrap();

        assert!(!pool.release(root));
        assert!(!manager.is_closed());
        assert_eq!(pool.manager_count(), 1);

        let live = pool.open(&connector, &endpoint(), "live", &options).unwrap();
        assert_eq!(connector.managers_created(), 1);
        manager.remove_namespace("/foreign");
        assert!(pool.release(live));
        assert!(manager.is_closed());
    }

    #[test]
    fn test_concurrent_first_opens_share_one_manager() {
        let connector = MemoryConnector::new();
        let pool = ManagerPool::new();
        let options = ConnectOptions::default();
        let barrier = std::sync::Barrier::new(8);

        let leases: Vec<PoolLease> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|n| {
                    let (connector, pool, options, barrier) = (&connector, &pool, &options, &barrier);
                    scope.spawn(move || {
                        barrier.wait();
                        pool.open(connector, &endpoint(), &format!("room{}", n), options).unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|handle| handle.join().unwrap()).collect()
        });

        assert_eq!(connector.managers_created(), 1);
        assert_eq!(pool.shared_namespaces(&endpoint()).len(), 8);
        let closed: Vec<bool> = leases.into_iter().map(|lease| pool.release(lease)).collect();
        assert_eq!(closed.iter().filter(|closed| **closed).count(), 1);
        assert_eq!(closed.last(), Some(&true));
        assert_eq!(pool.manager_count(), 0);
    }

    #[test]
    fn test_connector_failure_leaves_pool_empty() {
        let connector = MemoryConnector::new();
        connector.refuse_connections("no route to host");
        let pool = ManagerPool::new();

        let result = pool.open(&connector, &endpoint(), "/", &ConnectOptions::default());
        assert!(result.is_err());
        assert_eq!(pool.manager_count(), 0);
    }
}
