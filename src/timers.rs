//! Named Timers
//!
//! Outstanding timers owned by a session. Clearing a timer never runs its
//! callback; closing the registry clears everything and refuses new timers.

use log::debug;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::error::{SessionError, SessionResult};

/// Callback run when a timer fires
pub type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

struct TimerEntry {
    /// Distinguishes a replaced timer from its successor under the same name
    generation: u64,
    handle: JoinHandle<()>,
}

struct TimerShared {
    entries: Mutex<HashMap<String, TimerEntry>>,
    closed: AtomicBool,
    generation: AtomicU64,
}

impl TimerShared {
    /// Remove the entry if it still belongs to `generation`
    fn claim(&self, name: &str, generation: u64) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        let mut entries = self.entries.lock();
        match entries.get(name) {
            Some(entry) if entry.generation == generation => {
                entries.remove(name);
                true
            }
            _ => false,
        }
    }
}

/// Registry of named, cancellable timers running on the tokio runtime
pub struct TimerRegistry {
    shared: Arc<TimerShared>,
}

impl TimerRegistry {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(TimerShared {
                entries: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
                generation: AtomicU64::new(1),
            }),
        }
    }

    /// Start a timer, replacing (without firing) a pending timer of the same name
    pub fn create<F>(&self, name: impl Into<String>, delay: Duration, callback: F) -> SessionResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(SessionError::Destroyed);
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| SessionError::Internal(format!("timers need a tokio runtime: {}", e)))?;

        let name = name.into();
        let generation = self.shared.generation.fetch_add(1, Ordering::Relaxed);
        let weak: Weak<TimerShared> = Arc::downgrade(&self.shared);
        let task_name = name.clone();
        let callback: TimerCallback = Box::new(callback);

        // Holding the lock across spawn keeps a fast timer from claiming
        // itself before its entry exists.
        let mut entries = self.shared.entries.lock();
        let handle = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(shared) = weak.upgrade() else { return };
            if shared.claim(&task_name, generation) {
                debug!("Timer fired: {}", task_name);
                callback();
            }
        });

        if let Some(previous) = entries.insert(name.clone(), TimerEntry { generation, handle }) {
            debug!("Timer replaced: {}", name);
            previous.handle.abort();
        }
        Ok(())
    }

    /// Cancel a pending timer without running it
    pub fn clear(&self, name: &str) -> bool {
        let entry = self.shared.entries.lock().remove(name);
        match entry {
            Some(entry) => {
                entry.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Cancel every pending timer without running any
    pub fn clear_all(&self) -> usize {
        let drained: Vec<TimerEntry> = self.shared.entries.lock().drain().map(|(_, e)| e).collect();
        for entry in &drained {
            entry.handle.abort();
        }
        drained.len()
    }

    /// Cancel everything and refuse further timers
    pub fn close(&self) -> usize {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.clear_all()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.shared.entries.lock().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.shared.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

impl Default for TimerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TimerRegistry {
    fn drop(&mut self) {
        self.close();
    }
}
