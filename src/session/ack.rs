//! Ack Correlation
//!
//! Outstanding sends waiting for a response. Each one carries a take-once
//! slot: whichever of timeout, response or cancel takes the callback first
//! wins, the others find the slot empty.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::adapter::AckCallback;
use crate::error::SessionResult;

/// Take-once holder of an ack callback
pub struct AckSlot {
    callback: Mutex<Option<AckCallback>>,
}

impl AckSlot {
    pub fn new(callback: AckCallback) -> Self {
        Self {
            callback: Mutex::new(Some(callback)),
        }
    }

    /// Take the callback; only the first caller gets it
    pub fn take(&self) -> Option<AckCallback> {
        self.callback.lock().take()
    }

    pub fn is_spent(&self) -> bool {
        self.callback.lock().is_none()
    }
}

/// One send waiting for its response
pub struct PendingAck {
    seq: u64,
    action: String,
    created_at: DateTime<Utc>,
    started: Instant,
    timeout: Duration,
    timer_name: String,
    slot: AckSlot,
}

impl PendingAck {
    pub fn new(seq: u64, action: impl Into<String>, timeout: Duration, callback: AckCallback) -> Self {
        let action = action.into();
        Self {
            seq,
            timer_name: format!("ack:{}:{}", action, seq),
            action,
            created_at: Utc::now(),
            started: Instant::now(),
            timeout,
            slot: AckSlot::new(callback),
        }
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Name of the timer bounding this wait
    pub fn timer_name(&self) -> &str {
        &self.timer_name
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Invoke the callback with `result` unless already resolved
    pub fn resolve(&self, result: SessionResult<Vec<Value>>) -> bool {
        match self.slot.take() {
            Some(callback) => {
                callback(result);
                true
            }
            None => false,
        }
    }

    /// Drop the callback uninvoked
    pub fn cancel(&self) -> bool {
        self.slot.take().is_some()
    }

    pub fn is_resolved(&self) -> bool {
        self.slot.is_spent()
    }
}

impl std::fmt::Debug for PendingAck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingAck")
            .field("seq", &self.seq)
            .field("action", &self.action)
            .field("created_at", &self.created_at)
            .field("timeout", &self.timeout)
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

/// Outstanding acks of one session, keyed by sequence number
#[derive(Default)]
pub struct AckTable {
    next_seq: AtomicU64,
    pending: Mutex<HashMap<u64, Arc<PendingAck>>>,
}

impl AckTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, action: &str, timeout: Duration, callback: AckCallback) -> Arc<PendingAck> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let pending = Arc::new(PendingAck::new(seq, action, timeout, callback));
        self.pending.lock().insert(seq, pending.clone());
        pending
    }

    /// Claim an entry; a missing entry was already claimed by another path
    pub fn remove(&self, seq: u64) -> Option<Arc<PendingAck>> {
        self.pending.lock().remove(&seq)
    }

    pub fn drain(&self) -> Vec<Arc<PendingAck>> {
        self.pending.lock().drain().map(|(_, pending)| pending).collect()
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
