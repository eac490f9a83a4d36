//! Tracking of running suspending handler tasks.
//!
//! Each spawned task holds an [`InFlightGuard`]; dropping the guard (on
//! completion, error or unwind) removes the task and notifies waiters. The
//! set is the only structure shared between the consume loop and handler
//! tasks, so it sits behind a mutex with a `watch` channel for completion.

use crate::metrics::HANDLERS_IN_FLIGHT;
use event_router_core::EventKey;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;

/// Set of running suspending handler tasks.
#[derive(Debug, Clone)]
pub struct InFlight {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    tasks: Mutex<HashMap<u64, EventKey>>,
    next_id: AtomicU64,
    count: watch::Sender<usize>,
}

impl Inner {
    fn tasks(&self) -> MutexGuard<'_, HashMap<u64, EventKey>> {
        // Entries are plain data; a panic while holding the lock cannot leave them torn.
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Call with the `tasks` lock held so publishes follow mutation order.
    #[allow(clippy::cast_precision_loss)]
    fn publish(&self, len: usize) {
        self.count.send_replace(len);
        metrics::gauge!(HANDLERS_IN_FLIGHT).set(len as f64);
    }
}

impl Default for InFlight {
    fn default() -> Self {
        Self::new()
    }
}

impl InFlight {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                tasks: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                count,
            }),
        }
    }

    /// Register a task for `key`. The task is tracked until the guard drops.
    #[must_use]
    pub fn track(&self, key: EventKey) -> InFlightGuard {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut tasks = self.inner.tasks();
            tasks.insert(id, key);
            self.inner.publish(tasks.len());
        }
        InFlightGuard {
            inner: Arc::clone(&self.inner),
            id,
        }
    }

    /// Number of running tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.tasks().len()
    }

    /// Whether no task is running.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys of the running tasks, sorted.
    #[must_use]
    pub fn pending(&self) -> Vec<EventKey> {
        let mut keys: Vec<_> = self.inner.tasks().values().cloned().collect();
        keys.sort();
        keys
    }

    /// Resolve once no task is running.
    pub async fn wait_idle(&self) {
        let mut count = self.inner.count.subscribe();
        // The sender lives in `inner`, which we hold, so the channel cannot close.
        let _ = count.wait_for(|n| *n == 0).await;
    }
}

/// Removes its task from the [`InFlight`] set when dropped.
#[derive(Debug)]
pub struct InFlightGuard {
    inner: Arc<Inner>,
    id: u64,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut tasks = self.inner.tasks();
        tasks.remove(&self.id);
        self.inner.publish(tasks.len());
    }
}
