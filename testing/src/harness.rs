//! Synchronisation helpers for handler tests.
//!
//! Handlers run on other tasks (or inline on the consume loop), so tests
//! observe them through shared, notifying structures instead of globals.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use event_router_core::{AppConfig, RetryConfig};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// Shared counter that wakes waiters on every increment.
///
/// # Example
///
/// ```
/// use event_router_testing::Counter;
/// use std::time::Duration;
///
/// # tokio_test::block_on(async {
/// let counter = Counter::new();
/// let handle = counter.clone();
/// tokio::spawn(async move { handle.incr() });
///
/// assert!(counter.wait_for(1, Duration::from_secs(1)).await);
/// # });
/// ```
#[derive(Clone, Debug, Default)]
pub struct Counter {
    inner: Arc<CounterInner>,
}

#[derive(Debug, Default)]
struct CounterInner {
    value: AtomicUsize,
    changed: Notify,
}

impl Counter {
    /// Create a counter at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one and return the new value.
    pub fn incr(&self) -> usize {
        let value = self.inner.value.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.changed.notify_waiters();
        value
    }

    /// Current value.
    #[must_use]
    pub fn get(&self) -> usize {
        self.inner.value.load(Ordering::SeqCst)
    }

    /// Wait until the value is at least `target`.
    ///
    /// Returns `false` if `timeout` elapsed first.
    pub async fn wait_for(&self, target: usize, timeout: Duration) -> bool {
        let reached = async {
            loop {
                let changed = self.inner.changed.notified();
                if self.get() >= target {
                    return;
                }
                changed.await;
            }
        };
        tokio::time::timeout(timeout, reached).await.is_ok()
    }
}

/// Ordered, shared log of whatever handlers want to record.
///
/// Used for ordering assertions, e.g. `["start m1", "end m1", "start m2"]`.
#[derive(Debug)]
pub struct Recorder<T> {
    entries: Arc<Mutex<Vec<T>>>,
}

impl<T> Clone for Recorder<T> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
        }
    }
}

impl<T> Default for Recorder<T> {
    fn default() -> Self {
        Self {
            entries: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<T: Clone> Recorder<T> {
    /// Create an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry.
    pub fn record(&self, entry: T) {
        self.entries.lock().unwrap().push(entry);
    }

    /// Snapshot of all entries, in recording order.
    #[must_use]
    pub fn entries(&self) -> Vec<T> {
        self.entries.lock().unwrap().clone()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Whether nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A valid configuration for in-memory tests.
///
/// Short grace period and fast, jitter-free retries so failure paths finish
/// quickly.
#[must_use]
pub fn test_config(topics: &[&str]) -> AppConfig {
    AppConfig::builder()
        .app_name("router-test")
        .bootstrap_servers(["memory://local"])
        .group_id("test-group")
        .listen_topics(topics.iter().copied())
        .shutdown_grace_period(Duration::from_secs(2))
        .retry(RetryConfig {
            max_retries: 3,
            initial_delay_ms: 5,
            max_delay_ms: 20,
            multiplier: 2.0,
            jitter: false,
        })
        .build()
        .unwrap()
}

/// Install a test-writer `tracing` subscriber. Safe to call repeatedly.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "event_router=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn counter_wakes_waiter() {
        let counter = Counter::new();
        let waiter = {
            let counter = counter.clone();
            tokio::spawn(async move { counter.wait_for(2, Duration::from_secs(1)).await })
        };

        counter.incr();
        counter.incr();

        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn counter_wait_times_out() {
        let counter = Counter::new();
        counter.incr();

        assert!(!counter.wait_for(2, Duration::from_millis(20)).await);
    }

    #[test]
    fn recorder_keeps_order() {
        let recorder = Recorder::new();
        let clone = recorder.clone();
        recorder.record("a");
        clone.record("b");

        assert_eq!(recorder.entries(), vec!["a", "b"]);
    }

    #[test]
    fn test_config_is_valid() {
        let config = test_config(&["test_topic", "other"]);
        assert_eq!(config.listen_topics, vec!["test_topic", "other"]);
        assert_eq!(config.group_id().as_deref(), Some("test-group"));
    }
}
