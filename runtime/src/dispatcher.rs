//! Dispatch of decoded envelopes to registered handlers.
//!
//! For every decoded message the [`Dispatcher`]:
//!
//! 1. Looks up the handler bound to `(envelope.event, topic)`
//! 2. Runs a blocking handler inline, or spawns a suspending one
//! 3. Contains handler failures (errors and panics) so the loop keeps going
//!
//! ```text
//!                    ┌──────────────┐
//!  Envelope ───────► │   Registry   │── no match ──► Skipped (warn)
//!                    └──────┬───────┘
//!                           │
//!              ┌────────────┴────────────┐
//!              ▼                         ▼
//!        Blocking: call inline     Suspending: tokio::spawn
//!        (consume loop waits)      (tracked in InFlight)
//! ```
//!
//! Blocking handlers therefore run strictly in consumption order. Suspending
//! handlers are started in that order; they may complete in any order.
//! Spawned tasks are polled in whatever order the scheduler picks, so each
//! task waits for its predecessor's first poll before polling its own
//! handler.

use crate::error::HandlerExecutionError;
use crate::in_flight::InFlight;
use crate::metrics::{
    HANDLER_DURATION, HANDLERS_COMPLETED, HANDLERS_FAILED, HANDLERS_SPAWNED, MESSAGES_UNHANDLED,
    SHUTDOWN_ABANDONED,
};
use event_router_core::envelope::preview_value;
use event_router_core::{
    Envelope, EventKey, Handler, HandlerContext, HandlerRegistry, HandlerResult, RawMessage,
};
use futures::FutureExt;
use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::Instrument;

/// What happened to one dispatched message.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// A blocking handler ran and returned `Ok`
    Completed,
    /// A blocking handler returned `Err` or panicked
    Failed(HandlerExecutionError),
    /// A suspending handler was spawned
    Spawned,
    /// No handler is bound to the message's event and topic
    Skipped,
}

/// Result of draining in-flight tasks at shutdown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Tasks that were running when the drain began
    pub awaited: usize,
    /// Tasks still running when the grace period ended
    pub abandoned: Vec<EventKey>,
}

impl DrainReport {
    /// Whether every task finished within the grace period.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.abandoned.is_empty()
    }
}

/// Routes envelopes to handlers from a sealed registry.
#[derive(Debug)]
pub struct Dispatcher {
    registry: Arc<HandlerRegistry>,
    in_flight: InFlight,
    /// Fires once the most recently spawned handler has been polled.
    last_started: Mutex<Option<oneshot::Receiver<()>>>,
}

impl Dispatcher {
    /// Create a dispatcher over `registry`.
    ///
    /// The registry is shared read-only; no lock is taken on lookup.
    #[must_use]
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self {
            registry,
            in_flight: InFlight::new(),
            last_started: Mutex::new(None),
        }
    }

    /// The running suspending tasks.
    #[must_use]
    pub const fn in_flight(&self) -> &InFlight {
        &self.in_flight
    }

    /// Dispatch one decoded envelope consumed as `message`.
    ///
    /// Must be called from within a tokio runtime (suspending handlers are
    /// spawned onto it).
    pub fn dispatch(&self, envelope: Envelope, message: &RawMessage) -> DispatchOutcome {
        let topic = message.topic.as_str();
        let Some(descriptor) = self.registry.lookup(&envelope.event, topic) else {
            tracing::warn!(
                event = %envelope.event,
                topic = %topic,
                partition = ?message.partition,
                offset = ?message.offset,
                "No handler registered, dropping message"
            );
            metrics::counter!(MESSAGES_UNHANDLED).increment(1);
            return DispatchOutcome::Skipped;
        };

        let key = descriptor.key().clone();
        let ctx = build_context(envelope, message);

        match descriptor.handler() {
            Handler::Blocking(handler) => run_blocking(key, handler.as_ref(), ctx),
            Handler::Suspending(handler) => {
                let preview = preview_value(&ctx.payload);
                // Building the future runs user code too.
                let future = match catch_unwind(AssertUnwindSafe(|| handler(ctx))) {
                    Ok(future) => future,
                    Err(panic) => {
                        let err = HandlerExecutionError::panicked(key, preview, &*panic);
                        report_failure(&err);
                        return DispatchOutcome::Failed(err);
                    },
                };
                self.spawn(key, preview, future);
                DispatchOutcome::Spawned
            },
        }
    }

    fn spawn(
        &self,
        key: EventKey,
        preview: String,
        future: futures::future::BoxFuture<'static, HandlerResult>,
    ) {
        let guard = self.in_flight.track(key.clone());
        let span = tracing::debug_span!("handler", key = %key);
        metrics::counter!(HANDLERS_SPAWNED).increment(1);

        let (started_tx, started_rx) = oneshot::channel();
        let previous = self
            .last_started
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(started_rx);

        tokio::spawn(
            async move {
                let _guard = guard;
                if let Some(previous) = previous {
                    // Err means the predecessor was dropped without running.
                    let _ = previous.await;
                }

                let mut started = Some(started_tx);
                let mut future = AssertUnwindSafe(future).catch_unwind();
                let outcome = futures::future::poll_fn(|cx| {
                    let poll = future.poll_unpin(cx);
                    if let Some(started) = started.take() {
                        let _ = started.send(());
                    }
                    poll
                })
                .await;

                match outcome {
                    Ok(Ok(())) => {
                        tracing::debug!(key = %key, "Suspending handler completed");
                        metrics::counter!(HANDLERS_COMPLETED).increment(1);
                    },
                    Ok(Err(error)) => {
                        report_failure(&HandlerExecutionError::failed(key, preview, &error));
                    },
                    Err(panic) => {
                        report_failure(&HandlerExecutionError::panicked(key, preview, &*panic));
                    },
                }
            }
            .instrument(span),
        );
    }

    /// Wait for in-flight suspending tasks, at most `grace`.
    ///
    /// Tasks still running afterwards are left to run detached and reported
    /// as abandoned.
    pub async fn drain(&self, grace: Duration) -> DrainReport {
        let awaited = self.in_flight.len();
        if awaited == 0 {
            return DrainReport::default();
        }

        tracing::info!(
            in_flight = awaited,
            grace_ms = grace.as_millis(),
            "Waiting for in-flight handlers"
        );

        if tokio::time::timeout(grace, self.in_flight.wait_idle()).await.is_ok() {
            tracing::info!(awaited, "All in-flight handlers completed");
            return DrainReport {
                awaited,
                abandoned: Vec::new(),
            };
        }

        let abandoned = self.in_flight.pending();
        for key in &abandoned {
            tracing::warn!(
                key = %key,
                grace_ms = grace.as_millis(),
                "AbandonedOnShutdown: handler did not finish within the grace period"
            );
        }
        metrics::counter!(SHUTDOWN_ABANDONED).increment(abandoned.len() as u64);

        DrainReport { awaited, abandoned }
    }
}

fn build_context(envelope: Envelope, message: &RawMessage) -> HandlerContext {
    let mut ctx = HandlerContext::new(envelope.event, message.topic.clone(), envelope.payload);
    ctx.metadata = message.metadata();
    for (field, value) in envelope.extra {
        ctx.metadata.entry(field).or_insert(value);
    }
    ctx
}

fn run_blocking(
    key: EventKey,
    handler: &(dyn Fn(HandlerContext) -> HandlerResult + Send + Sync),
    ctx: HandlerContext,
) -> DispatchOutcome {
    let preview = preview_value(&ctx.payload);
    let started = Instant::now();
    let result = catch_unwind(AssertUnwindSafe(|| handler(ctx)));
    metrics::histogram!(HANDLER_DURATION).record(started.elapsed().as_secs_f64());

    match result {
        Ok(Ok(())) => {
            tracing::debug!(key = %key, "Blocking handler completed");
            metrics::counter!(HANDLERS_COMPLETED).increment(1);
            DispatchOutcome::Completed
        },
        Ok(Err(error)) => {
            let err = HandlerExecutionError::failed(key, preview, &error);
            report_failure(&err);
            DispatchOutcome::Failed(err)
        },
        Err(panic) => {
            let err = HandlerExecutionError::panicked(key, preview, &*panic);
            report_failure(&err);
            DispatchOutcome::Failed(err)
        },
    }
}

fn report_failure(err: &HandlerExecutionError) {
    tracing::error!(
        event = %err.key.event,
        topic = %err.key.topic,
        payload = %err.preview,
        panicked = err.panicked,
        error = %err.reason,
        "Handler failed"
    );
    metrics::counter!(HANDLERS_FAILED).increment(1);
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn dispatcher(registry: HandlerRegistry) -> Dispatcher {
        Dispatcher::new(Arc::new(registry))
    }

    async fn explode() -> HandlerResult {
        panic!("kaboom")
    }

    fn message(topic: &str) -> RawMessage {
        RawMessage::new(topic, Vec::new()).at(0, 7)
    }

    #[tokio::test]
    async fn blocking_handler_runs_inline() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut registry = HandlerRegistry::new();
        {
            let hits = Arc::clone(&hits);
            registry
                .register(
                    "process_person",
                    "test_topic",
                    Handler::blocking(move |_| {
                        hits.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }),
                )
                .unwrap();
        }
        let dispatcher = dispatcher(registry);

        let outcome = dispatcher.dispatch(
            Envelope::new("process_person", json!({ "age": 35 })),
            &message("test_topic"),
        );

        assert!(matches!(outcome, DispatchOutcome::Completed));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unmatched_message_is_skipped() {
        let mut registry = HandlerRegistry::new();
        registry
            .register("process_person", "test_topic", Handler::blocking(|_| Ok(())))
            .unwrap();
        let dispatcher = dispatcher(registry);

        let wrong_topic =
            dispatcher.dispatch(Envelope::new("process_person", json!({})), &message("other"));
        let wrong_event = dispatcher.dispatch(
            Envelope::new("process_company", json!({})),
            &message("test_topic"),
        );

        assert!(matches!(wrong_topic, DispatchOutcome::Skipped));
        assert!(matches!(wrong_event, DispatchOutcome::Skipped));
    }

    #[tokio::test]
    async fn handler_error_is_contained() {
        let mut registry = HandlerRegistry::new();
        registry
            .register("e", "t", Handler::blocking(|_| Err(anyhow::anyhow!("database down"))))
            .unwrap();
        let dispatcher = dispatcher(registry);

        let outcome = dispatcher.dispatch(Envelope::new("e", json!({ "id": 1 })), &message("t"));

        let DispatchOutcome::Failed(err) = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert_eq!(err.key, EventKey::new("e", "t"));
        assert_eq!(err.reason, "database down");
        assert_eq!(err.preview, r#"{"id":1}"#);
        assert!(!err.panicked);
    }

    #[tokio::test]
    async fn handler_panic_is_contained() {
        let mut registry = HandlerRegistry::new();
        registry
            .register("e", "t", Handler::blocking(|_| panic!("bad state")))
            .unwrap();
        let dispatcher = dispatcher(registry);

        let outcome = dispatcher.dispatch(Envelope::new("e", json!(null)), &message("t"));

        let DispatchOutcome::Failed(err) = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert!(err.panicked);
        assert_eq!(err.reason, "bad state");
    }

    #[tokio::test]
    async fn suspending_handler_is_spawned_and_tracked() {
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let release_rx = Arc::new(Mutex::new(Some(release_rx)));
        let mut registry = HandlerRegistry::new();
        registry
            .register(
                "e",
                "t",
                Handler::suspending(move |_| {
                    let rx = release_rx.lock().unwrap().take();
                    async move {
                        if let Some(rx) = rx {
                            let _ = rx.await;
                        }
                        Ok(())
                    }
                }),
            )
            .unwrap();
        let dispatcher = dispatcher(registry);

        let outcome = dispatcher.dispatch(Envelope::new("e", json!(1)), &message("t"));
        assert!(matches!(outcome, DispatchOutcome::Spawned));
        assert_eq!(dispatcher.in_flight().len(), 1);

        release_tx.send(()).unwrap();
        let report = dispatcher.drain(Duration::from_secs(1)).await;
        assert_eq!(report.awaited, 1);
        assert!(report.is_clean());
        assert!(dispatcher.in_flight().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn suspending_handlers_start_in_dispatch_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut registry = HandlerRegistry::new();
        {
            let order = Arc::clone(&order);
            registry
                .register(
                    "work",
                    "t",
                    Handler::suspending(move |ctx| {
                        let order = Arc::clone(&order);
                        async move {
                            order.lock().unwrap().push(ctx.payload.as_u64().unwrap());
                            tokio::task::yield_now().await;
                            Ok(())
                        }
                    }),
                )
                .unwrap();
        }
        let dispatcher = dispatcher(registry);

        for n in 0..200_u64 {
            dispatcher.dispatch(Envelope::new("work", json!(n)), &message("t"));
        }
        let report = dispatcher.drain(Duration::from_secs(5)).await;

        assert!(report.is_clean());
        assert_eq!(*order.lock().unwrap(), (0..200_u64).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn drain_abandons_slow_tasks() {
        let mut registry = HandlerRegistry::new();
        registry
            .register(
                "slow",
                "t",
                Handler::suspending(|_| async {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(())
                }),
            )
            .unwrap();
        let dispatcher = dispatcher(registry);

        dispatcher.dispatch(Envelope::new("slow", json!(null)), &message("t"));
        let report = dispatcher.drain(Duration::from_millis(50)).await;

        assert_eq!(report.awaited, 1);
        assert_eq!(report.abandoned, vec![EventKey::new("slow", "t")]);
    }

    #[tokio::test]
    async fn suspending_failure_releases_tracking() {
        let mut registry = HandlerRegistry::new();
        registry
            .register(
                "e",
                "t",
                Handler::suspending(|_| async { Err(anyhow::anyhow!("nope")) }),
            )
            .unwrap();
        registry
            .register("p", "t", Handler::suspending(|_| explode()))
            .unwrap();
        let dispatcher = dispatcher(registry);

        dispatcher.dispatch(Envelope::new("e", json!(null)), &message("t"));
        dispatcher.dispatch(Envelope::new("p", json!(null)), &message("t"));

        let report = dispatcher.drain(Duration::from_secs(1)).await;
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn handler_receives_routing_metadata() {
        let seen = Arc::new(Mutex::new(None));
        let mut registry = HandlerRegistry::new();
        {
            let seen = Arc::clone(&seen);
            registry
                .register(
                    "e",
                    "t",
                    Handler::blocking(move |ctx| {
                        *seen.lock().unwrap() = Some(ctx);
                        Ok(())
                    }),
                )
                .unwrap();
        }
        let dispatcher = dispatcher(registry);

        let mut envelope = Envelope::new("e", json!({ "k": "v" }));
        envelope.extra.insert("trace_id".to_string(), json!("abc"));
        envelope.extra.insert("offset".to_string(), json!("spoofed"));
        dispatcher.dispatch(envelope, &message("t"));

        let ctx = seen.lock().unwrap().take().unwrap();
        assert_eq!(ctx.topic, "t");
        assert_eq!(ctx.payload, json!({ "k": "v" }));
        assert_eq!(ctx.partition(), Some(0));
        assert_eq!(ctx.offset(), Some(7));
        assert_eq!(ctx.metadata("trace_id"), Some(&json!("abc")));
    }

    #[test]
    fn panic_message_reads_common_payloads() {
        let from_str: Box<dyn Any + Send> = Box::new("static");
        let from_string: Box<dyn Any + Send> = Box::new(String::from("owned"));
        let other: Box<dyn Any + Send> = Box::new(42_u8);

        assert_eq!(panic_message(&*from_str), "static");
        assert_eq!(panic_message(&*from_string), "owned");
        assert_eq!(panic_message(&*other), "non-string panic payload");
    }
}
