//! The run loop and lifecycle controller.
//!
//! # Lifecycle
//!
//! ```text
//!            run()                close()             drained
//! Created ──────────► Running ──────────► Closing ──────────► Closed
//!    │                                                           ▲
//!    └──────────────────────── close() ──────────────────────────┘
//! ```
//!
//! - `run()` is valid once, from `Created`. It resolves after `Closed`.
//! - `close()` is synchronous and idempotent. It can be called from any
//!   thread, including a signal handler task, through a [`CloseHandle`].
//! - On a terminal transport error the loop closes itself and `run()`
//!   returns the error.
//!
//! # Shutdown
//!
//! After the loop stops pulling, running suspending handlers get
//! `shutdown_grace_period` to finish. Tasks still running then are left
//! detached and logged as `AbandonedOnShutdown`. The consumer session is
//! released last.

use crate::dispatcher::Dispatcher;
use crate::error::RouterError;
use crate::metrics::{MESSAGES_DECODE_FAILED, MESSAGES_RECEIVED, TRANSPORT_RETRIES};
use crate::retry::{Backoff, RetryPolicy};
use event_router_core::envelope::decode;
use event_router_core::{
    AppConfig, Connector, ConnectorError, DecodeError, Handler, HandlerContext, HandlerDescriptor,
    HandlerRegistry, HandlerResult, MessageStream, Producer, RawMessage,
};
use futures::StreamExt;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tracing::Instrument;

/// Lifecycle of an [`EventRouter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    /// Constructed; handlers may be registered
    Created,
    /// Consuming messages
    Running,
    /// No longer consuming; draining in-flight handlers
    Closing,
    /// Terminal
    Closed,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => f.write_str("created"),
            Self::Running => f.write_str("running"),
            Self::Closing => f.write_str("closing"),
            Self::Closed => f.write_str("closed"),
        }
    }
}

/// Cloneable handle that requests shutdown of an [`EventRouter`].
///
/// Does not borrow the router, so it can be moved into a signal task or
/// another thread.
#[derive(Debug, Clone)]
pub struct CloseHandle {
    state: Arc<watch::Sender<LifecycleState>>,
}

impl CloseHandle {
    /// Request shutdown. Idempotent.
    ///
    /// From `Created` the router goes straight to `Closed`; from `Running`
    /// it moves to `Closing` and the run loop takes over from there.
    pub fn close(&self) {
        let mut previous = None;
        self.state.send_if_modified(|state| {
            previous = Some(*state);
            match state {
                LifecycleState::Created => {
                    *state = LifecycleState::Closed;
                    true
                },
                LifecycleState::Running => {
                    *state = LifecycleState::Closing;
                    true
                },
                LifecycleState::Closing | LifecycleState::Closed => false,
            }
        });

        match previous {
            Some(LifecycleState::Created) => tracing::info!("Router closed before it was started"),
            Some(LifecycleState::Running) => {
                tracing::info!("Close requested, stopping consumption");
            },
            _ => tracing::debug!("Close requested again, ignoring"),
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// Resolve once the router reaches `Closed`.
    pub async fn wait_closed(&self) {
        let mut state = self.state.subscribe();
        // The sender is owned by `self`, so the channel stays open.
        let _ = state.wait_for(|s| *s == LifecycleState::Closed).await;
    }
}

/// Routes messages from a [`Connector`] to registered handlers.
///
/// Handlers are registered through `&mut self`, so no registration can race
/// with a running loop (which borrows `&self`). Once `run()` starts, the
/// registry is sealed and shared read-only with the dispatcher.
pub struct EventRouter {
    config: AppConfig,
    connector: Arc<dyn Connector>,
    registry: Mutex<HandlerRegistry>,
    retry: RetryPolicy,
    close: CloseHandle,
    started: AtomicBool,
}

impl fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRouter")
            .field("app_name", &self.config.app_name)
            .field("listen_topics", &self.config.listen_topics)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl EventRouter {
    /// Create a router over `connector`.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::Config`] if `config` fails validation.
    pub fn new(
        config: AppConfig,
        connector: impl Connector + 'static,
    ) -> Result<Self, RouterError> {
        Self::with_connector(config, Arc::new(connector))
    }

    /// Create a router over a shared connector.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::Config`] if `config` fails validation.
    pub fn with_connector(
        config: AppConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, RouterError> {
        config.validate()?;
        let (state, _) = watch::channel(LifecycleState::Created);

        Ok(Self {
            retry: RetryPolicy::from(&config.retry),
            config,
            connector,
            registry: Mutex::new(HandlerRegistry::new()),
            close: CloseHandle {
                state: Arc::new(state),
            },
            started: AtomicBool::new(false),
        })
    }

    /// Replace the transport retry policy derived from the configuration.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// The router's configuration.
    #[must_use]
    pub const fn config(&self) -> &AppConfig {
        &self.config
    }

    // ═══════════════════════════════════════════════════════════════════
    // Registration
    // ═══════════════════════════════════════════════════════════════════

    /// Bind a blocking handler to `(event, topic)`.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::Registry`] if the key is already bound or the
    /// router has been started.
    pub fn on<F>(
        &mut self,
        event: impl Into<String>,
        topic: impl Into<String>,
        handler: F,
    ) -> Result<&mut Self, RouterError>
    where
        F: Fn(HandlerContext) -> HandlerResult + Send + Sync + 'static,
    {
        self.register(event, topic, Handler::blocking(handler))
    }

    /// Bind a suspending handler to `(event, topic)`.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::Registry`] if the key is already bound or the
    /// router has been started.
    pub fn on_async<F, Fut>(
        &mut self,
        event: impl Into<String>,
        topic: impl Into<String>,
        handler: F,
    ) -> Result<&mut Self, RouterError>
    where
        F: Fn(HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register(event, topic, Handler::suspending(handler))
    }

    /// Bind a blocking handler, replacing any existing binding.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::Registry`] if the router has been started.
    pub fn on_override<F>(
        &mut self,
        event: impl Into<String>,
        topic: impl Into<String>,
        handler: F,
    ) -> Result<&mut Self, RouterError>
    where
        F: Fn(HandlerContext) -> HandlerResult + Send + Sync + 'static,
    {
        self.register_override(event, topic, Handler::blocking(handler))?;
        Ok(self)
    }

    /// Bind a suspending handler, replacing any existing binding.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::Registry`] if the router has been started.
    pub fn on_async_override<F, Fut>(
        &mut self,
        event: impl Into<String>,
        topic: impl Into<String>,
        handler: F,
    ) -> Result<&mut Self, RouterError>
    where
        F: Fn(HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register_override(event, topic, Handler::suspending(handler))?;
        Ok(self)
    }

    /// Bind an already-built [`Handler`].
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::Registry`] if the key is already bound or the
    /// router has been started.
    pub fn register(
        &mut self,
        event: impl Into<String>,
        topic: impl Into<String>,
        handler: Handler,
    ) -> Result<&mut Self, RouterError> {
        self.registry_mut().register(event, topic, handler)?;
        Ok(self)
    }

    /// Bind an already-built [`Handler`], replacing any existing binding.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::Registry`] if the router has been started.
    pub fn register_override(
        &mut self,
        event: impl Into<String>,
        topic: impl Into<String>,
        handler: Handler,
    ) -> Result<Option<HandlerDescriptor>, RouterError> {
        Ok(self.registry_mut().register_override(event, topic, handler)?)
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn registry_mut(&mut self) -> &mut HandlerRegistry {
        self.registry.get_mut().unwrap_or_else(PoisonError::into_inner)
    }

    // ═══════════════════════════════════════════════════════════════════
    // Lifecycle
    // ═══════════════════════════════════════════════════════════════════

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.close.state()
    }

    /// A handle that can close the router from elsewhere.
    #[must_use]
    pub fn close_handle(&self) -> CloseHandle {
        self.close.clone()
    }

    /// Request shutdown. Idempotent; see [`CloseHandle::close`].
    pub fn close(&self) {
        self.close.close();
    }

    /// Resolve once the router reaches `Closed`.
    pub async fn wait_closed(&self) {
        self.close.wait_closed().await;
    }

    /// Create a producer through the router's connector.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::Transport`] if the connector cannot build one.
    pub fn producer(&self) -> Result<Box<dyn Producer>, RouterError> {
        Ok(self.connector.producer()?)
    }

    /// Consume and dispatch until closed.
    ///
    /// Resolves after the router reaches `Closed`. If [`close`](Self::close)
    /// was called before `run`, returns `Ok(())` without subscribing.
    ///
    /// # Errors
    ///
    /// - [`RouterError::AlreadyStarted`] if `run` was called before
    /// - [`RouterError::Transport`] if the transport failed terminally
    pub async fn run(&self) -> Result<(), RouterError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(RouterError::AlreadyStarted);
        }

        let registry = {
            let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
            registry.seal();
            Arc::new(registry.clone())
        };

        let began = self.close.state.send_if_modified(|state| {
            if *state == LifecycleState::Created {
                *state = LifecycleState::Running;
                true
            } else {
                false
            }
        });
        if !began {
            tracing::info!(
                app = %self.config.app_name,
                "Router was closed before run, not consuming"
            );
            return Ok(());
        }
        self.warn_unsubscribed_topics(&registry);

        let span = tracing::info_span!("router", app = %self.config.app_name);
        self.run_sealed(Dispatcher::new(registry)).instrument(span).await
    }

    async fn run_sealed(&self, dispatcher: Dispatcher) -> Result<(), RouterError> {
        tracing::info!(
            topics = ?self.config.listen_topics,
            group_id = ?self.config.group_id(),
            "Router started"
        );

        let mut session: Option<MessageStream> = None;
        let result = self.consume(&dispatcher, &mut session).await;

        // A terminal transport error closes the loop on its own.
        self.close.state.send_if_modified(|state| {
            if *state == LifecycleState::Running {
                *state = LifecycleState::Closing;
                true
            } else {
                false
            }
        });

        let report = dispatcher.drain(self.config.shutdown_grace_period()).await;
        if !report.is_clean() {
            tracing::warn!(
                abandoned = report.abandoned.len(),
                "Shutdown finished with abandoned handlers"
            );
        }

        if session.take().is_some() {
            tracing::info!("Consumer session released");
        }
        self.close.state.send_replace(LifecycleState::Closed);

        match &result {
            Ok(()) => tracing::info!("Router closed"),
            Err(error) => tracing::error!(error = %error, "Router closed after transport failure"),
        }
        result.map_err(RouterError::from)
    }

    /// The consume loop. Returns `Ok` when asked to stop.
    async fn consume(
        &self,
        dispatcher: &Dispatcher,
        session: &mut Option<MessageStream>,
    ) -> Result<(), ConnectorError> {
        let mut closing = self.close.state.subscribe();
        let mut backoff = Backoff::new(self.retry.clone());

        loop {
            if session.is_none() {
                match self.open_session(&mut backoff, &mut closing).await? {
                    Some(stream) => *session = Some(stream),
                    None => return Ok(()),
                }
            }
            let Some(stream) = session.as_mut() else {
                continue;
            };

            let next = tokio::select! {
                biased;
                () = stopped(&mut closing) => return Ok(()),
                next = stream.next() => next,
            };

            match next {
                Some(Ok(message)) => {
                    backoff.reset();
                    self.handle_message(dispatcher, &message);
                },
                Some(Err(error)) => {
                    if !pause_before_retry(error, &mut backoff, &mut closing).await? {
                        return Ok(());
                    }
                },
                None => {
                    tracing::warn!("Consumer stream ended, resubscribing");
                    *session = None;
                    if !pause_before_retry(ConnectorError::StreamEnded, &mut backoff, &mut closing)
                        .await?
                    {
                        return Ok(());
                    }
                },
            }
        }
    }

    /// Subscribe, retrying transient failures. `None` means close was requested.
    async fn open_session(
        &self,
        backoff: &mut Backoff,
        closing: &mut watch::Receiver<LifecycleState>,
    ) -> Result<Option<MessageStream>, ConnectorError> {
        loop {
            let attempt = tokio::select! {
                biased;
                () = stopped(closing) => return Ok(None),
                attempt = self.connector.subscribe(&self.config.listen_topics) => attempt,
            };

            match attempt {
                Ok(stream) => {
                    tracing::info!(topics = ?self.config.listen_topics, "Consumer session opened");
                    return Ok(Some(stream));
                },
                Err(error) => {
                    if !pause_before_retry(error, backoff, closing).await? {
                        return Ok(None);
                    }
                },
            }
        }
    }

    fn handle_message(&self, dispatcher: &Dispatcher, message: &RawMessage) {
        metrics::counter!(MESSAGES_RECEIVED).increment(1);

        let decoded = match message.payload.as_deref() {
            Some(body) => decode(body, &message.topic),
            None => Err(DecodeError::new(message.topic.clone(), &[], "empty message")),
        };

        match decoded {
            Ok(envelope) => {
                let outcome = dispatcher.dispatch(envelope, message);
                tracing::trace!(?outcome, "Message dispatched");
            },
            Err(error) => {
                tracing::warn!(
                    topic = %error.topic,
                    partition = ?message.partition,
                    offset = ?message.offset,
                    preview = %error.preview,
                    reason = %error.reason,
                    "DecodeError: skipping message"
                );
                metrics::counter!(MESSAGES_DECODE_FAILED).increment(1);
            },
        }
    }

    fn warn_unsubscribed_topics(&self, registry: &HandlerRegistry) {
        if registry.is_empty() {
            tracing::warn!("No handlers registered, every message will be dropped");
        }
        for topic in registry.topics() {
            if !self.config.listen_topics.iter().any(|t| t == topic) {
                tracing::warn!(
                    topic = %topic,
                    "Handler registered for a topic that is not in listen_topics"
                );
            }
        }
    }
}

/// Resolve once the router is no longer `Running`.
async fn stopped(closing: &mut watch::Receiver<LifecycleState>) {
    // The sender outlives every receiver handed to the loop.
    let _ = closing.wait_for(|s| *s != LifecycleState::Running).await;
}

/// Apply the transport failure policy to `error`.
///
/// Returns `Ok(true)` after sleeping out the backoff, `Ok(false)` if close
/// was requested during the sleep, and `Err` when the error is terminal.
async fn pause_before_retry(
    error: ConnectorError,
    backoff: &mut Backoff,
    closing: &mut watch::Receiver<LifecycleState>,
) -> Result<bool, ConnectorError> {
    if !error.is_transient() {
        tracing::error!(error = %error, "Non-transient transport error");
        return Err(error);
    }
    let Some(delay) = backoff.next_delay() else {
        tracing::error!(
            error = %error,
            attempts = backoff.attempts(),
            "Transport retries exhausted"
        );
        return Err(error);
    };

    tracing::warn!(
        error = %error,
        attempt = backoff.attempts(),
        delay_ms = delay.as_millis(),
        "Transport error, retrying after backoff"
    );
    metrics::counter!(TRANSPORT_RETRIES).increment(1);

    tokio::select! {
        biased;
        () = stopped(closing) => Ok(false),
        () = tokio::time::sleep(delay) => Ok(true),
    }
}
