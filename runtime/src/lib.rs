//! # Event Router Runtime
//!
//! The consume loop, dispatcher and lifecycle controller for the event
//! router.
//!
//! ## Core Components
//!
//! - **`EventRouter`**: owns the registry and runs consume → decode → dispatch
//! - **Dispatcher**: runs blocking handlers inline and spawns suspending ones
//! - **`InFlight`**: tracks spawned handler tasks for the shutdown drain
//! - **Retry**: exponential backoff for transient transport errors
//!
//! ## Example
//!
//! ```ignore
//! use event_router_core::AppConfig;
//! use event_router_runtime::EventRouter;
//!
//! let config = AppConfig::builder()
//!     .bootstrap_servers(["localhost:9092"])
//!     .group_id("people")
//!     .listen_topic("test_topic")
//!     .build()?;
//!
//! let mut router = EventRouter::new(config, connector)?;
//! router.on("process_person", "test_topic", |ctx| {
//!     println!("{}", ctx.payload);
//!     Ok(())
//! })?;
//!
//! let close = router.close_handle();
//! tokio::spawn(event_router_runtime::signals::close_on_signal(close));
//!
//! router.run().await?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Routing of decoded envelopes to handlers
pub mod dispatcher;

/// Tracking of running suspending handler tasks
pub mod in_flight;

/// `tracing` subscriber initialisation
pub mod logging;

/// Metric names emitted by the router
pub mod metrics;

/// Retry logic with exponential backoff
pub mod retry;

/// The run loop and lifecycle controller
pub mod router;

/// OS signal glue for graceful shutdown
pub mod signals;

/// Error types for the router runtime
pub mod error {
    use crate::dispatcher::panic_message;
    use event_router_core::{ConfigError, ConnectorError, EventKey, RegistryError};
    use std::any::Any;
    use thiserror::Error;

    /// Errors surfaced by [`EventRouter`](crate::EventRouter) operations.
    ///
    /// Per-message failures (decoding, handler errors, unmatched events) are
    /// logged and never appear here.
    #[derive(Error, Debug)]
    pub enum RouterError {
        /// `run()` was called a second time
        #[error("Router has already been started")]
        AlreadyStarted,

        /// A registration call was rejected
        ///
        /// Setup-time error: surfaced to the caller, never swallowed.
        #[error(transparent)]
        Registry(#[from] RegistryError),

        /// The transport failed terminally
        ///
        /// Either a non-transient error, or transient errors that outlasted
        /// the retry budget. The loop drains and closes before returning it.
        #[error("Transport failed: {0}")]
        Transport(#[from] ConnectorError),

        /// The configuration is invalid
        #[error(transparent)]
        Config(#[from] ConfigError),
    }

    /// A handler returned an error or panicked.
    ///
    /// Contained by the dispatcher: logged with the event, topic and a
    /// truncated payload preview, then dropped.
    #[derive(Error, Debug, Clone, PartialEq, Eq)]
    #[error("Handler for {key} failed: {reason}")]
    pub struct HandlerExecutionError {
        /// Key the handler is bound to
        pub key: EventKey,
        /// Truncated rendering of the payload
        pub preview: String,
        /// Error text or panic message
        pub reason: String,
        /// Whether the handler panicked rather than returning `Err`
        pub panicked: bool,
    }

    impl HandlerExecutionError {
        /// The handler returned `Err(error)`.
        #[must_use]
        pub fn failed(key: EventKey, preview: String, error: &anyhow::Error) -> Self {
            Self {
                key,
                preview,
                reason: format!("{error:#}"),
                panicked: false,
            }
        }

        /// The handler panicked with `panic` as payload.
        #[must_use]
        pub fn panicked(key: EventKey, preview: String, panic: &(dyn Any + Send)) -> Self {
            Self {
                key,
                preview,
                reason: panic_message(panic),
                panicked: true,
            }
        }
    }
}

pub use dispatcher::{DispatchOutcome, Dispatcher, DrainReport};
pub use error::{HandlerExecutionError, RouterError};
pub use in_flight::{InFlight, InFlightGuard};
pub use retry::{Backoff, RetryPolicy};
pub use router::{CloseHandle, EventRouter, LifecycleState};
