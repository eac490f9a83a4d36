//! # Event Router Testing
//!
//! Testing utilities for code built on the event router.
//!
//! This crate provides:
//! - [`InMemoryConnector`]: an in-process broker with fault injection
//! - [`Counter`] and [`Recorder`]: notifying shared state for handler tests
//! - [`test_config`]: a valid configuration with fast retries
//!
//! ## Example
//!
//! ```ignore
//! use event_router_runtime::EventRouter;
//! use event_router_testing::{Counter, InMemoryConnector, test_config};
//!
//! #[tokio::test]
//! async fn test_person_flow() {
//!     let broker = InMemoryConnector::new();
//!     let counter = Counter::new();
//!
//!     let mut router = EventRouter::new(test_config(&["test_topic"]), broker.clone()).unwrap();
//!     let hits = counter.clone();
//!     router.on("process_person", "test_topic", move |_| { hits.incr(); Ok(()) }).unwrap();
//!
//!     broker.publish("test_topic", "process_person", json!({ "age": 35 }));
//!     // run the router, wait on the counter, close...
//! }
//! ```

/// In-memory connector
pub mod connector;

/// Handler test helpers
pub mod harness;

pub use connector::{InMemoryConnector, InMemoryProducer};
pub use harness::{Counter, Recorder, init_test_tracing, test_config};
