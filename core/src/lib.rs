//! # Event Router Core
//!
//! Core types for routing events consumed from a publish/subscribe transport
//! to registered handlers.
//!
//! ## Core Concepts
//!
//! - **Envelope**: a decoded message, `{"event": ..., "payload": ...}`
//! - **EventKey**: the `(event, topic)` pair a handler is bound to
//! - **Handler**: a blocking or suspending callable, tagged by style
//! - **Registry**: `EventKey → HandlerDescriptor`, sealed before consumption
//! - **Connector**: the transport seam (consumer streams and producers)
//!
//! ## Data Flow
//!
//! ```text
//! Connector ──► RawMessage ──► decode ──► Envelope ──► Registry lookup ──► Handler
//! ```
//!
//! The run loop and dispatcher live in `event-router-runtime`; this crate has
//! no async runtime dependency.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod connector;
pub mod envelope;
pub mod handler;
pub mod registry;

pub use config::{AppConfig, AppConfigBuilder, ConfigError, ConfigValue, RetryConfig};
pub use connector::{Connector, ConnectorError, MessageStream, Producer, RawMessage};
pub use envelope::{DecodeError, EncodeError, Envelope};
pub use handler::{Handler, HandlerContext, HandlerResult, HandlerStyle};
pub use registry::{EventKey, HandlerDescriptor, HandlerRegistry, RegistryError};
