//! Transport abstraction consumed by the router.
//!
//! A [`Connector`] opens consumer sessions (a stream of [`RawMessage`]s for a
//! set of topics) and producer handles. The router never talks to a broker
//! directly; it only pulls from the stream returned by
//! [`Connector::subscribe`] and drops it to release the session.
//!
//! # Delivery
//!
//! Connectors are expected to provide at-least-once delivery with ordering
//! within a partition. Errors are classified by the connector: transient
//! errors are retried by the run loop, anything else is terminal.
//!
//! # Example
//!
//! ```rust,ignore
//! use futures::StreamExt;
//!
//! let mut stream = connector.subscribe(&["test_topic".to_string()]).await?;
//! while let Some(result) = stream.next().await {
//!     match result {
//!         Ok(message) => println!("{} bytes on {}", message.len(), message.topic),
//!         Err(e) if e.is_transient() => tracing::warn!(error = %e, "transient"),
//!         Err(e) => return Err(e),
//!     }
//! }
//! ```

use crate::envelope::Envelope;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde_json::{Map, Value, json};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors reported by a connector.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectorError {
    /// Could not reach the brokers or build a client
    #[error("Connection failed: {reason}")]
    Connection {
        /// What went wrong
        reason: String,
        /// Whether retrying may succeed
        transient: bool,
    },

    /// Could not subscribe to the requested topics
    #[error("Subscription failed for topics {topics:?}: {reason}")]
    Subscription {
        /// Topics requested
        topics: Vec<String>,
        /// What went wrong
        reason: String,
        /// Whether retrying may succeed
        transient: bool,
    },

    /// Pulling the next message failed
    #[error("Failed to receive message: {reason}")]
    Receive {
        /// What went wrong
        reason: String,
        /// Whether retrying may succeed
        transient: bool,
    },

    /// Publishing failed
    #[error("Publish failed for topic '{topic}': {reason}")]
    Publish {
        /// Target topic
        topic: String,
        /// What went wrong
        reason: String,
    },

    /// The consumer stream ended unexpectedly
    #[error("Message stream ended")]
    StreamEnded,

    /// The producer or connector has been closed
    #[error("Connector is closed")]
    Closed,
}

impl ConnectorError {
    /// Whether the run loop should retry after this error.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Connection { transient, .. }
            | Self::Subscription { transient, .. }
            | Self::Receive { transient, .. } => *transient,
            Self::StreamEnded => true,
            Self::Publish { .. } | Self::Closed => false,
        }
    }
}

/// A message as delivered by the transport, before decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    /// Topic the message was consumed from
    pub topic: String,
    /// Partition within the topic, if the transport has partitions
    pub partition: Option<i32>,
    /// Offset within the partition
    pub offset: Option<i64>,
    /// Message key
    pub key: Option<Vec<u8>>,
    /// Broker or producer timestamp
    pub timestamp: Option<DateTime<Utc>>,
    /// Message body; `None` for tombstones or empty messages
    pub payload: Option<Vec<u8>>,
}

impl RawMessage {
    /// Create a message with only a topic and a body.
    #[must_use]
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            partition: None,
            offset: None,
            key: None,
            timestamp: None,
            payload: Some(payload.into()),
        }
    }

    /// Set partition and offset.
    #[must_use]
    pub const fn at(mut self, partition: i32, offset: i64) -> Self {
        self.partition = Some(partition);
        self.offset = Some(offset);
        self
    }

    /// Body length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.payload.as_ref().map_or(0, Vec::len)
    }

    /// Whether the message has no body.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Routing metadata handed to handlers alongside the payload.
    #[must_use]
    pub fn metadata(&self) -> Map<String, Value> {
        let mut metadata = Map::new();
        if let Some(partition) = self.partition {
            metadata.insert("partition".to_string(), json!(partition));
        }
        if let Some(offset) = self.offset {
            metadata.insert("offset".to_string(), json!(offset));
        }
        if let Some(key) = &self.key {
            metadata.insert(
                "key".to_string(),
                Value::String(String::from_utf8_lossy(key).into_owned()),
            );
        }
        if let Some(timestamp) = self.timestamp {
            metadata.insert("timestamp".to_string(), json!(timestamp.to_rfc3339()));
        }
        metadata
    }
}

/// Stream of raw messages from a consumer session.
///
/// Dropping the stream releases the session.
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<RawMessage, ConnectorError>> + Send>>;

/// Boxed future returned by connector and producer operations.
pub type ConnectorFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, ConnectorError>> + Send + 'a>>;

/// Transport connector.
///
/// Uses explicit boxed futures rather than `async fn` so that the router can
/// hold `Arc<dyn Connector>`.
pub trait Connector: Send + Sync {
    /// Open a consumer session on `topics`.
    ///
    /// The consumer group and any other consumer settings come from the
    /// connector's own configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError::Subscription`] or [`ConnectorError::Connection`].
    fn subscribe(&self, topics: &[String]) -> ConnectorFuture<'_, MessageStream>;

    /// Create a producer against the connector's bootstrap servers.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError::Connection`] if the producer cannot be built.
    fn producer(&self) -> Result<Box<dyn Producer>, ConnectorError>;
}

/// Producer handle.
pub trait Producer: Send + Sync {
    /// Publish an envelope to `topic`.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError::Publish`], or [`ConnectorError::Closed`]
    /// after [`close`](Self::close).
    fn send<'a>(&'a self, topic: &'a str, envelope: &'a Envelope) -> ConnectorFuture<'a, ()>;

    /// Flush pending messages and reject further sends.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError::Publish`] if the flush fails.
    fn close(&self) -> ConnectorFuture<'_, ()>;
}

impl dyn Producer {
    /// Publish `payload` under `event` to `topic`.
    ///
    /// # Errors
    ///
    /// Same as [`Producer::send`].
    pub async fn send_event(
        &self,
        topic: &str,
        event: &str,
        payload: Value,
    ) -> Result<(), ConnectorError> {
        let envelope = Envelope::new(event, payload);
        self.send(topic, &envelope).await
    }
}
