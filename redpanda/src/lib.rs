//! Kafka-compatible connector for the event router.
//!
//! Implements [`Connector`] and [`Producer`] from `event-router-core` on top
//! of rdkafka, so it works against Redpanda, Apache Kafka or any other
//! broker speaking the Kafka protocol.
//!
//! # Architecture
//!
//! ```text
//!  ┌────────────────┐   forward    ┌──────────┐   next()   ┌─────────────┐
//!  │ StreamConsumer │ ───────────► │   mpsc   │ ─────────► │ EventRouter │
//!  │ (spawned task) │              │ (bounded)│            │  run loop   │
//!  └────────────────┘              └──────────┘            └─────────────┘
//!          ▲                acks (previous message)              │
//!          └─────────────────────────────────────────────────────┘
//! ```
//!
//! # Delivery Semantics
//!
//! **At-least-once delivery** with manual offset commits:
//! - A message is committed only AFTER the router has dispatched it, which
//!   it signals by polling the stream for the next message
//! - Messages still buffered in the channel when the stream is dropped are
//!   never committed, and are redelivered to the next consumer
//! - Handlers MUST tolerate duplicates
//! - Ordering is preserved within a partition
//!
//! Dropping the stream returned by [`Connector::subscribe`] stops the
//! forwarding task, which drops the consumer and leaves the group.
//!
//! # Configuration
//!
//! Consumer settings are taken from [`AppConfig::consumer_config`]. Keys may
//! use underscores (`group_id`, `auto_offset_reset`); they are translated to
//! librdkafka's dotted form (`group.id`, `auto.offset.reset`).
//!
//! # Example
//!
//! ```no_run
//! use event_router_core::{AppConfig, Connector};
//! use event_router_redpanda::RedpandaConnector;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AppConfig::builder()
//!     .bootstrap_servers(["localhost:9092"])
//!     .group_id("people-service")
//!     .consumer_option("auto_offset_reset", "earliest")
//!     .listen_topic("test_topic")
//!     .build()?;
//!
//! let connector = RedpandaConnector::from_config(&config)?;
//! let producer = connector.producer()?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use chrono::DateTime;
use event_router_core::connector::ConnectorFuture;
use event_router_core::{
    AppConfig, Connector, ConnectorError, Envelope, MessageStream, Producer, RawMessage,
};
use futures::StreamExt;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer as KafkaProducer};
use rdkafka::util::Timeout;
use rdkafka::{Offset, TopicPartitionList};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

/// Default capacity of the channel between the consumer task and the router.
pub const DEFAULT_BUFFER_SIZE: usize = 1000;

/// Default producer send and flush timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Kafka-compatible [`Connector`].
///
/// Consumers are created per subscription; producers per [`producer`]
/// call. The connector itself holds only configuration.
///
/// [`producer`]: Connector::producer
#[derive(Debug, Clone)]
pub struct RedpandaConnector {
    brokers: String,
    consumer_settings: BTreeMap<String, String>,
    producer_acks: String,
    compression: String,
    timeout: Duration,
    buffer_size: usize,
}

impl RedpandaConnector {
    /// Create a builder.
    #[must_use]
    pub fn builder() -> RedpandaConnectorBuilder {
        RedpandaConnectorBuilder::default()
    }

    /// Build a connector from router configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError::Connection`] if no broker or no consumer
    /// group is configured.
    pub fn from_config(config: &AppConfig) -> Result<Self, ConnectorError> {
        config
            .consumer_config
            .iter()
            .fold(
                Self::builder().brokers(config.bootstrap_servers_joined()),
                |builder, (key, value)| builder.consumer_option(key, value.to_string()),
            )
            .build()
    }

    /// Comma-separated broker list.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }

    /// Effective librdkafka consumer settings, excluding `bootstrap.servers`.
    #[must_use]
    pub const fn consumer_settings(&self) -> &BTreeMap<String, String> {
        &self.consumer_settings
    }

    fn consumer_client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", &self.brokers);
        for (key, value) in &self.consumer_settings {
            config.set(key, value);
        }
        config
    }
}

/// Builder for [`RedpandaConnector`].
///
/// # Example
///
/// ```no_run
/// use event_router_redpanda::RedpandaConnector;
/// use std::time::Duration;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let connector = RedpandaConnector::builder()
///     .brokers("localhost:9092,localhost:9093")
///     .group_id("people-service")
///     .auto_offset_reset("earliest")
///     .producer_acks("all")
///     .timeout(Duration::from_secs(10))
///     .build()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct RedpandaConnectorBuilder {
    brokers: Option<String>,
    consumer_options: BTreeMap<String, String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
    buffer_size: Option<usize>,
}

impl RedpandaConnectorBuilder {
    /// Set the broker addresses (comma-separated).
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Set a consumer setting. Underscored keys are translated to dotted form.
    #[must_use]
    pub fn consumer_option(mut self, key: &str, value: impl Into<String>) -> Self {
        self.consumer_options.insert(librdkafka_key(key), value.into());
        self
    }

    /// Set the consumer group.
    #[must_use]
    pub fn group_id(self, group: impl Into<String>) -> Self {
        self.consumer_option("group.id", group)
    }

    /// Where a new consumer group starts reading: `earliest`, `latest` or `error`.
    ///
    /// Default: `latest`
    #[must_use]
    pub fn auto_offset_reset(self, policy: impl Into<String>) -> Self {
        self.consumer_option("auto.offset.reset", policy)
    }

    /// Producer acknowledgment mode: `0`, `1` or `all`.
    ///
    /// Default: `1`
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Producer compression codec: `none`, `gzip`, `snappy`, `lz4` or `zstd`.
    ///
    /// Default: `none`
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Producer send and flush timeout.
    ///
    /// Default: 5 seconds
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Messages buffered between the consumer task and the router.
    ///
    /// Values below 1 are raised to 1. Default: 1000
    #[must_use]
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = Some(buffer_size.max(1));
        self
    }

    /// Build the connector.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError::Connection`] if brokers or the consumer
    /// group are missing.
    pub fn build(self) -> Result<RedpandaConnector, ConnectorError> {
        let brokers = self
            .brokers
            .filter(|b| !b.trim().is_empty())
            .ok_or_else(|| ConnectorError::Connection {
                reason: "Brokers not configured".to_string(),
                transient: false,
            })?;

        let mut settings: BTreeMap<String, String> = [
            ("auto.offset.reset", "latest"),
            ("session.timeout.ms", "6000"),
            ("enable.partition.eof", "false"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        settings.extend(self.consumer_options);

        if !settings.contains_key("group.id") {
            return Err(ConnectorError::Connection {
                reason: "Consumer group (group.id) not configured".to_string(),
                transient: false,
            });
        }

        // Offsets are committed by the forwarding task.
        if settings
            .insert("enable.auto.commit".to_string(), "false".to_string())
            .is_some_and(|previous| previous != "false")
        {
            tracing::warn!("Ignoring enable.auto.commit, offsets are committed manually");
        }

        let connector = RedpandaConnector {
            brokers,
            consumer_settings: settings,
            producer_acks: self.producer_acks.unwrap_or_else(|| "1".to_string()),
            compression: self.compression.unwrap_or_else(|| "none".to_string()),
            timeout: self.timeout.unwrap_or(DEFAULT_TIMEOUT),
            buffer_size: self.buffer_size.unwrap_or(DEFAULT_BUFFER_SIZE),
        };

        tracing::info!(
            brokers = %connector.brokers,
            group_id = ?connector.consumer_settings.get("group.id"),
            acks = %connector.producer_acks,
            buffer_size = connector.buffer_size,
            "RedpandaConnector created"
        );
        Ok(connector)
    }
}

/// `auto_offset_reset` → `auto.offset.reset`
fn librdkafka_key(key: &str) -> String {
    key.replace('_', ".")
}

/// Whether retrying after `error` may succeed.
fn is_transient(error: &KafkaError) -> bool {
    match error {
        KafkaError::ClientCreation(_) | KafkaError::Subscription(_) => false,
        _ => !matches!(
            error.rdkafka_error_code(),
            Some(
                RDKafkaErrorCode::Fatal
                    | RDKafkaErrorCode::Authentication
                    | RDKafkaErrorCode::SaslAuthenticationFailed
                    | RDKafkaErrorCode::TopicAuthorizationFailed
                    | RDKafkaErrorCode::GroupAuthorizationFailed
                    | RDKafkaErrorCode::ClusterAuthorizationFailed
            )
        ),
    }
}

fn raw_message(message: &BorrowedMessage<'_>) -> RawMessage {
    RawMessage {
        topic: message.topic().to_string(),
        partition: Some(message.partition()),
        offset: Some(message.offset()),
        key: message.key().map(<[u8]>::to_vec),
        timestamp: message
            .timestamp()
            .to_millis()
            .and_then(DateTime::from_timestamp_millis),
        payload: message.payload().map(<[u8]>::to_vec),
    }
}

/// Where a consumed message sits in its partition.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Position {
    topic: String,
    partition: i32,
    offset: i64,
}

impl Position {
    fn of(message: &RawMessage) -> Option<Self> {
        Some(Self {
            topic: message.topic.clone(),
            partition: message.partition?,
            offset: message.offset?,
        })
    }
}

/// Yield forwarded messages, acknowledging each one when the stream is
/// polled again.
///
/// The router dispatches a message before asking for the next, so a poll
/// means the previous message has been handled. A message yielded last, or
/// still buffered when the stream is dropped, is never acknowledged.
fn acknowledged_stream(
    mut rx: mpsc::Receiver<Result<RawMessage, ConnectorError>>,
    acks: mpsc::UnboundedSender<Position>,
) -> MessageStream {
    Box::pin(async_stream::stream! {
        while let Some(result) = rx.recv().await {
            let position = result.as_ref().ok().and_then(Position::of);
            yield result;
            if let Some(position) = position {
                if acks.send(position).is_err() {
                    break;
                }
            }
        }
    })
}

fn commit(consumer: &StreamConsumer, position: &Position) {
    let mut offsets = TopicPartitionList::new();
    // The committed offset is the next one to read.
    let added = offsets.add_partition_offset(
        &position.topic,
        position.partition,
        Offset::Offset(position.offset + 1),
    );
    if let Err(e) = added.and_then(|()| consumer.commit(&offsets, CommitMode::Async)) {
        tracing::warn!(
            topic = %position.topic,
            partition = position.partition,
            offset = position.offset,
            error = %e,
            "Failed to commit offset (message may be redelivered)"
        );
    }
}

impl Connector for RedpandaConnector {
    fn subscribe(&self, topics: &[String]) -> ConnectorFuture<'_, MessageStream> {
        let topics = topics.to_vec();

        Box::pin(async move {
            let consumer: StreamConsumer =
                self.consumer_client_config()
                    .create()
                    .map_err(|e| ConnectorError::Connection {
                        reason: format!("Failed to create consumer: {e}"),
                        transient: is_transient(&e),
                    })?;

            let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
            consumer
                .subscribe(&topic_refs)
                .map_err(|e| ConnectorError::Subscription {
                    topics: topics.clone(),
                    reason: format!("Failed to subscribe to topics: {e}"),
                    transient: is_transient(&e),
                })?;

            tracing::info!(
                topics = ?topics,
                group_id = ?self.consumer_settings.get("group.id"),
                buffer_size = self.buffer_size,
                manual_commit = true,
                "Subscribed to topics"
            );

            let (tx, rx) = mpsc::channel(self.buffer_size);
            let (ack_tx, mut acks) = mpsc::unbounded_channel();

            // The task owns the consumer; it leaves the group when the task ends.
            tokio::spawn(async move {
                let mut stream = consumer.stream();

                loop {
                    let next = tokio::select! {
                        () = tx.closed() => break,
                        Some(position) = acks.recv() => {
                            commit(&consumer, &position);
                            continue;
                        },
                        next = stream.next() => next,
                    };
                    let Some(result) = next else {
                        break;
                    };

                    match result {
                        Ok(message) => {
                            tracing::trace!(
                                topic = message.topic(),
                                partition = message.partition(),
                                offset = message.offset(),
                                "Received message"
                            );

                            if tx.send(Ok(raw_message(&message))).await.is_err() {
                                tracing::debug!("Receiver dropped, exiting without commit");
                                break;
                            }
                        },
                        Err(e) => {
                            let err = ConnectorError::Receive {
                                reason: e.to_string(),
                                transient: is_transient(&e),
                            };
                            if tx.send(Err(err)).await.is_err() {
                                break;
                            }
                        },
                    }
                }

                while let Ok(position) = acks.try_recv() {
                    commit(&consumer, &position);
                }
                tracing::debug!("Consumer task exiting");
            });

            Ok(acknowledged_stream(rx, ack_tx))
        })
    }

    fn producer(&self) -> Result<Box<dyn Producer>, ConnectorError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &self.brokers)
            .set("message.timeout.ms", self.timeout.as_millis().to_string())
            .set("acks", &self.producer_acks)
            .set("compression.type", &self.compression)
            .create()
            .map_err(|e| ConnectorError::Connection {
                reason: format!("Failed to create producer: {e}"),
                transient: is_transient(&e),
            })?;

        Ok(Box::new(RedpandaProducer {
            producer,
            timeout: self.timeout,
            closed: AtomicBool::new(false),
        }))
    }
}

/// Kafka-compatible [`Producer`].
///
/// Envelopes are JSON-encoded; the event name is used as the message key so
/// that events of one kind land on one partition.
pub struct RedpandaProducer {
    producer: FutureProducer,
    timeout: Duration,
    closed: AtomicBool,
}

impl std::fmt::Debug for RedpandaProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedpandaProducer")
            .field("timeout", &self.timeout)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl Producer for RedpandaProducer {
    fn send<'a>(&'a self, topic: &'a str, envelope: &'a Envelope) -> ConnectorFuture<'a, ()> {
        Box::pin(async move {
            if self.closed.load(Ordering::SeqCst) {
                return Err(ConnectorError::Closed);
            }

            let payload = envelope.to_bytes().map_err(|e| ConnectorError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;
            let record = FutureRecord::to(topic)
                .payload(&payload)
                .key(envelope.event.as_bytes());

            match self.producer.send(record, Timeout::After(self.timeout)).await {
                Ok((partition, offset)) => {
                    tracing::debug!(
                        topic = %topic,
                        partition,
                        offset,
                        event = %envelope.event,
                        "Message published"
                    );
                    Ok(())
                },
                Err((e, _)) => {
                    tracing::error!(topic = %topic, error = %e, "Failed to publish message");
                    Err(ConnectorError::Publish {
                        topic: topic.to_string(),
                        reason: e.to_string(),
                    })
                },
            }
        })
    }

    fn close(&self) -> ConnectorFuture<'_, ()> {
        Box::pin(async move {
            if self.closed.swap(true, Ordering::SeqCst) {
                return Ok(());
            }

            // flush() blocks the calling thread.
            let producer = self.producer.clone();
            let timeout = self.timeout;
            let flushed =
                tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout)))
                    .await
                    .map_err(|e| ConnectorError::Publish {
                        topic: String::new(),
                        reason: format!("Flush task failed: {e}"),
                    })?;

            flushed.map_err(|e| ConnectorError::Publish {
                topic: String::new(),
                reason: format!("Failed to flush producer: {e}"),
            })?;
            tracing::debug!("Producer flushed and closed");
            Ok(())
        })
    }
}
