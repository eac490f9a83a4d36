//! In-process broker for router tests.
//!
//! [`InMemoryConnector`] keeps one ordered queue per subscription. Messages
//! published while nobody is subscribed to their topic wait in a backlog and
//! are handed to the next matching subscription, so tests can publish before
//! `run()` starts.
//!
//! Fault injection:
//! - [`inject_error`](InMemoryConnector::inject_error) makes the next poll fail
//! - [`fail_next_subscribe`](InMemoryConnector::fail_next_subscribe) makes a
//!   subscribe call fail
//! - [`end_streams`](InMemoryConnector::end_streams) ends every open stream

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use event_router_core::connector::ConnectorFuture;
use event_router_core::envelope::encode;
use event_router_core::{
    Connector, ConnectorError, Envelope, MessageStream, Producer, RawMessage,
};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, mpsc};

type Item = Result<RawMessage, ConnectorError>;

/// In-memory [`Connector`] with fault injection.
///
/// Cloning shares the broker, so a test can keep one clone for publishing
/// while the router owns another.
///
/// # Example
///
/// ```
/// use event_router_testing::InMemoryConnector;
/// use serde_json::json;
///
/// let broker = InMemoryConnector::new();
/// broker.publish("test_topic", "process_person", json!({ "age": 35 }));
/// assert_eq!(broker.published("test_topic").len(), 1);
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryConnector {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<State>,
    changed: Notify,
}

#[derive(Debug, Default)]
struct State {
    subscribers: Vec<Subscriber>,
    backlog: VecDeque<Pending>,
    subscribe_failures: VecDeque<ConnectorError>,
    offsets: HashMap<String, i64>,
    log: Vec<RawMessage>,
    subscriptions: usize,
    producers_closed: usize,
}

#[derive(Debug)]
struct Subscriber {
    topics: Vec<String>,
    tx: mpsc::UnboundedSender<Item>,
}

impl Subscriber {
    fn wants(&self, pending: &Pending) -> bool {
        pending
            .topic
            .as_ref()
            .is_none_or(|topic| self.topics.contains(topic))
    }
}

/// A message or error waiting for a subscription.
#[derive(Debug)]
struct Pending {
    /// `None` for injected errors, which go to any subscriber
    topic: Option<String>,
    item: Item,
}

impl State {
    fn prune(&mut self) {
        self.subscribers.retain(|s| !s.tx.is_closed());
    }

    /// Deliver to every live matching subscriber, or park in the backlog.
    fn deliver(&mut self, pending: Pending) {
        self.prune();
        let mut delivered = false;
        for subscriber in self.subscribers.iter().filter(|s| s.wants(&pending)) {
            delivered |= subscriber.tx.send(pending.item.clone()).is_ok();
        }
        if !delivered {
            self.backlog.push_back(pending);
        }
    }

    fn next_offset(&mut self, topic: &str) -> i64 {
        let offset = self.offsets.entry(topic.to_string()).or_insert(0);
        let current = *offset;
        *offset += 1;
        current
    }
}

impl InMemoryConnector {
    /// Create an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.inner.state.lock().unwrap()
    }

    /// Publish `{"event": event, "payload": payload}` to `topic`.
    ///
    /// Returns the message offset.
    pub fn publish(&self, topic: &str, event: &str, payload: Value) -> i64 {
        self.publish_raw(topic, encode(event, &payload).unwrap())
    }

    /// Publish an arbitrary body to `topic`. Returns the message offset.
    pub fn publish_raw(&self, topic: &str, body: impl Into<Vec<u8>>) -> i64 {
        self.publish_message(topic, Some(body.into()))
    }

    /// Publish a message with no body to `topic`. Returns the message offset.
    pub fn publish_empty(&self, topic: &str) -> i64 {
        self.publish_message(topic, None)
    }

    fn publish_message(&self, topic: &str, payload: Option<Vec<u8>>) -> i64 {
        let mut state = self.state();
        let offset = state.next_offset(topic);
        let mut message = RawMessage::new(topic, Vec::new()).at(0, offset);
        message.payload = payload;

        state.log.push(message.clone());
        state.deliver(Pending {
            topic: Some(topic.to_string()),
            item: Ok(message),
        });
        offset
    }

    /// Make the next poll of a subscription fail with `error`.
    pub fn inject_error(&self, error: ConnectorError) {
        self.state().deliver(Pending {
            topic: None,
            item: Err(error),
        });
    }

    /// Make the next `subscribe` call fail with `error`.
    pub fn fail_next_subscribe(&self, error: ConnectorError) {
        self.state().subscribe_failures.push_back(error);
    }

    /// End every open stream, as if the broker dropped the sessions.
    pub fn end_streams(&self) {
        self.state().subscribers.clear();
    }

    /// Every message published to `topic`, in order.
    #[must_use]
    pub fn published(&self, topic: &str) -> Vec<RawMessage> {
        self.state()
            .log
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    /// Total successful `subscribe` calls.
    #[must_use]
    pub fn subscriptions(&self) -> usize {
        self.state().subscriptions
    }

    /// Subscriptions whose stream is still held by a consumer.
    #[must_use]
    pub fn active_subscriptions(&self) -> usize {
        let mut state = self.state();
        state.prune();
        state.subscribers.len()
    }

    /// Producers that have been closed.
    #[must_use]
    pub fn producers_closed(&self) -> usize {
        self.state().producers_closed
    }

    /// Resolve once at least `n` successful subscriptions have been made.
    pub async fn wait_for_subscriptions(&self, n: usize) {
        loop {
            let changed = self.inner.changed.notified();
            if self.subscriptions() >= n {
                return;
            }
            changed.await;
        }
    }
}

impl Connector for InMemoryConnector {
    fn subscribe(&self, topics: &[String]) -> ConnectorFuture<'_, MessageStream> {
        let topics = topics.to_vec();
        Box::pin(async move {
            let (tx, mut rx) = mpsc::unbounded_channel();
            {
                let mut state = self.state();
                if let Some(error) = state.subscribe_failures.pop_front() {
                    return Err(error);
                }

                let subscriber = Subscriber { topics, tx };
                let mut kept = VecDeque::new();
                while let Some(pending) = state.backlog.pop_front() {
                    if subscriber.wants(&pending) {
                        let _ = subscriber.tx.send(pending.item);
                    } else {
                        kept.push_back(pending);
                    }
                }
                state.backlog = kept;
                state.subscribers.push(subscriber);
                state.subscriptions += 1;
            }
            self.inner.changed.notify_waiters();

            let stream: MessageStream = Box::pin(async_stream::stream! {
                while let Some(item) = rx.recv().await {
                    yield item;
                }
            });
            Ok(stream)
        })
    }

    fn producer(&self) -> Result<Box<dyn Producer>, ConnectorError> {
        Ok(Box::new(InMemoryProducer {
            broker: self.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

/// [`Producer`] that publishes into an [`InMemoryConnector`].
#[derive(Debug)]
pub struct InMemoryProducer {
    broker: InMemoryConnector,
    closed: AtomicBool,
}

impl Producer for InMemoryProducer {
    fn send<'a>(&'a self, topic: &'a str, envelope: &'a Envelope) -> ConnectorFuture<'a, ()> {
        Box::pin(async move {
            if self.closed.load(Ordering::SeqCst) {
                return Err(ConnectorError::Closed);
            }
            let body = envelope.to_bytes().map_err(|e| ConnectorError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;
            self.broker.publish_raw(topic, body);
            Ok(())
        })
    }

    fn close(&self) -> ConnectorFuture<'_, ()> {
        Box::pin(async move {
            if !self.closed.swap(true, Ordering::SeqCst) {
                self.broker.state().producers_closed += 1;
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use event_router_core::envelope::decode;
    use futures::StreamExt;
    use serde_json::json;

    fn topics(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| (*s).to_string()).collect()
    }

    #[tokio::test]
    async fn backlog_is_delivered_on_subscribe() {
        let broker = InMemoryConnector::new();
        broker.publish("a", "e1", json!(1));
        broker.publish("b", "e2", json!(2));
        broker.publish("a", "e3", json!(3));

        let mut stream = broker.subscribe(&topics(&["a"])).await.unwrap();

        let first = stream.next().await.unwrap().unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(first.offset, Some(0));
        assert_eq!(second.offset, Some(1));
        assert_eq!(decode(second.payload.as_deref().unwrap(), "a").unwrap().event, "e3");

        // "b" is still waiting for a subscriber.
        let mut other = broker.subscribe(&topics(&["b"])).await.unwrap();
        assert_eq!(other.next().await.unwrap().unwrap().topic, "b");
    }

    #[tokio::test]
    async fn injected_error_reaches_subscriber() {
        let broker = InMemoryConnector::new();
        let mut stream = broker.subscribe(&topics(&["a"])).await.unwrap();

        broker.inject_error(ConnectorError::Receive {
            reason: "broker gone".into(),
            transient: true,
        });

        assert!(matches!(stream.next().await, Some(Err(ConnectorError::Receive { .. }))));
    }

    #[tokio::test]
    async fn end_streams_terminates_consumers() {
        let broker = InMemoryConnector::new();
        let mut stream = broker.subscribe(&topics(&["a"])).await.unwrap();
        assert_eq!(broker.active_subscriptions(), 1);

        broker.end_streams();

        assert!(stream.next().await.is_none());
        assert_eq!(broker.active_subscriptions(), 0);
        assert_eq!(broker.subscriptions(), 1);
    }

    #[tokio::test]
    async fn dropping_stream_releases_subscription() {
        let broker = InMemoryConnector::new();
        let stream = broker.subscribe(&topics(&["a"])).await.unwrap();
        drop(stream);

        assert_eq!(broker.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn subscribe_failure_is_consumed_once() {
        let broker = InMemoryConnector::new();
        broker.fail_next_subscribe(ConnectorError::Connection {
            reason: "refused".into(),
            transient: true,
        });

        assert!(broker.subscribe(&topics(&["a"])).await.is_err());
        assert!(broker.subscribe(&topics(&["a"])).await.is_ok());
        assert_eq!(broker.subscriptions(), 1);
    }

    #[tokio::test]
    async fn producer_publishes_until_closed() {
        let broker = InMemoryConnector::new();
        let producer = broker.producer().unwrap();

        producer.send_event("a", "e", json!({ "x": 1 })).await.unwrap();
        producer.close().await.unwrap();
        producer.close().await.unwrap();
        let after_close = producer.send_event("a", "e", json!(null)).await;

        assert_eq!(broker.published("a").len(), 1);
        assert_eq!(broker.producers_closed(), 1);
        assert_eq!(after_close, Err(ConnectorError::Closed));
    }
}
