//! Handler callables and the context they receive.
//!
//! A handler is either [`Handler::Blocking`], run inline on the consume
//! loop, or [`Handler::Suspending`], spawned as its own task. The variant is
//! the execution style: the dispatcher branches on it instead of inspecting
//! the callable.
//!
//! # Example
//!
//! ```
//! use event_router_core::handler::{Handler, HandlerStyle};
//!
//! let blocking = Handler::blocking(|ctx| {
//!     println!("{} on {}", ctx.event, ctx.topic);
//!     Ok(())
//! });
//!
//! let suspending = Handler::suspending(|ctx| async move {
//!     println!("{}", ctx.payload);
//!     Ok(())
//! });
//!
//! assert_eq!(blocking.style(), HandlerStyle::Blocking);
//! assert_eq!(suspending.style(), HandlerStyle::Suspending);
//! ```

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Result returned by every handler. Errors are logged, never propagated.
pub type HandlerResult = anyhow::Result<()>;

/// Callable for a blocking handler.
pub type BlockingFn = Arc<dyn Fn(HandlerContext) -> HandlerResult + Send + Sync>;

/// Callable for a suspending handler.
pub type SuspendingFn =
    Arc<dyn Fn(HandlerContext) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// How a handler is executed by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerStyle {
    /// Runs inline on the consume loop; consumption waits for it
    Blocking,
    /// Runs as an independent task; consumption continues immediately
    Suspending,
}

impl fmt::Display for HandlerStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Blocking => f.write_str("blocking"),
            Self::Suspending => f.write_str("suspending"),
        }
    }
}

/// A registered callable, tagged with its execution style.
#[derive(Clone)]
pub enum Handler {
    /// Synchronous handler
    Blocking(BlockingFn),
    /// Asynchronous handler
    Suspending(SuspendingFn),
}

impl Handler {
    /// Wrap a synchronous closure.
    #[must_use]
    pub fn blocking<F>(f: F) -> Self
    where
        F: Fn(HandlerContext) -> HandlerResult + Send + Sync + 'static,
    {
        Self::Blocking(Arc::new(f))
    }

    /// Wrap an async closure.
    #[must_use]
    pub fn suspending<F, Fut>(f: F) -> Self
    where
        F: Fn(HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        Self::Suspending(Arc::new(move |ctx| Box::pin(f(ctx))))
    }

    /// The execution style of this handler.
    #[must_use]
    pub const fn style(&self) -> HandlerStyle {
        match self {
            Self::Blocking(_) => HandlerStyle::Blocking,
            Self::Suspending(_) => HandlerStyle::Suspending,
        }
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Blocking(_) => write!(f, "Handler::Blocking(<fn>)"),
            Self::Suspending(_) => write!(f, "Handler::Suspending(<fn>)"),
        }
    }
}

/// Everything a handler receives for one message.
///
/// `metadata` carries routing details such as `partition`, `offset`, `key`
/// and `timestamp` when the transport provides them, plus any extra
/// top-level envelope fields. New entries may appear at any time; handlers
/// should look up what they need and ignore the rest.
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerContext {
    /// Event name the handler was matched on
    pub event: String,
    /// Topic the message was consumed from
    pub topic: String,
    /// Decoded payload
    pub payload: Value,
    /// Routing metadata
    pub metadata: Map<String, Value>,
}

impl HandlerContext {
    /// Create a context with empty metadata.
    #[must_use]
    pub fn new(event: impl Into<String>, topic: impl Into<String>, payload: Value) -> Self {
        Self {
            event: event.into(),
            topic: topic.into(),
            payload,
            metadata: Map::new(),
        }
    }

    /// Add a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Look up a metadata entry.
    #[must_use]
    pub fn metadata(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    /// Partition the message came from, if known.
    #[must_use]
    pub fn partition(&self) -> Option<i64> {
        self.metadata.get("partition").and_then(Value::as_i64)
    }

    /// Offset of the message within its partition, if known.
    #[must_use]
    pub fn offset(&self) -> Option<i64> {
        self.metadata.get("offset").and_then(Value::as_i64)
    }

    /// Deserialize the payload into a typed value.
    ///
    /// # Errors
    ///
    /// Returns the serde error when the payload does not match `T`.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn style_follows_variant() {
        assert_eq!(Handler::blocking(|_| Ok(())).style(), HandlerStyle::Blocking);
        assert_eq!(
            Handler::suspending(|_| async { Ok(()) }).style(),
            HandlerStyle::Suspending
        );
    }

    #[test]
    fn blocking_handler_is_callable() {
        let handler = Handler::blocking(|ctx| {
            anyhow::ensure!(ctx.event == "ping", "unexpected event {}", ctx.event);
            Ok(())
        });

        let Handler::Blocking(f) = handler else {
            unreachable!("constructed as blocking");
        };
        assert!(f(HandlerContext::new("ping", "t", Value::Null)).is_ok());
        assert!(f(HandlerContext::new("pong", "t", Value::Null)).is_err());
    }

    #[tokio::test]
    async fn suspending_handler_is_awaitable() {
        let handler = Handler::suspending(|ctx| async move {
            anyhow::ensure!(ctx.payload == json!(1), "bad payload");
            Ok(())
        });

        let Handler::Suspending(f) = handler else {
            unreachable!("constructed as suspending");
        };
        assert!(f(HandlerContext::new("e", "t", json!(1))).await.is_ok());
    }

    #[test]
    fn context_exposes_routing_metadata() {
        let ctx = HandlerContext::new("e", "t", Value::Null)
            .with_metadata("partition", json!(3))
            .with_metadata("offset", json!(42))
            .with_metadata("unknown_future_field", json!("ignored"));

        assert_eq!(ctx.partition(), Some(3));
        assert_eq!(ctx.offset(), Some(42));
        assert_eq!(ctx.metadata("missing"), None);
    }

    #[test]
    fn payload_as_reads_typed_payload() {
        #[derive(serde::Deserialize)]
        struct Person {
            last_name: String,
            age: u32,
        }

        let ctx = HandlerContext::new(
            "process_person",
            "test_topic",
            json!({ "first_name": "John", "last_name": "Doe", "age": 35 }),
        );
        let person: Person = ctx.payload_as().unwrap();
        assert_eq!(person.last_name, "Doe");
        assert_eq!(person.age, 35);
    }
}
