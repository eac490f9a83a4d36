//! Envelope type and the JSON codec used on the wire.
//!
//! Every transport message is a JSON object carrying at least an `event`
//! string. The `payload` is an arbitrary JSON value that the router never
//! inspects; it is handed to whichever handler is bound to the event.
//!
//! ```text
//! {"event": "process_person", "payload": {"first_name": "John", "age": 35}}
//! ```
//!
//! # Example
//!
//! ```
//! use event_router_core::envelope::{decode, encode};
//! use serde_json::json;
//!
//! let bytes = encode("process_person", &json!({ "age": 35 })).unwrap();
//! let envelope = decode(&bytes, "test_topic").unwrap();
//!
//! assert_eq!(envelope.event, "process_person");
//! assert_eq!(envelope.payload, json!({ "age": 35 }));
//! ```

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

/// Maximum number of characters of a message body kept in error previews.
pub const PREVIEW_LIMIT: usize = 64;

/// Error returned when a raw message cannot be decoded into an [`Envelope`].
///
/// Carries the topic and a truncated preview of the body, never the body itself.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Failed to decode message on topic '{topic}': {reason} (body: {preview:?})")]
pub struct DecodeError {
    /// Topic the message was consumed from
    pub topic: String,
    /// Body preview, at most [`PREVIEW_LIMIT`] characters
    pub preview: String,
    /// Why decoding failed
    pub reason: String,
}

impl DecodeError {
    /// Create a decode error for `raw`, truncating the body into a preview.
    #[must_use]
    pub fn new(topic: impl Into<String>, raw: &[u8], reason: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            preview: preview(raw),
            reason: reason.into(),
        }
    }
}

/// Error returned when an envelope cannot be serialized.
#[derive(Error, Debug)]
#[error("Failed to encode event '{event}': {source}")]
pub struct EncodeError {
    /// Event name being encoded
    pub event: String,
    /// Underlying serializer error
    #[source]
    pub source: serde_json::Error,
}

/// A decoded message: event name plus opaque payload.
///
/// Top-level fields other than `event` and `payload` are kept in `extra`
/// so that producers can attach routing hints without breaking consumers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Event name used for handler lookup
    pub event: String,

    /// Opaque payload, `null` when the producer omitted it
    #[serde(default)]
    pub payload: Value,

    /// Any additional top-level fields
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Envelope {
    /// Create an envelope with no extra fields.
    #[must_use]
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        Self {
            event: event.into(),
            payload,
            extra: Map::new(),
        }
    }

    /// Create an envelope from any serializable payload.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError`] if the payload cannot be represented as JSON
    /// (for example a map with non-string keys).
    pub fn from_payload<T: Serialize>(
        event: impl Into<String>,
        payload: &T,
    ) -> Result<Self, EncodeError> {
        let event = event.into();
        match serde_json::to_value(payload) {
            Ok(payload) => Ok(Self::new(event, payload)),
            Err(source) => Err(EncodeError { event, source }),
        }
    }

    /// Deserialize the payload into a typed value.
    ///
    /// # Errors
    ///
    /// Returns the serde error when the payload does not match `T`.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }

    /// Serialize this envelope to its wire representation.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError`] if serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EncodeError> {
        serde_json::to_vec(self).map_err(|source| EncodeError {
            event: self.event.clone(),
            source,
        })
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Envelope {{ event: {}, payload: {} }}",
            self.event,
            preview_value(&self.payload)
        )
    }
}

/// Decode a raw message body consumed from `topic`.
///
/// # Errors
///
/// Returns [`DecodeError`] when the body is not JSON, is not a JSON object,
/// or has no string `event` field.
pub fn decode(raw: &[u8], topic: &str) -> Result<Envelope, DecodeError> {
    let value: Value = serde_json::from_slice(raw)
        .map_err(|e| DecodeError::new(topic, raw, format!("invalid JSON: {e}")))?;

    let Value::Object(mut fields) = value else {
        return Err(DecodeError::new(topic, raw, "message is not a JSON object"));
    };

    let event = match fields.remove("event") {
        Some(Value::String(event)) => event,
        Some(_) => return Err(DecodeError::new(topic, raw, "`event` field is not a string")),
        None => return Err(DecodeError::new(topic, raw, "missing `event` field")),
    };

    let payload = fields.remove("payload").unwrap_or(Value::Null);

    Ok(Envelope {
        event,
        payload,
        extra: fields,
    })
}

/// Encode an event name and payload into a wire message.
///
/// # Errors
///
/// Returns [`EncodeError`] if serialization fails.
pub fn encode(event: &str, payload: &Value) -> Result<Vec<u8>, EncodeError> {
    Envelope::new(event, payload.clone()).to_bytes()
}

/// Render a raw body as a bounded, lossy UTF-8 preview.
#[must_use]
pub fn preview(raw: &[u8]) -> String {
    truncate(&String::from_utf8_lossy(raw))
}

/// Render a JSON value as a bounded preview.
#[must_use]
pub fn preview_value(value: &Value) -> String {
    truncate(&value.to_string())
}

fn truncate(text: &str) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(PREVIEW_LIMIT).collect();
    if chars.next().is_some() {
        format!("{head}…")
    } else {
        head
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn decode_reads_event_and_payload() {
        let raw = br#"{"event":"process_person","payload":{"first_name":"John","age":35}}"#;

        let envelope = decode(raw, "test_topic").unwrap();

        assert_eq!(envelope.event, "process_person");
        assert_eq!(envelope.payload, json!({ "first_name": "John", "age": 35 }));
        assert!(envelope.extra.is_empty());
    }

    #[test]
    fn decode_defaults_missing_payload_to_null() {
        let envelope = decode(br#"{"event":"ping"}"#, "t").unwrap();
        assert_eq!(envelope.payload, Value::Null);
    }

    #[test]
    fn decode_keeps_unknown_fields() {
        let raw = br#"{"event":"ping","payload":1,"trace_id":"abc"}"#;
        let envelope = decode(raw, "t").unwrap();
        assert_eq!(envelope.extra.get("trace_id"), Some(&json!("abc")));
    }

    #[test]
    fn decode_rejects_invalid_json() {
        let err = decode(b"not json at all", "test_topic").unwrap_err();
        assert_eq!(err.topic, "test_topic");
        assert_eq!(err.preview, "not json at all");
        assert!(err.reason.starts_with("invalid JSON"));
    }

    #[test]
    fn decode_rejects_non_object() {
        let err = decode(b"[1,2,3]", "t").unwrap_err();
        assert_eq!(err.reason, "message is not a JSON object");
    }

    #[test]
    fn decode_rejects_missing_event() {
        let err = decode(br#"{"payload":{}}"#, "t").unwrap_err();
        assert_eq!(err.reason, "missing `event` field");
    }

    #[test]
    fn decode_rejects_non_string_event() {
        let err = decode(br#"{"event":42}"#, "t").unwrap_err();
        assert_eq!(err.reason, "`event` field is not a string");
    }

    #[test]
    fn decode_error_preview_is_truncated() {
        let raw = vec![b'x'; 10 * PREVIEW_LIMIT];
        let err = decode(&raw, "t").unwrap_err();

        assert_eq!(err.preview.chars().count(), PREVIEW_LIMIT + 1);
        assert!(err.preview.ends_with('…'));
        assert!(err.to_string().len() < raw.len());
    }

    #[test]
    fn payload_as_deserializes_typed_struct() {
        #[derive(Deserialize, Debug, PartialEq)]
        struct Company {
            name: String,
            stock_value: f64,
        }

        let envelope = Envelope::new(
            "process_company",
            json!({ "name": "SomeCompany", "stock_value": 1224.55 }),
        );
        let company: Company = envelope.payload_as().unwrap();

        assert_eq!(company.name, "SomeCompany");
        assert!((company.stock_value - 1224.55).abs() < f64::EPSILON);
    }

    #[test]
    fn envelope_display_is_bounded() {
        let envelope = Envelope::new("big", json!("y".repeat(1000)));
        let display = envelope.to_string();
        assert!(display.contains("big"));
        assert!(display.len() < 200);
    }

    fn json_value() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(|n| json!(n)),
            ".{0,12}".prop_map(Value::String),
        ];
        leaf.prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                prop::collection::btree_map("[a-z_]{1,8}", inner, 0..4)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
    }

    proptest! {
        #[test]
        fn encode_then_decode_preserves_payload(
            event in "[a-z_]{1,20}",
            payload in json_value(),
        ) {
            let bytes = encode(&event, &payload).unwrap();
            let envelope = decode(&bytes, "roundtrip").unwrap();
            prop_assert_eq!(envelope.event, event);
            prop_assert_eq!(envelope.payload, payload);
        }
    }
}
