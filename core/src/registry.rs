//! Handler registry keyed by `(event, topic)`.
//!
//! The registry is filled during setup and sealed when the run loop starts.
//! Once sealed it is immutable, so lookups during consumption need no lock.
//!
//! # Example
//!
//! ```
//! use event_router_core::handler::Handler;
//! use event_router_core::registry::{HandlerRegistry, RegistryError};
//!
//! let mut registry = HandlerRegistry::new();
//! registry.register("process_person", "test_topic", Handler::blocking(|_| Ok(()))).unwrap();
//!
//! assert!(registry.lookup("process_person", "test_topic").is_some());
//! assert!(registry.lookup("process_person", "other").is_none());
//!
//! let again = registry.register("process_person", "test_topic", Handler::blocking(|_| Ok(())));
//! assert!(matches!(again, Err(RegistryError::DuplicateRegistration { .. })));
//! ```

use crate::handler::{Handler, HandlerStyle};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use thiserror::Error;

/// Errors raised while registering handlers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// A handler is already bound to this key
    #[error("A handler is already registered for {key}")]
    DuplicateRegistration {
        /// The conflicting key
        key: EventKey,
    },

    /// Registration attempted after the run loop started
    #[error("Registry is sealed; cannot register {key} after the router has started")]
    Sealed {
        /// The key that was rejected
        key: EventKey,
    },
}

/// Registration slot: an event name on a topic. Matching is exact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventKey {
    /// Event name
    pub event: String,
    /// Topic name
    pub topic: String,
}

impl EventKey {
    /// Create a key.
    #[must_use]
    pub fn new(event: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            topic: topic.into(),
        }
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.event, self.topic)
    }
}

/// A handler bound to a key. Immutable once registered.
#[derive(Debug, Clone)]
pub struct HandlerDescriptor {
    key: EventKey,
    handler: Handler,
}

impl HandlerDescriptor {
    /// The key this handler is bound to.
    #[must_use]
    pub const fn key(&self) -> &EventKey {
        &self.key
    }

    /// The callable.
    #[must_use]
    pub const fn handler(&self) -> &Handler {
        &self.handler
    }

    /// Execution style of the callable.
    #[must_use]
    pub const fn style(&self) -> HandlerStyle {
        self.handler.style()
    }
}

/// Mapping from [`EventKey`] to a single [`HandlerDescriptor`].
#[derive(Debug, Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<EventKey, HandlerDescriptor>,
    sealed: bool,
}

impl HandlerRegistry {
    /// Create an empty, open registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `handler` to `(event, topic)`.
    ///
    /// # Errors
    ///
    /// - [`RegistryError::DuplicateRegistration`] if the key is already bound
    /// - [`RegistryError::Sealed`] if the registry has been sealed
    pub fn register(
        &mut self,
        event: impl Into<String>,
        topic: impl Into<String>,
        handler: Handler,
    ) -> Result<(), RegistryError> {
        let key = EventKey::new(event, topic);
        self.ensure_open(&key)?;

        if self.handlers.contains_key(&key) {
            return Err(RegistryError::DuplicateRegistration { key });
        }

        tracing::debug!(key = %key, style = %handler.style(), "Handler registered");
        self.handlers
            .insert(key.clone(), HandlerDescriptor { key, handler });
        Ok(())
    }

    /// Bind `handler` to `(event, topic)`, replacing any existing binding.
    ///
    /// Returns the replaced descriptor, if there was one.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Sealed`] if the registry has been sealed.
    pub fn register_override(
        &mut self,
        event: impl Into<String>,
        topic: impl Into<String>,
        handler: Handler,
    ) -> Result<Option<HandlerDescriptor>, RegistryError> {
        let key = EventKey::new(event, topic);
        self.ensure_open(&key)?;

        let previous = self
            .handlers
            .insert(key.clone(), HandlerDescriptor { key: key.clone(), handler });
        if previous.is_some() {
            tracing::warn!(key = %key, "Handler registration overridden");
        }
        Ok(previous)
    }

    /// Find the handler bound to exactly `(event, topic)`.
    #[must_use]
    pub fn lookup(&self, event: &str, topic: &str) -> Option<&HandlerDescriptor> {
        // Borrowed lookup would need a custom Borrow impl for a pair; keys are short.
        self.handlers.get(&EventKey::new(event, topic))
    }

    /// Close the registry for writes.
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    /// Whether [`seal`](Self::seal) has been called.
    #[must_use]
    pub const fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no handler is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// All registered keys, in sorted order.
    #[must_use]
    pub fn keys(&self) -> Vec<&EventKey> {
        let mut keys: Vec<_> = self.handlers.keys().collect();
        keys.sort();
        keys
    }

    /// Distinct topics that have at least one handler.
    #[must_use]
    pub fn topics(&self) -> BTreeSet<&str> {
        self.handlers.keys().map(|k| k.topic.as_str()).collect()
    }

    fn ensure_open(&self, key: &EventKey) -> Result<(), RegistryError> {
        if self.sealed {
            return Err(RegistryError::Sealed { key: key.clone() });
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn noop() -> Handler {
        Handler::blocking(|_| Ok(()))
    }

    #[test]
    fn lookup_requires_exact_match() {
        let mut registry = HandlerRegistry::new();
        registry.register("process_person", "test_topic", noop()).unwrap();

        assert!(registry.lookup("process_person", "test_topic").is_some());
        assert!(registry.lookup("Process_Person", "test_topic").is_none());
        assert!(registry.lookup("process_person", "TEST_TOPIC").is_none());
        assert!(registry.lookup("process_person", "").is_none());
    }

    #[test]
    fn same_event_on_different_topics_are_distinct() {
        let mut registry = HandlerRegistry::new();
        registry.register("e", "a", noop()).unwrap();
        registry
            .register("e", "b", Handler::suspending(|_| async { Ok(()) }))
            .unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.lookup("e", "a").unwrap().style(), HandlerStyle::Blocking);
        assert_eq!(registry.lookup("e", "b").unwrap().style(), HandlerStyle::Suspending);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = HandlerRegistry::new();
        registry.register("e", "t", noop()).unwrap();

        let err = registry.register("e", "t", noop()).unwrap_err();
        assert_eq!(
            err,
            RegistryError::DuplicateRegistration {
                key: EventKey::new("e", "t")
            }
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn override_replaces_existing_handler() {
        let mut registry = HandlerRegistry::new();
        registry.register("e", "t", noop()).unwrap();

        let previous = registry
            .register_override("e", "t", Handler::suspending(|_| async { Ok(()) }))
            .unwrap();

        assert_eq!(previous.unwrap().style(), HandlerStyle::Blocking);
        assert_eq!(registry.lookup("e", "t").unwrap().style(), HandlerStyle::Suspending);
    }

    #[test]
    fn override_on_empty_slot_returns_none() {
        let mut registry = HandlerRegistry::new();
        assert!(registry.register_override("e", "t", noop()).unwrap().is_none());
    }

    #[test]
    fn sealed_registry_rejects_writes() {
        let mut registry = HandlerRegistry::new();
        registry.register("e", "t", noop()).unwrap();
        registry.seal();

        assert!(registry.is_sealed());
        assert!(matches!(
            registry.register("x", "t", noop()),
            Err(RegistryError::Sealed { .. })
        ));
        assert!(matches!(
            registry.register_override("e", "t", noop()),
            Err(RegistryError::Sealed { .. })
        ));
        assert!(registry.lookup("e", "t").is_some());
    }

    #[test]
    fn keys_and_topics_are_reported() {
        let mut registry = HandlerRegistry::new();
        registry.register("b", "other", noop()).unwrap();
        registry.register("a", "test_topic", noop()).unwrap();
        registry.register("c", "other", noop()).unwrap();

        let keys: Vec<String> = registry.keys().iter().map(ToString::to_string).collect();
        assert_eq!(keys, vec!["a@test_topic", "b@other", "c@other"]);
        assert_eq!(
            registry.topics().into_iter().collect::<Vec<_>>(),
            vec!["other", "test_topic"]
        );
    }

    #[test]
    fn event_key_display() {
        assert_eq!(
            EventKey::new("process_person", "test_topic").to_string(),
            "process_person@test_topic"
        );
    }
}
