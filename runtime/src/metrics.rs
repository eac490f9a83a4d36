//! Metric names and descriptions for the router.
//!
//! The router records through the `metrics` facade; installing a recorder or
//! exporter is up to the application. Call [`describe`] once after installing
//! one so that descriptions show up next to the series.

use metrics::{describe_counter, describe_gauge, describe_histogram};

/// Raw messages pulled from the connector
pub const MESSAGES_RECEIVED: &str = "router_messages_received_total";
/// Messages skipped because they could not be decoded
pub const MESSAGES_DECODE_FAILED: &str = "router_messages_decode_failed_total";
/// Messages skipped because no handler matched
pub const MESSAGES_UNHANDLED: &str = "router_messages_unhandled_total";
/// Handler invocations that returned `Ok`
pub const HANDLERS_COMPLETED: &str = "router_handlers_completed_total";
/// Handler invocations that returned `Err` or panicked
pub const HANDLERS_FAILED: &str = "router_handlers_failed_total";
/// Suspending handler tasks spawned
pub const HANDLERS_SPAWNED: &str = "router_handlers_spawned_total";
/// Suspending handler tasks currently running
pub const HANDLERS_IN_FLIGHT: &str = "router_handlers_in_flight";
/// Time spent in blocking handlers
pub const HANDLER_DURATION: &str = "router_handler_duration_seconds";
/// Suspending tasks still running when the grace period ended
pub const SHUTDOWN_ABANDONED: &str = "router_shutdown_abandoned_total";
/// Transport errors that were retried
pub const TRANSPORT_RETRIES: &str = "router_transport_retries_total";

/// Register all metric descriptions.
pub fn describe() {
    // Consumption
    describe_counter!(MESSAGES_RECEIVED, "Total number of raw messages pulled from the connector");
    describe_counter!(
        MESSAGES_DECODE_FAILED,
        "Total number of messages skipped because they could not be decoded"
    );
    describe_counter!(
        MESSAGES_UNHANDLED,
        "Total number of messages with no handler for their event and topic"
    );

    // Handlers
    describe_counter!(HANDLERS_COMPLETED, "Total number of handler invocations that succeeded");
    describe_counter!(
        HANDLERS_FAILED,
        "Total number of handler invocations that returned an error or panicked"
    );
    describe_counter!(HANDLERS_SPAWNED, "Total number of suspending handler tasks spawned");
    describe_gauge!(HANDLERS_IN_FLIGHT, "Number of suspending handler tasks currently running");
    describe_histogram!(HANDLER_DURATION, "Time taken by blocking handlers");

    // Lifecycle
    describe_counter!(
        SHUTDOWN_ABANDONED,
        "Total number of suspending handler tasks abandoned at shutdown"
    );
    describe_counter!(TRANSPORT_RETRIES, "Total number of transport errors that were retried");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describe_without_recorder_is_a_noop() {
        describe();
        describe();
    }

    #[test]
    fn names_follow_prometheus_conventions() {
        for name in [
            MESSAGES_RECEIVED,
            MESSAGES_DECODE_FAILED,
            MESSAGES_UNHANDLED,
            HANDLERS_COMPLETED,
            HANDLERS_FAILED,
            HANDLERS_SPAWNED,
            SHUTDOWN_ABANDONED,
            TRANSPORT_RETRIES,
        ] {
            assert!(name.starts_with("router_"), "{name}");
            assert!(name.ends_with("_total"), "{name}");
        }
    }
}
