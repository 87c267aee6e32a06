//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Event decode and drop rates at the kernel boundary
//! - Outbound replication delivery
//! - Inbound apply activity
//! - Agent lifecycle state
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `mapsync_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//!
//! # Usage
//!
//! ```rust,no_run
//! use mapsync::metrics;
//!
//! // In the sender loop after decoding a record
//! metrics::record_event_decoded("hash_map");
//!
//! // When an event cannot be replicated
//! metrics::record_event_dropped("origin_unknown");
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record one decoded kernel mutation record.
pub fn record_event_decoded(map_name: &str) {
    counter!("mapsync_events_decoded_total", "map" => map_name.to_string()).increment(1);
}

/// Record an event dropped before any outbound call.
///
/// Reasons: `origin_unknown`, `not_replicable`, `key_width`, `value_width`.
pub fn record_event_dropped(reason: &str) {
    counter!("mapsync_events_dropped_total", "reason" => reason.to_string()).increment(1);
}

/// Record a successfully delivered replication call.
pub fn record_replication_sent(peer_addr: &str) {
    counter!("mapsync_replications_sent_total", "peer" => peer_addr.to_string()).increment(1);
}

/// Record a failed replication call (connect error, IO error, timeout,
/// or non-OK ack). The mutation is lost for the peer.
pub fn record_replication_failure(peer_addr: &str, reason: &str) {
    counter!(
        "mapsync_replication_failures_total",
        "peer" => peer_addr.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Record the latency of one outbound replication call.
pub fn record_replication_latency(peer_addr: &str, latency: Duration) {
    histogram!("mapsync_replication_duration_seconds", "peer" => peer_addr.to_string())
        .record(latency.as_secs_f64());
}

/// Record an inbound mutation applied to the local kernel map.
pub fn record_apply(kind: &str) {
    counter!("mapsync_applies_total", "kind" => kind.to_string()).increment(1);
}

/// Record a gateway apply failure (acked OK on the wire regardless).
pub fn record_apply_failure(kind: &str) {
    counter!("mapsync_apply_failures_total", "kind" => kind.to_string()).increment(1);
}

/// Record an inbound request with an unrecognized kind (no-op + ack).
pub fn record_apply_skipped() {
    counter!("mapsync_applies_skipped_total").increment(1);
}

/// Record an accepted inbound connection.
pub fn record_connection_accepted() {
    counter!("mapsync_connections_accepted_total").increment(1);
}

/// Record a wire protocol violation (connection closed).
pub fn record_wire_violation() {
    counter!("mapsync_wire_violations_total").increment(1);
}

/// Gauge for agent lifecycle state.
pub fn set_agent_state(state: &str) {
    // Encode state as numeric for alerting (0=created, 2=running, etc.)
    let value = match state {
        "Created" => 0.0,
        "Starting" => 1.0,
        "Running" => 2.0,
        "ShuttingDown" => 3.0,
        "Stopped" => 4.0,
        "Failed" => 5.0,
        _ => -1.0,
    };
    gauge!("mapsync_agent_state").set(value);
}
