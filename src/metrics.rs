//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Blocks emitted per feed
//! - Tracked feed count and iterator state
//! - Selection latency
//! - Stalls, benign closed-queue races, feed errors, selector violations
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `feed_merge_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration)
//!
//! Without an installed recorder every call is a no-op.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record a block handed to the consumer.
pub fn record_block_emitted(feed_key: &str) {
    counter!("feed_merge_blocks_emitted_total", "feed_key" => feed_key.to_string()).increment(1);
}

/// Record time spent in one selection attempt (candidate scan + selector).
pub fn record_selection_latency(duration: Duration) {
    histogram!("feed_merge_selection_duration_seconds").record(duration.as_secs_f64());
}

/// Record a stall notification.
pub fn record_stall(candidates: usize) {
    counter!("feed_merge_stalls_total").increment(1);
    gauge!("feed_merge_stalled_candidates").set(candidates as f64);
}

/// Record a pop that lost the race with a queue close.
pub fn record_closed_race(feed_key: &str) {
    counter!("feed_merge_closed_races_total", "feed_key" => feed_key.to_string()).increment(1);
}

/// Record a non-benign feed read error surfaced to the consumer.
pub fn record_feed_error(feed_key: &str) {
    counter!("feed_merge_feed_errors_total", "feed_key" => feed_key.to_string()).increment(1);
}

/// Record a selector that returned an out-of-range index.
pub fn record_selector_violation() {
    counter!("feed_merge_selector_violations_total").increment(1);
}

/// Set the number of tracked feeds.
pub fn set_tracked_feeds(count: usize) {
    gauge!("feed_merge_tracked_feeds").set(count as f64);
}

/// Gauge for iterator state.
pub fn set_iterator_state(state: &str) {
    // Encoded numerically for alerting (0=created, 1=running, 2=stopped)
    let value = match state {
        "Created" => 0.0,
        "Running" => 1.0,
        "Stopped" => 2.0,
        _ => -1.0,
    };
    gauge!("feed_merge_iterator_state").set(value);
}
