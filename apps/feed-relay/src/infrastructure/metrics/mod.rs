//! Prometheus Metrics Module
//!
//! Exposes relay metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Frames**: frames and bytes received, decode errors, out-of-order discards
//! - **Connections**: supervisor state per feed, reconnects
//! - **Delivery**: consumer deliveries, failures, drops and evictions
//! - **Alerts**: alerts raised by kind
//! - **Latency**: frame processing time from socket to fan-out
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::domain::alert::AlertKind;
use crate::domain::feed::{ConnectionState, FeedType};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder. Later calls return the
/// existing handle.
///
/// # Errors
///
/// Returns an error if the recorder cannot be installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "feed_relay_frames_received_total",
        "Total frames received from upstream feeds"
    );
    describe_counter!(
        "feed_relay_bytes_received_total",
        "Total bytes received from upstream feeds"
    );
    describe_counter!(
        "feed_relay_decode_errors_total",
        "Frames rejected by the decoder, by error kind"
    );
    describe_counter!(
        "feed_relay_out_of_order_total",
        "Records discarded by the cache's monotonic guard"
    );

    describe_gauge!(
        "feed_relay_connection_state",
        "Supervisor state per feed (0=disconnected .. 6=failed)"
    );
    describe_counter!(
        "feed_relay_reconnects_total",
        "Reconnect attempts scheduled by the health monitor"
    );

    describe_counter!(
        "feed_relay_deliveries_total",
        "Records delivered to consumer callbacks"
    );
    describe_counter!(
        "feed_relay_consumer_failures_total",
        "Consumer callbacks that failed, panicked or timed out"
    );
    describe_counter!(
        "feed_relay_deliveries_dropped_total",
        "Records dropped because a consumer queue was full"
    );
    describe_counter!(
        "feed_relay_consumer_evictions_total",
        "Subscriptions removed after repeated callback failures"
    );
    describe_gauge!(
        "feed_relay_active_topics",
        "Topics with at least one subscriber"
    );

    describe_counter!("feed_relay_alerts_total", "Alerts raised by kind");

    describe_histogram!(
        "feed_relay_frame_processing_seconds",
        "Time to decode, cache and fan out one frame"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Record one frame received from a feed.
pub fn record_frame_received(feed: FeedType, bytes: usize) {
    counter!("feed_relay_frames_received_total", "feed" => feed.as_str()).increment(1);
    counter!("feed_relay_bytes_received_total", "feed" => feed.as_str())
        .increment(u64::try_from(bytes).unwrap_or(u64::MAX));
}

/// Record a frame rejected by the decoder.
pub fn record_decode_error(feed: FeedType, kind: &'static str) {
    counter!(
        "feed_relay_decode_errors_total",
        "feed" => feed.as_str(),
        "kind" => kind
    )
    .increment(1);
}

/// Record a record discarded as out of order.
pub fn record_out_of_order(feed: FeedType) {
    counter!("feed_relay_out_of_order_total", "feed" => feed.as_str()).increment(1);
}

/// Update the connection state gauge for a feed.
pub fn set_connection_state(feed: FeedType, state: ConnectionState) {
    gauge!("feed_relay_connection_state", "feed" => feed.as_str())
        .set(f64::from(state.as_u8()));
}

/// Record a scheduled reconnect.
pub fn record_reconnect(feed: FeedType) {
    counter!("feed_relay_reconnects_total", "feed" => feed.as_str()).increment(1);
}

/// Record a successful delivery.
pub fn record_delivery(feed: FeedType) {
    counter!("feed_relay_deliveries_total", "feed" => feed.as_str()).increment(1);
}

/// Record a failed delivery.
pub fn record_consumer_failure(feed: FeedType, reason: &'static str) {
    counter!(
        "feed_relay_consumer_failures_total",
        "feed" => feed.as_str(),
        "reason" => reason
    )
    .increment(1);
}

/// Record a delivery dropped on a full queue.
pub fn record_delivery_dropped(feed: FeedType) {
    counter!("feed_relay_deliveries_dropped_total", "feed" => feed.as_str()).increment(1);
}

/// Record a consumer eviction.
pub fn record_consumer_evicted(feed: FeedType) {
    counter!("feed_relay_consumer_evictions_total", "feed" => feed.as_str()).increment(1);
}

/// Update the active topic gauge for a feed.
#[allow(clippy::cast_precision_loss)]
pub fn set_active_topics(feed: FeedType, count: usize) {
    gauge!("feed_relay_active_topics", "feed" => feed.as_str()).set(count as f64);
}

/// Record a raised alert.
pub fn record_alert(kind: AlertKind) {
    counter!("feed_relay_alerts_total", "kind" => kind.as_str()).increment(1);
}

/// Record frame processing duration.
pub fn record_processing_duration(feed: FeedType, duration: Duration) {
    histogram!(
        "feed_relay_frame_processing_seconds",
        "feed" => feed.as_str()
    )
    .record(duration.as_secs_f64());
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_recorder_is_noop() {
        record_frame_received(FeedType::MarketData, 128);
        record_decode_error(FeedType::Portfolio, "malformed");
        set_connection_state(FeedType::MarketData, ConnectionState::Connected);
        record_alert(AlertKind::ConsumerEvicted);
        record_processing_duration(FeedType::MarketData, Duration::from_micros(40));
    }

    #[test]
    fn init_is_idempotent() {
        let first = init_metrics().unwrap();
        record_reconnect(FeedType::MarketData);
        let second = init_metrics().unwrap();
        assert!(second.render().contains("feed_relay_reconnects_total"));
        drop(first);
    }
}
