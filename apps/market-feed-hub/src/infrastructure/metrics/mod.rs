//! Prometheus Metrics Module
//!
//! Exposes hub metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Fetches**: Upstream fetch outcomes per feed and backoff delays
//! - **Delivery**: Updates delivered to and dropped for client queues
//! - **Pollers**: Poller starts and stops
//! - **Connections**: Live connections, closes, subscriptions
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port. The
//! [`TelemetryEventSink`] feeds them from hub events.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::application::ports::{FetchError, HubEventSink, StopReason};
use crate::application::services::hub::HubStats;
use crate::domain::feed::FeedKey;
use crate::domain::subscription::ConnectionId;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// # Panics
///
/// Panics if the recorder cannot be installed.
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let builder = PrometheusBuilder::new();
            let handle = builder
                .install_recorder()
                .expect("failed to install Prometheus recorder");

            register_metrics();
            handle
        })
        .clone()
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
    // Fetch counters
    describe_counter!(
        "feed_hub_fetches_total",
        "Upstream fetches by feed and outcome"
    );
    describe_histogram!(
        "feed_hub_fetch_backoff_seconds",
        "Delay scheduled after a failed fetch"
    );

    // Delivery counters
    describe_counter!(
        "feed_hub_updates_delivered_total",
        "Updates queued to client connections"
    );
    describe_counter!(
        "feed_hub_updates_dropped_total",
        "Undelivered updates lost to slow consumers"
    );

    // Poller lifecycle
    describe_counter!("feed_hub_pollers_started_total", "Pollers spawned");
    describe_counter!("feed_hub_pollers_stopped_total", "Pollers exited by reason");
    describe_gauge!("feed_hub_active_pollers", "Live upstream pollers");

    // Connection gauges
    describe_gauge!("feed_hub_connections", "Live client connections");
    describe_gauge!(
        "feed_hub_subscriptions",
        "Total (connection, feed key) memberships"
    );
    describe_counter!("feed_hub_connections_closed_total", "Connections removed");
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Metric label for a fetch outcome.
#[derive(Debug, Clone, Copy)]
pub enum FetchOutcome {
    /// Fetch returned a snapshot.
    Ok,
    /// Fetch returned an error.
    Error,
}

impl FetchOutcome {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Error => "error",
        }
    }
}

/// Record an upstream fetch.
pub fn record_fetch(key: &FeedKey, outcome: FetchOutcome) {
    counter!(
        "feed_hub_fetches_total",
        "feed" => key.feed_type.as_str(),
        "outcome" => outcome.as_str()
    )
    .increment(1);
}

/// Record the delay scheduled after a failed fetch.
pub fn record_backoff(key: &FeedKey, delay: Duration) {
    histogram!(
        "feed_hub_fetch_backoff_seconds",
        "feed" => key.feed_type.as_str()
    )
    .record(delay.as_secs_f64());
}

/// Record updates queued to connections.
pub fn record_delivered(key: &FeedKey, count: u64) {
    counter!(
        "feed_hub_updates_delivered_total",
        "feed" => key.feed_type.as_str()
    )
    .increment(count);
}

/// Record an update lost to backpressure.
pub fn record_dropped(key: &FeedKey) {
    counter!(
        "feed_hub_updates_dropped_total",
        "feed" => key.feed_type.as_str()
    )
    .increment(1);
}

/// Record a poller start.
pub fn record_poller_started(key: &FeedKey) {
    counter!(
        "feed_hub_pollers_started_total",
        "feed" => key.feed_type.as_str()
    )
    .increment(1);
}

/// Record a poller exit.
pub fn record_poller_stopped(key: &FeedKey, reason: StopReason) {
    counter!(
        "feed_hub_pollers_stopped_total",
        "feed" => key.feed_type.as_str(),
        "reason" => reason.as_str()
    )
    .increment(1);
}

/// Record a connection removal.
pub fn record_connection_closed() {
    counter!("feed_hub_connections_closed_total").increment(1);
}

/// Publish hub counters as gauges.
#[allow(clippy::cast_precision_loss)]
pub fn record_hub_stats(stats: HubStats) {
    gauge!("feed_hub_connections").set(stats.connections as f64);
    gauge!("feed_hub_subscriptions").set(stats.subscriptions as f64);
    gauge!("feed_hub_active_pollers").set(stats.pollers as f64);
}

// =============================================================================
// Event Sink
// =============================================================================

/// Production [`HubEventSink`]: structured logs plus Prometheus metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct TelemetryEventSink;

impl HubEventSink for TelemetryEventSink {
    fn poller_started(&self, key: &FeedKey) {
        tracing::debug!(key = %key, "Poller spawned");
        record_poller_started(key);
    }

    fn poller_stopped(&self, key: &FeedKey, reason: StopReason) {
        tracing::debug!(key = %key, reason = reason.as_str(), "Poller exited");
        record_poller_stopped(key, reason);
    }

    fn fetch_succeeded(&self, key: &FeedKey, delivered: usize) {
        tracing::trace!(key = %key, delivered, "Fetch succeeded");
        record_fetch(key, FetchOutcome::Ok);
        record_delivered(key, u64::try_from(delivered).unwrap_or(u64::MAX));
    }

    fn fetch_failed(
        &self,
        key: &FeedKey,
        error: &FetchError,
        consecutive_failures: u32,
        next_delay: Duration,
    ) {
        if consecutive_failures >= 3 {
            tracing::warn!(
                key = %key,
                error = %error,
                consecutive_failures,
                next_delay_secs = next_delay.as_secs(),
                "Upstream fetch keeps failing"
            );
        } else {
            tracing::info!(
                key = %key,
                error = %error,
                consecutive_failures,
                next_delay_secs = next_delay.as_secs(),
                "Upstream fetch failed"
            );
        }
        record_fetch(key, FetchOutcome::Error);
        record_backoff(key, next_delay);
    }

    fn messages_dropped(&self, connection: ConnectionId, key: &FeedKey, total_dropped: u64) {
        tracing::debug!(connection = %connection, key = %key, total_dropped, "Slow consumer dropped update");
        record_dropped(key);
    }

    fn connection_closed(&self, connection: ConnectionId) {
        tracing::debug!(connection = %connection, "Connection closed");
        record_connection_closed();
    }
}

// =============================================================================
// Tests
// =============================================================================
