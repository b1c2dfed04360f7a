//! Port Interfaces
//!
//! Contracts between the hub core and its collaborators, following the
//! Hexagonal Architecture pattern.
//!
//! ## Driven Ports (Outbound)
//!
//! - [`SnapshotFetcher`]: fetch the current snapshot for a feed key
//! - [`HubEventSink`]: fire-and-forget observability events
//!
//! ## Driver Ports (Inbound)
//!
//! The hub's public operations on
//! [`SubscriptionHub`](crate::application::services::hub::SubscriptionHub).

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::feed::FeedKey;
use crate::domain::snapshot::Snapshot;
use crate::domain::subscription::ConnectionId;

// =============================================================================
// Snapshot Fetcher
// =============================================================================

/// Error from an upstream fetch. The core treats every variant the same.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// Transport-level failure.
    #[error("network error: {0}")]
    Network(String),

    /// Upstream answered with a non-success status.
    #[error("upstream error (status {status}): {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Response body or reason.
        message: String,
    },

    /// Response body could not be decoded.
    #[error("parse error: {0}")]
    Parse(String),

    /// Upstream has no data for the instrument.
    #[error("no data for {0}")]
    NotFound(String),

    /// Upstream requires configuration that is missing (e.g. an API key).
    #[error("not configured: {0}")]
    NotConfigured(String),

    /// Feed type has no upstream source.
    #[error("feed {0} is not fetchable")]
    Unsupported(String),

    /// Upstream did not answer in time.
    #[error("timed out")]
    Timeout,
}

/// Capability to fetch the current snapshot for a feed key.
///
/// Implementations own their timeouts and any provider-specific handling.
#[async_trait]
pub trait SnapshotFetcher: Send + Sync {
    /// Fetch the current snapshot.
    async fn fetch(&self, key: &FeedKey) -> Result<Snapshot, FetchError>;

    /// Forget per-key state such as an incremental cursor. Called each time
    /// a poller starts for `key`, before its first fetch.
    fn reset(&self, _key: &FeedKey) {}
}

// =============================================================================
// Event Sink
// =============================================================================

/// Why a poller stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The hub cancelled it.
    Cancelled,
    /// It saw zero subscribers before sleeping.
    NoSubscribers,
}

impl StopReason {
    /// Label for logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::NoSubscribers => "no_subscribers",
        }
    }
}

/// Structured observability events emitted by the core.
///
/// Calls are synchronous and must not block.
#[cfg_attr(test, mockall::automock)]
pub trait HubEventSink: Send + Sync {
    /// A poller task was spawned for `key`.
    fn poller_started(&self, key: &FeedKey);

    /// A poller task exited.
    fn poller_stopped(&self, key: &FeedKey, reason: StopReason);

    /// A fetch succeeded.
    fn fetch_succeeded(&self, key: &FeedKey, delivered: usize);

    /// A fetch failed; the next attempt waits `next_delay`.
    fn fetch_failed(
        &self,
        key: &FeedKey,
        error: &FetchError,
        consecutive_failures: u32,
        next_delay: Duration,
    );

    /// An undelivered update was lost for a slow connection.
    fn messages_dropped(&self, connection: ConnectionId, key: &FeedKey, total_dropped: u64);

    /// A connection was removed from the registry.
    fn connection_closed(&self, connection: ConnectionId);
}

/// Sink that ignores every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventSink;

impl HubEventSink for NoopEventSink {
    fn poller_started(&self, _key: &FeedKey) {}
    fn poller_stopped(&self, _key: &FeedKey, _reason: StopReason) {}
    fn fetch_succeeded(&self, _key: &FeedKey, _delivered: usize) {}
    fn fetch_failed(&self, _: &FeedKey, _: &FetchError, _: u32, _: Duration) {}
    fn messages_dropped(&self, _: ConnectionId, _: &FeedKey, _: u64) {}
    fn connection_closed(&self, _connection: ConnectionId) {}
}
