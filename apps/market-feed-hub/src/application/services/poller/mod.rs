//! Update Poller
//!
//! One task per active polled feed key. Each tick fetches a snapshot from
//! upstream, stores it as the key's latest value and publishes it through
//! the fan-out router.
//!
//! # State Machine
//!
//! ```text
//! Starting ──► Running ──► Stopping ──► Stopped
//!                 │  ▲
//!                 └──┘ fetch / publish / sleep
//! ```
//!
//! Running becomes Stopping when the hub cancels the poller, or when the
//! poller finds its key without subscribers right before sleeping. Fetch
//! failures never stop a poller; they widen the next delay.

pub mod backoff;
pub mod table;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use self::backoff::{BackoffConfig, BackoffPolicy};
pub use self::table::{PollerTable, Reconcile};
use crate::application::ports::{FetchError, HubEventSink, SnapshotFetcher, StopReason};
use crate::application::services::fanout::FanoutRouter;
use crate::domain::feed::FeedKey;
use crate::domain::snapshot::Snapshot;

// =============================================================================
// Status
// =============================================================================

/// Lifecycle phase of a poller task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerPhase {
    /// Spawned, not yet polled.
    Starting,
    /// In the fetch / publish / sleep loop.
    Running,
    /// Exit observed, cleaning up.
    Stopping,
    /// Task finished.
    Stopped,
}

impl PollerPhase {
    /// Label for logs and health output.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        }
    }
}

/// Point-in-time view of a poller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollerStatus {
    /// Key served.
    pub key: FeedKey,
    /// Lifecycle phase.
    pub phase: PollerPhase,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// Delay before the next fetch.
    pub current_delay: Duration,
    /// Successful fetches.
    pub fetches_ok: u64,
    /// Failed fetches.
    pub fetches_failed: u64,
    /// Time of the last successful fetch.
    pub last_success: Option<DateTime<Utc>>,
}

/// State shared between a poller task and its handle.
#[derive(Debug)]
struct PollerShared {
    phase: Mutex<PollerPhase>,
    last_snapshot: RwLock<Option<Arc<Snapshot>>>,
    last_success: Mutex<Option<DateTime<Utc>>>,
    consecutive_failures: AtomicU32,
    current_delay_ms: AtomicU64,
    fetches_ok: AtomicU64,
    fetches_failed: AtomicU64,
}

impl PollerShared {
    fn new(interval: Duration) -> Self {
        Self {
            phase: Mutex::new(PollerPhase::Starting),
            last_snapshot: RwLock::new(None),
            last_success: Mutex::new(None),
            consecutive_failures: AtomicU32::new(0),
            current_delay_ms: AtomicU64::new(duration_millis(interval)),
            fetches_ok: AtomicU64::new(0),
            fetches_failed: AtomicU64::new(0),
        }
    }

    fn set_phase(&self, phase: PollerPhase) {
        *self.phase.lock() = phase;
    }

    fn set_delay(&self, delay: Duration) {
        self.current_delay_ms
            .store(duration_millis(delay), Ordering::Relaxed);
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

// =============================================================================
// Handle
// =============================================================================

/// Hub-side handle to a running poller.
#[derive(Debug)]
pub struct PollerHandle {
    key: FeedKey,
    generation: u64,
    cancel: CancellationToken,
    shared: Arc<PollerShared>,
    task: JoinHandle<()>,
}

impl PollerHandle {
    /// Identity of this poller instance among all pollers ever spawned for
    /// its key.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Request the poller to stop. Idempotent and non-blocking.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the poller has been asked to stop or has exited.
    #[must_use]
    pub fn is_retired(&self) -> bool {
        self.cancel.is_cancelled() || self.task.is_finished()
    }

    /// Latest successfully fetched snapshot.
    #[must_use]
    pub fn last_snapshot(&self) -> Option<Arc<Snapshot>> {
        self.shared.last_snapshot.read().clone()
    }

    /// Point-in-time status.
    #[must_use]
    pub fn status(&self) -> PollerStatus {
        let shared = &self.shared;
        PollerStatus {
            key: self.key.clone(),
            phase: *shared.phase.lock(),
            consecutive_failures: shared.consecutive_failures.load(Ordering::Relaxed),
            current_delay: Duration::from_millis(shared.current_delay_ms.load(Ordering::Relaxed)),
            fetches_ok: shared.fetches_ok.load(Ordering::Relaxed),
            fetches_failed: shared.fetches_failed.load(Ordering::Relaxed),
            last_success: *shared.last_success.lock(),
        }
    }
}

// =============================================================================
// Poller
// =============================================================================

/// Collaborators every poller needs.
#[derive(Clone)]
pub struct PollerContext {
    /// Upstream data source.
    pub fetcher: Arc<dyn SnapshotFetcher>,
    /// Delivery to subscribers.
    pub router: Arc<FanoutRouter>,
    /// Authoritative poller table, used for the pre-sleep self-check.
    pub table: Arc<PollerTable>,
    /// Observability sink.
    pub events: Arc<dyn HubEventSink>,
    /// Failure backoff settings.
    pub backoff: BackoffConfig,
}

impl std::fmt::Debug for PollerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollerContext")
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

/// The poller task body for one feed key.
pub struct UpdatePoller {
    key: FeedKey,
    generation: u64,
    backoff: BackoffPolicy,
    ctx: PollerContext,
    shared: Arc<PollerShared>,
    cancel: CancellationToken,
}

impl UpdatePoller {
    /// Spawn a poller for `key` that fetches every `interval`.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn spawn(
        key: FeedKey,
        generation: u64,
        interval: Duration,
        ctx: PollerContext,
    ) -> PollerHandle {
        let shared = Arc::new(PollerShared::new(interval));
        let cancel = CancellationToken::new();

        ctx.fetcher.reset(&key);
        ctx.events.poller_started(&key);

        let poller = Self {
            key: key.clone(),
            generation,
            backoff: BackoffPolicy::new(interval, ctx.backoff),
            ctx,
            shared: Arc::clone(&shared),
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(poller.run());

        PollerHandle {
            key,
            generation,
            cancel,
            shared,
            task,
        }
    }

    async fn run(mut self) {
        self.shared.set_phase(PollerPhase::Running);
        tracing::debug!(key = %self.key, generation = self.generation, "Poller running");

        let reason = loop {
            let result = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break StopReason::Cancelled,
                result = self.ctx.fetcher.fetch(&self.key) => result,
            };

            let delay = match result {
                Ok(snapshot) => self.on_success(snapshot),
                Err(error) => self.on_failure(&error),
            };
            self.shared.set_delay(delay);

            if self.cancel.is_cancelled() {
                break StopReason::Cancelled;
            }
            if self.ctx.table.retire_if_idle(&self.key, self.generation) {
                break StopReason::NoSubscribers;
            }

            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break StopReason::Cancelled,
                () = tokio::time::sleep(delay) => {}
            }
        };

        self.shared.set_phase(PollerPhase::Stopping);
        tracing::debug!(key = %self.key, reason = reason.as_str(), "Poller stopping");
        self.ctx.events.poller_stopped(&self.key, reason);
        self.shared.set_phase(PollerPhase::Stopped);
    }

    fn on_success(&mut self, snapshot: Snapshot) -> Duration {
        let snapshot = Arc::new(snapshot);
        *self.shared.last_snapshot.write() = Some(Arc::clone(&snapshot));
        *self.shared.last_success.lock() = Some(Utc::now());
        self.shared.fetches_ok.fetch_add(1, Ordering::Relaxed);
        self.shared.consecutive_failures.store(0, Ordering::Relaxed);

        // A result that lands after cancellation is kept but not published.
        let delivered = if snapshot.is_empty() || self.cancel.is_cancelled() {
            0
        } else {
            self.ctx.router.publish(&self.key, snapshot).delivered
        };
        self.ctx.events.fetch_succeeded(&self.key, delivered);

        self.backoff.reset()
    }

    fn on_failure(&mut self, error: &FetchError) -> Duration {
        let delay = self.backoff.next_delay();
        let failures = self.backoff.failures();
        self.shared.fetches_failed.fetch_add(1, Ordering::Relaxed);
        self.shared
            .consecutive_failures
            .store(failures, Ordering::Relaxed);

        self.ctx.events.fetch_failed(&self.key, error, failures, delay);
        delay
    }
}
