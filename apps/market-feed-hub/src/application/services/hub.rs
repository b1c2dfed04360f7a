//! Subscription Hub
//!
//! Public facade over the registry, router and poller table. Transports call
//! connect / subscribe / unsubscribe / disconnect; collaborators inject
//! alerts and portfolio updates; pollers come and go with subscriber
//! interest.
//!
//! Every subscriber-count transition reported by the registry is followed by
//! a reconcile of that key in the poller table, which is where the actual
//! start/stop decision is made.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::fanout::{Delivery, FanoutRouter};
use super::poller::backoff::BackoffConfig;
use super::poller::{PollerContext, PollerStatus, PollerTable, Reconcile, UpdatePoller};
use crate::application::ports::{HubEventSink, SnapshotFetcher};
use crate::domain::feed::{Cadence, FeedKey, FeedType, InstrumentKey, Polling, ValidationError};
use crate::domain::snapshot::{FeedUpdate, PriceSnapshot, Snapshot};
use crate::domain::subscription::{ConnectionId, ConnectionRegistry, OutboundReceiver};

// =============================================================================
// Settings
// =============================================================================

/// Poll interval per upstream cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollIntervals {
    /// Price feed interval.
    pub price: Duration,
    /// Indicator feed interval.
    pub indicators: Duration,
    /// News feed interval.
    pub news: Duration,
}

impl Default for PollIntervals {
    fn default() -> Self {
        Self {
            price: Duration::from_secs(30),
            indicators: Duration::from_secs(120),
            news: Duration::from_secs(300),
        }
    }
}

impl PollIntervals {
    /// Interval for a cadence.
    #[must_use]
    pub const fn for_cadence(&self, cadence: Cadence) -> Duration {
        match cadence {
            Cadence::Price => self.price,
            Cadence::Indicators => self.indicators,
            Cadence::News => self.news,
        }
    }
}

/// Hub tuning.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HubSettings {
    /// Poll intervals.
    pub intervals: PollIntervals,
    /// Fetch failure backoff.
    pub backoff: BackoffConfig,
    /// Per-connection outbound queue capacity.
    pub outbound_capacity: usize,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            intervals: PollIntervals::default(),
            backoff: BackoffConfig::default(),
            outbound_capacity: 64,
        }
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Hub operation error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HubError {
    /// Request rejected before any state changed.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// No poller or no snapshot yet for the key.
    #[error("no snapshot available for {0}")]
    SnapshotNotFound(FeedKey),
}

// =============================================================================
// Hub
// =============================================================================

/// A registered connection as handed to the transport.
#[derive(Debug)]
pub struct ClientConnection {
    /// Handle for later hub calls.
    pub id: ConnectionId,
    /// Queue the transport drains onto the wire.
    pub outbound: OutboundReceiver,
}

/// Hub counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HubStats {
    /// Live connections.
    pub connections: usize,
    /// Feed keys with subscribers.
    pub feed_keys: usize,
    /// Total memberships.
    pub subscriptions: usize,
    /// Live pollers.
    pub pollers: usize,
}

/// Shared hub handle.
pub type SharedSubscriptionHub = Arc<SubscriptionHub>;

/// The subscription hub.
pub struct SubscriptionHub {
    registry: Arc<ConnectionRegistry>,
    router: Arc<FanoutRouter>,
    pollers: Arc<PollerTable>,
    poller_ctx: PollerContext,
    intervals: PollIntervals,
    events: Arc<dyn HubEventSink>,
    shutdown: CancellationToken,
}

impl SubscriptionHub {
    /// Build the hub and spawn its dead-connection reaper.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn start(
        settings: HubSettings,
        fetcher: Arc<dyn SnapshotFetcher>,
        events: Arc<dyn HubEventSink>,
    ) -> Arc<Self> {
        let registry = Arc::new(ConnectionRegistry::new(settings.outbound_capacity));
        let (dead_tx, dead_rx) = mpsc::unbounded_channel();
        let router = Arc::new(FanoutRouter::new(
            Arc::clone(&registry),
            Arc::clone(&events),
            dead_tx,
        ));
        let pollers = Arc::new(PollerTable::new(Arc::clone(&registry)));
        let poller_ctx = PollerContext {
            fetcher,
            router: Arc::clone(&router),
            table: Arc::clone(&pollers),
            events: Arc::clone(&events),
            backoff: settings.backoff,
        };

        let hub = Arc::new(Self {
            registry,
            router,
            pollers,
            poller_ctx,
            intervals: settings.intervals,
            events,
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(Self::reap(
            Arc::downgrade(&hub),
            dead_rx,
            hub.shutdown.clone(),
        ));

        hub
    }

    // =========================================================================
    // Connections
    // =========================================================================

    /// Register a new connection.
    pub fn connect(&self, user_id: Option<String>) -> ClientConnection {
        let (id, outbound) = self.registry.register(user_id);
        tracing::info!(connection = %id, "Client connected");
        ClientConnection { id, outbound }
    }

    /// Remove a connection and stop pollers it was the last subscriber of.
    /// Idempotent.
    pub fn disconnect(&self, id: ConnectionId) {
        let Some(emptied) = self.registry.try_deregister(id) else {
            return;
        };

        for key in &emptied {
            self.reconcile(key);
        }

        self.events.connection_closed(id);
        tracing::info!(connection = %id, released = emptied.len(), "Client disconnected");
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Subscribe a connection to a feed.
    ///
    /// Returns the keys now held for this request.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Validation`] for malformed or missing instruments;
    /// nothing is subscribed in that case.
    pub fn subscribe<S: AsRef<str>>(
        &self,
        id: ConnectionId,
        feed_type: FeedType,
        instruments: &[S],
    ) -> Result<Vec<FeedKey>, HubError> {
        let keys = FeedKey::expand(feed_type, instruments)?;

        for key in &keys {
            if self.registry.add_subscription(id, key) {
                self.reconcile(key);
            }
        }

        tracing::debug!(connection = %id, feed = %feed_type, keys = keys.len(), "Subscribed");
        Ok(keys)
    }

    /// Unsubscribe a connection from some or all keys of a feed.
    ///
    /// `None` or an empty list removes every key of the feed type. Returns
    /// the keys actually removed.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Validation`] for malformed instruments.
    pub fn unsubscribe<S: AsRef<str>>(
        &self,
        id: ConnectionId,
        feed_type: FeedType,
        instruments: Option<&[S]>,
    ) -> Result<Vec<FeedKey>, HubError> {
        let removed = match instruments {
            Some(list) if !list.is_empty() => {
                let keys = FeedKey::expand(feed_type, list)?;
                keys.into_iter()
                    .filter_map(|key| {
                        let was_last = self.registry.remove_subscription(id, &key)?;
                        if was_last {
                            self.reconcile(&key);
                        }
                        Some(key)
                    })
                    .collect()
            }
            _ => self
                .registry
                .remove_feed(id, feed_type)
                .into_iter()
                .map(|(key, was_last)| {
                    if was_last {
                        self.reconcile(&key);
                    }
                    key
                })
                .collect::<Vec<_>>(),
        };

        tracing::debug!(connection = %id, feed = %feed_type, keys = removed.len(), "Unsubscribed");
        Ok(removed)
    }

    /// Start or stop the poller of `key` to match its subscriber count.
    ///
    /// Push-only feeds never get a poller; after [`shutdown`](Self::shutdown)
    /// none is started.
    pub fn reconcile(&self, key: &FeedKey) -> Reconcile {
        let Polling::Upstream(cadence) = key.feed_type.strategy().polling else {
            return Reconcile::Unchanged;
        };
        let interval = self.intervals.for_cadence(cadence);

        let outcome = self.pollers.reconcile(key, |generation| {
            UpdatePoller::spawn(key.clone(), generation, interval, self.poller_ctx.clone())
        });

        match outcome {
            Reconcile::Started => tracing::info!(key = %key, "Poller started"),
            Reconcile::Stopped => tracing::info!(key = %key, "Poller stopped"),
            Reconcile::Unchanged => {}
        }
        outcome
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Latest snapshot for a feed key.
    ///
    /// `instrument` is ignored for global feeds.
    ///
    /// # Errors
    ///
    /// [`HubError::Validation`] for a malformed instrument,
    /// [`HubError::SnapshotNotFound`] when no poller has produced a value.
    pub fn current_snapshot(
        &self,
        feed_type: FeedType,
        instrument: &str,
    ) -> Result<Arc<Snapshot>, HubError> {
        let key = if feed_type.is_instrument_scoped() {
            FeedKey::new(feed_type, InstrumentKey::parse(instrument)?)
        } else {
            FeedKey::global(feed_type)
        };

        self.pollers
            .last_snapshot(&key)
            .ok_or(HubError::SnapshotNotFound(key))
    }

    /// Latest prices for the instruments that have one.
    ///
    /// # Errors
    ///
    /// [`HubError::Validation`] if any instrument is malformed.
    pub fn current_prices<S: AsRef<str>>(
        &self,
        instruments: &[S],
    ) -> Result<BTreeMap<InstrumentKey, PriceSnapshot>, HubError> {
        let mut prices = BTreeMap::new();
        for raw in instruments {
            let instrument = InstrumentKey::parse(raw.as_ref())?;
            let key = FeedKey::new(FeedType::PriceUpdates, instrument.clone());
            if let Some(snapshot) = self.pollers.last_snapshot(&key)
                && let Snapshot::Price(price) = snapshot.as_ref()
            {
                prices.insert(instrument, price.clone());
            }
        }
        Ok(prices)
    }

    // =========================================================================
    // Direct injection
    // =========================================================================

    /// Deliver an alert to the user's connections subscribed to alerts.
    ///
    /// Returns the number of connections it was queued for.
    pub fn publish_alert(&self, user_id: &str, payload: serde_json::Value) -> usize {
        self.publish_to_user(FeedType::Alerts, user_id, Snapshot::Alert(payload))
    }

    /// Deliver a portfolio update to the user's connections subscribed to
    /// portfolio updates.
    pub fn publish_portfolio_update(&self, user_id: &str, payload: serde_json::Value) -> usize {
        self.publish_to_user(
            FeedType::PortfolioUpdates,
            user_id,
            Snapshot::Portfolio(payload),
        )
    }

    fn publish_to_user(&self, feed_type: FeedType, user_id: &str, snapshot: Snapshot) -> usize {
        let key = FeedKey::global(feed_type);
        let update = FeedUpdate::now(key.clone(), Arc::new(snapshot));

        let delivered = self
            .registry
            .subscribers_of(&key)
            .into_iter()
            .filter(|id| self.registry.user_id(*id).as_deref() == Some(user_id))
            .filter(|id| {
                matches!(
                    self.router.deliver(*id, update.clone()),
                    Delivery::Queued | Delivery::Lossy
                )
            })
            .count();

        tracing::debug!(user_id, feed = %feed_type, delivered, "Injected update");
        delivered
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Keys with a live poller, sorted.
    #[must_use]
    pub fn active_pollers(&self) -> Vec<FeedKey> {
        self.pollers.keys()
    }

    /// Status of the poller for `key`.
    #[must_use]
    pub fn poller_status(&self, key: &FeedKey) -> Option<PollerStatus> {
        self.pollers.status(key)
    }

    /// Current subscriber count of `key`.
    #[must_use]
    pub fn subscriber_count(&self, key: &FeedKey) -> usize {
        self.registry.subscriber_count(key)
    }

    /// Keys a connection holds, sorted.
    #[must_use]
    pub fn subscriptions_of(&self, id: ConnectionId) -> Vec<FeedKey> {
        self.registry.subscriptions_of(id)
    }

    /// Hub counters.
    #[must_use]
    pub fn stats(&self) -> HubStats {
        let registry = self.registry.stats();
        HubStats {
            connections: registry.connections,
            feed_keys: registry.feed_keys,
            subscriptions: registry.subscriptions,
            pollers: self.pollers.len(),
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Cancel every poller and the reaper.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        let cancelled = self.pollers.cancel_all();
        tracing::info!(pollers = cancelled, "Subscription hub shut down");
    }

    /// Whether [`shutdown`](Self::shutdown) was called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Disconnect connections whose transport went away.
    async fn reap(
        hub: Weak<Self>,
        mut dead_rx: mpsc::UnboundedReceiver<ConnectionId>,
        shutdown: CancellationToken,
    ) {
        loop {
            let id = tokio::select! {
                () = shutdown.cancelled() => break,
                id = dead_rx.recv() => match id {
                    Some(id) => id,
                    None => break,
                },
            };

            let Some(hub) = hub.upgrade() else {
                break;
            };
            tracing::debug!(connection = %id, "Reaping closed connection");
            hub.disconnect(id);
        }
    }
}

impl std::fmt::Debug for SubscriptionHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHub")
            .field("stats", &self.stats())
            .field("intervals", &self.intervals)
            .finish_non_exhaustive()
    }
}
