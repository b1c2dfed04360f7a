//! Fan-out Router
//!
//! Delivers a published snapshot to every connection currently subscribed to
//! its feed key.
//!
//! # Architecture
//!
//! ```text
//! Poller ──publish(key)──► subscribers_of(key) ──► outbound queue (conn A)
//!                                              ├─► outbound queue (conn B)
//!                                              └─► closed queue ──► reaper
//! ```
//!
//! Enqueueing never blocks. A slow consumer loses older updates; a closed
//! queue sends the connection id to the hub for asynchronous disconnect.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::application::ports::HubEventSink;
use crate::domain::feed::FeedKey;
use crate::domain::snapshot::{FeedUpdate, Snapshot};
use crate::domain::subscription::{ConnectionId, ConnectionRegistry, PushOutcome};

/// Outcome of delivering one update to one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Queued without loss.
    Queued,
    /// Queued at the cost of an older undelivered update.
    Lossy,
    /// The connection's transport is gone; cleanup was requested.
    Closed,
    /// No such connection.
    Unknown,
}

/// Per-publish counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Connections that got the update queued.
    pub delivered: usize,
    /// Of those, how many lost an older update to make room.
    pub lossy: usize,
    /// Connections found closed.
    pub closed: usize,
}

impl PublishReport {
    fn record(&mut self, delivery: Delivery) {
        match delivery {
            Delivery::Queued => self.delivered += 1,
            Delivery::Lossy => {
                self.delivered += 1;
                self.lossy += 1;
            }
            Delivery::Closed => self.closed += 1,
            Delivery::Unknown => {}
        }
    }
}

/// Router from feed keys to connection outbound queues.
pub struct FanoutRouter {
    registry: Arc<ConnectionRegistry>,
    events: Arc<dyn HubEventSink>,
    dead_tx: mpsc::UnboundedSender<ConnectionId>,
}

impl FanoutRouter {
    /// Create a router. Closed connections are reported on `dead_tx`.
    #[must_use]
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        events: Arc<dyn HubEventSink>,
        dead_tx: mpsc::UnboundedSender<ConnectionId>,
    ) -> Self {
        Self {
            registry,
            events,
            dead_tx,
        }
    }

    /// Deliver `snapshot` to every current subscriber of `key`.
    pub fn publish(&self, key: &FeedKey, snapshot: Arc<Snapshot>) -> PublishReport {
        let update = FeedUpdate::now(key.clone(), snapshot);
        let mut report = PublishReport::default();

        for id in self.registry.subscribers_of(key) {
            report.record(self.deliver(id, update.clone()));
        }

        report
    }

    /// Deliver one update to one connection.
    pub fn deliver(&self, id: ConnectionId, update: FeedUpdate) -> Delivery {
        let Some(outbound) = self.registry.outbound(id) else {
            return Delivery::Unknown;
        };

        let key = update.key.clone();
        match outbound.push(update) {
            Ok(PushOutcome::Queued) => Delivery::Queued,
            Ok(_) => {
                self.events.messages_dropped(id, &key, outbound.dropped());
                Delivery::Lossy
            }
            Err(_) => {
                // Receiver gone; the hub tears the connection down.
                let _ = self.dead_tx.send(id);
                Delivery::Closed
            }
        }
    }
}

impl std::fmt::Debug for FanoutRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanoutRouter")
            .field("connections", &self.registry.connection_count())
            .finish_non_exhaustive()
    }
}
