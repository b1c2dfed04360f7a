//! Outbound Delivery Queue
//!
//! Bounded, lossy, single-consumer queue between the fan-out router and one
//! connection's transport task.
//!
//! Pushing never blocks:
//! - a newer update for a conflatable feed key replaces the undelivered one
//!   for the same key, keeping its queue position
//! - otherwise, when full, the oldest entry is dropped
//!
//! Either case bumps the queue's dropped counter. Dropping the receiver
//! closes the queue; later pushes report [`QueueClosed`].

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::domain::snapshot::FeedUpdate;

/// The receiving side is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("outbound queue closed")]
pub struct QueueClosed;

/// What happened to a pushed update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Appended without loss.
    Queued,
    /// Replaced an undelivered update for the same key.
    Superseded,
    /// Appended after evicting the oldest entry.
    DroppedOldest,
}

impl PushOutcome {
    /// Whether the push cost an older update.
    #[must_use]
    pub const fn is_lossy(self) -> bool {
        !matches!(self, Self::Queued)
    }
}

#[derive(Debug)]
struct QueueState {
    items: VecDeque<FeedUpdate>,
    closed: bool,
    dropped: u64,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
}

/// Create a queue holding at most `capacity` updates (minimum 1).
#[must_use]
pub fn channel(capacity: usize) -> (OutboundSender, OutboundReceiver) {
    let shared = Arc::new(Shared {
        state: Mutex::new(QueueState {
            items: VecDeque::with_capacity(capacity.max(1)),
            closed: false,
            dropped: 0,
        }),
        notify: Notify::new(),
        capacity: capacity.max(1),
    });
    (
        OutboundSender {
            shared: Arc::clone(&shared),
        },
        OutboundReceiver { shared },
    )
}

// =============================================================================
// Sender
// =============================================================================

/// Producer handle, cloned freely by the router.
#[derive(Debug, Clone)]
pub struct OutboundSender {
    shared: Arc<Shared>,
}

impl OutboundSender {
    /// Enqueue without blocking.
    ///
    /// # Errors
    ///
    /// Returns [`QueueClosed`] once either side has closed the queue.
    pub fn push(&self, update: FeedUpdate) -> Result<PushOutcome, QueueClosed> {
        let outcome = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Err(QueueClosed);
            }

            let pending = if update.key.strategy().conflate {
                state.items.iter().position(|queued| queued.key == update.key)
            } else {
                None
            };

            if let Some(index) = pending {
                state.items[index] = update;
                state.dropped += 1;
                PushOutcome::Superseded
            } else if state.items.len() >= self.shared.capacity {
                state.items.pop_front();
                state.items.push_back(update);
                state.dropped += 1;
                PushOutcome::DroppedOldest
            } else {
                state.items.push_back(update);
                PushOutcome::Queued
            }
        };

        self.shared.notify.notify_one();
        Ok(outcome)
    }

    /// Close the queue. The receiver drains what is left, then sees `None`.
    pub fn close(&self) {
        self.shared.state.lock().closed = true;
        self.shared.notify.notify_one();
    }

    /// Whether the queue is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Total updates lost to supersede or eviction.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.shared.state.lock().dropped
    }

    /// Updates waiting for the consumer.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.state.lock().items.len()
    }

    /// Whether nothing is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// Receiver
// =============================================================================

/// Consumer handle owned by the transport task.
#[derive(Debug)]
pub struct OutboundReceiver {
    shared: Arc<Shared>,
}

impl OutboundReceiver {
    /// Wait for the next update. `None` once closed and drained.
    pub async fn recv(&mut self) -> Option<FeedUpdate> {
        loop {
            let notified = self.shared.notify.notified();
            {
                let mut state = self.shared.state.lock();
                if let Some(update) = state.items.pop_front() {
                    return Some(update);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Take the next update if one is ready.
    pub fn try_recv(&mut self) -> Option<FeedUpdate> {
        self.shared.state.lock().items.pop_front()
    }

    /// Drain everything currently queued.
    pub fn drain(&mut self) -> Vec<FeedUpdate> {
        self.shared.state.lock().items.drain(..).collect()
    }
}

impl Drop for OutboundReceiver {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        state.closed = true;
        state.items.clear();
    }
}
