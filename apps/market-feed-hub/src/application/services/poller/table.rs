//! Poller Table
//!
//! Map from feed key to its single poller. Every start/stop decision for a
//! key runs under that key's entry guard and re-reads the registry's
//! subscriber count inside the guard, so a racing last-unsubscribe and
//! first-subscribe always converge on one poller or none.
//!
//! Once [`PollerTable::cancel_all`] has run the table is closed: reconcile
//! never spawns again and stops whatever it finds.
//!
//! Lock order: table shard, then registry reverse-index shard.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::{PollerHandle, PollerStatus};
use crate::domain::feed::FeedKey;
use crate::domain::snapshot::Snapshot;
use crate::domain::subscription::ConnectionRegistry;

/// What a reconcile pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconcile {
    /// A poller was spawned (possibly replacing a retired one).
    Started,
    /// The poller was cancelled and removed.
    Stopped,
    /// Nothing to do.
    Unchanged,
}

/// Authoritative set of live pollers.
#[derive(Debug)]
pub struct PollerTable {
    pollers: DashMap<FeedKey, PollerHandle>,
    registry: Arc<ConnectionRegistry>,
    next_generation: AtomicU64,
    closed: AtomicBool,
}

impl PollerTable {
    /// Create an empty table reading subscriber counts from `registry`.
    #[must_use]
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            pollers: DashMap::new(),
            registry,
            next_generation: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    /// Bring `key` in line with its subscriber count.
    ///
    /// Subscribers and no live poller: `spawn` is called with a fresh
    /// generation and the handle stored. No subscribers, or a closed table:
    /// any poller is cancelled and removed.
    pub fn reconcile<F>(&self, key: &FeedKey, spawn: F) -> Reconcile
    where
        F: FnOnce(u64) -> PollerHandle,
    {
        match self.pollers.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                if self.is_closed() || self.registry.subscriber_count(key) == 0 {
                    occupied.remove().cancel();
                    Reconcile::Stopped
                } else if occupied.get().is_retired() {
                    let handle = spawn(self.next_generation());
                    occupied.insert(handle).cancel();
                    Reconcile::Started
                } else {
                    Reconcile::Unchanged
                }
            }
            Entry::Vacant(vacant) => {
                if self.is_closed() || self.registry.subscriber_count(key) == 0 {
                    Reconcile::Unchanged
                } else {
                    vacant.insert(spawn(self.next_generation()));
                    Reconcile::Started
                }
            }
        }
    }

    /// Poller self-check before sleeping. Returns true when the poller
    /// should exit: either it no longer owns the entry, or the key has no
    /// subscribers (in which case the entry is removed here).
    pub fn retire_if_idle(&self, key: &FeedKey, generation: u64) -> bool {
        match self.pollers.entry(key.clone()) {
            Entry::Occupied(occupied) if occupied.get().generation() == generation => {
                if self.registry.subscriber_count(key) == 0 {
                    occupied.remove();
                    true
                } else {
                    false
                }
            }
            _ => true,
        }
    }

    /// Latest snapshot of the poller for `key`.
    #[must_use]
    pub fn last_snapshot(&self, key: &FeedKey) -> Option<Arc<Snapshot>> {
        self.pollers.get(key).and_then(|handle| handle.last_snapshot())
    }

    /// Status of the poller for `key`.
    #[must_use]
    pub fn status(&self, key: &FeedKey) -> Option<PollerStatus> {
        self.pollers.get(key).map(|handle| handle.status())
    }

    /// Keys with a poller, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<FeedKey> {
        let mut keys: Vec<FeedKey> = self.pollers.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Number of pollers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pollers.len()
    }

    /// Whether no poller exists.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pollers.is_empty()
    }

    /// Close the table, then cancel and remove every poller.
    ///
    /// A reconcile racing with this either saw the table closed or inserted
    /// under a shard lock the key scan below waits on.
    pub fn cancel_all(&self) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        let keys = self.keys();
        keys.iter()
            .filter_map(|key| self.pollers.remove(key))
            .map(|(_, handle)| handle.cancel())
            .count()
    }

    /// Whether [`cancel_all`](Self::cancel_all) has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn next_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::Relaxed)
    }
}
