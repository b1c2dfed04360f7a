//! Connection Registry
//!
//! Single source of truth for which connections exist, what each one is
//! subscribed to, and the reverse index from [`FeedKey`] to subscribers used
//! for O(subscribers) fan-out.
//!
//! # Design
//!
//! The registry tracks:
//! - One record per live connection behind its own mutex
//! - A sharded reverse index, one set of connection ids per feed key
//! - Subscriber-count transitions (0→1 and 1→0) reported to the caller
//!
//! This lets many connections share one feed key while the hub keeps exactly
//! one upstream poller for it.
//!
//! # Locking
//!
//! A connection's mutex is always taken before any reverse-index shard.
//! No lock is held across an await point; every operation here is
//! synchronous bookkeeping. Operations on unknown ids are no-ops.

pub mod outbound;

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;

use crate::domain::feed::{FeedKey, FeedType};

pub use outbound::{OutboundReceiver, OutboundSender, PushOutcome, QueueClosed};

// =============================================================================
// Types
// =============================================================================

/// Opaque connection handle, unique for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Raw numeric value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Per-connection record.
#[derive(Debug)]
struct ConnectionEntry {
    user_id: Option<String>,
    subscriptions: HashSet<FeedKey>,
    outbound: OutboundSender,
    /// Cleared by `deregister`; late mutations through a stale handle see it.
    live: bool,
}

// =============================================================================
// Registry
// =============================================================================

/// Registry of live connections and their subscriptions.
///
/// # Example
///
/// ```rust
/// use market_feed_hub::domain::feed::{FeedKey, FeedType, InstrumentKey};
/// use market_feed_hub::domain::subscription::ConnectionRegistry;
///
/// let registry = ConnectionRegistry::new(16);
/// let (a, _rx_a) = registry.register(None);
/// let (b, _rx_b) = registry.register(None);
/// let key = FeedKey::new(FeedType::PriceUpdates, InstrumentKey::parse("bitcoin").unwrap());
///
/// // First subscriber starts the stream
/// assert!(registry.add_subscription(a, &key));
/// // Second subscriber shares it
/// assert!(!registry.add_subscription(b, &key));
///
/// // Still watched by b
/// assert_eq!(registry.remove_subscription(a, &key), Some(false));
/// // Last subscriber leaves
/// assert_eq!(registry.remove_subscription(b, &key), Some(true));
/// // Nothing left to remove
/// assert_eq!(registry.remove_subscription(b, &key), None);
/// ```
#[derive(Debug)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<Mutex<ConnectionEntry>>>,
    subscribers: DashMap<FeedKey, HashSet<ConnectionId>>,
    next_id: AtomicU64,
    outbound_capacity: usize,
}

impl ConnectionRegistry {
    /// Create a registry whose connections get outbound queues of
    /// `outbound_capacity` updates.
    #[must_use]
    pub fn new(outbound_capacity: usize) -> Self {
        Self {
            connections: DashMap::new(),
            subscribers: DashMap::new(),
            next_id: AtomicU64::new(1),
            outbound_capacity,
        }
    }

    /// Add a connection with an empty subscription set.
    ///
    /// Returns the new id and the receiving half of its outbound queue.
    pub fn register(&self, user_id: Option<String>) -> (ConnectionId, OutboundReceiver) {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (outbound, receiver) = outbound::channel(self.outbound_capacity);

        self.connections.insert(
            id,
            Arc::new(Mutex::new(ConnectionEntry {
                user_id,
                subscriptions: HashSet::new(),
                outbound,
                live: true,
            })),
        );

        (id, receiver)
    }

    /// Remove a connection and all of its subscriptions.
    ///
    /// Returns the keys whose subscriber set became empty. The outbound queue
    /// is closed. Idempotent.
    pub fn deregister(&self, id: ConnectionId) -> Vec<FeedKey> {
        self.try_deregister(id).unwrap_or_default()
    }

    /// Like [`deregister`](Self::deregister), but `None` when the id was
    /// not registered.
    pub fn try_deregister(&self, id: ConnectionId) -> Option<Vec<FeedKey>> {
        let (_, entry) = self.connections.remove(&id)?;

        let mut conn = entry.lock();
        conn.live = false;
        conn.outbound.close();

        let mut emptied: Vec<FeedKey> = std::mem::take(&mut conn.subscriptions)
            .into_iter()
            .filter(|key| self.unindex(id, key))
            .collect();
        drop(conn);

        emptied.sort();
        Some(emptied)
    }

    /// Subscribe a connection to `key`.
    ///
    /// Returns true iff the key had no subscribers immediately before.
    pub fn add_subscription(&self, id: ConnectionId, key: &FeedKey) -> bool {
        let Some(entry) = self.entry(id) else {
            return false;
        };

        let mut conn = entry.lock();
        if !conn.live || !conn.subscriptions.insert(key.clone()) {
            return false;
        }

        let mut subscribers = self.subscribers.entry(key.clone()).or_default();
        let was_first = subscribers.is_empty();
        subscribers.insert(id);
        was_first
    }

    /// Unsubscribe a connection from `key`.
    ///
    /// `None` when the connection did not hold `key`. Otherwise whether the
    /// key has no subscribers as a result, decided in the same critical
    /// section as the removal.
    pub fn remove_subscription(&self, id: ConnectionId, key: &FeedKey) -> Option<bool> {
        let entry = self.entry(id)?;

        let mut conn = entry.lock();
        if !conn.live || !conn.subscriptions.remove(key) {
            return None;
        }
        Some(self.unindex(id, key))
    }

    /// Unsubscribe a connection from every key of `feed_type` in one
    /// critical section.
    ///
    /// Returns each removed key with its was-last flag.
    pub fn remove_feed(&self, id: ConnectionId, feed_type: FeedType) -> Vec<(FeedKey, bool)> {
        let Some(entry) = self.entry(id) else {
            return vec![];
        };

        let mut conn = entry.lock();
        if !conn.live {
            return vec![];
        }

        let mut keys: Vec<FeedKey> = conn
            .subscriptions
            .iter()
            .filter(|key| key.feed_type == feed_type)
            .cloned()
            .collect();
        keys.sort();

        keys.into_iter()
            .map(|key| {
                conn.subscriptions.remove(&key);
                let was_last = self.unindex(id, &key);
                (key, was_last)
            })
            .collect()
    }

    /// Point-in-time copy of the subscribers of `key`.
    #[must_use]
    pub fn subscribers_of(&self, key: &FeedKey) -> Vec<ConnectionId> {
        self.subscribers
            .get(key)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Current number of subscribers of `key`.
    #[must_use]
    pub fn subscriber_count(&self, key: &FeedKey) -> usize {
        self.subscribers.get(key).map_or(0, |set| set.len())
    }

    /// Keys a connection is subscribed to, sorted.
    #[must_use]
    pub fn subscriptions_of(&self, id: ConnectionId) -> Vec<FeedKey> {
        let Some(entry) = self.entry(id) else {
            return vec![];
        };
        let mut keys: Vec<FeedKey> = entry.lock().subscriptions.iter().cloned().collect();
        keys.sort();
        keys
    }

    /// Sending half of a connection's outbound queue.
    #[must_use]
    pub fn outbound(&self, id: ConnectionId) -> Option<OutboundSender> {
        self.entry(id).map(|entry| entry.lock().outbound.clone())
    }

    /// User associated with a connection.
    #[must_use]
    pub fn user_id(&self, id: ConnectionId) -> Option<String> {
        self.entry(id).and_then(|entry| entry.lock().user_id.clone())
    }

    /// Whether a connection is registered.
    #[must_use]
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    /// Number of live connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Keys with at least one subscriber, sorted.
    #[must_use]
    pub fn active_keys(&self) -> Vec<FeedKey> {
        let mut keys: Vec<FeedKey> = self.subscribers.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            connections: self.connections.len(),
            feed_keys: self.subscribers.len(),
            subscriptions: self.subscribers.iter().map(|e| e.value().len()).sum(),
        }
    }

    /// Clone the record handle out of the map so no shard guard outlives
    /// this call.
    fn entry(&self, id: ConnectionId) -> Option<Arc<Mutex<ConnectionEntry>>> {
        self.connections.get(&id).map(|e| Arc::clone(e.value()))
    }

    /// Drop `id` from the reverse index of `key`. True iff the set emptied.
    fn unindex(&self, id: ConnectionId, key: &FeedKey) -> bool {
        match self.subscribers.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                if !occupied.get_mut().remove(&id) {
                    return false;
                }
                if occupied.get().is_empty() {
                    occupied.remove();
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(_) => false,
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Registry counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Live connections.
    pub connections: usize,
    /// Feed keys with at least one subscriber.
    pub feed_keys: usize,
    /// Total (connection, key) memberships.
    pub subscriptions: usize,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use proptest::prelude::*;

    use super::*;
    use crate::domain::feed::InstrumentKey;

    fn price(coin: &str) -> FeedKey {
        FeedKey::new(FeedType::PriceUpdates, InstrumentKey::parse(coin).unwrap())
    }

    fn indicators(coin: &str) -> FeedKey {
        FeedKey::new(
            FeedType::TechnicalIndicators,
            InstrumentKey::parse(coin).unwrap(),
        )
    }

    #[test]
    fn register_assigns_distinct_ids() {
        let registry = ConnectionRegistry::new(4);
        let (a, _ra) = registry.register(None);
        let (b, _rb) = registry.register(Some("alice".to_string()));

        assert_ne!(a, b);
        assert_eq!(registry.connection_count(), 2);
        assert_eq!(registry.user_id(b).as_deref(), Some("alice"));
        assert!(registry.user_id(a).is_none());
        assert!(a.to_string().starts_with("conn-"));
    }

    #[test]
    fn add_subscription_new_key() {
        let registry = ConnectionRegistry::new(4);
        let (a, _ra) = registry.register(None);

        assert!(registry.add_subscription(a, &price("bitcoin")));
        assert_eq!(registry.subscriber_count(&price("bitcoin")), 1);
    }

    #[test]
    fn add_subscription_existing_key() {
        let registry = ConnectionRegistry::new(4);
        let (a, _ra) = registry.register(None);
        let (b, _rb) = registry.register(None);

        registry.add_subscription(a, &price("bitcoin"));

        assert!(!registry.add_subscription(b, &price("bitcoin")));
        assert_eq!(registry.subscriber_count(&price("bitcoin")), 2);
    }

    #[test]
    fn add_subscription_duplicate_is_noop() {
        let registry = ConnectionRegistry::new(4);
        let (a, _ra) = registry.register(None);

        registry.add_subscription(a, &price("bitcoin"));

        assert!(!registry.add_subscription(a, &price("bitcoin")));
        assert_eq!(registry.subscriber_count(&price("bitcoin")), 1);
    }

    #[test]
    fn remove_subscription_with_remaining_subscribers() {
        let registry = ConnectionRegistry::new(4);
        let (a, _ra) = registry.register(None);
        let (b, _rb) = registry.register(None);
        registry.add_subscription(a, &indicators("ethereum"));
        registry.add_subscription(b, &indicators("ethereum"));

        assert_eq!(
            registry.remove_subscription(a, &indicators("ethereum")),
            Some(false)
        );
        assert_eq!(registry.subscribers_of(&indicators("ethereum")), vec![b]);
    }

    #[test]
    fn remove_subscription_last_subscriber() {
        let registry = ConnectionRegistry::new(4);
        let (a, _ra) = registry.register(None);
        registry.add_subscription(a, &price("bitcoin"));

        assert_eq!(registry.remove_subscription(a, &price("bitcoin")), Some(true));
        assert_eq!(registry.stats().feed_keys, 0);
    }

    #[test]
    fn remove_subscription_not_held_is_noop() {
        let registry = ConnectionRegistry::new(4);
        let (a, _ra) = registry.register(None);
        let (b, _rb) = registry.register(None);
        registry.add_subscription(a, &price("bitcoin"));

        assert_eq!(registry.remove_subscription(b, &price("bitcoin")), None);
        assert_eq!(registry.subscriber_count(&price("bitcoin")), 1);
    }

    #[test]
    fn remove_feed_removes_only_that_type() {
        let registry = ConnectionRegistry::new(4);
        let (a, _ra) = registry.register(None);
        let (b, _rb) = registry.register(None);
        registry.add_subscription(a, &price("bitcoin"));
        registry.add_subscription(a, &price("ethereum"));
        registry.add_subscription(a, &indicators("bitcoin"));
        registry.add_subscription(b, &price("ethereum"));

        let removed = registry.remove_feed(a, FeedType::PriceUpdates);

        assert_eq!(
            removed,
            vec![(price("bitcoin"), true), (price("ethereum"), false)]
        );
        assert_eq!(registry.subscriptions_of(a), vec![indicators("bitcoin")]);
    }

    #[test]
    fn deregister_returns_emptied_keys() {
        let registry = ConnectionRegistry::new(4);
        let (a, _ra) = registry.register(None);
        let (b, _rb) = registry.register(None);
        registry.add_subscription(a, &price("bitcoin"));
        registry.add_subscription(a, &price("ethereum"));
        registry.add_subscription(b, &price("ethereum"));

        let emptied = registry.deregister(a);

        assert_eq!(emptied, vec![price("bitcoin")]);
        assert_eq!(registry.subscribers_of(&price("ethereum")), vec![b]);
        assert!(!registry.contains(a));
    }

    #[test]
    fn deregister_is_idempotent() {
        let registry = ConnectionRegistry::new(4);
        let (a, _ra) = registry.register(None);
        registry.add_subscription(a, &price("bitcoin"));

        assert_eq!(registry.deregister(a).len(), 1);
        assert!(registry.deregister(a).is_empty());
        assert_eq!(registry.stats(), RegistryStats::default());
    }

    #[test]
    fn deregister_closes_outbound() {
        let registry = ConnectionRegistry::new(4);
        let (a, _ra) = registry.register(None);
        let outbound = registry.outbound(a).unwrap();

        registry.deregister(a);

        assert!(outbound.is_closed());
        assert!(registry.outbound(a).is_none());
    }

    #[test]
    fn unknown_connection_operations_are_noops() {
        let registry = ConnectionRegistry::new(4);
        let (a, _ra) = registry.register(None);
        registry.deregister(a);

        assert!(!registry.add_subscription(a, &price("bitcoin")));
        assert!(registry.remove_subscription(a, &price("bitcoin")).is_none());
        assert!(registry.remove_feed(a, FeedType::PriceUpdates).is_empty());
        assert!(registry.subscriptions_of(a).is_empty());
        assert_eq!(registry.subscriber_count(&price("bitcoin")), 0);
    }

    #[test]
    fn stats_are_accurate() {
        let registry = ConnectionRegistry::new(4);
        let (a, _ra) = registry.register(None);
        let (b, _rb) = registry.register(None);
        registry.add_subscription(a, &price("bitcoin"));
        registry.add_subscription(a, &price("ethereum"));
        registry.add_subscription(b, &price("bitcoin"));

        let stats = registry.stats();
        assert_eq!(stats.connections, 2);
        assert_eq!(stats.feed_keys, 2);
        assert_eq!(stats.subscriptions, 3);
        assert_eq!(registry.active_keys(), vec![price("bitcoin"), price("ethereum")]);
    }

    #[test]
    fn concurrent_subscribers_report_exactly_one_first() {
        let registry = Arc::new(ConnectionRegistry::new(4));
        let key = price("bitcoin");
        let mut receivers = Vec::new();
        let ids: Vec<_> = (0..16)
            .map(|_| {
                let (id, rx) = registry.register(None);
                receivers.push(rx);
                id
            })
            .collect();

        let handles: Vec<_> = ids
            .iter()
            .map(|&id| {
                let registry = Arc::clone(&registry);
                let key = key.clone();
                std::thread::spawn(move || registry.add_subscription(id, &key))
            })
            .collect();

        let firsts = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|first| *first)
            .count();
        assert_eq!(firsts, 1);
        assert_eq!(registry.subscriber_count(&key), 16);
    }

    #[test]
    fn concurrent_unsubscribe_and_deregister_remove_once() {
        for _ in 0..50 {
            let registry = Arc::new(ConnectionRegistry::new(4));
            let key = price("bitcoin");
            let (a, _ra) = registry.register(None);
            registry.add_subscription(a, &key);

            let r1 = Arc::clone(&registry);
            let k1 = key.clone();
            let unsubscribe = std::thread::spawn(move || {
                usize::from(r1.remove_subscription(a, &k1).unwrap_or(false))
            });
            let r2 = Arc::clone(&registry);
            let disconnect = std::thread::spawn(move || r2.deregister(a).len());

            let total = unsubscribe.join().unwrap() + disconnect.join().unwrap();
            assert_eq!(total, 1);
            assert_eq!(registry.subscriber_count(&key), 0);
        }
    }

    #[test]
    fn concurrent_removes_of_one_key_report_it_once() {
        for _ in 0..50 {
            let registry = Arc::new(ConnectionRegistry::new(4));
            let key = price("bitcoin");
            let (a, _ra) = registry.register(None);
            registry.add_subscription(a, &key);

            let removers: Vec<_> = (0..2)
                .map(|_| {
                    let registry = Arc::clone(&registry);
                    let key = key.clone();
                    std::thread::spawn(move || registry.remove_subscription(a, &key))
                })
                .collect();
            let mut outcomes: Vec<Option<bool>> =
                removers.into_iter().map(|t| t.join().unwrap()).collect();
            outcomes.sort();

            assert_eq!(outcomes, vec![None, Some(true)]);
        }
    }

    // =========================================================================
    // Model check
    // =========================================================================

    #[derive(Debug, Clone)]
    enum Op {
        Add(usize, usize),
        Remove(usize, usize),
        Deregister(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..4usize, 0..3usize).prop_map(|(c, k)| Op::Add(c, k)),
            (0..4usize, 0..3usize).prop_map(|(c, k)| Op::Remove(c, k)),
            (0..4usize).prop_map(Op::Deregister),
        ]
    }

    proptest! {
        #[test]
        fn registry_matches_model(ops in prop::collection::vec(op(), 1..64)) {
            let registry = ConnectionRegistry::new(4);
            let keys = [price("bitcoin"), price("ethereum"), indicators("bitcoin")];
            let mut receivers = Vec::new();
            let ids: Vec<ConnectionId> = (0..4)
                .map(|_| {
                    let (id, rx) = registry.register(None);
                    receivers.push(rx);
                    id
                })
                .collect();

            let mut model: HashMap<usize, HashSet<usize>> =
                (0..4).map(|c| (c, HashSet::new())).collect();
            let count = |model: &HashMap<usize, HashSet<usize>>, k: usize| {
                model.values().filter(|subs| subs.contains(&k)).count()
            };

            for op in ops {
                match op {
                    Op::Add(c, k) => {
                        let live = model.contains_key(&c);
                        let expected = live
                            && !model[&c].contains(&k)
                            && count(&model, k) == 0;
                        if let Some(subs) = model.get_mut(&c) {
                            subs.insert(k);
                        }
                        prop_assert_eq!(registry.add_subscription(ids[c], &keys[k]), expected);
                    }
                    Op::Remove(c, k) => {
                        let held = model.get_mut(&c).is_some_and(|subs| subs.remove(&k));
                        let expected = held.then(|| count(&model, k) == 0);
                        prop_assert_eq!(registry.remove_subscription(ids[c], &keys[k]), expected);
                    }
                    Op::Deregister(c) => {
                        let held = model.remove(&c).unwrap_or_default();
                        let mut expected: Vec<FeedKey> = held
                            .into_iter()
                            .filter(|&k| count(&model, k) == 0)
                            .map(|k| keys[k].clone())
                            .collect();
                        expected.sort();
                        prop_assert_eq!(registry.deregister(ids[c]), expected);
                    }
                }

                for (k, key) in keys.iter().enumerate() {
                    prop_assert_eq!(registry.subscriber_count(key), count(&model, k));
                }
            }
        }
    }
}
