//! Subscription Lifecycle Integration Tests
//!
//! Poller start/stop driven by subscriber interest, failure backoff, and the
//! single-poller guarantee under concurrent churn.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use rust_decimal::Decimal;
use tokio::time::{Instant, timeout};

use market_feed_hub::application::services::poller::backoff::BackoffConfig;
use market_feed_hub::{
    ConnectionId, FeedKey, FeedType, FetchError, HubEventSink, HubSettings, InstrumentKey,
    PriceSnapshot, Snapshot, SnapshotFetcher, StopReason, SubscriptionHub,
};

// =============================================================================
// Fixtures
// =============================================================================

/// Fetcher that replays a script, then keeps returning a default price.
struct ScriptedFetcher {
    script: Mutex<VecDeque<Result<Snapshot, FetchError>>>,
    calls: Mutex<Vec<(FeedKey, Instant)>>,
}

impl ScriptedFetcher {
    fn new(script: Vec<Result<Snapshot, FetchError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn offsets(&self, start: Instant) -> Vec<u64> {
        self.calls
            .lock()
            .iter()
            .map(|(_, at)| at.duration_since(start).as_secs())
            .collect()
    }

    fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl SnapshotFetcher for ScriptedFetcher {
    async fn fetch(&self, key: &FeedKey) -> Result<Snapshot, FetchError> {
        self.calls.lock().push((key.clone(), Instant::now()));
        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(price(98_500, Decimal::new(23, 1))))
    }
}

/// Event sink that counts lifecycle events.
#[derive(Default)]
struct CountingSink {
    started: AtomicUsize,
    stopped: AtomicUsize,
    closed: AtomicUsize,
    failures: AtomicUsize,
}

impl HubEventSink for CountingSink {
    fn poller_started(&self, _key: &FeedKey) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }

    fn poller_stopped(&self, _key: &FeedKey, _reason: StopReason) {
        self.stopped.fetch_add(1, Ordering::SeqCst);
    }

    fn fetch_succeeded(&self, _key: &FeedKey, _delivered: usize) {}

    fn fetch_failed(&self, _: &FeedKey, _: &FetchError, _: u32, _: Duration) {
        self.failures.fetch_add(1, Ordering::SeqCst);
    }

    fn messages_dropped(&self, _: ConnectionId, _: &FeedKey, _: u64) {}

    fn connection_closed(&self, _connection: ConnectionId) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

fn price(value: i64, change: Decimal) -> Snapshot {
    Snapshot::Price(PriceSnapshot {
        price: Decimal::from(value),
        price_change_24h: change,
        volume_24h: Decimal::ZERO,
        market_cap: Decimal::ZERO,
    })
}

fn settings_without_jitter() -> HubSettings {
    HubSettings {
        backoff: BackoffConfig {
            jitter_factor: 0.0,
            ..BackoffConfig::default()
        },
        ..HubSettings::default()
    }
}

fn key(feed_type: FeedType, coin: &str) -> FeedKey {
    FeedKey::new(feed_type, InstrumentKey::parse(coin).unwrap())
}

// =============================================================================
// Poller lifecycle
// =============================================================================

#[tokio::test(start_paused = true)]
async fn fresh_subscribe_delivers_first_fetch_once() {
    let fetcher = ScriptedFetcher::new(vec![]);
    let hub = SubscriptionHub::start(
        settings_without_jitter(),
        fetcher.clone(),
        Arc::new(CountingSink::default()),
    );

    let mut conn = hub.connect(None);
    hub.subscribe(conn.id, FeedType::PriceUpdates, &["bitcoin"])
        .unwrap();

    let update = timeout(Duration::from_secs(1), conn.outbound.recv())
        .await
        .expect("first fetch delivered")
        .unwrap();

    assert_eq!(update.key, key(FeedType::PriceUpdates, "bitcoin"));
    match update.snapshot.as_ref() {
        Snapshot::Price(p) => {
            assert_eq!(p.price, Decimal::from(98_500));
            assert_eq!(p.price_change_24h, Decimal::new(23, 1));
        }
        other => panic!("unexpected snapshot {other:?}"),
    }

    // Nothing else until the next interval.
    assert!(
        timeout(Duration::from_secs(29), conn.outbound.recv())
            .await
            .is_err()
    );
    assert_eq!(fetcher.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn last_unsubscribe_stops_poller() {
    let fetcher = ScriptedFetcher::new(vec![]);
    let sink = Arc::new(CountingSink::default());
    let hub = SubscriptionHub::start(settings_without_jitter(), fetcher.clone(), sink.clone());
    let btc = key(FeedType::PriceUpdates, "bitcoin");

    let a = hub.connect(None);
    let b = hub.connect(None);
    hub.subscribe(a.id, FeedType::PriceUpdates, &["bitcoin"])
        .unwrap();
    hub.subscribe(b.id, FeedType::PriceUpdates, &["bitcoin"])
        .unwrap();
    assert_eq!(hub.active_pollers(), vec![btc.clone()]);

    hub.unsubscribe(a.id, FeedType::PriceUpdates, Some(&["bitcoin"][..]))
        .unwrap();
    assert_eq!(hub.active_pollers(), vec![btc.clone()]);

    hub.unsubscribe(b.id, FeedType::PriceUpdates, Some(&["bitcoin"][..]))
        .unwrap();
    assert!(hub.active_pollers().is_empty());
    assert_eq!(hub.subscriber_count(&btc), 0);

    // Task observes the cancellation and exits; no more fetches.
    tokio::time::sleep(Duration::from_secs(1)).await;
    let calls = fetcher.call_count();
    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(fetcher.call_count(), calls);
    assert_eq!(sink.started.load(Ordering::SeqCst), 1);
    assert_eq!(sink.stopped.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn resubscribe_after_teardown_starts_fresh_poller() {
    let fetcher = ScriptedFetcher::new(vec![]);
    let sink = Arc::new(CountingSink::default());
    let hub = SubscriptionHub::start(settings_without_jitter(), fetcher.clone(), sink.clone());

    let conn = hub.connect(None);
    hub.subscribe(conn.id, FeedType::PriceUpdates, &["bitcoin"])
        .unwrap();
    let empty: [&str; 0] = [];
    hub.unsubscribe(conn.id, FeedType::PriceUpdates, Some(&empty[..]))
        .unwrap();
    assert!(hub.active_pollers().is_empty());

    hub.subscribe(conn.id, FeedType::PriceUpdates, &["bitcoin"])
        .unwrap();
    assert_eq!(hub.active_pollers().len(), 1);
    assert_eq!(sink.started.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn consecutive_failures_back_off_then_recover() {
    let fetcher = ScriptedFetcher::new(vec![
        Err(FetchError::Timeout),
        Err(FetchError::Api {
            status: 429,
            message: "rate limited".to_string(),
        }),
        Err(FetchError::Network("reset".to_string())),
    ]);
    let sink = Arc::new(CountingSink::default());
    let hub = SubscriptionHub::start(settings_without_jitter(), fetcher.clone(), sink.clone());
    let btc = key(FeedType::PriceUpdates, "bitcoin");

    let start = Instant::now();
    let mut conn = hub.connect(None);
    hub.subscribe(conn.id, FeedType::PriceUpdates, &["bitcoin"])
        .unwrap();

    // Third failure lands at t=180.
    tokio::time::sleep(Duration::from_secs(181)).await;
    let status = hub.poller_status(&btc).expect("poller still running");
    assert_eq!(status.consecutive_failures, 3);
    assert_eq!(status.current_delay, Duration::from_secs(240));
    assert!(conn.outbound.try_recv().is_none());

    // Success at t=420 resets to the base interval.
    let update = timeout(Duration::from_secs(300), conn.outbound.recv())
        .await
        .expect("recovered")
        .unwrap();
    assert!(matches!(update.snapshot.as_ref(), Snapshot::Price(_)));

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(fetcher.offsets(start)[..5], [0, 60, 180, 420, 450]);

    let status = hub.poller_status(&btc).unwrap();
    assert_eq!(status.consecutive_failures, 0);
    assert_eq!(status.current_delay, Duration::from_secs(30));
    assert_eq!(sink.failures.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn global_feed_shares_one_poller() {
    let fetcher = ScriptedFetcher::new(vec![]);
    let hub = SubscriptionHub::start(
        settings_without_jitter(),
        fetcher,
        Arc::new(CountingSink::default()),
    );
    let empty: [&str; 0] = [];

    let a = hub.connect(None);
    let b = hub.connect(None);
    hub.subscribe(a.id, FeedType::NewsUpdates, &empty).unwrap();
    hub.subscribe(b.id, FeedType::NewsUpdates, &["ignored"])
        .unwrap();

    assert_eq!(
        hub.active_pollers(),
        vec![FeedKey::global(FeedType::NewsUpdates)]
    );
    assert_eq!(
        hub.subscriber_count(&FeedKey::global(FeedType::NewsUpdates)),
        2
    );
}

#[tokio::test(start_paused = true)]
async fn push_only_feeds_never_poll() {
    let fetcher = ScriptedFetcher::new(vec![]);
    let hub = SubscriptionHub::start(
        settings_without_jitter(),
        fetcher.clone(),
        Arc::new(CountingSink::default()),
    );
    let empty: [&str; 0] = [];

    let conn = hub.connect(Some("user-1".to_string()));
    hub.subscribe(conn.id, FeedType::Alerts, &empty).unwrap();
    hub.subscribe(conn.id, FeedType::PortfolioUpdates, &empty)
        .unwrap();

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(hub.active_pollers().is_empty());
    assert_eq!(fetcher.call_count(), 0);
}

// =============================================================================
// Disconnect
// =============================================================================

#[tokio::test(start_paused = true)]
async fn disconnect_is_idempotent() {
    let sink = Arc::new(CountingSink::default());
    let hub = SubscriptionHub::start(
        settings_without_jitter(),
        ScriptedFetcher::new(vec![]),
        sink.clone(),
    );

    let conn = hub.connect(None);
    hub.subscribe(conn.id, FeedType::PriceUpdates, &["bitcoin", "ethereum"])
        .unwrap();
    assert_eq!(hub.active_pollers().len(), 2);

    hub.disconnect(conn.id);
    hub.disconnect(conn.id);

    assert!(hub.active_pollers().is_empty());
    assert_eq!(hub.stats().connections, 0);
    assert_eq!(sink.closed.load(Ordering::SeqCst), 1);

    // Calls on a dead id are no-ops.
    assert!(hub.subscriptions_of(conn.id).is_empty());
    hub.unsubscribe::<&str>(conn.id, FeedType::PriceUpdates, None)
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn dropped_receiver_is_reaped_on_next_delivery() {
    let sink = Arc::new(CountingSink::default());
    let hub = SubscriptionHub::start(
        settings_without_jitter(),
        ScriptedFetcher::new(vec![]),
        sink.clone(),
    );

    let conn = hub.connect(None);
    hub.subscribe(conn.id, FeedType::PriceUpdates, &["bitcoin"])
        .unwrap();
    drop(conn.outbound);

    // Next delivery finds the queue closed and reports the connection dead.
    tokio::time::sleep(Duration::from_secs(31)).await;

    assert_eq!(hub.stats().connections, 0);
    assert!(hub.active_pollers().is_empty());
    assert_eq!(sink.closed.load(Ordering::SeqCst), 1);
}

// =============================================================================
// Concurrency
// =============================================================================

/// Wait until exactly `live` pollers have started and not yet reported
/// their exit.
async fn settle(sink: &CountingSink, live: usize) {
    timeout(Duration::from_secs(5), async {
        while sink.started.load(Ordering::SeqCst) != sink.stopped.load(Ordering::SeqCst) + live {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("poller events settle");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_first_subscribers_spawn_one_poller() {
    let sink = Arc::new(CountingSink::default());
    let hub = SubscriptionHub::start(
        settings_without_jitter(),
        ScriptedFetcher::new(vec![]),
        sink.clone(),
    );

    let tasks: Vec<_> = (0..32)
        .map(|_| {
            let hub = Arc::clone(&hub);
            tokio::spawn(async move {
                let conn = hub.connect(None);
                hub.subscribe(conn.id, FeedType::PriceUpdates, &["bitcoin"])
                    .unwrap();
                conn
            })
        })
        .collect();

    let mut connections = Vec::new();
    for task in tasks {
        connections.push(task.await.unwrap());
    }

    assert_eq!(hub.active_pollers().len(), 1);
    assert_eq!(sink.started.load(Ordering::SeqCst), 1);
    assert_eq!(
        hub.subscriber_count(&key(FeedType::PriceUpdates, "bitcoin")),
        32
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn churn_leaves_nothing_behind() {
    const COINS: [&str; 4] = ["bitcoin", "ethereum", "solana", "cardano"];

    let sink = Arc::new(CountingSink::default());
    let hub = SubscriptionHub::start(
        settings_without_jitter(),
        ScriptedFetcher::new(vec![]),
        sink.clone(),
    );

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let hub = Arc::clone(&hub);
            tokio::spawn(async move {
                for _ in 0..25 {
                    let conn = hub.connect(None);
                    let ops = rand::rng().random_range(1..8);
                    for _ in 0..ops {
                        let coin = COINS[rand::rng().random_range(0..COINS.len())];
                        if rand::rng().random_bool(0.6) {
                            hub.subscribe(conn.id, FeedType::PriceUpdates, &[coin])
                                .unwrap();
                        } else {
                            hub.unsubscribe(conn.id, FeedType::PriceUpdates, Some(&[coin][..]))
                                .unwrap();
                        }
                        tokio::task::yield_now().await;
                    }
                    hub.disconnect(conn.id);
                }
            })
        })
        .collect();

    for task in tasks {
        task.await.unwrap();
    }

    let stats = hub.stats();
    assert_eq!(stats.connections, 0);
    assert_eq!(stats.feed_keys, 0);
    assert_eq!(stats.subscriptions, 0);
    assert!(hub.active_pollers().is_empty());
    assert_eq!(sink.closed.load(Ordering::SeqCst), 16 * 25);

    // Every spawned poller eventually reports its exit.
    timeout(Duration::from_secs(5), async {
        while sink.stopped.load(Ordering::SeqCst) < sink.started.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("all pollers exited");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn last_disconnect_racing_new_subscribe_keeps_one_poller() {
    let sink = Arc::new(CountingSink::default());
    let hub = SubscriptionHub::start(
        settings_without_jitter(),
        ScriptedFetcher::new(vec![]),
        sink.clone(),
    );
    let btc = key(FeedType::PriceUpdates, "bitcoin");

    for round in 0..100 {
        let a = hub.connect(None);
        hub.subscribe(a.id, FeedType::PriceUpdates, &["bitcoin"])
            .unwrap();
        let barrier = Arc::new(tokio::sync::Barrier::new(2));

        let leaving = {
            let hub = Arc::clone(&hub);
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move {
                barrier.wait().await;
                hub.disconnect(a.id);
            })
        };
        let joining = {
            let hub = Arc::clone(&hub);
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move {
                let b = hub.connect(None);
                barrier.wait().await;
                hub.subscribe(b.id, FeedType::PriceUpdates, &["bitcoin"])
                    .unwrap();
                b
            })
        };
        leaving.await.unwrap();
        let b = joining.await.unwrap();

        assert_eq!(hub.active_pollers(), vec![btc.clone()], "round {round}");
        assert_eq!(hub.subscriber_count(&btc), 1, "round {round}");
        settle(&sink, 1).await;

        hub.disconnect(b.id);
        assert!(hub.active_pollers().is_empty(), "round {round}");
        settle(&sink, 0).await;
    }
}

#[tokio::test(start_paused = true)]
async fn subscribe_after_shutdown_spawns_nothing() {
    let fetcher = ScriptedFetcher::new(vec![]);
    let sink = Arc::new(CountingSink::default());
    let hub = SubscriptionHub::start(settings_without_jitter(), fetcher.clone(), sink.clone());

    hub.shutdown();
    let conn = hub.connect(None);
    hub.subscribe(conn.id, FeedType::PriceUpdates, &["bitcoin"])
        .unwrap();

    assert!(hub.active_pollers().is_empty());
    assert_eq!(sink.started.load(Ordering::SeqCst), 0);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(fetcher.call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn shutdown_cancels_every_poller() {
    let sink = Arc::new(CountingSink::default());
    let hub = SubscriptionHub::start(
        settings_without_jitter(),
        ScriptedFetcher::new(vec![]),
        sink.clone(),
    );

    let conn = hub.connect(None);
    hub.subscribe(conn.id, FeedType::PriceUpdates, &["bitcoin", "ethereum"])
        .unwrap();
    hub.subscribe(conn.id, FeedType::TechnicalIndicators, &["bitcoin"])
        .unwrap();
    assert_eq!(hub.active_pollers().len(), 3);

    hub.shutdown();
    assert!(hub.is_shut_down());
    assert!(hub.active_pollers().is_empty());

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(sink.stopped.load(Ordering::SeqCst), 3);
}
