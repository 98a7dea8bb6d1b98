//! Consumer Fan-Out
//!
//! Delivers decoded updates to every consumer subscribed to their topic
//! without letting any consumer stall the feed task.
//!
//! # Architecture
//!
//! ```text
//! supervisor ──publish──▶ Broadcaster ──try_send──▶ lane (bounded mpsc) ──▶ worker ──▶ on_quote()
//!                              │                    lane ...            ──▶ worker ──▶ on_quote()
//!                              └─ resolves subscribers from SubscriptionRegistry
//! ```
//!
//! Each subscription gets its own lane: a bounded queue plus a worker task,
//! created on the first update. `publish` never awaits. When a lane is full
//! the newest update is dropped and counted; the cache still holds it, so a
//! lagging consumer can catch up by reading the latest value.
//!
//! Workers time-box every callback and catch panics. A subscription whose
//! callback fails `eviction_threshold` times in a row is unsubscribed and a
//! [`Alert::ConsumerEvicted`] is raised.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::application::ports::AlertSink;
use crate::domain::alert::Alert;
use crate::domain::feed::{FeedType, Topic};
use crate::domain::quote::QuoteRecord;
use crate::domain::subscription::{
    ConsumerError, ConsumerId, QuoteConsumer, Subscriber, SubscriptionHandle,
    SubscriptionRegistry,
};
use crate::infrastructure::metrics;

// =============================================================================
// Configuration
// =============================================================================

/// Delivery limits applied to every subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastConfig {
    /// Updates buffered per subscription before new ones are dropped.
    pub queue_capacity: usize,
    /// Time allowed for a single callback.
    pub callback_timeout: Duration,
    /// Consecutive failures before a subscription is evicted.
    pub eviction_threshold: u32,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            callback_timeout: Duration::from_secs(2),
            eviction_threshold: 5,
        }
    }
}

// =============================================================================
// Delivery Stats
// =============================================================================

#[derive(Debug, Default)]
struct LaneCounters {
    delivered: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    consecutive_failures: AtomicU32,
    evicted: AtomicBool,
}

/// Delivery counters for one subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsumerStats {
    /// Subscription handle ID.
    pub handle_id: u64,
    /// Consumer owning the subscription.
    pub consumer: ConsumerId,
    /// Topic of the subscription.
    pub topic: Topic,
    /// Callbacks that returned `Ok`.
    pub delivered: u64,
    /// Callbacks that failed, panicked or timed out.
    pub failed: u64,
    /// Updates dropped because the queue was full.
    pub dropped: u64,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// Whether the subscription was evicted.
    pub evicted: bool,
}

struct Lane {
    handle: SubscriptionHandle,
    tx: mpsc::Sender<Arc<QuoteRecord>>,
    counters: Arc<LaneCounters>,
}

impl Lane {
    fn stats(&self) -> ConsumerStats {
        ConsumerStats {
            handle_id: self.handle.id(),
            consumer: self.handle.consumer().clone(),
            topic: self.handle.topic().clone(),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            consecutive_failures: self.counters.consecutive_failures.load(Ordering::Relaxed),
            evicted: self.counters.evicted.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Broadcaster
// =============================================================================

/// Fans updates out to per-subscription delivery lanes.
pub struct Broadcaster {
    registry: Arc<SubscriptionRegistry>,
    alerts: Arc<dyn AlertSink>,
    config: BroadcastConfig,
    lanes: Arc<DashMap<u64, Lane>>,
    runtime: Handle,
}

impl std::fmt::Debug for Broadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broadcaster")
            .field("config", &self.config)
            .field("lanes", &self.lanes.len())
            .finish_non_exhaustive()
    }
}

impl Broadcaster {
    /// Create a broadcaster resolving subscribers from `registry`. Lane
    /// workers are spawned on `runtime`.
    #[must_use]
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        alerts: Arc<dyn AlertSink>,
        config: BroadcastConfig,
        runtime: Handle,
    ) -> Self {
        Self {
            registry,
            alerts,
            config,
            lanes: Arc::new(DashMap::new()),
            runtime,
        }
    }

    /// Queue `record` for every current subscriber of its topic.
    ///
    /// Returns the number of lanes the record was queued on. Safe to call
    /// from threads outside the runtime.
    pub fn publish(&self, record: &Arc<QuoteRecord>) -> usize {
        let subscribers = self.registry.subscribers(record.feed, &record.topic);
        let mut queued = 0;

        for subscriber in subscribers {
            let id = subscriber.handle.id();
            let lane = self
                .lanes
                .entry(id)
                .or_insert_with(|| self.spawn_lane(subscriber));

            match lane.tx.try_send(Arc::clone(record)) {
                Ok(()) => queued += 1,
                Err(TrySendError::Full(_)) => {
                    lane.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    metrics::record_delivery_dropped(record.feed);
                    tracing::debug!(
                        feed = %record.feed,
                        topic = %record.topic,
                        consumer = %lane.handle.consumer(),
                        "Consumer queue full, dropping update"
                    );
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }

        queued
    }

    /// Stop delivering to a subscription. Queued updates are discarded.
    pub fn release(&self, handle_id: u64) {
        self.lanes.remove(&handle_id);
    }

    /// Delivery counters for a subscription with a live lane.
    #[must_use]
    pub fn consumer_stats(&self, handle: &SubscriptionHandle) -> Option<ConsumerStats> {
        self.lanes.get(&handle.id()).map(|lane| lane.stats())
    }

    /// Delivery counters for every live lane.
    #[must_use]
    pub fn all_stats(&self) -> Vec<ConsumerStats> {
        self.lanes.iter().map(|lane| lane.stats()).collect()
    }

    /// Number of live delivery lanes.
    #[must_use]
    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    fn spawn_lane(&self, subscriber: Subscriber) -> Lane {
        let (tx, rx) = mpsc::channel(self.config.queue_capacity.max(1));
        let counters = Arc::new(LaneCounters::default());
        let handle = subscriber.handle.clone();

        let worker = LaneWorker {
            subscriber,
            counters: Arc::clone(&counters),
            registry: Arc::clone(&self.registry),
            alerts: Arc::clone(&self.alerts),
            lanes: Arc::clone(&self.lanes),
            config: self.config,
        };
        self.runtime.spawn(worker.run(rx));

        Lane {
            handle,
            tx,
            counters,
        }
    }
}

// =============================================================================
// Lane Worker
// =============================================================================

struct LaneWorker {
    subscriber: Subscriber,
    counters: Arc<LaneCounters>,
    registry: Arc<SubscriptionRegistry>,
    alerts: Arc<dyn AlertSink>,
    lanes: Arc<DashMap<u64, Lane>>,
    config: BroadcastConfig,
}

impl LaneWorker {
    async fn run(self, mut rx: mpsc::Receiver<Arc<QuoteRecord>>) {
        let handle = self.subscriber.handle.clone();

        while let Some(record) = rx.recv().await {
            if !self.registry.is_active(&handle) {
                break;
            }

            let feed = record.feed;
            let outcome = tokio::time::timeout(
                self.config.callback_timeout,
                AssertUnwindSafe(self.subscriber.consumer.on_quote(record)).catch_unwind(),
            )
            .await;

            let failure = match outcome {
                Ok(Ok(Ok(()))) => None,
                Ok(Ok(Err(e))) => Some(("error", e.to_string())),
                Ok(Err(_)) => Some(("panic", "callback panicked".to_string())),
                Err(_) => Some((
                    "timeout",
                    format!("callback exceeded {:?}", self.config.callback_timeout),
                )),
            };

            match failure {
                None => {
                    self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                    self.counters.consecutive_failures.store(0, Ordering::Relaxed);
                    metrics::record_delivery(feed);
                }
                Some((reason, detail)) => {
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                    let failures =
                        self.counters.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                    metrics::record_consumer_failure(feed, reason);
                    tracing::warn!(
                        feed = %feed,
                        topic = %handle.topic(),
                        consumer = %handle.consumer(),
                        failures,
                        error = %detail,
                        "Consumer callback failed"
                    );

                    if failures >= self.config.eviction_threshold {
                        self.evict(feed, failures);
                        break;
                    }
                }
            }
        }

        self.lanes.remove(&handle.id());
    }

    fn evict(&self, feed: FeedType, failures: u32) {
        let handle = &self.subscriber.handle;
        self.counters.evicted.store(true, Ordering::Relaxed);

        if self.registry.unsubscribe(handle) {
            metrics::record_consumer_evicted(feed);
            self.alerts.raise(Alert::ConsumerEvicted {
                feed,
                topic: handle.topic().clone(),
                consumer: handle.consumer().clone(),
                failures,
            });
        }
    }
}

// =============================================================================
// Blocking Consumers
// =============================================================================

/// Adapter running a synchronous callback on the blocking thread pool, so a
/// callback that blocks can still be time-boxed.
pub struct BlockingConsumer<F> {
    callback: Arc<F>,
}

impl<F> BlockingConsumer<F>
where
    F: Fn(Arc<QuoteRecord>) -> Result<(), ConsumerError> + Send + Sync + 'static,
{
    /// Wrap a synchronous callback.
    #[must_use]
    pub fn new(callback: F) -> Self {
        Self {
            callback: Arc::new(callback),
        }
    }
}

#[async_trait]
impl<F> QuoteConsumer for BlockingConsumer<F>
where
    F: Fn(Arc<QuoteRecord>) -> Result<(), ConsumerError> + Send + Sync + 'static,
{
    async fn on_quote(&self, record: Arc<QuoteRecord>) -> Result<(), ConsumerError> {
        let callback = Arc::clone(&self.callback);
        tokio::task::spawn_blocking(move || (*callback)(record))
            .await
            .map_err(|e| {
                if e.is_panic() {
                    ConsumerError::Panicked("blocking callback panicked".to_string())
                } else {
                    ConsumerError::Failed(e.to_string())
                }
            })?
    }
}

/// Wrap a synchronous callback as a shareable consumer.
pub fn consumer_fn<F>(callback: F) -> Arc<dyn QuoteConsumer>
where
    F: Fn(Arc<QuoteRecord>) -> Result<(), ConsumerError> + Send + Sync + 'static,
{
    Arc::new(BlockingConsumer::new(callback))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::quote::MarketTick;
    use crate::infrastructure::alerts::AlertHub;
    use chrono::{TimeZone, Utc};
    use parking_lot::Mutex;
    use rust_decimal::Decimal;

    #[derive(Default)]
    struct Collecting {
        seen: Mutex<Vec<Arc<QuoteRecord>>>,
    }

    #[async_trait]
    impl QuoteConsumer for Collecting {
        async fn on_quote(&self, record: Arc<QuoteRecord>) -> Result<(), ConsumerError> {
            self.seen.lock().push(record);
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl QuoteConsumer for Failing {
        async fn on_quote(&self, _record: Arc<QuoteRecord>) -> Result<(), ConsumerError> {
            Err(ConsumerError::Failed("boom".to_string()))
        }
    }

    struct Panicking;

    #[async_trait]
    impl QuoteConsumer for Panicking {
        async fn on_quote(&self, _record: Arc<QuoteRecord>) -> Result<(), ConsumerError> {
            panic!("consumer bug");
        }
    }

    struct Hanging;

    #[async_trait]
    impl QuoteConsumer for Hanging {
        async fn on_quote(&self, _record: Arc<QuoteRecord>) -> Result<(), ConsumerError> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    fn tick(topic: &str, millis: i64) -> Arc<QuoteRecord> {
        let ts = Utc.timestamp_millis_opt(millis).unwrap();
        Arc::new(QuoteRecord::tick(
            Topic::from(topic),
            MarketTick::new(Decimal::new(1005, 1), 1),
            ts,
            ts,
        ))
    }

    fn setup(config: BroadcastConfig) -> (Arc<SubscriptionRegistry>, Arc<AlertHub>, Broadcaster) {
        let registry = Arc::new(SubscriptionRegistry::new());
        let alerts = Arc::new(AlertHub::default());
        let broadcaster =
            Broadcaster::new(Arc::clone(&registry), alerts.clone(), config, Handle::current());
        (registry, alerts, broadcaster)
    }

    async fn settle() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn delivers_to_every_subscriber_in_order() {
        let (registry, _alerts, broadcaster) = setup(BroadcastConfig::default());
        let a = Arc::new(Collecting::default());
        let b = Arc::new(Collecting::default());
        registry
            .subscribe(FeedType::MarketData, Topic::from("X"), ConsumerId::new("a"), a.clone())
            .unwrap();
        registry
            .subscribe(FeedType::MarketData, Topic::from("X"), ConsumerId::new("b"), b.clone())
            .unwrap();

        for millis in 1..=3 {
            assert_eq!(broadcaster.publish(&tick("X", millis)), 2);
        }
        settle().await;

        for consumer in [&a, &b] {
            let seen = consumer.seen.lock();
            let order: Vec<i64> = seen.iter().map(|r| r.received_at.timestamp_millis()).collect();
            assert_eq!(order, vec![1, 2, 3]);
        }
    }

    #[tokio::test]
    async fn other_topics_are_not_delivered() {
        let (registry, _alerts, broadcaster) = setup(BroadcastConfig::default());
        let a = Arc::new(Collecting::default());
        registry
            .subscribe(FeedType::MarketData, Topic::from("X"), ConsumerId::new("a"), a.clone())
            .unwrap();

        assert_eq!(broadcaster.publish(&tick("Y", 1)), 0);
        settle().await;
        assert!(a.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn failing_consumer_is_isolated_and_evicted() {
        let (registry, alerts, broadcaster) = setup(BroadcastConfig {
            eviction_threshold: 5,
            ..BroadcastConfig::default()
        });
        let good = Arc::new(Collecting::default());
        let bad = registry
            .subscribe(FeedType::MarketData, Topic::from("X"), ConsumerId::new("bad"), Arc::new(Failing))
            .unwrap();
        registry
            .subscribe(FeedType::MarketData, Topic::from("X"), ConsumerId::new("good"), good.clone())
            .unwrap();

        for millis in 1..=8 {
            broadcaster.publish(&tick("X", millis));
            settle().await;
        }

        assert_eq!(good.seen.lock().len(), 8);
        assert!(!registry.is_active(&bad));
        assert!(broadcaster.consumer_stats(&bad).is_none());

        let evictions: Vec<Alert> = alerts
            .recent()
            .into_iter()
            .filter(|a| matches!(a, Alert::ConsumerEvicted { .. }))
            .collect();
        assert_eq!(
            evictions,
            vec![Alert::ConsumerEvicted {
                feed: FeedType::MarketData,
                topic: Topic::from("X"),
                consumer: ConsumerId::new("bad"),
                failures: 5,
            }]
        );
    }

    #[tokio::test]
    async fn panicking_consumer_is_caught() {
        let (registry, _alerts, broadcaster) = setup(BroadcastConfig {
            eviction_threshold: 100,
            ..BroadcastConfig::default()
        });
        let handle = registry
            .subscribe(FeedType::MarketData, Topic::from("X"), ConsumerId::new("p"), Arc::new(Panicking))
            .unwrap();

        broadcaster.publish(&tick("X", 1));
        broadcaster.publish(&tick("X", 2));
        settle().await;

        let stats = broadcaster.consumer_stats(&handle).unwrap();
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.consecutive_failures, 2);
        assert_eq!(stats.delivered, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_consumer_times_out() {
        let (registry, _alerts, broadcaster) = setup(BroadcastConfig {
            callback_timeout: Duration::from_millis(100),
            eviction_threshold: 100,
            ..BroadcastConfig::default()
        });
        let handle = registry
            .subscribe(FeedType::MarketData, Topic::from("X"), ConsumerId::new("h"), Arc::new(Hanging))
            .unwrap();

        broadcaster.publish(&tick("X", 1));
        tokio::time::sleep(Duration::from_millis(150)).await;

        let stats = broadcaster.consumer_stats(&handle).unwrap();
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_drops_newest() {
        let (registry, _alerts, broadcaster) = setup(BroadcastConfig {
            queue_capacity: 2,
            callback_timeout: Duration::from_secs(60),
            eviction_threshold: 100,
        });
        let handle = registry
            .subscribe(FeedType::MarketData, Topic::from("X"), ConsumerId::new("h"), Arc::new(Hanging))
            .unwrap();

        // First update is taken by the worker, two fill the queue, the rest drop.
        broadcaster.publish(&tick("X", 1));
        settle().await;
        for millis in 2..=6 {
            broadcaster.publish(&tick("X", millis));
        }

        let stats = broadcaster.consumer_stats(&handle).unwrap();
        assert_eq!(stats.dropped, 3);
    }

    #[tokio::test]
    async fn released_lane_stops_delivery() {
        let (registry, _alerts, broadcaster) = setup(BroadcastConfig::default());
        let a = Arc::new(Collecting::default());
        let handle = registry
            .subscribe(FeedType::MarketData, Topic::from("X"), ConsumerId::new("a"), a.clone())
            .unwrap();

        broadcaster.publish(&tick("X", 1));
        settle().await;
        registry.unsubscribe(&handle);
        broadcaster.release(handle.id());
        broadcaster.publish(&tick("X", 2));
        settle().await;

        assert_eq!(a.seen.lock().len(), 1);
        assert_eq!(broadcaster.lane_count(), 0);
    }

    #[tokio::test]
    async fn blocking_consumer_runs_sync_callback() {
        let (registry, _alerts, broadcaster) = setup(BroadcastConfig::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry
            .subscribe(
                FeedType::MarketData,
                Topic::from("X"),
                ConsumerId::new("sync"),
                consumer_fn(move |record| {
                    tx.send(record.topic.clone())
                        .map_err(|e| ConsumerError::Failed(e.to_string()))
                }),
            )
            .unwrap();

        broadcaster.publish(&tick("X", 1));
        let topic = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(topic, Topic::from("X"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn publish_from_foreign_thread_spawns_on_runtime() {
        let (registry, _alerts, broadcaster) = setup(BroadcastConfig::default());
        let broadcaster = Arc::new(broadcaster);
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry
            .subscribe(
                FeedType::MarketData,
                Topic::from("X"),
                ConsumerId::new("sync"),
                consumer_fn(move |record| {
                    tx.send(record.topic.clone())
                        .map_err(|e| ConsumerError::Failed(e.to_string()))
                }),
            )
            .unwrap();

        let publisher = Arc::clone(&broadcaster);
        let queued = std::thread::spawn(move || publisher.publish(&tick("X", 1)))
            .join()
            .unwrap();
        assert_eq!(queued, 1);

        let topic = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(topic, Topic::from("X"));
    }
}
