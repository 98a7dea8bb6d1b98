//! Subscription Registry
//!
//! Tracks, per feed type, which topics have at least one interested consumer
//! and which consumer callbacks are registered for each topic.
//!
//! # Design
//!
//! The registry tracks:
//! - One [`Subscriber`] per `(topic, consumer)` pair, per feed type
//! - Upstream transitions: a topic's first subscriber (0→1) and last
//!   removal (1→0) are reported to a [`TopicListener`]
//!
//! This allows many consumers to share a topic while the upstream socket
//! only ever carries one subscription for it.
//!
//! # Concurrency
//!
//! Each feed type has its own sharded map keyed by topic. Mutations lock
//! only the shard holding the topic, so unrelated instruments never
//! serialize behind one another. Listener notifications are sent after the
//! shard lock is released; listeners must not assume they observe changes
//! in global order and should reconcile against [`SubscriptionRegistry::has_subscribers`].

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::feed::{FeedType, Topic};
use super::quote::QuoteRecord;

/// Maximum accepted topic length.
const MAX_TOPIC_LEN: usize = 128;

// =============================================================================
// Types
// =============================================================================

/// Identifier chosen by a consumer when it subscribes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConsumerId(String);

impl ConsumerId {
    /// Create a consumer ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw ID.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConsumerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Handle returned by `subscribe` and used to unsubscribe.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: u64,
    feed: FeedType,
    topic: Topic,
    consumer: ConsumerId,
}

impl SubscriptionHandle {
    /// Registry-unique ID.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Feed type of the subscription.
    #[must_use]
    pub const fn feed(&self) -> FeedType {
        self.feed
    }

    /// Subscribed topic.
    #[must_use]
    pub const fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Consumer that owns the subscription.
    #[must_use]
    pub const fn consumer(&self) -> &ConsumerId {
        &self.consumer
    }
}

/// Failure reported by a consumer callback.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConsumerError {
    /// The consumer could not handle the record.
    #[error("consumer failed: {0}")]
    Failed(String),

    /// The consumer panicked while handling the record.
    #[error("consumer panicked: {0}")]
    Panicked(String),
}

/// Callback invoked with every update for a subscribed topic.
///
/// Implementations may be slow or blocking; the broadcaster time-boxes each
/// call and isolates failures per subscription.
#[async_trait]
pub trait QuoteConsumer: Send + Sync {
    /// Handle one update.
    async fn on_quote(&self, record: Arc<QuoteRecord>) -> Result<(), ConsumerError>;
}

/// A registered subscription and its callback.
#[derive(Clone)]
pub struct Subscriber {
    /// Handle identifying the subscription.
    pub handle: SubscriptionHandle,
    /// Callback to deliver updates to.
    pub consumer: Arc<dyn QuoteConsumer>,
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

/// Rejection of a subscribe request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubscriptionError {
    /// Topic is empty, too long or contains whitespace.
    #[error("invalid topic {topic:?}: {reason}")]
    InvalidTopic {
        /// Rejected topic.
        topic: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// Topic does not belong to the requested feed.
    #[error("topic {topic} is not available on the {feed} feed")]
    UnknownTopic {
        /// Rejected topic.
        topic: Topic,
        /// Requested feed.
        feed: FeedType,
    },
}

// =============================================================================
// Subscription Changes
// =============================================================================

/// Changes to upstream subscriptions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionChanges {
    /// Topics to subscribe to.
    pub subscribe: HashSet<Topic>,
    /// Topics to unsubscribe from.
    pub unsubscribe: HashSet<Topic>,
}

impl SubscriptionChanges {
    /// Check if there are any changes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscribe.is_empty() && self.unsubscribe.is_empty()
    }

    /// Create changes with only subscribes.
    #[must_use]
    pub fn subscribe_only(topics: impl IntoIterator<Item = Topic>) -> Self {
        Self {
            subscribe: topics.into_iter().collect(),
            unsubscribe: HashSet::new(),
        }
    }

    /// Create changes with only unsubscribes.
    #[must_use]
    pub fn unsubscribe_only(topics: impl IntoIterator<Item = Topic>) -> Self {
        Self {
            subscribe: HashSet::new(),
            unsubscribe: topics.into_iter().collect(),
        }
    }
}

/// Receives upstream subscription transitions.
pub trait TopicListener: Send + Sync {
    /// Called after a topic gains its first subscriber or loses its last.
    ///
    /// Must not call back into the registry's mutating methods.
    fn topics_changed(&self, feed: FeedType, changes: &SubscriptionChanges);
}

// =============================================================================
// Registry
// =============================================================================

#[derive(Default)]
struct TopicEntry {
    subscribers: Vec<Subscriber>,
}

/// Thread-safe registry of subscriptions for both feed types.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use feed_relay::domain::feed::{FeedType, Topic};
/// use feed_relay::domain::quote::QuoteRecord;
/// use feed_relay::domain::subscription::{ConsumerError, QuoteConsumer, SubscriptionRegistry};
///
/// struct Ignore;
///
/// #[async_trait::async_trait]
/// impl QuoteConsumer for Ignore {
///     async fn on_quote(&self, _record: Arc<QuoteRecord>) -> Result<(), ConsumerError> {
///         Ok(())
///     }
/// }
///
/// let registry = SubscriptionRegistry::new();
/// let first = registry
///     .subscribe(FeedType::MarketData, Topic::from("NSE_EQ|INE002A01018"), "ui".into(), Arc::new(Ignore))
///     .unwrap();
/// let again = registry
///     .subscribe(FeedType::MarketData, Topic::from("NSE_EQ|INE002A01018"), "ui".into(), Arc::new(Ignore))
///     .unwrap();
/// assert_eq!(first, again);
/// assert_eq!(registry.active_topics(FeedType::MarketData).len(), 1);
/// ```
pub struct SubscriptionRegistry {
    market_data: DashMap<Topic, TopicEntry>,
    portfolio: DashMap<Topic, TopicEntry>,
    next_id: AtomicU64,
    listener: RwLock<Option<Arc<dyn TopicListener>>>,
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            market_data: DashMap::new(),
            portfolio: DashMap::new(),
            next_id: AtomicU64::new(1),
            listener: RwLock::new(None),
        }
    }

    /// Install the listener notified of upstream transitions.
    pub fn set_listener(&self, listener: Arc<dyn TopicListener>) {
        *self.listener.write() = Some(listener);
    }

    /// Register `consumer` for updates on `topic`.
    ///
    /// Subscribing the same `(topic, consumer)` pair again returns the
    /// existing handle and keeps the original callback.
    ///
    /// # Errors
    ///
    /// Returns `SubscriptionError` if the topic is malformed or does not
    /// belong to `feed`.
    pub fn subscribe(
        &self,
        feed: FeedType,
        topic: Topic,
        consumer: ConsumerId,
        callback: Arc<dyn QuoteConsumer>,
    ) -> Result<SubscriptionHandle, SubscriptionError> {
        validate_topic(feed, &topic)?;

        let (handle, first) = {
            let mut entry = self.topics(feed).entry(topic.clone()).or_default();

            if let Some(existing) = entry
                .subscribers
                .iter()
                .find(|s| s.handle.consumer == consumer)
            {
                return Ok(existing.handle.clone());
            }

            let handle = SubscriptionHandle {
                id: self.next_id.fetch_add(1, Ordering::Relaxed),
                feed,
                topic: topic.clone(),
                consumer,
            };
            entry.subscribers.push(Subscriber {
                handle: handle.clone(),
                consumer: callback,
            });
            (handle, entry.subscribers.len() == 1)
        };

        tracing::debug!(
            feed = %feed,
            topic = %topic,
            consumer = %handle.consumer,
            handle = handle.id,
            "Subscription added"
        );

        if first {
            self.notify(feed, &SubscriptionChanges::subscribe_only([topic]));
        }

        Ok(handle)
    }

    /// Remove a subscription.
    ///
    /// Returns `false` if the handle was not registered. Idempotent.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        let topics = self.topics(handle.feed);

        let (removed, now_empty) = {
            let Some(mut entry) = topics.get_mut(&handle.topic) else {
                return false;
            };
            let before = entry.subscribers.len();
            entry.subscribers.retain(|s| s.handle.id != handle.id);
            (
                entry.subscribers.len() != before,
                entry.subscribers.is_empty(),
            )
        };

        if now_empty {
            topics.remove_if(&handle.topic, |_, entry| entry.subscribers.is_empty());
        }

        if removed {
            tracing::debug!(
                feed = %handle.feed,
                topic = %handle.topic,
                consumer = %handle.consumer,
                handle = handle.id,
                "Subscription removed"
            );
        }

        if removed && now_empty {
            self.notify(
                handle.feed,
                &SubscriptionChanges::unsubscribe_only([handle.topic.clone()]),
            );
        }

        removed
    }

    /// Remove every subscription owned by `consumer` on both feeds.
    ///
    /// Returns the handles that were removed.
    pub fn remove_consumer(&self, consumer: &ConsumerId) -> Vec<SubscriptionHandle> {
        let owned: Vec<SubscriptionHandle> = FeedType::ALL
            .iter()
            .flat_map(|feed| {
                self.topics(*feed)
                    .iter()
                    .flat_map(|entry| {
                        entry
                            .subscribers
                            .iter()
                            .filter(|s| &s.handle.consumer == consumer)
                            .map(|s| s.handle.clone())
                            .collect::<Vec<_>>()
                    })
                    .collect::<Vec<_>>()
            })
            .collect();

        owned
            .into_iter()
            .filter(|handle| self.unsubscribe(handle))
            .collect()
    }

    /// Topics with at least one subscriber on `feed`.
    #[must_use]
    pub fn active_topics(&self, feed: FeedType) -> HashSet<Topic> {
        self.topics(feed)
            .iter()
            .filter(|entry| !entry.subscribers.is_empty())
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Snapshot of the subscribers for `topic` on `feed`.
    #[must_use]
    pub fn subscribers(&self, feed: FeedType, topic: &Topic) -> Vec<Subscriber> {
        self.topics(feed)
            .get(topic)
            .map(|entry| entry.subscribers.clone())
            .unwrap_or_default()
    }

    /// Check whether `topic` currently has any subscriber on `feed`.
    #[must_use]
    pub fn has_subscribers(&self, feed: FeedType, topic: &Topic) -> bool {
        self.topics(feed)
            .get(topic)
            .is_some_and(|entry| !entry.subscribers.is_empty())
    }

    /// Check whether `handle` is still registered.
    #[must_use]
    pub fn is_active(&self, handle: &SubscriptionHandle) -> bool {
        self.topics(handle.feed)
            .get(&handle.topic)
            .is_some_and(|entry| entry.subscribers.iter().any(|s| s.handle.id == handle.id))
    }

    /// Get statistics for a feed type.
    #[must_use]
    pub fn stats(&self, feed: FeedType) -> SubscriptionStats {
        let mut stats = SubscriptionStats::default();
        let mut consumers = HashSet::new();
        for entry in self.topics(feed).iter() {
            if entry.subscribers.is_empty() {
                continue;
            }
            stats.topic_count += 1;
            stats.subscription_count += entry.subscribers.len();
            consumers.extend(entry.subscribers.iter().map(|s| s.handle.consumer.clone()));
        }
        stats.consumer_count = consumers.len();
        stats
    }

    const fn topics(&self, feed: FeedType) -> &DashMap<Topic, TopicEntry> {
        match feed {
            FeedType::MarketData => &self.market_data,
            FeedType::Portfolio => &self.portfolio,
        }
    }

    fn notify(&self, feed: FeedType, changes: &SubscriptionChanges) {
        let listener = self.listener.read().clone();
        if let Some(listener) = listener {
            listener.topics_changed(feed, changes);
        }
    }
}

fn validate_topic(feed: FeedType, topic: &Topic) -> Result<(), SubscriptionError> {
    let raw = topic.as_str();
    let invalid = |reason| SubscriptionError::InvalidTopic {
        topic: raw.to_string(),
        reason,
    };

    if raw.is_empty() {
        return Err(invalid("empty"));
    }
    if raw.len() > MAX_TOPIC_LEN {
        return Err(invalid("too long"));
    }
    if raw.chars().any(char::is_whitespace) {
        return Err(invalid("contains whitespace"));
    }

    let belongs = match feed {
        FeedType::Portfolio => topic.is_portfolio(),
        FeedType::MarketData => !topic.is_portfolio(),
    };
    if !belongs {
        return Err(SubscriptionError::UnknownTopic {
            topic: topic.clone(),
            feed,
        });
    }

    Ok(())
}

// =============================================================================
// Statistics
// =============================================================================

/// Statistics for a single feed type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SubscriptionStats {
    /// Number of topics with at least one subscriber.
    pub topic_count: usize,
    /// Number of subscriptions across all topics.
    pub subscription_count: usize,
    /// Number of distinct consumers.
    pub consumer_count: usize,
}

// =============================================================================
// Tests
// =============================================================================
