//! Last-Value Quote Cache
//!
//! Holds the most recent [`QuoteRecord`] per topic.
//!
//! # Concurrency
//!
//! Entries live in a sharded [`DashMap`], so writers for unrelated topics
//! never contend on a common lock. The monotonic guard is evaluated while
//! holding the entry's shard lock, which makes compare-and-replace atomic
//! per topic.
//!
//! # Ordering
//!
//! A record is applied only if its `received_at` is not older than the
//! cached one. Out-of-order frames are discarded and counted.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::QuoteRecord;
use crate::domain::clock::Clock;
use crate::domain::feed::Topic;

/// Advisory signal that a topic has no sufficiently fresh value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StaleDataError {
    /// Nothing has ever been cached for the topic.
    #[error("no cached value for topic {0}")]
    Missing(Topic),

    /// The cached value is older than the requested maximum age.
    #[error("cached value for topic {topic} is {age_ms}ms old (max {max_age_ms}ms)")]
    Stale {
        /// Topic checked.
        topic: Topic,
        /// Age of the cached value.
        age_ms: u64,
        /// Maximum age requested.
        max_age_ms: u64,
    },
}

/// Concurrent last-value cache keyed by topic.
pub struct QuoteCache {
    entries: DashMap<Topic, Arc<QuoteRecord>>,
    clock: Arc<dyn Clock>,
    discarded: AtomicU64,
}

impl QuoteCache {
    /// Create an empty cache reading time from `clock`.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
            discarded: AtomicU64::new(0),
        }
    }

    /// Apply `record` if it is not older than the cached value.
    ///
    /// Returns `true` when the record replaced (or created) the entry.
    pub fn update(&self, record: Arc<QuoteRecord>) -> bool {
        match self.entries.entry(record.topic.clone()) {
            Entry::Occupied(mut occupied) => {
                if record.received_at >= occupied.get().received_at {
                    occupied.insert(record);
                    true
                } else {
                    self.discarded.fetch_add(1, Ordering::Relaxed);
                    tracing::trace!(
                        topic = %record.topic,
                        received_at = %record.received_at,
                        cached_at = %occupied.get().received_at,
                        "Discarding out-of-order record"
                    );
                    false
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(record);
                true
            }
        }
    }

    /// Latest value for `topic`.
    #[must_use]
    pub fn get(&self, topic: &Topic) -> Option<Arc<QuoteRecord>> {
        self.entries.get(topic).map(|entry| Arc::clone(entry.value()))
    }

    /// Check whether `topic` has no value younger than `max_age`.
    ///
    /// A topic with no cached value counts as stale.
    #[must_use]
    pub fn is_stale(&self, topic: &Topic, max_age: Duration) -> bool {
        self.get_fresh(topic, max_age).is_err()
    }

    /// Latest value for `topic`, only if it is younger than `max_age`.
    ///
    /// # Errors
    ///
    /// Returns `StaleDataError` when the topic is missing or too old.
    pub fn get_fresh(
        &self,
        topic: &Topic,
        max_age: Duration,
    ) -> Result<Arc<QuoteRecord>, StaleDataError> {
        let record = self
            .get(topic)
            .ok_or_else(|| StaleDataError::Missing(topic.clone()))?;

        // A record stamped in the future (clock stepped back) has age zero.
        let age = (self.clock.now() - record.received_at)
            .to_std()
            .unwrap_or(Duration::ZERO);

        if age > max_age {
            return Err(StaleDataError::Stale {
                topic: topic.clone(),
                age_ms: u64::try_from(age.as_millis()).unwrap_or(u64::MAX),
                max_age_ms: u64::try_from(max_age.as_millis()).unwrap_or(u64::MAX),
            });
        }

        Ok(record)
    }

    /// Drop the cached value for `topic`.
    pub fn remove(&self, topic: &Topic) -> Option<Arc<QuoteRecord>> {
        self.entries.remove(topic).map(|(_, record)| record)
    }

    /// Number of cached topics.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total out-of-order records discarded.
    #[must_use]
    pub fn discarded_count(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for QuoteCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuoteCache")
            .field("topics", &self.entries.len())
            .field("discarded", &self.discarded_count())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================
