//! Feed Relay
//!
//! The one object the rest of an application talks to. It owns a
//! [`ConnectionSupervisor`] per feed type together with the shared
//! subscription registry, last-value cache, broadcaster and health monitor,
//! and exposes the downstream API.
//!
//! ```text
//!             ┌──────────────── FeedRelay ─────────────────┐
//! subscribe ─▶│ SubscriptionRegistry ──TopicRouter──┐       │
//!             │        │                            ▼       │
//!             │        │                  ConnectionSupervisor ×2 ◀── upstream
//!             │        ▼                            │       │
//! consumers ◀─│   Broadcaster ◀──── QuoteCache ◀────┘       │
//!             │                                             │
//!             │   HealthMonitor (backoff, silence, FAILED)  │
//!             └─────────────────────────────────────────────┘
//! ```

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::application::ports::{AlertSink, CredentialSupplier, FeedAuthorizer, FeedTransport};
use crate::domain::alert::Alert;
use crate::domain::clock::{Clock, SystemClock};
use crate::domain::feed::{ConnectionState, FeedType, Topic};
use crate::domain::quote::{QuoteCache, QuoteRecord, StaleDataError};
use crate::domain::subscription::{
    ConsumerId, QuoteConsumer, SubscriptionChanges, SubscriptionError, SubscriptionHandle,
    SubscriptionRegistry, TopicListener,
};
use crate::infrastructure::alerts::AlertHub;
use crate::infrastructure::broadcast::{BroadcastConfig, Broadcaster, ConsumerStats};
use crate::infrastructure::health::{FeedHealth, HealthConfig, HealthMonitor};
use crate::infrastructure::upstream::{ConnectionSupervisor, SupervisorConfig, SupervisorDeps};

// =============================================================================
// Errors
// =============================================================================

/// Errors returned by the relay facade.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    /// Synthetic data is refused while live data is flowing.
    #[error("live {feed} session is connected; synthetic data refused")]
    LiveSessionActive {
        /// Feed whose session is live.
        feed: FeedType,
    },

    /// The builder is missing a required collaborator.
    #[error("feed relay requires a {0}")]
    MissingComponent(&'static str),

    /// No runtime handle was given and the builder ran outside a runtime.
    #[error("feed relay must be built inside a Tokio runtime or given a handle")]
    NoRuntime,
}

// =============================================================================
// Topic Routing
// =============================================================================

/// Forwards registry transitions to the supervisor of the affected feed.
struct TopicRouter {
    market_data: Weak<ConnectionSupervisor>,
    portfolio: Weak<ConnectionSupervisor>,
}

impl TopicListener for TopicRouter {
    fn topics_changed(&self, feed: FeedType, changes: &SubscriptionChanges) {
        let supervisor = match feed {
            FeedType::MarketData => self.market_data.upgrade(),
            FeedType::Portfolio => self.portfolio.upgrade(),
        };
        if let Some(supervisor) = supervisor {
            supervisor.notify_topics(changes);
        }
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Assembles a [`FeedRelay`].
#[derive(Default)]
pub struct FeedRelayBuilder {
    authorizer: Option<Arc<dyn FeedAuthorizer>>,
    credentials: Option<Arc<dyn CredentialSupplier>>,
    transport: Option<Arc<dyn FeedTransport>>,
    clock: Option<Arc<dyn Clock>>,
    alerts: Option<Arc<AlertHub>>,
    runtime: Option<Handle>,
    supervisor: SupervisorConfig,
    health: HealthConfig,
    broadcast: BroadcastConfig,
}

impl FeedRelayBuilder {
    /// Authorization adapter.
    #[must_use]
    pub fn authorizer(mut self, authorizer: Arc<dyn FeedAuthorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    /// Credential source.
    #[must_use]
    pub fn credentials(mut self, credentials: Arc<dyn CredentialSupplier>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Socket adapter.
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn FeedTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Time source. Defaults to the system clock.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Alert hub to raise into. Defaults to a fresh hub.
    #[must_use]
    pub fn alerts(mut self, alerts: Arc<AlertHub>) -> Self {
        self.alerts = Some(alerts);
        self
    }

    /// Runtime that owns delivery, recovery and session tasks. Defaults to
    /// the runtime `build` is called from.
    #[must_use]
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Supervisor tunables, shared by both feeds.
    #[must_use]
    pub fn supervisor_config(mut self, config: SupervisorConfig) -> Self {
        self.supervisor = config;
        self
    }

    /// Health monitor tunables.
    #[must_use]
    pub fn health_config(mut self, config: HealthConfig) -> Self {
        self.health = config;
        self
    }

    /// Consumer delivery tunables.
    #[must_use]
    pub fn broadcast_config(mut self, config: BroadcastConfig) -> Self {
        self.broadcast = config;
        self
    }

    /// Wire everything together.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::MissingComponent` if the authorizer, credential
    /// supplier or transport was not provided, and `RelayError::NoRuntime`
    /// if no runtime handle is available.
    pub fn build(self) -> Result<FeedRelay, RelayError> {
        let authorizer = self
            .authorizer
            .ok_or(RelayError::MissingComponent("feed authorizer"))?;
        let credentials = self
            .credentials
            .ok_or(RelayError::MissingComponent("credential supplier"))?;
        let transport = self
            .transport
            .ok_or(RelayError::MissingComponent("feed transport"))?;
        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current().map_err(|_| RelayError::NoRuntime)?,
        };
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let alerts = self.alerts.unwrap_or_default();
        let sink: Arc<dyn AlertSink> = alerts.clone();

        let registry = Arc::new(SubscriptionRegistry::new());
        let cache = Arc::new(QuoteCache::new(Arc::clone(&clock)));
        let broadcaster = Arc::new(Broadcaster::new(
            Arc::clone(&registry),
            Arc::clone(&sink),
            self.broadcast,
            runtime.clone(),
        ));

        let deps = SupervisorDeps {
            authorizer,
            credentials,
            transport,
            registry: Arc::clone(&registry),
            cache: Arc::clone(&cache),
            broadcaster: Arc::clone(&broadcaster),
            alerts: Arc::clone(&sink),
            clock: Arc::clone(&clock),
        };
        let market_data = Arc::new(ConnectionSupervisor::new(
            FeedType::MarketData,
            self.supervisor,
            deps.clone(),
        ));
        let portfolio = Arc::new(ConnectionSupervisor::new(
            FeedType::Portfolio,
            self.supervisor,
            deps,
        ));

        registry.set_listener(Arc::new(TopicRouter {
            market_data: Arc::downgrade(&market_data),
            portfolio: Arc::downgrade(&portfolio),
        }));

        let monitor = Arc::new(HealthMonitor::new(
            self.health,
            vec![Arc::clone(&market_data), Arc::clone(&portfolio)],
            sink,
            clock,
            runtime.clone(),
        ));
        monitor.attach();

        Ok(FeedRelay {
            registry,
            cache,
            broadcaster,
            alerts,
            market_data,
            portfolio,
            monitor,
            monitor_task: Mutex::new(None),
            runtime,
        })
    }
}

// =============================================================================
// Relay
// =============================================================================

/// Streaming subsystem facade: one supervisor per feed type plus the shared
/// cache, registry, fan-out and recovery.
pub struct FeedRelay {
    registry: Arc<SubscriptionRegistry>,
    cache: Arc<QuoteCache>,
    broadcaster: Arc<Broadcaster>,
    alerts: Arc<AlertHub>,
    market_data: Arc<ConnectionSupervisor>,
    portfolio: Arc<ConnectionSupervisor>,
    monitor: Arc<HealthMonitor>,
    monitor_task: Mutex<Option<JoinHandle<()>>>,
    runtime: Handle,
}

impl std::fmt::Debug for FeedRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedRelay")
            .field("market_data", &self.market_data)
            .field("portfolio", &self.portfolio)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl FeedRelay {
    /// Start assembling a relay.
    #[must_use]
    pub fn builder() -> FeedRelayBuilder {
        FeedRelayBuilder::default()
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Start both feeds and the health monitor loop. Returns the state each
    /// feed reached; degraded feeds are already scheduled for recovery.
    pub async fn start(&self) -> Vec<(FeedType, ConnectionState)> {
        {
            let mut task = self.monitor_task.lock();
            if task.is_none() {
                *task = Some(self.runtime.spawn(Arc::clone(&self.monitor).run()));
            }
        }

        let (market_data, portfolio) = tokio::join!(self.market_data.start(), self.portfolio.start());
        tracing::info!(
            market_data = %market_data,
            portfolio = %portfolio,
            "Feed relay started"
        );
        vec![
            (FeedType::MarketData, market_data),
            (FeedType::Portfolio, portfolio),
        ]
    }

    /// Start one feed.
    pub async fn start_feed(&self, feed: FeedType) -> ConnectionState {
        self.supervisor(feed).start().await
    }

    /// Stop one feed. Subscriptions stay registered and are resent on the
    /// next start.
    pub async fn stop_feed(&self, feed: FeedType) {
        self.supervisor(feed).stop().await;
    }

    /// Manual restart of a `FAILED` feed: reset it and start again.
    pub async fn restart_feed(&self, feed: FeedType) -> ConnectionState {
        let supervisor = self.supervisor(feed);
        supervisor.reset();
        supervisor.start().await
    }

    /// Stop recovery and both feeds. Final.
    pub async fn shutdown(&self) {
        self.monitor.shutdown().await;
        let task = self.monitor_task.lock().take();
        if let Some(task) = task
            && tokio::time::timeout(Duration::from_secs(5), task).await.is_err()
        {
            tracing::warn!("Health monitor did not stop in time");
        }
        tokio::join!(self.market_data.stop(), self.portfolio.stop());
        tracing::info!("Feed relay shut down");
    }

    // -------------------------------------------------------------------------
    // Subscriptions
    // -------------------------------------------------------------------------

    /// Deliver updates on `topic` to `callback`.
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
        self.registry.subscribe(feed, topic, consumer, callback)
    }

    /// Stop delivery for `handle`, effective for every later update even if
    /// one is already queued. Idempotent.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        let removed = self.registry.unsubscribe(handle);
        self.broadcaster.release(handle.id());
        removed
    }

    /// Remove every subscription of `consumer` on both feeds.
    pub fn remove_consumer(&self, consumer: &ConsumerId) -> Vec<SubscriptionHandle> {
        let removed = self.registry.remove_consumer(consumer);
        for handle in &removed {
            self.broadcaster.release(handle.id());
        }
        removed
    }

    /// Topics with at least one subscriber on `feed`.
    #[must_use]
    pub fn active_topics(&self, feed: FeedType) -> std::collections::HashSet<Topic> {
        self.registry.active_topics(feed)
    }

    /// Delivery counters for a subscription.
    #[must_use]
    pub fn consumer_stats(&self, handle: &SubscriptionHandle) -> Option<ConsumerStats> {
        self.broadcaster.consumer_stats(handle)
    }

    // -------------------------------------------------------------------------
    // Cache reads
    // -------------------------------------------------------------------------

    /// Latest cached value for `topic`.
    #[must_use]
    pub fn get_latest(&self, topic: &Topic) -> Option<Arc<QuoteRecord>> {
        self.cache.get(topic)
    }

    /// Check whether `topic` is missing or older than `max_age`.
    #[must_use]
    pub fn is_stale(&self, topic: &Topic, max_age: Duration) -> bool {
        self.cache.is_stale(topic, max_age)
    }

    /// Latest value for `topic` if it is fresh.
    ///
    /// # Errors
    ///
    /// Returns `StaleDataError` when the topic is missing or too old.
    pub fn get_fresh(
        &self,
        topic: &Topic,
        max_age: Duration,
    ) -> Result<Arc<QuoteRecord>, StaleDataError> {
        self.cache.get_fresh(topic, max_age)
    }

    /// Serve a substitute value while the feed has no live session.
    ///
    /// The record is flagged synthetic and goes through the same cache guard
    /// and fan-out as live data. Returns `false` if the cache already holds
    /// something newer.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::LiveSessionActive` while the feed is `CONNECTED`.
    pub fn publish_synthetic(&self, record: QuoteRecord) -> Result<bool, RelayError> {
        let feed = record.feed;
        if self.supervisor(feed).state() == ConnectionState::Connected {
            return Err(RelayError::LiveSessionActive { feed });
        }

        let record = Arc::new(record.into_synthetic());
        if !self.cache.update(Arc::clone(&record)) {
            return Ok(false);
        }
        self.broadcaster.publish(&record);
        tracing::debug!(feed = %feed, topic = %record.topic, "Synthetic record published");
        Ok(true)
    }

    // -------------------------------------------------------------------------
    // Observability
    // -------------------------------------------------------------------------

    /// Health snapshot of `feed`.
    #[must_use]
    pub fn get_health(&self, feed: FeedType) -> Option<FeedHealth> {
        self.monitor.health(feed)
    }

    /// Current state of `feed`.
    #[must_use]
    pub fn state(&self, feed: FeedType) -> ConnectionState {
        self.supervisor(feed).state()
    }

    /// Receive typed alerts raised from now on.
    #[must_use]
    pub fn subscribe_alerts(&self) -> broadcast::Receiver<Alert> {
        self.alerts.subscribe()
    }

    /// Supervisor of `feed`.
    #[must_use]
    pub const fn supervisor(&self, feed: FeedType) -> &Arc<ConnectionSupervisor> {
        match feed {
            FeedType::MarketData => &self.market_data,
            FeedType::Portfolio => &self.portfolio,
        }
    }

    /// Health monitor driving recovery.
    #[must_use]
    pub const fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }

    /// Subscription registry.
    #[must_use]
    pub const fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// Alert hub.
    #[must_use]
    pub const fn alerts(&self) -> &Arc<AlertHub> {
        &self.alerts
    }
}

// =============================================================================
// Tests
// =============================================================================
