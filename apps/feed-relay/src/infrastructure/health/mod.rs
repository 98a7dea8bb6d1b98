//! Health Monitoring and Auto-Recovery
//!
//! The [`HealthMonitor`] owns the recovery policy for every supervisor. It
//! runs on its own periodic timer and is also called directly by a
//! supervisor the moment it degrades, so the first reconnect does not wait
//! for the next tick.
//!
//! # Recovery Rules
//!
//! ```text
//! DEGRADED,  failures <  max  →  RECONNECTING, resume() after backoff(failures - 1)
//! DEGRADED,  failures >= max  →  FAILED + ConnectionFailed alert
//! CONNECTED, silent > limit   →  SilentConnection alert + forced reconnect
//! ```
//!
//! Pending reconnects are plain tasks that sleep and then call
//! `ConnectionSupervisor::resume()`, which only proceeds while the feed is
//! still `RECONNECTING`.

pub mod server;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::application::ports::{AlertSink, ReconnectScheduler};
use crate::domain::alert::Alert;
use crate::domain::clock::Clock;
use crate::domain::feed::{ConnectionState, FeedType};
use crate::infrastructure::metrics;
use crate::infrastructure::upstream::{BackoffPolicy, ConnectionSupervisor, MetricsSnapshot};

pub use server::{HealthResponse, HealthServer, HealthServerError, HealthServerState, HealthStatus};

// =============================================================================
// Configuration
// =============================================================================

/// Health monitor tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthConfig {
    /// Period of the inspection loop.
    pub interval: Duration,
    /// A connected feed silent for longer than this is forced to reconnect.
    pub silence_threshold: Duration,
    /// Reconnect delay policy.
    pub backoff: BackoffPolicy,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            silence_threshold: Duration::from_secs(30),
            backoff: BackoffPolicy::default(),
        }
    }
}

// =============================================================================
// Health Snapshot
// =============================================================================

/// Read-only health view of one feed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedHealth {
    /// Feed described.
    pub feed: FeedType,
    /// Current state.
    pub state: ConnectionState,
    /// Seconds since the current session connected.
    pub uptime_seconds: u64,
    /// Average message rate over the session.
    pub messages_per_second: f64,
    /// Decode errors per frame received.
    pub error_rate: f64,
    /// Receive time of the last decoded frame.
    pub last_message_at: Option<DateTime<Utc>>,
    /// Receive time of the last inbound traffic, keep-alives included.
    pub last_activity_at: Option<DateTime<Utc>>,
    /// Failures since the last healthy session.
    pub consecutive_failures: u32,
    /// Frames decoded in the current session.
    pub messages_received: u64,
}

impl FeedHealth {
    /// Derive the health view from a metrics snapshot.
    #[must_use]
    pub fn from_snapshot(feed: FeedType, snapshot: &MetricsSnapshot, now: DateTime<Utc>) -> Self {
        Self {
            feed,
            state: snapshot.state,
            uptime_seconds: snapshot.uptime_seconds(now),
            messages_per_second: snapshot.messages_per_second(now),
            error_rate: snapshot.error_rate(),
            last_message_at: snapshot.last_message_at,
            last_activity_at: snapshot.last_activity_at,
            consecutive_failures: snapshot.consecutive_failures,
            messages_received: snapshot.messages_received,
        }
    }

    /// Check whether the feed is delivering.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

// =============================================================================
// Recovery Actions
// =============================================================================

/// What the monitor decided for a feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RecoveryAction {
    /// A reconnect will start after `delay`.
    ScheduleReconnect {
        /// Feed being recovered.
        feed: FeedType,
        /// Consecutive failures so far.
        attempt: u32,
        /// Backoff before the attempt.
        #[serde(serialize_with = "serialize_millis")]
        delay: Duration,
    },
    /// Recovery gave up.
    MarkFailed {
        /// Feed that failed.
        feed: FeedType,
        /// Failures that led here.
        attempts: u32,
    },
    /// A silent session was dropped.
    ForceReconnect {
        /// Feed that went silent.
        feed: FeedType,
        /// How long it had been silent.
        #[serde(serialize_with = "serialize_millis")]
        silent_for: Duration,
    },
}

impl RecoveryAction {
    /// Feed the action applies to.
    #[must_use]
    pub const fn feed(&self) -> FeedType {
        match self {
            Self::ScheduleReconnect { feed, .. }
            | Self::MarkFailed { feed, .. }
            | Self::ForceReconnect { feed, .. } => *feed,
        }
    }
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

// =============================================================================
// Health Monitor
// =============================================================================

/// Periodic inspector and reconnect scheduler for all supervisors.
pub struct HealthMonitor {
    config: HealthConfig,
    supervisors: Vec<Arc<ConnectionSupervisor>>,
    alerts: Arc<dyn AlertSink>,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
    pending: TaskTracker,
    runtime: Handle,
    actions: broadcast::Sender<RecoveryAction>,
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("config", &self.config)
            .field("supervisors", &self.supervisors.len())
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl HealthMonitor {
    /// Create a monitor for `supervisors`. Call [`Self::attach`] afterwards
    /// so degrading supervisors reach it. Reconnect timers run on `runtime`.
    #[must_use]
    pub fn new(
        config: HealthConfig,
        supervisors: Vec<Arc<ConnectionSupervisor>>,
        alerts: Arc<dyn AlertSink>,
        clock: Arc<dyn Clock>,
        runtime: Handle,
    ) -> Self {
        let (actions, _) = broadcast::channel(64);
        Self {
            config,
            supervisors,
            alerts,
            clock,
            cancel: CancellationToken::new(),
            pending: TaskTracker::new(),
            runtime,
            actions,
        }
    }

    /// Register as the reconnect scheduler of every supervisor.
    pub fn attach(self: &Arc<Self>) {
        for supervisor in &self.supervisors {
            let weak = Arc::downgrade(self);
            supervisor.set_scheduler(weak);
        }
    }

    /// Monitor configuration.
    #[must_use]
    pub const fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Receive every recovery decision from now on.
    #[must_use]
    pub fn subscribe_actions(&self) -> broadcast::Receiver<RecoveryAction> {
        self.actions.subscribe()
    }

    /// Health view of `feed`.
    #[must_use]
    pub fn health(&self, feed: FeedType) -> Option<FeedHealth> {
        let now = self.clock.now();
        self.supervisor(feed)
            .map(|s| FeedHealth::from_snapshot(feed, &s.snapshot(), now))
    }

    /// Health view of every monitored feed.
    #[must_use]
    pub fn report(&self) -> Vec<FeedHealth> {
        let now = self.clock.now();
        self.supervisors
            .iter()
            .map(|s| FeedHealth::from_snapshot(s.feed(), &s.snapshot(), now))
            .collect()
    }

    /// Inspect every feed once.
    pub fn evaluate(&self) -> Vec<RecoveryAction> {
        self.supervisors
            .iter()
            .filter_map(|s| self.evaluate_feed(s))
            .collect()
    }

    /// Run the inspection loop until [`Self::shutdown`].
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(
            interval_ms = u64::try_from(self.config.interval.as_millis()).unwrap_or(u64::MAX),
            "Health monitor started"
        );

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.evaluate();
                }
            }
        }

        tracing::info!("Health monitor stopped");
    }

    /// Stop the loop and abandon pending reconnects.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.pending.close();
        self.pending.wait().await;
    }

    fn supervisor(&self, feed: FeedType) -> Option<&Arc<ConnectionSupervisor>> {
        self.supervisors.iter().find(|s| s.feed() == feed)
    }

    fn evaluate_feed(&self, supervisor: &Arc<ConnectionSupervisor>) -> Option<RecoveryAction> {
        let feed = supervisor.feed();
        let snapshot = supervisor.snapshot();

        let action = match snapshot.state {
            ConnectionState::Degraded => self.recover(supervisor, snapshot.consecutive_failures)?,
            ConnectionState::Connected => {
                let since = snapshot.last_activity_at.or(snapshot.uptime_start)?;
                let silent_for = (self.clock.now() - since).to_std().unwrap_or_default();
                if silent_for <= self.config.silence_threshold {
                    return None;
                }
                self.alerts.raise(Alert::SilentConnection { feed, silent_for });
                if !supervisor.force_reconnect("no traffic within the silence threshold") {
                    return None;
                }
                RecoveryAction::ForceReconnect { feed, silent_for }
            }
            _ => return None,
        };

        let _ = self.actions.send(action);
        Some(action)
    }

    fn recover(
        &self,
        supervisor: &Arc<ConnectionSupervisor>,
        failures: u32,
    ) -> Option<RecoveryAction> {
        let feed = supervisor.feed();

        if !self.config.backoff.should_retry(failures) {
            if !supervisor.mark_failed() {
                return None;
            }
            tracing::error!(
                feed = %feed,
                attempts = failures,
                "Feed recovery exhausted, manual restart required"
            );
            self.alerts.raise(Alert::ConnectionFailed {
                feed,
                attempts: failures,
            });
            return Some(RecoveryAction::MarkFailed {
                feed,
                attempts: failures,
            });
        }

        if self.cancel.is_cancelled() || !supervisor.mark_reconnecting() {
            return None;
        }

        let delay = self.config.backoff.delay(failures.saturating_sub(1));
        metrics::record_reconnect(feed);
        tracing::info!(
            feed = %feed,
            attempt = failures,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "Scheduling reconnect"
        );

        let supervisor = Arc::clone(supervisor);
        let cancel = self.cancel.child_token();
        self.pending.spawn_on(
            async move {
                tokio::select! {
                    () = cancel.cancelled() => {}
                    () = tokio::time::sleep(delay) => {
                        supervisor.resume().await;
                    }
                }
            },
            &self.runtime,
        );

        Some(RecoveryAction::ScheduleReconnect {
            feed,
            attempt: failures,
            delay,
        })
    }
}

impl ReconnectScheduler for HealthMonitor {
    fn schedule_reconnect(&self, feed: FeedType) {
        if let Some(supervisor) = self.supervisor(feed) {
            self.evaluate_feed(supervisor);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
