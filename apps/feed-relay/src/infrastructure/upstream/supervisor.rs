//! Connection Supervisor
//!
//! Owns the socket lifecycle for one feed type.
//!
//! # State Machine
//!
//! ```text
//!                 start()                 authorized             handshake
//! DISCONNECTED ───────────▶ AUTHORIZING ─────────────▶ CONNECTING ─────────▶ CONNECTED
//!      ▲                        │                          │                    │
//!      │ stop() (any state)     │ rejected / unavailable   │ connect failed     │ socket error / close
//!      │                        ▼                          ▼                    ▼
//!      │                     DEGRADED ◀────────────────────┴────────────────────┘
//!      │                        │  health monitor
//!      │ reset()                ▼
//!    FAILED ◀── max attempts ─ RECONNECTING ── backoff elapsed ──▶ AUTHORIZING
//! ```
//!
//! Every transition is a compare-and-swap on an atomic state, so a `stop()`
//! racing an in-flight `start()` always wins: the start notices that the
//! state moved and abandons the attempt.
//!
//! # Session Task
//!
//! Once `CONNECTED`, a dedicated task owns the socket. It sends the initial
//! subscribe for every active topic, then selects over cancellation,
//! subscription commands and inbound frames. Subscription commands carry only
//! the topics that changed; the task reconciles them against the registry and
//! the set it has already sent, so upstream only ever sees incremental,
//! minimal subscribe/unsubscribe messages.
//!
//! The supervisor never retries on its own. Failures become a `DEGRADED`
//! transition, an alert, and a call to the [`ReconnectScheduler`].

use std::collections::HashSet;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::codec::MessageDecoder;
use super::connection_metrics::{ConnectionMetrics, MetricsSnapshot};
use super::retry::RetryPolicy;
use crate::application::ports::{
    AlertSink, AuthorizationError, ConnectionError, ControlAction, ControlMessage,
    CredentialSupplier, FeedAuthorizer, FeedConnection, FeedTransport, Inbound,
    ReconnectScheduler,
};
use crate::domain::alert::Alert;
use crate::domain::clock::Clock;
use crate::domain::feed::{ConnectionState, FeedMode, FeedSession, FeedType, StateTransition, Topic};
use crate::domain::quote::QuoteCache;
use crate::domain::subscription::{SubscriptionChanges, SubscriptionRegistry};
use crate::infrastructure::broadcast::Broadcaster;
use crate::infrastructure::metrics;

// =============================================================================
// Configuration
// =============================================================================

/// Tunables for one supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// Market data mode requested on authorization and subscribe.
    pub mode: FeedMode,
    /// Call-site retry for transient authorization failures.
    pub auth_retry: RetryPolicy,
    /// Upper bound on waiting for the session task after `stop()`.
    pub stop_timeout: Duration,
    /// Buffer of the state transition channel.
    pub transition_buffer: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            mode: FeedMode::Full,
            auth_retry: RetryPolicy::default(),
            stop_timeout: Duration::from_secs(5),
            transition_buffer: 64,
        }
    }
}

/// Collaborators a supervisor works with.
#[derive(Clone)]
pub struct SupervisorDeps {
    /// Exchanges credentials for sessions.
    pub authorizer: Arc<dyn FeedAuthorizer>,
    /// Source of the current credential.
    pub credentials: Arc<dyn CredentialSupplier>,
    /// Opens sockets.
    pub transport: Arc<dyn FeedTransport>,
    /// Topic bookkeeping.
    pub registry: Arc<SubscriptionRegistry>,
    /// Last-value cache.
    pub cache: Arc<QuoteCache>,
    /// Consumer fan-out.
    pub broadcaster: Arc<Broadcaster>,
    /// Alert sink.
    pub alerts: Arc<dyn AlertSink>,
    /// Time source for `received_at` stamps.
    pub clock: Arc<dyn Clock>,
}

// =============================================================================
// Session
// =============================================================================

enum Command {
    /// Reconcile these topics against the registry.
    Sync(Vec<Topic>),
}

struct ActiveSession {
    generation: u64,
    session: FeedSession,
    cancel: CancellationToken,
    commands: mpsc::UnboundedSender<Command>,
    task: Option<JoinHandle<()>>,
}

// =============================================================================
// Supervisor
// =============================================================================

/// Lifecycle owner for one feed type's upstream session.
pub struct ConnectionSupervisor {
    feed: FeedType,
    config: SupervisorConfig,
    deps: SupervisorDeps,
    decoder: MessageDecoder,
    state: AtomicU8,
    metrics: ConnectionMetrics,
    generation: AtomicU64,
    session: Mutex<Option<ActiveSession>>,
    rejected_credential: Mutex<Option<u64>>,
    scheduler: RwLock<Option<Weak<dyn ReconnectScheduler>>>,
    transitions: broadcast::Sender<StateTransition>,
}

impl std::fmt::Debug for ConnectionSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSupervisor")
            .field("feed", &self.feed)
            .field("state", &self.state())
            .field("metrics", &self.metrics)
            .finish_non_exhaustive()
    }
}

impl ConnectionSupervisor {
    /// Create a disconnected supervisor.
    #[must_use]
    pub fn new(feed: FeedType, config: SupervisorConfig, deps: SupervisorDeps) -> Self {
        let (transitions, _) = broadcast::channel(config.transition_buffer.max(1));
        Self {
            feed,
            config,
            deps,
            decoder: MessageDecoder::new(),
            state: AtomicU8::new(ConnectionState::Disconnected.as_u8()),
            metrics: ConnectionMetrics::default(),
            generation: AtomicU64::new(0),
            session: Mutex::new(None),
            rejected_credential: Mutex::new(None),
            scheduler: RwLock::new(None),
            transitions,
        }
    }

    /// Feed this supervisor owns.
    #[must_use]
    pub const fn feed(&self) -> FeedType {
        self.feed
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Consistent copy of the connection metrics.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot(self.state())
    }

    /// Correlation ID of the live session, if any.
    #[must_use]
    pub fn session_id(&self) -> Option<Uuid> {
        self.session.lock().as_ref().map(|s| s.session.session_id)
    }

    /// Receive every state transition from now on.
    #[must_use]
    pub fn subscribe_transitions(&self) -> broadcast::Receiver<StateTransition> {
        self.transitions.subscribe()
    }

    /// Install the recovery scheduler. Held weakly.
    pub fn set_scheduler(&self, scheduler: Weak<dyn ReconnectScheduler>) {
        *self.scheduler.write() = Some(scheduler);
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Begin a session attempt from `DISCONNECTED`, `DEGRADED` or
    /// `RECONNECTING`. Returns the state the attempt ended in.
    ///
    /// From any other state (including `FAILED`) this is a no-op that
    /// returns the current state.
    pub async fn start(self: &Arc<Self>) -> ConnectionState {
        self.start_from(None).await
    }

    /// Begin the attempt a scheduled reconnect is waiting for. Does nothing
    /// unless the state is still `RECONNECTING`, so a `stop()` during the
    /// backoff wins.
    pub async fn resume(self: &Arc<Self>) -> ConnectionState {
        self.start_from(Some(ConnectionState::Reconnecting)).await
    }

    async fn start_from(self: &Arc<Self>, expected: Option<ConnectionState>) -> ConnectionState {
        let current = self.state();
        let allowed = expected.map_or_else(|| current.can_start(), |e| e == current);
        if !allowed || !self.transition(current, ConnectionState::Authorizing) {
            tracing::debug!(feed = %self.feed, state = %current, "Start ignored");
            return self.state();
        }
        self.metrics.reset_attempt();

        let Some(credential) = self.deps.credentials.current() else {
            return self.fail_authorization(AuthorizationError::MissingCredential.to_string());
        };
        let fingerprint = credential.fingerprint();
        if *self.rejected_credential.lock() == Some(fingerprint) {
            return self
                .fail_authorization("credential was already rejected; waiting for a fresh one".to_string());
        }

        let result = self
            .config
            .auth_retry
            .run("authorize", AuthorizationError::is_retryable, || {
                self.deps
                    .authorizer
                    .authorize(self.feed, self.config.mode, &credential)
            })
            .await;

        let session = match result {
            Ok(session) => session,
            Err(e @ AuthorizationError::Rejected { .. }) => {
                *self.rejected_credential.lock() = Some(fingerprint);
                return self.fail_authorization(e.to_string());
            }
            Err(e @ AuthorizationError::MissingCredential) => {
                return self.fail_authorization(e.to_string());
            }
            Err(e) => {
                return self.degrade(
                    ConnectionState::Authorizing,
                    &ConnectionError::Authorization(e.to_string()),
                );
            }
        };

        if session.is_expired(self.deps.clock.now()) {
            tracing::warn!(
                feed = %self.feed,
                session_id = %session.session_id,
                "Authorized session already expired"
            );
            return self.degrade(ConnectionState::Authorizing, &ConnectionError::SessionExpired);
        }

        if !self.transition(ConnectionState::Authorizing, ConnectionState::Connecting) {
            tracing::debug!(feed = %self.feed, "Start abandoned after authorization");
            return self.state();
        }

        let conn = match self.deps.transport.connect(&session).await {
            Ok(conn) => conn,
            Err(e) => return self.degrade(ConnectionState::Connecting, &e),
        };

        if let Err(mut conn) = self.install_session(session, conn) {
            conn.close().await;
            tracing::debug!(feed = %self.feed, "Start abandoned after connect");
            return self.state();
        }

        ConnectionState::Connected
    }

    /// Move to `CONNECTED` and hand the socket to a session task. Gives the
    /// socket back if the state moved underneath us.
    fn install_session(
        self: &Arc<Self>,
        session: FeedSession,
        conn: Box<dyn FeedConnection>,
    ) -> Result<(), Box<dyn FeedConnection>> {
        let mut slot = self.session.lock();
        if !self.transition(ConnectionState::Connecting, ConnectionState::Connected) {
            return Err(conn);
        }

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let cancel = CancellationToken::new();
        let (commands, command_rx) = mpsc::unbounded_channel();
        self.metrics.mark_connected(self.deps.clock.now());

        tracing::info!(
            feed = %self.feed,
            session_id = %session.session_id,
            "Feed connected"
        );

        let task = tokio::spawn(Arc::clone(self).run_session(
            generation,
            conn,
            command_rx,
            cancel.clone(),
        ));

        let replaced = slot.replace(ActiveSession {
            generation,
            session,
            cancel,
            commands,
            task: Some(task),
        });
        if let Some(old) = replaced {
            old.cancel.cancel();
            tracing::warn!(
                feed = %self.feed,
                session_id = %old.session.session_id,
                "Replaced a session that was still installed"
            );
        }
        Ok(())
    }

    /// Tear down the session and move to `DISCONNECTED`. Idempotent.
    pub async fn stop(&self) {
        // Same lock as install_session, so a racing connect either lands
        // before the take or loses its CONNECTING->CONNECTED swap.
        let (active, previous) = {
            let mut slot = self.session.lock();
            let active = slot.take();
            (active, self.force_state(ConnectionState::Disconnected))
        };
        self.metrics.mark_disconnected();

        if let Some(mut active) = active {
            active.cancel.cancel();
            if let Some(task) = active.task.take() {
                if tokio::time::timeout(self.config.stop_timeout, task).await.is_err() {
                    tracing::warn!(feed = %self.feed, "Session task did not stop in time");
                }
            }
            tracing::info!(
                feed = %self.feed,
                session_id = %active.session.session_id,
                "Feed session released"
            );
        }

        if previous != ConnectionState::Disconnected {
            tracing::info!(feed = %self.feed, from = %previous, "Feed stopped");
        }
    }

    /// Manual restart: `FAILED` back to `DISCONNECTED` with the failure
    /// streak and any rejected credential forgotten.
    pub fn reset(&self) -> bool {
        if !self.transition(ConnectionState::Failed, ConnectionState::Disconnected) {
            return false;
        }
        self.metrics.clear_failures();
        *self.rejected_credential.lock() = None;
        tracing::info!(feed = %self.feed, "Feed reset after failure");
        true
    }

    // -------------------------------------------------------------------------
    // Recovery hooks used by the health monitor
    // -------------------------------------------------------------------------

    /// `DEGRADED` to `RECONNECTING`.
    pub fn mark_reconnecting(&self) -> bool {
        self.transition(ConnectionState::Degraded, ConnectionState::Reconnecting)
    }

    /// `DEGRADED` or `RECONNECTING` to `FAILED`.
    pub fn mark_failed(&self) -> bool {
        self.transition(ConnectionState::Degraded, ConnectionState::Failed)
            || self.transition(ConnectionState::Reconnecting, ConnectionState::Failed)
    }

    /// Drop a live session that looks dead and degrade, which schedules a
    /// reconnect. Returns `false` unless the feed was `CONNECTED`.
    pub fn force_reconnect(&self, reason: &str) -> bool {
        let active = {
            let mut slot = self.session.lock();
            if self.state() != ConnectionState::Connected {
                return false;
            }
            slot.take()
        };
        if let Some(active) = active {
            active.cancel.cancel();
        }
        self.metrics.mark_disconnected();
        self.degrade(
            ConnectionState::Connected,
            &ConnectionError::Closed(format!("forced reconnect: {reason}")),
        ) == ConnectionState::Degraded
    }

    // -------------------------------------------------------------------------
    // Subscriptions
    // -------------------------------------------------------------------------

    /// Forward a subscription change to the live session, if any. Without a
    /// session the registry already holds the topics for the next start.
    pub fn notify_topics(&self, changes: &SubscriptionChanges) {
        let topics: Vec<Topic> = changes
            .subscribe
            .iter()
            .chain(changes.unsubscribe.iter())
            .cloned()
            .collect();
        if topics.is_empty() {
            return;
        }
        metrics::set_active_topics(self.feed, self.deps.registry.stats(self.feed).topic_count);

        if let Some(active) = self.session.lock().as_ref() {
            // Closed channel means the session is ending; the next one resends.
            let _ = active.commands.send(Command::Sync(topics));
        }
    }

    fn control(&self, action: ControlAction, topics: impl IntoIterator<Item = Topic>) -> ControlMessage {
        let mode = match self.feed {
            FeedType::MarketData => Some(self.config.mode),
            FeedType::Portfolio => None,
        };
        ControlMessage::new(action, topics, mode)
    }

    // -------------------------------------------------------------------------
    // Session task
    // -------------------------------------------------------------------------

    async fn run_session(
        self: Arc<Self>,
        generation: u64,
        mut conn: Box<dyn FeedConnection>,
        mut commands: mpsc::UnboundedReceiver<Command>,
        cancel: CancellationToken,
    ) {
        let mut sent: HashSet<Topic> = HashSet::new();

        let initial = self.deps.registry.active_topics(self.feed);
        if !initial.is_empty() {
            tracing::info!(feed = %self.feed, topics = initial.len(), "Sending initial subscribe");
            let message = self.control(ControlAction::Subscribe, initial.iter().cloned());
            if let Err(e) = conn.send(&message).await {
                self.session_failed(generation, &e);
                conn.close().await;
                return;
            }
            sent = initial;
        }

        let mut healthy = false;
        loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => {
                    conn.close().await;
                    tracing::debug!(feed = %self.feed, "Session task cancelled");
                    return;
                }

                Some(Command::Sync(topics)) = commands.recv() => {
                    if let Err(e) = self.reconcile(&mut conn, &mut sent, topics).await {
                        self.session_failed(generation, &e);
                        conn.close().await;
                        return;
                    }
                }

                frame = conn.next_frame() => {
                    match frame {
                        Some(Ok(Inbound::Frame(raw))) => self.on_frame(&raw, &mut healthy),
                        Some(Ok(Inbound::Alive)) => self.on_alive(&mut healthy),
                        Some(Err(e)) => {
                            self.session_failed(generation, &e);
                            conn.close().await;
                            return;
                        }
                        None => {
                            self.session_failed(
                                generation,
                                &ConnectionError::Closed("stream ended".to_string()),
                            );
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn reconcile(
        &self,
        conn: &mut Box<dyn FeedConnection>,
        sent: &mut HashSet<Topic>,
        topics: Vec<Topic>,
    ) -> Result<(), ConnectionError> {
        let mut add = Vec::new();
        let mut remove = Vec::new();
        for topic in topics {
            let wanted = self.deps.registry.has_subscribers(self.feed, &topic);
            let present = sent.contains(&topic);
            if wanted && !present {
                add.push(topic);
            } else if !wanted && present {
                remove.push(topic);
            }
        }

        if !add.is_empty() {
            conn.send(&self.control(ControlAction::Subscribe, add.iter().cloned()))
                .await?;
            tracing::debug!(feed = %self.feed, topics = add.len(), "Subscribed upstream");
            sent.extend(add);
        }
        if !remove.is_empty() {
            conn.send(&self.control(ControlAction::Unsubscribe, remove.iter().cloned()))
                .await?;
            tracing::debug!(feed = %self.feed, topics = remove.len(), "Unsubscribed upstream");
            for topic in &remove {
                sent.remove(topic);
            }
        }
        Ok(())
    }

    fn on_frame(&self, raw: &[u8], healthy: &mut bool) {
        if self.state() != ConnectionState::Connected {
            return;
        }
        let started = Instant::now();
        self.metrics.record_bytes(raw.len());
        metrics::record_frame_received(self.feed, raw.len());

        let received_at = self.deps.clock.now();
        match self.decoder.decode(self.feed, raw, received_at) {
            Ok(records) => {
                self.metrics.record_message(received_at);
                self.mark_healthy(healthy);
                for record in records {
                    let record = Arc::new(record);
                    if self.deps.cache.update(Arc::clone(&record)) {
                        self.deps.broadcaster.publish(&record);
                    } else {
                        metrics::record_out_of_order(self.feed);
                    }
                }
            }
            Err(e) => {
                self.metrics.record_error();
                metrics::record_decode_error(self.feed, e.kind());
                tracing::warn!(feed = %self.feed, error = %e, "Dropping undecodable frame");
            }
        }

        metrics::record_processing_duration(self.feed, started.elapsed());
    }

    /// Keep-alive traffic: the socket is answering even if no data flows.
    fn on_alive(&self, healthy: &mut bool) {
        if self.state() != ConnectionState::Connected {
            return;
        }
        self.metrics.record_alive(self.deps.clock.now());
        self.mark_healthy(healthy);
    }

    /// First proof of life on a session ends the failure streak.
    fn mark_healthy(&self, healthy: &mut bool) {
        if !*healthy {
            *healthy = true;
            self.metrics.clear_failures();
        }
    }

    /// A live session ended on its own. Ignored if the session was already
    /// replaced or stopped.
    fn session_failed(&self, generation: u64, error: &ConnectionError) {
        let owned = {
            let mut slot = self.session.lock();
            if slot.as_ref().is_some_and(|s| s.generation == generation) {
                slot.take()
            } else {
                None
            }
        };
        if owned.is_none() {
            return;
        }
        self.metrics.mark_disconnected();
        self.degrade(ConnectionState::Connected, error);
    }

    // -------------------------------------------------------------------------
    // Transitions
    // -------------------------------------------------------------------------

    fn degrade(&self, from: ConnectionState, error: &ConnectionError) -> ConnectionState {
        if !self.transition(from, ConnectionState::Degraded) {
            return self.state();
        }
        let failures = self.metrics.record_failure();
        tracing::warn!(
            feed = %self.feed,
            from = %from,
            consecutive_failures = failures,
            error = %error,
            "Feed connection degraded"
        );
        self.deps.alerts.raise(Alert::ConnectionDegraded {
            feed: self.feed,
            consecutive_failures: failures,
            reason: error.to_string(),
        });
        self.request_reconnect();
        ConnectionState::Degraded
    }

    fn fail_authorization(&self, reason: String) -> ConnectionState {
        if !self.transition(ConnectionState::Authorizing, ConnectionState::Degraded) {
            return self.state();
        }
        let failures = self.metrics.record_failure();
        tracing::error!(
            feed = %self.feed,
            consecutive_failures = failures,
            reason = %reason,
            "Feed authorization failed"
        );
        self.deps.alerts.raise(Alert::AuthorizationFailed {
            feed: self.feed,
            reason,
        });
        self.request_reconnect();
        ConnectionState::Degraded
    }

    fn request_reconnect(&self) {
        let scheduler = self.scheduler.read().as_ref().and_then(Weak::upgrade);
        match scheduler {
            Some(scheduler) => scheduler.schedule_reconnect(self.feed),
            None => tracing::debug!(feed = %self.feed, "No reconnect scheduler installed"),
        }
    }

    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        let swapped = self
            .state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if swapped {
            self.on_transition(from, to);
        }
        swapped
    }

    fn force_state(&self, to: ConnectionState) -> ConnectionState {
        let previous = ConnectionState::from_u8(self.state.swap(to.as_u8(), Ordering::AcqRel));
        if previous != to {
            self.on_transition(previous, to);
        }
        previous
    }

    fn on_transition(&self, from: ConnectionState, to: ConnectionState) {
        metrics::set_connection_state(self.feed, to);
        tracing::debug!(feed = %self.feed, from = %from, to = %to, "Connection state changed");
        let _ = self.transitions.send(StateTransition {
            feed: self.feed,
            from,
            to,
        });
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::{Credential, MockCredentialSupplier, MockFeedAuthorizer};
    use crate::domain::clock::ManualClock;
    use crate::infrastructure::alerts::AlertHub;
    use crate::infrastructure::broadcast::BroadcastConfig;
    use async_trait::async_trait;
    use chrono::Utc;

    /// Transport whose sockets never deliver frames and record what was sent.
    #[derive(Default)]
    struct QuietTransport {
        sent: Arc<Mutex<Vec<ControlMessage>>>,
        connects: Arc<AtomicU64>,
        refuse: bool,
    }

    struct QuietConnection {
        sent: Arc<Mutex<Vec<ControlMessage>>>,
    }

    #[async_trait]
    impl FeedConnection for QuietConnection {
        async fn next_frame(&mut self) -> Option<Result<Inbound, ConnectionError>> {
            std::future::pending().await
        }

        async fn send(&mut self, message: &ControlMessage) -> Result<(), ConnectionError> {
            self.sent.lock().push(message.clone());
            Ok(())
        }

        async fn close(&mut self) {}
    }

    #[async_trait]
    impl FeedTransport for QuietTransport {
        async fn connect(
            &self,
            _session: &FeedSession,
        ) -> Result<Box<dyn FeedConnection>, ConnectionError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.refuse {
                return Err(ConnectionError::Connect("refused".to_string()));
            }
            Ok(Box::new(QuietConnection {
                sent: Arc::clone(&self.sent),
            }))
        }
    }

    fn session(feed: FeedType) -> FeedSession {
        FeedSession {
            feed,
            session_id: Uuid::new_v4(),
            session_key: "sk".to_string(),
            socket_endpoint: "wss://feed.test".to_string(),
            issued_at: Utc::now(),
            expires_at: None,
        }
    }

    fn credentials(token: &'static str) -> Arc<dyn CredentialSupplier> {
        let mut mock = MockCredentialSupplier::new();
        mock.expect_current()
            .returning(move || Some(Credential::bearer(token)));
        Arc::new(mock)
    }

    fn supervisor(
        authorizer: MockFeedAuthorizer,
        credentials: Arc<dyn CredentialSupplier>,
        transport: QuietTransport,
    ) -> (Arc<ConnectionSupervisor>, Arc<AlertHub>, Arc<SubscriptionRegistry>) {
        let registry = Arc::new(SubscriptionRegistry::new());
        let alerts = Arc::new(AlertHub::default());
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::at_millis(1_000));
        let deps = SupervisorDeps {
            authorizer: Arc::new(authorizer),
            credentials,
            transport: Arc::new(transport),
            registry: Arc::clone(&registry),
            cache: Arc::new(QuoteCache::new(Arc::clone(&clock))),
            broadcaster: Arc::new(Broadcaster::new(
                Arc::clone(&registry),
                alerts.clone(),
                BroadcastConfig::default(),
                tokio::runtime::Handle::current(),
            )),
            alerts: alerts.clone(),
            clock,
        };
        let config = SupervisorConfig {
            auth_retry: RetryPolicy::none(),
            ..SupervisorConfig::default()
        };
        (
            Arc::new(ConnectionSupervisor::new(FeedType::MarketData, config, deps)),
            alerts,
            registry,
        )
    }

    fn authorizing_ok() -> MockFeedAuthorizer {
        let mut authorizer = MockFeedAuthorizer::new();
        authorizer
            .expect_authorize()
            .returning(|feed, _, _| Ok(session(feed)));
        authorizer
    }

    #[tokio::test]
    async fn start_reaches_connected_and_stop_disconnects() {
        let (supervisor, _alerts, _registry) =
            supervisor(authorizing_ok(), credentials("t"), QuietTransport::default());
        let mut transitions = supervisor.subscribe_transitions();

        assert_eq!(supervisor.start().await, ConnectionState::Connected);
        assert!(supervisor.session_id().is_some());

        supervisor.stop().await;
        supervisor.stop().await;
        assert_eq!(supervisor.state(), ConnectionState::Disconnected);
        assert!(supervisor.session_id().is_none());

        let mut seen = Vec::new();
        while let Ok(t) = transitions.try_recv() {
            seen.push(t.to);
        }
        assert_eq!(
            seen,
            vec![
                ConnectionState::Authorizing,
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Disconnected,
            ]
        );
    }

    #[tokio::test]
    async fn start_while_connected_is_noop() {
        let (supervisor, _alerts, _registry) =
            supervisor(authorizing_ok(), credentials("t"), QuietTransport::default());
        supervisor.start().await;
        let session = supervisor.session_id();
        assert_eq!(supervisor.start().await, ConnectionState::Connected);
        assert_eq!(supervisor.session_id(), session);
    }

    #[tokio::test]
    async fn initial_subscribe_lists_active_topics() {
        let transport = QuietTransport::default();
        let sent = Arc::clone(&transport.sent);
        let (supervisor, _alerts, registry) =
            supervisor(authorizing_ok(), credentials("t"), transport);
        for topic in ["B", "A"] {
            registry
                .subscribe(
                    FeedType::MarketData,
                    Topic::from(topic),
                    crate::domain::subscription::ConsumerId::new("c"),
                    crate::infrastructure::broadcast::consumer_fn(|_| Ok(())),
                )
                .unwrap();
        }

        supervisor.start().await;
        tokio::task::yield_now().await;

        let sent = sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].action, ControlAction::Subscribe);
        assert_eq!(sent[0].topics, vec![Topic::from("A"), Topic::from("B")]);
        assert_eq!(sent[0].mode, Some(FeedMode::Full));
    }

    #[tokio::test]
    async fn missing_credential_degrades_with_alert() {
        let mut none = MockCredentialSupplier::new();
        none.expect_current().returning(|| None);
        let mut authorizer = MockFeedAuthorizer::new();
        authorizer.expect_authorize().never();

        let (supervisor, alerts, _registry) =
            supervisor(authorizer, Arc::new(none), QuietTransport::default());

        assert_eq!(supervisor.start().await, ConnectionState::Degraded);
        assert_eq!(supervisor.snapshot().consecutive_failures, 1);
        assert!(matches!(
            alerts.recent().as_slice(),
            [Alert::AuthorizationFailed { .. }]
        ));
    }

    #[tokio::test]
    async fn rejected_credential_is_not_retried() {
        let mut authorizer = MockFeedAuthorizer::new();
        authorizer.expect_authorize().times(1).returning(|_, _, _| {
            Err(AuthorizationError::Rejected {
                status: 401,
                message: "invalid token".to_string(),
            })
        });
        let (supervisor, alerts, _registry) =
            supervisor(authorizer, credentials("stale"), QuietTransport::default());

        assert_eq!(supervisor.start().await, ConnectionState::Degraded);
        // Same credential again: fails fast without calling upstream.
        assert_eq!(supervisor.start().await, ConnectionState::Degraded);
        assert_eq!(supervisor.snapshot().consecutive_failures, 2);
        assert_eq!(
            alerts
                .recent()
                .iter()
                .filter(|a| matches!(a, Alert::AuthorizationFailed { .. }))
                .count(),
            2
        );
    }

    #[tokio::test]
    async fn transient_authorization_failure_is_connection_degraded() {
        let mut authorizer = MockFeedAuthorizer::new();
        authorizer
            .expect_authorize()
            .returning(|_, _, _| Err(AuthorizationError::Unavailable("503".to_string())));
        let (supervisor, alerts, _registry) =
            supervisor(authorizer, credentials("t"), QuietTransport::default());

        assert_eq!(supervisor.start().await, ConnectionState::Degraded);
        assert!(matches!(
            alerts.recent().as_slice(),
            [Alert::ConnectionDegraded { consecutive_failures: 1, .. }]
        ));
    }

    #[tokio::test]
    async fn connect_failure_degrades() {
        let transport = QuietTransport {
            refuse: true,
            ..QuietTransport::default()
        };
        let (supervisor, _alerts, _registry) =
            supervisor(authorizing_ok(), credentials("t"), transport);

        assert_eq!(supervisor.start().await, ConnectionState::Degraded);
        assert_eq!(supervisor.start().await, ConnectionState::Degraded);
        assert_eq!(supervisor.snapshot().consecutive_failures, 2);
    }

    #[tokio::test]
    async fn failed_requires_reset() {
        let transport = QuietTransport {
            refuse: true,
            ..QuietTransport::default()
        };
        let (supervisor, _alerts, _registry) =
            supervisor(authorizing_ok(), credentials("t"), transport);

        supervisor.start().await;
        assert!(supervisor.mark_failed());
        assert_eq!(supervisor.start().await, ConnectionState::Failed);

        assert!(supervisor.reset());
        assert_eq!(supervisor.state(), ConnectionState::Disconnected);
        assert_eq!(supervisor.snapshot().consecutive_failures, 0);
        assert!(!supervisor.reset());
    }

    #[tokio::test]
    async fn resume_only_from_reconnecting() {
        let (supervisor, _alerts, _registry) =
            supervisor(authorizing_ok(), credentials("t"), QuietTransport::default());

        assert_eq!(supervisor.resume().await, ConnectionState::Disconnected);
        supervisor.start().await;
        assert!(supervisor.force_reconnect("test"));
        assert_eq!(supervisor.state(), ConnectionState::Degraded);
        assert!(supervisor.mark_reconnecting());
        assert_eq!(supervisor.resume().await, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn force_reconnect_requires_connected() {
        let (supervisor, _alerts, _registry) =
            supervisor(authorizing_ok(), credentials("t"), QuietTransport::default());
        assert!(!supervisor.force_reconnect("idle"));
    }

    #[tokio::test]
    async fn expired_session_degrades_without_connecting() {
        let mut authorizer = MockFeedAuthorizer::new();
        authorizer.expect_authorize().returning(|feed, _, _| {
            let mut expired = session(feed);
            // The supervisor clock reads 1s past the epoch.
            expired.expires_at = chrono::DateTime::from_timestamp_millis(500);
            Ok(expired)
        });
        let transport = QuietTransport::default();
        let connects = Arc::clone(&transport.connects);
        let (supervisor, alerts, _registry) = supervisor(authorizer, credentials("t"), transport);

        assert_eq!(supervisor.start().await, ConnectionState::Degraded);
        assert_eq!(connects.load(Ordering::SeqCst), 0);
        assert!(supervisor.session_id().is_none());
        assert_eq!(supervisor.snapshot().consecutive_failures, 1);
        match alerts.recent().as_slice() {
            [Alert::ConnectionDegraded { reason, .. }] => assert!(reason.contains("expired")),
            other => panic!("unexpected alerts: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unexpired_session_connects() {
        let mut authorizer = MockFeedAuthorizer::new();
        authorizer.expect_authorize().returning(|feed, _, _| {
            let mut fresh = session(feed);
            fresh.expires_at = chrono::DateTime::from_timestamp_millis(60_000);
            Ok(fresh)
        });
        let transport = QuietTransport::default();
        let connects = Arc::clone(&transport.connects);
        let (supervisor, _alerts, _registry) = supervisor(authorizer, credentials("t"), transport);

        assert_eq!(supervisor.start().await, ConnectionState::Connected);
        assert_eq!(connects.load(Ordering::SeqCst), 1);
    }
}
