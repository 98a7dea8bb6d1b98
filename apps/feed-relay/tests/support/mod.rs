//! Shared fixtures for the relay integration tests.
//!
//! `FakeTransport` hands out in-memory connections whose inbound frames are
//! injected by the test and whose outbound control messages are captured.
//! Connects can be held at a gate to race them against `stop`.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::sync::{Semaphore, mpsc};
use uuid::Uuid;

use feed_relay::infrastructure::upstream::messages::{FeedEntry, MarketDataFrame, frame_type};
use feed_relay::{
    AuthorizationError, BackoffPolicy, BroadcastConfig, Clock, ConnectionError, ConsumerError,
    ControlAction, ControlMessage, Credential, CredentialSupplier, FeedAuthorizer,
    FeedConnection, FeedMode, FeedRelay, FeedSession, FeedTransport, FeedType, HealthConfig,
    Inbound, ManualClock, QuoteConsumer, QuoteRecord, RetryPolicy, StaticCredentials, SupervisorConfig,
    Topic,
};

// =============================================================================
// Transport
// =============================================================================

type Frame = Result<Inbound, ConnectionError>;

#[derive(Default)]
struct FeedLinks {
    attempts: u32,
    refuse: u32,
    gate: Option<Arc<Semaphore>>,
    live: Option<mpsc::UnboundedSender<Frame>>,
    sent: Vec<ControlMessage>,
    closed: u32,
}

#[derive(Default)]
struct Links {
    feeds: Mutex<HashMap<FeedType, FeedLinks>>,
}

/// In-memory transport with scripted connect failures.
#[derive(Default)]
pub struct FakeTransport {
    links: Arc<Links>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Refuse the next `count` connects for `feed`.
    pub fn refuse_next(&self, feed: FeedType, count: u32) {
        self.links.feeds.lock().entry(feed).or_default().refuse = count;
    }

    /// Hold every later connect for `feed` until the returned gate gets a
    /// permit. Each permit lets one connect through.
    pub fn hold_connects(&self, feed: FeedType) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        self.links.feeds.lock().entry(feed).or_default().gate = Some(Arc::clone(&gate));
        gate
    }

    /// Connect calls made for `feed`, refused ones included.
    pub fn attempts(&self, feed: FeedType) -> u32 {
        self.links.feeds.lock().get(&feed).map_or(0, |l| l.attempts)
    }

    /// Connections closed by the relay for `feed`.
    pub fn closed(&self, feed: FeedType) -> u32 {
        self.links.feeds.lock().get(&feed).map_or(0, |l| l.closed)
    }

    /// Control messages written on any connection of `feed`, oldest first.
    pub fn sent(&self, feed: FeedType) -> Vec<ControlMessage> {
        self.links
            .feeds
            .lock()
            .get(&feed)
            .map(|l| l.sent.clone())
            .unwrap_or_default()
    }

    /// Messages of `action` that carried `topic`.
    pub fn count_sent(&self, feed: FeedType, action: ControlAction, topic: &Topic) -> usize {
        self.sent(feed)
            .iter()
            .filter(|m| m.action == action && m.topics.contains(topic))
            .count()
    }

    /// Deliver a frame on the latest connection of `feed`.
    pub fn push(&self, feed: FeedType, frame: Vec<u8>) -> bool {
        self.inject(feed, Ok(Inbound::Frame(frame)))
    }

    /// Deliver a keep-alive, as a pong would, on the latest connection.
    pub fn heartbeat(&self, feed: FeedType) -> bool {
        self.inject(feed, Ok(Inbound::Alive))
    }

    /// Fail the latest connection of `feed` with a socket error.
    pub fn break_socket(&self, feed: FeedType, reason: &str) -> bool {
        self.inject(feed, Err(ConnectionError::Socket(reason.to_string())))
    }

    fn inject(&self, feed: FeedType, frame: Frame) -> bool {
        self.links
            .feeds
            .lock()
            .get(&feed)
            .and_then(|l| l.live.as_ref())
            .is_some_and(|tx| tx.send(frame).is_ok())
    }
}

impl Links {
    fn record_sent(&self, feed: FeedType, message: ControlMessage) {
        self.feeds.lock().entry(feed).or_default().sent.push(message);
    }

    fn record_closed(&self, feed: FeedType) {
        self.feeds.lock().entry(feed).or_default().closed += 1;
    }
}

#[async_trait]
impl FeedTransport for FakeTransport {
    async fn connect(
        &self,
        session: &FeedSession,
    ) -> Result<Box<dyn FeedConnection>, ConnectionError> {
        let gate = {
            let mut feeds = self.links.feeds.lock();
            let links = feeds.entry(session.feed).or_default();
            links.attempts += 1;
            links.gate.clone()
        };
        if let Some(gate) = gate {
            gate.acquire().await.expect("gate closed").forget();
        }

        let mut feeds = self.links.feeds.lock();
        let links = feeds.entry(session.feed).or_default();
        if links.refuse > 0 {
            links.refuse -= 1;
            return Err(ConnectionError::Connect("connection refused".to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        links.live = Some(tx);
        Ok(Box::new(FakeConnection {
            feed: session.feed,
            frames: rx,
            links: Arc::clone(&self.links),
        }))
    }
}

struct FakeConnection {
    feed: FeedType,
    frames: mpsc::UnboundedReceiver<Frame>,
    links: Arc<Links>,
}

#[async_trait]
impl FeedConnection for FakeConnection {
    async fn next_frame(&mut self) -> Option<Frame> {
        self.frames.recv().await
    }

    async fn send(&mut self, message: &ControlMessage) -> Result<(), ConnectionError> {
        self.links.record_sent(self.feed, message.clone());
        Ok(())
    }

    async fn close(&mut self) {
        self.frames.close();
        self.links.record_closed(self.feed);
    }
}

// =============================================================================
// Authorization
// =============================================================================

/// Authorizer that issues sessions until told to reject.
#[derive(Default)]
pub struct ScriptedAuthorizer {
    reject: AtomicBool,
    calls: Mutex<HashMap<FeedType, u32>>,
    issued: AtomicU32,
}

impl ScriptedAuthorizer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reject(&self, reject: bool) {
        self.reject.store(reject, Ordering::SeqCst);
    }

    pub fn calls(&self, feed: FeedType) -> u32 {
        self.calls.lock().get(&feed).copied().unwrap_or(0)
    }
}

#[async_trait]
impl FeedAuthorizer for ScriptedAuthorizer {
    async fn authorize(
        &self,
        feed: FeedType,
        _mode: FeedMode,
        _credential: &Credential,
    ) -> Result<FeedSession, AuthorizationError> {
        *self.calls.lock().entry(feed).or_default() += 1;
        if self.reject.load(Ordering::SeqCst) {
            return Err(AuthorizationError::Rejected {
                status: 401,
                message: "invalid token".to_string(),
            });
        }

        let n = self.issued.fetch_add(1, Ordering::SeqCst);
        Ok(FeedSession {
            feed,
            session_id: Uuid::new_v4(),
            session_key: format!("session-{n}"),
            socket_endpoint: format!("wss://feed.test/{}", feed.as_str()),
            issued_at: Utc::now(),
            expires_at: None,
        })
    }
}

// =============================================================================
// Consumers
// =============================================================================

/// Consumer that keeps every record it is handed.
#[derive(Default)]
pub struct Collector {
    records: Mutex<Vec<Arc<QuoteRecord>>>,
}

impl Collector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn records(&self) -> Vec<Arc<QuoteRecord>> {
        self.records.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }
}

#[async_trait]
impl QuoteConsumer for Collector {
    async fn on_quote(&self, record: Arc<QuoteRecord>) -> Result<(), ConsumerError> {
        self.records.lock().push(record);
        Ok(())
    }
}

// =============================================================================
// Frames
// =============================================================================

/// Binary `live_feed` frame with one tick per `(key, price)`.
pub fn tick_frame(ticks: &[(&str, &str)]) -> Vec<u8> {
    let feeds: BTreeMap<String, FeedEntry> = ticks
        .iter()
        .map(|(key, price)| {
            (
                (*key).to_string(),
                FeedEntry {
                    ltp: Some(price.parse::<Decimal>().unwrap()),
                    ltq: Some(10),
                    ltt: Some(1_700_000_000_000),
                    ..FeedEntry::default()
                },
            )
        })
        .collect();

    MarketDataFrame {
        frame_type: frame_type::LIVE_FEED.to_string(),
        current_ts: Some(1_700_000_000_000),
        feeds,
    }
    .to_bytes()
    .unwrap()
}

/// JSON order update frame.
pub fn order_frame(order_id: &str, status: &str) -> Vec<u8> {
    serde_json::json!({
        "update_type": "order",
        "instrument_key": "NSE_EQ|INE002A01018",
        "order_id": order_id,
        "status": status,
        "quantity": 5,
        "filled_quantity": 0,
        "timestamp": 1_700_000_000_000_i64,
    })
    .to_string()
    .into_bytes()
}

// =============================================================================
// Relay Harness
// =============================================================================

pub const BACKOFF_BASE: Duration = Duration::from_millis(100);
pub const MAX_ATTEMPTS: u32 = 3;

/// Recovery tuned for tests: deterministic backoff and a monitor loop that
/// never ticks on its own unless a test asks for it.
pub fn test_health_config() -> HealthConfig {
    HealthConfig {
        interval: Duration::from_secs(3_600),
        silence_threshold: Duration::from_secs(5),
        backoff: BackoffPolicy::new(BACKOFF_BASE, Duration::from_secs(2), MAX_ATTEMPTS)
            .without_jitter(),
    }
}

pub struct Harness {
    pub relay: FeedRelay,
    pub transport: Arc<FakeTransport>,
    pub authorizer: Arc<ScriptedAuthorizer>,
    pub credentials: Arc<StaticCredentials>,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(test_health_config(), BroadcastConfig::default())
    }

    pub fn with(health: HealthConfig, broadcast: BroadcastConfig) -> Self {
        let transport = FakeTransport::new();
        let authorizer = ScriptedAuthorizer::new();
        let credentials = Arc::new(StaticCredentials::new("access-token"));
        let clock = Arc::new(ManualClock::at_millis(1_000));

        let relay = FeedRelay::builder()
            .authorizer(Arc::clone(&authorizer) as Arc<dyn FeedAuthorizer>)
            .credentials(Arc::clone(&credentials) as Arc<dyn CredentialSupplier>)
            .transport(Arc::clone(&transport) as Arc<dyn FeedTransport>)
            .clock(Arc::clone(&clock) as Arc<dyn Clock>)
            .supervisor_config(SupervisorConfig {
                auth_retry: RetryPolicy::none(),
                stop_timeout: Duration::from_secs(1),
                ..SupervisorConfig::default()
            })
            .health_config(health)
            .broadcast_config(broadcast)
            .build()
            .unwrap();

        Self {
            relay,
            transport,
            authorizer,
            credentials,
            clock,
        }
    }
}

/// Poll `condition` until it holds, failing the test after a while.
pub async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..2_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("timed out waiting for {what}");
}

pub fn topic(key: &str) -> Topic {
    Topic::new(key)
}
