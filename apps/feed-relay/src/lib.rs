#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Feed Relay - Realtime Brokerage Feed Streaming
//!
//! Keeps one authorized upstream session per feed type (market data,
//! portfolio), decodes pushed frames into a last-value cache, and fans each
//! update out to in-process consumers. A health monitor drives reconnects
//! with exponential backoff and escalates to a terminal state when recovery
//! keeps failing.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Feed types, quote records, cache and subscriptions
//!   - `feed`: Feed types, topics, sessions, connection states
//!   - `quote`: Decoded records and the monotonic `QuoteCache`
//!   - `subscription`: Consumer registry with upstream transition hooks
//!   - `alert`: Typed operational alerts
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Authorizer, transport, credential and alert interfaces
//!   - `services`: The `FeedRelay` facade
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `upstream`: HTTP authorization, WebSocket transport, decoding, supervisors
//!   - `broadcast`: Per-subscription delivery queues
//!   - `health`: Recovery policy and the health HTTP endpoint
//!   - `alerts`, `config`, `metrics`, `telemetry`
//!
//! # Data Flow
//!
//! ```text
//! market data WS ──┐                                 ┌──► consumer 1
//!                  ├──► decode ──► QuoteCache ──► Broadcaster ──► consumer 2
//! portfolio WS ────┘                                 └──► consumer N
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core feed types with no I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::alert::{Alert, AlertKind, AlertSeverity};
pub use domain::clock::{Clock, ManualClock, SystemClock};
pub use domain::feed::{ConnectionState, FeedMode, FeedSession, FeedType, StateTransition, Topic};
pub use domain::quote::{MarketTick, PortfolioDelta, QuoteCache, QuoteRecord, StaleDataError};
pub use domain::subscription::{
    ConsumerError, ConsumerId, QuoteConsumer, SubscriptionError, SubscriptionHandle,
    SubscriptionRegistry,
};

// Ports
pub use application::ports::{
    AuthorizationError, ConnectionError, ControlAction, ControlMessage, Credential,
    CredentialSupplier, FeedAuthorizer, FeedConnection, FeedTransport, Inbound,
};

// Facade
pub use application::services::{FeedRelay, FeedRelayBuilder, RelayError};

// Infrastructure config
pub use infrastructure::config::{ConfigError, CredentialSource, RelayConfig};

// Health
pub use infrastructure::health::{
    FeedHealth, HealthConfig, HealthMonitor, HealthServer, HealthServerError, HealthServerState,
    RecoveryAction,
};

// Delivery
pub use infrastructure::broadcast::{BroadcastConfig, ConsumerStats, consumer_fn};

// Upstream adapters
pub use infrastructure::upstream::{
    BackoffPolicy, FileCredentials, HttpFeedAuthorizer, RetryPolicy, StaticCredentials,
    SupervisorConfig, WebSocketTransport,
};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{
    LogFormat, TelemetryConfig, TelemetryGuard, init as init_telemetry,
};
