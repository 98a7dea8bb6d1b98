//! Feed Types and Session Descriptors
//!
//! Core identifiers shared by every layer: which feed a record came from,
//! what a subscription key looks like, and the lifecycle state of an
//! upstream connection.
//!
//! # Connection Lifecycle
//!
//! ```text
//! DISCONNECTED ──start()──► AUTHORIZING ──► CONNECTING ──► CONNECTED
//!      ▲                         │              │              │
//!      │ stop()/reset()          └──────────────┴──► DEGRADED ◄┘
//!      │                                               │    │
//!    FAILED ◄── consecutive failures >= max ───────────┘    │
//!                                                           ▼
//!                               CONNECTED ◄── start() ── RECONNECTING
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// Feed Type
// =============================================================================

/// Category of realtime stream, each with its own authorization scope and schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedType {
    /// Binary tick stream for instruments.
    MarketData,
    /// Structured order, position and holding updates.
    Portfolio,
}

impl FeedType {
    /// Both feed types, in a stable order.
    pub const ALL: [Self; 2] = [Self::MarketData, Self::Portfolio];

    /// Get the feed name used in logs, metrics and URLs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MarketData => "market_data",
            Self::Portfolio => "portfolio",
        }
    }
}

impl fmt::Display for FeedType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Topic
// =============================================================================

/// Subscription key: an instrument key for market data, or the portfolio sentinel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topic(String);

impl Topic {
    /// Sentinel topic carrying every portfolio-wide update.
    pub const PORTFOLIO: &'static str = "portfolio";

    /// Create a topic from any string-like value.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The portfolio sentinel topic.
    #[must_use]
    pub fn portfolio() -> Self {
        Self(Self::PORTFOLIO.to_string())
    }

    /// Check whether this is the portfolio sentinel.
    #[must_use]
    pub fn is_portfolio(&self) -> bool {
        self.0 == Self::PORTFOLIO
    }

    /// Borrow the raw key.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Topic {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for Topic {
    fn from(key: String) -> Self {
        Self(key)
    }
}

// =============================================================================
// Feed Mode
// =============================================================================

/// Level of detail requested from the market data feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedMode {
    /// Last traded price, quantity and close only.
    Ltpc,
    /// Price, depth, open interest.
    #[default]
    Full,
    /// Price plus option greeks.
    OptionGreeks,
}

impl FeedMode {
    /// Parse a wire name, ignoring case and surrounding whitespace.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ltpc" => Some(Self::Ltpc),
            "full" => Some(Self::Full),
            "option_greeks" => Some(Self::OptionGreeks),
            _ => None,
        }
    }

    /// Get the wire name of the mode.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ltpc => "ltpc",
            Self::Full => "full",
            Self::OptionGreeks => "option_greeks",
        }
    }
}

// =============================================================================
// Feed Session
// =============================================================================

/// Feed-specific session descriptor obtained from authorization.
///
/// Owned by the supervisor that requested it and discarded on disconnect.
#[derive(Clone)]
pub struct FeedSession {
    /// Feed this session authorizes.
    pub feed: FeedType,
    /// Local correlation ID for logs.
    pub session_id: Uuid,
    /// Opaque key presented when opening the socket.
    pub session_key: String,
    /// Socket URL to connect to.
    pub socket_endpoint: String,
    /// When the session was issued.
    pub issued_at: DateTime<Utc>,
    /// When the session stops being accepted, if the provider says.
    pub expires_at: Option<DateTime<Utc>>,
}

impl FeedSession {
    /// Check whether the session has expired at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires| now >= expires)
    }
}

impl fmt::Debug for FeedSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedSession")
            .field("feed", &self.feed)
            .field("session_id", &self.session_id)
            .field("session_key", &"[REDACTED]")
            .field("socket_endpoint", &self.socket_endpoint)
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

// =============================================================================
// Connection State
// =============================================================================

/// Lifecycle state of an upstream connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum ConnectionState {
    /// No session; initial and post-`stop()` state.
    Disconnected = 0,
    /// Exchanging the credential for a session.
    Authorizing = 1,
    /// Opening the socket.
    Connecting = 2,
    /// Live frames are flowing.
    Connected = 3,
    /// The last attempt or session failed; awaiting recovery.
    Degraded = 4,
    /// A reconnect has been scheduled.
    Reconnecting = 5,
    /// Terminal; manual intervention required.
    Failed = 6,
}

impl ConnectionState {
    /// Decode from the atomic representation. Unknown values map to `Disconnected`.
    #[must_use]
    pub const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Authorizing,
            2 => Self::Connecting,
            3 => Self::Connected,
            4 => Self::Degraded,
            5 => Self::Reconnecting,
            6 => Self::Failed,
            _ => Self::Disconnected,
        }
    }

    /// Atomic representation.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Get the state name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Authorizing => "authorizing",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Degraded => "degraded",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        }
    }

    /// States from which `start()` may begin a new attempt.
    #[must_use]
    pub const fn can_start(self) -> bool {
        matches!(
            self,
            Self::Disconnected | Self::Degraded | Self::Reconnecting
        )
    }

    /// States in which a session attempt is in progress or live.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Authorizing | Self::Connecting | Self::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single state change published by a supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateTransition {
    /// Feed whose state changed.
    pub feed: FeedType,
    /// Previous state.
    pub from: ConnectionState,
    /// New state.
    pub to: ConnectionState,
}
