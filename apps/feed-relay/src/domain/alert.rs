//! Typed Alert Events
//!
//! Raised by supervisors, the broadcaster and the health monitor, and handed
//! to an alert sink. Delivery to people (email, chat) is someone else's job.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use super::feed::{FeedType, Topic};
use super::subscription::ConsumerId;

/// How urgently an alert needs attention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    /// Self-healing condition worth knowing about.
    Warning,
    /// Requires attention but recovery continues.
    Error,
    /// Recovery stopped; manual restart required.
    Critical,
}

/// Discriminant of an [`Alert`], used for metrics labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// See [`Alert::AuthorizationFailed`].
    AuthorizationFailed,
    /// See [`Alert::ConnectionDegraded`].
    ConnectionDegraded,
    /// See [`Alert::ConnectionFailed`].
    ConnectionFailed,
    /// See [`Alert::SilentConnection`].
    SilentConnection,
    /// See [`Alert::ConsumerEvicted`].
    ConsumerEvicted,
}

impl AlertKind {
    /// Label value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AuthorizationFailed => "authorization_failed",
            Self::ConnectionDegraded => "connection_degraded",
            Self::ConnectionFailed => "connection_failed",
            Self::SilentConnection => "silent_connection",
            Self::ConsumerEvicted => "consumer_evicted",
        }
    }
}

/// An operational alert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Alert {
    /// The provider rejected the credential for a feed.
    AuthorizationFailed {
        /// Feed whose authorization failed.
        feed: FeedType,
        /// Provider or local reason.
        reason: String,
    },
    /// A session attempt or live session failed; recovery is scheduled.
    ConnectionDegraded {
        /// Feed that degraded.
        feed: FeedType,
        /// Failures since the last healthy session.
        consecutive_failures: u32,
        /// Failure description.
        reason: String,
    },
    /// Recovery gave up; manual restart required.
    ConnectionFailed {
        /// Feed that failed.
        feed: FeedType,
        /// Failures that led here.
        attempts: u32,
    },
    /// The socket stayed open but stopped delivering frames.
    SilentConnection {
        /// Feed that went quiet.
        feed: FeedType,
        /// How long it has been silent.
        #[serde(serialize_with = "serialize_millis")]
        silent_for: Duration,
    },
    /// A consumer was unsubscribed after repeated callback failures.
    ConsumerEvicted {
        /// Feed of the evicted subscription.
        feed: FeedType,
        /// Topic of the evicted subscription.
        topic: Topic,
        /// Consumer that was evicted.
        consumer: ConsumerId,
        /// Consecutive failures that triggered eviction.
        failures: u32,
    },
}

impl Alert {
    /// Discriminant for metrics.
    #[must_use]
    pub const fn kind(&self) -> AlertKind {
        match self {
            Self::AuthorizationFailed { .. } => AlertKind::AuthorizationFailed,
            Self::ConnectionDegraded { .. } => AlertKind::ConnectionDegraded,
            Self::ConnectionFailed { .. } => AlertKind::ConnectionFailed,
            Self::SilentConnection { .. } => AlertKind::SilentConnection,
            Self::ConsumerEvicted { .. } => AlertKind::ConsumerEvicted,
        }
    }

    /// Severity of the alert.
    #[must_use]
    pub const fn severity(&self) -> AlertSeverity {
        match self {
            Self::ConnectionFailed { .. } => AlertSeverity::Critical,
            Self::AuthorizationFailed { .. } => AlertSeverity::Error,
            Self::ConnectionDegraded { .. }
            | Self::SilentConnection { .. }
            | Self::ConsumerEvicted { .. } => AlertSeverity::Warning,
        }
    }

    /// Feed the alert concerns.
    #[must_use]
    pub const fn feed(&self) -> FeedType {
        match self {
            Self::AuthorizationFailed { feed, .. }
            | Self::ConnectionDegraded { feed, .. }
            | Self::ConnectionFailed { feed, .. }
            | Self::SilentConnection { feed, .. }
            | Self::ConsumerEvicted { feed, .. } => *feed,
        }
    }
}

impl fmt::Display for Alert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AuthorizationFailed { feed, reason } => {
                write!(f, "{feed} authorization failed: {reason}")
            }
            Self::ConnectionDegraded {
                feed,
                consecutive_failures,
                reason,
            } => write!(
                f,
                "{feed} connection degraded after {consecutive_failures} failure(s): {reason}"
            ),
            Self::ConnectionFailed { feed, attempts } => write!(
                f,
                "{feed} connection failed after {attempts} attempt(s); manual restart required"
            ),
            Self::SilentConnection { feed, silent_for } => write!(
                f,
                "{feed} connection silent for {}ms; forcing reconnect",
                silent_for.as_millis()
            ),
            Self::ConsumerEvicted {
                feed,
                topic,
                consumer,
                failures,
            } => write!(
                f,
                "consumer {consumer} evicted from {feed}/{topic} after {failures} failures"
            ),
        }
    }
}

fn serialize_millis<S: serde::Serializer>(
    value: &Duration,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
}
