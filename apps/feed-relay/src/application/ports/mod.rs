//! Port Interfaces
//!
//! Defines the interfaces (ports) for external systems following
//! the Hexagonal Architecture pattern. These are the contracts that
//! infrastructure adapters must implement.
//!
//! ## Driven Ports (Outbound)
//!
//! - [`FeedAuthorizer`]: exchanges a credential for a feed session
//! - [`FeedTransport`] / [`FeedConnection`]: the upstream socket
//! - [`CredentialSupplier`]: source of the currently valid bearer credential
//! - [`AlertSink`]: receiver of typed alerts
//!
//! ## Internal Seams
//!
//! - [`ReconnectScheduler`]: how a supervisor hands recovery to the health monitor

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::domain::alert::Alert;
use crate::domain::feed::{FeedMode, FeedSession, FeedType, Topic};

// =============================================================================
// Credentials
// =============================================================================

/// A bearer credential accepted by the provider.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    token: String,
}

impl Credential {
    /// Wrap a bearer token.
    #[must_use]
    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    /// The raw token, for the Authorization header.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Stable fingerprint used to recognise a credential without storing it.
    #[must_use]
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.token.hash(&mut hasher);
        hasher.finish()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"[REDACTED]")
            .finish()
    }
}

/// Supplies the currently valid credential. Refreshing it is the supplier's job.
#[cfg_attr(test, mockall::automock)]
pub trait CredentialSupplier: Send + Sync {
    /// The credential to use now, or `None` if none is available.
    fn current(&self) -> Option<Credential>;
}

// =============================================================================
// Authorization
// =============================================================================

/// Errors returned by a [`FeedAuthorizer`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthorizationError {
    /// The provider rejected the credential. Fatal for this credential.
    #[error("credential rejected ({status}): {message}")]
    Rejected {
        /// HTTP status returned.
        status: u16,
        /// Provider message.
        message: String,
    },

    /// No credential is currently available.
    #[error("no credential available")]
    MissingCredential,

    /// The authorization endpoint could not be reached or failed transiently.
    #[error("authorization endpoint unavailable: {0}")]
    Unavailable(String),

    /// The endpoint answered with something we could not use.
    #[error("invalid authorization response: {0}")]
    InvalidResponse(String),
}

impl AuthorizationError {
    /// Check if calling again with the same credential may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::InvalidResponse(_))
    }

    /// Check if this error means the credential itself is unusable.
    #[must_use]
    pub const fn is_credential_failure(&self) -> bool {
        matches!(self, Self::Rejected { .. } | Self::MissingCredential)
    }
}

/// Exchanges a bearer credential for a feed-specific session.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FeedAuthorizer: Send + Sync {
    /// Authorize a session for `feed`.
    ///
    /// # Errors
    ///
    /// Returns `AuthorizationError::Rejected` when the provider refuses the
    /// credential, or a retryable variant on transient failure.
    async fn authorize(
        &self,
        feed: FeedType,
        mode: FeedMode,
        credential: &Credential,
    ) -> Result<FeedSession, AuthorizationError>;
}

// =============================================================================
// Transport
// =============================================================================

/// Transient connection failures. Always recovered through the health monitor.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    /// Opening the socket failed.
    #[error("connect failed: {0}")]
    Connect(String),

    /// Opening the socket took too long.
    #[error("connect timed out after {0:?}")]
    Timeout(Duration),

    /// Socket read or protocol error.
    #[error("socket error: {0}")]
    Socket(String),

    /// The remote side closed the socket.
    #[error("connection closed by remote: {0}")]
    Closed(String),

    /// No pong arrived in time.
    #[error("heartbeat timeout")]
    HeartbeatTimeout,

    /// A control message could not be written.
    #[error("failed to send control message: {0}")]
    Send(String),

    /// Authorization failed transiently and retries were exhausted.
    #[error("authorization unavailable: {0}")]
    Authorization(String),

    /// The granted session lapsed before the socket was opened.
    #[error("feed session expired before connecting")]
    SessionExpired,
}

/// Direction of a control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    /// Start receiving topics.
    Subscribe,
    /// Stop receiving topics.
    Unsubscribe,
}

/// Control message written to the upstream socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ControlMessage {
    /// Subscribe or unsubscribe.
    pub action: ControlAction,
    /// Topics affected, sorted.
    pub topics: Vec<Topic>,
    /// Market data mode; omitted for the portfolio feed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<FeedMode>,
}

impl ControlMessage {
    /// Build a control message with sorted topics.
    #[must_use]
    pub fn new(
        action: ControlAction,
        topics: impl IntoIterator<Item = Topic>,
        mode: Option<FeedMode>,
    ) -> Self {
        let mut topics: Vec<Topic> = topics.into_iter().collect();
        topics.sort();
        topics.dedup();
        Self {
            action,
            topics,
            mode,
        }
    }
}

/// One item read from an upstream socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Data frame for the decoder.
    Frame(Vec<u8>),
    /// Keep-alive traffic with no payload, such as a pong.
    Alive,
}

/// One open upstream socket.
#[async_trait]
pub trait FeedConnection: Send {
    /// Next inbound item, or `None` once the socket is closed.
    ///
    /// Must be cancel-safe: it is polled inside `tokio::select!`.
    async fn next_frame(&mut self) -> Option<Result<Inbound, ConnectionError>>;

    /// Write a control message.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError::Send` if the socket rejects the write.
    async fn send(&mut self, message: &ControlMessage) -> Result<(), ConnectionError>;

    /// Close the socket. Best effort.
    async fn close(&mut self);
}

/// Opens upstream sockets for authorized sessions.
#[async_trait]
pub trait FeedTransport: Send + Sync {
    /// Open a socket for `session`.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError` if the socket cannot be opened.
    async fn connect(
        &self,
        session: &FeedSession,
    ) -> Result<Box<dyn FeedConnection>, ConnectionError>;
}

// =============================================================================
// Alerts and Recovery
// =============================================================================

/// Receives typed alerts.
pub trait AlertSink: Send + Sync {
    /// Raise an alert. Must not block.
    fn raise(&self, alert: Alert);
}

/// Receives requests to schedule recovery for a degraded feed.
pub trait ReconnectScheduler: Send + Sync {
    /// A supervisor for `feed` just degraded.
    fn schedule_reconnect(&self, feed: FeedType);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_debug_is_redacted() {
        let credential = Credential::bearer("secret-token");
        assert!(!format!("{credential:?}").contains("secret-token"));
    }

    #[test]
    fn fingerprint_distinguishes_tokens() {
        let a = Credential::bearer("a");
        assert_eq!(a.fingerprint(), Credential::bearer("a").fingerprint());
        assert_ne!(a.fingerprint(), Credential::bearer("b").fingerprint());
    }

    #[test]
    fn rejection_is_not_retryable() {
        let rejected = AuthorizationError::Rejected {
            status: 401,
            message: "invalid token".to_string(),
        };
        assert!(!rejected.is_retryable());
        assert!(rejected.is_credential_failure());
        assert!(AuthorizationError::Unavailable("503".to_string()).is_retryable());
    }

    #[test]
    fn control_message_wire_shape() {
        let msg = ControlMessage::new(
            ControlAction::Subscribe,
            [Topic::from("B"), Topic::from("A"), Topic::from("A")],
            Some(FeedMode::Full),
        );
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"action": "subscribe", "topics": ["A", "B"], "mode": "full"})
        );

        let portfolio = ControlMessage::new(ControlAction::Unsubscribe, [Topic::portfolio()], None);
        let json = serde_json::to_value(&portfolio).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"action": "unsubscribe", "topics": ["portfolio"]})
        );
    }
}
