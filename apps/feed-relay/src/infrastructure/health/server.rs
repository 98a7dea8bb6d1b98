//! Health HTTP Endpoint
//!
//! Read-only view of the relay for orchestrators and dashboards, served by
//! axum next to the Prometheus scrape target.
//!
//! | Route            | 200 when                          | Body                 |
//! |------------------|-----------------------------------|----------------------|
//! | `/health`        | no feed is `FAILED` and one is up | [`HealthResponse`]   |
//! | `/healthz`       | process is alive                  | `OK`                 |
//! | `/readyz`        | the market data feed is connected | `READY`              |
//! | `/feeds/{feed}`  | feed name is known                | [`FeedHealth`]       |
//! | `/metrics`       | recorder is installed             | Prometheus text      |

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use super::{FeedHealth, HealthMonitor};
use crate::domain::alert::Alert;
use crate::domain::feed::{ConnectionState, FeedType};
use crate::domain::subscription::{SubscriptionRegistry, SubscriptionStats};
use crate::infrastructure::alerts::AlertHub;
use crate::infrastructure::metrics::get_metrics_handle;

/// Alerts included in `/health`.
const RECENT_ALERTS: usize = 20;

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

// =============================================================================
// Response Types
// =============================================================================

/// Body of `/health`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Rolled-up status.
    pub status: HealthStatus,
    /// Relay version.
    pub version: String,
    /// Process uptime in seconds.
    pub uptime_secs: u64,
    /// Time the response was built.
    pub current_time: DateTime<Utc>,
    /// One entry per feed.
    pub feeds: Vec<FeedHealth>,
    /// Registry counters per feed.
    pub subscriptions: SubscriptionStatus,
    /// Latest alerts, oldest first.
    pub recent_alerts: Vec<Alert>,
}

/// Rolled-up relay status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Every feed is connected.
    Healthy,
    /// At least one feed is recovering.
    Degraded,
    /// A feed needs a manual restart, or nothing is connected.
    Unhealthy,
}

impl HealthStatus {
    /// Roll per-feed health up into one status.
    #[must_use]
    pub fn from_feeds(feeds: &[FeedHealth]) -> Self {
        if feeds.iter().any(|f| f.state == ConnectionState::Failed) {
            return Self::Unhealthy;
        }
        match feeds.iter().filter(|f| f.is_connected()).count() {
            0 => Self::Unhealthy,
            n if n == feeds.len() => Self::Healthy,
            _ => Self::Degraded,
        }
    }

    const fn status_code(self) -> StatusCode {
        match self {
            Self::Healthy | Self::Degraded => StatusCode::OK,
            Self::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

/// Registry counters per feed.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionStatus {
    /// Market data feed.
    pub market_data: SubscriptionStats,
    /// Portfolio feed.
    pub portfolio: SubscriptionStats,
}

// =============================================================================
// Server
// =============================================================================

/// What the handlers read from.
pub struct HealthServerState {
    version: String,
    started_at: Instant,
    monitor: Arc<HealthMonitor>,
    registry: Arc<SubscriptionRegistry>,
    alerts: Arc<AlertHub>,
}

impl HealthServerState {
    /// Bundle the relay components the endpoint reports on.
    #[must_use]
    pub fn new(
        version: String,
        monitor: Arc<HealthMonitor>,
        registry: Arc<SubscriptionRegistry>,
        alerts: Arc<AlertHub>,
    ) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            monitor,
            registry,
            alerts,
        }
    }

    fn response(&self) -> HealthResponse {
        let feeds = self.monitor.report();
        let mut recent_alerts = self.alerts.recent();
        let skip = recent_alerts.len().saturating_sub(RECENT_ALERTS);
        recent_alerts.drain(..skip);

        HealthResponse {
            status: HealthStatus::from_feeds(&feeds),
            version: self.version.clone(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            current_time: Utc::now(),
            feeds,
            subscriptions: SubscriptionStatus {
                market_data: self.registry.stats(FeedType::MarketData),
                portfolio: self.registry.stats(FeedType::Portfolio),
            },
            recent_alerts,
        }
    }
}

/// Health HTTP server.
pub struct HealthServer {
    port: u16,
    state: Arc<HealthServerState>,
    cancel: CancellationToken,
}

impl HealthServer {
    /// Create a server on `port` that stops when `cancel` fires.
    #[must_use]
    pub const fn new(port: u16, state: Arc<HealthServerState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Serve until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HealthServerError` if the port cannot be bound or serving
    /// fails.
    pub async fn run(self) -> Result<(), HealthServerError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HealthServerError::BindFailed(self.port, e.to_string()))?;
        tracing::info!(port = self.port, "Health server listening");

        axum::serve(listener, router(self.state))
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HealthServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Health server stopped");
        Ok(())
    }
}

/// Routes served by [`HealthServer`].
pub fn router(state: Arc<HealthServerState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/healthz", get(|| async { "OK" }))
        .route("/readyz", get(ready))
        .route("/feeds/{feed}", get(feed_health))
        .route("/metrics", get(prometheus))
        .with_state(state)
}

// =============================================================================
// Handlers
// =============================================================================

async fn health(State(state): State<Arc<HealthServerState>>) -> Response {
    let response = state.response();
    (response.status.status_code(), Json(response)).into_response()
}

/// Ready once market data flows; the portfolio feed is not needed to serve
/// quotes.
async fn ready(State(state): State<Arc<HealthServerState>>) -> Response {
    let connected = state
        .monitor
        .health(FeedType::MarketData)
        .is_some_and(|h| h.is_connected());
    if connected {
        (StatusCode::OK, "READY").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY").into_response()
    }
}

async fn feed_health(
    State(state): State<Arc<HealthServerState>>,
    Path(name): Path<String>,
) -> Response {
    let feed = match name.as_str() {
        "market_data" => FeedType::MarketData,
        "portfolio" => FeedType::Portfolio,
        _ => return (StatusCode::NOT_FOUND, format!("unknown feed: {name}")).into_response(),
    };
    state.monitor.health(feed).map_or_else(
        || (StatusCode::NOT_FOUND, format!("{feed} is not monitored")).into_response(),
        |health| Json(health).into_response(),
    )
}

async fn prometheus() -> Response {
    match get_metrics_handle() {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "Metrics not initialized").into_response(),
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Health server errors.
#[derive(Debug, thiserror::Error)]
pub enum HealthServerError {
    /// The port could not be bound.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Serving failed.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::AlertSink;
    use crate::domain::clock::SystemClock;
    use crate::infrastructure::health::HealthConfig;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn feed_in(feed: FeedType, state: ConnectionState) -> FeedHealth {
        FeedHealth {
            feed,
            state,
            uptime_seconds: 0,
            messages_per_second: 0.0,
            error_rate: 0.0,
            last_message_at: None,
            last_activity_at: None,
            consecutive_failures: 0,
            messages_received: 0,
        }
    }

    #[test]
    fn status_rolls_up_connected_feeds() {
        let both = [
            feed_in(FeedType::MarketData, ConnectionState::Connected),
            feed_in(FeedType::Portfolio, ConnectionState::Connected),
        ];
        assert_eq!(HealthStatus::from_feeds(&both), HealthStatus::Healthy);

        let one = [
            feed_in(FeedType::MarketData, ConnectionState::Connected),
            feed_in(FeedType::Portfolio, ConnectionState::Reconnecting),
        ];
        assert_eq!(HealthStatus::from_feeds(&one), HealthStatus::Degraded);

        assert_eq!(HealthStatus::from_feeds(&[]), HealthStatus::Unhealthy);
    }

    #[test]
    fn failed_feed_is_unhealthy_even_if_another_is_up() {
        let feeds = [
            feed_in(FeedType::MarketData, ConnectionState::Connected),
            feed_in(FeedType::Portfolio, ConnectionState::Failed),
        ];
        assert_eq!(HealthStatus::from_feeds(&feeds), HealthStatus::Unhealthy);
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&HealthStatus::Degraded).unwrap(),
            "\"degraded\""
        );
    }

    fn state_without_feeds(alerts: Arc<AlertHub>) -> Arc<HealthServerState> {
        let monitor = Arc::new(HealthMonitor::new(
            HealthConfig::default(),
            Vec::new(),
            alerts.clone(),
            Arc::new(SystemClock),
            tokio::runtime::Handle::current(),
        ));
        Arc::new(HealthServerState::new(
            "test".to_string(),
            monitor,
            Arc::new(SubscriptionRegistry::new()),
            alerts,
        ))
    }

    async fn get(app: Router, uri: &str) -> Response {
        app.oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn liveness_is_always_ok() {
        let app = router(state_without_feeds(Arc::new(AlertHub::default())));
        assert_eq!(get(app, "/healthz").await.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn nothing_connected_is_unavailable() {
        let app = router(state_without_feeds(Arc::new(AlertHub::default())));

        assert_eq!(
            get(app.clone(), "/health").await.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            get(app, "/readyz").await.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[tokio::test]
    async fn unknown_or_unmonitored_feed_is_not_found() {
        let app = router(state_without_feeds(Arc::new(AlertHub::default())));

        assert_eq!(
            get(app.clone(), "/feeds/options").await.status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            get(app, "/feeds/portfolio").await.status(),
            StatusCode::NOT_FOUND
        );
    }

    #[tokio::test]
    async fn response_carries_latest_alerts() {
        let alerts = Arc::new(AlertHub::default());
        for attempts in 0..30 {
            alerts.raise(Alert::ConnectionFailed {
                feed: FeedType::Portfolio,
                attempts,
            });
        }

        let response = state_without_feeds(alerts).response();
        assert_eq!(response.recent_alerts.len(), RECENT_ALERTS);
        assert_eq!(
            response.recent_alerts.last(),
            Some(&Alert::ConnectionFailed {
                feed: FeedType::Portfolio,
                attempts: 29,
            })
        );
        assert_eq!(response.subscriptions.market_data.topic_count, 0);
    }
}
