//! Feed Authorization
//!
//! HTTP adapter for the [`FeedAuthorizer`] port. Exchanges a bearer
//! credential for a socket endpoint and session key.
//!
//! # Endpoints
//!
//! ```text
//! GET {base}/feed/market-data-feed/authorize?mode=full
//! GET {base}/feed/portfolio-stream-feed/authorize?update_types=order,position,holding
//! Authorization: Bearer <token>
//! ```
//!
//! # Status Mapping
//!
//! - 2xx with a usable body: [`FeedSession`]
//! - 401 / 403: [`AuthorizationError::Rejected`] (never retried)
//! - 408 / 429 / 5xx / network errors: [`AuthorizationError::Unavailable`]
//! - anything else: [`AuthorizationError::InvalidResponse`]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use uuid::Uuid;

use super::messages::AuthorizeResponse;
use super::retry::is_retryable_status;
use crate::application::ports::{AuthorizationError, Credential, FeedAuthorizer};
use crate::domain::clock::{Clock, SystemClock};
use crate::domain::feed::{FeedMode, FeedSession, FeedType};

/// Portfolio update categories requested on authorization.
const PORTFOLIO_UPDATE_TYPES: &str = "order,position,holding";

/// Authorizer backed by the provider's REST API.
#[derive(Clone)]
pub struct HttpFeedAuthorizer {
    client: Client,
    base_url: String,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for HttpFeedAuthorizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpFeedAuthorizer")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl HttpFeedAuthorizer {
    /// Create an authorizer for `base_url` with a request timeout.
    ///
    /// # Errors
    ///
    /// Returns `AuthorizationError::Unavailable` if the HTTP client cannot
    /// be built.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, AuthorizationError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AuthorizationError::Unavailable(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            clock: Arc::new(SystemClock),
        })
    }

    /// Replace the clock used to stamp `issued_at`.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn authorize_url(&self, feed: FeedType) -> String {
        match feed {
            FeedType::MarketData => format!("{}/feed/market-data-feed/authorize", self.base_url),
            FeedType::Portfolio => format!("{}/feed/portfolio-stream-feed/authorize", self.base_url),
        }
    }

    fn into_session(
        &self,
        feed: FeedType,
        body: AuthorizeResponse,
    ) -> Result<FeedSession, AuthorizationError> {
        let data = body.data.ok_or_else(|| {
            AuthorizationError::InvalidResponse(format!("status {} without data", body.status))
        })?;

        if !(data.socket_endpoint.starts_with("wss://") || data.socket_endpoint.starts_with("ws://"))
        {
            return Err(AuthorizationError::InvalidResponse(format!(
                "unsupported socket endpoint scheme: {}",
                data.socket_endpoint
            )));
        }

        let issued_at = self.clock.now();
        let expires_at = data
            .expires_in
            .filter(|secs| *secs > 0)
            .map(|secs| issued_at + chrono::Duration::seconds(secs));

        Ok(FeedSession {
            feed,
            session_id: Uuid::new_v4(),
            session_key: data.session_key.unwrap_or_default(),
            socket_endpoint: data.socket_endpoint,
            issued_at,
            expires_at,
        })
    }
}

#[async_trait]
impl FeedAuthorizer for HttpFeedAuthorizer {
    async fn authorize(
        &self,
        feed: FeedType,
        mode: FeedMode,
        credential: &Credential,
    ) -> Result<FeedSession, AuthorizationError> {
        let request = self
            .client
            .get(self.authorize_url(feed))
            .bearer_auth(credential.token())
            .header("Accept", "application/json");
        let request = match feed {
            FeedType::MarketData => request.query(&[("mode", mode.as_str())]),
            FeedType::Portfolio => request.query(&[("update_types", PORTFOLIO_UPDATE_TYPES)]),
        };

        let response = request
            .send()
            .await
            .map_err(|e| AuthorizationError::Unavailable(e.to_string()))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| AuthorizationError::Unavailable(e.to_string()))?;

        if status.is_success() {
            let body: AuthorizeResponse = serde_json::from_str(&text)
                .map_err(|e| AuthorizationError::InvalidResponse(e.to_string()))?;
            let session = self.into_session(feed, body)?;
            tracing::debug!(
                feed = %feed,
                session_id = %session.session_id,
                "Feed session authorized"
            );
            return Ok(session);
        }

        let message = serde_json::from_str::<AuthorizeResponse>(&text)
            .ok()
            .and_then(|body| body.errors.into_iter().next())
            .map_or(text, |entry| entry.message);

        Err(classify_failure(status, message))
    }
}

fn classify_failure(status: StatusCode, message: String) -> AuthorizationError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => AuthorizationError::Rejected {
            status: status.as_u16(),
            message,
        },
        s if is_retryable_status(s.as_u16()) => {
            AuthorizationError::Unavailable(format!("{}: {message}", s.as_u16()))
        }
        s => AuthorizationError::InvalidResponse(format!("{}: {message}", s.as_u16())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::clock::ManualClock;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn authorizer(server: &MockServer) -> HttpFeedAuthorizer {
        HttpFeedAuthorizer::new(server.uri(), Duration::from_secs(2))
            .unwrap()
            .with_clock(Arc::new(ManualClock::at_millis(1_718_000_000_000)))
    }

    #[tokio::test]
    async fn market_data_session_is_returned() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed/market-data-feed/authorize"))
            .and(query_param("mode", "option_greeks"))
            .and(header("authorization", "Bearer token-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "success",
                "data": {
                    "socketEndpoint": "wss://feed.example.com/market",
                    "sessionKey": "sk-123",
                    "expiresIn": 3600
                }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let session = authorizer(&server)
            .authorize(
                FeedType::MarketData,
                FeedMode::OptionGreeks,
                &Credential::bearer("token-1"),
            )
            .await
            .unwrap();

        assert_eq!(session.feed, FeedType::MarketData);
        assert_eq!(session.socket_endpoint, "wss://feed.example.com/market");
        assert_eq!(session.session_key, "sk-123");
        assert_eq!(
            session.expires_at.unwrap() - session.issued_at,
            chrono::Duration::seconds(3600)
        );
    }

    #[tokio::test]
    async fn portfolio_accepts_redirect_uri_alias() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed/portfolio-stream-feed/authorize"))
            .and(query_param("update_types", PORTFOLIO_UPDATE_TYPES))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "success",
                "data": {"authorized_redirect_uri": "wss://feed.example.com/portfolio?code=abc"}
            })))
            .mount(&server)
            .await;

        let session = authorizer(&server)
            .authorize(FeedType::Portfolio, FeedMode::Full, &Credential::bearer("t"))
            .await
            .unwrap();

        assert_eq!(session.feed, FeedType::Portfolio);
        assert!(session.session_key.is_empty());
        assert!(session.expires_at.is_none());
    }

    #[tokio::test]
    async fn unauthorized_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
                "status": "error",
                "errors": [{"errorCode": "UDAPI100050", "message": "Invalid token used to access API"}]
            })))
            .mount(&server)
            .await;

        let err = authorizer(&server)
            .authorize(FeedType::MarketData, FeedMode::Full, &Credential::bearer("bad"))
            .await
            .unwrap_err();

        assert_eq!(
            err,
            AuthorizationError::Rejected {
                status: 401,
                message: "Invalid token used to access API".to_string(),
            }
        );
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn server_error_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;

        let err = authorizer(&server)
            .authorize(FeedType::MarketData, FeedMode::Full, &Credential::bearer("t"))
            .await
            .unwrap_err();

        assert!(matches!(err, AuthorizationError::Unavailable(ref m) if m.contains("503")));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn http_endpoint_is_invalid() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "success",
                "data": {"socketEndpoint": "https://not-a-socket"}
            })))
            .mount(&server)
            .await;

        let err = authorizer(&server)
            .authorize(FeedType::MarketData, FeedMode::Full, &Credential::bearer("t"))
            .await
            .unwrap_err();

        assert!(matches!(err, AuthorizationError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_unavailable() {
        let authorizer =
            HttpFeedAuthorizer::new("http://127.0.0.1:9", Duration::from_millis(500)).unwrap();
        let err = authorizer
            .authorize(FeedType::Portfolio, FeedMode::Full, &Credential::bearer("t"))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthorizationError::Unavailable(_)));
    }
}
