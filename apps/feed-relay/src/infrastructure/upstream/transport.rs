//! WebSocket Transport
//!
//! [`FeedTransport`] adapter over `tokio-tungstenite`. One [`WsConnection`]
//! per authorized session: binary and text frames are passed up as raw
//! bytes, pings are answered, and a heartbeat detects dead sockets. Pongs
//! and server pings surface as [`Inbound::Alive`] so a quiet but healthy
//! feed still shows activity.
//!
//! The session key, when the provider issues one, is presented in the
//! `x-session-key` header of the upgrade request.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::heartbeat::{Heartbeat, HeartbeatConfig, Pulse};
use crate::application::ports::{
    ConnectionError, ControlMessage, FeedConnection, FeedTransport, Inbound,
};
use crate::domain::feed::{FeedSession, FeedType};

/// Header carrying the session key on the upgrade request.
pub const SESSION_KEY_HEADER: &str = "x-session-key";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// =============================================================================
// Transport
// =============================================================================

/// Opens WebSocket connections to authorized feed endpoints.
#[derive(Debug, Clone, Copy)]
pub struct WebSocketTransport {
    connect_timeout: Duration,
    heartbeat: HeartbeatConfig,
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(10), HeartbeatConfig::default())
    }
}

impl WebSocketTransport {
    /// Create a transport.
    #[must_use]
    pub const fn new(connect_timeout: Duration, heartbeat: HeartbeatConfig) -> Self {
        Self {
            connect_timeout,
            heartbeat,
        }
    }
}

#[async_trait]
impl FeedTransport for WebSocketTransport {
    async fn connect(
        &self,
        session: &FeedSession,
    ) -> Result<Box<dyn FeedConnection>, ConnectionError> {
        let mut request = session
            .socket_endpoint
            .as_str()
            .into_client_request()
            .map_err(|e| ConnectionError::Connect(e.to_string()))?;

        if !session.session_key.is_empty() {
            let value = HeaderValue::from_str(&session.session_key)
                .map_err(|e| ConnectionError::Connect(e.to_string()))?;
            request.headers_mut().insert(SESSION_KEY_HEADER, value);
        }

        tracing::info!(
            feed = %session.feed,
            session_id = %session.session_id,
            "Opening upstream socket"
        );

        let (stream, _response) =
            tokio::time::timeout(self.connect_timeout, tokio_tungstenite::connect_async(request))
                .await
                .map_err(|_| ConnectionError::Timeout(self.connect_timeout))?
                .map_err(|e| ConnectionError::Connect(e.to_string()))?;

        Ok(Box::new(WsConnection::new(session.feed, stream, self.heartbeat)))
    }
}

// =============================================================================
// Connection
// =============================================================================

/// One open WebSocket session.
pub struct WsConnection {
    feed: FeedType,
    stream: WsStream,
    heartbeat: Heartbeat,
    ticker: Interval,
}

impl std::fmt::Debug for WsConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsConnection")
            .field("feed", &self.feed)
            .field("heartbeat", &self.heartbeat)
            .finish_non_exhaustive()
    }
}

impl WsConnection {
    fn new(feed: FeedType, stream: WsStream, config: HeartbeatConfig) -> Self {
        let mut ticker = tokio::time::interval_at(
            Instant::now() + config.interval,
            config.interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self {
            feed,
            stream,
            heartbeat: Heartbeat::new(config),
            ticker,
        }
    }
}

#[async_trait]
impl FeedConnection for WsConnection {
    async fn next_frame(&mut self) -> Option<Result<Inbound, ConnectionError>> {
        loop {
            tokio::select! {
                msg = self.stream.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            self.heartbeat.on_traffic();
                            return Some(Ok(Inbound::Frame(data.to_vec())));
                        }
                        Some(Ok(Message::Text(text))) => {
                            self.heartbeat.on_traffic();
                            return Some(Ok(Inbound::Frame(text.as_str().as_bytes().to_vec())));
                        }
                        Some(Ok(Message::Pong(_))) => {
                            self.heartbeat.on_traffic();
                            return Some(Ok(Inbound::Alive));
                        }
                        Some(Ok(Message::Ping(data))) => {
                            self.heartbeat.on_traffic();
                            if let Err(e) = self.stream.send(Message::Pong(data)).await {
                                return Some(Err(ConnectionError::Socket(e.to_string())));
                            }
                            return Some(Ok(Inbound::Alive));
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let reason = frame.map_or_else(
                                || "no close frame".to_string(),
                                |f| format!("{} {}", u16::from(f.code), f.reason.as_str()),
                            );
                            tracing::info!(feed = %self.feed, reason = %reason, "Server sent close frame");
                            return Some(Err(ConnectionError::Closed(reason)));
                        }
                        Some(Ok(Message::Frame(_))) => {}
                        Some(Err(e)) => {
                            return Some(Err(ConnectionError::Socket(e.to_string())));
                        }
                        None => return None,
                    }
                }
                _ = self.ticker.tick() => {
                    match self.heartbeat.tick() {
                        Pulse::Ping => {
                            if let Err(e) = self.stream.send(Message::Ping(vec![].into())).await {
                                return Some(Err(ConnectionError::Socket(e.to_string())));
                            }
                        }
                        Pulse::Dead { silent_for } => {
                            tracing::warn!(
                                feed = %self.feed,
                                silent_ms = u64::try_from(silent_for.as_millis()).unwrap_or(u64::MAX),
                                unanswered = self.heartbeat.unanswered(),
                                "Socket stopped answering pings"
                            );
                            return Some(Err(ConnectionError::HeartbeatTimeout));
                        }
                    }
                }
            }
        }
    }

    async fn send(&mut self, message: &ControlMessage) -> Result<(), ConnectionError> {
        let json =
            serde_json::to_string(message).map_err(|e| ConnectionError::Send(e.to_string()))?;
        self.stream
            .send(Message::Text(json.into()))
            .await
            .map_err(|e| ConnectionError::Send(e.to_string()))
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            tracing::debug!(feed = %self.feed, error = %e, "Socket close failed");
        }
    }
}
