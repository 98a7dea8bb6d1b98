//! Upstream Brokerage Feed Adapters
//!
//! Everything that talks to the feed provider:
//!
//! - **Authorization**: HTTP exchange of a bearer credential for a feed session
//! - **Transport**: WebSocket sockets with ping/pong heartbeat
//! - **Codec**: MessagePack market data and JSON portfolio frames
//! - **Supervisor**: per-feed session lifecycle and subscription sync

pub mod auth;
pub mod backoff;
pub mod codec;
pub mod connection_metrics;
pub mod credentials;
pub mod heartbeat;
pub mod messages;
pub mod retry;
pub mod supervisor;
pub mod transport;

pub use auth::HttpFeedAuthorizer;
pub use backoff::BackoffPolicy;
pub use codec::{DecodeError, MarketDataDecoder, MessageDecoder, PortfolioDecoder};
pub use connection_metrics::{ConnectionMetrics, MetricsSnapshot};
pub use credentials::{FileCredentials, StaticCredentials};
pub use heartbeat::{Heartbeat, HeartbeatConfig, Pulse};
pub use retry::RetryPolicy;
pub use supervisor::{ConnectionSupervisor, SupervisorConfig, SupervisorDeps};
pub use transport::{WebSocketTransport, WsConnection};
