//! Feed Relay Binary
//!
//! Starts both brokerage feeds, the health monitor and the health endpoint,
//! and logs updates for a configured watchlist.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin feed-relay
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `FEED_ACCESS_TOKEN`: Bearer token (or `FEED_ACCESS_TOKEN_FILE`)
//!
//! ## Optional
//! - `FEED_ACCESS_TOKEN_FILE`: Token file re-read on every authorization
//! - `FEED_API_BASE_URL`: Provider API root (default: <https://api.upstox.com/v3>)
//! - `FEED_MARKET_DATA_MODE`: ltpc | full | option_greeks (default: full)
//! - `FEED_RELAY_HEALTH_PORT`: Health check HTTP port (default: 8083)
//! - `FEED_RELAY_WATCHLIST`: Comma-separated instrument keys to log
//! - `FEED_RECONNECT_BASE_MS` / `FEED_RECONNECT_CAP_MS` / `FEED_RECONNECT_MAX_ATTEMPTS`
//! - `FEED_HEALTH_INTERVAL_MS` / `FEED_SILENCE_THRESHOLD_MS`
//! - `LOG_FORMAT`: text | json (default: text)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: true)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use feed_relay::application::ports::CredentialSupplier;
use feed_relay::domain::subscription::ConsumerId;
use feed_relay::infrastructure::health::{HealthServer, HealthServerState};
use feed_relay::infrastructure::telemetry;
use feed_relay::{
    CredentialSource, FeedRelay, FeedType, FileCredentials, HttpFeedAuthorizer, QuoteRecord,
    RelayConfig, StaticCredentials, WebSocketTransport, consumer_fn, init_metrics,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("a rustls crypto provider is already installed"))?;

    load_dotenv();

    let _telemetry_guard = telemetry::init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting feed relay");

    init_metrics().context("failed to install Prometheus recorder")?;

    let config = RelayConfig::from_env()?;
    log_config(&config);

    let credentials: Arc<dyn CredentialSupplier> = match &config.credentials {
        CredentialSource::Token(token) => Arc::new(StaticCredentials::new(token.clone())),
        CredentialSource::File(path) => Arc::new(FileCredentials::new(path.clone())),
    };
    let authorizer = HttpFeedAuthorizer::new(
        config.upstream.api_base_url.clone(),
        config.upstream.auth_timeout,
    )?;
    let transport =
        WebSocketTransport::new(config.upstream.connect_timeout, config.heartbeat_config());

    let relay = Arc::new(
        FeedRelay::builder()
            .authorizer(Arc::new(authorizer))
            .credentials(credentials)
            .transport(Arc::new(transport))
            .supervisor_config(config.supervisor_config())
            .health_config(config.health_config())
            .broadcast_config(config.broadcast_config())
            .build()?,
    );

    subscribe_watchlist(&relay, &config);

    let shutdown_token = CancellationToken::new();

    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        Arc::clone(relay.monitor()),
        Arc::clone(relay.registry()),
        Arc::clone(relay.alerts()),
    ));
    let health_server = HealthServer::new(
        config.health.port,
        health_state,
        shutdown_token.clone(),
    );
    let health_handle = tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server failed");
        }
    });

    for (feed, state) in relay.start().await {
        tracing::info!(feed = %feed, state = %state, "Initial feed state");
    }

    await_shutdown(shutdown_token).await;

    if tokio::time::timeout(SHUTDOWN_TIMEOUT, relay.shutdown())
        .await
        .is_err()
    {
        tracing::warn!("Relay shutdown timed out");
    }
    let _ = tokio::time::timeout(Duration::from_secs(5), health_handle).await;

    tracing::info!("Feed relay stopped");
    Ok(())
}

/// Log every update for the configured watchlist and the portfolio feed.
fn subscribe_watchlist(relay: &FeedRelay, config: &RelayConfig) {
    let consumer = ConsumerId::new("watchlist-logger");
    let log_update = consumer_fn(|record: Arc<QuoteRecord>| {
        tracing::info!(
            feed = %record.feed,
            topic = %record.topic,
            synthetic = record.is_synthetic,
            received_at = %record.received_at,
            "Update"
        );
        Ok(())
    });

    let topics = config
        .watchlist
        .iter()
        .map(|topic| (FeedType::MarketData, topic.clone()))
        .chain(std::iter::once((
            FeedType::Portfolio,
            feed_relay::Topic::portfolio(),
        )));

    for (feed, topic) in topics {
        match relay.subscribe(feed, topic.clone(), consumer.clone(), Arc::clone(&log_update)) {
            Ok(_) => tracing::info!(feed = %feed, topic = %topic, "Watching"),
            Err(e) => tracing::warn!(feed = %feed, error = %e, "Skipping watchlist entry"),
        }
    }
}

fn log_config(config: &RelayConfig) {
    tracing::info!(
        api_base_url = %config.upstream.api_base_url,
        mode = config.upstream.market_data_mode.as_str(),
        health_port = config.health.port,
        max_attempts = config.reconnect.max_attempts,
        watchlist = config.watchlist.len(),
        "Configuration loaded"
    );
}

fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let found = cwd
            .ancestors()
            .skip(1)
            .map(|dir| dir.join(".env"))
            .find(|path| path.exists());
        if let Some(path) = found {
            let _ = dotenvy::from_path(&path);
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Ctrl+C handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
}
