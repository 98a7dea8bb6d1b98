//! Relay Configuration Settings
//!
//! Configuration types for the feed relay, loaded from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use crate::domain::feed::{FeedMode, Topic};
use crate::infrastructure::broadcast::BroadcastConfig;
use crate::infrastructure::health::HealthConfig;
use crate::infrastructure::upstream::{BackoffPolicy, HeartbeatConfig, SupervisorConfig};

/// Default provider API root.
pub const DEFAULT_API_BASE_URL: &str = "https://api.upstox.com/v3";

/// Where the bearer credential comes from.
#[derive(Clone, PartialEq, Eq)]
pub enum CredentialSource {
    /// Token given directly in the environment.
    Token(String),
    /// File re-read on every authorization, kept fresh by an external refresher.
    File(PathBuf),
}

impl std::fmt::Debug for CredentialSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Token(_) => f.debug_tuple("Token").field(&"[REDACTED]").finish(),
            Self::File(path) => f.debug_tuple("File").field(path).finish(),
        }
    }
}

/// Upstream provider settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamSettings {
    /// Provider API root used for authorization.
    pub api_base_url: String,
    /// Market data mode.
    pub market_data_mode: FeedMode,
    /// Authorization request timeout.
    pub auth_timeout: Duration,
    /// WebSocket connect timeout.
    pub connect_timeout: Duration,
    /// Heartbeat ping interval.
    pub heartbeat_interval: Duration,
    /// Heartbeat timeout before considering connection dead.
    pub heartbeat_timeout: Duration,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            market_data_mode: FeedMode::Full,
            auth_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(20),
            heartbeat_timeout: Duration::from_secs(20),
        }
    }
}

/// Reconnect backoff settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectSettings {
    /// Backoff base.
    pub base: Duration,
    /// Backoff cap.
    pub cap: Duration,
    /// Consecutive failures before a feed is marked failed.
    pub max_attempts: u32,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(60),
            max_attempts: 10,
        }
    }
}

/// Health monitor and endpoint settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthSettings {
    /// Health check HTTP port.
    pub port: u16,
    /// Inspection interval.
    pub interval: Duration,
    /// Silence tolerated on a connected feed.
    pub silence_threshold: Duration,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            port: 8083,
            interval: Duration::from_secs(5),
            silence_threshold: Duration::from_secs(30),
        }
    }
}

/// Consumer delivery settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastSettings {
    /// Per-subscription queue capacity.
    pub queue_capacity: usize,
    /// Callback time limit.
    pub callback_timeout: Duration,
    /// Consecutive failures before a consumer is evicted.
    pub eviction_threshold: u32,
}

impl Default for BroadcastSettings {
    fn default() -> Self {
        let defaults = BroadcastConfig::default();
        Self {
            queue_capacity: defaults.queue_capacity,
            callback_timeout: defaults.callback_timeout,
            eviction_threshold: defaults.eviction_threshold,
        }
    }
}

/// Complete relay configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Bearer credential source.
    pub credentials: CredentialSource,
    /// Upstream provider settings.
    pub upstream: UpstreamSettings,
    /// Reconnect backoff settings.
    pub reconnect: ReconnectSettings,
    /// Health settings.
    pub health: HealthSettings,
    /// Consumer delivery settings.
    pub broadcast: BroadcastSettings,
    /// Instruments subscribed at startup.
    pub watchlist: Vec<Topic>,
}

impl RelayConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required environment variables are missing or a
    /// value cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Same as [`Self::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(&lookup);

        let credentials = match env.get("FEED_ACCESS_TOKEN_FILE") {
            Some(path) => CredentialSource::File(PathBuf::from(path)),
            None => {
                let token = lookup("FEED_ACCESS_TOKEN")
                    .ok_or_else(|| ConfigError::MissingEnvVar("FEED_ACCESS_TOKEN".to_string()))?;
                if token.trim().is_empty() {
                    return Err(ConfigError::EmptyValue("FEED_ACCESS_TOKEN".to_string()));
                }
                CredentialSource::Token(token.trim().to_string())
            }
        };

        let upstream_defaults = UpstreamSettings::default();
        let upstream = UpstreamSettings {
            api_base_url: env
                .get("FEED_API_BASE_URL")
                .unwrap_or(upstream_defaults.api_base_url),
            market_data_mode: env
                .get("FEED_MARKET_DATA_MODE")
                .map(|v| parse_mode(&v))
                .transpose()?
                .unwrap_or(upstream_defaults.market_data_mode),
            auth_timeout: env.millis("FEED_AUTH_TIMEOUT_MS", upstream_defaults.auth_timeout)?,
            connect_timeout: env
                .millis("FEED_CONNECT_TIMEOUT_MS", upstream_defaults.connect_timeout)?,
            heartbeat_interval: env.millis(
                "FEED_HEARTBEAT_INTERVAL_MS",
                upstream_defaults.heartbeat_interval,
            )?,
            heartbeat_timeout: env
                .millis("FEED_HEARTBEAT_TIMEOUT_MS", upstream_defaults.heartbeat_timeout)?,
        };

        let reconnect_defaults = ReconnectSettings::default();
        let reconnect = ReconnectSettings {
            base: env.millis("FEED_RECONNECT_BASE_MS", reconnect_defaults.base)?,
            cap: env.millis("FEED_RECONNECT_CAP_MS", reconnect_defaults.cap)?,
            max_attempts: env
                .parse("FEED_RECONNECT_MAX_ATTEMPTS", reconnect_defaults.max_attempts)?,
        };

        let health_defaults = HealthSettings::default();
        let health = HealthSettings {
            port: env.parse("FEED_RELAY_HEALTH_PORT", health_defaults.port)?,
            interval: env.millis("FEED_HEALTH_INTERVAL_MS", health_defaults.interval)?,
            silence_threshold: env
                .millis("FEED_SILENCE_THRESHOLD_MS", health_defaults.silence_threshold)?,
        };

        let broadcast_defaults = BroadcastSettings::default();
        let broadcast = BroadcastSettings {
            queue_capacity: env
                .parse("FEED_CONSUMER_QUEUE_CAPACITY", broadcast_defaults.queue_capacity)?,
            callback_timeout: env
                .millis("FEED_CONSUMER_TIMEOUT_MS", broadcast_defaults.callback_timeout)?,
            eviction_threshold: env.parse(
                "FEED_CONSUMER_EVICTION_THRESHOLD",
                broadcast_defaults.eviction_threshold,
            )?,
        };

        let watchlist = env
            .get("FEED_RELAY_WATCHLIST")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(Topic::from)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            credentials,
            upstream,
            reconnect,
            health,
            broadcast,
            watchlist,
        })
    }

    /// Reconnect backoff policy.
    #[must_use]
    pub const fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            self.reconnect.base,
            self.reconnect.cap,
            self.reconnect.max_attempts,
        )
    }

    /// Health monitor configuration.
    #[must_use]
    pub const fn health_config(&self) -> HealthConfig {
        HealthConfig {
            interval: self.health.interval,
            silence_threshold: self.health.silence_threshold,
            backoff: self.backoff_policy(),
        }
    }

    /// Broadcaster configuration.
    #[must_use]
    pub const fn broadcast_config(&self) -> BroadcastConfig {
        BroadcastConfig {
            queue_capacity: self.broadcast.queue_capacity,
            callback_timeout: self.broadcast.callback_timeout,
            eviction_threshold: self.broadcast.eviction_threshold,
        }
    }

    /// Supervisor configuration shared by both feeds.
    #[must_use]
    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            mode: self.upstream.market_data_mode,
            ..SupervisorConfig::default()
        }
    }

    /// Transport heartbeat configuration.
    #[must_use]
    pub const fn heartbeat_config(&self) -> HeartbeatConfig {
        HeartbeatConfig::new(
            self.upstream.heartbeat_interval,
            self.upstream.heartbeat_timeout,
        )
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable could not be parsed.
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// Rejected value.
        value: String,
    },
}

struct Env<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    /// Non-empty, trimmed value.
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T: std::str::FromStr>(&self, key: &str, default: T) -> Result<T, ConfigError> {
        self.get(key).map_or(Ok(default), |value| {
            value.parse().map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value,
            })
        })
    }

    fn millis(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
        self.parse(key, default_ms).map(Duration::from_millis)
    }
}

fn parse_mode(value: &str) -> Result<FeedMode, ConfigError> {
    FeedMode::parse(value).ok_or_else(|| ConfigError::InvalidValue {
        key: "FEED_MARKET_DATA_MODE".to_string(),
        value: value.to_string(),
    })
}
