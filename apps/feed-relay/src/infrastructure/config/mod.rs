//! Configuration Module
//!
//! Configuration loading for the feed relay.

mod settings;

pub use settings::{
    BroadcastSettings, ConfigError, CredentialSource, DEFAULT_API_BASE_URL, HealthSettings,
    ReconnectSettings, RelayConfig, UpstreamSettings,
};
