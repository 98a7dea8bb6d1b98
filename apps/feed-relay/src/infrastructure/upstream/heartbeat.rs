//! Socket Liveness
//!
//! The WebSocket transport pings on a fixed interval. Any inbound frame
//! counts as proof of life; a socket that stays quiet past the timeout while
//! a ping is outstanding is declared dead.
//!
//! Time comes from `tokio::time::Instant`, so paused-clock tests drive it.

use std::time::Duration;

use tokio::time::Instant;

/// Ping cadence and dead-socket threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Time between pings.
    pub interval: Duration,
    /// Quiet time, with a ping outstanding, after which the socket is dead.
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(20), Duration::from_secs(20))
    }
}

impl HeartbeatConfig {
    /// Pair an interval with a timeout.
    #[must_use]
    pub const fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }
}

/// Outcome of one heartbeat tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pulse {
    /// Write a ping frame.
    Ping,
    /// Nothing arrived for `silent_for`, which exceeds the timeout.
    Dead {
        /// Time since the last inbound frame.
        silent_for: Duration,
    },
}

/// Liveness tracker for one socket.
#[derive(Debug)]
pub struct Heartbeat {
    config: HeartbeatConfig,
    last_seen: Instant,
    unanswered: u32,
}

impl Heartbeat {
    /// Start tracking a socket that just opened.
    #[must_use]
    pub fn new(config: HeartbeatConfig) -> Self {
        Self {
            config,
            last_seen: Instant::now(),
            unanswered: 0,
        }
    }

    /// Settings in use.
    #[must_use]
    pub const fn config(&self) -> HeartbeatConfig {
        self.config
    }

    /// Any frame from the peer, pong or data.
    pub fn on_traffic(&mut self) {
        self.last_seen = Instant::now();
        self.unanswered = 0;
    }

    /// Pings sent since the peer was last heard from.
    #[must_use]
    pub const fn unanswered(&self) -> u32 {
        self.unanswered
    }

    /// Time since the peer was last heard from.
    #[must_use]
    pub fn silent_for(&self) -> Duration {
        self.last_seen.elapsed()
    }

    /// Called on every interval tick.
    pub fn tick(&mut self) -> Pulse {
        let silent_for = self.silent_for();
        if self.unanswered > 0 && silent_for > self.config.timeout {
            return Pulse::Dead { silent_for };
        }
        self.unanswered = self.unanswered.saturating_add(1);
        Pulse::Ping
    }
}
