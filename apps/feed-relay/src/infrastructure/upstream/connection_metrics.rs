//! Per-supervisor connection counters.
//!
//! Written only by the owning supervisor; read by the health monitor through
//! [`ConnectionMetrics::snapshot`]. All fields are atomics so reads never
//! block the feed task.

use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;

use crate::domain::feed::ConnectionState;

/// Sentinel for "no timestamp recorded".
const UNSET: i64 = i64::MIN;

/// Live counters for one supervisor.
#[derive(Debug)]
pub struct ConnectionMetrics {
    messages_received: AtomicU64,
    bytes_received: AtomicU64,
    error_count: AtomicU64,
    consecutive_failures: AtomicU32,
    last_message_at: AtomicI64,
    last_activity_at: AtomicI64,
    uptime_start: AtomicI64,
}

impl Default for ConnectionMetrics {
    fn default() -> Self {
        Self {
            messages_received: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            consecutive_failures: AtomicU32::new(0),
            last_message_at: AtomicI64::new(UNSET),
            last_activity_at: AtomicI64::new(UNSET),
            uptime_start: AtomicI64::new(UNSET),
        }
    }
}

impl ConnectionMetrics {
    /// Reset per-attempt counters. `consecutive_failures` survives.
    pub fn reset_attempt(&self) {
        self.messages_received.store(0, Ordering::Relaxed);
        self.bytes_received.store(0, Ordering::Relaxed);
        self.error_count.store(0, Ordering::Relaxed);
        self.last_message_at.store(UNSET, Ordering::Relaxed);
        self.last_activity_at.store(UNSET, Ordering::Relaxed);
        self.uptime_start.store(UNSET, Ordering::Relaxed);
    }

    /// Mark the session as connected at `now`.
    pub fn mark_connected(&self, now: DateTime<Utc>) {
        self.uptime_start
            .store(now.timestamp_millis(), Ordering::Relaxed);
    }

    /// Clear the uptime start after the session ends.
    pub fn mark_disconnected(&self) {
        self.uptime_start.store(UNSET, Ordering::Relaxed);
    }

    /// Count inbound bytes.
    pub fn record_bytes(&self, bytes: usize) {
        self.bytes_received
            .fetch_add(u64::try_from(bytes).unwrap_or(u64::MAX), Ordering::Relaxed);
    }

    /// Count a successfully decoded frame.
    pub fn record_message(&self, at: DateTime<Utc>) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.last_message_at
            .store(at.timestamp_millis(), Ordering::Relaxed);
        self.record_alive(at);
    }

    /// Note that the peer was heard from, with or without data.
    pub fn record_alive(&self, at: DateTime<Utc>) {
        self.last_activity_at
            .fetch_max(at.timestamp_millis(), Ordering::Relaxed);
    }

    /// Count a decode error.
    pub fn record_error(&self) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a session failure, returning the new streak length.
    pub fn record_failure(&self) -> u32 {
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// End the failure streak.
    pub fn clear_failures(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    /// Current failure streak.
    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Copy the counters alongside `state`.
    #[must_use]
    pub fn snapshot(&self, state: ConnectionState) -> MetricsSnapshot {
        MetricsSnapshot {
            state,
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            last_message_at: from_millis(self.last_message_at.load(Ordering::Relaxed)),
            last_activity_at: from_millis(self.last_activity_at.load(Ordering::Relaxed)),
            uptime_start: from_millis(self.uptime_start.load(Ordering::Relaxed)),
        }
    }
}

fn from_millis(millis: i64) -> Option<DateTime<Utc>> {
    if millis == UNSET {
        return None;
    }
    Utc.timestamp_millis_opt(millis).single()
}

/// Point-in-time copy of [`ConnectionMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Supervisor state when the snapshot was taken.
    pub state: ConnectionState,
    /// Frames decoded this attempt.
    pub messages_received: u64,
    /// Bytes received this attempt.
    pub bytes_received: u64,
    /// Frames rejected this attempt.
    pub error_count: u64,
    /// Failures since the last healthy session.
    pub consecutive_failures: u32,
    /// Time of the last decoded frame.
    pub last_message_at: Option<DateTime<Utc>>,
    /// Time of the last inbound traffic, keep-alives included.
    pub last_activity_at: Option<DateTime<Utc>>,
    /// When the current session reached `CONNECTED`.
    pub uptime_start: Option<DateTime<Utc>>,
}

impl MetricsSnapshot {
    /// Seconds since the session connected, as of `now`.
    #[must_use]
    pub fn uptime_seconds(&self, now: DateTime<Utc>) -> u64 {
        self.uptime_start
            .map_or(0, |start| u64::try_from((now - start).num_seconds()).unwrap_or(0))
    }

    /// Average decoded frames per second since connecting.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn messages_per_second(&self, now: DateTime<Utc>) -> f64 {
        let Some(start) = self.uptime_start else {
            return 0.0;
        };
        let elapsed_ms = (now - start).num_milliseconds();
        if elapsed_ms <= 0 {
            return 0.0;
        }
        self.messages_received as f64 * 1000.0 / elapsed_ms as f64
    }

    /// Share of frames rejected by the decoder.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn error_rate(&self) -> f64 {
        let total = self.messages_received + self.error_count;
        if total == 0 {
            return 0.0;
        }
        self.error_count as f64 / total as f64
    }
}
