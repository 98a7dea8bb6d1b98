//! Alert Hub
//!
//! [`AlertSink`] implementation that logs every alert at a level matching
//! its severity, counts it, keeps a short history, and fans it out on a
//! `tokio::sync::broadcast` channel to external alerting collaborators.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::application::ports::AlertSink;
use crate::domain::alert::{Alert, AlertSeverity};
use crate::infrastructure::metrics;

/// Default broadcast buffer for alert subscribers.
pub const DEFAULT_ALERT_BUFFER: usize = 256;

/// Alerts kept for [`AlertHub::recent`].
const HISTORY_LIMIT: usize = 128;

/// Central alert fan-out.
#[derive(Debug)]
pub struct AlertHub {
    sender: broadcast::Sender<Alert>,
    history: Mutex<VecDeque<Alert>>,
}

impl Default for AlertHub {
    fn default() -> Self {
        Self::new(DEFAULT_ALERT_BUFFER)
    }
}

impl AlertHub {
    /// Create a hub with the given subscriber buffer.
    #[must_use]
    pub fn new(buffer: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer.max(1));
        Self {
            sender,
            history: Mutex::new(VecDeque::with_capacity(HISTORY_LIMIT)),
        }
    }

    /// Receive alerts raised from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Alert> {
        self.sender.subscribe()
    }

    /// Most recent alerts, oldest first.
    #[must_use]
    pub fn recent(&self) -> Vec<Alert> {
        self.history.lock().iter().cloned().collect()
    }
}

impl AlertSink for AlertHub {
    fn raise(&self, alert: Alert) {
        match alert.severity() {
            AlertSeverity::Critical | AlertSeverity::Error => tracing::error!(
                kind = alert.kind().as_str(),
                feed = %alert.feed(),
                "{alert}"
            ),
            AlertSeverity::Warning => tracing::warn!(
                kind = alert.kind().as_str(),
                feed = %alert.feed(),
                "{alert}"
            ),
        }
        metrics::record_alert(alert.kind());

        {
            let mut history = self.history.lock();
            if history.len() == HISTORY_LIMIT {
                history.pop_front();
            }
            history.push_back(alert.clone());
        }

        // No subscribers is fine.
        let _ = self.sender.send(alert);
    }
}
