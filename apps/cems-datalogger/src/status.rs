use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Mutex;

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub last_fetch_success: Option<DateTime<Utc>>,
    pub last_send_success: Option<DateTime<Utc>>,
    pub total_sends: u64,
    pub failed_sends: u64,
    pub last_error: Option<String>,
}

/// Shared health counters. Counters only grow; `last_error` is cleared by
/// the next successful send.
#[derive(Debug, Default)]
pub struct StatusTracker {
    inner: Mutex<StatusSnapshot>,
}

impl StatusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.inner
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    pub fn record_fetch_success(&self, at: DateTime<Utc>) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.last_fetch_success = Some(at);
        }
    }

    pub fn record_send_attempt(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.total_sends += 1;
        }
    }

    pub fn record_send_success(&self, at: DateTime<Utc>) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.last_send_success = Some(at);
            guard.last_error = None;
        }
    }

    pub fn record_send_failure(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.failed_sends += 1;
            guard.last_error = Some(err.into());
        }
    }

    pub fn record_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.last_error = Some(err.into());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_clears_last_error_but_keeps_counters() {
        let tracker = StatusTracker::new();
        tracker.record_send_attempt();
        tracker.record_send_failure("Status 503: busy");
        let failed = tracker.snapshot();
        assert_eq!(failed.failed_sends, 1);
        assert_eq!(failed.last_error.as_deref(), Some("Status 503: busy"));

        let now = Utc::now();
        tracker.record_send_attempt();
        tracker.record_send_success(now);
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.total_sends, 2);
        assert_eq!(snapshot.failed_sends, 1);
        assert_eq!(snapshot.last_error, None);
        assert_eq!(snapshot.last_send_success, Some(now));
    }
}
