use super::{ConnectivityProbe, SystemControl};
use crate::config::DiagnosticsConfig;
use crate::reporter::{ErrorReporter, ReportTag};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const ERROR_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Clone, Debug, Default, Serialize)]
pub struct DiagnosticState {
    pub started_at: Option<DateTime<Utc>>,
    pub last_internet_success: Option<DateTime<Utc>>,
    pub last_check_time: Option<DateTime<Utc>>,
    pub last_restart_time: Option<DateTime<Utc>>,
    pub restart_count: u32,
    pub consecutive_failures: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckOutcome {
    Online,
    Offline { minutes_without_internet: i64 },
    RestartDisabled,
    CooldownActive,
    Restarted { restart_count: u32 },
}

/// Periodic connectivity watchdog. Reboots the host once the link has been
/// down for the configured timeout, at most once per cooldown window.
pub struct DiagnosticMonitor {
    config: DiagnosticsConfig,
    probe: Arc<dyn ConnectivityProbe>,
    control: Arc<dyn SystemControl>,
    reporter: Option<Arc<ErrorReporter>>,
    state: Mutex<DiagnosticState>,
}

impl DiagnosticMonitor {
    pub fn new(
        config: DiagnosticsConfig,
        probe: Arc<dyn ConnectivityProbe>,
        control: Arc<dyn SystemControl>,
        reporter: Option<Arc<ErrorReporter>>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            config,
            probe,
            control,
            reporter,
            state: Mutex::new(DiagnosticState {
                started_at: Some(started_at),
                ..DiagnosticState::default()
            }),
        }
    }

    pub fn state(&self) -> DiagnosticState {
        self.state
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    pub fn record_internet_success(&self, at: DateTime<Utc>) {
        if let Ok(mut guard) = self.state.lock() {
            guard.last_internet_success = Some(at);
            guard.consecutive_failures = 0;
        }
    }

    pub async fn run(self: Arc<Self>) {
        tracing::info!(
            every_minutes = self.config.check_interval_minutes,
            timeout_minutes = self.config.internet_timeout_minutes,
            auto_restart = self.config.auto_restart_enabled,
            "diagnostic monitor started"
        );
        loop {
            match self.perform_check(Utc::now()).await {
                Ok(outcome) => {
                    tracing::debug!(?outcome, "diagnostic check done");
                    tokio::time::sleep(self.config.check_interval()).await;
                }
                Err(err) => {
                    tracing::error!(error = %err, "diagnostic check failed");
                    tokio::time::sleep(ERROR_BACKOFF).await;
                }
            }
        }
    }

    pub async fn perform_check(&self, now: DateTime<Utc>) -> Result<CheckOutcome> {
        let result = self.probe.check().await;
        if result.success {
            if let Ok(mut guard) = self.state.lock() {
                guard.last_check_time = Some(now);
            }
            self.record_internet_success(now);
            tracing::debug!(%result, "internet reachable");
            return Ok(CheckOutcome::Online);
        }

        let decision = self.evaluate_failure(now);
        tracing::warn!(%result, ?decision, "internet check failed");
        match decision {
            CheckOutcome::Restarted { restart_count } => {
                let message = format!(
                    "No internet for {}+ minutes. Auto-restarting system (restart #{}).",
                    self.config.internet_timeout_minutes, restart_count
                );
                if let Some(reporter) = &self.reporter {
                    reporter.report(ReportTag::InternetTimeoutRestart, &message).await;
                }
                tracing::error!(restart_count, "rebooting host after prolonged outage");
                self.control.reboot().await.context("reboot command failed")?;
            }
            CheckOutcome::RestartDisabled => {
                tracing::warn!("internet timeout reached but auto-restart is disabled");
            }
            CheckOutcome::CooldownActive => {
                tracing::warn!("internet timeout reached but restart cooldown is active");
            }
            _ => {}
        }
        Ok(decision)
    }

    /// Update counters for a failed check and decide what to do about it.
    fn evaluate_failure(&self, now: DateTime<Utc>) -> CheckOutcome {
        let Ok(mut state) = self.state.lock() else {
            return CheckOutcome::Offline {
                minutes_without_internet: 0,
            };
        };
        state.last_check_time = Some(now);
        state.consecutive_failures += 1;

        // No success on record: the outage has no start to measure from.
        let Some(baseline) = state.last_internet_success else {
            return CheckOutcome::Offline {
                minutes_without_internet: 0,
            };
        };
        let down_for = now - baseline;
        if down_for < self.config.internet_timeout() {
            return CheckOutcome::Offline {
                minutes_without_internet: down_for.num_minutes(),
            };
        }
        if !self.config.auto_restart_enabled {
            return CheckOutcome::RestartDisabled;
        }
        if let Some(last_restart) = state.last_restart_time {
            if now - last_restart < self.config.restart_cooldown() {
                return CheckOutcome::CooldownActive;
            }
        }
        state.restart_count += 1;
        state.last_restart_time = Some(now);
        CheckOutcome::Restarted {
            restart_count: state.restart_count,
        }
    }
}
