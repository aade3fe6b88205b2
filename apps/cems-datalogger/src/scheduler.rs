use crate::aggregator::Aggregator;
use crate::queue::{QueueItem, QueueWorker, RetryQueue};
use crate::reporter::{ErrorReporter, ReportTag};
use crate::sensor_config::SensorStore;
use crate::status::StatusTracker;
use crate::time::{align_up_ms, iso_site};
use crate::uplink::UplinkClient;
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

const IDLE_POLL: Duration = Duration::from_secs(5);
const ERROR_BACKOFF: Duration = Duration::from_secs(10);

/// Submission grid. The boundary moves by exactly one interval per fired
/// cycle, so a process that falls behind catches up one boundary at a time
/// instead of skipping any.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GridClock {
    interval_ms: i64,
    next_boundary_ms: i64,
}

impl GridClock {
    pub fn starting_at(now_ms: i64, interval_secs: i64) -> Self {
        Self {
            interval_ms: interval_secs.max(1) * 1000,
            next_boundary_ms: align_up_ms(now_ms, interval_secs),
        }
    }

    pub fn next_boundary_ms(&self) -> i64 {
        self.next_boundary_ms
    }

    pub fn is_due(&self, now_ms: i64) -> bool {
        now_ms >= self.next_boundary_ms
    }

    /// Time to sleep before checking again, capped at the idle poll.
    pub fn wait_time(&self, now_ms: i64) -> Duration {
        let remaining = (self.next_boundary_ms - now_ms).max(0) as u64;
        Duration::from_millis(remaining).min(IDLE_POLL)
    }

    /// Consume the current boundary; returns it.
    pub fn advance(&mut self) -> i64 {
        let fired = self.next_boundary_ms;
        self.next_boundary_ms += self.interval_ms;
        fired
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CycleOutcome {
    NoData,
    Sent,
    Failed { queued: bool },
}

pub struct LoggerLoop {
    pub store: Arc<SensorStore>,
    pub aggregator: Arc<Aggregator>,
    pub uplink: UplinkClient,
    pub queue: Arc<RetryQueue>,
    pub worker: Arc<QueueWorker>,
    pub status: Arc<StatusTracker>,
    pub reporter: Arc<ErrorReporter>,
    pub grid_interval_secs: i64,
}

impl LoggerLoop {
    pub async fn run(self) {
        let mut clock = GridClock::starting_at(Utc::now().timestamp_millis(), self.grid_interval_secs);
        tracing::info!(
            next = %iso_site(DateTime::<Utc>::from_timestamp_millis(clock.next_boundary_ms()).unwrap_or_else(Utc::now)),
            interval_secs = self.grid_interval_secs,
            "logger loop started"
        );

        loop {
            if !self.store.is_running() {
                tokio::time::sleep(IDLE_POLL).await;
                continue;
            }
            let now = Utc::now();
            if !clock.is_due(now.timestamp_millis()) {
                tokio::time::sleep(clock.wait_time(now.timestamp_millis())).await;
                continue;
            }

            let boundary = clock.advance();
            match self.run_cycle(now).await {
                Ok(outcome) => tracing::debug!(boundary, ?outcome, "logger cycle done"),
                Err(err) => {
                    tracing::error!(error = %err, "logger cycle failed");
                    self.status.record_error(err.to_string());
                    tokio::time::sleep(ERROR_BACKOFF).await;
                }
            }
        }
    }

    /// Drain averages and submit them; on failure report once and queue the
    /// exact ciphertext that was attempted.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> Result<CycleOutcome> {
        let averages = self.aggregator.drain();
        if averages.is_empty() {
            tracing::warn!("no averaged readings for this boundary; skipped");
            return Ok(CycleOutcome::NoData);
        }

        let report = self.uplink.send(&averages, now).await;
        self.status.record_send_attempt();

        if report.success {
            self.status.record_send_success(Utc::now());
            let samples: usize = averages.values().map(|reading| reading.samples).sum();
            tracing::info!(params = averages.len(), samples, "data sent successfully");
            self.worker.trigger();
            return Ok(CycleOutcome::Sent);
        }

        let last_error = format!("Status {}: {}", report.http_status, report.response_body.trim());
        self.status.record_send_failure(last_error.clone());
        self.reporter.report(ReportTag::SendFailed, &last_error).await;

        let mut queued = false;
        if report.should_requeue {
            if let (Some(encrypted_payload), Some(aligned_ts)) =
                (report.encrypted_payload, report.aligned_ts)
            {
                self.queue.push(QueueItem {
                    encrypted_payload,
                    timestamp: iso_site(now),
                    aligned_ts: Some(aligned_ts),
                })
                .await?;
                queued = true;
                tracing::warn!(queued = self.queue.len(), "payload queued for retry");
            }
        }
        Ok(CycleOutcome::Failed { queued })
    }
}
