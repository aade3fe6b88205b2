use crate::config::Config;
use crate::sensor_config::SensorStore;
use crate::time::report_timestamp;
use anyhow::Result;
use chrono::{DateTime, Utc};
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};

const PUBLIC_IP_TIMEOUT: Duration = Duration::from_secs(5);
const REPORT_TIMEOUT: Duration = Duration::from_secs(10);
const UNKNOWN_IP: &str = "Unknown";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReportTag {
    Heartbeat,
    SendFailed,
    FetchError,
    InternetTimeoutRestart,
}

impl ReportTag {
    pub fn as_str(self) -> &'static str {
        match self {
            ReportTag::Heartbeat => "HEARTBEAT",
            ReportTag::SendFailed => "SEND_FAILED",
            ReportTag::FetchError => "FETCH_ERROR",
            ReportTag::InternetTimeoutRestart => "INTERNET_TIMEOUT_RESTART",
        }
    }
}

/// Posts operator notifications to the operations endpoint. Never fails the
/// caller: every error is logged and folded into the boolean result.
#[derive(Clone, Debug)]
pub struct ErrorReporter {
    client: Client,
    endpoint: String,
    session_cookie: String,
    uid: String,
    public_ip_url: String,
}

impl ErrorReporter {
    pub fn new(config: &Config) -> Result<Self> {
        let client = Client::builder().build()?;
        Ok(Self {
            client,
            endpoint: config.error_endpoint_url.clone(),
            session_cookie: config.error_session_cookie.clone(),
            uid: config.uid.clone(),
            public_ip_url: config.public_ip_url.clone(),
        })
    }

    pub async fn public_ip(&self) -> String {
        let response = self
            .client
            .get(&self.public_ip_url)
            .timeout(PUBLIC_IP_TIMEOUT)
            .send()
            .await;
        match response {
            Ok(response) => match response.text().await {
                Ok(body) if !body.trim().is_empty() => body.trim().to_string(),
                Ok(_) => UNKNOWN_IP.to_string(),
                Err(err) => {
                    tracing::warn!(error = %err, "failed to read public ip");
                    UNKNOWN_IP.to_string()
                }
            },
            Err(err) => {
                tracing::warn!(error = %err, "failed to get public ip");
                UNKNOWN_IP.to_string()
            }
        }
    }

    pub async fn report(&self, tag: ReportTag, message: &str) -> bool {
        let ip = self.public_ip().await;
        self.report_from(tag, &ip, message).await
    }

    /// Same as [`Self::report`] with an already resolved public IP.
    pub async fn report_from(&self, tag: ReportTag, ip: &str, message: &str) -> bool {
        let line = compose_report(tag, &self.uid, ip, message, Utc::now());
        if tag == ReportTag::Heartbeat {
            tracing::info!(report = %line, "sending heartbeat");
        } else {
            tracing::error!(report = %line, "sending error report");
        }

        let result = self
            .client
            .post(&self.endpoint)
            .header("Cookie", format!("ci_session={}", self.session_cookie))
            .form(&[("error", line.as_str())])
            .timeout(REPORT_TIMEOUT)
            .send()
            .await;
        match result {
            Ok(response) => {
                let status = response.status();
                tracing::info!(status = status.as_u16(), "report endpoint answered");
                status == reqwest::StatusCode::OK
            }
            Err(err) => {
                tracing::error!(error = %err, tag = tag.as_str(), "failed to send report");
                false
            }
        }
    }

    /// Fire-and-forget variant for callers on a hot path.
    pub fn spawn_report(self: &Arc<Self>, tag: ReportTag, message: String) {
        let reporter = self.clone();
        tokio::spawn(async move {
            reporter.report(tag, &message).await;
        });
    }
}

pub fn compose_report(
    tag: ReportTag,
    uid: &str,
    ip: &str,
    message: &str,
    now: DateTime<Utc>,
) -> String {
    format!(
        "{} - UID:{} - IP:{} - Message:{} - Time:{}",
        tag.as_str(),
        uid,
        ip,
        message,
        report_timestamp(now)
    )
}

/// First beat after one full interval, then every interval while running.
pub async fn run_heartbeat(reporter: Arc<ErrorReporter>, store: Arc<SensorStore>, every: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        if !store.is_running() {
            tracing::debug!("server stopped; heartbeat skipped");
            continue;
        }
        send_heartbeat(&reporter).await;
    }
}

/// One heartbeat; the public IP is resolved once for both the line and the message.
pub async fn send_heartbeat(reporter: &ErrorReporter) -> bool {
    let ip = reporter.public_ip().await;
    let message = format!("Heartbeat - System Running - IP: {ip}");
    reporter.report_from(ReportTag::Heartbeat, &ip, &message).await
}
