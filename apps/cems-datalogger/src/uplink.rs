use crate::aggregator::AveragedReadings;
use crate::crypto::{CryptoError, Signer};
use crate::payload::{build_plain_payload, PayloadFormat};
use crate::time::validate_timestamp;
use anyhow::Result;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const SUBMIT_TIMEOUT: Duration = Duration::from_secs(20);
const NO_RESPONSE: &str = "Max retries exceeded - No response from server";
pub const MAX_RETRIES: u32 = 10;

/// Exponential backoff before retry `attempt + 1`, saturating instead of overflowing.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt))
}

/// How a single upstream answer is handled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    Success,
    /// 200 with a rejection body: the payload itself is wrong, never resend it.
    DataError,
    /// 4xx: stop now, resend later from the queue.
    ClientError,
    /// 5xx, other statuses and transport failures: back off and retry.
    Retryable,
}

#[derive(Debug, Deserialize)]
struct UpstreamReply {
    msg: Option<String>,
    status: Option<i64>,
}

pub fn parse_reply_status(body: &str) -> Option<i64> {
    serde_json::from_str::<UpstreamReply>(body.trim())
        .ok()
        .and_then(|reply| reply.status)
}

pub fn is_success_body(body: &str) -> bool {
    serde_json::from_str::<UpstreamReply>(body.trim())
        .map(|reply| reply.msg.as_deref() == Some("success") && reply.status == Some(1))
        .unwrap_or(false)
}

pub fn classify(status: u16, body: &str) -> SendOutcome {
    match status {
        200 if is_success_body(body) => SendOutcome::Success,
        200 => SendOutcome::DataError,
        400..=499 => SendOutcome::ClientError,
        _ => SendOutcome::Retryable,
    }
}

#[derive(Debug, Error)]
pub enum UplinkError {
    #[error("regulator public key unavailable")]
    MissingKey,
    #[error("signature failed: {0}")]
    Signature(#[from] CryptoError),
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

#[derive(Clone, Debug, PartialEq)]
pub struct SendReport {
    pub success: bool,
    pub http_status: u16,
    pub response_body: String,
    pub should_requeue: bool,
    pub encrypted_payload: Option<String>,
    pub aligned_ts: Option<i64>,
}

impl SendReport {
    fn not_sent(body: &str) -> Self {
        Self {
            success: false,
            http_status: 0,
            response_body: body.to_string(),
            should_requeue: false,
            encrypted_payload: None,
            aligned_ts: None,
        }
    }
}

/// Submission client for the compliance endpoint. Cheap to clone; the
/// queue worker shares it with the scheduler.
#[derive(Clone)]
pub struct UplinkClient {
    client: Client,
    endpoint: String,
    token_id: String,
    signer: Option<Arc<Signer>>,
    format: PayloadFormat,
    max_retries: u32,
    backoff_base: Duration,
}

impl UplinkClient {
    pub fn new(
        endpoint: impl Into<String>,
        token_id: impl Into<String>,
        signer: Option<Signer>,
        format: PayloadFormat,
        max_retries: u32,
    ) -> Result<Self> {
        Ok(Self {
            client: Client::builder().build()?,
            endpoint: endpoint.into(),
            token_id: token_id.into(),
            signer: signer.map(Arc::new),
            format,
            max_retries: max_retries.clamp(1, MAX_RETRIES),
            backoff_base: Duration::from_secs(1),
        })
    }

    #[cfg(test)]
    pub fn with_backoff_base(mut self, backoff_base: Duration) -> Self {
        self.backoff_base = backoff_base;
        self
    }

    /// One POST of already-encrypted payload with a freshly generated signature.
    pub async fn post_encrypted(&self, encrypted: &str) -> Result<(u16, String), UplinkError> {
        let signer = self.signer.as_ref().ok_or(UplinkError::MissingKey)?;
        let signature = signer.sign(Utc::now())?;
        let response = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "text/plain")
            .header("X-Device-Id", &self.format.device_id)
            .header("signature", signature)
            .body(encrypted.to_string())
            .timeout(SUBMIT_TIMEOUT)
            .send()
            .await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok((status, body))
    }

    /// Build, encrypt once, then submit with bounded retries.
    pub async fn send(&self, readings: &AveragedReadings, now: DateTime<Utc>) -> SendReport {
        if readings.is_empty() {
            tracing::info!("no sensor data to send");
            return SendReport::not_sent("No data");
        }

        let plain = match build_plain_payload(readings, &self.format, now) {
            Ok(plain) => plain,
            Err(err) => {
                tracing::error!(error = %err, "failed to build payload");
                return SendReport::not_sent(&err.to_string());
            }
        };
        let encrypted = crate::crypto::encrypt_payload(&plain.json, &self.token_id);
        tracing::debug!(plain = %plain.json, aligned_ts = plain.aligned_ts_ms, "payload built");
        if self.format.grid_interval_secs % 900 == 0 && !validate_timestamp(plain.aligned_ts_ms, now) {
            tracing::warn!(aligned_ts = plain.aligned_ts_ms, "aligned timestamp outside upstream acceptance rules");
        }

        let report = |success, http_status, body: String, should_requeue| SendReport {
            success,
            http_status,
            response_body: body,
            should_requeue,
            encrypted_payload: Some(encrypted.clone()),
            aligned_ts: Some(plain.aligned_ts_ms),
        };

        let mut last_status = 0u16;
        let mut last_body: Option<String> = None;
        for attempt in 0..self.max_retries {
            match self.post_encrypted(&encrypted).await {
                Ok((status, body)) => {
                    tracing::info!(attempt = attempt + 1, status, body = %body.trim(), "send attempt answered");
                    last_status = status;
                    match classify(status, &body) {
                        SendOutcome::Success => return report(true, status, body, false),
                        SendOutcome::DataError => {
                            tracing::error!(body = %body.trim(), "data error: 200 with rejection body");
                            return report(false, status, body, false);
                        }
                        SendOutcome::ClientError => {
                            tracing::error!(status, body = %body.trim(), "client error");
                            return report(false, status, body, true);
                        }
                        SendOutcome::Retryable => last_body = Some(body),
                    }
                }
                Err(err) => {
                    tracing::error!(attempt = attempt + 1, error = %err, "send attempt failed");
                }
            }

            if attempt + 1 < self.max_retries {
                tokio::time::sleep(backoff_delay(self.backoff_base, attempt)).await;
            }
        }

        let body = last_body.unwrap_or_else(|| NO_RESPONSE.to_string());
        tracing::error!(status = last_status, body = %body.trim(), "all send attempts failed");
        report(false, last_status, body, true)
    }
}

#[cfg(test)]
pub(crate) fn test_uplink(endpoint: String, max_retries: u32) -> (UplinkClient, rsa::RsaPrivateKey) {
    let (signer, private) = crate::crypto::test_signer("Hvg_LrxeePXexh7TM76jQqWsWGRV4M4gvX1_tvKDMN4=");
    let format = PayloadFormat {
        device_id: "device_7025".to_string(),
        station_id: "station_8203".to_string(),
        grid_interval_secs: 900,
        value_decimals: 2,
    };
    let client = UplinkClient::new(endpoint, signer.token_id().to_string(), Some(signer), format, max_retries)
        .unwrap()
        .with_backoff_base(Duration::from_millis(1));
    (client, private)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::AveragedReading;
    use crate::crypto::decrypt_payload;
    use wiremock::matchers::{header, header_exists, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const SUCCESS: &str = r#"{"msg":"success","status":1}"#;

    fn readings() -> AveragedReadings {
        AveragedReadings::from([(
            "pH".to_string(),
            AveragedReading {
                value: 8.2,
                unit: "pH".to_string(),
                samples: 1,
            },
        )])
    }

    #[test]
    fn classification_table() {
        assert_eq!(classify(200, SUCCESS), SendOutcome::Success);
        assert_eq!(classify(200, " {\"status\":1,\"msg\":\"success\"}\n"), SendOutcome::Success);
        assert_eq!(classify(200, r#"{"msg":"failed","status":10}"#), SendOutcome::DataError);
        assert_eq!(classify(200, "<html>"), SendOutcome::DataError);
        assert_eq!(classify(401, ""), SendOutcome::ClientError);
        assert_eq!(classify(503, ""), SendOutcome::Retryable);
        assert_eq!(classify(302, ""), SendOutcome::Retryable);
        assert_eq!(parse_reply_status(r#"{"msg":"failed","status":10}"#), Some(10));
    }

    #[test]
    fn backoff_doubles_and_saturates() {
        let base = Duration::from_secs(1);
        assert_eq!(backoff_delay(base, 0), Duration::from_secs(1));
        assert_eq!(backoff_delay(base, 2), Duration::from_secs(4));
        assert_eq!(backoff_delay(base, 40), Duration::from_secs(u64::from(u32::MAX)));
        assert_eq!(backoff_delay(Duration::MAX, 3), Duration::MAX);
    }

    #[test]
    fn retry_budget_is_clamped() {
        let (client, _) = test_uplink("http://127.0.0.1:9".to_string(), u32::MAX);
        assert_eq!(client.max_retries, MAX_RETRIES);
        let (client, _) = test_uplink("http://127.0.0.1:9".to_string(), 0);
        assert_eq!(client.max_retries, 1);
    }

    #[tokio::test]
    async fn success_posts_signed_ciphertext() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("content-type", "text/plain"))
            .and(header("x-device-id", "device_7025"))
            .and(header_exists("signature"))
            .respond_with(ResponseTemplate::new(200).set_body_string(SUCCESS))
            .expect(1)
            .mount(&server)
            .await;

        let (client, _) = test_uplink(server.uri(), 3);
        let report = client.send(&readings(), Utc::now()).await;
        assert!(report.success);
        assert!(!report.should_requeue);

        let requests = server.received_requests().await.unwrap();
        let body = String::from_utf8(requests[0].body.clone()).unwrap();
        assert_eq!(Some(body.clone()), report.encrypted_payload);
        let plain = decrypt_payload(&body, client.token_id.as_str()).unwrap();
        assert!(plain.contains(r#""value":8.20"#));
    }

    #[tokio::test]
    async fn three_server_errors_request_requeue() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
            .expect(3)
            .mount(&server)
            .await;

        let (client, _) = test_uplink(server.uri(), 3);
        let report = client.send(&readings(), Utc::now()).await;
        assert!(!report.success);
        assert!(report.should_requeue);
        assert_eq!(report.http_status, 503);
        assert_eq!(report.response_body, "busy");
        assert!(report.encrypted_payload.is_some());
    }

    #[tokio::test]
    async fn data_error_stops_without_requeue() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string(r#"{"msg":"invalid parameter","status":0}"#),
            )
            .expect(1)
            .mount(&server)
            .await;

        let (client, _) = test_uplink(server.uri(), 3);
        let report = client.send(&readings(), Utc::now()).await;
        assert!(!report.success);
        assert!(!report.should_requeue);
    }

    #[tokio::test]
    async fn client_error_stops_and_requeues() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad signature"))
            .expect(1)
            .mount(&server)
            .await;

        let (client, _) = test_uplink(server.uri(), 3);
        let report = client.send(&readings(), Utc::now()).await;
        assert!(report.should_requeue);
        assert_eq!(report.http_status, 401);
    }

    #[tokio::test]
    async fn retry_recovers_after_transient_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string(SUCCESS))
            .mount(&server)
            .await;

        let (client, _) = test_uplink(server.uri(), 3);
        assert!(client.send(&readings(), Utc::now()).await.success);
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn empty_readings_are_not_sent() {
        let (client, _) = test_uplink("http://127.0.0.1:9".to_string(), 3);
        let report = client.send(&AveragedReadings::new(), Utc::now()).await;
        assert!(!report.success);
        assert!(!report.should_requeue);
        assert_eq!(report.encrypted_payload, None);
    }

    #[tokio::test]
    async fn transport_failure_exhausts_retries() {
        let (client, _) = test_uplink("http://127.0.0.1:9".to_string(), 2);
        let report = client.send(&readings(), Utc::now()).await;
        assert!(report.should_requeue);
        assert_eq!(report.http_status, 0);
        assert_eq!(report.response_body, NO_RESPONSE);
    }
}
