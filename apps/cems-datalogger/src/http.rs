use crate::aggregator::Aggregator;
use crate::diagnostics::{DiagnosticMonitor, DiagnosticState};
use crate::queue::RetryQueue;
use crate::sensor_config::{ConfigError, SensorStore, SensorsConfig};
use crate::status::{StatusSnapshot, StatusTracker};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Clone)]
pub struct HttpState {
    pub store: Arc<SensorStore>,
    pub status: Arc<StatusTracker>,
    pub queue: Arc<RetryQueue>,
    pub aggregator: Arc<Aggregator>,
    pub monitor: Arc<DiagnosticMonitor>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    last_fetch: Option<DateTime<Utc>>,
    last_send: Option<DateTime<Utc>>,
    total_sends: u64,
    failed_sends: u64,
    queued_items: usize,
    last_error: Option<String>,
    config_valid: bool,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    running: bool,
    #[serde(flatten)]
    status: StatusSnapshot,
    queued_items: usize,
    reading_counts: BTreeMap<String, usize>,
    last_fetch_time: Option<DateTime<Utc>>,
    diagnostics: DiagnosticState,
}

#[derive(Debug, Serialize)]
struct ToggleResponse {
    running: bool,
}

async fn healthz() -> &'static str {
    "ok"
}

async fn get_health(State(state): State<HttpState>) -> Json<HealthResponse> {
    let snapshot = state.status.snapshot();
    Json(HealthResponse {
        status: if state.store.is_running() { "running" } else { "stopped" },
        last_fetch: snapshot.last_fetch_success,
        last_send: snapshot.last_send_success,
        total_sends: snapshot.total_sends,
        failed_sends: snapshot.failed_sends,
        queued_items: state.queue.len(),
        last_error: snapshot.last_error,
        config_valid: state.store.is_valid(),
    })
}

async fn get_status(State(state): State<HttpState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        running: state.store.is_running(),
        status: state.status.snapshot(),
        queued_items: state.queue.len(),
        reading_counts: state.aggregator.reading_counts(),
        last_fetch_time: state.aggregator.last_fetch_time(),
        diagnostics: state.monitor.state(),
    })
}

async fn post_toggle(
    State(state): State<HttpState>,
) -> Result<Json<ToggleResponse>, (StatusCode, String)> {
    let running = state
        .store
        .toggle_running()
        .await
        .map_err(|err| (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
    tracing::info!(running, "run flag toggled");
    Ok(Json(ToggleResponse { running }))
}

async fn get_sensors(State(state): State<HttpState>) -> Json<SensorsConfig> {
    Json(state.store.snapshot())
}

async fn put_sensors(
    State(state): State<HttpState>,
    Json(next): Json<SensorsConfig>,
) -> Result<Json<SensorsConfig>, (StatusCode, String)> {
    state.store.replace(next).await.map_err(|err| {
        if err.downcast_ref::<ConfigError>().is_some() {
            tracing::warn!(error = %err, "sensors config rejected");
            (StatusCode::UNPROCESSABLE_ENTITY, err.to_string())
        } else {
            tracing::error!(error = %err, "sensors config write failed");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    })?;
    Ok(Json(state.store.snapshot()))
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/health", get(get_health))
        .route("/v1/status", get(get_status))
        .route("/v1/toggle", post(post_toggle))
        .route("/v1/sensors", get(get_sensors).put(put_sensors))
        .with_state(state)
}
