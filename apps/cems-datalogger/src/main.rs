mod aggregator;
mod config;
mod crypto;
mod diagnostics;
mod http;
mod payload;
mod queue;
mod reporter;
mod scheduler;
mod sensor_config;
mod sensors;
mod status;
mod time;
mod uplink;

use crate::aggregator::{run_acquisition_loop, Aggregator};
use crate::config::Config;
use crate::crypto::Signer;
use crate::diagnostics::{DiagnosticMonitor, HostControl, HttpProbe, PrestartTiming};
use crate::payload::PayloadFormat;
use crate::queue::{QueueWorker, RetryQueue};
use crate::reporter::{run_heartbeat, ErrorReporter};
use crate::scheduler::LoggerLoop;
use crate::sensor_config::SensorStore;
use crate::sensors::SensorFetcher;
use crate::status::StatusTracker;
use crate::uplink::UplinkClient;
use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;

fn init_tracing() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,cems_datalogger=info".into());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init()
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    Ok(())
}

fn build_signer(config: &Config) -> Option<Signer> {
    match Signer::new(config.token_id.clone(), &config.public_key_pem) {
        Ok(signer) => Some(signer),
        Err(err) => {
            tracing::error!(error = %err, "PUBLIC_KEY unusable; submissions will be queued until it is fixed");
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing()?;

    let missing = config.missing_credentials();
    if !missing.is_empty() {
        tracing::warn!(missing = ?missing, "credentials not configured");
    }
    tracing::info!(
        device_id = %config.device_id,
        station_id = %config.station_id,
        grid_secs = config.grid_interval_secs(),
        dev_mode = config.dev_mode,
        "cems-datalogger starting"
    );

    let store = Arc::new(SensorStore::load(&config.sensors_file)?);
    let status = Arc::new(StatusTracker::new());
    let aggregator = Arc::new(Aggregator::new());
    let reporter = Arc::new(ErrorReporter::new(&config)?);
    let queue = Arc::new(RetryQueue::load(&config.queue_file));
    if !queue.is_empty() {
        tracing::info!(queued = queue.len(), "loaded pending retry queue");
    }

    let uplink = UplinkClient::new(
        config.endpoint.clone(),
        config.token_id.clone(),
        build_signer(&config),
        PayloadFormat::from_config(&config),
        config.max_retries,
    )?;
    let worker = Arc::new(QueueWorker::new(queue.clone(), uplink.clone()));

    let control = Arc::new(HostControl::new());
    let probe = Arc::new(HttpProbe::new()?);
    let monitor = Arc::new(DiagnosticMonitor::new(
        config.diagnostics.clone(),
        probe.clone(),
        control.clone(),
        Some(reporter.clone()),
        Utc::now(),
    ));

    if config.skip_prestart {
        tracing::info!("pre-startup diagnostics skipped");
    } else {
        diagnostics::run_prestart(
            &*control,
            &*probe,
            &monitor,
            &config.diagnostics,
            PrestartTiming::default(),
        )
        .await;
    }

    let fetcher = SensorFetcher::new(config.datapage_url.clone(), Some(reporter.clone()))?;
    let acquisition_handle = tokio::spawn(run_acquisition_loop(
        aggregator.clone(),
        fetcher,
        store.clone(),
        status.clone(),
        config.acquisition_interval(),
    ));

    let logger = LoggerLoop {
        store: store.clone(),
        aggregator: aggregator.clone(),
        uplink,
        queue: queue.clone(),
        worker,
        status: status.clone(),
        reporter: reporter.clone(),
        grid_interval_secs: config.grid_interval_secs(),
    };
    let logger_handle = tokio::spawn(logger.run());
    let monitor_handle = tokio::spawn(monitor.clone().run());
    let heartbeat_handle = tokio::spawn(run_heartbeat(
        reporter.clone(),
        store.clone(),
        config.heartbeat_interval(),
    ));

    let app = http::router(http::HttpState {
        store,
        status,
        queue,
        aggregator,
        monitor,
    });
    let listener = tokio::net::TcpListener::bind(&config.http_bind).await?;
    tracing::info!(bind = %config.http_bind, "cems-datalogger HTTP listening");
    let http_handle = tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
        _ = acquisition_handle => tracing::error!("acquisition loop exited"),
        _ = logger_handle => tracing::error!("logger loop exited"),
        _ = monitor_handle => tracing::error!("diagnostic monitor exited"),
        _ = heartbeat_handle => tracing::error!("heartbeat loop exited"),
        _ = http_handle => tracing::error!("http server exited"),
    }

    Ok(())
}
