use crate::sensor_config::SensorStore;
use crate::sensors::{SensorFetcher, SensorReadings};
use crate::status::StatusTracker;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::MissedTickBehavior;

#[derive(Debug, Default)]
struct ParamSamples {
    values: Vec<f64>,
    unit: String,
}

#[derive(Debug, Default)]
struct AggregationWindow {
    samples: BTreeMap<String, ParamSamples>,
    last_fetch: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AveragedReading {
    pub value: f64,
    pub unit: String,
    pub samples: usize,
}

pub type AveragedReadings = BTreeMap<String, AveragedReading>;

/// Per-parameter sample lists since the last drain. Appends and drains
/// happen under the same lock, so a drain never splits a fetch.
#[derive(Debug, Default)]
pub struct Aggregator {
    window: Mutex<AggregationWindow>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append every numeric reading. Returns how many were accepted.
    pub fn record(&self, readings: &SensorReadings, at: DateTime<Utc>) -> usize {
        let Ok(mut window) = self.window.lock() else {
            return 0;
        };
        window.last_fetch = Some(at);
        let mut accepted = 0;
        for (param, reading) in readings {
            match reading.numeric() {
                Some(value) => {
                    let entry = window.samples.entry(param.clone()).or_default();
                    entry.values.push(value);
                    entry.unit = reading.unit.clone();
                    accepted += 1;
                }
                None => {
                    tracing::warn!(param = %param, raw = %reading.value, "invalid reading dropped");
                }
            }
        }
        accepted
    }

    /// Mean per parameter since the last drain, then clear.
    pub fn drain(&self) -> AveragedReadings {
        let Ok(mut window) = self.window.lock() else {
            return AveragedReadings::new();
        };
        let samples = std::mem::take(&mut window.samples);
        samples
            .into_iter()
            .filter(|(_, samples)| !samples.values.is_empty())
            .map(|(param, samples)| {
                let value = samples.values.iter().sum::<f64>() / samples.values.len() as f64;
                (
                    param,
                    AveragedReading {
                        value,
                        unit: samples.unit,
                        samples: samples.values.len(),
                    },
                )
            })
            .collect()
    }

    pub fn reading_counts(&self) -> BTreeMap<String, usize> {
        self.window
            .lock()
            .map(|window| {
                window
                    .samples
                    .iter()
                    .map(|(param, samples)| (param.clone(), samples.values.len()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn last_fetch_time(&self) -> Option<DateTime<Utc>> {
        self.window.lock().ok().and_then(|window| window.last_fetch)
    }
}

pub async fn run_acquisition_loop(
    aggregator: Arc<Aggregator>,
    fetcher: SensorFetcher,
    store: Arc<SensorStore>,
    status: Arc<StatusTracker>,
    every: Duration,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        let config = store.snapshot();
        if !config.server_running || config.sensors.is_empty() {
            continue;
        }

        let readings = fetcher
            .fetch_all_sensors(&config.sensors, config.rtu_device.as_ref())
            .await;
        let now = Utc::now();
        let accepted = aggregator.record(&readings, now);
        tracing::debug!(
            configured = config.sensors.len(),
            answered = readings.len(),
            accepted,
            "acquisition cycle"
        );
        if accepted == config.sensors.len() {
            status.record_fetch_success(now);
        }
    }
}
