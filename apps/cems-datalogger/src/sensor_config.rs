use crate::sensors::{SensorDescriptor, SensorSource, SerialBusConfig};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("sensor with empty param_name")]
    EmptyParamName,
    #[error("duplicate param_name {0}")]
    DuplicateParam(String),
    #[error("page sensor {0} has no sensor_id")]
    MissingSensorId(String),
    #[error("modbus tcp sensor {0} has no host")]
    MissingHost(String),
    #[error("modbus rtu sensor {0} configured without rtu_device")]
    MissingRtuBus(String),
}

/// The operator-editable document behind `sensors.json`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SensorsConfig {
    #[serde(default)]
    pub server_running: bool,
    #[serde(default)]
    pub sensors: Vec<SensorDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rtu_device: Option<SerialBusConfig>,
}

impl SensorsConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for sensor in &self.sensors {
            let name = sensor.param_name.trim();
            if name.is_empty() {
                return Err(ConfigError::EmptyParamName);
            }
            if !seen.insert(name) {
                return Err(ConfigError::DuplicateParam(name.to_string()));
            }
            match &sensor.source {
                SensorSource::PageScrape(page) if page.sensor_id.trim().is_empty() => {
                    return Err(ConfigError::MissingSensorId(name.to_string()));
                }
                SensorSource::ModbusTcp(tcp) if tcp.host.trim().is_empty() => {
                    return Err(ConfigError::MissingHost(name.to_string()));
                }
                SensorSource::ModbusRtu(_) if self.rtu_device.is_none() => {
                    return Err(ConfigError::MissingRtuBus(name.to_string()));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Single in-process owner of the sensors document. Writers queue on `write`,
/// persist via temp file + rename on the blocking pool, then swap `inner`.
#[derive(Debug)]
pub struct SensorStore {
    path: PathBuf,
    inner: Mutex<SensorsConfig>,
    write: tokio::sync::Mutex<()>,
}

impl SensorStore {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let config = if path.exists() {
            match read_config(&path) {
                Ok(config) => {
                    if let Err(err) = config.validate() {
                        tracing::warn!(path = %path.display(), error = %err, "sensors config invalid");
                    }
                    config
                }
                Err(err) => {
                    tracing::error!(path = %path.display(), error = %err, "failed to load sensors config; using defaults");
                    SensorsConfig::default()
                }
            }
        } else {
            let config = SensorsConfig::default();
            persist_config(&path, &config)?;
            tracing::info!(path = %path.display(), "wrote default sensors config");
            config
        };

        Ok(Self {
            path,
            inner: Mutex::new(config),
            write: tokio::sync::Mutex::new(()),
        })
    }

    pub fn snapshot(&self) -> SensorsConfig {
        self.inner
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .lock()
            .map(|guard| guard.server_running)
            .unwrap_or(false)
    }

    pub fn is_valid(&self) -> bool {
        self.inner
            .lock()
            .map(|guard| guard.validate().is_ok())
            .unwrap_or(false)
    }

    pub async fn toggle_running(&self) -> Result<bool> {
        let mut running = false;
        self.update(|config| {
            config.server_running = !config.server_running;
            running = config.server_running;
        })
        .await?;
        tracing::info!(running, "server run flag toggled");
        Ok(running)
    }

    /// Replace the whole document; rejected without touching disk when invalid.
    pub async fn replace(&self, next: SensorsConfig) -> Result<()> {
        next.validate()?;
        let sensors = next.sensors.len();
        self.update(|config| *config = next).await?;
        tracing::info!(sensors, "sensors config replaced");
        Ok(())
    }

    async fn update(&self, mutate: impl FnOnce(&mut SensorsConfig)) -> Result<()> {
        let _write = self.write.lock().await;
        let mut next = self
            .inner
            .lock()
            .map_err(|_| anyhow::anyhow!("sensors config lock poisoned"))?
            .clone();
        mutate(&mut next);
        let path = self.path.clone();
        let next = tokio::task::spawn_blocking(move || persist_config(&path, &next).map(|()| next))
            .await
            .context("sensors config persist task")??;
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| anyhow::anyhow!("sensors config lock poisoned"))?;
        *guard = next;
        Ok(())
    }
}

fn read_config(path: &Path) -> Result<SensorsConfig> {
    let raw = fs::read_to_string(path).context("read sensors config")?;
    serde_json::from_str(&raw).context("parse sensors config")
}

fn persist_config(path: &Path, config: &SensorsConfig) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    let json = serde_json::to_string_pretty(config)?;
    fs::write(&tmp, json).context("write sensors config tmp")?;
    fs::rename(&tmp, path).context("rename sensors config")?;
    Ok(())
}
