use crate::uplink::MAX_RETRIES;
use anyhow::{anyhow, Context, Result};
use dotenvy::dotenv;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_ENDPOINT: &str = "https://cems.cpcb.gov.in/v1.0/industry/data";
pub const DEFAULT_ERROR_ENDPOINT: &str = "http://65.1.87.62/ocms/Cpcb/add_cpcberror";
pub const DEFAULT_PUBLIC_IP_URL: &str = "https://api.ipify.org?format=text";

const PRODUCTION_GRID_MINUTES: u64 = 15;
const DEV_GRID_MINUTES: u64 = 1;

/// Static, process-lifetime settings. Loaded once at startup and never
/// mutated; the runtime-editable part lives in [`crate::sensor_config`].
#[derive(Debug, Clone)]
pub struct Config {
    pub token_id: String,
    pub device_id: String,
    pub station_id: String,
    pub uid: String,
    pub public_key_pem: String,
    pub datapage_url: Option<String>,
    pub endpoint: String,
    pub error_endpoint_url: String,
    pub error_session_cookie: String,
    pub public_ip_url: String,

    pub dev_mode: bool,
    pub acquisition_interval_secs: u64,
    pub max_retries: u32,
    pub value_decimals: usize,
    pub queue_file: PathBuf,
    pub sensors_file: PathBuf,
    pub http_bind: String,
    pub heartbeat_minutes: u64,
    pub skip_prestart: bool,

    pub diagnostics: DiagnosticsConfig,
}

#[derive(Debug, Clone)]
pub struct DiagnosticsConfig {
    pub check_interval_minutes: u64,
    pub internet_timeout_minutes: u64,
    pub auto_restart_enabled: bool,
    pub restart_cooldown_minutes: u64,
    pub modem_apn: String,
    pub network_interface: String,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            check_interval_minutes: 5,
            internet_timeout_minutes: 30,
            auto_restart_enabled: true,
            restart_cooldown_minutes: 30,
            modem_apn: "airtelgprs.com".to_string(),
            network_interface: "eth0".to_string(),
        }
    }
}

impl DiagnosticsConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_minutes.max(1) * 60)
    }

    pub fn internet_timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.internet_timeout_minutes as i64)
    }

    pub fn restart_cooldown(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.restart_cooldown_minutes as i64)
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let token_id = env_string("TOKEN_ID", Some(String::new()))?;
        let device_id = env_string("DEVICE_ID", Some(String::new()))?;
        let station_id = env_string("STATION_ID", Some(String::new()))?;
        let uid = env_string("UID", Some(String::new()))?;
        let public_key_pem = normalize_pem(&env_string("PUBLIC_KEY", Some(String::new()))?);
        let datapage_url = env_optional("DATAPAGE_URL");
        let endpoint = env_string("ENDPOINT", Some(DEFAULT_ENDPOINT.to_string()))?;
        let error_endpoint_url =
            env_string("ERROR_ENDPOINT_URL", Some(DEFAULT_ERROR_ENDPOINT.to_string()))?;
        let error_session_cookie = env_string("ERROR_SESSION_COOKIE", Some(String::new()))?;
        let public_ip_url =
            env_string("DATALOGGER_PUBLIC_IP_URL", Some(DEFAULT_PUBLIC_IP_URL.to_string()))?;

        let dev_mode = env_bool("DATALOGGER_DEV_MODE", false)?;
        let acquisition_interval_secs =
            env_u64("DATALOGGER_ACQUISITION_INTERVAL_SECONDS", Some(20))?.max(1);
        let max_retries =
            env_u64("DATALOGGER_MAX_RETRIES", Some(3))?.clamp(1, u64::from(MAX_RETRIES)) as u32;
        let value_decimals = env_u64("DATALOGGER_VALUE_DECIMALS", Some(2))?.min(9) as usize;
        let queue_file =
            PathBuf::from(env_string("DATALOGGER_QUEUE_FILE", Some("failed_queue.json".into()))?);
        let sensors_file =
            PathBuf::from(env_string("DATALOGGER_SENSORS_FILE", Some("sensors.json".into()))?);
        let http_bind = env_string("DATALOGGER_HTTP_BIND", Some("0.0.0.0:9999".to_string()))?;
        let heartbeat_minutes = env_u64("DATALOGGER_HEARTBEAT_MINUTES", Some(30))?.max(1);
        let skip_prestart = env_bool("DATALOGGER_SKIP_PRESTART", false)?;

        let defaults = DiagnosticsConfig::default();
        let diagnostics = DiagnosticsConfig {
            check_interval_minutes: env_u64(
                "DIAGNOSTIC_CHECK_INTERVAL_MINUTES",
                Some(defaults.check_interval_minutes),
            )?,
            internet_timeout_minutes: env_u64(
                "DIAGNOSTIC_INTERNET_TIMEOUT_MINUTES",
                Some(defaults.internet_timeout_minutes),
            )?,
            auto_restart_enabled: env_bool(
                "DIAGNOSTIC_AUTO_RESTART_ENABLED",
                defaults.auto_restart_enabled,
            )?,
            restart_cooldown_minutes: env_u64(
                "DIAGNOSTIC_RESTART_COOLDOWN_MINUTES",
                Some(defaults.restart_cooldown_minutes),
            )?,
            modem_apn: env_string("MODEM_APN", Some(defaults.modem_apn))?,
            network_interface: env_string("NETWORK_INTERFACE", Some(defaults.network_interface))?,
        };

        Ok(Self {
            token_id,
            device_id,
            station_id,
            uid,
            public_key_pem,
            datapage_url,
            endpoint,
            error_endpoint_url,
            error_session_cookie,
            public_ip_url,
            dev_mode,
            acquisition_interval_secs,
            max_retries,
            value_decimals,
            queue_file,
            sensors_file,
            http_bind,
            heartbeat_minutes,
            skip_prestart,
            diagnostics,
        })
    }

    /// Width of the submission grid: 15 minutes in production, 1 in dev mode.
    pub fn grid_interval_secs(&self) -> i64 {
        let minutes = if self.dev_mode {
            DEV_GRID_MINUTES
        } else {
            PRODUCTION_GRID_MINUTES
        };
        (minutes * 60) as i64
    }

    pub fn acquisition_interval(&self) -> Duration {
        Duration::from_secs(self.acquisition_interval_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_minutes * 60)
    }

    /// Credentials the uplink cannot work without. Missing values are logged
    /// at startup rather than refusing to boot, so the health surface stays up.
    pub fn missing_credentials(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.token_id.is_empty() {
            missing.push("TOKEN_ID");
        }
        if self.device_id.is_empty() {
            missing.push("DEVICE_ID");
        }
        if self.station_id.is_empty() {
            missing.push("STATION_ID");
        }
        if self.public_key_pem.is_empty() {
            missing.push("PUBLIC_KEY");
        }
        missing
    }
}

/// `.env` files usually carry the PEM on one line with literal `\n` escapes.
fn normalize_pem(raw: &str) -> String {
    raw.replace("\\n", "\n").trim().to_string()
}

fn env_string(key: &str, default: Option<String>) -> Result<String> {
    match env::var(key) {
        Ok(value) => Ok(value.trim().to_string()),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_u64(key: &str, default: Option<u64>) -> Result<u64> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .with_context(|| format!("invalid {key}")),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_bool(key: &str, default: bool) -> Result<bool> {
    match env::var(key) {
        Ok(value) => parse_bool(&value).ok_or_else(|| anyhow!("invalid {key}: {value}")),
        Err(_) => Ok(default),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config {
        token_id: "Hvg_LrxeePXexh7TM76jQqWsWGRV4M4gvX1_tvKDMN4=".to_string(),
        device_id: "device_7025".to_string(),
        station_id: "station_8203".to_string(),
        uid: "site-01".to_string(),
        public_key_pem: String::new(),
        datapage_url: None,
        endpoint: "http://127.0.0.1:9/v1.0/industry/data".to_string(),
        error_endpoint_url: "http://127.0.0.1:9/error".to_string(),
        error_session_cookie: "cookie".to_string(),
        public_ip_url: "http://127.0.0.1:9/ip".to_string(),
        dev_mode: false,
        acquisition_interval_secs: 20,
        max_retries: 3,
        value_decimals: 2,
        queue_file: PathBuf::from("failed_queue.json"),
        sensors_file: PathBuf::from("sensors.json"),
        http_bind: "127.0.0.1:0".to_string(),
        heartbeat_minutes: 30,
        skip_prestart: true,
        diagnostics: DiagnosticsConfig::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bool_accepts_common_spellings() {
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool(" 0 "), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn normalize_pem_expands_escaped_newlines() {
        let raw = "-----BEGIN PUBLIC KEY-----\\nABC\\n-----END PUBLIC KEY-----\\n";
        assert_eq!(
            normalize_pem(raw),
            "-----BEGIN PUBLIC KEY-----\nABC\n-----END PUBLIC KEY-----"
        );
    }

    #[test]
    fn grid_interval_follows_dev_mode() {
        let mut config = test_config();
        assert_eq!(config.grid_interval_secs(), 900);
        config.dev_mode = true;
        assert_eq!(config.grid_interval_secs(), 60);
    }
}
