mod host;
mod modem;
mod monitor;
mod prestart;

pub use host::HostControl;
pub use modem::{configure_modem, AtCommand, ModemError};
pub use monitor::{DiagnosticMonitor, DiagnosticState};
pub use prestart::{run_prestart, PrestartTiming};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const REACHABLE_STATUSES: [u16; 6] = [200, 301, 302, 303, 307, 308];

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DiagnosticResult {
    pub check_name: String,
    pub success: bool,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl DiagnosticResult {
    pub fn new(check_name: &str, success: bool, message: impl Into<String>) -> Self {
        Self {
            check_name: check_name.to_string(),
            success,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

impl fmt::Display for DiagnosticResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verdict = if self.success { "PASS" } else { "FAIL" };
        write!(f, "[{}] {}: {}", verdict, self.check_name, self.message)
    }
}

/// Host side effects the diagnostics need. Injected so the monitor and the
/// pre-start sequence run against fakes in tests.
#[async_trait]
pub trait SystemControl: Send + Sync {
    /// Serial device of the cellular modem's AT port, if one answers.
    async fn find_modem_port(&self) -> Option<String>;
    /// Run the commands in order on one connection; first bad reply aborts.
    async fn run_at_sequence(&self, port: &str, commands: &[AtCommand]) -> Result<(), ModemError>;
    /// IPv4 address currently assigned to `interface`.
    async fn check_interface(&self, interface: &str) -> Option<String>;
    async fn reboot(&self) -> anyhow::Result<()>;
}

#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn check(&self) -> DiagnosticResult;
}

/// Plain HTTP GET against a list of well-known endpoints; first reachable wins.
pub struct HttpProbe {
    client: Client,
    endpoints: Vec<(String, String)>,
}

impl HttpProbe {
    pub fn new() -> anyhow::Result<Self> {
        Self::with_endpoints(vec![
            ("https://www.google.com".to_string(), "Google".to_string()),
            ("https://1.1.1.1".to_string(), "Cloudflare DNS".to_string()),
            ("http://portal.cpcbocems.com".to_string(), "CPCB Portal".to_string()),
        ])
    }

    pub fn with_endpoints(endpoints: Vec<(String, String)>) -> anyhow::Result<Self> {
        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(PROBE_TIMEOUT)
            .build()?;
        Ok(Self { client, endpoints })
    }
}

#[async_trait]
impl ConnectivityProbe for HttpProbe {
    async fn check(&self) -> DiagnosticResult {
        for (url, name) in &self.endpoints {
            match self.client.get(url).send().await {
                Ok(response) if REACHABLE_STATUSES.contains(&response.status().as_u16()) => {
                    return DiagnosticResult::new(
                        "Internet Connectivity",
                        true,
                        format!("Connected (verified via {name})"),
                    );
                }
                Ok(response) => {
                    tracing::debug!(url = %url, status = response.status().as_u16(), "probe endpoint answered badly");
                }
                Err(err) => {
                    tracing::debug!(url = %url, error = %err, "probe endpoint unreachable");
                }
            }
        }
        DiagnosticResult::new(
            "Internet Connectivity",
            false,
            "Unable to reach any test endpoint",
        )
    }
}

#[cfg(test)]
pub(crate) mod fakes {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    pub struct FakeProbe {
        pub online: AtomicBool,
    }

    impl FakeProbe {
        pub fn new(online: bool) -> Self {
            Self {
                online: AtomicBool::new(online),
            }
        }
    }

    #[async_trait]
    impl ConnectivityProbe for FakeProbe {
        async fn check(&self) -> DiagnosticResult {
            let online = self.online.load(Ordering::SeqCst);
            DiagnosticResult::new("Internet Connectivity", online, if online { "up" } else { "down" })
        }
    }

    #[derive(Default)]
    pub struct FakeSystem {
        pub modem_port: Option<String>,
        pub interface_ip: Option<String>,
        /// Replies served to successive `run_at_sequence` calls; empty means success.
        pub at_failures: Mutex<Vec<ModemError>>,
        pub at_calls: AtomicUsize,
        pub reboots: AtomicUsize,
    }

    #[async_trait]
    impl SystemControl for FakeSystem {
        async fn find_modem_port(&self) -> Option<String> {
            self.modem_port.clone()
        }

        async fn run_at_sequence(&self, _port: &str, _commands: &[AtCommand]) -> Result<(), ModemError> {
            self.at_calls.fetch_add(1, Ordering::SeqCst);
            let next = self.at_failures.lock().unwrap().pop();
            match next {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }

        async fn check_interface(&self, _interface: &str) -> Option<String> {
            self.interface_ip.clone()
        }

        async fn reboot(&self) -> anyhow::Result<()> {
            self.reboots.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }
}
