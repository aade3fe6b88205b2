use super::{configure_modem, ConnectivityProbe, DiagnosticMonitor, DiagnosticResult, SystemControl};
use crate::config::DiagnosticsConfig;
use chrono::Utc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Clone, Copy, Debug)]
pub struct PrestartTiming {
    pub modem_retry_delay: Duration,
    pub interface_wait: Duration,
    pub interface_poll: Duration,
    pub stabilization: Duration,
}

impl Default for PrestartTiming {
    fn default() -> Self {
        Self {
            modem_retry_delay: Duration::from_secs(2),
            interface_wait: Duration::from_secs(120),
            interface_poll: Duration::from_secs(5),
            stabilization: Duration::from_secs(30),
        }
    }
}

async fn wait_for_interface(
    control: &dyn SystemControl,
    interface: &str,
    timing: &PrestartTiming,
) -> DiagnosticResult {
    let deadline = Instant::now() + timing.interface_wait;
    loop {
        if let Some(ip) = control.check_interface(interface).await {
            return DiagnosticResult::new(
                "Network Interface",
                true,
                format!("{interface} has IP address: {ip}"),
            );
        }
        if Instant::now() + timing.interface_poll > deadline {
            break;
        }
        tracing::debug!(interface, "waiting for interface address");
        tokio::time::sleep(timing.interface_poll).await;
    }
    DiagnosticResult::new(
        "Network Interface",
        false,
        format!(
            "{interface} did not get IP address within {}s",
            timing.interface_wait.as_secs()
        ),
    )
}

/// Bring the uplink up before acquisition starts: modem, interface, internet.
/// A reachable internet seeds the monitor's last-success time.
pub async fn run_prestart(
    control: &dyn SystemControl,
    probe: &dyn ConnectivityProbe,
    monitor: &DiagnosticMonitor,
    config: &DiagnosticsConfig,
    timing: PrestartTiming,
) -> Vec<DiagnosticResult> {
    tracing::info!("running pre-startup diagnostics");
    let mut results = Vec::new();

    match control.find_modem_port().await {
        Some(port) => {
            results.push(DiagnosticResult::new(
                "Modem Detection",
                true,
                format!("Found on {port}"),
            ));
            results.push(
                configure_modem(control, &port, &config.modem_apn, timing.modem_retry_delay).await,
            );
        }
        None => results.push(DiagnosticResult::new(
            "Modem Detection",
            false,
            "Quectel modem not found (ethernet may work)",
        )),
    }

    let interface = wait_for_interface(control, &config.network_interface, &timing).await;
    let interface_up = interface.success;
    results.push(interface);

    let internet = probe.check().await;
    if internet.success {
        monitor.record_internet_success(Utc::now());
    }
    results.push(internet);

    if interface_up {
        tokio::time::sleep(timing.stabilization).await;
        results.push(DiagnosticResult::new(
            "Network Stability Wait",
            true,
            format!(
                "Waited {} seconds for network stabilization",
                timing.stabilization.as_secs()
            ),
        ));
    }

    let passed = results.iter().filter(|result| result.success).count();
    for result in &results {
        if result.success {
            tracing::info!(%result, "pre-startup check");
        } else {
            tracing::warn!(%result, "pre-startup check");
        }
    }
    tracing::info!(passed, total = results.len(), "pre-startup diagnostics complete");
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::fakes::{FakeProbe, FakeSystem};
    use std::sync::Arc;

    fn fast() -> PrestartTiming {
        PrestartTiming {
            modem_retry_delay: Duration::from_millis(1),
            interface_wait: Duration::from_millis(20),
            interface_poll: Duration::from_millis(5),
            stabilization: Duration::from_millis(1),
        }
    }

    fn names(results: &[DiagnosticResult]) -> Vec<&str> {
        results.iter().map(|r| r.check_name.as_str()).collect()
    }

    #[tokio::test]
    async fn healthy_host_runs_every_step_and_seeds_monitor() {
        let system = Arc::new(FakeSystem {
            modem_port: Some("/dev/ttyUSB2".into()),
            interface_ip: Some("192.168.225.40".into()),
            ..FakeSystem::default()
        });
        let probe = Arc::new(FakeProbe::new(true));
        let config = DiagnosticsConfig::default();
        let monitor = DiagnosticMonitor::new(config.clone(), probe.clone(), system.clone(), None, Utc::now());

        let results = run_prestart(&*system, &*probe, &monitor, &config, fast()).await;
        assert_eq!(
            names(&results),
            [
                "Modem Detection",
                "Modem Configuration",
                "Network Interface",
                "Internet Connectivity",
                "Network Stability Wait"
            ]
        );
        assert!(results.iter().all(|r| r.success));
        assert_eq!(results[2].message, "eth0 has IP address: 192.168.225.40");
        assert!(monitor.state().last_internet_success.is_some());
    }

    #[tokio::test]
    async fn missing_modem_and_interface_skip_dependent_steps() {
        let system = Arc::new(FakeSystem::default());
        let probe = Arc::new(FakeProbe::new(false));
        let config = DiagnosticsConfig::default();
        let monitor = DiagnosticMonitor::new(config.clone(), probe.clone(), system.clone(), None, Utc::now());

        let results = run_prestart(&*system, &*probe, &monitor, &config, fast()).await;
        assert_eq!(
            names(&results),
            ["Modem Detection", "Network Interface", "Internet Connectivity"]
        );
        assert_eq!(results[0].message, "Quectel modem not found (ethernet may work)");
        assert_eq!(results[1].to_string(), "[FAIL] Network Interface: eth0 did not get IP address within 0s");
        assert!(monitor.state().last_internet_success.is_none());
    }
}
