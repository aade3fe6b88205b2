use super::modem::{is_modem_candidate, reply_complete, AtCommand, ModemError, MODEM_BAUDRATE};
use super::SystemControl;
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use std::net::IpAddr;
use std::process::Command;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{timeout, Instant};
use tokio_serial::{SerialPortType, SerialStream};

const PROBE_SETTLE: Duration = Duration::from_millis(300);
const PROBE_WINDOW: Duration = Duration::from_secs(1);
const COMMAND_WINDOW: Duration = Duration::from_secs(3);
const REBOOT_TIMEOUT: Duration = Duration::from_secs(10);

/// Real host: serial AT port, kernel interface table, `sudo reboot`.
#[derive(Clone, Debug, Default)]
pub struct HostControl;

impl HostControl {
    pub fn new() -> Self {
        Self
    }
}

fn describe_port(port_type: &SerialPortType) -> String {
    match port_type {
        SerialPortType::UsbPort(info) => format!(
            "{:04X}:{:04X} {} {} {}",
            info.vid,
            info.pid,
            info.manufacturer.as_deref().unwrap_or_default(),
            info.product.as_deref().unwrap_or_default(),
            info.serial_number.as_deref().unwrap_or_default(),
        ),
        other => format!("{other:?}"),
    }
}

fn open_modem(port: &str) -> Result<SerialStream, ModemError> {
    let builder = tokio_serial::new(port, MODEM_BAUDRATE).timeout(COMMAND_WINDOW);
    SerialStream::open(&builder).map_err(|source| ModemError::Open {
        port: port.to_string(),
        source,
    })
}

/// Write one command and collect the reply until a final status line or the window closes.
async fn exchange(stream: &mut SerialStream, command: &str, window: Duration) -> Result<String, ModemError> {
    stream.write_all(format!("{command}\r\n").as_bytes()).await?;
    let deadline = Instant::now() + window;
    let mut reply = Vec::new();
    let mut buf = [0u8; 256];
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match timeout(remaining, stream.read(&mut buf)).await {
            Ok(Ok(0)) | Err(_) => break,
            Ok(Ok(n)) => {
                reply.extend_from_slice(&buf[..n]);
                if reply_complete(&String::from_utf8_lossy(&reply)) {
                    break;
                }
            }
            Ok(Err(err)) => return Err(err.into()),
        }
    }
    Ok(String::from_utf8_lossy(&reply).into_owned())
}

async fn answers_at(port: &str) -> bool {
    let Ok(mut stream) = open_modem(port) else {
        return false;
    };
    tokio::time::sleep(PROBE_SETTLE).await;
    matches!(exchange(&mut stream, "AT", PROBE_WINDOW).await, Ok(reply) if reply.contains("OK"))
}

#[async_trait]
impl SystemControl for HostControl {
    async fn find_modem_port(&self) -> Option<String> {
        let ports = match tokio::task::spawn_blocking(tokio_serial::available_ports).await {
            Ok(Ok(ports)) => ports,
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "failed to enumerate serial ports");
                return None;
            }
            Err(err) => {
                tracing::warn!(error = %err, "serial enumeration task failed");
                return None;
            }
        };

        for info in ports {
            let description = describe_port(&info.port_type);
            if !is_modem_candidate(&info.port_name, &description) {
                continue;
            }
            tracing::debug!(port = %info.port_name, description = %description, "probing modem candidate");
            if answers_at(&info.port_name).await {
                tracing::info!(port = %info.port_name, "modem answers AT");
                return Some(info.port_name);
            }
        }
        None
    }

    async fn run_at_sequence(&self, port: &str, commands: &[AtCommand]) -> Result<(), ModemError> {
        let mut stream = open_modem(port)?;
        tokio::time::sleep(PROBE_SETTLE).await;
        for command in commands {
            let reply = exchange(&mut stream, &command.command, COMMAND_WINDOW).await?;
            tracing::debug!(command = %command.command, reply = %reply.trim(), "modem replied");
            if !command.accepts(&reply) {
                return Err(ModemError::UnexpectedReply {
                    command: command.command.clone(),
                    reply: reply.trim().to_string(),
                });
            }
        }
        Ok(())
    }

    async fn check_interface(&self, interface: &str) -> Option<String> {
        let addrs = match if_addrs::get_if_addrs() {
            Ok(addrs) => addrs,
            Err(err) => {
                tracing::warn!(error = %err, "failed to list interfaces");
                return None;
            }
        };
        addrs
            .into_iter()
            .filter(|iface| iface.name == interface)
            .find_map(|iface| match iface.ip() {
                IpAddr::V4(ip) => Some(ip.to_string()),
                IpAddr::V6(_) => None,
            })
    }

    async fn reboot(&self) -> anyhow::Result<()> {
        let task = tokio::task::spawn_blocking(|| Command::new("sudo").arg("reboot").status());
        let status = timeout(REBOOT_TIMEOUT, task)
            .await
            .context("reboot command timed out")?
            .context("reboot task panicked")?
            .context("failed to spawn sudo reboot")?;
        if !status.success() {
            return Err(anyhow!("sudo reboot exited with {status}"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn loopback_has_an_ipv4_address() {
        let host = HostControl::new();
        let lo = if_addrs::get_if_addrs()
            .unwrap()
            .into_iter()
            .find(|iface| iface.is_loopback() && iface.ip().is_ipv4());
        if let Some(lo) = lo {
            assert_eq!(host.check_interface(&lo.name).await.as_deref(), Some("127.0.0.1"));
        }
        assert_eq!(host.check_interface("no-such-iface0").await, None);
    }

    #[tokio::test]
    async fn missing_port_is_reported_as_open_error() {
        let host = HostControl::new();
        let err = host
            .run_at_sequence("/dev/ttyUSB-missing", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, ModemError::Open { .. }));
    }
}
