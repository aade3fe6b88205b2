use super::{DiagnosticResult, SystemControl};
use std::time::Duration;
use thiserror::Error;

pub const MODEM_BAUDRATE: u32 = 115_200;
pub const CONFIGURE_ATTEMPTS: u32 = 3;

const VENDOR_MARKERS: [&str; 3] = ["QUECTEL", "EC200", "2C7C"];
const RS485_MARKERS: [&str; 3] = ["CH340", "FT232", "CP210"];

#[derive(Debug, Error)]
pub enum ModemError {
    #[error("failed to open {port}: {source}")]
    Open {
        port: String,
        #[source]
        source: tokio_serial::Error,
    },
    #[error("serial i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("{command} -> {reply:?}")]
    UnexpectedReply { command: String, reply: String },
}

/// One AT exchange and the token its reply must contain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AtCommand {
    pub command: String,
    pub expect: &'static str,
    /// `ERROR` is an acceptable reply (context already active, etc).
    pub tolerate_error: bool,
}

impl AtCommand {
    fn new(command: impl Into<String>, expect: &'static str) -> Self {
        Self {
            command: command.into(),
            expect,
            tolerate_error: false,
        }
    }

    pub fn accepts(&self, reply: &str) -> bool {
        reply.contains(self.expect) || (self.tolerate_error && reply.contains("ERROR"))
    }
}

/// Bring-up for Quectel EC200-class modems: ECM usbnet, APN, PDP context, auto-dial.
pub fn modem_commands(apn: &str) -> Vec<AtCommand> {
    vec![
        AtCommand::new("AT", "OK"),
        AtCommand::new(r#"AT+QCFG="usbnet",1"#, "OK"),
        AtCommand::new(format!(r#"AT+QICSGP=1,1,"{apn}""#), "OK"),
        AtCommand {
            tolerate_error: true,
            ..AtCommand::new("AT+QIACT?", "+QIACT")
        },
        AtCommand::new("AT+QNETDEVCTL=1,1,1", "OK"),
    ]
}

/// Whether a `/dev/ttyUSB*` port looks like the modem rather than an RS-485 adapter.
pub fn is_modem_candidate(port: &str, description: &str) -> bool {
    if !port.starts_with("/dev/ttyUSB") {
        return false;
    }
    let description = description.to_uppercase();
    if RS485_MARKERS.iter().any(|marker| description.contains(marker)) {
        return false;
    }
    VENDOR_MARKERS.iter().any(|marker| description.contains(marker))
}

/// Final status line seen, so reads can stop before the window closes.
pub fn reply_complete(reply: &str) -> bool {
    reply
        .lines()
        .map(str::trim)
        .any(|line| {
            line == "OK"
                || line.ends_with("ERROR")
                || line.starts_with("+CME ERROR")
                || line.starts_with("+CMS ERROR")
        })
}

pub async fn configure_modem(
    control: &dyn SystemControl,
    port: &str,
    apn: &str,
    retry_delay: Duration,
) -> DiagnosticResult {
    let commands = modem_commands(apn);
    let mut last_error = None;
    for attempt in 1..=CONFIGURE_ATTEMPTS {
        match control.run_at_sequence(port, &commands).await {
            Ok(()) => {
                tracing::info!(port, apn, attempt, "modem configured");
                return DiagnosticResult::new(
                    "Modem Configuration",
                    true,
                    format!("Successfully configured on {port} with APN {apn}"),
                );
            }
            Err(err) => {
                tracing::warn!(port, attempt, error = %err, "modem configuration attempt failed");
                last_error = Some(err);
                if attempt < CONFIGURE_ATTEMPTS {
                    tokio::time::sleep(retry_delay).await;
                }
            }
        }
    }
    let detail = last_error.map(|err| err.to_string()).unwrap_or_default();
    DiagnosticResult::new(
        "Modem Configuration",
        false,
        format!("Failed after {CONFIGURE_ATTEMPTS} attempts: {detail}"),
    )
}
