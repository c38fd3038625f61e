use super::CliCommand;
use crate::supervisor::StatusSnapshot;
use crate::telemetry::LinkState;
use core::fmt::Write;
use core::time::Duration;

/// Side effect the firmware loop applies after printing the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleAction {
    None,
    ShowHelp,
    ClearScreen,
    Checkpoint,
    WifiReset,
    Reboot,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandResponse {
    pub text: String,
    pub action: ConsoleAction,
}

impl CommandResponse {
    fn text(text: String) -> Self {
        Self {
            text,
            action: ConsoleAction::None,
        }
    }

    fn action(text: &str, action: ConsoleAction) -> Self {
        Self {
            text: text.to_string(),
            action,
        }
    }
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;

    let mut out = String::new();
    if hours > 0 {
        let _ = write!(out, "{}h ", hours);
    }
    if minutes > 0 || hours > 0 {
        let _ = write!(out, "{}m ", minutes);
    }
    let _ = write!(out, "{}s", seconds);
    out
}

#[derive(Default)]
pub struct CommandHandler;

impl CommandHandler {
    pub fn new() -> Self {
        Self
    }

    pub fn execute_command(&mut self, command: CliCommand, status: &StatusSnapshot) -> CommandResponse {
        let mut response = String::new();

        match command {
            CliCommand::Empty => {}
            CliCommand::Help => return CommandResponse::action("", ConsoleAction::ShowHelp),
            CliCommand::Clear => return CommandResponse::action("", ConsoleAction::ClearScreen),
            CliCommand::Version => {
                let _ = write!(
                    response,
                    "ESP32 Water Meter v{}\r\nBuilt with ESP-IDF",
                    env!("CARGO_PKG_VERSION")
                );
            }
            CliCommand::Status => {
                log::info!("CLI: Status requested");
                response.push_str("System Status:\r\n");
                let _ = write!(response, "  Uptime: {}\r\n", format_duration(status.uptime));
                let _ = write!(response, "  Volume: {:.3} L ({} pulses since boot)\r\n", status.cumulative_liters, status.pulses);
                let _ = write!(response, "  Flow: {:.2} L/min\r\n", status.flow.liters_per_minute);
                let _ = write!(response, "  Network: {}\r\n", status.mode.as_str());
                let _ = write!(response, "  MQTT: {}", status.link.as_str());
            }
            CliCommand::Uptime => {
                let _ = write!(response, "Uptime: {}", format_duration(status.uptime));
            }
            CliCommand::Flow => {
                response.push_str("Meter:\r\n");
                let _ = write!(response, "  Cumulative: {:.3} L\r\n", status.cumulative_liters);
                let _ = write!(response, "  Liters/pulse: {}\r\n", status.liters_per_pulse);
                let _ = write!(
                    response,
                    "  Flow rate: {:.2} L/min ({}s window)\r\n",
                    status.flow.liters_per_minute,
                    status.flow_window.as_secs()
                );
                response.push_str("  Pulse capture:\r\n");
                let _ = write!(response, "    Accepted: {}\r\n", status.capture.accepted);
                let _ = write!(response, "    Bounces rejected: {}\r\n", status.capture.rejected);
                let _ = write!(response, "    Queue overflows: {}\r\n", status.capture.overflowed);
                let _ = write!(response, "    Pending: {}", status.pending_pulses);
                if status.ring_evictions > 0 {
                    let _ = write!(response, "\r\n    Window evictions: {}", status.ring_evictions);
                }
            }
            CliCommand::WifiStatus => {
                let _ = write!(response, "WiFi Status: {}\r\n", status.mode.as_str());
                let _ = write!(response, "  Radio: {:?}\r\n", status.radio_mode);
                let _ = write!(response, "  Hostname: {}.local\r\n", status.hostname);
                match &status.ssid {
                    Some(ssid) => {
                        let _ = write!(response, "  SSID: {}\r\n", ssid);
                    }
                    None => response.push_str("  SSID: (not configured)\r\n"),
                }
                let _ = write!(
                    response,
                    "  Associated: {}",
                    if status.associated { "✅ yes" } else { "❌ no" }
                );
                if status.client_failures > 0 {
                    let _ = write!(response, "\r\n  Failed attempts: {}", status.client_failures);
                }
                if let Some(retry) = status.association_retry_in {
                    let _ = write!(response, "\r\n  Next attempt in: {}s", retry.as_secs());
                }
            }
            CliCommand::MqttStatus => {
                response.push_str("MQTT Status:\r\n");
                let _ = write!(
                    response,
                    "  Connection: {}\r\n",
                    if status.link == LinkState::Connected {
                        "✅ Connected"
                    } else {
                        "❌ Disconnected"
                    }
                );
                let _ = write!(
                    response,
                    "  Broker: {}\r\n",
                    status.broker_url.as_deref().unwrap_or("(not configured)")
                );
                let _ = write!(response, "  Client ID: {}\r\n", status.hostname);
                let _ = write!(response, "  Published: {} messages\r\n", status.telemetry.published);
                let _ = write!(response, "  Publish failures: {}\r\n", status.telemetry.publish_failures);
                let _ = write!(response, "  Connect failures: {}", status.telemetry.connect_failures);
                if let Some(topic) = &status.telemetry.last_topic {
                    let _ = write!(response, "\r\n  Last published: {}", topic);
                }
                if let Some(retry) = status.broker_retry_in {
                    let _ = write!(response, "\r\n  Retry in: {}s", retry.as_secs());
                }
            }
            CliCommand::Checkpoint => {
                log::info!("CLI: Checkpoint requested");
                return CommandResponse::action("Saving volume...", ConsoleAction::Checkpoint);
            }
            CliCommand::WifiReset => {
                log::info!("CLI: WiFi reset requested");
                return CommandResponse::action(
                    "Erasing WiFi settings, config portal opens next cycle",
                    ConsoleAction::WifiReset,
                );
            }
            CliCommand::Reboot => {
                log::info!("CLI: Reboot requested");
                return CommandResponse::action("Saving volume and rebooting...", ConsoleAction::Reboot);
            }
            CliCommand::Unknown(cmd) => {
                log::info!("CLI: Unknown command: {}", cmd);
                response.push_str("Unknown command: ");
                response.push_str(&cmd);
                response.push_str(". Type 'help' for available commands.");
            }
        }

        CommandResponse::text(response)
    }
}
