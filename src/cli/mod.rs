pub mod commands;
pub mod parser;
pub mod terminal;

pub use commands::{CommandHandler, CommandResponse, ConsoleAction};
pub use parser::CommandParser;
pub use terminal::{SerialPort, Terminal};
#[cfg(target_os = "espidf")]
pub use terminal::UartPort;

use thiserror::Error;

// CLI-related types and constants
pub const CLI_BUFFER_SIZE: usize = 128;
pub const MAX_HISTORY_SIZE: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliCommand {
    Help,
    Version,
    Status,
    Uptime,
    Clear,
    Flow,
    WifiStatus,
    MqttStatus,
    Checkpoint,
    WifiReset,
    Reboot,
    Empty,
    Unknown(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CliError {
    #[error("UART error")]
    UartError,
}
