//! ESP32 Water Meter
//!
//! Counts pulses from a mechanical meter, keeps the cumulative volume across
//! power loss, and publishes volume and flow rate over MQTT. WiFi is set up
//! through a config portal access point.

pub mod backoff;
pub mod cli;
pub mod clock;
pub mod meter;
#[cfg(target_os = "espidf")]
pub mod mqtt;
pub mod network_config;
pub mod provisioning;
pub mod storage;
pub mod supervisor;
pub mod telemetry;
#[cfg(target_os = "espidf")]
pub mod wifi;

#[cfg(test)]
mod testing;

pub use cli::{CliCommand, CliError, CommandHandler, CommandParser, Terminal};
pub use meter::{FlowAccumulator, MeterConfig};
pub use network_config::{BrokerSettings, DeviceConfig, NetworkCredential};
pub use provisioning::{ProvisioningMachine, ProvisioningMode};
pub use storage::{DualSlotStore, KeyValueStore, StorageError};
pub use supervisor::{Supervisor, SupervisorConfig};
pub use telemetry::{TelemetryPublisher, TelemetryError};
