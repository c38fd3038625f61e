//! Network identity: station association or the local config portal.
//!
//! The radio can be an access point or a station, never both. The
//! [`ProvisioningMachine`] is the only component that switches it.

pub mod link;
pub mod machine;
pub mod portal;

pub use link::{StationEvent, StationLink};
pub use machine::{ProvisioningConfig, ProvisioningEvent, ProvisioningMachine};
pub use portal::{
    parse_submission, portal_channel, PortalInbox, PortalOutbox, PortalSubmission, PORTAL_PAGE,
};

use crate::network_config::NetworkCredential;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisioningMode {
    Unconfigured,
    Client,
    ConfigPortal,
    ClientRetry,
}

impl ProvisioningMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ProvisioningMode::Unconfigured => "UNCONFIGURED",
            ProvisioningMode::Client => "CLIENT",
            ProvisioningMode::ConfigPortal => "CONFIG_PORTAL",
            ProvisioningMode::ClientRetry => "CLIENT_RETRY",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioMode {
    Off,
    AccessPoint,
    Station,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Association {
    #[default]
    Idle,
    Connecting,
    Connected,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RadioError {
    #[error("radio driver error: {0}")]
    Driver(String),
    #[error("radio busy in another mode")]
    Busy,
}

/// Non-blocking control of the single WiFi radio.
pub trait Radio {
    /// Open the access point and serve the config portal.
    fn start_access_point(&mut self, ssid: &str, passphrase: &str) -> Result<(), RadioError>;

    /// Begin associating with `credential`. Returns before association completes.
    fn start_station(&mut self, credential: &NetworkCredential) -> Result<(), RadioError>;

    /// Current station association state.
    fn association(&mut self) -> Association;

    /// Tear down whichever mode is active.
    fn stop(&mut self) -> Result<(), RadioError>;

    /// Next accepted portal submission, if any.
    fn poll_submission(&mut self) -> Option<PortalSubmission>;

    /// Advertise the hostname on the local network.
    fn advertise(&mut self, hostname: &str) -> Result<(), RadioError>;
}
