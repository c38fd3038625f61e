//! Device constants and the network records collected by the config portal.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Hostname used for the portal SSID, mDNS name and MQTT client id.
pub const HOSTNAME: &str = "watermeter";
/// Access point passphrase while the config portal is open.
pub const AP_PASSWORD: &str = "wifisetup";
/// GPIO that, held low across power-up, erases the WiFi settings.
pub const RESET_WIFI_PIN: u8 = 13;
/// GPIO wired to the meter's pulse output.
pub const PULSE_PIN: u8 = 4;

pub const MAX_SSID_LEN: usize = 32;
pub const MAX_PASSPHRASE_LEN: usize = 64;
pub const MAX_SERVER_STR_LEN: usize = 32;
pub const MAX_USER_STR_LEN: usize = 32;
pub const MAX_PASSWORD_STR_LEN: usize = 32;
pub const MAX_TOPIC_LEN: usize = 64;

pub const METER_KLITERS_TOPIC: &str = "sensor/water-meter/kLiters";
pub const METER_FLOWRATE_TOPIC: &str = "sensor/water-meter/FlowRate";

pub const DEFAULT_MQTT_PORT: u16 = 1883;

// The defaults below are copied into bounded strings
const _: () = assert!(HOSTNAME.len() <= MAX_SSID_LEN);
const _: () = assert!(AP_PASSWORD.len() <= MAX_PASSPHRASE_LEN);
const _: () = assert!(METER_KLITERS_TOPIC.len() <= MAX_TOPIC_LEN);
const _: () = assert!(METER_FLOWRATE_TOPIC.len() <= MAX_TOPIC_LEN);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CredentialError {
    #[error("{0} must not be empty")]
    Empty(&'static str),
    #[error("{field} too long (max {max} chars)")]
    TooLong { field: &'static str, max: usize },
    #[error("malformed submission: {0}")]
    Malformed(String),
}

/// Copy `value` into a bounded string, rejecting oversize input instead of truncating.
pub fn bounded<const N: usize>(
    field: &'static str,
    value: &str,
) -> Result<heapless::String<N>, CredentialError> {
    let mut out = heapless::String::<N>::new();
    out.push_str(value)
        .map_err(|_| CredentialError::TooLong { field, max: N })?;
    Ok(out)
}

fn required<const N: usize>(
    field: &'static str,
    value: &str,
) -> Result<heapless::String<N>, CredentialError> {
    if value.is_empty() {
        return Err(CredentialError::Empty(field));
    }
    bounded(field, value)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkCredential {
    pub ssid: heapless::String<MAX_SSID_LEN>,
    pub passphrase: heapless::String<MAX_PASSPHRASE_LEN>,
}

impl NetworkCredential {
    pub fn new(ssid: &str, passphrase: &str) -> Result<Self, CredentialError> {
        Ok(Self {
            ssid: required("ssid", ssid)?,
            passphrase: required("passphrase", passphrase)?,
        })
    }

    /// Re-check a record that arrived from outside (storage or the portal channel).
    pub fn validate(&self) -> Result<(), CredentialError> {
        if self.ssid.is_empty() {
            return Err(CredentialError::Empty("ssid"));
        }
        if self.passphrase.is_empty() {
            return Err(CredentialError::Empty("passphrase"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerSettings {
    pub host: heapless::String<MAX_SERVER_STR_LEN>,
    pub port: u16,
    pub username: Option<heapless::String<MAX_USER_STR_LEN>>,
    pub password: Option<heapless::String<MAX_PASSWORD_STR_LEN>>,
}

impl BrokerSettings {
    pub fn new(host: &str, port: u16) -> Result<Self, CredentialError> {
        if port == 0 {
            return Err(CredentialError::Malformed("mqtt port must be 1-65535".into()));
        }
        Ok(Self {
            host: required("mqtt_host", host)?,
            port,
            username: None,
            password: None,
        })
    }

    pub fn with_login(mut self, username: &str, password: &str) -> Result<Self, CredentialError> {
        self.username = Some(required("mqtt_user", username)?);
        self.password = if password.is_empty() {
            None
        } else {
            Some(bounded("mqtt_password", password)?)
        };
        Ok(self)
    }

    pub fn url(&self) -> String {
        format!("mqtt://{}:{}", self.host, self.port)
    }

    /// Compile-time fallback broker (`WATERMETER_MQTT_HOST`), if one was baked in.
    pub fn compiled_default() -> Option<Self> {
        let host = option_env!("WATERMETER_MQTT_HOST")?;
        let port = option_env!("WATERMETER_MQTT_PORT")
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_MQTT_PORT);
        Self::new(host, port).ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeterTopics {
    pub kliters: heapless::String<MAX_TOPIC_LEN>,
    pub flow_rate: heapless::String<MAX_TOPIC_LEN>,
}

impl MeterTopics {
    pub fn new(kliters: &str, flow_rate: &str) -> Result<Self, CredentialError> {
        Ok(Self {
            kliters: required("kliters_topic", kliters)?,
            flow_rate: required("flowrate_topic", flow_rate)?,
        })
    }
}

impl Default for MeterTopics {
    fn default() -> Self {
        Self {
            kliters: bounded("kliters_topic", METER_KLITERS_TOPIC).unwrap_or_default(),
            flow_rate: bounded("flowrate_topic", METER_FLOWRATE_TOPIC).unwrap_or_default(),
        }
    }
}

/// Read-only device identity, loaded once at boot.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub hostname: heapless::String<MAX_SSID_LEN>,
    pub ap_password: heapless::String<MAX_PASSPHRASE_LEN>,
    pub reset_pin: u8,
    pub pulse_pin: u8,
    pub topics: MeterTopics,
    pub default_broker: Option<BrokerSettings>,
}

impl DeviceConfig {
    /// Rename the device; the hostname doubles as portal SSID and MQTT client id.
    pub fn with_hostname(mut self, hostname: &str) -> Result<Self, CredentialError> {
        self.hostname = required("hostname", hostname)?;
        Ok(self)
    }

    pub fn with_topics(mut self, topics: MeterTopics) -> Self {
        self.topics = topics;
        self
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            hostname: bounded("hostname", HOSTNAME).unwrap_or_default(),
            ap_password: bounded("ap_password", AP_PASSWORD).unwrap_or_default(),
            reset_pin: RESET_WIFI_PIN,
            pulse_pin: PULSE_PIN,
            topics: MeterTopics::default(),
            default_broker: BrokerSettings::compiled_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oversize_topics_and_hostname_are_rejected() {
        let topic = "t".repeat(MAX_TOPIC_LEN + 1);
        assert_eq!(
            MeterTopics::new(&topic, METER_FLOWRATE_TOPIC),
            Err(CredentialError::TooLong {
                field: "kliters_topic",
                max: MAX_TOPIC_LEN
            })
        );
        let topics = MeterTopics::new("meter/kl", "meter/flow").unwrap();
        let device = DeviceConfig::default().with_topics(topics);
        assert_eq!(device.topics.flow_rate.as_str(), "meter/flow");

        let long = "h".repeat(MAX_SSID_LEN + 1);
        assert!(DeviceConfig::default().with_hostname(&long).is_err());
        assert_eq!(
            DeviceConfig::default().with_hostname("cellar").unwrap().hostname.as_str(),
            "cellar"
        );
        assert_eq!(MeterTopics::default().kliters.as_str(), METER_KLITERS_TOPIC);
    }

    #[test]
    fn credential_rejects_empty_fields() {
        assert_eq!(
            NetworkCredential::new("", "secret"),
            Err(CredentialError::Empty("ssid"))
        );
        assert_eq!(
            NetworkCredential::new("home", ""),
            Err(CredentialError::Empty("passphrase"))
        );
    }

    #[test]
    fn credential_rejects_oversize_ssid() {
        let ssid = "x".repeat(MAX_SSID_LEN + 1);
        assert_eq!(
            NetworkCredential::new(&ssid, "secret"),
            Err(CredentialError::TooLong {
                field: "ssid",
                max: MAX_SSID_LEN
            })
        );
        let exact = "x".repeat(MAX_SSID_LEN);
        assert!(NetworkCredential::new(&exact, "secret").is_ok());
    }

    #[test]
    fn broker_url_and_login() {
        let broker = BrokerSettings::new("192.168.1.20", 1883)
            .and_then(|b| b.with_login("meter", ""))
            .unwrap();
        assert_eq!(broker.url(), "mqtt://192.168.1.20:1883");
        assert_eq!(broker.username.as_deref(), Some("meter"));
        assert_eq!(broker.password, None);
    }

    #[test]
    fn broker_rejects_port_zero() {
        assert!(matches!(
            BrokerSettings::new("broker", 0),
            Err(CredentialError::Malformed(_))
        ));
    }

    #[test]
    fn default_device_identity() {
        let config = DeviceConfig::default();
        assert_eq!(config.hostname.as_str(), "watermeter");
        assert_eq!(config.ap_password.as_str(), "wifisetup");
        assert_eq!(config.topics.kliters.as_str(), "sensor/water-meter/kLiters");
        assert_eq!(config.topics.flow_rate.as_str(), "sensor/water-meter/FlowRate");
    }
}
