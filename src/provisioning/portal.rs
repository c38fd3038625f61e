//! Config portal boundary: parsing and validating operator submissions.
//!
//! The HTTP handler runs on its own task. Accepted submissions are sent over a
//! channel and picked up by the provisioning machine during its poll.

use crate::network_config::{BrokerSettings, CredentialError, NetworkCredential, DEFAULT_MQTT_PORT};
use serde::Deserialize;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortalSubmission {
    pub credential: NetworkCredential,
    pub broker: Option<BrokerSettings>,
}

#[derive(Debug, Deserialize)]
struct SubmissionForm {
    ssid: String,
    passphrase: String,
    mqtt_host: Option<String>,
    mqtt_port: Option<u16>,
    mqtt_user: Option<String>,
    mqtt_password: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Parse the JSON body posted by the portal page.
pub fn parse_submission(body: &[u8]) -> Result<PortalSubmission, CredentialError> {
    let form: SubmissionForm =
        serde_json::from_slice(body).map_err(|e| CredentialError::Malformed(e.to_string()))?;

    let credential = NetworkCredential::new(form.ssid.trim(), &form.passphrase)?;

    let broker = match non_empty(form.mqtt_host) {
        Some(host) => {
            let broker = BrokerSettings::new(host.trim(), form.mqtt_port.unwrap_or(DEFAULT_MQTT_PORT))?;
            match non_empty(form.mqtt_user) {
                Some(user) => Some(broker.with_login(&user, form.mqtt_password.as_deref().unwrap_or(""))?),
                None => Some(broker),
            }
        }
        None => None,
    };

    Ok(PortalSubmission { credential, broker })
}

/// Sending half, owned by the HTTP handler.
#[derive(Clone)]
pub struct PortalOutbox {
    tx: Sender<PortalSubmission>,
}

/// Receiving half, drained without blocking by the main cycle.
pub struct PortalInbox {
    rx: Receiver<PortalSubmission>,
}

pub fn portal_channel() -> (PortalOutbox, PortalInbox) {
    let (tx, rx) = mpsc::channel();
    (PortalOutbox { tx }, PortalInbox { rx })
}

impl PortalOutbox {
    /// Validate and forward a raw request body. The error goes back to the operator.
    pub fn submit(&self, body: &[u8]) -> Result<(), CredentialError> {
        let submission = parse_submission(body)?;
        log::info!("Portal: Accepted credentials for '{}'", submission.credential.ssid);
        self.tx
            .send(submission)
            .map_err(|_| CredentialError::Malformed("device is not accepting configuration".into()))
    }
}

impl PortalInbox {
    pub fn try_take(&self) -> Option<PortalSubmission> {
        match self.rx.try_recv() {
            Ok(submission) => Some(submission),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Discard anything submitted while the portal was not listening.
    pub fn clear(&self) {
        while self.rx.try_recv().is_ok() {}
    }
}

pub const PORTAL_PAGE: &str = r#"<!DOCTYPE html>
<html><head><meta name="viewport" content="width=device-width,initial-scale=1">
<title>Water Meter Setup</title></head>
<body>
<h2>Water Meter WiFi Setup</h2>
<form id="f">
<p>WiFi SSID<br><input name="ssid" maxlength="32" required></p>
<p>WiFi password<br><input name="passphrase" type="password" maxlength="64" required></p>
<p>MQTT server<br><input name="mqtt_host" maxlength="32"></p>
<p>MQTT port<br><input name="mqtt_port" type="number" value="1883"></p>
<p>MQTT user<br><input name="mqtt_user" maxlength="32"></p>
<p>MQTT password<br><input name="mqtt_password" type="password" maxlength="32"></p>
<button>Save</button>
</form>
<p id="r"></p>
<script>
document.getElementById('f').onsubmit = async (e) => {
  e.preventDefault();
  const d = Object.fromEntries(new FormData(e.target));
  d.mqtt_port = d.mqtt_port ? parseInt(d.mqtt_port) : null;
  const res = await fetch('/save', {method: 'POST', body: JSON.stringify(d)});
  document.getElementById('r').textContent = await res.text();
};
</script>
</body></html>
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_credentials_only() {
        let sub = parse_submission(br#"{"ssid":" home ","passphrase":"pa ss"}"#).unwrap();
        assert_eq!(sub.credential.ssid.as_str(), "home");
        assert_eq!(sub.credential.passphrase.as_str(), "pa ss");
        assert_eq!(sub.broker, None);
    }

    #[test]
    fn parses_broker_settings() {
        let body = br#"{"ssid":"home","passphrase":"secret","mqtt_host":"10.0.0.2",
            "mqtt_port":null,"mqtt_user":"meter","mqtt_password":"pw"}"#;
        let broker = parse_submission(body).unwrap().broker.unwrap();
        assert_eq!(broker.url(), "mqtt://10.0.0.2:1883");
        assert_eq!(broker.username.as_deref(), Some("meter"));
        assert_eq!(broker.password.as_deref(), Some("pw"));
    }

    #[test]
    fn blank_broker_host_means_no_broker() {
        let body = br#"{"ssid":"home","passphrase":"secret","mqtt_host":"  "}"#;
        assert_eq!(parse_submission(body).unwrap().broker, None);
    }

    #[test]
    fn rejects_invalid_submissions() {
        assert_eq!(
            parse_submission(br#"{"ssid":"","passphrase":"x"}"#),
            Err(CredentialError::Empty("ssid"))
        );
        assert!(matches!(
            parse_submission(b"ssid=home"),
            Err(CredentialError::Malformed(_))
        ));
        let long_host = format!(
            r#"{{"ssid":"a","passphrase":"b","mqtt_host":"{}"}}"#,
            "h".repeat(40)
        );
        assert!(matches!(
            parse_submission(long_host.as_bytes()),
            Err(CredentialError::TooLong { field: "mqtt_host", .. })
        ));
    }

    #[test]
    fn outbox_forwards_only_valid_submissions() {
        let (outbox, inbox) = portal_channel();
        assert!(outbox.submit(br#"{"ssid":"","passphrase":"x"}"#).is_err());
        assert_eq!(inbox.try_take(), None);

        outbox.submit(br#"{"ssid":"home","passphrase":"x"}"#).unwrap();
        let sub = inbox.try_take().unwrap();
        assert_eq!(sub.credential.ssid.as_str(), "home");
        assert_eq!(inbox.try_take(), None);
    }
}
