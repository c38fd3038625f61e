//! Test doubles for the hardware seams.

use crate::clock::{duration_to_micros, Clock, Micros};
use crate::network_config::{BrokerSettings, NetworkCredential};
use crate::provisioning::{Association, PortalSubmission, Radio, RadioError};
use crate::telemetry::{Broker, TelemetryError};
use core::time::Duration;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

/// Manually advanced clock; clones share the same time.
#[derive(Clone, Default)]
pub struct ManualClock(Rc<Cell<u32>>);

impl ManualClock {
    pub fn starting_at(raw: u32) -> Self {
        Self(Rc::new(Cell::new(raw)))
    }

    pub fn advance(&self, d: Duration) {
        self.0.set(self.0.get().wrapping_add(duration_to_micros(d)));
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Micros {
        Micros(self.0.get())
    }
}

#[derive(Debug, Default)]
pub struct ScriptedRadio {
    pub ap_active: bool,
    pub station_active: bool,
    /// Association reported after each `start_station`
    pub on_start: Association,
    pub association: Association,
    pub fail_ap_start: bool,
    pub submissions: VecDeque<PortalSubmission>,
    pub ap_starts: u32,
    pub station_starts: u32,
    pub last_credential: Option<NetworkCredential>,
    pub advertised: Vec<String>,
    /// Set if a mode was started while the other was still active
    pub overlap_detected: bool,
}

impl Radio for ScriptedRadio {
    fn start_access_point(&mut self, _ssid: &str, _passphrase: &str) -> Result<(), RadioError> {
        if self.station_active {
            self.overlap_detected = true;
        }
        if self.fail_ap_start {
            return Err(RadioError::Driver("ap start failed".into()));
        }
        self.ap_active = true;
        self.ap_starts += 1;
        Ok(())
    }

    fn start_station(&mut self, credential: &NetworkCredential) -> Result<(), RadioError> {
        if self.ap_active {
            self.overlap_detected = true;
        }
        self.station_active = true;
        self.station_starts += 1;
        self.last_credential = Some(credential.clone());
        self.association = self.on_start;
        Ok(())
    }

    fn association(&mut self) -> Association {
        if self.station_active {
            self.association
        } else {
            Association::Idle
        }
    }

    fn stop(&mut self) -> Result<(), RadioError> {
        self.ap_active = false;
        self.station_active = false;
        self.association = Association::Idle;
        Ok(())
    }

    fn poll_submission(&mut self) -> Option<PortalSubmission> {
        if self.ap_active {
            self.submissions.pop_front()
        } else {
            None
        }
    }

    fn advertise(&mut self, hostname: &str) -> Result<(), RadioError> {
        self.advertised.push(hostname.to_string());
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct BrokerLog {
    pub connects: u32,
    pub disconnects: u32,
    pub published: Vec<(String, String)>,
}

/// Broker whose reachability is flipped by the test. The log is shared so it
/// stays readable after the broker is moved into a publisher.
#[derive(Debug, Clone, Default)]
pub struct ScriptedBroker {
    pub reachable: Rc<Cell<bool>>,
    pub reject_publish: Rc<Cell<bool>>,
    pub log: Rc<RefCell<BrokerLog>>,
    connected: bool,
}

impl ScriptedBroker {
    pub fn reachable() -> Self {
        let broker = Self::default();
        broker.reachable.set(true);
        broker
    }
}

impl Broker for ScriptedBroker {
    fn connect(&mut self, _settings: &BrokerSettings, _client_id: &str) -> Result<(), TelemetryError> {
        self.log.borrow_mut().connects += 1;
        if self.reachable.get() {
            self.connected = true;
            Ok(())
        } else {
            Err(TelemetryError::Unreachable("scripted".into()))
        }
    }

    fn is_connected(&self) -> bool {
        self.connected && self.reachable.get()
    }

    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), TelemetryError> {
        if !self.is_connected() {
            return Err(TelemetryError::NotConnected);
        }
        if self.reject_publish.get() {
            return Err(TelemetryError::Rejected(topic.to_string()));
        }
        self.log.borrow_mut().published.push((
            topic.to_string(),
            String::from_utf8_lossy(payload).into_owned(),
        ));
        Ok(())
    }

    fn disconnect(&mut self) {
        self.connected = false;
        self.log.borrow_mut().disconnects += 1;
    }
}
