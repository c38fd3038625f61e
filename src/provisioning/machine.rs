use super::{Association, PortalSubmission, ProvisioningMode, Radio, RadioMode};
use crate::backoff::Backoff;
use crate::clock::{Deadline, Micros};
use crate::network_config::{BrokerSettings, DeviceConfig, NetworkCredential};
use crate::storage::{self, KeyValueStore, StorageError, BROKER_KEY, CREDENTIAL_KEY};
use core::time::Duration;

#[derive(Debug, Clone)]
pub struct ProvisioningConfig {
    /// Give up on one association attempt after this long
    pub association_timeout: Duration,
    /// Failed attempts in CLIENT before settling into CLIENT_RETRY
    pub max_client_attempts: u32,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    /// Reopen check for the portal; `None` keeps it open until configured
    pub portal_timeout: Option<Duration>,
    /// Delay before retrying a failed access point start
    pub portal_restart_delay: Duration,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            association_timeout: Duration::from_secs(15),
            max_client_attempts: 5,
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
            portal_timeout: None,
            portal_restart_delay: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningEvent {
    PortalOpened,
    /// A submission was persisted; carries broker settings if the operator gave any
    Configured { broker: Option<BrokerSettings> },
    Associated,
    AssociationLost,
    RetryScheduled { delay: Duration },
    EnteredClientRetry,
}

pub struct ProvisioningMachine<R: Radio> {
    radio: R,
    config: ProvisioningConfig,
    ap_ssid: heapless::String<32>,
    ap_password: heapless::String<64>,
    hostname: heapless::String<32>,
    mode: ProvisioningMode,
    radio_mode: RadioMode,
    credential: Option<NetworkCredential>,
    backoff: Backoff,
    client_failures: u32,
    attempt: Option<Deadline>,
    retry_at: Option<Deadline>,
    associated: bool,
    advertised: bool,
    portal_opened: Option<Micros>,
}

impl<R: Radio> ProvisioningMachine<R> {
    pub fn new(radio: R, config: ProvisioningConfig, device: &DeviceConfig) -> Self {
        let backoff = Backoff::new(config.backoff_initial, config.backoff_max);
        Self {
            radio,
            config,
            ap_ssid: device.hostname.clone(),
            ap_password: device.ap_password.clone(),
            hostname: device.hostname.clone(),
            mode: ProvisioningMode::Unconfigured,
            radio_mode: RadioMode::Off,
            credential: None,
            backoff,
            client_failures: 0,
            attempt: None,
            retry_at: None,
            associated: false,
            advertised: false,
            portal_opened: None,
        }
    }

    /// Decide the initial mode from stored credentials and the reset input.
    pub fn boot<S: KeyValueStore>(
        &mut self,
        now: Micros,
        store: &mut S,
        reset_active: bool,
    ) -> ProvisioningMode {
        if reset_active {
            log::warn!("WiFi: Reset input held at boot, erasing credentials");
            if let Err(e) = self.force_portal(now, store) {
                log::error!("WiFi: Credential erase failed: {}", e);
            }
            return self.mode;
        }

        match storage::load_json::<_, NetworkCredential>(store, CREDENTIAL_KEY) {
            Ok(Some(credential)) if credential.validate().is_ok() => {
                log::info!("WiFi: Stored credentials for '{}'", credential.ssid);
                self.credential = Some(credential);
                self.enter_client(now, ProvisioningMode::Client);
            }
            Ok(Some(_)) | Ok(None) => {
                log::info!("WiFi: No usable credentials stored");
                self.enter_portal(now);
            }
            Err(e) => {
                log::error!("WiFi: Credentials unreadable ({}), opening config portal", e);
                self.enter_portal(now);
            }
        }
        self.mode
    }

    /// Manual reset: erase credentials and open the portal from any state.
    ///
    /// The transition happens even if the erase fails; the error is returned
    /// for reporting.
    pub fn force_portal<S: KeyValueStore>(
        &mut self,
        now: Micros,
        store: &mut S,
    ) -> Result<(), StorageError> {
        let erased = store.erase(CREDENTIAL_KEY);
        self.credential = None;
        self.enter_portal(now);
        erased
    }

    /// Advance timers and radio state. Never blocks.
    pub fn poll<S: KeyValueStore>(&mut self, now: Micros, store: &mut S) -> Option<ProvisioningEvent> {
        match self.mode {
            ProvisioningMode::Unconfigured => {
                self.enter_portal(now);
                Some(ProvisioningEvent::PortalOpened)
            }
            ProvisioningMode::ConfigPortal => self.poll_portal(now, store),
            ProvisioningMode::Client | ProvisioningMode::ClientRetry => self.poll_client(now),
        }
    }

    fn poll_portal<S: KeyValueStore>(&mut self, now: Micros, store: &mut S) -> Option<ProvisioningEvent> {
        if self.radio_mode == RadioMode::Off {
            if self.retry_at.map_or(true, |d| d.expired(now)) {
                self.enter_portal(now);
                if self.radio_mode == RadioMode::AccessPoint {
                    return Some(ProvisioningEvent::PortalOpened);
                }
            }
            return None;
        }

        if let Some(submission) = self.radio.poll_submission() {
            return self.accept(now, store, submission);
        }

        let timeout = self.config.portal_timeout?;
        let opened = self.portal_opened?;
        if !Deadline::after(opened, timeout).expired(now) {
            return None;
        }

        match storage::load_json::<_, NetworkCredential>(store, CREDENTIAL_KEY) {
            Ok(Some(credential)) if credential.validate().is_ok() => {
                log::info!("Portal: Timed out, retrying stored network '{}'", credential.ssid);
                self.credential = Some(credential);
                self.enter_client(now, ProvisioningMode::ClientRetry);
                Some(ProvisioningEvent::EnteredClientRetry)
            }
            _ => {
                log::info!("Portal: Timed out with nothing stored, staying open");
                self.portal_opened = Some(now);
                None
            }
        }
    }

    fn accept<S: KeyValueStore>(
        &mut self,
        now: Micros,
        store: &mut S,
        submission: PortalSubmission,
    ) -> Option<ProvisioningEvent> {
        if let Err(e) = submission.credential.validate() {
            log::warn!("Portal: Rejected submission: {}", e);
            return None;
        }

        if let Err(e) = storage::store_json(store, CREDENTIAL_KEY, &submission.credential) {
            log::error!("Portal: Could not save credentials ({}), staying in portal", e);
            return None;
        }

        if let Some(broker) = &submission.broker {
            if let Err(e) = storage::store_json(store, BROKER_KEY, broker) {
                log::warn!("Portal: Could not save MQTT settings: {}", e);
            }
        }

        log::info!("Portal: Saved credentials for '{}'", submission.credential.ssid);
        self.credential = Some(submission.credential);
        self.enter_client(now, ProvisioningMode::Client);
        Some(ProvisioningEvent::Configured {
            broker: submission.broker,
        })
    }

    fn poll_client(&mut self, now: Micros) -> Option<ProvisioningEvent> {
        if let Some(attempt) = self.attempt {
            return match self.radio.association() {
                Association::Connected => Some(self.associated(now)),
                Association::Failed => Some(self.attempt_failed(now)),
                Association::Connecting | Association::Idle if attempt.expired(now) => {
                    log::warn!("WiFi: Association timed out");
                    Some(self.attempt_failed(now))
                }
                Association::Connecting | Association::Idle => None,
            };
        }

        if self.associated {
            if self.radio.association() == Association::Connected {
                return None;
            }
            log::warn!("WiFi: Association lost, reconnecting");
            self.associated = false;
            self.client_failures = 0;
            self.backoff.reset();
            self.mode = ProvisioningMode::Client;
            self.begin_attempt(now);
            return Some(ProvisioningEvent::AssociationLost);
        }

        if self.retry_at.is_some_and(|d| d.expired(now)) {
            self.retry_at = None;
            self.begin_attempt(now);
        }
        None
    }

    fn associated(&mut self, now: Micros) -> ProvisioningEvent {
        self.attempt = None;
        self.retry_at = None;
        self.associated = true;
        self.client_failures = 0;
        self.backoff.reset();
        if self.mode == ProvisioningMode::ClientRetry {
            log::info!("WiFi: Network back, leaving CLIENT_RETRY");
            self.mode = ProvisioningMode::Client;
        }
        log::info!("✅ WiFi: Associated at {} us", now.raw());

        if !self.advertised {
            match self.radio.advertise(&self.hostname) {
                Ok(()) => {
                    self.advertised = true;
                    log::info!("✅ WiFi: Advertising {}.local", self.hostname);
                }
                Err(e) => log::warn!("WiFi: Hostname advertisement failed: {}", e),
            }
        }
        ProvisioningEvent::Associated
    }

    fn attempt_failed(&mut self, now: Micros) -> ProvisioningEvent {
        self.attempt = None;
        self.client_failures = self.client_failures.saturating_add(1);

        if self.mode == ProvisioningMode::Client
            && self.client_failures >= self.config.max_client_attempts
        {
            log::warn!(
                "WiFi: {} failed attempts, retrying every {:?}",
                self.client_failures,
                self.backoff.max()
            );
            self.mode = ProvisioningMode::ClientRetry;
            self.backoff.saturate();
            self.retry_at = Some(Deadline::after(now, self.backoff.next_delay()));
            return ProvisioningEvent::EnteredClientRetry;
        }

        let delay = self.backoff.next_delay();
        if self.mode == ProvisioningMode::Client {
            log::warn!(
                "WiFi: Association failed (#{}, retry in {:?})",
                self.client_failures,
                delay
            );
        } else {
            log::debug!("WiFi: Retry #{} failed", self.client_failures);
        }
        self.retry_at = Some(Deadline::after(now, delay));
        ProvisioningEvent::RetryScheduled { delay }
    }

    fn begin_attempt(&mut self, now: Micros) {
        let Some(credential) = self.credential.as_ref() else {
            self.enter_portal(now);
            return;
        };
        match self.radio.start_station(credential) {
            Ok(()) => {
                self.radio_mode = RadioMode::Station;
                self.attempt = Some(Deadline::after(now, self.config.association_timeout));
                log::info!("🌐 WiFi: Connecting to '{}'...", credential.ssid);
            }
            Err(e) => {
                log::warn!("WiFi: Station start failed: {}", e);
                self.radio_mode = RadioMode::Station;
                self.attempt_failed(now);
            }
        }
    }

    fn switch_radio_off(&mut self) {
        if let Err(e) = self.radio.stop() {
            log::warn!("WiFi: Radio stop failed: {}", e);
        }
        self.radio_mode = RadioMode::Off;
    }

    fn enter_client(&mut self, now: Micros, mode: ProvisioningMode) {
        self.switch_radio_off();
        self.mode = mode;
        self.associated = false;
        self.retry_at = None;
        self.portal_opened = None;
        self.client_failures = 0;
        self.backoff.reset();
        if mode == ProvisioningMode::ClientRetry {
            self.backoff.saturate();
        }
        self.begin_attempt(now);
    }

    fn enter_portal(&mut self, now: Micros) {
        self.switch_radio_off();
        self.mode = ProvisioningMode::ConfigPortal;
        self.associated = false;
        self.attempt = None;
        self.retry_at = None;

        match self.radio.start_access_point(&self.ap_ssid, &self.ap_password) {
            Ok(()) => {
                self.radio_mode = RadioMode::AccessPoint;
                self.portal_opened = Some(now);
                log::info!("📡 Portal: Access point '{}' open", self.ap_ssid);
            }
            Err(e) => {
                log::warn!(
                    "Portal: Access point start failed ({}), retrying in {:?}",
                    e,
                    self.config.portal_restart_delay
                );
                self.retry_at = Some(Deadline::after(now, self.config.portal_restart_delay));
            }
        }
    }

    pub fn mode(&self) -> ProvisioningMode {
        self.mode
    }

    pub fn radio_mode(&self) -> RadioMode {
        self.radio_mode
    }

    pub fn is_associated(&self) -> bool {
        self.associated
    }

    /// Telemetry may only run in CLIENT with a live association.
    pub fn telemetry_ready(&self) -> bool {
        self.mode == ProvisioningMode::Client && self.associated
    }

    pub fn client_failures(&self) -> u32 {
        self.client_failures
    }

    pub fn credential_ssid(&self) -> Option<&str> {
        self.credential.as_ref().map(|c| c.ssid.as_str())
    }

    pub fn next_retry_in(&self, now: Micros) -> Option<Duration> {
        self.retry_at.map(|d| d.remaining(now))
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    pub fn radio_mut(&mut self) -> &mut R {
        &mut self.radio
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{load_json, store_json, DualSlotStore, MemoryStore};
    use crate::testing::ScriptedRadio;

    type Store = DualSlotStore<MemoryStore>;

    fn machine() -> ProvisioningMachine<ScriptedRadio> {
        ProvisioningMachine::new(
            ScriptedRadio::default(),
            ProvisioningConfig::default(),
            &DeviceConfig::default(),
        )
    }

    fn store_with_credential() -> Store {
        let mut store = DualSlotStore::new(MemoryStore::default());
        let credential = NetworkCredential::new("home", "secret").unwrap();
        store_json(&mut store, CREDENTIAL_KEY, &credential).unwrap();
        store
    }

    fn submission(ssid: &str) -> PortalSubmission {
        PortalSubmission {
            credential: NetworkCredential::new(ssid, "hunter22").unwrap(),
            broker: Some(BrokerSettings::new("10.0.0.5", 1883).unwrap()),
        }
    }

    fn at(secs: u64) -> Micros {
        Micros(0).wrapping_add(Duration::from_secs(secs))
    }

    #[test]
    fn no_credentials_opens_portal() {
        let mut m = machine();
        let mut store = DualSlotStore::new(MemoryStore::default());

        assert_eq!(m.boot(at(0), &mut store, false), ProvisioningMode::ConfigPortal);
        assert_eq!(m.radio_mode(), RadioMode::AccessPoint);
        assert!(m.radio().ap_active);
        assert!(!m.telemetry_ready());
    }

    #[test]
    fn portal_submission_persists_and_switches_to_client() {
        let mut m = machine();
        let mut store = DualSlotStore::new(MemoryStore::default());
        m.boot(at(0), &mut store, false);

        m.radio_mut().submissions.push_back(submission("home"));
        let event = m.poll(at(1), &mut store);

        assert!(matches!(event, Some(ProvisioningEvent::Configured { broker: Some(_) })));
        assert_eq!(m.mode(), ProvisioningMode::Client);
        assert_eq!(m.radio_mode(), RadioMode::Station);
        assert!(!m.radio().ap_active);
        assert!(!m.radio().overlap_detected);

        let stored: Option<NetworkCredential> = load_json(&mut store, CREDENTIAL_KEY).unwrap();
        assert_eq!(stored.unwrap().ssid.as_str(), "home");
        let broker: Option<BrokerSettings> = load_json(&mut store, BROKER_KEY).unwrap();
        assert_eq!(broker.unwrap().host.as_str(), "10.0.0.5");
    }

    #[test]
    fn invalid_submission_leaves_portal_open() {
        let mut m = machine();
        let mut store = DualSlotStore::new(MemoryStore::default());
        m.boot(at(0), &mut store, false);

        let mut bad = submission("home");
        bad.credential.passphrase.clear();
        m.radio_mut().submissions.push_back(bad);

        assert_eq!(m.poll(at(1), &mut store), None);
        assert_eq!(m.mode(), ProvisioningMode::ConfigPortal);
        assert!(m.radio().ap_active);
        let stored: Option<NetworkCredential> = load_json(&mut store, CREDENTIAL_KEY).unwrap();
        assert_eq!(stored, None);
    }

    #[test]
    fn unsaveable_credentials_stay_in_portal() {
        let mut m = machine();
        let mut store = DualSlotStore::new(MemoryStore::default());
        m.boot(at(0), &mut store, false);
        store.backend_mut().fail_writes(true);

        m.radio_mut().submissions.push_back(submission("home"));
        assert_eq!(m.poll(at(1), &mut store), None);
        assert_eq!(m.mode(), ProvisioningMode::ConfigPortal);
    }

    #[test]
    fn stored_credentials_associate_and_advertise() {
        let mut m = machine();
        let mut store = store_with_credential();
        m.radio_mut().on_start = Association::Connected;

        assert_eq!(m.boot(at(0), &mut store, false), ProvisioningMode::Client);
        assert_eq!(m.poll(at(1), &mut store), Some(ProvisioningEvent::Associated));
        assert!(m.telemetry_ready());
        assert_eq!(m.radio().advertised, vec!["watermeter".to_string()]);
        assert_eq!(m.poll(at(2), &mut store), None);
    }

    #[test]
    fn reset_from_client_erases_and_opens_portal() {
        let mut m = machine();
        let mut store = store_with_credential();
        m.radio_mut().on_start = Association::Connected;
        m.boot(at(0), &mut store, false);
        m.poll(at(1), &mut store);
        assert!(m.telemetry_ready());

        m.force_portal(at(2), &mut store).unwrap();

        assert_eq!(m.mode(), ProvisioningMode::ConfigPortal);
        assert_eq!(m.radio_mode(), RadioMode::AccessPoint);
        assert!(!m.radio().station_active);
        assert!(!m.telemetry_ready());
        let stored: Option<NetworkCredential> = load_json(&mut store, CREDENTIAL_KEY).unwrap();
        assert_eq!(stored, None);
    }

    #[test]
    fn reset_held_at_boot_ignores_stored_credentials() {
        let mut m = machine();
        let mut store = store_with_credential();

        assert_eq!(m.boot(at(0), &mut store, true), ProvisioningMode::ConfigPortal);
        assert_eq!(m.radio().station_starts, 0);
        let stored: Option<NetworkCredential> = load_json(&mut store, CREDENTIAL_KEY).unwrap();
        assert_eq!(stored, None);
    }

    #[test]
    fn unreadable_credentials_escalate_to_portal() {
        let mut m = machine();
        let mut store = store_with_credential();
        store.backend_mut().corrupt("cred.a", 0);

        assert_eq!(m.boot(at(0), &mut store, false), ProvisioningMode::ConfigPortal);
    }

    #[test]
    fn repeated_failures_back_off_then_settle_in_client_retry() {
        let mut m = machine();
        let mut store = store_with_credential();
        m.radio_mut().on_start = Association::Failed;
        m.boot(at(0), &mut store, false);

        let mut t = 0;
        let mut delays = Vec::new();
        loop {
            t += 1;
            match m.poll(at(t), &mut store) {
                Some(ProvisioningEvent::RetryScheduled { delay }) => delays.push(delay.as_secs()),
                Some(ProvisioningEvent::EnteredClientRetry) => break,
                _ => {}
            }
            assert!(t < 1_000);
        }
        assert_eq!(delays, vec![1, 2, 4, 8]);
        assert_eq!(m.mode(), ProvisioningMode::ClientRetry);
        assert_eq!(m.next_retry_in(at(t)), Some(Duration::from_secs(60)));

        // keeps retrying at the cap, never falls back to the portal
        let starts = m.radio().station_starts;
        for _ in 0..5 {
            t += 60;
            m.poll(at(t), &mut store);
            m.poll(at(t), &mut store);
            assert_eq!(m.mode(), ProvisioningMode::ClientRetry);
            assert_eq!(m.radio_mode(), RadioMode::Station);
        }
        assert_eq!(m.radio().station_starts, starts + 5);
        assert!(!m.radio().ap_active);
    }

    #[test]
    fn client_retry_recovers_to_client() {
        let mut m = machine();
        let mut store = store_with_credential();
        m.radio_mut().on_start = Association::Failed;
        m.boot(at(0), &mut store, false);
        let mut t = 0;
        while m.mode() != ProvisioningMode::ClientRetry {
            t += 60;
            m.poll(at(t), &mut store);
        }

        m.radio_mut().on_start = Association::Connected;
        t += 60;
        m.poll(at(t), &mut store);
        assert_eq!(m.poll(at(t), &mut store), Some(ProvisioningEvent::Associated));
        assert_eq!(m.mode(), ProvisioningMode::Client);
        assert!(m.telemetry_ready());
    }

    #[test]
    fn hung_association_times_out() {
        let mut m = machine();
        let mut store = store_with_credential();
        m.radio_mut().on_start = Association::Connecting;
        m.boot(at(0), &mut store, false);

        assert_eq!(m.poll(at(10), &mut store), None);
        assert_eq!(
            m.poll(at(15), &mut store),
            Some(ProvisioningEvent::RetryScheduled {
                delay: Duration::from_secs(1)
            })
        );
    }

    #[test]
    fn lost_association_reconnects() {
        let mut m = machine();
        let mut store = store_with_credential();
        m.radio_mut().on_start = Association::Connected;
        m.boot(at(0), &mut store, false);
        m.poll(at(1), &mut store);

        m.radio_mut().association = Association::Idle;
        assert_eq!(m.poll(at(2), &mut store), Some(ProvisioningEvent::AssociationLost));
        assert!(!m.telemetry_ready());
        assert_eq!(m.poll(at(3), &mut store), Some(ProvisioningEvent::Associated));
        assert_eq!(m.radio().advertised.len(), 1);
    }

    #[test]
    fn access_point_start_failure_is_retried() {
        let mut m = machine();
        let mut store = DualSlotStore::new(MemoryStore::default());
        m.radio_mut().fail_ap_start = true;
        m.boot(at(0), &mut store, false);
        assert_eq!(m.mode(), ProvisioningMode::ConfigPortal);
        assert_eq!(m.radio_mode(), RadioMode::Off);

        m.radio_mut().fail_ap_start = false;
        assert_eq!(m.poll(at(1), &mut store), None);
        assert_eq!(m.poll(at(5), &mut store), Some(ProvisioningEvent::PortalOpened));
        assert_eq!(m.radio_mode(), RadioMode::AccessPoint);
    }

    #[test]
    fn portal_timeout_falls_back_only_with_stored_network() {
        let config = ProvisioningConfig {
            portal_timeout: Some(Duration::from_secs(300)),
            ..ProvisioningConfig::default()
        };
        let mut m = ProvisioningMachine::new(ScriptedRadio::default(), config, &DeviceConfig::default());
        let mut store = DualSlotStore::new(MemoryStore::default());
        m.boot(at(0), &mut store, false);

        assert_eq!(m.poll(at(300), &mut store), None);
        assert_eq!(m.mode(), ProvisioningMode::ConfigPortal);

        let credential = NetworkCredential::new("home", "secret").unwrap();
        store_json(&mut store, CREDENTIAL_KEY, &credential).unwrap();
        assert_eq!(m.poll(at(599), &mut store), None);
        assert_eq!(
            m.poll(at(600), &mut store),
            Some(ProvisioningEvent::EnteredClientRetry)
        );
        assert_eq!(m.mode(), ProvisioningMode::ClientRetry);
        assert_eq!(m.radio_mode(), RadioMode::Station);
    }
}
