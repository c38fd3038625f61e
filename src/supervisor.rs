//! Top level cycle: one owner for "now", every component advanced in a fixed
//! order from a single non-blocking `cycle()` call.

use crate::clock::{Clock, Micros};
use crate::meter::{CaptureStats, FlowAccumulator, FlowSample, MeterConfig, PulseDrain};
use crate::network_config::{BrokerSettings, DeviceConfig};
use crate::provisioning::{
    ProvisioningConfig, ProvisioningEvent, ProvisioningMachine, ProvisioningMode, Radio, RadioMode,
};
use crate::storage::{self, KeyValueStore, StorageError, BROKER_KEY};
use crate::telemetry::{
    Broker, LinkState, PublishOutcome, TelemetryConfig, TelemetryPublisher, TelemetryStats,
};
use core::time::Duration;
use embedded_hal::digital::v2::InputPin;

/// Manual "forget the network" input.
pub trait ResetTrigger {
    /// True while the operator holds the input.
    fn is_active(&mut self) -> bool;
}

/// Active-low push button on a GPIO. A read error counts as released.
pub struct ResetPin<P: InputPin> {
    pin: P,
}

impl<P: InputPin> ResetPin<P> {
    pub fn new(pin: P) -> Self {
        Self { pin }
    }
}

impl<P: InputPin> ResetTrigger for ResetPin<P> {
    fn is_active(&mut self) -> bool {
        self.pin.is_low().unwrap_or(false)
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub meter: MeterConfig,
    pub provisioning: ProvisioningConfig,
    pub telemetry: TelemetryConfig,
    /// Sleep between cycles in the firmware loop
    pub cycle_interval: Duration,
    /// Watch the reset input after boot as well, not just at power-up
    pub poll_reset_input: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            meter: MeterConfig::default(),
            provisioning: ProvisioningConfig::default(),
            telemetry: TelemetryConfig::default(),
            cycle_interval: Duration::from_millis(100),
            poll_reset_input: true,
        }
    }
}

/// Everything the supervisor drives, handed over once at boot.
pub struct Hardware<'q, C, R, B, S, T> {
    pub clock: C,
    pub drain: PulseDrain<'q>,
    pub radio: R,
    pub broker: B,
    pub store: S,
    pub reset: T,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub now: Micros,
    pub pulses: usize,
    pub mode: ProvisioningMode,
    pub event: Option<ProvisioningEvent>,
    pub link: LinkState,
    pub publish: PublishOutcome,
    pub reset_serviced: bool,
}

/// Point-in-time view for the console.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusSnapshot {
    pub uptime: Duration,
    pub cumulative_liters: f64,
    pub pulses: u64,
    pub liters_per_pulse: f64,
    pub flow: FlowSample,
    pub flow_window: Duration,
    pub capture: CaptureStats,
    pub pending_pulses: usize,
    pub ring_evictions: u32,
    pub mode: ProvisioningMode,
    pub radio_mode: RadioMode,
    pub associated: bool,
    pub ssid: Option<String>,
    pub hostname: String,
    pub client_failures: u32,
    pub association_retry_in: Option<Duration>,
    pub link: LinkState,
    pub broker_url: Option<String>,
    pub broker_retry_in: Option<Duration>,
    pub telemetry: TelemetryStats,
}

pub struct Supervisor<'q, C, R, B, S, T>
where
    C: Clock,
    R: Radio,
    B: Broker,
    S: KeyValueStore,
    T: ResetTrigger,
{
    clock: C,
    drain: PulseDrain<'q>,
    store: S,
    reset: T,
    accumulator: FlowAccumulator,
    provisioning: ProvisioningMachine<R>,
    publisher: TelemetryPublisher<B>,
    device: DeviceConfig,
    poll_reset_input: bool,
    reset_was_active: bool,
    reset_requested: bool,
    checkpoint_failures: u32,
    last_now: Micros,
    uptime: Duration,
    last_sample: FlowSample,
}

impl<'q, C, R, B, S, T> Supervisor<'q, C, R, B, S, T>
where
    C: Clock,
    R: Radio,
    B: Broker,
    S: KeyValueStore,
    T: ResetTrigger,
{
    /// Restore the meter, sample the reset input once and pick the network mode.
    pub fn boot(config: SupervisorConfig, device: DeviceConfig, hw: Hardware<'q, C, R, B, S, T>) -> Self {
        let Hardware {
            clock,
            drain,
            radio,
            broker,
            mut store,
            mut reset,
        } = hw;
        let now = clock.now();

        let (accumulator, restored) = FlowAccumulator::restore(config.meter, now, &mut store);
        if let Err(e) = restored {
            log::error!("Meter: Checkpoint unreadable ({}), counting from 0 L", e);
        }

        let reset_active = reset.is_active();
        let mut provisioning = ProvisioningMachine::new(radio, config.provisioning, &device);
        let mode = provisioning.boot(now, &mut store, reset_active);

        let settings = match storage::load_json::<_, BrokerSettings>(&mut store, BROKER_KEY) {
            Ok(Some(settings)) => Some(settings),
            Ok(None) => device.default_broker.clone(),
            Err(e) => {
                log::warn!("MQTT: Stored broker settings unreadable: {}", e);
                device.default_broker.clone()
            }
        };
        let publisher = TelemetryPublisher::new(broker, config.telemetry, &device.hostname, device.topics.clone())
            .with_settings(settings);

        log::info!("✅ Supervisor: Booted in {} mode", mode.as_str());

        Self {
            clock,
            drain,
            store,
            reset,
            accumulator,
            provisioning,
            publisher,
            device,
            poll_reset_input: config.poll_reset_input,
            reset_was_active: reset_active,
            reset_requested: false,
            checkpoint_failures: 0,
            last_now: now,
            uptime: Duration::ZERO,
            last_sample: FlowSample {
                liters_per_minute: 0.0,
                window_start: now,
                window_end: now,
            },
        }
    }

    /// One non-blocking pass over every component.
    pub fn cycle(&mut self) -> CycleReport {
        let now = self.clock.now();
        self.uptime += now.since(self.last_now);
        self.last_now = now;

        let reset_serviced = self.service_reset(now);

        let accumulator = &mut self.accumulator;
        let pulses = self.drain.drain(|event| accumulator.record_pulse(event));

        let event = self.provisioning.poll(now, &mut self.store);
        if let Some(ProvisioningEvent::Configured { broker: Some(broker) }) = &event {
            self.publisher.set_settings(Some(broker.clone()));
        }

        if self.accumulator.checkpoint_due(now) {
            match self.accumulator.checkpoint(now, &mut self.store) {
                Ok(()) => self.checkpoint_failures = 0,
                Err(e) => {
                    self.checkpoint_failures += 1;
                    if self.checkpoint_failures == 1 {
                        log::warn!(
                            "Meter: Checkpoint failed, retrying in {}s: {}",
                            self.accumulator.checkpoint_interval().as_secs(),
                            e
                        );
                    }
                }
            }
        }

        self.last_sample = self.accumulator.sample(now);

        let link = self.publisher.poll(now, self.provisioning.telemetry_ready());
        let publish = self.publisher.publish_cycle(
            now,
            self.accumulator.cumulative_liters(),
            self.last_sample.liters_per_minute,
        );

        CycleReport {
            now,
            pulses,
            mode: self.provisioning.mode(),
            event,
            link,
            publish,
            reset_serviced,
        }
    }

    fn service_reset(&mut self, now: Micros) -> bool {
        let mut triggered = core::mem::take(&mut self.reset_requested);
        if self.poll_reset_input {
            let active = self.reset.is_active();
            if active && !self.reset_was_active {
                log::warn!("WiFi: Reset input pressed");
                triggered = true;
            }
            self.reset_was_active = active;
        }

        if triggered {
            if let Err(e) = self.provisioning.force_portal(now, &mut self.store) {
                log::error!("WiFi: Credential erase failed: {}", e);
            }
        }
        triggered
    }

    /// Console `wifi_reset`; serviced at the top of the next cycle.
    pub fn request_reset(&mut self) {
        self.reset_requested = true;
    }

    pub fn checkpoint(&mut self) -> Result<(), StorageError> {
        let now = self.clock.now();
        self.accumulator.checkpoint(now, &mut self.store)
    }

    /// Orderly stop: persist the volume and close the broker session.
    pub fn shutdown(&mut self) -> Result<(), StorageError> {
        log::info!("Supervisor: Shutting down");
        let saved = self.checkpoint();
        self.publisher.shutdown();
        saved
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let now = self.clock.now();
        let state = self.accumulator.state();
        StatusSnapshot {
            uptime: self.uptime + now.since(self.last_now),
            cumulative_liters: state.cumulative_liters(),
            pulses: state.pulses,
            liters_per_pulse: state.liters_per_pulse,
            flow: self.last_sample,
            flow_window: self.accumulator.flow_window(),
            capture: self.drain.stats(),
            pending_pulses: self.drain.pending(),
            ring_evictions: self.accumulator.ring_evictions(),
            mode: self.provisioning.mode(),
            radio_mode: self.provisioning.radio_mode(),
            associated: self.provisioning.is_associated(),
            ssid: self.provisioning.credential_ssid().map(str::to_string),
            hostname: self.device.hostname.to_string(),
            client_failures: self.provisioning.client_failures(),
            association_retry_in: self.provisioning.next_retry_in(now),
            link: self.publisher.state(),
            broker_url: self.publisher.settings().map(BrokerSettings::url),
            broker_retry_in: self.publisher.next_retry_in(now),
            telemetry: self.publisher.stats().clone(),
        }
    }

    pub fn provisioning(&self) -> &ProvisioningMachine<R> {
        &self.provisioning
    }

    pub fn provisioning_mut(&mut self) -> &mut ProvisioningMachine<R> {
        &mut self.provisioning
    }

    pub fn publisher(&self) -> &TelemetryPublisher<B> {
        &self.publisher
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }
}
