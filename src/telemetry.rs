//! Broker connection management and the periodic volume / flow publish.
//!
//! The publisher never blocks: connecting, waiting for the broker and
//! retrying are all advanced from [`TelemetryPublisher::poll`] once per
//! supervisor cycle. Publishing is fire-and-forget, a failed write is counted
//! and logged and the next cycle carries on.

use crate::backoff::Backoff;
use crate::clock::{Deadline, Micros};
use crate::network_config::{BrokerSettings, MeterTopics, MAX_TOPIC_LEN};
use core::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TelemetryError {
    #[error("broker unreachable: {0}")]
    Unreachable(String),
    #[error("not connected to broker")]
    NotConnected,
    #[error("publish to '{0}' rejected")]
    Rejected(String),
    #[error("connect timed out")]
    Timeout,
    #[error("'{0}' does not fit the publish buffer")]
    Oversize(String),
}

/// Publish side of an MQTT style broker client.
pub trait Broker {
    /// Start a session. May return before the broker has acknowledged it;
    /// completion is observed through [`Broker::is_connected`].
    fn connect(&mut self, settings: &BrokerSettings, client_id: &str) -> Result<(), TelemetryError>;

    fn is_connected(&self) -> bool;

    /// Queue a message without waiting for delivery.
    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), TelemetryError>;

    fn disconnect(&mut self);
}

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub publish_interval: Duration,
    pub connect_timeout: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            publish_interval: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
        }
    }
}

const MAX_VALUE_LEN: usize = 24;

/// One formatted reading, built per publish cycle and dropped afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishRecord {
    pub topic: heapless::String<MAX_TOPIC_LEN>,
    pub value: heapless::String<MAX_VALUE_LEN>,
    pub timestamp: Micros,
}

impl PublishRecord {
    fn new(
        topic: &str,
        value: core::fmt::Arguments<'_>,
        timestamp: Micros,
    ) -> Result<Self, TelemetryError> {
        use core::fmt::Write;

        let mut t = heapless::String::new();
        t.push_str(topic)
            .map_err(|_| TelemetryError::Oversize(topic.to_string()))?;
        let mut v = heapless::String::new();
        v.write_fmt(value)
            .map_err(|_| TelemetryError::Oversize(format!("{} value", topic)))?;
        Ok(Self {
            topic: t,
            value: v,
            timestamp,
        })
    }

    /// Cumulative volume in kiloliters, three decimals.
    pub fn kliters(
        topic: &str,
        cumulative_liters: f64,
        timestamp: Micros,
    ) -> Result<Self, TelemetryError> {
        Self::new(topic, format_args!("{:.3}", cumulative_liters / 1000.0), timestamp)
    }

    /// Flow rate in liters per minute, two decimals.
    pub fn flow_rate(
        topic: &str,
        liters_per_minute: f64,
        timestamp: Micros,
    ) -> Result<Self, TelemetryError> {
        Self::new(topic, format_args!("{:.2}", liters_per_minute), timestamp)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Telemetry gated off, or no broker configured
    Idle,
    Connecting { deadline: Deadline },
    Connected,
    Waiting { retry_at: Deadline },
}

impl LinkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkState::Idle => "idle",
            LinkState::Connecting { .. } => "connecting",
            LinkState::Connected => "connected",
            LinkState::Waiting { .. } => "waiting",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    NotDue,
    /// Due, but the broker link is down; retried as soon as it is back
    Offline,
    Published { accepted: u32, failed: u32 },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TelemetryStats {
    pub connects: u32,
    pub connect_failures: u32,
    pub published: u32,
    pub publish_failures: u32,
    pub last_error: Option<TelemetryError>,
    pub last_topic: Option<heapless::String<MAX_TOPIC_LEN>>,
}

pub struct TelemetryPublisher<B: Broker> {
    broker: B,
    config: TelemetryConfig,
    settings: Option<BrokerSettings>,
    client_id: heapless::String<32>,
    topics: MeterTopics,
    state: LinkState,
    backoff: Backoff,
    last_delay: Option<Duration>,
    last_publish: Option<Micros>,
    stats: TelemetryStats,
    warned_unconfigured: bool,
}

impl<B: Broker> TelemetryPublisher<B> {
    pub fn new(broker: B, config: TelemetryConfig, client_id: &str, topics: MeterTopics) -> Self {
        let backoff = Backoff::new(config.backoff_initial, config.backoff_max);
        let mut id = heapless::String::new();
        let _ = id.push_str(client_id);
        Self {
            broker,
            config,
            settings: None,
            client_id: id,
            topics,
            state: LinkState::Idle,
            backoff,
            last_delay: None,
            last_publish: None,
            stats: TelemetryStats::default(),
            warned_unconfigured: false,
        }
    }

    pub fn with_settings(mut self, settings: Option<BrokerSettings>) -> Self {
        self.settings = settings;
        self
    }

    /// Replace the broker endpoint. An open session is dropped and reopened
    /// on the next poll.
    pub fn set_settings(&mut self, settings: Option<BrokerSettings>) {
        if self.settings == settings {
            return;
        }
        if let Some(s) = &settings {
            log::info!("MQTT: Broker set to {}", s.url());
        }
        self.settings = settings;
        self.go_idle();
        self.warned_unconfigured = false;
    }

    pub fn settings(&self) -> Option<&BrokerSettings> {
        self.settings.as_ref()
    }

    /// Advance the connection. `enabled` is false whenever the network is not
    /// in CLIENT with a live association; the link is then dropped.
    pub fn poll(&mut self, now: Micros, enabled: bool) -> LinkState {
        if !enabled {
            self.go_idle();
            return self.state;
        }

        let Some(settings) = self.settings.clone() else {
            if !self.warned_unconfigured {
                log::warn!("MQTT: No broker configured, telemetry idle");
                self.warned_unconfigured = true;
            }
            return self.state;
        };

        match self.state {
            LinkState::Idle => self.connect(now, &settings),
            LinkState::Waiting { retry_at } if retry_at.expired(now) => self.connect(now, &settings),
            LinkState::Waiting { .. } => {}
            LinkState::Connecting { deadline } => {
                if self.broker.is_connected() {
                    self.connected();
                } else if deadline.expired(now) {
                    self.broker.disconnect();
                    self.failed(now, TelemetryError::Timeout);
                }
            }
            LinkState::Connected => {
                if !self.broker.is_connected() {
                    log::warn!("🔌 MQTT: Connection lost");
                    self.broker.disconnect();
                    self.failed(now, TelemetryError::NotConnected);
                }
            }
        }
        self.state
    }

    fn connect(&mut self, now: Micros, settings: &BrokerSettings) {
        if self.stats.connect_failures == 0 {
            log::info!("🔄 MQTT: Connecting to {} as {}", settings.url(), self.client_id);
        }
        match self.broker.connect(settings, &self.client_id) {
            Ok(()) if self.broker.is_connected() => self.connected(),
            Ok(()) => {
                self.state = LinkState::Connecting {
                    deadline: Deadline::after(now, self.config.connect_timeout),
                };
            }
            Err(e) => self.failed(now, e),
        }
    }

    fn connected(&mut self) {
        log::info!("✅ MQTT: Connected");
        self.state = LinkState::Connected;
        self.stats.connects += 1;
        self.backoff.reset();
        self.last_delay = None;
    }

    fn failed(&mut self, now: Micros, error: TelemetryError) {
        let delay = self.backoff.next_delay();
        self.stats.connect_failures += 1;
        if self.backoff.failures() <= 3 || self.last_delay != Some(delay) {
            log::warn!(
                "❌ MQTT: {} (#{}, retry in {}s)",
                error,
                self.backoff.failures(),
                delay.as_secs()
            );
        }
        self.stats.last_error = Some(error);
        self.last_delay = Some(delay);
        self.state = LinkState::Waiting {
            retry_at: Deadline::after(now, delay),
        };
    }

    fn go_idle(&mut self) {
        if self.state != LinkState::Idle {
            log::info!("🔌 MQTT: Disconnecting");
            self.broker.disconnect();
            self.state = LinkState::Idle;
        }
        self.backoff.reset();
        self.last_delay = None;
    }

    pub fn publish_due(&self, now: Micros) -> bool {
        self.last_publish
            .map_or(true, |last| now.since(last) >= self.config.publish_interval)
    }

    /// Publish both readings if the interval has elapsed.
    pub fn publish_cycle(
        &mut self,
        now: Micros,
        cumulative_liters: f64,
        liters_per_minute: f64,
    ) -> PublishOutcome {
        if !self.publish_due(now) {
            return PublishOutcome::NotDue;
        }
        if self.state != LinkState::Connected {
            return PublishOutcome::Offline;
        }

        let records = [
            PublishRecord::kliters(&self.topics.kliters, cumulative_liters, now),
            PublishRecord::flow_rate(&self.topics.flow_rate, liters_per_minute, now),
        ];
        let mut accepted = 0;
        let mut failed = 0;
        for record in records {
            match record {
                Ok(record) if self.publish(now, &record) => accepted += 1,
                Ok(_) => failed += 1,
                Err(e) => {
                    log::warn!("❌ MQTT: Reading not published: {}", e);
                    self.stats.publish_failures += 1;
                    self.stats.last_error = Some(e);
                    failed += 1;
                }
            }
        }
        self.last_publish = Some(now);
        PublishOutcome::Published { accepted, failed }
    }

    /// Fire-and-forget publish of one record. Returns whether the broker
    /// accepted it for delivery.
    pub fn publish(&mut self, now: Micros, record: &PublishRecord) -> bool {
        match self.broker.publish(&record.topic, record.value.as_bytes()) {
            Ok(()) => {
                log::info!("📤 MQTT: {} = {}", record.topic, record.value);
                self.stats.published += 1;
                self.stats.last_topic = Some(record.topic.clone());
                true
            }
            Err(TelemetryError::NotConnected) => {
                self.stats.publish_failures += 1;
                if self.state == LinkState::Connected {
                    log::warn!("🔌 MQTT: Connection lost while publishing");
                    self.broker.disconnect();
                    self.failed(now, TelemetryError::NotConnected);
                }
                false
            }
            Err(e) => {
                log::warn!("❌ MQTT: Publish failed: {}", e);
                self.stats.publish_failures += 1;
                self.stats.last_error = Some(e);
                false
            }
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == LinkState::Connected
    }

    pub fn stats(&self) -> &TelemetryStats {
        &self.stats
    }

    pub fn next_retry_in(&self, now: Micros) -> Option<Duration> {
        match self.state {
            LinkState::Waiting { retry_at } => Some(retry_at.remaining(now)),
            _ => None,
        }
    }

    pub fn broker(&self) -> &B {
        &self.broker
    }

    pub fn broker_mut(&mut self) -> &mut B {
        &mut self.broker
    }

    /// Close the session for shutdown.
    pub fn shutdown(&mut self) {
        self.go_idle();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meter::{FlowAccumulator, MeterConfig, PulseEvent};
    use crate::testing::ScriptedBroker;

    fn publisher(broker: ScriptedBroker) -> TelemetryPublisher<ScriptedBroker> {
        TelemetryPublisher::new(broker, TelemetryConfig::default(), "watermeter", MeterTopics::default())
            .with_settings(Some(BrokerSettings::new("10.0.0.5", 1883).unwrap()))
    }

    fn at(secs: u64) -> Micros {
        Micros(0).wrapping_add(Duration::from_secs(secs))
    }

    #[test]
    fn formats_readings() {
        let k = PublishRecord::kliters("k", 12_345.0, Micros(0)).unwrap();
        assert_eq!(k.value.as_str(), "12.345");
        let f = PublishRecord::flow_rate("f", 10.0, Micros(0)).unwrap();
        assert_eq!(f.value.as_str(), "10.00");
        let f = PublishRecord::flow_rate("f", 2.0 / 3.0, Micros(0)).unwrap();
        assert_eq!(f.value.as_str(), "0.67");
    }

    #[test]
    fn oversize_reading_is_refused_not_truncated() {
        assert_eq!(
            PublishRecord::kliters("k", 1e30, Micros(0)),
            Err(TelemetryError::Oversize("k value".to_string()))
        );
        let topic = "t".repeat(MAX_TOPIC_LEN + 1);
        assert!(matches!(
            PublishRecord::flow_rate(&topic, 1.0, Micros(0)),
            Err(TelemetryError::Oversize(_))
        ));
    }

    #[test]
    fn publishes_both_topics_when_connected() {
        let broker = ScriptedBroker::reachable();
        let log = broker.log.clone();
        let mut p = publisher(broker);

        assert_eq!(p.poll(at(0), true), LinkState::Connected);
        assert_eq!(
            p.publish_cycle(at(0), 1500.0, 10.0),
            PublishOutcome::Published {
                accepted: 2,
                failed: 0
            }
        );
        assert_eq!(p.publish_cycle(at(30), 1500.0, 10.0), PublishOutcome::NotDue);

        let published = &log.borrow().published;
        assert_eq!(
            published,
            &vec![
                ("sensor/water-meter/kLiters".to_string(), "1.500".to_string()),
                ("sensor/water-meter/FlowRate".to_string(), "10.00".to_string()),
            ]
        );
    }

    #[test]
    fn gated_off_never_connects() {
        let broker = ScriptedBroker::reachable();
        let log = broker.log.clone();
        let mut p = publisher(broker);

        assert_eq!(p.poll(at(0), false), LinkState::Idle);
        assert_eq!(p.publish_cycle(at(0), 1.0, 1.0), PublishOutcome::Offline);
        assert_eq!(log.borrow().connects, 0);
    }

    #[test]
    fn losing_the_gate_drops_the_session() {
        let broker = ScriptedBroker::reachable();
        let log = broker.log.clone();
        let mut p = publisher(broker);
        p.poll(at(0), true);

        p.poll(at(1), false);
        assert_eq!(p.state(), LinkState::Idle);
        assert_eq!(log.borrow().disconnects, 1);
    }

    #[test]
    fn unreachable_broker_backs_off_while_volume_keeps_counting() {
        let broker = ScriptedBroker::default();
        let reachable = broker.reachable.clone();
        let log = broker.log.clone();
        let mut p = publisher(broker);

        let mut acc = FlowAccumulator::new(MeterConfig::default(), at(0));

        let mut t = 0;
        let mut delays = Vec::new();
        for _ in 0..5 {
            p.poll(at(t), true);
            delays.push(p.next_retry_in(at(t)).unwrap().as_secs());
            for i in 0..3 {
                acc.record_pulse(PulseEvent {
                    timestamp: at(t).wrapping_add(Duration::from_millis(100 * (i + 1))),
                });
            }
            assert_eq!(p.publish_cycle(at(t), acc.cumulative_liters(), 0.0), PublishOutcome::Offline);
            t += delays.last().copied().unwrap_or(1);
        }

        assert_eq!(delays, vec![1, 2, 4, 8, 16]);
        assert_eq!(log.borrow().connects, 5);
        assert_eq!(acc.cumulative_liters(), 15.0);
        assert_eq!(p.stats().connect_failures, 5);

        // cap holds
        for _ in 0..4 {
            p.poll(at(t), true);
            t += p.next_retry_in(at(t)).unwrap().as_secs();
        }
        p.poll(at(t), true);
        assert_eq!(p.next_retry_in(at(t)), Some(Duration::from_secs(60)));

        reachable.set(true);
        t += 60;
        assert_eq!(p.poll(at(t), true), LinkState::Connected);
        assert!(matches!(
            p.publish_cycle(at(t), acc.cumulative_liters(), 0.0),
            PublishOutcome::Published { accepted: 2, .. }
        ));
        assert_eq!(log.borrow().published[0].1, "0.015");
    }

    #[test]
    fn dropped_connection_is_retried_with_backoff() {
        let broker = ScriptedBroker::reachable();
        let reachable = broker.reachable.clone();
        let mut p = publisher(broker);
        p.poll(at(0), true);

        reachable.set(false);
        assert!(matches!(p.poll(at(1), true), LinkState::Waiting { .. }));
        assert_eq!(p.next_retry_in(at(1)), Some(Duration::from_secs(1)));

        reachable.set(true);
        assert_eq!(p.poll(at(2), true), LinkState::Connected);
        assert_eq!(p.stats().connects, 2);
    }

    #[test]
    fn rejected_publish_is_counted_not_fatal() {
        let broker = ScriptedBroker::reachable();
        broker.reject_publish.set(true);
        let mut p = publisher(broker);
        p.poll(at(0), true);

        assert_eq!(
            p.publish_cycle(at(0), 1.0, 1.0),
            PublishOutcome::Published {
                accepted: 0,
                failed: 2
            }
        );
        assert!(p.is_connected());
        assert_eq!(p.stats().publish_failures, 2);
    }

    #[test]
    fn no_broker_stays_idle() {
        let broker = ScriptedBroker::reachable();
        let log = broker.log.clone();
        let mut p = TelemetryPublisher::new(broker, TelemetryConfig::default(), "watermeter", MeterTopics::default());

        assert_eq!(p.poll(at(0), true), LinkState::Idle);
        assert_eq!(log.borrow().connects, 0);

        p.set_settings(Some(BrokerSettings::new("broker", 1883).unwrap()));
        assert_eq!(p.poll(at(1), true), LinkState::Connected);
    }
}
