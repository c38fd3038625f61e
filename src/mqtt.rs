use crate::backoff::Backoff;
use crate::network_config::BrokerSettings;
use crate::telemetry::{Broker, TelemetryError};
use esp_idf_svc::mqtt::client::{EspMqttClient, EventPayload, MqttClientConfiguration, QoS};
use log::{info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Flags shared with the connection handler thread of one session.
#[derive(Clone, Default)]
struct SessionStatus {
    connected: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
}

struct Session {
    client: EspMqttClient<'static>,
    status: SessionStatus,
}

/// ESP-IDF MQTT client behind the [`Broker`] seam. Each `connect` opens a
/// fresh session; the previous one is torn down first.
#[derive(Default)]
pub struct EspBroker {
    session: Option<Session>,
}

impl EspBroker {
    pub fn new() -> Self {
        Self::default()
    }
}

fn spawn_connection_handler(
    mut connection: esp_idf_svc::mqtt::client::EspMqttConnection,
    status: SessionStatus,
) -> std::io::Result<()> {
    std::thread::Builder::new()
        .stack_size(8192)
        .name("mqtt_conn".to_string())
        .spawn(move || {
            info!("MQTT connection handler started");
            let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
            let mut last_error_log_time = Instant::now();

            loop {
                if status.shutdown.load(Ordering::Relaxed) {
                    break;
                }

                match connection.next() {
                    Ok(event) => match event.payload() {
                        EventPayload::Connected(session_present) => {
                            info!("✅ MQTT connected to broker (session_present: {})", session_present);
                            status.connected.store(true, Ordering::Relaxed);
                            backoff.reset();
                        }
                        EventPayload::Disconnected => {
                            info!("🔌 MQTT disconnected from broker");
                            status.connected.store(false, Ordering::Relaxed);
                        }
                        EventPayload::Error(e) => {
                            // Rate limit error logging to reduce spam
                            if last_error_log_time.elapsed().as_secs() >= 10 {
                                warn!("❌ MQTT error: {:?}", e);
                                last_error_log_time = Instant::now();
                            }
                        }
                        _ => {}
                    },
                    Err(e) => {
                        status.connected.store(false, Ordering::Relaxed);
                        if status.shutdown.load(Ordering::Relaxed) {
                            break;
                        }
                        let delay = backoff.next_delay();
                        if backoff.failures() <= 3 {
                            warn!("❌ MQTT connection error (#{}, retry in {}s): {:?}", backoff.failures(), delay.as_secs(), e);
                        }
                        std::thread::sleep(delay);
                    }
                }
            }
            info!("🔌 MQTT connection handler exiting");
        })?;
    Ok(())
}

impl Broker for EspBroker {
    fn connect(&mut self, settings: &BrokerSettings, client_id: &str) -> Result<(), TelemetryError> {
        self.disconnect();

        let url = settings.url();
        info!("Initializing MQTT client...");
        info!("  Broker: {}", url);
        info!("  Client ID: {}", client_id);

        let mqtt_config = MqttClientConfiguration {
            client_id: Some(client_id),
            username: settings.username.as_deref(),
            password: settings.password.as_deref(),
            keep_alive_interval: Some(Duration::from_secs(30)),
            reconnect_timeout: Some(Duration::from_secs(5)),
            ..Default::default()
        };

        let (client, connection) = EspMqttClient::new(&url, &mqtt_config)
            .map_err(|e| TelemetryError::Unreachable(e.to_string()))?;

        let status = SessionStatus::default();
        spawn_connection_handler(connection, status.clone())
            .map_err(|e| TelemetryError::Unreachable(e.to_string()))?;

        self.session = Some(Session { client, status });
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.status.connected.load(Ordering::Relaxed))
    }

    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), TelemetryError> {
        let session = self.session.as_mut().ok_or(TelemetryError::NotConnected)?;
        if !session.status.connected.load(Ordering::Relaxed) {
            return Err(TelemetryError::NotConnected);
        }

        session
            .client
            .enqueue(topic, QoS::AtLeastOnce, false, payload)
            .map_err(|e| {
                warn!("MQTT: enqueue to '{}' failed: {:?}", topic, e);
                TelemetryError::Rejected(topic.to_string())
            })?;
        Ok(())
    }

    fn disconnect(&mut self) {
        if let Some(session) = self.session.take() {
            info!("🔌 MQTT: Signaling connection handler to shutdown...");
            session.status.shutdown.store(true, Ordering::Relaxed);
            session.status.connected.store(false, Ordering::Relaxed);
            // Dropping the client wakes the handler out of `next()`
            drop(session.client);
        }
    }
}
