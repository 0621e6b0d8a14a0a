use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, Publish, QoS};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::config::MqttConfig;
use crate::bridge::debouncer::parse_speed_command;
use crate::bridge::BridgeSignal;

const REQUEST_CAPACITY: usize = 100;
const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_MAX_SHIFT: u32 = 5;

#[derive(Clone, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connected,
    Reconnecting,
}

#[derive(Clone, Debug, Default)]
pub struct MQTTStatus {
    pub connection_state: ConnectionState,
    pub messages_received: usize,
    pub reconnect_attempts: u32,
    pub last_activity: Option<chrono::DateTime<chrono::Local>>,
}

impl MQTTStatus {
    pub fn record_message(&mut self, at: chrono::DateTime<chrono::Local>) {
        self.messages_received += 1;
        self.last_activity = Some(at);
    }

    /// One-line summary logged when the connection drops
    pub fn summary(&self) -> String {
        match self.last_activity {
            Some(at) => format!(
                "{} messages received, last at {}",
                self.messages_received,
                at.format("%Y-%m-%d %H:%M:%S")
            ),
            None => "no messages received".to_string(),
        }
    }
}

/// Outbound side of the broker as seen by the dispatcher.
///
/// Publishing is fire-and-forget: the call returns immediately and the
/// outcome is only logged.
pub trait MessageSink: Send {
    fn publish(&self, topic: String, payload: Vec<u8>);
}

#[derive(Clone)]
pub struct MqttPublisher {
    client: AsyncClient,
}

impl MessageSink for MqttPublisher {
    fn publish(&self, topic: String, payload: Vec<u8>) {
        debug!("Publishing to {}: {}", topic, String::from_utf8_lossy(&payload));
        let client = self.client.clone();
        tokio::spawn(async move {
            if let Err(e) = client.publish(&topic, QoS::AtMostOnce, false, payload).await {
                error!("Publishing to {} failed: {}", topic, e);
            }
        });
    }
}

/// Creates the client and spawns the connection task.
///
/// The connection task keeps polling the event loop for the lifetime of
/// the process, resubscribes after every ConnAck and forwards speed
/// commands and platform status messages into `signals`.
pub fn spawn(config: MqttConfig, signals: mpsc::Sender<BridgeSignal>) -> MqttPublisher {
    let mut options = MqttOptions::new(config.client_id.clone(), config.host.clone(), config.port);
    options.set_keep_alive(config.keep_alive);
    if let Some(user) = &config.user {
        options.set_credentials(user.clone(), config.password.clone().unwrap_or_default());
    }

    info!(
        "Connecting to MQTT {}:{} client id {} user {}",
        config.host,
        config.port,
        config.client_id,
        config.user.as_deref().unwrap_or("-")
    );

    let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
    let task_client = client.clone();
    tokio::spawn(async move {
        run_connection(config, task_client, eventloop, signals).await;
    });

    MqttPublisher { client }
}

async fn run_connection(
    config: MqttConfig,
    client: AsyncClient,
    mut eventloop: EventLoop,
    signals: mpsc::Sender<BridgeSignal>,
) {
    let mut status = MQTTStatus::default();

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("MQTT connected to {}:{}", config.host, config.port);
                status.connection_state = ConnectionState::Connected;
                status.reconnect_attempts = 0;
                subscribe(&client, &config);
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                status.record_message(chrono::Local::now());
                if let Some(signal) = route_incoming(&config, &publish) {
                    if signals.send(signal).await.is_err() {
                        warn!("Dispatcher gone, stopping MQTT connection task");
                        return;
                    }
                }
            }
            Ok(_) => {}
            Err(e) => {
                if status.connection_state == ConnectionState::Connected {
                    error!(
                        "MQTT connection to {}:{} lost: {} ({})",
                        config.host,
                        config.port,
                        e,
                        status.summary()
                    );
                } else {
                    warn!("MQTT connection to {}:{} failed: {}", config.host, config.port, e);
                }
                status.connection_state = ConnectionState::Reconnecting;

                let delay = reconnect_delay(status.reconnect_attempts);
                status.reconnect_attempts = status.reconnect_attempts.saturating_add(1);
                info!(
                    "MQTT reconnecting to {}:{} in {:?} (attempt {})",
                    config.host, config.port, delay, status.reconnect_attempts
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

// rumqttc does not restore subscriptions after a reconnect
fn subscribe(client: &AsyncClient, config: &MqttConfig) {
    debug!("Subscribing to {:?}", config.subbed_topics);
    for topic in &config.subbed_topics {
        if let Err(e) = client.try_subscribe(topic, QoS::AtMostOnce) {
            error!("Failed to subscribe to {}: {}", topic, e);
        }
    }
}

/// Maps an inbound publish onto a dispatcher signal
pub fn route_incoming(config: &MqttConfig, publish: &Publish) -> Option<BridgeSignal> {
    let body = String::from_utf8_lossy(&publish.payload);

    if publish.topic == config.command_topic {
        info!("Received speed change {} on {}", body, publish.topic);
        match parse_speed_command(&body) {
            Ok(speed) => Some(BridgeSignal::SpeedCommand(speed)),
            Err(e) => {
                error!("Dropping speed command: {}", e);
                None
            }
        }
    } else if publish.topic == config.status_topic {
        Some(BridgeSignal::PlatformStatus(body.trim().to_string()))
    } else {
        debug!("Ignoring message on unexpected topic {}", publish.topic);
        None
    }
}

fn reconnect_delay(attempt: u32) -> Duration {
    RECONNECT_BASE * (1u32 << attempt.min(RECONNECT_MAX_SHIFT))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> MqttConfig {
        MqttConfig {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "vallox".to_string(),
            user: None,
            password: None,
            keep_alive: super::super::config::KEEP_ALIVE,
            subbed_topics: vec![
                "homeassistant/status".to_string(),
                "vallox/fan/set".to_string(),
            ],
            command_topic: "vallox/fan/set".to_string(),
            status_topic: "homeassistant/status".to_string(),
        }
    }

    fn publish(topic: &str, payload: &str) -> Publish {
        Publish::new(topic, QoS::AtMostOnce, payload.as_bytes().to_vec())
    }

    #[test]
    fn status_summary_tracks_inbound_messages() {
        let mut status = MQTTStatus::default();
        assert_eq!(status.summary(), "no messages received");

        let at = chrono::Local::now();
        status.record_message(at);
        status.record_message(at);

        assert_eq!(status.messages_received, 2);
        assert_eq!(status.last_activity, Some(at));
        assert!(status.summary().starts_with("2 messages received, last at "));
    }

    #[test]
    fn routes_speed_command() {
        let signal = route_incoming(&config(), &publish("vallox/fan/set", "4"));
        assert_eq!(signal, Some(BridgeSignal::SpeedCommand(4)));
    }

    #[test]
    fn drops_malformed_speed_command() {
        assert_eq!(route_incoming(&config(), &publish("vallox/fan/set", "fast")), None);
        assert_eq!(route_incoming(&config(), &publish("vallox/fan/set", "12")), None);
    }

    #[test]
    fn routes_platform_status() {
        let signal = route_incoming(&config(), &publish("homeassistant/status", "online\n"));
        assert_eq!(signal, Some(BridgeSignal::PlatformStatus("online".to_string())));
    }

    #[test]
    fn ignores_other_topics() {
        assert_eq!(route_incoming(&config(), &publish("vallox/fan/speed", "3")), None);
    }

    #[test]
    fn reconnect_backoff_is_capped() {
        assert_eq!(reconnect_delay(0), Duration::from_secs(1));
        assert_eq!(reconnect_delay(3), Duration::from_secs(8));
        assert_eq!(reconnect_delay(40), Duration::from_secs(32));
    }
}
