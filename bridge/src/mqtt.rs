use crate::config::Config;
use crate::errors::{Error, Result};
use crate::metrics::{CHANNEL_FULL_TOTAL, MESSAGES_TOTAL};
use crate::model::InboundMessage;
use crate::router::{DATA_TOPIC_FILTER, STATUS_TOPIC_FILTER};
use rumqttc::{Client, Connection, Event, MqttOptions, Packet, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, info, warn};

const REQUEST_CAPACITY: usize = 10_000;
const RECONNECT_PAUSE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub broker: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
}

impl MqttSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            broker: config.mqtt_broker.clone(),
            port: config.mqtt_port,
            client_id: config.mqtt_client_id.clone(),
            username: config.mqtt_username.clone(),
            password: config.mqtt_password.clone(),
            keep_alive: Duration::from_secs(30),
        }
    }

    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(&self.client_id, &self.broker, self.port);
        options.set_keep_alive(self.keep_alive);
        options.set_clean_session(true);
        if let (Some(username), Some(password)) = (&self.username, &self.password) {
            options.set_credentials(username, password);
        }
        options
    }
}

/// Owns the MQTT delivery thread.
///
/// rumqttc's blocking connection is iterated on one dedicated OS thread, so
/// publishes arrive serially and in broker order. Each one is handed to the
/// router through the bounded channel and nothing else happens on this thread.
pub struct MqttAdapter {
    client: Client,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl MqttAdapter {
    pub fn spawn(settings: MqttSettings, tx: mpsc::Sender<InboundMessage>) -> Result<Self> {
        info!(
            "Connecting to MQTT broker at {}:{}",
            settings.broker, settings.port
        );

        let (client, connection) = Client::new(settings.options(), REQUEST_CAPACITY);
        let stop = Arc::new(AtomicBool::new(false));

        let thread = thread::Builder::new().name("mqtt-delivery".to_string()).spawn({
            let client = client.clone();
            let stop = Arc::clone(&stop);
            move || run_delivery(client, connection, tx, stop)
        })?;

        Ok(Self {
            client,
            stop,
            thread: Some(thread),
        })
    }

    /// Stops taking deliveries and waits for the thread to finish the handoff
    /// it is in. The router channel closes once the thread is gone.
    pub async fn shutdown(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Err(e) = self.client.try_disconnect() {
            debug!("MQTT disconnect request not queued: {}", e);
        }

        if let Some(thread) = self.thread.take() {
            match tokio::task::spawn_blocking(move || thread.join()).await {
                Ok(Ok(())) => info!("MQTT delivery thread joined"),
                Ok(Err(_)) => error!("MQTT delivery thread panicked"),
                Err(e) => error!("Failed to join MQTT delivery thread: {}", e),
            }
        }
    }
}

fn run_delivery(
    client: Client,
    mut connection: Connection,
    tx: mpsc::Sender<InboundMessage>,
    stop: Arc<AtomicBool>,
) {
    for notification in connection.iter() {
        if stop.load(Ordering::SeqCst) {
            break;
        }

        match notification {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("Connected to MQTT broker");
                if let Err(e) = subscribe(&client) {
                    error!("Failed to subscribe: {}", e);
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                MESSAGES_TOTAL.inc();
                debug!(
                    "Received message on topic {}, size: {} bytes",
                    publish.topic,
                    publish.payload.len()
                );

                let message = InboundMessage {
                    topic: publish.topic,
                    payload: publish.payload,
                };
                if let Err(e) = handoff(&tx, message) {
                    error!("Router is gone, stopping MQTT delivery: {}", e);
                    break;
                }
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("Broker closed the MQTT session");
            }
            Ok(_) => {}
            Err(e) => {
                warn!("{}", Error::TransportDisconnected(e));
                // The next iteration reconnects.
                thread::sleep(RECONNECT_PAUSE);
                if stop.load(Ordering::SeqCst) {
                    break;
                }
            }
        }
    }

    info!("MQTT delivery thread stopped");
}

fn subscribe(client: &Client) -> Result<()> {
    for filter in [DATA_TOPIC_FILTER, STATUS_TOPIC_FILTER] {
        client.try_subscribe(filter, QoS::AtLeastOnce)?;
        info!("Subscribed to {} with QoS 1", filter);
    }
    Ok(())
}

/// Hands one message from the delivery thread to the router.
///
/// Never drops: a full channel is counted as a backpressure event and the
/// thread then waits for room, which keeps per-device order intact. Must be
/// called from outside the async runtime.
pub fn handoff(tx: &mpsc::Sender<InboundMessage>, message: InboundMessage) -> Result<()> {
    match tx.try_send(message) {
        Ok(()) => Ok(()),
        Err(TrySendError::Full(message)) => {
            CHANNEL_FULL_TOTAL.inc();
            debug!("Handoff channel full, waiting for the router");
            tx.blocking_send(message).map_err(|_| Error::ChannelSend)
        }
        Err(TrySendError::Closed(_)) => Err(Error::ChannelSend),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn message(n: u32) -> InboundMessage {
        InboundMessage::new("sensors/dev-01/data", format!("m{}", n))
    }

    #[test]
    fn test_handoff_in_order_through_full_channel() {
        let (tx, mut rx) = mpsc::channel(1);

        let producer = thread::spawn(move || {
            for n in 0..5 {
                handoff(&tx, message(n)).unwrap();
            }
        });

        let received = tokio_test::block_on(async {
            let mut received = Vec::new();
            while let Some(message) = rx.recv().await {
                received.push(message.payload);
            }
            received
        });
        producer.join().unwrap();

        let expected: Vec<Bytes> = (0..5).map(|n| Bytes::from(format!("m{}", n))).collect();
        assert_eq!(received, expected);
    }

    #[test]
    fn test_handoff_to_closed_router() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        assert!(matches!(handoff(&tx, message(0)), Err(Error::ChannelSend)));
    }

    #[test]
    fn test_settings_from_config() {
        let config = Config::from_lookup(|key| match key {
            "MQTT_BROKER" => Some("broker.local".to_string()),
            "MQTT_CLIENT_ID" => Some("bridge-test".to_string()),
            _ => None,
        });
        let settings = MqttSettings::from_config(&config);
        let options = settings.options();

        assert_eq!(
            options.broker_address(),
            ("broker.local".to_string(), 1883)
        );
        assert_eq!(options.client_id(), "bridge-test");
        assert_eq!(options.keep_alive(), Duration::from_secs(30));
    }
}
