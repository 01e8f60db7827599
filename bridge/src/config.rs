use crate::alerts::{Band, Thresholds};
use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Runtime settings, read from the environment
#[derive(Debug, Clone)]
pub struct Config {
    pub mqtt_broker: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_client_id: String,
    pub listen_addr: String,
    pub database_url: String,
    /// Capacity of the delivery thread -> router channel
    pub channel_capacity: usize,
    /// Per-consumer queue depth; a consumer this far behind misses new payloads
    pub consumer_queue_capacity: usize,
    pub send_timeout: Duration,
    pub alerts_enabled: bool,
    pub alert_cooldown: Duration,
    pub thresholds: Thresholds,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let band = |name: &str, defaults: Band| {
            let limit = |suffix: &str, default: f64| {
                let key = format!("{}_{}", name, suffix);
                parse_or(key.as_str(), lookup(key.as_str()), default)
            };
            Band::new(
                limit("MIN", defaults.min),
                limit("MAX", defaults.max),
                limit("CRITICAL_MIN", defaults.critical_min),
                limit("CRITICAL_MAX", defaults.critical_max),
            )
        };

        let defaults = Thresholds::default();

        Self {
            mqtt_broker: get("MQTT_BROKER", "localhost"),
            mqtt_port: parse_or("MQTT_PORT", lookup("MQTT_PORT"), 1883),
            mqtt_username: lookup("MQTT_USERNAME").filter(|s| !s.is_empty()),
            mqtt_password: lookup("MQTT_PASSWORD").filter(|s| !s.is_empty()),
            mqtt_client_id: lookup("MQTT_CLIENT_ID")
                .unwrap_or_else(|| format!("bridge-{}", uuid::Uuid::new_v4())),
            listen_addr: get("LISTEN_ADDR", "0.0.0.0:8765"),
            database_url: get("DATABASE_URL", "sqlite://iot_sensor_data.db"),
            channel_capacity: parse_or("CHANNEL_CAPACITY", lookup("CHANNEL_CAPACITY"), 10_000usize)
                .max(1),
            consumer_queue_capacity: parse_or(
                "CONSUMER_QUEUE_CAPACITY",
                lookup("CONSUMER_QUEUE_CAPACITY"),
                256usize,
            )
            .max(1),
            send_timeout: Duration::from_millis(parse_or(
                "SEND_TIMEOUT_MS",
                lookup("SEND_TIMEOUT_MS"),
                5000u64,
            )),
            alerts_enabled: parse_or("ALERTS_ENABLED", lookup("ALERTS_ENABLED"), true),
            alert_cooldown: Duration::from_secs(parse_or(
                "ALERT_COOLDOWN_SECS",
                lookup("ALERT_COOLDOWN_SECS"),
                60u64,
            )),
            thresholds: Thresholds {
                temperature: band("TEMPERATURE", defaults.temperature),
                humidity: band("HUMIDITY", defaults.humidity),
                pressure: band("PRESSURE", defaults.pressure),
            },
        }
    }

    /// Database location with any credentials stripped, for logging
    pub fn database_display(&self) -> &str {
        self.database_url
            .rsplit('@')
            .next()
            .unwrap_or(&self.database_url)
    }
}

fn parse_or<T: FromStr>(key: &str, value: Option<String>, default: T) -> T {
    match value {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("Ignoring unparseable {}={:?}, using default", key, raw);
            default
        }),
        None => default,
    }
}
