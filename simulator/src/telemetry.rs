use chrono::Utc;
use rand::Rng;
use serde::Serialize;

pub const FIRMWARE: &str = "1.2.0";

/// Body published to `sensors/<id>/data`
#[derive(Debug, Clone, Serialize)]
pub struct Reading {
    pub temperature: f64,
    pub humidity: f64,
    pub pressure: f64,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    pub firmware: &'static str,
}

/// Body published to `sensors/<id>/status`
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub status: &'static str,
    pub ip: String,
    pub firmware: &'static str,
    pub timestamp: i64,
}

pub fn data_topic(device_id: &str) -> String {
    format!("sensors/{}/data", device_id)
}

pub fn status_topic(device_id: &str) -> String {
    format!("sensors/{}/status", device_id)
}

pub fn generate_reading(rng: &mut impl Rng) -> Reading {
    let temperature = if rng.gen_bool(0.05) {
        rng.gen_range(5.0..45.0) // 5% excursions, mostly alert-worthy
    } else {
        rng.gen_range(19.0..27.0)
    };

    let humidity = if rng.gen_bool(0.05) {
        rng.gen_range(10.0..99.0)
    } else {
        rng.gen_range(42.0..78.0)
    };

    let pressure = if rng.gen_bool(0.02) {
        rng.gen_range(970.0..1040.0)
    } else {
        rng.gen_range(996.0..1014.0)
    };

    Reading {
        temperature: round1(temperature),
        humidity: round1(humidity),
        pressure: round1(pressure),
        timestamp: Utc::now().timestamp_millis(),
        firmware: FIRMWARE,
    }
}

pub fn online_status(device_index: usize) -> StatusReport {
    StatusReport {
        status: "online",
        ip: format!("10.0.{}.{}", device_index / 250, device_index % 250 + 2),
        firmware: FIRMWARE,
        timestamp: Utc::now().timestamp_millis(),
    }
}

/// Payloads the bridge must drop: broken JSON or a reading missing a field.
pub fn generate_malformed(rng: &mut impl Rng) -> String {
    if rng.gen_bool(0.5) {
        r#"{"temperature": 21.0, "humidity""#.to_string()
    } else {
        format!(
            r#"{{"temperature":{:.1},"humidity":{:.1},"timestamp":{}}}"#,
            rng.gen_range(19.0..27.0),
            rng.gen_range(42.0..78.0),
            Utc::now().timestamp_millis()
        )
    }
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
