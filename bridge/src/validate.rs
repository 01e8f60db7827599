use crate::errors::{Error, Result};
use crate::model::{DeviceStatus, DeviceStatusEvent, TelemetryReading};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

/// Wire shape of a telemetry payload. Every field is optional here so that an absent
/// reading surfaces as `MissingField` rather than a generic parse failure.
#[derive(Debug, Deserialize)]
struct RawTelemetry {
    temperature: Option<f64>,
    humidity: Option<f64>,
    pressure: Option<f64>,
    timestamp: Option<f64>,
    firmware: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RawStatus {
    status: Option<String>,
    timestamp: Option<f64>,
    #[serde(alias = "ip_address")]
    ip: Option<String>,
    firmware: Option<Value>,
}

/// Parses a `sensors/<id>/data` payload into a reading
pub fn parse_reading(device_id: &str, payload: &[u8]) -> Result<TelemetryReading> {
    let raw: RawTelemetry = serde_json::from_slice(payload)
        .map_err(|e| Error::MalformedPayload(format!("JSON parse error: {}", e)))?;

    let temperature = raw.temperature.ok_or(Error::MissingField("temperature"))?;
    let humidity = raw.humidity.ok_or(Error::MissingField("humidity"))?;
    let pressure = raw.pressure.ok_or(Error::MissingField("pressure"))?;
    let millis = raw.timestamp.ok_or(Error::MissingField("timestamp"))?;

    Ok(TelemetryReading {
        device_id: device_id.to_string(),
        observed_at: from_epoch_millis(millis)?,
        temperature,
        humidity,
        pressure,
        firmware_version: firmware_text(raw.firmware),
    })
}

/// Parses a `sensors/<id>/status` payload.
///
/// Accepts a JSON object with a `status` key, or a bare status word such as the
/// `offline` a device registers as its last will. `received_at` stands in for
/// the observation time when the payload carries none.
pub fn parse_status(
    device_id: &str,
    payload: &[u8],
    received_at: DateTime<Utc>,
) -> Result<DeviceStatusEvent> {
    let raw = match serde_json::from_slice::<RawStatus>(payload) {
        Ok(raw) => raw,
        Err(e) => match bare_status_word(payload) {
            Some(word) => RawStatus {
                status: Some(word.to_string()),
                timestamp: None,
                ip: None,
                firmware: None,
            },
            None => {
                return Err(Error::MalformedPayload(format!("JSON parse error: {}", e)));
            }
        },
    };

    let status = raw.status.ok_or(Error::MissingField("status"))?;
    let observed_at = match raw.timestamp {
        Some(millis) => from_epoch_millis(millis)?,
        None => received_at,
    };

    Ok(DeviceStatusEvent {
        device_id: device_id.to_string(),
        status: DeviceStatus::from_word(&status),
        observed_at,
        ip_address: raw.ip,
        firmware_version: firmware_text(raw.firmware),
    })
}

/// Firmware is metadata; an odd shape must not cost the reading.
fn firmware_text(value: Option<Value>) -> Option<String> {
    match value? {
        Value::String(text) => Some(text),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn bare_status_word(payload: &[u8]) -> Option<&str> {
    let word = std::str::from_utf8(payload).ok()?.trim();
    match DeviceStatus::from_word(word) {
        DeviceStatus::Unknown => None,
        _ => Some(word),
    }
}

fn from_epoch_millis(millis: f64) -> Result<DateTime<Utc>> {
    if !millis.is_finite() {
        return Err(Error::MalformedPayload(format!(
            "Timestamp {} is not a finite number",
            millis
        )));
    }

    DateTime::from_timestamp_millis(millis as i64).ok_or_else(|| {
        Error::MalformedPayload(format!("Timestamp {} out of range", millis))
    })
}
