use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One MQTT publish as handed from the delivery thread to the router.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Environmental reading reported by a device on `sensors/<id>/data`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct TelemetryReading {
    pub device_id: String,
    pub observed_at: DateTime<Utc>,
    pub temperature: f64,
    pub humidity: f64,
    pub pressure: f64,
    pub firmware_version: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    Offline,
    Unknown,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Online => "online",
            DeviceStatus::Offline => "offline",
            DeviceStatus::Unknown => "unknown",
        }
    }

    /// Maps a reported status word; anything unrecognised is `Unknown`.
    pub fn from_word(word: &str) -> Self {
        match word.trim().to_ascii_lowercase().as_str() {
            "online" | "connected" => DeviceStatus::Online,
            "offline" | "disconnected" => DeviceStatus::Offline,
            _ => DeviceStatus::Unknown,
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceStatusEvent {
    pub device_id: String,
    pub status: DeviceStatus,
    pub observed_at: DateTime<Utc>,
    pub ip_address: Option<String>,
    pub firmware_version: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Warning => "warning",
            AlertSeverity::Critical => "critical",
        }
    }
}

/// Threshold breach raised for a single reading
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub device_id: String,
    pub alert_type: String,
    pub message: String,
    pub severity: AlertSeverity,
    pub timestamp: DateTime<Utc>,
}

/// Alert row as stored, including its acknowledgement flag
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct StoredAlert {
    pub id: i64,
    pub device_id: String,
    pub alert_type: String,
    pub message: String,
    pub severity: String,
    pub timestamp: DateTime<Utc>,
    pub acknowledged: bool,
}

/// Latest known status of a device
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct DeviceStatusRow {
    pub device_id: String,
    pub last_seen: DateTime<Utc>,
    pub status: String,
    pub ip_address: Option<String>,
    pub firmware_version: Option<String>,
}

/// REST API response wrapper
#[derive(Debug, Serialize)]
pub struct ReadingsResponse {
    pub data: Vec<TelemetryReading>,
    /// Rows matching the filters, before limit and offset
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
}
