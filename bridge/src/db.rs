use crate::errors::Result;
use crate::model::{Alert, DeviceStatusEvent, TelemetryReading};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// Durable record of everything the router accepts.
///
/// Each call writes exactly one row and is attempted once; callers log
/// failures and carry on.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn record_reading(&self, reading: &TelemetryReading) -> Result<()>;

    async fn record_status(&self, event: &DeviceStatusEvent) -> Result<()>;

    async fn record_alert(&self, alert: &Alert) -> Result<()>;
}

pub async fn make_pool(database_url: &str) -> Result<SqlitePool> {
    info!("Opening database...");
    let in_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");

    let mut options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
    let mut pool_options = SqlitePoolOptions::new().acquire_timeout(Duration::from_secs(10));

    if in_memory {
        // Every connection to an in-memory database sees its own copy, so keep exactly one alive.
        pool_options = pool_options
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None);
    } else {
        options = options.journal_mode(SqliteJournalMode::Wal);
        pool_options = pool_options.max_connections(5);
    }

    let pool = pool_options.connect_with(options).await?;
    info!("Database opened");

    info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Migrations completed");

    Ok(pool)
}

#[derive(Debug, Clone)]
pub struct SqlSink {
    pool: SqlitePool,
}

impl SqlSink {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Sink for SqlSink {
    async fn record_reading(&self, reading: &TelemetryReading) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sensor_data (device_id, timestamp, temperature, humidity, pressure, firmware_version)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&reading.device_id)
        .bind(reading.observed_at)
        .bind(reading.temperature)
        .bind(reading.humidity)
        .bind(reading.pressure)
        .bind(&reading.firmware_version)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn record_status(&self, event: &DeviceStatusEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO device_status (device_id, last_seen, status, ip_address, firmware_version, updated_at)
            VALUES (?, ?, ?, ?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT (device_id) DO UPDATE SET
                last_seen = excluded.last_seen,
                status = excluded.status,
                ip_address = COALESCE(excluded.ip_address, device_status.ip_address),
                firmware_version = COALESCE(excluded.firmware_version, device_status.firmware_version),
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(&event.device_id)
        .bind(event.observed_at)
        .bind(event.status.as_str())
        .bind(&event.ip_address)
        .bind(&event.firmware_version)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn record_alert(&self, alert: &Alert) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO alerts (device_id, alert_type, message, severity, timestamp)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&alert.device_id)
        .bind(&alert.alert_type)
        .bind(&alert.message)
        .bind(alert.severity.as_str())
        .bind(alert.timestamp)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::Error;
    use crate::model::{AlertSeverity, DeviceStatus, DeviceStatusRow, StoredAlert};
    use chrono::{TimeZone, Utc};

    async fn memory_sink() -> (SqlSink, SqlitePool) {
        let pool = make_pool("sqlite::memory:").await.unwrap();
        (SqlSink::new(pool.clone()), pool)
    }

    fn reading(device_id: &str, temperature: f64) -> TelemetryReading {
        TelemetryReading {
            device_id: device_id.to_string(),
            observed_at: Utc.timestamp_millis_opt(1_700_000_000_000).unwrap(),
            temperature,
            humidity: 55.0,
            pressure: 1008.0,
            firmware_version: Some("v3.0.0-ESP32".to_string()),
        }
    }

    fn status(status: DeviceStatus, ip: Option<&str>) -> DeviceStatusEvent {
        DeviceStatusEvent {
            device_id: "dev-01".to_string(),
            status,
            observed_at: Utc::now(),
            ip_address: ip.map(str::to_string),
            firmware_version: None,
        }
    }

    #[tokio::test]
    async fn test_record_reading_roundtrip() {
        let (sink, pool) = memory_sink().await;

        sink.record_reading(&reading("dev-01", 22.5)).await.unwrap();

        let rows: Vec<TelemetryReading> = sqlx::query_as(
            "SELECT device_id, timestamp AS observed_at, temperature, humidity, pressure, firmware_version FROM sensor_data",
        )
        .fetch_all(&pool)
        .await
        .unwrap();

        assert_eq!(rows, vec![reading("dev-01", 22.5)]);
    }

    #[tokio::test]
    async fn test_each_reading_is_its_own_row() {
        let (sink, pool) = memory_sink().await;

        sink.record_reading(&reading("dev-01", 22.5)).await.unwrap();
        sink.record_reading(&reading("dev-01", 22.5)).await.unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sensor_data")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn test_status_keeps_latest_per_device() {
        let (sink, pool) = memory_sink().await;

        sink.record_status(&status(DeviceStatus::Online, Some("10.0.0.7")))
            .await
            .unwrap();
        sink.record_status(&status(DeviceStatus::Offline, None))
            .await
            .unwrap();

        let rows: Vec<DeviceStatusRow> = sqlx::query_as(
            "SELECT device_id, last_seen, status, ip_address, firmware_version FROM device_status",
        )
        .fetch_all(&pool)
        .await
        .unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, "offline");
        assert_eq!(rows[0].ip_address.as_deref(), Some("10.0.0.7"));
    }

    #[tokio::test]
    async fn test_record_alert_unacknowledged() {
        let (sink, pool) = memory_sink().await;

        let alert = Alert {
            device_id: "dev-01".to_string(),
            alert_type: "temperature_high".to_string(),
            message: "temperature outside normal range: 29°C".to_string(),
            severity: AlertSeverity::Warning,
            timestamp: Utc::now(),
        };
        sink.record_alert(&alert).await.unwrap();

        let stored: StoredAlert = sqlx::query_as(
            "SELECT id, device_id, alert_type, message, severity, timestamp, acknowledged FROM alerts",
        )
        .fetch_one(&pool)
        .await
        .unwrap();

        assert_eq!(stored.severity, "warning");
        assert!(!stored.acknowledged);
    }

    #[tokio::test]
    async fn test_closed_pool_reports_storage_error() {
        let (sink, pool) = memory_sink().await;
        pool.close().await;

        let result = sink.record_reading(&reading("dev-01", 22.5)).await;
        assert!(matches!(result, Err(Error::Storage(_))));
    }
}
