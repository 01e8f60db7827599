use crate::model::{DeviceStatusRow, ReadingsResponse, StoredAlert, TelemetryReading};
use crate::registry::ConnectionRegistry;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::error;

#[derive(Clone)]
struct AppState {
    pool: SqlitePool,
    registry: Arc<ConnectionRegistry>,
}

#[derive(Debug, Deserialize)]
pub struct ReadingsQuery {
    device_id: Option<String>,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    limit: Option<usize>,
    offset: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct AlertsQuery {
    device_id: Option<String>,
    acknowledged: Option<bool>,
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    connections: usize,
}

pub fn create_router(pool: SqlitePool, registry: Arc<ConnectionRegistry>) -> Router {
    let state = AppState { pool, registry };

    Router::new()
        .route("/health", get(health))
        .route("/api/v1/readings", get(get_readings))
        .route("/api/v1/devices", get(get_devices))
        .route("/api/v1/alerts", get(get_alerts))
        .route("/api/v1/alerts/:id/ack", post(acknowledge_alert))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        connections: state.registry.len(),
    })
}

async fn get_readings(
    State(state): State<AppState>,
    Query(params): Query<ReadingsQuery>,
) -> Result<Json<ReadingsResponse>, AppError> {
    let limit = params.limit.unwrap_or(100).min(1000);
    let offset = params.offset.unwrap_or(0);

    // Build query with filters
    let mut conditions = Vec::new();
    if params.device_id.is_some() {
        conditions.push("device_id = ?");
    }
    if params.start.is_some() {
        conditions.push("timestamp >= ?");
    }
    if params.end.is_some() {
        conditions.push("timestamp <= ?");
    }

    let where_clause = if conditions.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", conditions.join(" AND "))
    };

    let query = format!(
        "SELECT device_id, timestamp AS observed_at, temperature, humidity, pressure, firmware_version
         FROM sensor_data
         {}
         ORDER BY timestamp DESC, id DESC
         LIMIT {} OFFSET {}",
        where_clause, limit, offset
    );

    // Bind parameters in the same order as the conditions above
    let mut query_builder = sqlx::query_as::<_, TelemetryReading>(&query);
    if let Some(device_id) = &params.device_id {
        query_builder = query_builder.bind(device_id);
    }
    if let Some(start) = &params.start {
        query_builder = query_builder.bind(start);
    }
    if let Some(end) = &params.end {
        query_builder = query_builder.bind(end);
    }

    let readings = query_builder.fetch_all(&state.pool).await.map_err(|e| {
        error!("Database error: {}", e);
        AppError(anyhow::anyhow!("Database query failed: {}", e))
    })?;

    // Same filters, no paging
    let count_query = format!("SELECT COUNT(*) FROM sensor_data {}", where_clause);
    let mut count_builder = sqlx::query_scalar::<_, i64>(&count_query);
    if let Some(device_id) = &params.device_id {
        count_builder = count_builder.bind(device_id);
    }
    if let Some(start) = &params.start {
        count_builder = count_builder.bind(start);
    }
    if let Some(end) = &params.end {
        count_builder = count_builder.bind(end);
    }
    let total = count_builder.fetch_one(&state.pool).await?;

    Ok(Json(ReadingsResponse {
        data: readings,
        total: total.max(0) as usize,
        limit,
        offset,
    }))
}

async fn get_devices(State(state): State<AppState>) -> Result<Json<Vec<DeviceStatusRow>>, AppError> {
    let devices = sqlx::query_as::<_, DeviceStatusRow>(
        "SELECT device_id, last_seen, status, ip_address, firmware_version
         FROM device_status
         ORDER BY device_id",
    )
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(devices))
}

async fn get_alerts(
    State(state): State<AppState>,
    Query(params): Query<AlertsQuery>,
) -> Result<Json<Vec<StoredAlert>>, AppError> {
    let limit = params.limit.unwrap_or(50).min(1000);

    let mut conditions = Vec::new();
    if params.device_id.is_some() {
        conditions.push("device_id = ?");
    }
    if params.acknowledged.is_some() {
        conditions.push("acknowledged = ?");
    }

    let where_clause = if conditions.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", conditions.join(" AND "))
    };

    let query = format!(
        "SELECT id, device_id, alert_type, message, severity, timestamp, acknowledged
         FROM alerts
         {}
         ORDER BY timestamp DESC, id DESC
         LIMIT {}",
        where_clause, limit
    );

    let mut query_builder = sqlx::query_as::<_, StoredAlert>(&query);
    if let Some(device_id) = &params.device_id {
        query_builder = query_builder.bind(device_id);
    }
    if let Some(acknowledged) = params.acknowledged {
        query_builder = query_builder.bind(acknowledged);
    }

    let alerts = query_builder.fetch_all(&state.pool).await?;
    Ok(Json(alerts))
}

async fn acknowledge_alert(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, AppError> {
    let result = sqlx::query("UPDATE alerts SET acknowledged = TRUE WHERE id = ?")
        .bind(id)
        .execute(&state.pool)
        .await?;

    if result.rows_affected() == 0 {
        Ok(StatusCode::NOT_FOUND)
    } else {
        Ok(StatusCode::NO_CONTENT)
    }
}

struct AppError(anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        error!("API error: {}", self.0);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Internal server error: {}", self.0),
        )
            .into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{make_pool, SqlSink, Sink};
    use crate::model::{Alert, AlertSeverity};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use chrono::TimeZone;
    use tower::ServiceExt;

    async fn app_with_data() -> Router {
        let pool = make_pool("sqlite::memory:").await.unwrap();
        let sink = SqlSink::new(pool.clone());

        for (i, device) in ["dev-01", "dev-02", "dev-01"].iter().enumerate() {
            sink.record_reading(&TelemetryReading {
                device_id: device.to_string(),
                observed_at: Utc.timestamp_millis_opt(1_700_000_000_000 + i as i64 * 1000).unwrap(),
                temperature: 20.0 + i as f64,
                humidity: 50.0,
                pressure: 1000.0,
                firmware_version: None,
            })
            .await
            .unwrap();
        }

        sink.record_alert(&Alert {
            device_id: "dev-01".to_string(),
            alert_type: "temperature_high".to_string(),
            message: "temperature outside normal range: 29°C".to_string(),
            severity: AlertSeverity::Warning,
            timestamp: Utc::now(),
        })
        .await
        .unwrap();

        create_router(pool, ConnectionRegistry::new(4))
    }

    async fn get_json(app: Router, uri: &str) -> serde_json::Value {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_readings_filtered_by_device() {
        let app = app_with_data().await;
        let json = get_json(app, "/api/v1/readings?device_id=dev-01").await;

        assert_eq!(json["total"], 2);
        // Newest first
        assert_eq!(json["data"][0]["temperature"], 22.0);
        assert_eq!(json["data"][1]["temperature"], 20.0);
    }

    #[tokio::test]
    async fn test_readings_total_counts_beyond_the_page() {
        let app = app_with_data().await;
        let json = get_json(app, "/api/v1/readings?device_id=dev-01&limit=1").await;

        assert_eq!(json["total"], 2);
        assert_eq!(json["data"].as_array().unwrap().len(), 1);
        assert_eq!(json["data"][0]["temperature"], 22.0);
    }

    #[tokio::test]
    async fn test_readings_limit_is_capped() {
        let app = app_with_data().await;
        let json = get_json(app, "/api/v1/readings?limit=5000").await;

        assert_eq!(json["limit"], 1000);
        assert_eq!(json["total"], 3);
    }

    #[tokio::test]
    async fn test_acknowledge_alert() {
        let app = app_with_data().await;

        let alerts = get_json(app.clone(), "/api/v1/alerts?acknowledged=false").await;
        let id = alerts[0]["id"].as_i64().unwrap();

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/api/v1/alerts/{}/ack", id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let pending = get_json(app.clone(), "/api/v1/alerts?acknowledged=false").await;
        assert_eq!(pending.as_array().unwrap().len(), 0);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/alerts/9999/ack")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_health_reports_connections() {
        let app = app_with_data().await;
        let json = get_json(app, "/health").await;

        assert_eq!(json["status"], "ok");
        assert_eq!(json["connections"], 0);
    }
}
