use crate::metrics;
use crate::registry::ConnectionRegistry;
use crate::rest;
use crate::ws::{self, WsState};
use axum::{routing::get, Router};
use sqlx::SqlitePool;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

/// WebSocket feed, REST API and metrics on a single listener
pub fn build_app(
    pool: SqlitePool,
    registry: Arc<ConnectionRegistry>,
    send_timeout: Duration,
) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .merge(rest::create_router(pool, Arc::clone(&registry)))
        .merge(ws::create_router(WsState {
            registry,
            send_timeout,
        }))
}

pub async fn serve<F>(listener: TcpListener, app: Router, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}

async fn metrics_handler() -> String {
    metrics::gather_metrics()
}
