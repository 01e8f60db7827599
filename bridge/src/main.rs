use bridge::alerts::AlertEvaluator;
use bridge::config::Config;
use bridge::db::{self, SqlSink};
use bridge::hub::FanoutHub;
use bridge::metrics;
use bridge::mqtt::{MqttAdapter, MqttSettings};
use bridge::registry::ConnectionRegistry;
use bridge::router::{self, MessageRouter};
use bridge::server;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const ROUTER_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);
const SERVER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

enum Exit {
    Router,
    Server,
    Signal,
}

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env();

    info!("Starting sensor bridge");
    info!("MQTT broker: {}:{}", config.mqtt_broker, config.mqtt_port);
    info!("Consumer listener: {}", config.listen_addr);
    info!("Database: {}", config.database_display());

    if let Err(e) = metrics::init_metrics() {
        warn!("Failed to register metrics: {}", e);
    }

    // Without storage there is nothing worth running.
    let pool = match db::make_pool(&config.database_url).await {
        Ok(pool) => pool,
        Err(e) => {
            error!("Failed to open storage: {}", e);
            std::process::exit(1);
        }
    };

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .unwrap_or_else(|e| {
            error!("Failed to bind to {}: {}", config.listen_addr, e);
            std::process::exit(1);
        });
    info!("Consumer listener bound on {}", config.listen_addr);

    let registry = ConnectionRegistry::new(config.consumer_queue_capacity);
    let hub = FanoutHub::new(Arc::clone(&registry));

    let mut message_router = MessageRouter::new(SqlSink::new(pool.clone()), hub);
    if config.alerts_enabled {
        let cooldown = chrono::Duration::from_std(config.alert_cooldown)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        message_router = message_router.with_alerts(AlertEvaluator::new(config.thresholds, cooldown));
    }

    // Bounded handoff from the MQTT delivery thread to the router task
    info!("Channel capacity: {}", config.channel_capacity);
    let (tx, rx) = mpsc::channel(config.channel_capacity);
    let mut router_handle = tokio::spawn(router::run_router(rx, message_router));

    let mqtt = match MqttAdapter::spawn(MqttSettings::from_config(&config), tx) {
        Ok(adapter) => adapter,
        Err(e) => {
            error!("Failed to start MQTT delivery thread: {}", e);
            std::process::exit(1);
        }
    };

    let app = server::build_app(pool.clone(), Arc::clone(&registry), config.send_timeout);
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let mut server_handle = tokio::spawn(server::serve(listener, app, async move {
        let _ = stop_rx.await;
    }));

    let exit = tokio::select! {
        _ = &mut router_handle => {
            error!("Router task terminated");
            Exit::Router
        }
        result = &mut server_handle => {
            match result {
                Ok(Err(e)) => error!("HTTP server error: {}", e),
                _ => error!("HTTP server terminated"),
            }
            Exit::Server
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            Exit::Signal
        }
    };

    info!("Shutting down");

    // Stop deliveries first; the router then drains whatever is already queued.
    mqtt.shutdown().await;
    if !matches!(exit, Exit::Router) {
        router::drain_router(router_handle, ROUTER_DRAIN_TIMEOUT).await;
    }

    let closed = registry.close_all();
    info!("Closed {} consumer connections", closed);

    let _ = stop_tx.send(());
    if !matches!(exit, Exit::Server) {
        if tokio::time::timeout(SERVER_STOP_TIMEOUT, server_handle)
            .await
            .is_err()
        {
            warn!("HTTP server did not stop within {:?}", SERVER_STOP_TIMEOUT);
        }
    }

    pool.close().await;
    info!("Shutdown complete");
}
