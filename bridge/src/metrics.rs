use lazy_static::lazy_static;
use prometheus::{Counter, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder};
use tracing::error;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "bridge_messages_total",
        "Total messages received from MQTT"
    ))
    .expect("valid metric opts");
    pub static ref TELEMETRY_ACCEPTED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "bridge_telemetry_accepted_total",
        "Telemetry payloads that passed validation"
    ))
    .expect("valid metric opts");
    pub static ref STATUS_EVENTS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "bridge_status_events_total",
        "Device status events accepted"
    ))
    .expect("valid metric opts");
    pub static ref DROPPED_MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "bridge_dropped_messages_total",
        "Messages dropped for unknown topic, malformed or incomplete payload"
    ))
    .expect("valid metric opts");
    pub static ref STORAGE_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "bridge_storage_failures_total",
        "Total failed database writes"
    ))
    .expect("valid metric opts");
    pub static ref BROADCASTS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "bridge_broadcasts_total",
        "Payloads fanned out to consumers"
    ))
    .expect("valid metric opts");
    pub static ref CONSUMER_EVICTIONS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "bridge_consumer_evictions_total",
        "Consumers removed after their connection went away"
    ))
    .expect("valid metric opts");
    pub static ref CONSUMER_MESSAGES_DROPPED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "bridge_consumer_messages_dropped_total",
        "Payloads a consumer missed because its queue was full"
    ))
    .expect("valid metric opts");
    pub static ref ACTIVE_CONNECTIONS: Gauge = Gauge::with_opts(Opts::new(
        "bridge_active_connections",
        "Currently open consumer connections"
    ))
    .expect("valid metric opts");
    pub static ref CHANNEL_FULL_TOTAL: Counter = Counter::with_opts(Opts::new(
        "bridge_channel_full_total",
        "Total number of times the handoff channel was full (backpressure events)"
    ))
    .expect("valid metric opts");
    pub static ref ALERTS_RAISED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "bridge_alerts_raised_total",
        "Threshold alerts raised"
    ))
    .expect("valid metric opts");
    pub static ref ROUTE_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "bridge_route_latency_seconds",
            "Time taken to persist and broadcast one message"
        )
        .buckets(vec![
            0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0
        ])
    )
    .expect("valid metric opts");
}

pub fn init_metrics() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(MESSAGES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(TELEMETRY_ACCEPTED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(STATUS_EVENTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DROPPED_MESSAGES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(STORAGE_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(BROADCASTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(CONSUMER_EVICTIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(CONSUMER_MESSAGES_DROPPED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(ACTIVE_CONNECTIONS.clone()))?;
    REGISTRY.register(Box::new(CHANNEL_FULL_TOTAL.clone()))?;
    REGISTRY.register(Box::new(ALERTS_RAISED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(ROUTE_LATENCY_SECONDS.clone()))?;
    Ok(())
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
