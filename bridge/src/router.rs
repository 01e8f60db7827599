use crate::alerts::AlertEvaluator;
use crate::db::Sink;
use crate::errors::{Error, Result};
use crate::hub::{BroadcastReport, FanoutHub};
use crate::metrics::{
    ALERTS_RAISED_TOTAL, DROPPED_MESSAGES_TOTAL, ROUTE_LATENCY_SECONDS, STATUS_EVENTS_TOTAL,
    STORAGE_FAILURES_TOTAL, TELEMETRY_ACCEPTED_TOTAL,
};
use crate::model::{DeviceStatus, InboundMessage};
use crate::validate::{parse_reading, parse_status};
use bytes::Bytes;
use chrono::Utc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const DATA_TOPIC_FILTER: &str = "sensors/+/data";
pub const STATUS_TOPIC_FILTER: &str = "sensors/+/status";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicKind<'a> {
    Telemetry(&'a str),
    Status(&'a str),
}

/// Matches `sensors/<device_id>/data` and `sensors/<device_id>/status`
pub fn classify(topic: &str) -> Option<TopicKind<'_>> {
    let mut segments = topic.split('/');
    let parts = (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    );

    match parts {
        (Some("sensors"), Some(id), Some("data"), None) if is_device_id(id) => {
            Some(TopicKind::Telemetry(id))
        }
        (Some("sensors"), Some(id), Some("status"), None) if is_device_id(id) => {
            Some(TopicKind::Status(id))
        }
        _ => None,
    }
}

fn is_device_id(segment: &str) -> bool {
    !segment.is_empty() && !segment.contains(['+', '#'])
}

#[derive(Debug, Clone, PartialEq)]
pub enum Routed {
    Telemetry {
        device_id: String,
        stored: bool,
        alerts: usize,
        broadcast: BroadcastReport,
    },
    Status {
        device_id: String,
        status: DeviceStatus,
        stored: bool,
    },
}

/// Sends each accepted message to storage and, for telemetry, to every consumer.
///
/// Owns the sink: all writes happen from whichever task drives `route`, one
/// message at a time, so rows land in delivery order.
pub struct MessageRouter<S> {
    sink: S,
    hub: FanoutHub,
    alerts: Option<AlertEvaluator>,
}

impl<S: Sink> MessageRouter<S> {
    pub fn new(sink: S, hub: FanoutHub) -> Self {
        Self {
            sink,
            hub,
            alerts: None,
        }
    }

    pub fn with_alerts(mut self, evaluator: AlertEvaluator) -> Self {
        self.alerts = Some(evaluator);
        self
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Routes one message. Drop conditions are logged here and returned so
    /// the caller can see why; they never affect the next message.
    pub async fn route(&mut self, topic: &str, payload: Bytes) -> Result<Routed> {
        let result = match classify(topic) {
            Some(TopicKind::Telemetry(device_id)) => {
                self.route_telemetry(device_id, payload).await
            }
            Some(TopicKind::Status(device_id)) => self.route_status(device_id, &payload).await,
            None => Err(Error::UnknownTopic(topic.to_string())),
        };

        if let Err(e) = &result {
            if e.is_drop() {
                DROPPED_MESSAGES_TOTAL.inc();
                warn!("Dropping message on {}: {}", topic, e);
            }
        }
        result
    }

    async fn route_telemetry(&mut self, device_id: &str, payload: Bytes) -> Result<Routed> {
        let reading = parse_reading(device_id, &payload)?;
        TELEMETRY_ACCEPTED_TOTAL.inc();

        let stored = match self.sink.record_reading(&reading).await {
            Ok(()) => true,
            Err(e) => {
                STORAGE_FAILURES_TOTAL.inc();
                error!("Failed to store reading from {}: {}", device_id, e);
                false
            }
        };

        let mut raised = 0;
        if let Some(evaluator) = self.alerts.as_mut() {
            for alert in evaluator.evaluate(&reading) {
                raised += 1;
                ALERTS_RAISED_TOTAL.inc();
                warn!(
                    "{} alert for {}: {}",
                    alert.severity.as_str(),
                    alert.device_id,
                    alert.message
                );
                if let Err(e) = self.sink.record_alert(&alert).await {
                    STORAGE_FAILURES_TOTAL.inc();
                    error!("Failed to store alert for {}: {}", device_id, e);
                }
            }
        }

        // Consumers get the bytes exactly as the device sent them.
        let broadcast = self.hub.broadcast(payload);
        debug!(
            "Processed data from {} (stored={}, consumers={})",
            device_id, stored, broadcast.delivered
        );

        Ok(Routed::Telemetry {
            device_id: reading.device_id,
            stored,
            alerts: raised,
            broadcast,
        })
    }

    async fn route_status(&mut self, device_id: &str, payload: &[u8]) -> Result<Routed> {
        let event = parse_status(device_id, payload, Utc::now())?;
        STATUS_EVENTS_TOTAL.inc();

        let stored = match self.sink.record_status(&event).await {
            Ok(()) => true,
            Err(e) => {
                STORAGE_FAILURES_TOTAL.inc();
                error!("Failed to store status of {}: {}", device_id, e);
                false
            }
        };

        info!("Device {} is {}", device_id, event.status);
        Ok(Routed::Status {
            device_id: event.device_id,
            status: event.status,
            stored,
        })
    }
}

/// Drains the handoff channel until every sender is gone, routing messages
/// strictly in arrival order.
pub async fn run_router<S: Sink>(mut rx: mpsc::Receiver<InboundMessage>, mut router: MessageRouter<S>) {
    info!("Router started");

    while let Some(message) = rx.recv().await {
        let start = Instant::now();
        // Failures are already logged and counted inside route.
        let _ = router.route(&message.topic, message.payload).await;
        ROUTE_LATENCY_SECONDS.observe(start.elapsed().as_secs_f64());
    }

    info!("Handoff channel closed, router stopped");
}

/// Waits up to `limit` for the router to finish what is queued. A router
/// still running at the deadline is aborted so nothing writes after storage
/// closes. Returns whether it finished on its own.
pub async fn drain_router(handle: JoinHandle<()>, limit: Duration) -> bool {
    let abort = handle.abort_handle();
    match tokio::time::timeout(limit, handle).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            error!("Router task failed: {}", e);
            true
        }
        Err(_) => {
            warn!("Router did not drain within {:?}, aborting it", limit);
            abort.abort();
            false
        }
    }
}
