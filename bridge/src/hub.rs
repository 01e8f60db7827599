use crate::errors::Error;
use crate::metrics::{
    BROADCASTS_TOTAL, CONSUMER_EVICTIONS_TOTAL, CONSUMER_MESSAGES_DROPPED_TOTAL,
};
use crate::registry::{CloseReason, ConnectionId, ConnectionRegistry};
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryFailure {
    /// Consumer has not drained its queue yet; it misses this payload
    QueueFull,
    /// Writer side of the connection is already gone
    Disconnected,
}

impl DeliveryFailure {
    /// Only a gone writer costs the connection its registration.
    fn close_reason(&self) -> Option<CloseReason> {
        match self {
            DeliveryFailure::QueueFull => None,
            DeliveryFailure::Disconnected => Some(CloseReason::SendFailed),
        }
    }
}

impl fmt::Display for DeliveryFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryFailure::QueueFull => f.write_str("queue full"),
            DeliveryFailure::Disconnected => f.write_str("disconnected"),
        }
    }
}

/// Outcome of one broadcast, per connection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    /// Still registered, but missed this payload because their queue was full
    pub skipped: Vec<ConnectionId>,
    /// Removed from the registry by this broadcast
    pub evicted: Vec<ConnectionId>,
}

/// Publish-to-all over the connection registry.
///
/// `broadcast` never awaits: each connection gets a `try_send` onto its own
/// bounded queue, so it can be called from any thread and costs the caller
/// one enqueue per consumer. Socket I/O happens in each connection's writer,
/// which closes the connection itself when a send exceeds its deadline.
#[derive(Clone)]
pub struct FanoutHub {
    registry: Arc<ConnectionRegistry>,
}

impl FanoutHub {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn broadcast(&self, payload: Bytes) -> BroadcastReport {
        let (delivered, failed) = self.registry.deliver_each(
            |_, sender| match sender.try_send(payload.clone()) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(_)) => Err(DeliveryFailure::QueueFull),
                Err(TrySendError::Closed(_)) => Err(DeliveryFailure::Disconnected),
            },
            DeliveryFailure::close_reason,
        );

        BROADCASTS_TOTAL.inc();

        let mut report = BroadcastReport {
            delivered,
            ..Default::default()
        };
        for (id, failure) in failed {
            match failure {
                DeliveryFailure::QueueFull => {
                    CONSUMER_MESSAGES_DROPPED_TOTAL.inc();
                    debug!(connection_id = id, "Consumer queue full, message dropped");
                    report.skipped.push(id);
                }
                DeliveryFailure::Disconnected => {
                    CONSUMER_EVICTIONS_TOTAL.inc();
                    let err = Error::ConsumerDelivery {
                        id,
                        reason: failure.to_string(),
                    };
                    warn!("{}", err);
                    report.evicted.push(id);
                }
            }
        }

        debug!(
            "Broadcast {} bytes (delivered={}, skipped={}, evicted={})",
            payload.len(),
            report.delivered,
            report.skipped.len(),
            report.evicted.len()
        );

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ConnectionState;
    use tokio::sync::mpsc::error::TryRecvError;

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn test_hub_is_shareable_across_threads() {
        assert_send_sync::<FanoutHub>();
    }

    #[test]
    fn test_broadcast_without_consumers() {
        let hub = FanoutHub::new(ConnectionRegistry::new(4));
        let report = hub.broadcast(Bytes::from_static(b"{}"));

        assert_eq!(report, BroadcastReport::default());
    }

    #[test]
    fn test_failed_consumer_is_isolated_and_removed_once() {
        let registry = ConnectionRegistry::new(4);
        let hub = FanoutHub::new(Arc::clone(&registry));

        let mut consumers: Vec<_> = (0..5)
            .map(|i| registry.register(format!("peer-{}", i)).unwrap())
            .collect();

        // Consumer 2's writer is gone but its entry is still registered.
        let (broken, broken_rx) = consumers.remove(2);
        drop(broken_rx);

        let payload = Bytes::from_static(br#"{"temperature":22.5}"#);
        let report = hub.broadcast(payload.clone());

        assert_eq!(report.delivered, 4);
        assert_eq!(report.evicted, vec![broken.id()]);
        assert!(report.skipped.is_empty());
        assert_eq!(broken.state(), ConnectionState::Closed);
        assert_eq!(registry.len(), 4);
        assert!(!broken.close(CloseReason::SendFailed));

        for (_, rx) in consumers.iter_mut() {
            assert_eq!(rx.try_recv().unwrap(), payload);
        }

        // The evicted consumer is not offered the next one.
        let report = hub.broadcast(payload);
        assert_eq!(report.delivered, 4);
        assert!(report.evicted.is_empty());
    }

    #[test]
    fn test_slow_consumer_misses_messages_but_stays_registered() {
        let registry = ConnectionRegistry::new(2);
        let hub = FanoutHub::new(Arc::clone(&registry));

        let (slow, mut slow_rx) = registry.register("slow").unwrap();
        let (_fast, mut fast_rx) = registry.register("fast").unwrap();

        hub.broadcast(Bytes::from_static(b"m1"));
        hub.broadcast(Bytes::from_static(b"m2"));
        let report = hub.broadcast(Bytes::from_static(b"m3"));

        // Both queues hold two; the third payload is dropped for both, nobody is removed.
        assert_eq!(report.delivered, 0);
        assert_eq!(report.skipped.len(), 2);
        assert!(report.skipped.contains(&slow.id()));
        assert!(report.evicted.is_empty());
        assert_eq!(slow.state(), ConnectionState::Open);
        assert_eq!(registry.len(), 2);

        // After catching up, later broadcasts arrive again.
        assert_eq!(slow_rx.try_recv().unwrap(), Bytes::from_static(b"m1"));
        assert_eq!(slow_rx.try_recv().unwrap(), Bytes::from_static(b"m2"));
        assert_eq!(slow_rx.try_recv(), Err(TryRecvError::Empty));
        while fast_rx.try_recv().is_ok() {}

        let report = hub.broadcast(Bytes::from_static(b"m4"));
        assert_eq!(report.delivered, 2);
        assert!(report.skipped.is_empty());
        assert_eq!(slow_rx.try_recv().unwrap(), Bytes::from_static(b"m4"));
        assert_eq!(fast_rx.try_recv().unwrap(), Bytes::from_static(b"m4"));
    }

    #[test]
    fn test_per_connection_fifo() {
        let registry = ConnectionRegistry::new(8);
        let hub = FanoutHub::new(Arc::clone(&registry));
        let (_conn, mut rx) = registry.register("peer").unwrap();

        for m in ["m1", "m2", "m3"] {
            hub.broadcast(Bytes::from(m));
        }

        let received: Vec<Bytes> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(
            received,
            vec![Bytes::from("m1"), Bytes::from("m2"), Bytes::from("m3")]
        );
    }

    #[test]
    fn test_closed_connection_receives_nothing() {
        let registry = ConnectionRegistry::new(8);
        let hub = FanoutHub::new(Arc::clone(&registry));
        let (conn, mut rx) = registry.register("peer").unwrap();

        conn.close(CloseReason::PeerClosed);
        let report = hub.broadcast(Bytes::from_static(b"late"));

        assert_eq!(report.delivered, 0);
        assert_eq!(rx.try_recv(), Err(TryRecvError::Disconnected));
    }

    #[test]
    fn test_broadcast_from_foreign_thread() {
        let registry = ConnectionRegistry::new(8);
        let hub = FanoutHub::new(Arc::clone(&registry));
        let (_conn, mut rx) = registry.register("peer").unwrap();

        let remote = hub.clone();
        std::thread::spawn(move || remote.broadcast(Bytes::from_static(b"x")))
            .join()
            .unwrap();

        assert_eq!(rx.try_recv().unwrap(), Bytes::from_static(b"x"));
    }
}
