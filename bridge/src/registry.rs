//! Live set of dashboard consumer connections.
//!
//! A connection is `Open` exactly while its entry is in the map. Removal is the
//! single transition to `Closed` and happens at most once per id no matter how
//! many parties (peer close, failed send, shutdown) race to perform it.

use crate::errors::{Error, Result};
use crate::metrics::ACTIVE_CONNECTIONS;
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{info, warn};

pub type ConnectionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not registered yet. Ids are issued at registration, so this is what
    /// any id the registry has not handed out reports.
    Connecting,
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    PeerClosed,
    SendFailed,
    SendTimeout,
    Shutdown,
    Released,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            CloseReason::PeerClosed => "peer closed",
            CloseReason::SendFailed => "send failed",
            CloseReason::SendTimeout => "send timed out",
            CloseReason::Shutdown => "shutdown",
            CloseReason::Released => "handle released",
        };
        f.write_str(text)
    }
}

pub(crate) struct Entry {
    remote_addr: String,
    sender: mpsc::Sender<Bytes>,
}

pub struct ConnectionRegistry {
    connections: Mutex<HashMap<ConnectionId, Entry>>,
    next_id: AtomicU64,
    accepting: AtomicBool,
    queue_capacity: usize,
}

impl ConnectionRegistry {
    pub fn new(queue_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            connections: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            accepting: AtomicBool::new(true),
            queue_capacity: queue_capacity.max(1),
        })
    }

    /// Registers a new consumer and returns its handle plus the receiving end
    /// of its delivery queue. Fails once `close_all` has run.
    pub fn register(
        self: &Arc<Self>,
        remote_addr: impl Into<String>,
    ) -> Result<(ConsumerConnection, mpsc::Receiver<Bytes>)> {
        let remote_addr = remote_addr.into();
        let (tx, rx) = mpsc::channel(self.queue_capacity);

        let mut connections = self.lock();
        // Checked under the lock so a registration cannot slip in behind close_all.
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(Error::RegistryClosed);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        connections.insert(
            id,
            Entry {
                remote_addr: remote_addr.clone(),
                sender: tx,
            },
        );
        let active = connections.len();
        drop(connections);

        ACTIVE_CONNECTIONS.inc();
        info!(connection_id = id, remote = %remote_addr, active, "Consumer connected");

        let handle = ConsumerConnection {
            id,
            remote_addr,
            registry: Arc::clone(self),
        };
        Ok((handle, rx))
    }

    /// Moves a connection to `Closed`. Returns true only for the call that
    /// actually removed it.
    pub fn remove(&self, id: ConnectionId, reason: CloseReason) -> bool {
        let removed = self.lock().remove(&id);
        match removed {
            Some(entry) => {
                self.on_removed(id, &entry, reason);
                true
            }
            None => false,
        }
    }

    /// Closes every open connection and stops accepting new ones.
    pub fn close_all(&self) -> usize {
        let drained: Vec<(ConnectionId, Entry)> = {
            let mut connections = self.lock();
            self.accepting.store(false, Ordering::SeqCst);
            connections.drain().collect()
        };

        for (id, entry) in &drained {
            self.on_removed(*id, entry, CloseReason::Shutdown);
        }
        drained.len()
    }

    /// `Open` while registered, `Closed` once removed. An id not issued yet
    /// reports `Connecting`: its socket may be mid-upgrade but the registry
    /// has no record of it.
    pub fn state(&self, id: ConnectionId) -> ConnectionState {
        if self.lock().contains_key(&id) {
            ConnectionState::Open
        } else if id >= self.next_id.load(Ordering::SeqCst) {
            ConnectionState::Connecting
        } else {
            ConnectionState::Closed
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Offers something to every open connection while holding the lock.
    /// Failures for which `close_reason` names a reason are removed before the
    /// lock is released, so the set cannot change mid-iteration and an evicted
    /// connection is never offered anything again. Other failures leave the
    /// connection registered.
    pub(crate) fn deliver_each<F, E, R>(
        &self,
        mut attempt: F,
        close_reason: R,
    ) -> (usize, Vec<(ConnectionId, E)>)
    where
        F: FnMut(ConnectionId, &mpsc::Sender<Bytes>) -> std::result::Result<(), E>,
        R: Fn(&E) -> Option<CloseReason>,
    {
        let mut delivered = 0;
        let mut failed = Vec::new();
        let mut evicted = Vec::new();

        {
            let mut connections = self.lock();
            for (id, entry) in connections.iter() {
                match attempt(*id, &entry.sender) {
                    Ok(()) => delivered += 1,
                    Err(e) => failed.push((*id, e)),
                }
            }
            for (id, e) in &failed {
                let Some(reason) = close_reason(e) else {
                    continue;
                };
                if let Some(entry) = connections.remove(id) {
                    evicted.push((*id, entry, reason));
                }
            }
        }

        for (id, entry, reason) in &evicted {
            self.on_removed(*id, entry, *reason);
        }

        (delivered, failed)
    }

    fn on_removed(&self, id: ConnectionId, entry: &Entry, reason: CloseReason) {
        ACTIVE_CONNECTIONS.dec();
        match reason {
            CloseReason::PeerClosed | CloseReason::Released | CloseReason::Shutdown => {
                info!(connection_id = id, remote = %entry.remote_addr, %reason, "Consumer disconnected");
            }
            _ => {
                warn!(connection_id = id, remote = %entry.remote_addr, %reason, "Consumer evicted");
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionId, Entry>> {
        // Entries stay consistent even if a holder panicked; keep serving.
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle owned by the task serving one consumer. Dropping it closes the
/// connection if nothing else has.
pub struct ConsumerConnection {
    id: ConnectionId,
    remote_addr: String,
    registry: Arc<ConnectionRegistry>,
}

impl ConsumerConnection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    pub fn state(&self) -> ConnectionState {
        self.registry.state(self.id)
    }

    pub fn close(&self, reason: CloseReason) -> bool {
        self.registry.remove(self.id, reason)
    }
}

impl Drop for ConsumerConnection {
    fn drop(&mut self) {
        self.registry.remove(self.id, CloseReason::Released);
    }
}

impl fmt::Debug for ConsumerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerConnection")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_register_assigns_unique_ids() {
        let registry = ConnectionRegistry::new(4);

        let (a, _rx_a) = registry.register("10.0.0.1:5000").unwrap();
        let (b, _rx_b) = registry.register("10.0.0.2:5000").unwrap();

        assert_ne!(a.id(), b.id());
        assert_eq!(registry.len(), 2);
        assert_eq!(a.state(), ConnectionState::Open);
        assert_eq!(a.remote_addr(), "10.0.0.1:5000");
    }

    #[test]
    fn test_remove_is_idempotent() {
        let registry = ConnectionRegistry::new(4);
        let (conn, _rx) = registry.register("peer").unwrap();

        assert!(conn.close(CloseReason::PeerClosed));
        assert!(!conn.close(CloseReason::SendFailed));
        assert!(!registry.remove(conn.id(), CloseReason::Shutdown));
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_drop_releases_entry() {
        let registry = ConnectionRegistry::new(4);
        let (conn, _rx) = registry.register("peer").unwrap();
        let id = conn.id();

        drop(conn);

        assert_eq!(registry.state(id), ConnectionState::Closed);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_removal_closes_delivery_queue() {
        let registry = ConnectionRegistry::new(4);
        let (conn, mut rx) = registry.register("peer").unwrap();

        conn.close(CloseReason::SendTimeout);

        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn test_state_follows_registration() {
        let registry = ConnectionRegistry::new(4);
        // Ids start at 1; nothing has been issued yet.
        assert_eq!(registry.state(1), ConnectionState::Connecting);

        let (conn, _rx) = registry.register("peer").unwrap();
        assert_eq!(conn.id(), 1);
        assert_eq!(registry.state(1), ConnectionState::Open);
        assert_eq!(registry.state(2), ConnectionState::Connecting);

        conn.close(CloseReason::PeerClosed);
        assert_eq!(registry.state(1), ConnectionState::Closed);
    }

    #[test]
    fn test_concurrent_double_close_removes_once() {
        let registry = ConnectionRegistry::new(4);
        let (conn, _rx) = registry.register("peer").unwrap();
        let id = conn.id();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || registry.remove(id, CloseReason::SendFailed))
            })
            .collect();

        let removed = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|removed| *removed)
            .count();

        assert_eq!(removed, 1);
        assert!(registry.is_empty());
        assert!(!conn.close(CloseReason::PeerClosed));
    }

    #[test]
    fn test_shutdown_drains_all_connections() {
        let registry = ConnectionRegistry::new(4);
        let conns: Vec<_> = (0..3)
            .map(|i| registry.register(format!("peer-{}", i)).unwrap())
            .collect();

        assert_eq!(registry.close_all(), 3);

        assert!(registry.is_empty());
        for (conn, _rx) in &conns {
            assert_eq!(conn.state(), ConnectionState::Closed);
        }
        assert!(!registry.is_accepting());
        assert!(matches!(
            registry.register("late"),
            Err(Error::RegistryClosed)
        ));
    }
}
