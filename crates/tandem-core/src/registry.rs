//! Connection liveness tracking for the signaling relay.
//!
//! Every registered connection carries a "pong seen" flag. A heartbeat tick
//! either finds the flag set, clears it and sends a fresh probe, or finds it
//! still clear and declares the connection dead.

use crate::connection::{ConnectionHandle, ConnectionId, Outbound};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Result of a heartbeat tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    /// A ping was sent; the peer has until the next tick to answer.
    Sent,
    /// The peer missed the last probe or the probe could not be sent.
    Dead,
    /// The connection is no longer registered.
    Gone,
}

#[derive(Debug)]
struct Entry {
    handle: ConnectionHandle,
    alive: AtomicBool,
}

/// Registry of live signaling connections.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<Entry>>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection. New connections start out alive.
    pub fn register(&self, handle: ConnectionHandle) {
        debug!(connection = %handle.id(), origin = %handle.origin(), "Connection registered");
        self.connections.insert(
            handle.id().clone(),
            Arc::new(Entry {
                handle,
                alive: AtomicBool::new(true),
            }),
        );
    }

    /// Record a heartbeat response from the peer.
    pub fn mark_alive(&self, id: &ConnectionId) {
        if let Some(entry) = self.connections.get(id) {
            entry.alive.store(true, Ordering::SeqCst);
            trace!(connection = %id, "Heartbeat response");
        }
    }

    /// Run one heartbeat tick for a connection.
    pub fn probe(&self, id: &ConnectionId) -> Probe {
        // Clone out of the map so no shard lock is held while sending.
        let Some(entry) = self.connections.get(id).map(|e| Arc::clone(e.value())) else {
            return Probe::Gone;
        };

        if !entry.alive.swap(false, Ordering::SeqCst) {
            debug!(connection = %id, "Heartbeat missed");
            return Probe::Dead;
        }

        match entry.handle.send(Outbound::Ping) {
            Ok(()) => Probe::Sent,
            Err(_) => {
                debug!(connection = %id, "Heartbeat probe failed");
                Probe::Dead
            }
        }
    }

    /// Remove a connection, returning its handle if it was registered.
    pub fn remove(&self, id: &ConnectionId) -> Option<ConnectionHandle> {
        self.connections.remove(id).map(|(_, entry)| entry.handle.clone())
    }

    /// Get a connection's handle.
    #[must_use]
    pub fn get(&self, id: &ConnectionId) -> Option<ConnectionHandle> {
        self.connections.get(id).map(|e| e.handle.clone())
    }

    /// Check if a connection is registered.
    #[must_use]
    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.contains_key(id)
    }

    /// Number of registered connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Check if no connections are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_cycle() {
        let registry = ConnectionRegistry::new();
        let (handle, mut rx) = ConnectionHandle::new("conn-1".into(), "/");
        registry.register(handle);

        let id = ConnectionId::from("conn-1");
        assert_eq!(registry.probe(&id), Probe::Sent);
        assert_eq!(rx.try_recv().unwrap(), Outbound::Ping);

        registry.mark_alive(&id);
        assert_eq!(registry.probe(&id), Probe::Sent);

        // No pong since the last probe
        assert_eq!(registry.probe(&id), Probe::Dead);
    }

    #[test]
    fn test_probe_broken_pipe() {
        let registry = ConnectionRegistry::new();
        let (handle, rx) = ConnectionHandle::new("conn-1".into(), "/");
        registry.register(handle);
        drop(rx);

        assert_eq!(registry.probe(&"conn-1".into()), Probe::Dead);
    }

    #[test]
    fn test_remove() {
        let registry = ConnectionRegistry::new();
        let (handle, _rx) = ConnectionHandle::new("conn-1".into(), "/");
        registry.register(handle);
        assert_eq!(registry.len(), 1);

        let id = ConnectionId::from("conn-1");
        assert!(registry.remove(&id).is_some());
        assert!(registry.remove(&id).is_none());
        assert_eq!(registry.probe(&id), Probe::Gone);
        assert!(registry.is_empty());
    }
}
