//! Connection handles shared by the relay and the live gateway.
//!
//! A socket task owns the receiving half of an unbounded queue; everything
//! else talks to the socket through a cloneable [`ConnectionHandle`].

use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::mpsc;

/// Atomic counter keeping IDs unique within the same nanosecond.
static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique identifier for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Create a new connection ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a unique connection ID.
    #[must_use]
    pub fn generate() -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn_{:x}_{:x}", timestamp, counter))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Close frame details.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    /// WebSocket close code.
    pub code: u16,
    /// Human-readable reason.
    pub reason: String,
}

impl CloseReason {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// Policy violation, used for heartbeat eviction and room resets.
    pub const POLICY: u16 = 1008;

    /// Create a close reason.
    #[must_use]
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

/// A frame queued for a socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// JSON text frame.
    Text(String),
    /// Binary frame.
    Binary(Bytes),
    /// Transport-level liveness probe.
    Ping,
    /// Close the socket. The socket task stops after sending it.
    Close(Option<CloseReason>),
}

/// Delivery errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeliveryError {
    /// The socket task has gone away.
    #[error("Connection closed: {0}")]
    Closed(ConnectionId),
}

/// Cloneable handle to a connected socket.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    origin: Arc<str>,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ConnectionHandle {
    /// Create a handle and the queue its socket task drains.
    #[must_use]
    pub fn new(
        id: ConnectionId,
        origin: impl Into<Arc<str>>,
    ) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                id,
                origin: origin.into(),
                tx,
            },
            rx,
        )
    }

    /// Get the connection ID.
    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Get the origin tag (the URL the socket was opened on).
    #[must_use]
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Queue a frame for the socket.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket task has stopped.
    pub fn send(&self, frame: Outbound) -> Result<(), DeliveryError> {
        self.tx
            .send(frame)
            .map_err(|_| DeliveryError::Closed(self.id.clone()))
    }

    /// Queue a text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket task has stopped.
    pub fn send_text(&self, text: impl Into<String>) -> Result<(), DeliveryError> {
        self.send(Outbound::Text(text.into()))
    }

    /// Check whether the socket task is still draining the queue.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_generation() {
        let id1 = ConnectionId::generate();
        let id2 = ConnectionId::generate();
        assert_ne!(id1, id2);
        assert!(id1.as_str().starts_with("conn_"));
    }

    #[test]
    fn test_handle_send() {
        let (handle, mut rx) = ConnectionHandle::new("conn-1".into(), "/?ns=a");
        assert_eq!(handle.origin(), "/?ns=a");

        handle.send_text("hello").unwrap();
        assert_eq!(rx.try_recv().unwrap(), Outbound::Text("hello".to_string()));
    }

    #[test]
    fn test_handle_send_after_drop() {
        let (handle, rx) = ConnectionHandle::new("conn-1".into(), "/");
        drop(rx);

        assert!(!handle.is_open());
        assert_eq!(
            handle.send(Outbound::Ping),
            Err(DeliveryError::Closed("conn-1".into()))
        );
    }
}
