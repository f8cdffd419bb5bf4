//! Topic abstraction for the signaling relay.
//!
//! Topics are named groups of connections. Each member is keyed by the pair
//! (connection, origin) so that a publish only reaches peers that came in
//! through the same signaling namespace.

use crate::connection::{ConnectionHandle, ConnectionId, Outbound};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace};

/// Maximum topic name length.
pub const MAX_TOPIC_NAME_LENGTH: usize = 256;

/// Validate a topic name.
///
/// # Errors
///
/// Returns an error message if the topic name is invalid.
pub fn validate_topic_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Topic name cannot be empty");
    }
    if name.len() > MAX_TOPIC_NAME_LENGTH {
        return Err("Topic name too long");
    }
    if name.chars().any(char::is_control) {
        return Err("Topic name contains control characters");
    }
    Ok(())
}

/// Membership key: a connection as seen through one origin.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemberKey {
    /// Connection ID.
    pub connection: ConnectionId,
    /// Origin tag the connection was opened with.
    pub origin: Arc<str>,
}

impl MemberKey {
    fn of(handle: &ConnectionHandle) -> Self {
        Self {
            connection: handle.id().clone(),
            origin: Arc::from(handle.origin()),
        }
    }
}

/// Outcome of a fan-out.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Members the frame was queued for.
    pub delivered: usize,
    /// Members whose socket has gone away.
    pub failed: Vec<ConnectionId>,
}

/// A named signaling topic.
#[derive(Debug)]
pub struct Topic {
    name: String,
    members: HashMap<MemberKey, ConnectionHandle>,
}

impl Topic {
    /// Create an empty topic.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            members: HashMap::new(),
        }
    }

    /// Get the topic name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of members.
    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Check if the topic has no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Check if a connection is a member through any origin.
    #[must_use]
    pub fn contains(&self, connection_id: &ConnectionId) -> bool {
        self.members.keys().any(|k| &k.connection == connection_id)
    }

    /// Add a member. Returns `false` if the pair was already present.
    pub fn insert(&mut self, handle: &ConnectionHandle) -> bool {
        let key = MemberKey::of(handle);
        if self.members.contains_key(&key) {
            return false;
        }
        debug!(topic = %self.name, connection = %handle.id(), "Member joined");
        self.members.insert(key, handle.clone());
        true
    }

    /// Remove a member. Returns `true` if the pair was present.
    pub fn remove(&mut self, handle: &ConnectionHandle) -> bool {
        let removed = self.members.remove(&MemberKey::of(handle)).is_some();
        if removed {
            debug!(topic = %self.name, connection = %handle.id(), "Member left");
        }
        removed
    }

    /// Remove every membership of a connection regardless of origin.
    pub fn remove_connection(&mut self, connection_id: &ConnectionId) -> bool {
        let before = self.members.len();
        self.members.retain(|k, _| &k.connection != connection_id);
        before != self.members.len()
    }

    /// Queue `frame` for every member that shares `origin`, except `sender`.
    pub fn deliver(&self, origin: &str, sender: &ConnectionId, frame: &str) -> Delivery {
        let mut delivery = Delivery::default();
        for (key, handle) in &self.members {
            if &*key.origin != origin || &key.connection == sender {
                continue;
            }
            match handle.send(Outbound::Text(frame.to_string())) {
                Ok(()) => delivery.delivered += 1,
                Err(_) => delivery.failed.push(key.connection.clone()),
            }
        }
        trace!(topic = %self.name, delivered = delivery.delivered, "Delivered frame");
        delivery
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_creation() {
        let topic = Topic::new("room-42");
        assert_eq!(topic.name(), "room-42");
        assert!(topic.is_empty());
    }

    #[test]
    fn test_topic_insert_is_idempotent() {
        let mut topic = Topic::new("t");
        let (a, _rx) = ConnectionHandle::new("a".into(), "/");

        assert!(topic.insert(&a));
        assert!(!topic.insert(&a));
        assert_eq!(topic.len(), 1);

        assert!(topic.remove(&a));
        assert!(!topic.remove(&a));
        assert!(topic.is_empty());
    }

    #[test]
    fn test_topic_deliver_scoped_by_origin() {
        let mut topic = Topic::new("t");
        let (a, mut rx_a) = ConnectionHandle::new("a".into(), "/one");
        let (b, mut rx_b) = ConnectionHandle::new("b".into(), "/one");
        let (c, mut rx_c) = ConnectionHandle::new("c".into(), "/two");
        topic.insert(&a);
        topic.insert(&b);
        topic.insert(&c);

        let delivery = topic.deliver("/one", a.id(), "{}");
        assert_eq!(delivery.delivered, 1);
        assert!(delivery.failed.is_empty());

        assert!(rx_a.try_recv().is_err());
        assert_eq!(rx_b.try_recv().unwrap(), Outbound::Text("{}".to_string()));
        assert!(rx_c.try_recv().is_err());
    }

    #[test]
    fn test_topic_deliver_reports_failures() {
        let mut topic = Topic::new("t");
        let (a, _rx_a) = ConnectionHandle::new("a".into(), "/");
        let (b, rx_b) = ConnectionHandle::new("b".into(), "/");
        topic.insert(&a);
        topic.insert(&b);
        drop(rx_b);

        let delivery = topic.deliver("/", &"someone".into(), "{}");
        assert_eq!(delivery.delivered, 1);
        assert_eq!(delivery.failed, vec![ConnectionId::from("b")]);
    }

    #[test]
    fn test_topic_name_validation() {
        assert!(validate_topic_name("room-42").is_ok());
        assert!(validate_topic_name("").is_err());
        assert!(validate_topic_name("bad\nname").is_err());

        let long_name = "a".repeat(MAX_TOPIC_NAME_LENGTH + 1);
        assert!(validate_topic_name(&long_name).is_err());
    }
}
