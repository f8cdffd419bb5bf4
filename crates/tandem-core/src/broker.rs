//! Topic broker for the signaling relay.
//!
//! The broker owns topic membership and fans publish frames out to members
//! that share the sender's origin.

use crate::connection::{ConnectionHandle, ConnectionId};
use crate::topic::{validate_topic_name, Topic};
use dashmap::DashMap;
use serde_json::{Map, Value};
use std::collections::HashSet;
use tandem_protocol::signaling::relay_frame;
use thiserror::Error;
use tracing::{debug, info, trace};

/// Broker errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BrokerError {
    /// Invalid topic name.
    #[error("Invalid topic name: {0}")]
    InvalidTopic(&'static str),

    /// Maximum subscriptions reached.
    #[error("Maximum subscriptions reached")]
    MaxSubscriptionsReached,
}

/// Broker configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Maximum topics one connection may join.
    pub max_topics_per_connection: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_topics_per_connection: 100,
        }
    }
}

/// Result of a publish to an existing topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Published {
    /// Topic size reported to recipients.
    pub clients: usize,
    /// Members the frame was queued for.
    pub recipients: usize,
    /// Members dropped because their socket had gone away.
    pub evicted: usize,
}

/// The signaling topic broker.
pub struct TopicBroker {
    /// Topics indexed by name.
    topics: DashMap<String, Topic>,
    /// Connection memberships (connection_id -> set of topic names).
    subscriptions: DashMap<ConnectionId, HashSet<String>>,
    /// Configuration.
    config: BrokerConfig,
}

impl TopicBroker {
    /// Create a new broker with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(BrokerConfig::default())
    }

    /// Create a new broker with custom configuration.
    #[must_use]
    pub fn with_config(config: BrokerConfig) -> Self {
        info!("Creating topic broker with config: {:?}", config);
        Self {
            topics: DashMap::new(),
            subscriptions: DashMap::new(),
            config,
        }
    }

    /// Get broker statistics.
    #[must_use]
    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            topic_count: self.topics.len(),
            connection_count: self.subscriptions.len(),
            total_subscriptions: self.subscriptions.iter().map(|s| s.len()).sum(),
        }
    }

    /// Subscribe a connection to a topic.
    ///
    /// Returns `true` if the membership is new; subscribing twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the topic name is invalid or the connection has
    /// joined too many topics.
    pub fn subscribe(&self, handle: &ConnectionHandle, topic: &str) -> Result<bool, BrokerError> {
        validate_topic_name(topic).map_err(BrokerError::InvalidTopic)?;

        let mut memberships = self.subscriptions.entry(handle.id().clone()).or_default();
        if !memberships.contains(topic)
            && memberships.len() >= self.config.max_topics_per_connection
        {
            return Err(BrokerError::MaxSubscriptionsReached);
        }

        let inserted = self
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| {
                debug!(topic = %topic, "Creating topic");
                Topic::new(topic)
            })
            .insert(handle);
        memberships.insert(topic.to_string());

        debug!(topic = %topic, connection = %handle.id(), inserted, "Subscribed");
        Ok(inserted)
    }

    /// Unsubscribe a connection from a topic, deleting the topic once empty.
    ///
    /// Returns `true` if the connection was a member.
    pub fn unsubscribe(&self, handle: &ConnectionHandle, topic: &str) -> bool {
        let removed = self
            .topics
            .get_mut(topic)
            .map(|mut t| t.remove(handle))
            .unwrap_or(false);

        if removed {
            let still_member = self
                .topics
                .get(topic)
                .is_some_and(|t| t.contains(handle.id()));
            if !still_member {
                self.forget_membership(handle.id(), topic);
            }
            self.prune(topic);
            debug!(topic = %topic, connection = %handle.id(), "Unsubscribed");
        }
        removed
    }

    /// Remove a connection from every topic it joined.
    pub fn remove_connection(&self, connection_id: &ConnectionId) {
        if let Some((_, topics)) = self.subscriptions.remove(connection_id) {
            for name in &topics {
                if let Some(mut topic) = self.topics.get_mut(name.as_str()) {
                    topic.remove_connection(connection_id);
                }
                self.prune(name);
            }
            debug!(connection = %connection_id, topics = topics.len(), "Left all topics");
        }
    }

    /// Publish a payload to a topic on behalf of `sender`.
    ///
    /// The relayed frame carries `clients` set to the topic size and is
    /// queued only for members sharing the sender's origin. Members whose
    /// socket has gone away are dropped from the topic. Returns `None` if the
    /// topic does not exist.
    pub fn publish(
        &self,
        sender: &ConnectionHandle,
        topic: &str,
        payload: &Map<String, Value>,
    ) -> Option<Published> {
        let (clients, delivery) = {
            let Some(entry) = self.topics.get(topic) else {
                trace!(topic = %topic, "Publish to non-existent topic");
                return None;
            };
            let clients = entry.len();
            let frame = relay_frame(topic, payload, clients).to_string();
            (clients, entry.deliver(sender.origin(), sender.id(), &frame))
        };

        for failed in &delivery.failed {
            debug!(topic = %topic, connection = %failed, "Dropping unreachable member");
            if let Some(mut entry) = self.topics.get_mut(topic) {
                entry.remove_connection(failed);
            }
            self.forget_membership(failed, topic);
        }
        if !delivery.failed.is_empty() {
            self.prune(topic);
        }

        trace!(topic = %topic, recipients = delivery.delivered, "Published");
        Some(Published {
            clients,
            recipients: delivery.delivered,
            evicted: delivery.failed.len(),
        })
    }

    /// Check if a topic exists.
    #[must_use]
    pub fn topic_exists(&self, topic: &str) -> bool {
        self.topics.contains_key(topic)
    }

    /// Get the member count of a topic.
    #[must_use]
    pub fn member_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map(|t| t.len()).unwrap_or(0)
    }

    /// Get the topics a connection has joined.
    #[must_use]
    pub fn connection_topics(&self, connection_id: &ConnectionId) -> Vec<String> {
        self.subscriptions
            .get(connection_id)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn forget_membership(&self, connection_id: &ConnectionId, topic: &str) {
        if let Some(mut memberships) = self.subscriptions.get_mut(connection_id) {
            memberships.remove(topic);
        }
        self.subscriptions
            .remove_if(connection_id, |_, memberships| memberships.is_empty());
    }

    fn prune(&self, topic: &str) {
        if self.topics.remove_if(topic, |_, t| t.is_empty()).is_some() {
            debug!(topic = %topic, "Deleted empty topic");
        }
    }
}

impl Default for TopicBroker {
    fn default() -> Self {
        Self::new()
    }
}

/// Broker statistics.
#[derive(Debug, Clone)]
pub struct BrokerStats {
    /// Number of live topics.
    pub topic_count: usize,
    /// Number of connections with at least one membership.
    pub connection_count: usize,
    /// Total number of memberships.
    pub total_subscriptions: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Outbound;
    use serde_json::json;

    fn payload(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    fn recv_json(rx: &mut tokio::sync::mpsc::UnboundedReceiver<Outbound>) -> Option<Value> {
        match rx.try_recv() {
            Ok(Outbound::Text(text)) => serde_json::from_str(&text).ok(),
            _ => None,
        }
    }

    #[test]
    fn test_broker_subscribe_unsubscribe() {
        let broker = TopicBroker::new();
        let (a, _rx) = ConnectionHandle::new("a".into(), "/");

        assert!(broker.subscribe(&a, "test").unwrap());
        assert!(broker.topic_exists("test"));
        assert_eq!(broker.member_count("test"), 1);

        assert!(broker.unsubscribe(&a, "test"));
        // Topic should be auto-deleted
        assert!(!broker.topic_exists("test"));
        assert!(broker.connection_topics(a.id()).is_empty());
        assert!(!broker.unsubscribe(&a, "test"));
    }

    #[test]
    fn test_broker_scenario_room_42() {
        let broker = TopicBroker::new();
        let (a, mut rx_a) = ConnectionHandle::new("a".into(), "/");
        let (b, mut rx_b) = ConnectionHandle::new("b".into(), "/");
        broker.subscribe(&a, "room-42").unwrap();
        broker.subscribe(&b, "room-42").unwrap();

        let published = broker
            .publish(&a, "room-42", &payload(json!({"sdp": "offer..."})))
            .unwrap();
        assert_eq!(published.clients, 2);
        assert_eq!(published.recipients, 1);

        assert_eq!(
            recv_json(&mut rx_b),
            Some(json!({"type": "publish", "topic": "room-42", "sdp": "offer...", "clients": 2}))
        );
        assert!(rx_a.try_recv().is_err());
    }

    #[test]
    fn test_broker_publish_scoped_by_origin() {
        let broker = TopicBroker::new();
        let (sender, _rx_s) = ConnectionHandle::new("s".into(), "wss://one");
        let (a, mut rx_a) = ConnectionHandle::new("a".into(), "wss://one");
        let (b, mut rx_b) = ConnectionHandle::new("b".into(), "wss://two");
        broker.subscribe(&sender, "t").unwrap();
        broker.subscribe(&a, "t").unwrap();
        broker.subscribe(&b, "t").unwrap();

        let published = broker.publish(&sender, "t", &Map::new()).unwrap();
        assert_eq!(published.clients, 3);
        assert_eq!(published.recipients, 1);
        assert!(recv_json(&mut rx_a).is_some());
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn test_broker_idempotent_subscribe() {
        let broker = TopicBroker::new();
        let (a, _rx_a) = ConnectionHandle::new("a".into(), "/");
        let (b, mut rx_b) = ConnectionHandle::new("b".into(), "/");

        assert!(broker.subscribe(&b, "t").unwrap());
        assert!(!broker.subscribe(&b, "t").unwrap());
        broker.subscribe(&a, "t").unwrap();

        broker.publish(&a, "t", &Map::new()).unwrap();
        assert!(recv_json(&mut rx_b).is_some());
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn test_broker_publish_missing_topic() {
        let broker = TopicBroker::new();
        let (a, _rx) = ConnectionHandle::new("a".into(), "/");
        assert!(broker.publish(&a, "nowhere", &Map::new()).is_none());
    }

    #[test]
    fn test_broker_remove_connection_collects_topics() {
        let broker = TopicBroker::new();
        let (a, _rx_a) = ConnectionHandle::new("a".into(), "/");
        let (b, _rx_b) = ConnectionHandle::new("b".into(), "/");
        broker.subscribe(&a, "one").unwrap();
        broker.subscribe(&a, "two").unwrap();
        broker.subscribe(&b, "two").unwrap();

        broker.remove_connection(a.id());

        assert!(!broker.topic_exists("one"));
        assert_eq!(broker.member_count("two"), 1);
        assert!(broker.publish(&b, "one", &Map::new()).is_none());
    }

    #[test]
    fn test_broker_evicts_unreachable_members() {
        let broker = TopicBroker::new();
        let (a, _rx_a) = ConnectionHandle::new("a".into(), "/");
        let (b, rx_b) = ConnectionHandle::new("b".into(), "/");
        broker.subscribe(&a, "t").unwrap();
        broker.subscribe(&b, "t").unwrap();
        drop(rx_b);

        let published = broker.publish(&a, "t", &Map::new()).unwrap();
        assert_eq!(published.recipients, 0);
        assert_eq!(published.evicted, 1);
        assert_eq!(broker.member_count("t"), 1);
        assert!(broker.connection_topics(b.id()).is_empty());
    }

    #[test]
    fn test_broker_subscription_limit() {
        let broker = TopicBroker::with_config(BrokerConfig {
            max_topics_per_connection: 1,
        });
        let (a, _rx) = ConnectionHandle::new("a".into(), "/");

        broker.subscribe(&a, "one").unwrap();
        assert!(broker.subscribe(&a, "one").is_ok());
        assert_eq!(
            broker.subscribe(&a, "two"),
            Err(BrokerError::MaxSubscriptionsReached)
        );
        assert!(matches!(
            broker.subscribe(&a, ""),
            Err(BrokerError::InvalidTopic(_))
        ));
    }

    #[test]
    fn test_broker_stats() {
        let broker = TopicBroker::new();
        let (a, _rx_a) = ConnectionHandle::new("a".into(), "/");
        let (b, _rx_b) = ConnectionHandle::new("b".into(), "/");
        broker.subscribe(&a, "one").unwrap();
        broker.subscribe(&a, "two").unwrap();
        broker.subscribe(&b, "one").unwrap();

        let stats = broker.stats();
        assert_eq!(stats.topic_count, 2);
        assert_eq!(stats.connection_count, 2);
        assert_eq!(stats.total_subscriptions, 3);
    }
}
