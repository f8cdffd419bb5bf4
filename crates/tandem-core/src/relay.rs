//! WebRTC signaling relay.
//!
//! Ties the [`ConnectionRegistry`] and [`TopicBroker`] together behind a
//! single teardown path: [`Relay::disconnect`] is the only way a connection
//! leaves, whether its socket closed or it missed a heartbeat.

use crate::broker::{BrokerConfig, BrokerStats, TopicBroker};
use crate::connection::{CloseReason, ConnectionHandle, ConnectionId, Outbound};
use crate::registry::{ConnectionRegistry, Probe};
use std::sync::Arc;
use std::time::Duration;
use tandem_protocol::signaling::pong_frame;
use tandem_protocol::SignalingMessage;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

/// Default heartbeat interval.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Interval between liveness probes. A peer that has not answered the
    /// previous probe by the next tick is closed.
    pub heartbeat_interval: Duration,
    /// Broker configuration.
    pub broker: BrokerConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            broker: BrokerConfig::default(),
        }
    }
}

/// What the relay did with an inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    /// Topic memberships added.
    Subscribed(usize),
    /// Topic memberships removed.
    Unsubscribed(usize),
    /// Publish fanned out to this many members.
    Published(usize),
    /// Ping answered.
    Pong,
    /// Frame was not understood, or targeted nothing; connection stays open.
    Ignored,
}

/// The signaling relay.
pub struct Relay {
    registry: ConnectionRegistry,
    broker: TopicBroker,
    config: RelayConfig,
}

impl Relay {
    /// Create a relay with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RelayConfig::default())
    }

    /// Create a relay with custom configuration.
    #[must_use]
    pub fn with_config(config: RelayConfig) -> Self {
        Self {
            registry: ConnectionRegistry::new(),
            broker: TopicBroker::with_config(config.broker.clone()),
            config,
        }
    }

    /// Register a new connection opened on `origin`.
    ///
    /// Returns the handle and the outbound queue the socket task must drain.
    pub fn connect(
        &self,
        origin: impl Into<Arc<str>>,
    ) -> (ConnectionHandle, mpsc::UnboundedReceiver<Outbound>) {
        let (handle, rx) = ConnectionHandle::new(ConnectionId::generate(), origin);
        self.registry.register(handle.clone());
        (handle, rx)
    }

    /// Handle an inbound text frame.
    pub fn handle_text(&self, handle: &ConnectionHandle, text: &str) -> Handled {
        match SignalingMessage::parse(text) {
            Ok(message) => self.handle_message(handle, message),
            Err(e) => {
                trace!(connection = %handle.id(), error = %e, "Ignoring malformed frame");
                Handled::Ignored
            }
        }
    }

    /// Handle a decoded signaling message.
    pub fn handle_message(&self, handle: &ConnectionHandle, message: SignalingMessage) -> Handled {
        match message {
            SignalingMessage::Subscribe { topics } => {
                let mut added = 0;
                for topic in &topics {
                    match self.broker.subscribe(handle, topic) {
                        Ok(true) => added += 1,
                        Ok(false) => {}
                        Err(e) => {
                            warn!(connection = %handle.id(), topic = %topic, error = %e, "Subscribe rejected");
                        }
                    }
                }
                Handled::Subscribed(added)
            }

            SignalingMessage::Unsubscribe { topics } => Handled::Unsubscribed(
                topics
                    .iter()
                    .filter(|topic| self.broker.unsubscribe(handle, topic))
                    .count(),
            ),

            SignalingMessage::Publish { topic, payload } => {
                match self.broker.publish(handle, &topic, &payload) {
                    Some(published) => Handled::Published(published.recipients),
                    None => Handled::Ignored,
                }
            }

            SignalingMessage::Ping => {
                self.registry.mark_alive(handle.id());
                if handle.send_text(pong_frame()).is_err() {
                    self.disconnect(handle.id(), None);
                }
                Handled::Pong
            }

            SignalingMessage::Pong => {
                self.registry.mark_alive(handle.id());
                Handled::Ignored
            }
        }
    }

    /// Record a transport-level pong.
    pub fn mark_alive(&self, id: &ConnectionId) {
        self.registry.mark_alive(id);
    }

    /// Tear a connection down: leave every topic, drop it from the registry
    /// and queue a single close frame carrying `reason`.
    ///
    /// Returns `false` if the connection was already gone. Safe to call more
    /// than once.
    pub fn disconnect(&self, id: &ConnectionId, reason: Option<CloseReason>) -> bool {
        self.broker.remove_connection(id);
        match self.registry.remove(id) {
            Some(handle) => {
                let _ = handle.send(Outbound::Close(reason));
                debug!(connection = %id, "Connection closed");
                true
            }
            None => false,
        }
    }

    /// Start the heartbeat timer for a connection.
    ///
    /// The task ends on its own once the connection is gone or has been
    /// evicted. The socket task should abort it when the socket closes.
    pub fn spawn_heartbeat(self: &Arc<Self>, id: ConnectionId) -> JoinHandle<()> {
        let relay = Arc::clone(self);
        let period = self.config.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match relay.registry.probe(&id) {
                    Probe::Sent => {}
                    Probe::Dead => {
                        debug!(connection = %id, "Evicting unresponsive connection");
                        relay.disconnect(
                            &id,
                            Some(CloseReason::new(CloseReason::POLICY, "heartbeat timeout")),
                        );
                        break;
                    }
                    Probe::Gone => break,
                }
            }
        })
    }

    /// Get the topic broker.
    #[must_use]
    pub fn broker(&self) -> &TopicBroker {
        &self.broker
    }

    /// Get the connection registry.
    #[must_use]
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Get relay statistics.
    #[must_use]
    pub fn stats(&self) -> RelayStats {
        RelayStats {
            connections: self.registry.len(),
            broker: self.broker.stats(),
        }
    }
}

impl Default for Relay {
    fn default() -> Self {
        Self::new()
    }
}

/// Relay statistics.
#[derive(Debug, Clone)]
pub struct RelayStats {
    /// Registered connections.
    pub connections: usize,
    /// Topic statistics.
    pub broker: BrokerStats,
}
