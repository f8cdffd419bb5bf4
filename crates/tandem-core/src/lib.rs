//! # tandem-core
//!
//! Synchronization core for the Tandem collaboration server.
//!
//! Two independent halves live here:
//!
//! - **Relay** - topic pub/sub used by peers to exchange WebRTC handshakes,
//!   built from a [`ConnectionRegistry`] (liveness) and a [`TopicBroker`]
//!   (membership and fan-out)
//! - **Documents** - the [`DocumentStore`] holding one authoritative CRDT per
//!   room, reached either by a [`LiveSession`] over a socket or by
//!   [`reconcile`] for socketless polls
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌──────────────────┐     ┌─────────────┐
//! │  Signaling  │────▶│ Relay / Registry │────▶│ TopicBroker │
//! └─────────────┘     └──────────────────┘     └─────────────┘
//!
//! ┌─────────────┐     ┌──────────────────┐
//! │ LiveSession │────▶│                  │
//! └─────────────┘     │  DocumentStore   │──▶ SharedDoc (one per room)
//! ┌─────────────┐     │                  │
//! │  reconcile  │────▶│                  │
//! └─────────────┘     └──────────────────┘
//! ```

pub mod access;
pub mod broker;
pub mod connection;
pub mod document;
pub mod live;
pub mod poll;
pub mod registry;
pub mod relay;
pub mod store;
pub mod topic;

#[cfg(test)]
mod test_support;

pub use access::{AccessGrant, AccessPolicy, AccessRequest, HeaderAccessPolicy};
pub use broker::{BrokerConfig, BrokerError, BrokerStats, Published, TopicBroker};
pub use connection::{CloseReason, ConnectionHandle, ConnectionId, DeliveryError, Outbound};
pub use document::{DocOrigin, RoomEvent, SessionInfo, SharedDoc, StoreError};
pub use live::{verify_room_identity, Forward, LiveError, LiveSession, SessionState};
pub use poll::{reconcile, require_room, PollError, PollOutcome, Reconciled};
pub use registry::{ConnectionRegistry, Probe};
pub use relay::{Handled, Relay, RelayConfig, RelayStats};
pub use store::{DocumentStore, StoreConfig, StoreStats};
pub use topic::{validate_topic_name, Topic};
