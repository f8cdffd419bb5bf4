//! Shared CRDT documents.
//!
//! A [`SharedDoc`] is the single authoritative replica of one room. The yrs
//! document sits behind its own async mutex, so merges into the same room are
//! serialized while different rooms never contend. Applied updates are fanned
//! out to the room's live sessions through a broadcast channel.

use crate::connection::ConnectionId;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, trace};
use yrs::sync::{Message as YMessage, SyncMessage};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

/// Default per-room broadcast capacity.
pub const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// Document errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Remote bytes are not a valid v1 update.
    #[error("Invalid update: {0}")]
    InvalidUpdate(String),

    /// Remote bytes are not a valid state vector.
    #[error("Invalid state vector: {0}")]
    InvalidStateVector(String),

    /// The engine refused to integrate a decoded update.
    #[error("Failed to apply update: {0}")]
    Apply(String),
}

/// How a document came into existence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocOrigin {
    /// Opened by a live WebSocket session.
    Live,
    /// Originated by an authorized poll request.
    Poll,
}

/// An event fanned out to a room's live sessions.
#[derive(Debug, Clone)]
pub enum RoomEvent {
    /// An encoded y-sync `Update` message.
    Sync {
        /// Session that produced it, or `None` for poll merges.
        origin: Option<ConnectionId>,
        /// Encoded frame.
        frame: Bytes,
    },
    /// An awareness frame relayed verbatim.
    Awareness {
        /// Session that produced it.
        origin: ConnectionId,
        /// Encoded frame.
        frame: Bytes,
    },
    /// Close sessions, all of them or only those of one user.
    Reset {
        /// User filter.
        user_id: Option<String>,
    },
}

/// A live session attached to a room.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// Connection ID.
    pub connection_id: ConnectionId,
    /// Authenticated user, if known.
    pub user_id: Option<String>,
    /// Whether writes from this session are dropped.
    pub read_only: bool,
    /// When the session bound, in milliseconds since the epoch.
    pub joined_at: u64,
}

impl SessionInfo {
    /// Create session info.
    #[must_use]
    pub fn new(connection_id: ConnectionId, user_id: Option<String>, read_only: bool) -> Self {
        Self {
            connection_id,
            user_id,
            read_only,
            joined_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or_default(),
        }
    }

    /// Check whether a reset aimed at `user_id` applies to this session.
    #[must_use]
    pub fn matches_reset(&self, user_id: Option<&str>) -> bool {
        match user_id {
            None => true,
            Some(user) => self.user_id.as_deref() == Some(user),
        }
    }
}

/// Decode a v1 update without touching any document.
///
/// # Errors
///
/// Returns an error if the bytes are not a valid update.
pub fn decode_update(data: &[u8]) -> Result<Update, StoreError> {
    Update::decode_v1(data).map_err(|e| StoreError::InvalidUpdate(e.to_string()))
}

/// Encode an update as a y-sync `Update` message.
#[must_use]
pub fn update_frame(update: &[u8]) -> Bytes {
    Bytes::from(YMessage::Sync(SyncMessage::Update(update.to_vec())).encode_v1())
}

/// The authoritative replica of one room.
pub struct SharedDoc {
    name: String,
    origin: DocOrigin,
    doc: Mutex<Doc>,
    events: broadcast::Sender<Arc<RoomEvent>>,
    sessions: DashMap<ConnectionId, SessionInfo>,
}

impl SharedDoc {
    /// Create an empty document.
    #[must_use]
    pub fn new(name: impl Into<String>, origin: DocOrigin, capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            name: name.into(),
            origin,
            doc: Mutex::new(Doc::new()),
            events,
            sessions: DashMap::new(),
        }
    }

    /// Get the room name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get how the document was created.
    #[must_use]
    pub fn origin(&self) -> DocOrigin {
        self.origin
    }

    /// Encode the full document state as a v1 update.
    pub async fn encode(&self) -> Vec<u8> {
        let doc = self.doc.lock().await;
        let txn = doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Get the document's state vector.
    pub async fn state_vector(&self) -> StateVector {
        let doc = self.doc.lock().await;
        let txn = doc.transact();
        txn.state_vector()
    }

    /// Encode everything the holder of `remote` is missing.
    pub async fn diff(&self, remote: &StateVector) -> Vec<u8> {
        let doc = self.doc.lock().await;
        let txn = doc.transact();
        txn.encode_diff_v1(remote)
    }

    /// Decode `data` and merge it into the document.
    ///
    /// The update is decoded and applied under the room lock, so nothing
    /// that is not `Send` lives across an await. Nothing is touched if `data`
    /// does not decode.
    ///
    /// # Errors
    ///
    /// Returns an error if the update is invalid or the engine rejects it.
    pub async fn merge(&self, data: &[u8], origin: Option<&ConnectionId>) -> Result<(), StoreError> {
        {
            let doc = self.doc.lock().await;
            let update = decode_update(data)?;
            let mut txn = doc.transact_mut();
            txn.apply_update(update)
                .map_err(|e| StoreError::Apply(e.to_string()))?;
        }

        trace!(room = %self.name, bytes = data.len(), "Merged update");
        self.publish(RoomEvent::Sync {
            origin: origin.cloned(),
            frame: update_frame(data),
        });
        Ok(())
    }

    /// Hold the room lock, stalling every merge and read.
    #[cfg(test)]
    pub(crate) async fn lock_for_test(&self) -> tokio::sync::MutexGuard<'_, Doc> {
        self.doc.lock().await
    }

    /// Fan an event out to the room's live sessions.
    ///
    /// Returns the number of sessions that will see it.
    pub fn publish(&self, event: RoomEvent) -> usize {
        self.events.send(Arc::new(event)).unwrap_or_default()
    }

    /// Subscribe to room events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<RoomEvent>> {
        self.events.subscribe()
    }

    /// Attach a live session.
    pub fn join(&self, session: SessionInfo) {
        debug!(room = %self.name, connection = %session.connection_id, read_only = session.read_only, "Session joined");
        self.sessions.insert(session.connection_id.clone(), session);
    }

    /// Detach a live session.
    pub fn leave(&self, connection_id: &ConnectionId) -> Option<SessionInfo> {
        let session = self.sessions.remove(connection_id).map(|(_, s)| s);
        if session.is_some() {
            debug!(room = %self.name, connection = %connection_id, "Session left");
        }
        session
    }

    /// Number of attached sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Snapshot of attached sessions.
    #[must_use]
    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.sessions.iter().map(|s| s.value().clone()).collect()
    }

    /// Ask matching sessions to close. Returns how many match.
    pub fn reset(&self, user_id: Option<&str>) -> usize {
        let matching = self
            .sessions
            .iter()
            .filter(|s| s.matches_reset(user_id))
            .count();
        if matching > 0 {
            self.publish(RoomEvent::Reset {
                user_id: user_id.map(str::to_string),
            });
        }
        matching
    }
}
