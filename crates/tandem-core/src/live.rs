//! Live collaboration sessions.
//!
//! A session binds one WebSocket to one room's [`SharedDoc`] and speaks the
//! y-sync protocol over it:
//!
//! ```text
//! Connecting ──▶ Authorizing ──▶ Bound ──▶ Closed
//!   room +          identity        sync step 1/2,
//!   grant           check           updates, awareness
//! ```
//!
//! Read-only sessions still receive every update; whatever they send that
//! would mutate the document is dropped without telling them.

use crate::access::AccessGrant;
use crate::connection::ConnectionId;
use crate::document::{update_frame, RoomEvent, SessionInfo, SharedDoc, StoreError};
use crate::store::DocumentStore;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, trace, warn};
use yrs::sync::{Message as YMessage, SyncMessage};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;

/// Live session errors.
#[derive(Debug, Error)]
pub enum LiveError {
    /// The document the engine would bind differs from the requested room.
    #[error("Room mismatch: requested {requested:?}, engine resolved {resolved:?}")]
    RoomMismatch {
        /// Room named in the request.
        requested: String,
        /// Document name the engine resolved from the URL.
        resolved: String,
    },

    /// Inbound frame is not a y-sync message.
    #[error("Malformed frame: {0}")]
    Decode(String),

    /// Merge failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Authorizing,
    Bound,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Connecting => "connecting",
            SessionState::Authorizing => "authorizing",
            SessionState::Bound => "bound",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// What the socket task should do with a room event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Forward {
    /// Send this binary frame.
    Frame(Bytes),
    /// Close the socket; the room was reset.
    Close,
}

/// Check that the engine's document name is the requested room.
///
/// # Errors
///
/// Returns [`LiveError::RoomMismatch`] if the names differ in any way.
pub fn verify_room_identity(requested: &str, resolved: &str) -> Result<(), LiveError> {
    if requested == resolved {
        Ok(())
    } else {
        warn!(
            requested = %requested,
            resolved = %resolved,
            "Room identity mismatch, probable attack"
        );
        Err(LiveError::RoomMismatch {
            requested: requested.to_string(),
            resolved: resolved.to_string(),
        })
    }
}

/// A WebSocket bound to a room.
pub struct LiveSession {
    info: SessionInfo,
    doc: Arc<SharedDoc>,
    grant: AccessGrant,
    events: broadcast::Receiver<Arc<RoomEvent>>,
    state: SessionState,
    // Set once a lag is seen and cleared only after the full state is read,
    // so a cancelled `next_event` still resends it on the next call.
    resync_pending: bool,
}

impl LiveSession {
    /// Authorize a connection and bind it to its room.
    ///
    /// `resolved` is the document name derived from the request path; it must
    /// equal the granted room before any document is touched.
    ///
    /// # Errors
    ///
    /// Returns [`LiveError::RoomMismatch`] on an identity mismatch.
    pub fn bind(
        store: &DocumentStore,
        resolved: &str,
        grant: AccessGrant,
        id: ConnectionId,
    ) -> Result<Self, LiveError> {
        trace!(connection = %id, state = %SessionState::Authorizing, room = %grant.room);
        verify_room_identity(&grant.room, resolved)?;

        let doc = store.get_or_create(&grant.room);
        // Subscribe before joining so no update slips between the two.
        let events = doc.subscribe();
        let info = SessionInfo::new(id, grant.user_id.clone(), grant.is_read_only());
        doc.join(info.clone());

        debug!(
            connection = %info.connection_id,
            room = %grant.room,
            read_only = grant.is_read_only(),
            state = %SessionState::Bound,
            "Session bound"
        );

        Ok(Self {
            info,
            doc,
            grant,
            events,
            state: SessionState::Bound,
            resync_pending: false,
        })
    }

    /// Get the connection ID.
    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.info.connection_id
    }

    /// Get the bound document.
    #[must_use]
    pub fn doc(&self) -> &Arc<SharedDoc> {
        &self.doc
    }

    /// Get the session's grant.
    #[must_use]
    pub fn grant(&self) -> &AccessGrant {
        &self.grant
    }

    /// Get the lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The first frame sent after binding: sync step 1 with the server's
    /// state vector, so the client answers with whatever the server lacks.
    pub async fn greeting(&self) -> Bytes {
        let sv = self.doc.state_vector().await;
        Bytes::from(YMessage::Sync(SyncMessage::SyncStep1(sv)).encode_v1())
    }

    /// Handle an inbound binary frame, returning a direct reply if one is due.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame does not decode or the update is
    /// rejected. The document is untouched in both cases.
    pub async fn handle_frame(&self, data: &[u8]) -> Result<Option<Bytes>, LiveError> {
        let message = YMessage::decode_v1(data).map_err(|e| LiveError::Decode(e.to_string()))?;

        match message {
            YMessage::Sync(SyncMessage::SyncStep1(remote)) => {
                let diff = self.doc.diff(&remote).await;
                trace!(connection = %self.id(), bytes = diff.len(), "Answering sync step 1");
                Ok(Some(Bytes::from(
                    YMessage::Sync(SyncMessage::SyncStep2(diff)).encode_v1(),
                )))
            }

            YMessage::Sync(SyncMessage::SyncStep2(update))
            | YMessage::Sync(SyncMessage::Update(update)) => {
                if self.grant.is_read_only() {
                    trace!(connection = %self.id(), "Dropping write from read-only session");
                    return Ok(None);
                }
                self.doc.merge(&update, Some(self.id())).await?;
                Ok(None)
            }

            YMessage::Awareness(_) => {
                self.doc.publish(RoomEvent::Awareness {
                    origin: self.id().clone(),
                    frame: Bytes::copy_from_slice(data),
                });
                Ok(None)
            }

            other => {
                trace!(connection = %self.id(), message = ?other, "Ignoring message");
                Ok(None)
            }
        }
    }

    /// Wait for the next room event addressed to this session.
    ///
    /// Returns `None` once the room's channel is gone. Cancel safe: a
    /// full-state resend owed after a lag survives a dropped call.
    pub async fn next_event(&mut self) -> Option<Forward> {
        loop {
            if self.resync_pending {
                let state = self.doc.encode().await;
                self.resync_pending = false;
                return Some(Forward::Frame(update_frame(&state)));
            }

            match self.events.recv().await {
                Ok(event) => match &*event {
                    RoomEvent::Sync { origin, frame } => {
                        if origin.as_ref() != Some(self.id()) {
                            return Some(Forward::Frame(frame.clone()));
                        }
                    }
                    RoomEvent::Awareness { origin, frame } => {
                        if origin != self.id() {
                            return Some(Forward::Frame(frame.clone()));
                        }
                    }
                    RoomEvent::Reset { user_id } => {
                        if self.info.matches_reset(user_id.as_deref()) {
                            debug!(connection = %self.id(), room = %self.grant.room, "Session reset");
                            return Some(Forward::Close);
                        }
                    }
                },
                Err(RecvError::Lagged(skipped)) => {
                    // Missed updates are recovered by resending the full state.
                    warn!(connection = %self.id(), skipped, "Session lagged, resending state");
                    self.resync_pending = true;
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Detach from the room. The document itself is kept.
    pub fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.doc.leave(self.id());
        self.state = SessionState::Closed;
        debug!(connection = %self.id(), room = %self.grant.room, state = %self.state, "Session closed");
    }
}

impl Drop for LiveSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreConfig;
    use crate::test_support::{text_of, text_update};
    use yrs::StateVector;

    fn update_message(update: &[u8]) -> Vec<u8> {
        YMessage::Sync(SyncMessage::Update(update.to_vec())).encode_v1()
    }

    #[test]
    fn test_room_identity_mismatch_rejected() {
        let store = DocumentStore::new();
        let result = LiveSession::bind(
            &store,
            "other-room",
            AccessGrant::editor("my-room"),
            "conn-1".into(),
        );

        assert!(matches!(result, Err(LiveError::RoomMismatch { .. })));
        // Rejected before any document was created
        assert!(store.is_empty());
    }

    #[test]
    fn test_room_identity_is_exact() {
        assert!(verify_room_identity("doc", "doc").is_ok());
        assert!(verify_room_identity("doc", "Doc").is_err());
        assert!(verify_room_identity("doc", "doc/").is_err());
    }

    #[tokio::test]
    async fn test_bind_joins_and_drop_leaves() {
        let store = DocumentStore::new();
        let session =
            LiveSession::bind(&store, "doc", AccessGrant::editor("doc"), "conn-1".into()).unwrap();
        assert_eq!(session.state(), SessionState::Bound);

        let doc = store.get("doc").unwrap();
        assert_eq!(doc.session_count(), 1);

        drop(session);
        assert_eq!(doc.session_count(), 0);
        // Document outlives its sessions
        assert!(store.get("doc").is_some());
    }

    #[tokio::test]
    async fn test_editor_update_applied_and_forwarded() {
        let store = DocumentStore::new();
        let writer =
            LiveSession::bind(&store, "doc", AccessGrant::editor("doc"), "w".into()).unwrap();
        let mut reader =
            LiveSession::bind(&store, "doc", AccessGrant::read_only("doc"), "r".into()).unwrap();

        let update = text_update("hi");
        assert!(writer
            .handle_frame(&update_message(&update))
            .await
            .unwrap()
            .is_none());

        assert_eq!(text_of(&writer.doc().encode().await), "hi");
        assert_eq!(
            reader.next_event().await,
            Some(Forward::Frame(update_frame(&update)))
        );
    }

    #[tokio::test]
    async fn test_read_only_update_dropped() {
        let store = DocumentStore::new();
        let reader =
            LiveSession::bind(&store, "doc", AccessGrant::read_only("doc"), "r".into()).unwrap();
        let before = reader.doc().encode().await;

        let reply = reader
            .handle_frame(&update_message(&text_update("sneaky")))
            .await
            .unwrap();
        assert!(reply.is_none());
        assert_eq!(reader.doc().encode().await, before);
    }

    #[tokio::test]
    async fn test_sync_step1_answered_with_diff() {
        let store = DocumentStore::new();
        let session =
            LiveSession::bind(&store, "doc", AccessGrant::read_only("doc"), "r".into()).unwrap();
        session
            .doc()
            .merge(&text_update("server"), None)
            .await
            .unwrap();

        let step1 = YMessage::Sync(SyncMessage::SyncStep1(StateVector::default())).encode_v1();
        let reply = session.handle_frame(&step1).await.unwrap().unwrap();

        match YMessage::decode_v1(&reply).unwrap() {
            YMessage::Sync(SyncMessage::SyncStep2(diff)) => assert_eq!(text_of(&diff), "server"),
            other => panic!("Expected sync step 2, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_greeting_is_sync_step1() {
        let store = DocumentStore::new();
        let session =
            LiveSession::bind(&store, "doc", AccessGrant::editor("doc"), "c".into()).unwrap();

        let greeting = session.greeting().await;
        assert!(matches!(
            YMessage::decode_v1(&greeting).unwrap(),
            YMessage::Sync(SyncMessage::SyncStep1(_))
        ));
    }

    #[tokio::test]
    async fn test_malformed_frame_is_error() {
        let store = DocumentStore::new();
        let session =
            LiveSession::bind(&store, "doc", AccessGrant::editor("doc"), "c".into()).unwrap();
        assert!(matches!(
            session.handle_frame(&[0xff, 0x00]).await,
            Err(LiveError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn test_own_updates_not_echoed_and_reset_closes() {
        let store = DocumentStore::new();
        let mut session = LiveSession::bind(
            &store,
            "doc",
            AccessGrant::new("doc", true, Some("alice".into())),
            "a".into(),
        )
        .unwrap();

        session
            .handle_frame(&update_message(&text_update("mine")))
            .await
            .unwrap();
        assert_eq!(store.reset("doc", Some("alice")), 1);

        // The own update is skipped; the reset comes through
        assert_eq!(session.next_event().await, Some(Forward::Close));
    }

    #[tokio::test]
    async fn test_poll_merge_reaches_live_session() {
        let store = DocumentStore::new();
        let mut session =
            LiveSession::bind(&store, "doc", AccessGrant::editor("doc"), "a".into()).unwrap();

        let update = text_update("from poll");
        store
            .merge(session.doc(), &update, None)
            .await
            .unwrap();

        assert_eq!(
            session.next_event().await,
            Some(Forward::Frame(update_frame(&update)))
        );
    }

    #[tokio::test]
    async fn test_lag_resync_survives_cancellation() {
        let store = DocumentStore::with_config(StoreConfig {
            broadcast_capacity: 1,
        });
        let mut session =
            LiveSession::bind(&store, "doc", AccessGrant::editor("doc"), "a".into()).unwrap();
        let doc = Arc::clone(session.doc());
        for part in ["one", "two", "three"] {
            doc.merge(&text_update(part), None).await.unwrap();
        }

        // The lag is noticed while the room is locked, then the call is dropped
        let guard = doc.lock_for_test().await;
        tokio::select! {
            biased;
            _ = session.next_event() => panic!("room lock is held"),
            _ = async {} => {}
        }
        drop(guard);

        let full_state = update_frame(&doc.encode().await);
        assert_eq!(session.next_event().await, Some(Forward::Frame(full_state)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_handle_frame_runs_on_spawned_task() {
        let store = DocumentStore::new();
        let session =
            LiveSession::bind(&store, "doc", AccessGrant::editor("doc"), "a".into()).unwrap();
        let doc = Arc::clone(session.doc());

        let frame = update_message(&text_update("spawned"));
        let reply = tokio::spawn(async move { session.handle_frame(&frame).await })
            .await
            .unwrap()
            .unwrap();

        assert!(reply.is_none());
        assert_eq!(text_of(&doc.encode().await), "spawned");
    }
}
