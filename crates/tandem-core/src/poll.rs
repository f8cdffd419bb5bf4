//! Poll reconciliation.
//!
//! Socketless clients post their whole local state and get back whatever the
//! server holds after reconciling it. The rules, in order:
//!
//! | document | snapshot vs server | grant     | result                           |
//! |----------|--------------------|-----------|----------------------------------|
//! | exists   | identical          | any       | unchanged                        |
//! | exists   | differs            | editor    | merge, return merged state       |
//! | exists   | differs            | read-only | return server state, no merge    |
//! | missing  | any                | editor    | create (poll origin), merge      |
//! | missing  | any                | read-only | unchanged                        |
//!
//! A snapshot that does not decode is never merged and never creates a
//! document.

use crate::access::AccessGrant;
use crate::document::{decode_update, DocOrigin, SharedDoc};
use crate::store::DocumentStore;
use tandem_protocol::{decode_base64, encode_base64, PollRequest, PollResponse, RoomQuery};
use thiserror::Error;
use tracing::{debug, warn};

/// Request-level errors shared by the HTTP gateways.
#[derive(Debug, Error)]
pub enum PollError {
    /// The `room` query parameter is absent or empty.
    #[error("Missing room parameter")]
    MissingRoom,
}

/// Extract the room from a query.
///
/// # Errors
///
/// Returns [`PollError::MissingRoom`] if it is absent or empty.
pub fn require_room(query: &RoomQuery) -> Result<&str, PollError> {
    query.room().ok_or(PollError::MissingRoom)
}

/// What a poll did to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// The client is current, or there was nothing to sync against.
    Unchanged,
    /// Server state returned without merging.
    Returned,
    /// Snapshot merged into an existing document.
    Merged,
    /// Document created from the snapshot.
    Created,
}

/// Result of a poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciled {
    /// What happened.
    pub outcome: PollOutcome,
    /// Body to send back.
    pub response: PollResponse,
}

impl Reconciled {
    fn unchanged() -> Self {
        Self {
            outcome: PollOutcome::Unchanged,
            response: PollResponse::unchanged(),
        }
    }

    async fn with_state(outcome: PollOutcome, doc: &SharedDoc) -> Self {
        Self {
            outcome,
            response: PollResponse::snapshot(encode_base64(&doc.encode().await)),
        }
    }
}

/// Decode a base64 snapshot and check it is a valid update, logging why it
/// was refused. The decoded update itself is dropped before any merge awaits.
fn decode_snapshot(room: &str, snapshot: &str) -> Option<Vec<u8>> {
    let raw = match decode_base64(snapshot) {
        Ok(raw) => raw,
        Err(e) => {
            warn!(room = %room, error = %e, "Discarding undecodable snapshot");
            return None;
        }
    };
    match decode_update(&raw) {
        Ok(_) => Some(raw),
        Err(e) => {
            warn!(room = %room, error = %e, "Discarding undecodable snapshot");
            None
        }
    }
}

/// Reconcile a client snapshot with the room's document.
pub async fn reconcile(
    store: &DocumentStore,
    grant: &AccessGrant,
    request: &PollRequest,
) -> Reconciled {
    let room = grant.room.as_str();
    let snapshot = request.y_doc64.as_deref().filter(|s| !s.is_empty());

    let Some(doc) = store.get(room) else {
        if grant.is_read_only() {
            debug!(room = %room, "Read-only poll for missing document");
            return Reconciled::unchanged();
        }
        let Some(raw) = snapshot.and_then(|s| decode_snapshot(room, s)) else {
            return Reconciled::unchanged();
        };

        let (doc, created) = store.get_or_create_with(room, DocOrigin::Poll);
        if let Err(e) = doc.merge(&raw, None).await {
            warn!(room = %room, error = %e, "Failed to merge poll snapshot");
        }
        let outcome = if created {
            debug!(room = %room, user = ?grant.user_id, "Document created by poll");
            PollOutcome::Created
        } else {
            PollOutcome::Merged
        };
        return Reconciled::with_state(outcome, &doc).await;
    };

    let Some(snapshot) = snapshot else {
        return Reconciled::with_state(PollOutcome::Returned, &doc).await;
    };
    if store.same_state(&doc, snapshot).await {
        return Reconciled::unchanged();
    }
    if grant.is_read_only() {
        debug!(room = %room, "Read-only poll, returning server state unmerged");
        return Reconciled::with_state(PollOutcome::Returned, &doc).await;
    }

    let Some(raw) = decode_snapshot(room, snapshot) else {
        return Reconciled::with_state(PollOutcome::Returned, &doc).await;
    };
    match doc.merge(&raw, None).await {
        Ok(()) => Reconciled::with_state(PollOutcome::Merged, &doc).await,
        Err(e) => {
            warn!(room = %room, error = %e, "Failed to merge poll snapshot");
            Reconciled::with_state(PollOutcome::Returned, &doc).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{text_of, text_update};
    use std::sync::Arc;

    fn snapshot_of(content: &str) -> PollRequest {
        PollRequest::new(encode_base64(&text_update(content)))
    }

    fn content_of(response: &PollResponse) -> String {
        let raw = decode_base64(response.y_doc64.as_deref().unwrap()).unwrap();
        text_of(&raw)
    }

    #[test]
    fn test_require_room() {
        let missing = RoomQuery { room: None };
        let empty = RoomQuery {
            room: Some(String::new()),
        };
        let present = RoomQuery {
            room: Some("doc".into()),
        };

        assert!(matches!(require_room(&missing), Err(PollError::MissingRoom)));
        assert!(matches!(require_room(&empty), Err(PollError::MissingRoom)));
        assert_eq!(require_room(&present).unwrap(), "doc");
    }

    #[tokio::test]
    async fn test_first_writer_creates_document() {
        let store = DocumentStore::new();
        let result = reconcile(&store, &AccessGrant::editor("d"), &snapshot_of("first")).await;

        assert_eq!(result.outcome, PollOutcome::Created);
        assert_eq!(content_of(&result.response), "first");
        assert_eq!(store.get("d").unwrap().origin(), DocOrigin::Poll);
    }

    #[tokio::test]
    async fn test_read_only_never_creates() {
        let store = DocumentStore::new();
        let result = reconcile(&store, &AccessGrant::read_only("d"), &snapshot_of("x")).await;

        assert_eq!(result, Reconciled::unchanged());
        assert!(store.get("d").is_none());
    }

    #[tokio::test]
    async fn test_read_only_returns_server_state_unmerged() {
        let store = DocumentStore::new();
        let doc = store.get_or_create("d");
        doc.merge(&text_update("server"), None).await.unwrap();
        let before = doc.encode().await;

        let result = reconcile(&store, &AccessGrant::read_only("d"), &snapshot_of("client")).await;

        assert_eq!(result.outcome, PollOutcome::Returned);
        assert_eq!(content_of(&result.response), "server");
        assert_eq!(doc.encode().await, before);
    }

    #[tokio::test]
    async fn test_editor_merges_into_existing() {
        let store = DocumentStore::new();
        let doc = store.get_or_create("d");
        doc.merge(&text_update("server"), None).await.unwrap();

        let result = reconcile(&store, &AccessGrant::editor("d"), &snapshot_of("client")).await;

        assert_eq!(result.outcome, PollOutcome::Merged);
        let merged = content_of(&result.response);
        assert!(merged.contains("server"));
        assert!(merged.contains("client"));
    }

    #[tokio::test]
    async fn test_identical_snapshot_is_unchanged() {
        let store = DocumentStore::new();
        let doc = store.get_or_create("d");
        doc.merge(&text_update("same"), None).await.unwrap();

        let request = PollRequest::new(encode_base64(&doc.encode().await));
        let result = reconcile(&store, &AccessGrant::editor("d"), &request).await;
        assert_eq!(result, Reconciled::unchanged());
    }

    #[tokio::test]
    async fn test_undecodable_snapshot_never_creates() {
        let store = DocumentStore::new();
        let result = reconcile(
            &store,
            &AccessGrant::editor("d"),
            &PollRequest::new("not base64 at all!"),
        )
        .await;
        assert_eq!(result, Reconciled::unchanged());

        let garbage = PollRequest::new(encode_base64(&[0xff, 0xff, 0xff]));
        let result = reconcile(&store, &AccessGrant::editor("d"), &garbage).await;
        assert_eq!(result, Reconciled::unchanged());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_undecodable_snapshot_leaves_document() {
        let store = DocumentStore::new();
        let doc = store.get_or_create("d");
        doc.merge(&text_update("kept"), None).await.unwrap();
        let before = doc.encode().await;

        let garbage = PollRequest::new(encode_base64(&[0xff, 0xff, 0xff]));
        let result = reconcile(&store, &AccessGrant::editor("d"), &garbage).await;

        assert_eq!(result.outcome, PollOutcome::Returned);
        assert_eq!(doc.encode().await, before);
    }

    #[tokio::test]
    async fn test_missing_snapshot() {
        let store = DocumentStore::new();
        let empty = PollRequest::default();
        assert_eq!(
            reconcile(&store, &AccessGrant::editor("d"), &empty).await,
            Reconciled::unchanged()
        );
        assert!(store.is_empty());

        store.get_or_create("d");
        let result = reconcile(&store, &AccessGrant::read_only("d"), &empty).await;
        assert_eq!(result.outcome, PollOutcome::Returned);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reconcile_runs_on_spawned_tasks() {
        let store = Arc::new(DocumentStore::new());
        let tasks: Vec<_> = ["one;", "two;"]
            .into_iter()
            .map(|content| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    reconcile(&store, &AccessGrant::editor("d"), &snapshot_of(content)).await
                })
            })
            .collect();
        for task in tasks {
            let result = task.await.unwrap();
            assert!(matches!(
                result.outcome,
                PollOutcome::Created | PollOutcome::Merged
            ));
        }

        let merged = text_of(&store.get("d").unwrap().encode().await);
        assert!(merged.contains("one;"));
        assert!(merged.contains("two;"));
    }

    #[tokio::test]
    async fn test_poll_merge_broadcast_to_live_sessions() {
        let store = DocumentStore::new();
        let doc = store.get_or_create("d");
        let mut rx = doc.subscribe();

        reconcile(&store, &AccessGrant::editor("d"), &snapshot_of("offline")).await;
        assert!(rx.try_recv().is_ok());
    }
}
