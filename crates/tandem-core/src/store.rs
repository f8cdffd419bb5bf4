//! In-memory registry of live documents.
//!
//! The store is the only place a [`SharedDoc`] is created, which keeps the
//! one-document-per-room invariant: concurrent first access to a room
//! resolves to the same instance.

use crate::connection::ConnectionId;
use crate::document::{DocOrigin, SharedDoc, StoreError, DEFAULT_BROADCAST_CAPACITY};
use dashmap::DashMap;
use std::sync::Arc;
use tandem_protocol::encode_base64;
use tracing::{debug, info};

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Per-room broadcast capacity for live sessions.
    pub broadcast_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: DEFAULT_BROADCAST_CAPACITY,
        }
    }
}

/// Registry of live documents keyed by room name.
pub struct DocumentStore {
    docs: DashMap<String, Arc<SharedDoc>>,
    config: StoreConfig,
}

impl DocumentStore {
    /// Create a store with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(StoreConfig::default())
    }

    /// Create a store with custom configuration.
    #[must_use]
    pub fn with_config(config: StoreConfig) -> Self {
        info!("Creating document store with config: {:?}", config);
        Self {
            docs: DashMap::new(),
            config,
        }
    }

    /// Get the document for `room`, creating it for a live session if needed.
    pub fn get_or_create(&self, room: &str) -> Arc<SharedDoc> {
        self.get_or_create_with(room, DocOrigin::Live).0
    }

    /// Get the document for `room`, creating it with `origin` if needed.
    ///
    /// The flag is `true` if this call created the document.
    pub fn get_or_create_with(&self, room: &str, origin: DocOrigin) -> (Arc<SharedDoc>, bool) {
        let mut created = false;
        let doc = self
            .docs
            .entry(room.to_string())
            .or_insert_with(|| {
                created = true;
                debug!(room = %room, origin = ?origin, "Creating document");
                Arc::new(SharedDoc::new(room, origin, self.config.broadcast_capacity))
            })
            .clone();
        (doc, created)
    }

    /// Get the document for `room` if it exists.
    #[must_use]
    pub fn get(&self, room: &str) -> Option<Arc<SharedDoc>> {
        self.docs.get(room).map(|d| Arc::clone(d.value()))
    }

    /// Encode a document's full state.
    pub async fn encode(&self, doc: &SharedDoc) -> Vec<u8> {
        doc.encode().await
    }

    /// Merge remote bytes into a document.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a valid update; the document is
    /// left untouched.
    pub async fn merge(
        &self,
        doc: &SharedDoc,
        remote: &[u8],
        origin: Option<&ConnectionId>,
    ) -> Result<(), StoreError> {
        doc.merge(remote, origin).await
    }

    /// Check whether a base64 snapshot is exactly the document's current
    /// encoded state.
    pub async fn same_state(&self, doc: &SharedDoc, snapshot: &str) -> bool {
        encode_base64(&doc.encode().await) == snapshot.trim()
    }

    /// Visit every document.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&str, &Arc<SharedDoc>),
    {
        for entry in self.docs.iter() {
            f(entry.key(), entry.value());
        }
    }

    /// Ask the live sessions of `room` to close, optionally only those of
    /// one user. Returns how many sessions were told; unknown rooms yield 0.
    pub fn reset(&self, room: &str, user_id: Option<&str>) -> usize {
        self.get(room).map(|doc| doc.reset(user_id)).unwrap_or(0)
    }

    /// Number of documents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.docs.len()
    }

    /// Check if the store holds no documents.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Get store statistics.
    #[must_use]
    pub fn stats(&self) -> StoreStats {
        let mut stats = StoreStats::default();
        self.for_each(|_, doc| {
            stats.document_count += 1;
            stats.session_count += doc.session_count();
        });
        stats
    }
}

impl Default for DocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Store statistics.
#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    /// Number of live documents.
    pub document_count: usize,
    /// Number of attached live sessions.
    pub session_count: usize,
}
