//! HTTP bodies for the poll and reset endpoints.

use serde::{Deserialize, Serialize};

/// Poll request body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollRequest {
    /// The client's full document state, base64 encoded.
    #[serde(rename = "yDoc64", default, skip_serializing_if = "Option::is_none")]
    pub y_doc64: Option<String>,
}

impl PollRequest {
    /// Create a request carrying a snapshot.
    #[must_use]
    pub fn new(y_doc64: impl Into<String>) -> Self {
        Self {
            y_doc64: Some(y_doc64.into()),
        }
    }
}

/// Poll response body.
///
/// `y_doc64` is absent when the client is already current or there is
/// nothing to synchronize against.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollResponse {
    /// Reconciled document state, base64 encoded.
    #[serde(rename = "yDoc64", default, skip_serializing_if = "Option::is_none")]
    pub y_doc64: Option<String>,
}

impl PollResponse {
    /// A response telling the client nothing changed.
    #[must_use]
    pub fn unchanged() -> Self {
        Self { y_doc64: None }
    }

    /// A response carrying a snapshot.
    #[must_use]
    pub fn snapshot(y_doc64: impl Into<String>) -> Self {
        Self {
            y_doc64: Some(y_doc64.into()),
        }
    }
}

/// Query string shared by the poll, reset and live endpoints.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoomQuery {
    /// Document room name.
    pub room: Option<String>,
}

impl RoomQuery {
    /// The room, if present and non-empty.
    #[must_use]
    pub fn room(&self) -> Option<&str> {
        self.room.as_deref().filter(|r| !r.is_empty())
    }
}

/// Reset endpoint response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetResponse {
    /// Number of live sessions told to close.
    pub closed: usize,
}
