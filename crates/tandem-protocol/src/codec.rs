//! Codec helpers shared by the gateways.
//!
//! CRDT payloads travel as raw bytes on the live socket and as standard
//! base64 inside JSON bodies on the poll endpoint.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use thiserror::Error;

/// Maximum accepted size of a decoded CRDT snapshot (16 MiB).
pub const MAX_SNAPSHOT_SIZE: usize = 16 * 1024 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Snapshot exceeds maximum size.
    #[error("Snapshot size {0} exceeds maximum {MAX_SNAPSHOT_SIZE}")]
    SnapshotTooLarge(usize),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Base64 decoding error.
    #[error("Base64 error: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// Encode bytes as standard base64.
#[must_use]
pub fn encode_base64(data: &[u8]) -> String {
    STANDARD.encode(data)
}

/// Decode a standard base64 string.
///
/// # Errors
///
/// Returns an error if the input is not valid base64 or decodes to more than
/// [`MAX_SNAPSHOT_SIZE`] bytes.
pub fn decode_base64(data: &str) -> Result<Vec<u8>, ProtocolError> {
    // Four base64 characters carry three bytes.
    let estimated = data.len() / 4 * 3;
    if estimated > MAX_SNAPSHOT_SIZE {
        return Err(ProtocolError::SnapshotTooLarge(estimated));
    }
    Ok(STANDARD.decode(data.trim())?)
}
