//! # tandem-protocol
//!
//! Wire definitions for the Tandem collaboration core.
//!
//! ## Surfaces
//!
//! - **Signaling** - JSON frames exchanged with the WebRTC relay
//! - **Poll** - JSON bodies for the HTTP sync fallback and room reset
//! - **Headers** - Permission headers set by the upstream auth layer
//!
//! ## Example
//!
//! ```rust
//! use tandem_protocol::SignalingMessage;
//!
//! let msg = SignalingMessage::parse(r#"{"type":"subscribe","topics":["room-42"]}"#).unwrap();
//! assert_eq!(msg, SignalingMessage::subscribe(["room-42"]));
//! ```

pub mod codec;
pub mod headers;
pub mod poll;
pub mod signaling;

pub use codec::{decode_base64, encode_base64, ProtocolError};
pub use poll::{PollRequest, PollResponse, ResetResponse, RoomQuery};
pub use signaling::{MessageKind, SignalingMessage};
