//! Signaling frames for the WebRTC relay.
//!
//! Frames are JSON objects discriminated by their `type` field. The relay
//! decodes each inbound text frame once into a [`SignalingMessage`]; anything
//! that does not decode is dropped by the caller without closing the socket.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::codec::ProtocolError;

/// Key the relay injects into every relayed publish frame.
pub const CLIENTS_FIELD: &str = "clients";

/// Signaling message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Subscribe,
    Unsubscribe,
    Publish,
    Ping,
    Pong,
}

impl MessageKind {
    /// Wire name used in the `type` field.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Subscribe => "subscribe",
            MessageKind::Unsubscribe => "unsubscribe",
            MessageKind::Publish => "publish",
            MessageKind::Ping => "ping",
            MessageKind::Pong => "pong",
        }
    }
}

/// A signaling frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalingMessage {
    /// Join one or more topics.
    Subscribe {
        /// Topic names.
        #[serde(default)]
        topics: Vec<String>,
    },

    /// Leave one or more topics.
    Unsubscribe {
        /// Topic names.
        #[serde(default)]
        topics: Vec<String>,
    },

    /// Relay an opaque payload to the other members of a topic.
    Publish {
        /// Target topic.
        topic: String,
        /// Every other field of the frame, relayed untouched.
        #[serde(flatten)]
        payload: Map<String, Value>,
    },

    /// Application-level keepalive.
    Ping,

    /// Reply to [`SignalingMessage::Ping`].
    Pong,
}

impl SignalingMessage {
    /// Decode a text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is not JSON or names an unknown type.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::Json)
    }

    /// Get the message kind.
    #[must_use]
    pub fn kind(&self) -> MessageKind {
        match self {
            SignalingMessage::Subscribe { .. } => MessageKind::Subscribe,
            SignalingMessage::Unsubscribe { .. } => MessageKind::Unsubscribe,
            SignalingMessage::Publish { .. } => MessageKind::Publish,
            SignalingMessage::Ping => MessageKind::Ping,
            SignalingMessage::Pong => MessageKind::Pong,
        }
    }

    /// Create a subscribe frame.
    #[must_use]
    pub fn subscribe<I, S>(topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        SignalingMessage::Subscribe {
            topics: topics.into_iter().map(Into::into).collect(),
        }
    }

    /// Create an unsubscribe frame.
    #[must_use]
    pub fn unsubscribe<I, S>(topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        SignalingMessage::Unsubscribe {
            topics: topics.into_iter().map(Into::into).collect(),
        }
    }

    /// Create a publish frame.
    #[must_use]
    pub fn publish(topic: impl Into<String>, payload: Map<String, Value>) -> Self {
        SignalingMessage::Publish {
            topic: topic.into(),
            payload,
        }
    }

    /// Encode this frame as JSON text.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_text(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Json)
    }
}

/// Build the frame delivered to topic members for a publish.
///
/// The relayed object carries the sender's fields untouched plus the current
/// topic size under [`CLIENTS_FIELD`].
#[must_use]
pub fn relay_frame(topic: &str, payload: &Map<String, Value>, clients: usize) -> Value {
    let mut frame = Map::with_capacity(payload.len() + 3);
    frame.insert(
        "type".to_string(),
        Value::String(MessageKind::Publish.as_str().to_string()),
    );
    frame.insert("topic".to_string(), Value::String(topic.to_string()));
    for (key, value) in payload {
        if key != "type" && key != "topic" {
            frame.insert(key.clone(), value.clone());
        }
    }
    frame.insert(CLIENTS_FIELD.to_string(), Value::from(clients));
    Value::Object(frame)
}

/// The `{"type":"pong"}` reply frame.
#[must_use]
pub fn pong_frame() -> String {
    format!(r#"{{"type":"{}"}}"#, MessageKind::Pong.as_str())
}
