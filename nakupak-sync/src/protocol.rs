//! Realtime wire protocol.
//!
//! The server pushes JSON text frames shaped `{"type": "...", "data": {...}}`.
//! Frames are invalidation signals only; `data` is never treated as state.
//!
//! ```text
//! {"type": "list_updated", "data": {}}   → refetch the shopping list
//! {"type": "<anything else>", ...}       → ignored (forward compatible)
//! ```

use serde::{Deserialize, Serialize};

/// Wire tag of the list invalidation event.
pub const LIST_UPDATED: &str = "list_updated";

/// Inbound realtime event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// The shared shopping list changed on the server
    ListUpdated,
    /// An event type this client does not handle
    Unknown(String),
}

#[derive(Debug, Serialize, Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
}

impl ServerEvent {
    /// Parse a text frame.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let raw: RawEvent = serde_json::from_str(text)
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(match raw.kind.as_str() {
            LIST_UPDATED => ServerEvent::ListUpdated,
            _ => ServerEvent::Unknown(raw.kind),
        })
    }

    /// Wire tag of this event.
    pub fn kind(&self) -> &str {
        match self {
            ServerEvent::ListUpdated => LIST_UPDATED,
            ServerEvent::Unknown(kind) => kind,
        }
    }

    /// Whether subscribers should refetch in response.
    pub fn is_invalidation(&self) -> bool {
        matches!(self, ServerEvent::ListUpdated)
    }

    /// Encode as a text frame, the way the server sends it.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        let raw = RawEvent {
            kind: self.kind().to_string(),
            data: serde_json::Value::Object(serde_json::Map::new()),
        };
        serde_json::to_string(&raw).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}
