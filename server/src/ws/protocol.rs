//! JSON wire envelope shared by client and server.
//!
//! One envelope per WebSocket text frame, tagged by its `type` field.

use axum::extract::ws::Message;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Envelope kinds understood on the wire.
pub const KNOWN_KINDS: &[&str] = &["heartbeat", "chat", "file", "error", "notification"];

/// A chat text message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub username: String,
    /// Recipient username, or the broadcast sentinel. Absent means broadcast.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub content: String,
}

/// A reference to a file already uploaded through the file service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMessage {
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(alias = "fileId")]
    pub file_id: String,
    #[serde(alias = "fileName")]
    pub file_name: String,
    #[serde(default, alias = "fileSize", skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(default, alias = "contentType", skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationEvent {
    Join,
    Leave,
}

/// Server-originated presence notice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub event: NotificationEvent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Number of identified users online when the notice was produced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub online: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Envelope {
    Heartbeat {
        /// Milliseconds since the Unix epoch, set on server probes.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<i64>,
    },
    Chat(ChatMessage),
    File(FileMessage),
    Error {
        message: String,
    },
    Notification(Notification),
}

impl Envelope {
    /// Wire name of this envelope's kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Heartbeat { .. } => "heartbeat",
            Self::Chat(_) => "chat",
            Self::File(_) => "file",
            Self::Error { .. } => "error",
            Self::Notification(_) => "notification",
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Heartbeat probe stamped with the current wall-clock time.
    pub fn heartbeat_now() -> Self {
        Self::Heartbeat {
            timestamp: Some(chrono::Utc::now().timestamp_millis()),
        }
    }
}

/// Why an inbound frame could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed JSON: {0}")]
    Malformed(String),
    #[error("missing field `type`")]
    MissingType,
    #[error("unknown message type `{0}`")]
    UnknownKind(String),
    #[error("invalid `{kind}` message: {reason}")]
    InvalidPayload { kind: String, reason: String },
    #[error("failed to encode envelope: {0}")]
    Encode(String),
}

/// Decode one text frame into an envelope.
///
/// The `type` tag is inspected first so an unknown kind is reported as such
/// instead of as a generic deserialization failure.
pub fn decode(text: &str) -> Result<Envelope, ProtocolError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

    let kind = match value.get("type") {
        Some(Value::String(kind)) => kind.clone(),
        Some(_) | None => return Err(ProtocolError::MissingType),
    };
    if !KNOWN_KINDS.contains(&kind.as_str()) {
        return Err(ProtocolError::UnknownKind(kind));
    }

    serde_json::from_value(value).map_err(|e| ProtocolError::InvalidPayload {
        kind,
        reason: e.to_string(),
    })
}

pub fn encode(envelope: &Envelope) -> Result<String, ProtocolError> {
    serde_json::to_string(envelope).map_err(|e| ProtocolError::Encode(e.to_string()))
}

/// Encode an envelope as a WebSocket text frame.
pub fn encode_frame(envelope: &Envelope) -> Result<Message, ProtocolError> {
    encode(envelope).map(|text| Message::Text(text.into()))
}
