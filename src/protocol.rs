//! Hub protocol messages and wire encoding.
//!
//! Messages travel as JSON objects inside length-delimited frames (a u32
//! big-endian length prefix, `tokio_util::codec::LengthDelimitedCodec`).
//! Every payload carries a `"kind"` field naming the message type; the
//! remaining fields are kind-specific.
//!
//! An unrecognized kind decodes to [`Message::Unknown`] — it is a dispatch
//! case for the application layer, not a decode failure. Only malformed
//! JSON or a missing/ill-typed `kind` is a [`ProtocolError`].

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Category attached to locally synthesized status notifications.
///
/// Remote notifications carry an application-supplied `urgency` instead;
/// the presence of a category marks an item as connection status rather
/// than a genuine hub notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    /// A protocol or transport problem.
    Error,
    /// The hub connection was established.
    Connected,
    /// The hub connection was closed.
    Disconnected,
}

impl Category {
    /// String form used in the wire payload and in output records.
    pub fn as_str(self) -> &'static str {
        match self {
            Category::Error => "error",
            Category::Connected => "connected",
            Category::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Fields of a `notify` message.
///
/// Shared by remote notifications and locally synthesized status events;
/// the two are distinguished by `category` (local) versus `urgency`
/// (remote).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Notification identifier (local status events reuse the app id).
    #[serde(default)]
    pub id: String,
    /// Name of the application the notification concerns.
    #[serde(default)]
    pub app_name: String,
    /// One-line summary.
    #[serde(default)]
    pub summary: String,
    /// Longer body text.
    #[serde(default)]
    pub body: String,
    /// Status category, present only on locally synthesized events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<Category>,
    /// Application-supplied urgency, present only on remote notifications.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urgency: Option<u8>,
}

/// A typed hub protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Client → hub: subscribe to the notification stream.
    Subscribe {
        /// Name the client presents for itself.
        app_name: String,
        /// Unique id the client presents for itself.
        app_id: String,
    },
    /// Hub → client: the subscription is active.
    Subscribed,
    /// A notification, remote or locally synthesized.
    Notify(Notification),
    /// Hub → client: the hub reports a protocol error.
    Error {
        /// Hub-supplied reason text.
        reason: String,
    },
    /// Either side: orderly end of the conversation.
    Goodbye,
    /// A well-formed payload with a kind this client does not recognize.
    Unknown {
        /// The unrecognized kind string.
        kind: String,
    },
}

impl Message {
    /// The kind string this message carries on the wire.
    pub fn kind(&self) -> &str {
        match self {
            Message::Subscribe { .. } => "subscribe",
            Message::Subscribed => "subscribed",
            Message::Notify(_) => "notify",
            Message::Error { .. } => "error",
            Message::Goodbye => "goodbye",
            Message::Unknown { kind } => kind,
        }
    }
}

/// Error decoding or encoding a protocol message.
#[derive(Debug)]
pub enum ProtocolError {
    /// The frame payload was not a JSON object with a string `kind`.
    Malformed(String),
    /// A recognized kind was missing required fields.
    BadFields {
        /// Kind of the offending message.
        kind: String,
        /// Decode error text.
        detail: String,
    },
    /// The message could not be serialized.
    Encode(String),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed(detail) => write!(f, "malformed message: {detail}"),
            Self::BadFields { kind, detail } => {
                write!(f, "bad fields in '{kind}' message: {detail}")
            }
            Self::Encode(detail) => write!(f, "could not encode message: {detail}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl Message {
    /// Encode this message as a frame payload.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Encode`] if serialization fails (or when
    /// asked to encode an [`Message::Unknown`], which has no wire form).
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let value = match self {
            Message::Subscribe { app_name, app_id } => serde_json::json!({
                "kind": "subscribe",
                "app_name": app_name,
                "app_id": app_id,
            }),
            Message::Subscribed => serde_json::json!({ "kind": "subscribed" }),
            Message::Notify(notification) => {
                let mut value = serde_json::to_value(notification)
                    .map_err(|e| ProtocolError::Encode(e.to_string()))?;
                if let Value::Object(map) = &mut value {
                    map.insert("kind".to_string(), Value::from("notify"));
                }
                value
            }
            Message::Error { reason } => serde_json::json!({
                "kind": "error",
                "reason": reason,
            }),
            Message::Goodbye => serde_json::json!({ "kind": "goodbye" }),
            Message::Unknown { kind } => {
                return Err(ProtocolError::Encode(format!(
                    "unknown message kind '{kind}' has no wire form"
                )));
            }
        };

        let bytes = serde_json::to_vec(&value).map_err(|e| ProtocolError::Encode(e.to_string()))?;
        Ok(Bytes::from(bytes))
    }

    /// Decode a frame payload into a typed message.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Malformed`] for payloads that are not a
    /// JSON object with a string `kind`, and [`ProtocolError::BadFields`]
    /// when a recognized kind is missing required fields. Unrecognized
    /// kinds decode successfully to [`Message::Unknown`].
    pub fn decode(payload: &[u8]) -> Result<Message, ProtocolError> {
        let value: Value = serde_json::from_slice(payload)
            .map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        let obj = value
            .as_object()
            .ok_or_else(|| ProtocolError::Malformed("payload is not an object".to_string()))?;

        let kind = obj
            .get("kind")
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::Malformed("missing 'kind' field".to_string()))?;

        let bad_fields = |kind: &str, detail: String| ProtocolError::BadFields {
            kind: kind.to_string(),
            detail,
        };

        let field_str = |name: &str| -> Result<String, ProtocolError> {
            obj.get(name)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| bad_fields(kind, format!("missing '{name}'")))
        };

        match kind {
            "subscribe" => Ok(Message::Subscribe {
                app_name: field_str("app_name")?,
                app_id: field_str("app_id")?,
            }),
            "subscribed" => Ok(Message::Subscribed),
            "notify" => {
                let notification: Notification = serde_json::from_value(value.clone())
                    .map_err(|e| bad_fields("notify", e.to_string()))?;
                Ok(Message::Notify(notification))
            }
            "error" => Ok(Message::Error {
                reason: field_str("reason")?,
            }),
            "goodbye" => Ok(Message::Goodbye),
            other => Ok(Message::Unknown {
                kind: other.to_string(),
            }),
        }
    }
}
