//! The message envelope exchanged with kernels.

use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use uuid::Uuid;

use crate::content::{KernelContent, OutgoingContent};

/// Messaging protocol version stamped on every outgoing header.
pub const PROTOCOL_VERSION: &str = "5.3";

const USERNAME: &str = "kerneld";

/// Error type for encoding and decoding wire messages.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to decode {msg_type} content: {source}")]
    Content {
        msg_type: String,
        source: serde_json::Error,
    },
}

/// Which socket a message travels on.
///
/// IOPub and stdin traffic is multiplexed onto the shell socket by the
/// kernel-side proxy, so only two channels exist at this layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Shell,
    Control,
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Channel::Shell => write!(f, "shell"),
            Channel::Control => write!(f, "control"),
        }
    }
}

/// Message header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub msg_id: String,
    pub msg_type: String,
    #[serde(default)]
    pub session: String,
    #[serde(default, deserialize_with = "nullable_string")]
    pub username: String,
    #[serde(default, deserialize_with = "nullable_string")]
    pub version: String,
    #[serde(default, deserialize_with = "nullable_string")]
    pub date: String,
}

impl Header {
    /// Create a header with a fresh random `msg_id` and the current time.
    pub fn new(msg_type: impl Into<String>, session: impl Into<String>) -> Self {
        Self {
            msg_id: Uuid::new_v4().to_string(),
            msg_type: msg_type.into(),
            session: session.into(),
            username: USERNAME.to_string(),
            version: PROTOCOL_VERSION.to_string(),
            date: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }

    /// The header date, falling back to "now" when the kernel sent none or
    /// an unparseable value.
    pub fn timestamp(&self) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(&self.date)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now())
    }
}

fn nullable_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// `parent_header` is `{}` (or occasionally `null`) when a message answers
/// nothing.
fn deserialize_parent_header<'de, D>(deserializer: D) -> Result<Option<Header>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) if map.is_empty() => Ok(None),
        Some(value) => serde_json::from_value(value)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

fn serialize_parent_header<S>(parent: &Option<Header>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match parent {
        Some(header) => header.serialize(serializer),
        None => serde_json::Map::new().serialize(serializer),
    }
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

/// A complete wire message.
///
/// `content` stays raw JSON here so per-kernel normalization can run on the
/// tree before it is decoded into a [`KernelContent`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    pub header: Header,

    #[serde(
        default,
        serialize_with = "serialize_parent_header",
        deserialize_with = "deserialize_parent_header"
    )]
    pub parent_header: Option<Header>,

    #[serde(default = "empty_object")]
    pub metadata: Value,

    #[serde(default = "empty_object")]
    pub content: Value,

    #[serde(default, with = "crate::buffers", skip_serializing_if = "Vec::is_empty")]
    pub buffers: Vec<Bytes>,
}

impl WireMessage {
    /// Build an outgoing message from a typed payload.
    pub fn request<C: OutgoingContent>(payload: &C, session: &str) -> Result<Self, WireError> {
        Ok(Self {
            header: Header::new(C::MSG_TYPE, session),
            parent_header: None,
            metadata: empty_object(),
            content: serde_json::to_value(payload)?,
            buffers: Vec::new(),
        })
    }

    /// Replace the generated `msg_id` (used when the caller owns the id,
    /// e.g. execution ids).
    pub fn with_msg_id(mut self, msg_id: impl Into<String>) -> Self {
        self.header.msg_id = msg_id.into();
        self
    }

    pub fn with_parent(mut self, parent: Header) -> Self {
        self.parent_header = Some(parent);
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn msg_id(&self) -> &str {
        &self.header.msg_id
    }

    pub fn msg_type(&self) -> &str {
        &self.header.msg_type
    }

    /// The `msg_id` of the request this message answers, if any.
    pub fn parent_msg_id(&self) -> Option<&str> {
        self.parent_header.as_ref().map(|h| h.msg_id.as_str())
    }

    /// Decode `content` according to `header.msg_type`.
    pub fn decode(&self) -> Result<KernelContent, WireError> {
        KernelContent::decode(&self.header.msg_type, self.content.clone())
    }

    pub fn to_text(&self) -> Result<String, WireError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_text(text: &str) -> Result<Self, WireError> {
        Ok(serde_json::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::{ExecuteRequest, KernelInfoRequest};

    const STATUS_FROM_KERNEL: &str = r#"
    {
        "header": {
            "date": "2025-05-14T14:32:23.490Z",
            "msg_id": "k-1",
            "msg_type": "status",
            "session": "kernel-session",
            "username": "",
            "version": "5.3"
        },
        "parent_header": {
            "date": "2025-05-14T14:32:23.100Z",
            "msg_id": "e1",
            "msg_type": "execute_request",
            "session": "client-session",
            "username": "kerneld",
            "version": "5.3"
        },
        "metadata": {},
        "content": {"execution_state": "idle"}
    }
    "#;

    #[test]
    fn test_empty_parent_header_is_none() {
        let text = r#"{
            "header": {"msg_id": "a", "msg_type": "status", "session": "s",
                       "username": "", "version": "5.3", "date": ""},
            "parent_header": {},
            "metadata": {},
            "content": {"execution_state": "busy"}
        }"#;
        let msg = WireMessage::from_text(text).unwrap();
        assert!(msg.parent_header.is_none());
        assert!(msg.parent_msg_id().is_none());
    }

    #[test]
    fn test_null_parent_header_and_date() {
        let text = r#"{
            "header": {"msg_id": "a", "msg_type": "status", "session": "s",
                       "username": null, "version": "5.3", "date": null},
            "parent_header": null,
            "content": {"execution_state": "busy"}
        }"#;
        let msg = WireMessage::from_text(text).unwrap();
        assert!(msg.parent_header.is_none());
        assert_eq!(msg.header.date, "");
        assert!(msg.metadata.is_object());
    }

    #[test]
    fn test_parent_msg_id() {
        let msg = WireMessage::from_text(STATUS_FROM_KERNEL).unwrap();
        assert_eq!(msg.parent_msg_id(), Some("e1"));
        assert_eq!(msg.msg_type(), "status");
        assert_eq!(
            msg.header.timestamp().to_rfc3339_opts(SecondsFormat::Millis, true),
            "2025-05-14T14:32:23.490Z"
        );
    }

    #[test]
    fn test_outgoing_envelope_shape() {
        let msg = WireMessage::request(&KernelInfoRequest {}, "client-session").unwrap();
        let value: Value = serde_json::from_str(&msg.to_text().unwrap()).unwrap();

        assert_eq!(value["header"]["msg_type"], "kernel_info_request");
        assert_eq!(value["header"]["session"], "client-session");
        assert_eq!(value["header"]["version"], PROTOCOL_VERSION);
        assert_eq!(value["header"]["username"], "kerneld");
        assert!(value["header"]["date"].as_str().unwrap().ends_with('Z'));
        assert_eq!(value["parent_header"], serde_json::json!({}));
        assert_eq!(value["metadata"], serde_json::json!({}));
        assert_eq!(value["content"], serde_json::json!({}));
        // No buffers key when there are none
        assert!(value.get("buffers").is_none());
    }

    #[test]
    fn test_caller_owned_msg_id() {
        let msg = WireMessage::request(&ExecuteRequest::new("1+1"), "s")
            .unwrap()
            .with_msg_id("e1");
        assert_eq!(msg.msg_id(), "e1");
        assert_eq!(msg.content["code"], "1+1");
    }

    #[test]
    fn test_reply_carries_parent() {
        let parent = Header::new("input_request", "kernel-session");
        let msg = WireMessage::request(&KernelInfoRequest {}, "client-session")
            .unwrap()
            .with_parent(parent.clone());
        let back = WireMessage::from_text(&msg.to_text().unwrap()).unwrap();
        assert_eq!(back.parent_header, Some(parent));
    }

    #[test]
    fn test_fresh_ids_are_distinct() {
        let a = Header::new("x", "s");
        let b = Header::new("x", "s");
        assert_ne!(a.msg_id, b.msg_id);
    }
}
