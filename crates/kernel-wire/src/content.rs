//! Typed message content.
//!
//! Incoming content is decoded once at the transport boundary into
//! [`KernelContent`]; everything past that point matches on the enum rather
//! than on `msg_type` strings. Outgoing requests are plain structs that know
//! their own `msg_type` and channel through [`OutgoingContent`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::message::{Channel, WireError};

/// A payload the bridge sends to the kernel.
pub trait OutgoingContent: Serialize {
    const MSG_TYPE: &'static str;
    const CHANNEL: Channel = Channel::Shell;
}

// ============================================================================
// Outgoing requests
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub code: String,
    pub silent: bool,
    pub store_history: bool,
    pub user_expressions: Map<String, Value>,
    pub allow_stdin: bool,
    pub stop_on_error: bool,
}

impl ExecuteRequest {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            silent: false,
            store_history: true,
            user_expressions: Map::new(),
            allow_stdin: true,
            stop_on_error: true,
        }
    }
}

impl OutgoingContent for ExecuteRequest {
    const MSG_TYPE: &'static str = "execute_request";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsCompleteRequest {
    pub code: String,
}

impl OutgoingContent for IsCompleteRequest {
    const MSG_TYPE: &'static str = "is_complete_request";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteRequest {
    pub code: String,
    pub cursor_pos: u64,
}

impl OutgoingContent for CompleteRequest {
    const MSG_TYPE: &'static str = "complete_request";
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KernelInfoRequest {}

impl OutgoingContent for KernelInfoRequest {
    const MSG_TYPE: &'static str = "kernel_info_request";
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InterruptRequest {}

impl OutgoingContent for InterruptRequest {
    const MSG_TYPE: &'static str = "interrupt_request";
    const CHANNEL: Channel = Channel::Control;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShutdownRequest {
    pub restart: bool,
}

impl OutgoingContent for ShutdownRequest {
    const MSG_TYPE: &'static str = "shutdown_request";
    const CHANNEL: Channel = Channel::Control;
}

/// Answer to an `input_request`. The kernel-side proxy routes it to stdin
/// by `msg_type`, so it travels on the shell socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputReply {
    pub value: String,
    pub status: String,
}

impl InputReply {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            status: "ok".to_string(),
        }
    }
}

impl OutgoingContent for InputReply {
    const MSG_TYPE: &'static str = "input_reply";
}

// ============================================================================
// Comm messages (both directions)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommOpen {
    pub comm_id: String,
    pub target_name: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_module: Option<String>,
}

impl OutgoingContent for CommOpen {
    const MSG_TYPE: &'static str = "comm_open";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommMsg {
    pub comm_id: String,
    #[serde(default)]
    pub data: Value,
}

impl OutgoingContent for CommMsg {
    const MSG_TYPE: &'static str = "comm_msg";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommClose {
    pub comm_id: String,
    #[serde(default)]
    pub data: Value,
}

impl OutgoingContent for CommClose {
    const MSG_TYPE: &'static str = "comm_close";
}

// ============================================================================
// Incoming content
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionState {
    Busy,
    Idle,
    Starting,
    Restarting,
    Terminating,
    Dead,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub execution_state: ExecutionState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamName {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stream {
    pub name: StreamName,
    pub text: String,
}

/// `display_data` and `update_display_data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayData {
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transient: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteInput {
    pub code: String,
    #[serde(default)]
    pub execution_count: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteResult {
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub execution_count: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorOutput {
    pub ename: String,
    pub evalue: String,
    #[serde(default)]
    pub traceback: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputRequest {
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub password: bool,
}

/// Outcome carried in the `status` field of every `*_reply`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyStatus {
    Ok,
    Error { ename: String, evalue: String },
    Aborted,
}

/// Any `*_reply`. The content stays raw so callers can parse the reply type
/// they asked for (see [`IsCompleteReply`], [`CompleteReply`],
/// [`KernelInfoReply`]).
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub msg_type: String,
    pub status: ReplyStatus,
    pub content: Value,
}

impl Reply {
    fn from_content(msg_type: &str, content: Value) -> Self {
        let text = |key: &str| {
            content
                .get(key)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        };

        let status = match content.get("status").and_then(|s| s.as_str()) {
            Some("error") => ReplyStatus::Error {
                ename: text("ename"),
                evalue: text("evalue"),
            },
            Some("aborted") => ReplyStatus::Aborted,
            _ => ReplyStatus::Ok,
        };

        Self {
            msg_type: msg_type.to_string(),
            status,
            content,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsCompleteStatus {
    Complete,
    Incomplete,
    Invalid,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsCompleteReply {
    pub status: IsCompleteStatus,
    #[serde(default)]
    pub indent: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompleteReply {
    #[serde(default)]
    pub matches: Vec<String>,
    #[serde(default)]
    pub cursor_start: u64,
    #[serde(default)]
    pub cursor_end: u64,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LanguageInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KernelInfoReply {
    #[serde(default)]
    pub protocol_version: String,
    #[serde(default)]
    pub implementation: String,
    #[serde(default)]
    pub implementation_version: String,
    #[serde(default)]
    pub language_info: LanguageInfo,
    #[serde(default)]
    pub banner: String,
}

/// Decoded content of a message received from the kernel.
#[derive(Debug, Clone, PartialEq)]
pub enum KernelContent {
    Status(Status),
    Stream(Stream),
    DisplayData(DisplayData),
    UpdateDisplayData(DisplayData),
    ExecuteInput(ExecuteInput),
    ExecuteResult(ExecuteResult),
    Error(ErrorOutput),
    InputRequest(InputRequest),
    CommOpen(CommOpen),
    CommMsg(CommMsg),
    CommClose(CommClose),
    Reply(Reply),
    /// A message type this crate doesn't model. Kept intact so newer kernels
    /// don't break older bridges.
    Unknown { msg_type: String, content: Value },
}

impl KernelContent {
    pub fn decode(msg_type: &str, content: Value) -> Result<Self, WireError> {
        fn parse<T: serde::de::DeserializeOwned>(
            msg_type: &str,
            content: Value,
        ) -> Result<T, WireError> {
            serde_json::from_value(content).map_err(|source| WireError::Content {
                msg_type: msg_type.to_string(),
                source,
            })
        }

        Ok(match msg_type {
            "status" => KernelContent::Status(parse(msg_type, content)?),
            "stream" => KernelContent::Stream(parse(msg_type, content)?),
            "display_data" => KernelContent::DisplayData(parse(msg_type, content)?),
            "update_display_data" => KernelContent::UpdateDisplayData(parse(msg_type, content)?),
            "execute_input" => KernelContent::ExecuteInput(parse(msg_type, content)?),
            "execute_result" => KernelContent::ExecuteResult(parse(msg_type, content)?),
            "error" => KernelContent::Error(parse(msg_type, content)?),
            "input_request" => KernelContent::InputRequest(parse(msg_type, content)?),
            "comm_open" => KernelContent::CommOpen(parse(msg_type, content)?),
            "comm_msg" => KernelContent::CommMsg(parse(msg_type, content)?),
            "comm_close" => KernelContent::CommClose(parse(msg_type, content)?),
            t if t.ends_with("_reply") => KernelContent::Reply(Reply::from_content(t, content)),
            _ => KernelContent::Unknown {
                msg_type: msg_type.to_string(),
                content,
            },
        })
    }
}
