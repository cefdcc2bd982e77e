//! Messages and events delivered to session subscribers.

use chrono::{DateTime, Utc};
use kernel_wire::{ExecutionState, KernelContent, StreamName, WireMessage};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::state::RuntimeState;

/// A message from the kernel, classified for callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeMessage {
    pub id: String,
    /// Id of the request this message belongs to, `""` when none.
    pub parent_id: String,
    pub when: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: RuntimePayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuntimePayload {
    /// `display_data` / `update_display_data`.
    Output {
        data: Map<String, Value>,
        metadata: Map<String, Value>,
        update: bool,
    },
    Result {
        data: Map<String, Value>,
        metadata: Map<String, Value>,
        execution_count: Option<i64>,
    },
    Stream {
        name: StreamName,
        text: String,
    },
    Error {
        name: String,
        message: String,
        traceback: Vec<String>,
    },
    /// The kernel is waiting for [`crate::KernelSession::reply_to_input`].
    Input {
        prompt: String,
        password: bool,
    },
    CommOpen {
        comm_id: String,
        target_name: String,
        data: Value,
    },
    CommData {
        comm_id: String,
        data: Value,
    },
    CommClosed {
        comm_id: String,
        data: Value,
    },
    State {
        state: ExecutionState,
    },
}

impl RuntimeMessage {
    /// Classify decoded content. Returns `None` for content callers never
    /// see (replies, echoed input, unknown types).
    pub fn from_content(msg: &WireMessage, content: &KernelContent) -> Option<Self> {
        let payload = match content {
            KernelContent::Status(status) => RuntimePayload::State {
                state: status.execution_state,
            },
            KernelContent::Stream(stream) => RuntimePayload::Stream {
                name: stream.name,
                text: stream.text.clone(),
            },
            KernelContent::DisplayData(display) | KernelContent::UpdateDisplayData(display) => {
                RuntimePayload::Output {
                    data: display.data.clone(),
                    metadata: display.metadata.clone(),
                    update: matches!(content, KernelContent::UpdateDisplayData(_)),
                }
            }
            KernelContent::ExecuteResult(result) => RuntimePayload::Result {
                data: result.data.clone(),
                metadata: result.metadata.clone(),
                execution_count: result.execution_count,
            },
            KernelContent::Error(err) => RuntimePayload::Error {
                name: err.ename.clone(),
                message: err.evalue.clone(),
                traceback: err.traceback.clone(),
            },
            KernelContent::InputRequest(req) => RuntimePayload::Input {
                prompt: req.prompt.clone(),
                password: req.password,
            },
            KernelContent::CommOpen(open) => RuntimePayload::CommOpen {
                comm_id: open.comm_id.clone(),
                target_name: open.target_name.clone(),
                data: open.data.clone(),
            },
            KernelContent::CommMsg(comm) => RuntimePayload::CommData {
                comm_id: comm.comm_id.clone(),
                data: comm.data.clone(),
            },
            KernelContent::CommClose(close) => RuntimePayload::CommClosed {
                comm_id: close.comm_id.clone(),
                data: close.data.clone(),
            },
            KernelContent::ExecuteInput(_)
            | KernelContent::Reply(_)
            | KernelContent::Unknown { .. } => return None,
        };

        Some(Self {
            id: msg.msg_id().to_string(),
            parent_id: msg.parent_msg_id().unwrap_or_default().to_string(),
            when: msg.header.timestamp(),
            payload,
        })
    }
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SessionEndReason {
    Shutdown,
    ConnectionClosed,
    ProcessExited { code: Option<i32> },
    StartFailed { message: String },
}

/// Everything a session broadcasts to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Message(RuntimeMessage),
    State(RuntimeState),
    Ended(SessionEndReason),
}
