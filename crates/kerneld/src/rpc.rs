//! JSON-RPC carried inside comm messages on the UI comm.
//!
//! Calls go out as
//! `{"jsonrpc": "2.0", "id", "method": "call_method", "params": {"method", "params"}}`
//! and come back as `{"jsonrpc": "2.0", "id", "result"}` or
//! `{"jsonrpc": "2.0", "id", "error": {"code", "message"}}`. Anything on the
//! comm with a `method` and no `id` is an event from the kernel.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const JSONRPC_VERSION: &str = "2.0";

/// Method name wrapping every frontend → kernel call.
pub const CALL_METHOD: &str = "call_method";

pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{message} ({code})")]
pub struct RpcError {
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

/// Comm `data` for calling `method` with positional `params`.
pub fn call_method_request(id: &str, method: &str, params: Vec<Value>) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "method": CALL_METHOD,
        "params": {
            "method": method,
            "params": params,
        },
    })
}

/// What a piece of comm `data` turned out to be.
#[derive(Debug, Clone, PartialEq)]
pub enum CommPayload {
    Response {
        id: String,
        outcome: Result<Value, RpcError>,
    },
    Event(UiEvent),
    Other,
}

/// Events the kernel pushes over the UI comm.
#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    WorkingDirectory {
        directory: String,
    },
    PromptState {
        input_prompt: String,
        continuation_prompt: String,
    },
    ClearConsole,
    Other {
        method: String,
        params: Value,
    },
}

/// Classify comm `data`. JSON-RPC responses are recognised by the embedded
/// `jsonrpc` + `id` pair.
pub fn classify(data: &Value) -> CommPayload {
    let Some(obj) = data.as_object() else {
        return CommPayload::Other;
    };

    let id = match obj.get("id") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    };

    if let (Some(_), Some(id)) = (obj.get("jsonrpc"), id) {
        if let Some(error) = obj.get("error") {
            let error = serde_json::from_value::<RpcError>(error.clone()).unwrap_or(RpcError {
                code: INTERNAL_ERROR,
                message: error.to_string(),
            });
            return CommPayload::Response {
                id,
                outcome: Err(error),
            };
        }
        if obj.contains_key("result") || !obj.contains_key("method") {
            let result = obj.get("result").cloned().unwrap_or(Value::Null);
            return CommPayload::Response {
                id,
                outcome: Ok(result),
            };
        }
    }

    match obj.get("method").and_then(Value::as_str) {
        Some(method) => {
            let params = obj.get("params").cloned().unwrap_or(Value::Null);
            CommPayload::Event(parse_event(method, params))
        }
        None => CommPayload::Other,
    }
}

fn parse_event(method: &str, params: Value) -> UiEvent {
    let text = |key: &str| params.get(key).and_then(Value::as_str).map(str::to_string);

    match method {
        "working_directory" => match text("directory") {
            Some(directory) => UiEvent::WorkingDirectory { directory },
            None => UiEvent::Other {
                method: method.to_string(),
                params,
            },
        },
        "prompt_state" => UiEvent::PromptState {
            input_prompt: text("input_prompt").unwrap_or_default(),
            continuation_prompt: text("continuation_prompt").unwrap_or_default(),
        },
        "clear_console" => UiEvent::ClearConsole,
        _ => UiEvent::Other {
            method: method.to_string(),
            params,
        },
    }
}
