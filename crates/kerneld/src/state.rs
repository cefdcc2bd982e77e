//! Session runtime state and the state the kernel reports about itself.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a session as seen by callers.
///
/// ```text
/// Uninitialized → Starting → Ready → Idle ⇄ Busy
///                     │        │       │     │
///                     └────────┴───────┴─────┴──→ Exited
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeState {
    Uninitialized,
    Starting,
    Ready,
    Idle,
    Busy,
    Exited,
}

impl RuntimeState {
    /// Whether `self → next` is a legal transition. Self-transitions are not.
    pub fn can_transition_to(self, next: RuntimeState) -> bool {
        use RuntimeState::*;
        matches!(
            (self, next),
            (Uninitialized, Starting)
                | (Uninitialized, Exited)
                | (Starting, Ready)
                | (Starting, Exited)
                | (Ready, Idle)
                | (Ready, Busy)
                | (Ready, Exited)
                | (Idle, Busy)
                | (Idle, Exited)
                | (Busy, Idle)
                | (Busy, Exited)
        )
    }

    /// Ready to accept requests.
    pub fn is_running(self) -> bool {
        matches!(self, RuntimeState::Ready | RuntimeState::Idle | RuntimeState::Busy)
    }

    pub fn is_exited(self) -> bool {
        self == RuntimeState::Exited
    }
}

impl std::fmt::Display for RuntimeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RuntimeState::Uninitialized => "uninitialized",
            RuntimeState::Starting => "starting",
            RuntimeState::Ready => "ready",
            RuntimeState::Idle => "idle",
            RuntimeState::Busy => "busy",
            RuntimeState::Exited => "exited",
        };
        f.write_str(name)
    }
}

/// State mutated only by messages received from the kernel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicState {
    pub working_directory: Option<String>,
    pub input_prompt: String,
    pub continuation_prompt: String,
    pub busy: bool,
}

impl Default for DynamicState {
    fn default() -> Self {
        Self {
            working_directory: None,
            input_prompt: ">".to_string(),
            continuation_prompt: "+".to_string(),
            busy: false,
        }
    }
}

/// Static description of the runtime behind a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeMetadata {
    pub session_id: String,
    pub language: String,
    pub display_name: String,
    /// Filled from `kernel_info_reply`.
    pub version: Option<String>,
    pub implementation: Option<String>,
}
