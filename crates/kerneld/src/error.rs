//! Error type for session operations.

use kernel_launch::LaunchError;
use kernel_wire::WireError;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session is not running")]
    NotStarted,

    #[error("Timed out waiting for {operation}")]
    Timeout { operation: String },

    #[error("Kernel reported {ename}: {evalue}")]
    KernelReported { ename: String, evalue: String },

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Connection to the kernel closed")]
    ConnectionClosed,

    #[error("Session was disposed")]
    Disposed,

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error("Failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("Unknown client {0}")]
    UnknownClient(String),

    #[error("No pending input request {0}")]
    UnknownInputRequest(String),

    #[error("Unknown session {0}")]
    UnknownSession(String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl SessionError {
    pub fn timeout(operation: impl Into<String>) -> Self {
        SessionError::Timeout {
            operation: operation.into(),
        }
    }
}

impl From<WireError> for SessionError {
    fn from(e: WireError) -> Self {
        SessionError::Protocol(e.to_string())
    }
}
