//! Request/response types for the daemon's control socket.
//!
//! Both enums are serialized as JSON and sent over length-prefixed frames
//! (see `connection.rs`), one request and one response per exchange.

use kernel_launch::{KernelInfo, KernelLaunchSpec};
use serde::{Deserialize, Serialize};

use crate::transport::KernelEndpoint;

/// Requests that clients can send to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Launch a kernel for `session_id` and wait until it is listening.
    StartKernel {
        session_id: String,
        spec: KernelLaunchSpec,
    },

    /// Stop the kernel owned by `session_id`.
    StopKernel { session_id: String },

    ListKernels,

    /// Where the kernel for `session_id` can be reached.
    GetEndpoint { session_id: String },

    /// Ping to check if daemon is alive.
    Ping,

    /// Stop every kernel and exit.
    Shutdown,
}

/// Responses from the daemon to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    KernelStarted { kernel: KernelInfo },

    /// `existed` is false when there was nothing to stop.
    KernelStopped { existed: bool },

    Kernels { kernels: Vec<KernelInfo> },

    Endpoint { endpoint: KernelEndpoint },

    Pong,

    ShuttingDown,

    Error { message: String },
}
