//! kerneld - client-side bridge to out-of-process language kernels.
//!
//! A [`KernelSession`] launches (or attaches to) one kernel and speaks its
//! JSON-over-WebSocket protocol: it tracks the session's runtime state,
//! correlates requests with replies, multiplexes JSON-RPC calls over the
//! UI comm and surfaces kernel output as [`RuntimeMessage`]s.
//!
//! Sessions are held by an explicit [`SessionRegistry`]. The [`Daemon`]
//! exposes the kernel process manager over a localhost control socket
//! using length-prefixed JSON frames, with [`KernelClient`] as its client.

pub mod client;
pub mod comm;
pub mod config;
pub mod connection;
pub mod daemon;
pub mod endpoint;
pub mod error;
pub mod message;
pub mod pending;
pub mod protocol;
pub mod registry;
pub mod rpc;
pub mod session;
pub mod state;
pub mod transport;

pub use client::{ClientError, KernelClient};
pub use comm::CommChannel;
pub use config::{DaemonConfig, SessionConfig, DEFAULT_UI_COMM_TARGET};
pub use daemon::Daemon;
pub use error::SessionError;
pub use message::{RuntimeMessage, RuntimePayload, SessionEndReason, SessionEvent};
pub use registry::{SessionRegistry, SessionSummary};
pub use session::{ErrorBehavior, ExecuteOptions, ExecutionMode, KernelSession, ShutdownReason};
pub use state::{DynamicState, RuntimeMetadata, RuntimeState};
pub use transport::KernelEndpoint;
