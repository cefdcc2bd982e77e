//! Wire-level types for talking to out-of-process kernels.
//!
//! Kernels speak JSON messages over WebSockets using the envelope
//!
//! ```text
//! {header, parent_header, metadata, content, buffers?}
//! ```
//!
//! This crate owns that envelope and everything needed to move it across
//! the transport boundary:
//!
//! - [`WireMessage`] and [`Header`] with the exact JSON shape the kernel
//!   expects (empty parent headers serialize as `{}`)
//! - base64 encoding of binary buffers
//! - [`KernelContent`], the typed decode of incoming content keyed by
//!   `msg_type`, with an `Unknown` passthrough for message types we don't
//!   model
//! - outgoing request payloads implementing [`OutgoingContent`]
//! - the per-kernel-family [`normalize`] transform

mod buffers;
pub mod content;
mod message;
pub mod normalize;

pub use content::{
    CommClose, CommMsg, CommOpen, CompleteReply, CompleteRequest, DisplayData, ErrorOutput,
    ExecuteInput, ExecuteRequest, ExecuteResult, ExecutionState, InputReply, InputRequest,
    InterruptRequest, IsCompleteReply, IsCompleteRequest, IsCompleteStatus, KernelContent,
    KernelInfoReply, KernelInfoRequest, LanguageInfo, OutgoingContent, Reply, ReplyStatus,
    ShutdownRequest, Status, Stream, StreamName,
};
pub use message::{Channel, Header, WireError, WireMessage, PROTOCOL_VERSION};
pub use normalize::{normalize, Direction, KernelFamily};
