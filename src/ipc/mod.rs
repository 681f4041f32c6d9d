//! Local IPC between the agent, its workers and the CLI
//!
//! ```text
//!   worker ──Register/Transmit/EmitEvent──▶ ┌──────────────┐
//!   courierd dispatch/listen ─────────────▶ │  IpcServer   │ (agent socket)
//!                                           └──────┬───────┘
//!                                                  │ Dispatcher
//!   worker ◀──────Deliver/Cancel/Notify────── SocketEndpoint
//!   (WorkerListener on its own socket)
//! ```
//!
//! Frames are rkyv archives with a little-endian length prefix, one
//! connection per call.

pub mod client;
pub mod endpoint;
pub mod frame;
pub mod server;
pub mod worker;

pub use client::{AgentClient, EventStream};
pub use endpoint::{LocalIpcEndpoint, SocketEndpoint};
pub use frame::{
    DispatcherEvent, MessageFrame, Request, Response, WorkerEvent, WorkerEventName, WorkerInfo,
    WorkerMessage,
};
pub use server::IpcServer;
pub use worker::{WorkerCall, WorkerListener};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum IpcError {
    #[error("IPC I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode IPC frame: {0}")]
    Encode(String),

    #[error("failed to decode IPC frame: {0}")]
    Decode(String),

    #[error("IPC frame of {0} bytes exceeds the frame limit")]
    FrameTooLarge(usize),

    #[error("peer reported an error: {0}")]
    Remote(String),

    #[error("unexpected IPC response: {0}")]
    UnexpectedResponse(String),

    #[error("IPC call timed out")]
    Timeout,

    #[error("IPC connection closed")]
    Closed,
}
