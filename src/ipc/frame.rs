//! IPC message types using rkyv for zero-copy serialization
//!
//! One wire format serves all three socket roles: workers and the CLI
//! talking to the agent, and the agent calling back into workers.
//! Every exchange is a single request frame followed by one response
//! frame, except `Subscribe`, which streams `Event` frames until either
//! side hangs up.

use std::collections::{BTreeMap, HashMap};

use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::IpcError;

/// Upper bound on a single frame body.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// IPC request
#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
#[rkyv(derive(Debug))]
pub enum Request {
    /// Check if the agent is alive
    Ping,

    // Worker -> agent
    /// Claim a handler name. An empty address asks the agent to assign one.
    Register {
        handler: String,
        pid: Option<u32>,
        address: String,
        features: BTreeMap<String, String>,
        detached_content: bool,
    },
    Unregister {
        handler: String,
    },
    /// Push data upstream on behalf of `handler`.
    Transmit {
        handler: String,
        addr: String,
        message_id: String,
        response_to: String,
        metadata: HashMap<String, String>,
        content: Vec<u8>,
    },
    FeaturesChanged {
        handler: String,
        features: BTreeMap<String, String>,
    },
    /// Lifecycle event reported by a worker about a message it handles.
    EmitEvent(WorkerEvent),

    // CLI -> agent
    /// Route data to a local worker as if it came from the server.
    Dispatch(WorkerMessage),
    ListWorkers,
    /// Stream worker events, optionally for a single handler.
    Subscribe {
        worker: Option<String>,
    },

    // Agent -> worker
    Deliver(WorkerMessage),
    Cancel {
        directive: String,
        message_id: String,
        cancel_id: String,
    },
    Notify {
        event: DispatcherEvent,
    },
}

/// IPC response
#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
#[rkyv(derive(Debug))]
pub enum Response {
    Pong {
        uptime_secs: u64,
        version: String,
    },
    Ok,
    Error {
        message: String,
    },
    Registered {
        address: String,
    },
    Transmitted {
        code: i32,
        metadata: HashMap<String, String>,
        data: Vec<u8>,
    },
    Workers {
        list: Vec<WorkerInfo>,
    },
    /// One streamed worker event
    Event(WorkerEvent),
    /// End of stream
    StreamEnd,
}

/// Data delivered to a worker.
#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[rkyv(derive(Debug))]
pub struct WorkerMessage {
    pub directive: String,
    pub message_id: String,
    pub response_to: String,
    pub metadata: HashMap<String, String>,
    pub content: Vec<u8>,
}

impl WorkerMessage {
    pub fn new(directive: impl Into<String>, content: Vec<u8>) -> Self {
        Self {
            directive: directive.into(),
            message_id: crate::protocol::new_message_id(),
            response_to: String::new(),
            metadata: HashMap::new(),
            content,
        }
    }

    pub fn message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = message_id.into();
        self
    }

    pub fn response_to(mut self, response_to: impl Into<String>) -> Self {
        self.response_to = response_to.into();
        self
    }

    pub fn metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Connection-level signals broadcast to every registered worker.
#[derive(Archive, Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[rkyv(derive(Debug))]
pub enum DispatcherEvent {
    /// The server asked the agent to disconnect.
    ReceivedDisconnect,
    UnexpectedDisconnect,
    ConnectionRestored,
}

impl DispatcherEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatcherEvent::ReceivedDisconnect => "received-disconnect",
            DispatcherEvent::UnexpectedDisconnect => "unexpected-disconnect",
            DispatcherEvent::ConnectionRestored => "connection-restored",
        }
    }
}

#[derive(
    Archive,
    Deserialize,
    Serialize,
    serde::Serialize,
    serde::Deserialize,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
)]
#[rkyv(derive(Debug))]
#[serde(rename_all = "lowercase")]
pub enum WorkerEventName {
    Begin,
    End,
    Working,
    Started,
    Stopped,
}

impl WorkerEventName {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerEventName::Begin => "begin",
            WorkerEventName::End => "end",
            WorkerEventName::Working => "working",
            WorkerEventName::Started => "started",
            WorkerEventName::Stopped => "stopped",
        }
    }
}

#[derive(
    Archive, Deserialize, Serialize, serde::Serialize, serde::Deserialize, Debug, Clone, PartialEq, Eq,
)]
#[rkyv(derive(Debug))]
pub struct WorkerEvent {
    pub worker: String,
    pub name: WorkerEventName,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub response_to: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub data: HashMap<String, String>,
}

impl WorkerEvent {
    pub fn new(worker: impl Into<String>, name: WorkerEventName) -> Self {
        Self {
            worker: worker.into(),
            name,
            message_id: String::new(),
            response_to: String::new(),
            data: HashMap::new(),
        }
    }

    pub fn message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = message_id.into();
        self
    }
}

/// Registered worker as reported by `ListWorkers`.
#[derive(
    Archive, Deserialize, Serialize, serde::Serialize, serde::Deserialize, Debug, Clone, PartialEq, Eq,
)]
#[rkyv(derive(Debug))]
pub struct WorkerInfo {
    pub handler: String,
    pub pid: Option<u32>,
    pub address: String,
    pub features: BTreeMap<String, String>,
    pub detached_content: bool,
}

impl From<crate::registry::WorkerDescriptor> for WorkerInfo {
    fn from(d: crate::registry::WorkerDescriptor) -> Self {
        Self {
            handler: d.handler,
            pid: d.process_id,
            address: d.local_address,
            features: d.features,
            detached_content: d.detached_content,
        }
    }
}

/// Message frame for wire protocol
///
/// Format: [4-byte length (little-endian)][rkyv bytes]
pub struct MessageFrame;

impl MessageFrame {
    pub fn encode_request(request: &Request) -> Result<Vec<u8>, IpcError> {
        let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(request)
            .map_err(|e| IpcError::Encode(e.to_string()))?;
        Ok(Self::with_prefix(&bytes))
    }

    pub fn encode_response(response: &Response) -> Result<Vec<u8>, IpcError> {
        let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(response)
            .map_err(|e| IpcError::Encode(e.to_string()))?;
        Ok(Self::with_prefix(&bytes))
    }

    /// Decodes a frame body (without the length prefix).
    pub fn decode_request(body: &[u8]) -> Result<Request, IpcError> {
        let aligned = Self::aligned(body);
        rkyv::from_bytes::<Request, rkyv::rancor::Error>(&aligned)
            .map_err(|e| IpcError::Decode(e.to_string()))
    }

    pub fn decode_response(body: &[u8]) -> Result<Response, IpcError> {
        let aligned = Self::aligned(body);
        rkyv::from_bytes::<Response, rkyv::rancor::Error>(&aligned)
            .map_err(|e| IpcError::Decode(e.to_string()))
    }

    /// Read length prefix from buffer
    pub fn read_length(buf: &[u8; 4]) -> usize {
        u32::from_le_bytes(*buf) as usize
    }

    fn with_prefix(bytes: &[u8]) -> Vec<u8> {
        let len = bytes.len() as u32;
        let mut result = Vec::with_capacity(4 + bytes.len());
        result.extend_from_slice(&len.to_le_bytes());
        result.extend_from_slice(bytes);
        result
    }

    // Archived data must sit at its natural alignment before validation.
    fn aligned(body: &[u8]) -> AlignedVec {
        let mut aligned = AlignedVec::with_capacity(body.len());
        aligned.extend_from_slice(body);
        aligned
    }
}

async fn read_body<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, IpcError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await.map_err(closed_on_eof)?;
    let len = MessageFrame::read_length(&len_buf);
    if len > MAX_FRAME_LEN {
        return Err(IpcError::FrameTooLarge(len));
    }
    tracing::trace!("Frame length: {} bytes", len);

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(closed_on_eof)?;
    Ok(body)
}

fn closed_on_eof(e: std::io::Error) -> IpcError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        IpcError::Closed
    } else {
        IpcError::Io(e)
    }
}

pub async fn read_request<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Request, IpcError> {
    let body = read_body(reader).await?;
    MessageFrame::decode_request(&body)
}

pub async fn read_response<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Response, IpcError> {
    let body = read_body(reader).await?;
    MessageFrame::decode_response(&body)
}

pub async fn write_request<W: AsyncWrite + Unpin>(
    writer: &mut W,
    request: &Request,
) -> Result<(), IpcError> {
    let bytes = MessageFrame::encode_request(request)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn write_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    response: &Response,
) -> Result<(), IpcError> {
    let bytes = MessageFrame::encode_response(response)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}
