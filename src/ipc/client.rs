use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::net::UnixStream;
use tracing::trace;

use super::frame::{read_response, write_request, Request, Response, WorkerEvent, WorkerInfo, WorkerMessage};
use super::IpcError;

/// Sends one request on a fresh connection and reads the single reply.
pub async fn call(path: &Path, request: &Request) -> Result<Response, IpcError> {
    trace!(path = %path.display(), "IPC call");
    let mut stream = UnixStream::connect(path).await?;
    write_request(&mut stream, request).await?;
    read_response(&mut stream).await
}

/// [`call`] bounded by `limit`.
pub async fn call_with_timeout(
    path: &Path,
    request: &Request,
    limit: Duration,
) -> Result<Response, IpcError> {
    match tokio::time::timeout(limit, call(path, request)).await {
        Ok(result) => result,
        Err(_) => Err(IpcError::Timeout),
    }
}

/// Client side of the agent socket, used by workers and the CLI.
#[derive(Debug, Clone)]
pub struct AgentClient {
    socket_path: PathBuf,
}

impl AgentClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub async fn request(&self, request: Request) -> Result<Response, IpcError> {
        call(&self.socket_path, &request).await
    }

    pub async fn ping(&self) -> Result<(u64, String), IpcError> {
        match self.request(Request::Ping).await? {
            Response::Pong {
                uptime_secs,
                version,
            } => Ok((uptime_secs, version)),
            other => Err(unexpected(other)),
        }
    }

    /// Registers `handler` and returns the address the worker must listen on.
    pub async fn register(
        &self,
        handler: &str,
        address: Option<&str>,
        features: BTreeMap<String, String>,
        detached_content: bool,
    ) -> Result<String, IpcError> {
        let request = Request::Register {
            handler: handler.to_string(),
            pid: Some(std::process::id()),
            address: address.unwrap_or_default().to_string(),
            features,
            detached_content,
        };
        match self.request(request).await? {
            Response::Registered { address } => Ok(address),
            other => Err(unexpected(other)),
        }
    }

    pub async fn unregister(&self, handler: &str) -> Result<(), IpcError> {
        expect_ok(
            self.request(Request::Unregister {
                handler: handler.to_string(),
            })
            .await?,
        )
    }

    pub async fn transmit(
        &self,
        handler: &str,
        addr: &str,
        message: WorkerMessage,
    ) -> Result<crate::protocol::Response, IpcError> {
        let request = Request::Transmit {
            handler: handler.to_string(),
            addr: addr.to_string(),
            message_id: message.message_id,
            response_to: message.response_to,
            metadata: message.metadata,
            content: message.content,
        };
        match self.request(request).await? {
            Response::Transmitted {
                code,
                metadata,
                data,
            } => Ok(crate::protocol::Response {
                code,
                metadata,
                data,
            }),
            other => Err(unexpected(other)),
        }
    }

    pub async fn features_changed(
        &self,
        handler: &str,
        features: BTreeMap<String, String>,
    ) -> Result<(), IpcError> {
        expect_ok(
            self.request(Request::FeaturesChanged {
                handler: handler.to_string(),
                features,
            })
            .await?,
        )
    }

    pub async fn emit_event(&self, event: WorkerEvent) -> Result<(), IpcError> {
        expect_ok(self.request(Request::EmitEvent(event)).await?)
    }

    pub async fn dispatch(
        &self,
        directive: &str,
        metadata: HashMap<String, String>,
        content: Vec<u8>,
    ) -> Result<String, IpcError> {
        let message = WorkerMessage::new(directive, content).metadata(metadata);
        let message_id = message.message_id.clone();
        expect_ok(self.request(Request::Dispatch(message)).await?)?;
        Ok(message_id)
    }

    pub async fn list_workers(&self) -> Result<Vec<WorkerInfo>, IpcError> {
        match self.request(Request::ListWorkers).await? {
            Response::Workers { list } => Ok(list),
            other => Err(unexpected(other)),
        }
    }

    /// Opens a long-lived event subscription.
    pub async fn subscribe(&self, worker: Option<&str>) -> Result<EventStream, IpcError> {
        let mut stream = UnixStream::connect(&self.socket_path).await?;
        write_request(
            &mut stream,
            &Request::Subscribe {
                worker: worker.map(str::to_string),
            },
        )
        .await?;
        expect_ok(read_response(&mut stream).await?)?;
        Ok(EventStream { stream })
    }
}

/// Worker events streamed by the agent after `Subscribe`.
pub struct EventStream {
    stream: UnixStream,
}

impl EventStream {
    /// Next event, or `None` once the agent ends the stream.
    pub async fn next(&mut self) -> Result<Option<WorkerEvent>, IpcError> {
        match read_response(&mut self.stream).await {
            Ok(Response::Event(event)) => Ok(Some(event)),
            Ok(Response::StreamEnd) | Err(IpcError::Closed) => Ok(None),
            Ok(other) => Err(unexpected(other)),
            Err(e) => Err(e),
        }
    }
}

pub(crate) fn expect_ok(response: Response) -> Result<(), IpcError> {
    match response {
        Response::Ok => Ok(()),
        other => Err(unexpected(other)),
    }
}

pub(crate) fn unexpected(response: Response) -> IpcError {
    match response {
        Response::Error { message } => IpcError::Remote(message),
        other => IpcError::UnexpectedResponse(format!("{:?}", other)),
    }
}
