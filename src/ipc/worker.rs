use std::path::{Path, PathBuf};

use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::frame::{read_request, write_response, DispatcherEvent, Request, Response, WorkerMessage};
use super::IpcError;

/// A call the agent made into this worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerCall {
    Deliver(WorkerMessage),
    Cancel {
        directive: String,
        message_id: String,
        cancel_id: String,
    },
    Notify(DispatcherEvent),
}

/// Worker-side socket that accepts dispatches from the agent.
///
/// Calls are acknowledged as soon as they are queued; the worker drains
/// them with [`WorkerListener::next`].
pub struct WorkerListener {
    path: PathBuf,
    calls: mpsc::Receiver<WorkerCall>,
    token: CancellationToken,
}

impl WorkerListener {
    pub fn bind(path: impl AsRef<Path>) -> Result<Self, IpcError> {
        let path = path.as_ref().to_path_buf();
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let listener = UnixListener::bind(&path)?;
        debug!("Worker listening on: {}", path.display());

        let (tx, rx) = mpsc::channel(64);
        let token = CancellationToken::new();
        tokio::spawn(accept_loop(listener, tx, token.clone()));

        Ok(Self {
            path,
            calls: rx,
            token,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn next(&mut self) -> Option<WorkerCall> {
        self.calls.recv().await
    }
}

impl Drop for WorkerListener {
    fn drop(&mut self) {
        self.token.cancel();
        let _ = std::fs::remove_file(&self.path);
    }
}

async fn accept_loop(
    listener: UnixListener,
    calls: mpsc::Sender<WorkerCall>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            conn = listener.accept() => match conn {
                Ok((stream, _)) => {
                    let calls = calls.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, calls).await {
                            warn!("Worker connection error: {}", e);
                        }
                    });
                }
                Err(e) => warn!("Accept error: {}", e),
            },
            _ = token.cancelled() => break,
        }
    }
}

async fn handle_connection(
    mut stream: UnixStream,
    calls: mpsc::Sender<WorkerCall>,
) -> Result<(), IpcError> {
    let call = match read_request(&mut stream).await? {
        Request::Deliver(message) => WorkerCall::Deliver(message),
        Request::Cancel {
            directive,
            message_id,
            cancel_id,
        } => WorkerCall::Cancel {
            directive,
            message_id,
            cancel_id,
        },
        Request::Notify { event } => WorkerCall::Notify(event),
        other => {
            let message = format!("unsupported worker request: {:?}", other);
            write_response(&mut stream, &Response::Error { message }).await?;
            return Ok(());
        }
    };
    trace!("Queued worker call: {:?}", call);

    let response = match calls.send(call).await {
        Ok(()) => Response::Ok,
        Err(_) => Response::Error {
            message: "worker is shutting down".to_string(),
        },
    };
    write_response(&mut stream, &response).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::endpoint::{LocalIpcEndpoint, SocketEndpoint};
    use crate::registry::WorkerDescriptor;

    #[tokio::test]
    async fn test_endpoint_reaches_listener() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("echo.sock");
        let mut listener = WorkerListener::bind(&path).unwrap();
        let worker = WorkerDescriptor::new("echo", path.to_string_lossy());
        let endpoint = SocketEndpoint::default();

        let message = WorkerMessage::new("echo", b"\"hello\"".to_vec());
        endpoint.dispatch(&worker, message.clone()).await.unwrap();
        endpoint.cancel(&worker, "m1", "m0").await.unwrap();
        endpoint
            .notify(&worker, DispatcherEvent::ConnectionRestored)
            .await
            .unwrap();

        assert_eq!(listener.next().await, Some(WorkerCall::Deliver(message)));
        assert_eq!(
            listener.next().await,
            Some(WorkerCall::Cancel {
                directive: "echo".to_string(),
                message_id: "m1".to_string(),
                cancel_id: "m0".to_string(),
            })
        );
        assert_eq!(
            listener.next().await,
            Some(WorkerCall::Notify(DispatcherEvent::ConnectionRestored))
        );
    }

    #[tokio::test]
    async fn test_listener_rejects_agent_requests() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w.sock");
        let _listener = WorkerListener::bind(&path).unwrap();

        let response = crate::ipc::client::call(&path, &Request::ListWorkers)
            .await
            .unwrap();
        assert!(matches!(response, Response::Error { .. }));
    }
}
