use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use super::client::{call_with_timeout, expect_ok};
use super::frame::{DispatcherEvent, Request, WorkerMessage};
use super::IpcError;
use crate::registry::WorkerDescriptor;

/// Agent-to-worker calls.
#[async_trait]
pub trait LocalIpcEndpoint: Send + Sync {
    async fn dispatch(&self, worker: &WorkerDescriptor, message: WorkerMessage)
        -> Result<(), IpcError>;

    async fn cancel(
        &self,
        worker: &WorkerDescriptor,
        message_id: &str,
        cancel_id: &str,
    ) -> Result<(), IpcError>;

    async fn notify(&self, worker: &WorkerDescriptor, event: DispatcherEvent)
        -> Result<(), IpcError>;
}

/// Reaches workers over the Unix socket each one registered.
#[derive(Debug, Clone)]
pub struct SocketEndpoint {
    call_timeout: Duration,
}

impl SocketEndpoint {
    pub fn new(call_timeout: Duration) -> Self {
        Self { call_timeout }
    }

    async fn send(&self, worker: &WorkerDescriptor, request: Request) -> Result<(), IpcError> {
        let response =
            call_with_timeout(Path::new(&worker.local_address), &request, self.call_timeout).await?;
        expect_ok(response)
    }
}

impl Default for SocketEndpoint {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

#[async_trait]
impl LocalIpcEndpoint for SocketEndpoint {
    async fn dispatch(
        &self,
        worker: &WorkerDescriptor,
        message: WorkerMessage,
    ) -> Result<(), IpcError> {
        self.send(worker, Request::Deliver(message)).await
    }

    async fn cancel(
        &self,
        worker: &WorkerDescriptor,
        message_id: &str,
        cancel_id: &str,
    ) -> Result<(), IpcError> {
        self.send(
            worker,
            Request::Cancel {
                directive: worker.handler.clone(),
                message_id: message_id.to_string(),
                cancel_id: cancel_id.to_string(),
            },
        )
        .await
    }

    async fn notify(
        &self,
        worker: &WorkerDescriptor,
        event: DispatcherEvent,
    ) -> Result<(), IpcError> {
        self.send(worker, Request::Notify { event }).await
    }
}
