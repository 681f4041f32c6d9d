//! Routing between the broker connection and local workers.
//!
//! Inbound data goes to the worker owning the directive. Outbound data
//! from workers is queued for the client layer, which reports the send
//! result back through [`Dispatcher::complete_transmit`].

pub mod content;
pub mod pending;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::ipc::{DispatcherEvent, IpcError, LocalIpcEndpoint, WorkerEvent, WorkerMessage};
use crate::protocol::{Data, DispatcherMap, Features, Response};
use crate::registry::{
    scrub_directive, with_legacy_aliases, RegistryError, WorkerDescriptor, WorkerRegistry,
};

pub use content::{ContentFetcher, FetchError, HttpContentFetcher};
pub use pending::PendingTransmits;

/// Time a worker waits for its transmission to be handed to the transport.
pub const DEFAULT_TRANSMIT_TIMEOUT: Duration = Duration::from_secs(1);

const OUTBOUND_CAPACITY: usize = 64;
const EVENT_CAPACITY: usize = 256;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("no worker registered for directive '{0}'")]
    UnknownDirective(String),

    #[error("sender '{0}' is not a registered worker")]
    UnknownSender(String),

    #[error("process {pid} does not own handler '{handler}'")]
    SenderMismatch { handler: String, pid: u32 },

    #[error("timed out waiting for a response to message '{0}'")]
    TransmitTimeout(String),

    #[error("message '{0}' is already being transmitted")]
    DuplicateTransmit(String),

    #[error("invalid content: {0}")]
    InvalidContent(String),

    #[error("outbound queue is closed")]
    OutboundClosed,

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Ipc(#[from] IpcError),

    #[error(transparent)]
    Fetch(#[from] FetchError),
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Replaces the host of detached-content URLs when set.
    pub data_host: Option<String>,
    pub transmit_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            data_host: None,
            transmit_timeout: DEFAULT_TRANSMIT_TIMEOUT,
        }
    }
}

/// Identity of the worker calling `Transmit`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderIdentity {
    pub handler: String,
    /// Peer process ID taken from the socket credentials, if available.
    pub pid: Option<u32>,
}

/// Data a worker wants pushed upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransmitRequest {
    /// Directive for broker-bound data, or a URL for detached-content workers.
    pub addr: String,
    pub message_id: String,
    pub response_to: String,
    pub metadata: HashMap<String, String>,
    pub content: Vec<u8>,
}

/// Receiving halves owned by the client layer.
pub struct DispatcherChannels {
    pub outbound: mpsc::Receiver<Data>,
    pub dispatchers: mpsc::UnboundedReceiver<DispatcherMap>,
}

pub struct Dispatcher {
    config: DispatcherConfig,
    registry: Arc<WorkerRegistry>,
    endpoint: Arc<dyn LocalIpcEndpoint>,
    fetcher: Arc<dyn ContentFetcher>,
    pending: PendingTransmits,
    outbound: mpsc::Sender<Data>,
    dispatchers: mpsc::UnboundedSender<DispatcherMap>,
    events: broadcast::Sender<WorkerEvent>,
}

impl Dispatcher {
    pub fn new(
        config: DispatcherConfig,
        registry: Arc<WorkerRegistry>,
        endpoint: Arc<dyn LocalIpcEndpoint>,
        fetcher: Arc<dyn ContentFetcher>,
    ) -> (Self, DispatcherChannels) {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (map_tx, map_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let dispatcher = Self {
            config,
            registry,
            endpoint,
            fetcher,
            pending: PendingTransmits::new(),
            outbound: outbound_tx,
            dispatchers: map_tx,
            events,
        };
        let channels = DispatcherChannels {
            outbound: outbound_rx,
            dispatchers: map_rx,
        };
        (dispatcher, channels)
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    /// Delivers `message` to the worker that owns its directive.
    pub async fn dispatch(&self, mut message: WorkerMessage) -> Result<(), DispatchError> {
        message.directive = scrub_directive(&message.directive);
        let worker = self
            .registry
            .lookup(&message.directive)
            .ok_or_else(|| DispatchError::UnknownDirective(message.directive.clone()))?;

        if worker.detached_content {
            let url = content::detached_url(&message.content, self.config.data_host.as_deref())?;
            debug!("Fetching detached content for '{}' from {}", message.message_id, url);
            message.content = self.fetcher.get(&url).await?;
        }

        debug!(
            "Dispatching message '{}' to worker '{}'",
            message.message_id, worker.handler
        );
        self.endpoint.dispatch(&worker, message).await?;
        Ok(())
    }

    /// Pushes worker data upstream and waits for the send result.
    pub async fn transmit(
        &self,
        sender: &SenderIdentity,
        request: TransmitRequest,
    ) -> Result<Response, DispatchError> {
        let worker = self
            .registry
            .lookup(&sender.handler)
            .ok_or_else(|| DispatchError::UnknownSender(sender.handler.clone()))?;
        if let (Some(peer), Some(owner)) = (sender.pid, worker.process_id) {
            if peer != owner {
                return Err(DispatchError::SenderMismatch {
                    handler: sender.handler.clone(),
                    pid: peer,
                });
            }
        }

        if worker.detached_content && content::has_scheme(&request.addr) {
            let url = content::parse_with_host(&request.addr, self.config.data_host.as_deref())?;
            debug!("Posting detached content from '{}' to {}", worker.handler, url);
            let response = self
                .fetcher
                .post(&url, &request.metadata, request.content)
                .await?;
            return Ok(response);
        }

        let content = content_value(request.content)?;
        let message_id = if request.message_id.is_empty() {
            crate::protocol::new_message_id()
        } else {
            request.message_id
        };
        let data = Data::new(request.addr, request.metadata, content)
            .with_message_id(message_id.clone())
            .in_response_to(request.response_to);

        let (_guard, response) = self
            .pending
            .reserve(&message_id)
            .ok_or_else(|| DispatchError::DuplicateTransmit(message_id.clone()))?;

        let exchange = async {
            self.outbound
                .send(data)
                .await
                .map_err(|_| DispatchError::OutboundClosed)?;
            response.await.map_err(|_| DispatchError::OutboundClosed)
        };

        match tokio::time::timeout(self.config.transmit_timeout, exchange).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Transmit of message '{}' timed out", message_id);
                Err(DispatchError::TransmitTimeout(message_id))
            }
        }
    }

    /// Reports the send result of an outbound message. Returns false when
    /// the transmitter already gave up.
    pub fn complete_transmit(&self, message_id: &str, response: Response) -> bool {
        self.pending.complete(message_id, response)
    }

    pub fn pending_transmits(&self) -> usize {
        self.pending.len()
    }

    pub fn register_worker(&self, worker: WorkerDescriptor) -> Result<(), DispatchError> {
        let handler = worker.handler.clone();
        self.registry.register(worker)?;
        info!("Registered worker '{}'", handler);
        self.publish_dispatchers();
        Ok(())
    }

    pub fn unregister_worker(&self, handler: &str) -> Option<WorkerDescriptor> {
        let removed = self.registry.unregister(handler);
        if removed.is_some() {
            info!("Unregistered worker '{}'", handler);
            self.publish_dispatchers();
        }
        removed
    }

    /// Forgets every handler owned by an exited process.
    pub fn worker_exited(&self, pid: u32) -> Vec<String> {
        let removed = self.registry.unregister_process(pid);
        if !removed.is_empty() {
            info!("Process {} exited, dropped handlers {:?}", pid, removed);
            self.publish_dispatchers();
        }
        removed
    }

    pub fn feature_changed(&self, handler: &str, features: Features) -> Result<(), DispatchError> {
        self.registry.update_features(handler, features)?;
        debug!("Features of '{}' changed", handler);
        self.publish_dispatchers();
        Ok(())
    }

    /// Current handler map including legacy hyphenated aliases.
    pub fn dispatchers(&self) -> DispatcherMap {
        with_legacy_aliases(self.registry.snapshot())
    }

    fn publish_dispatchers(&self) {
        if self.dispatchers.send(self.dispatchers()).is_err() {
            debug!("Dispatcher map receiver dropped");
        }
    }

    pub async fn cancel(
        &self,
        directive: &str,
        message_id: &str,
        cancel_id: &str,
    ) -> Result<(), DispatchError> {
        let directive = scrub_directive(directive);
        let worker = self
            .registry
            .lookup(&directive)
            .ok_or(DispatchError::UnknownDirective(directive))?;
        self.endpoint.cancel(&worker, message_id, cancel_id).await?;
        Ok(())
    }

    /// Tells every worker the server asked the agent to disconnect.
    pub async fn disconnect_workers(&self) {
        self.notify_workers(DispatcherEvent::ReceivedDisconnect).await;
    }

    pub async fn notify_workers(&self, event: DispatcherEvent) {
        let mut calls = JoinSet::new();
        for worker in self.registry.descriptors() {
            let endpoint = Arc::clone(&self.endpoint);
            calls.spawn(async move {
                if let Err(e) = endpoint.notify(&worker, event).await {
                    warn!(
                        "Failed to notify worker '{}' of {}: {}",
                        worker.handler,
                        event.as_str(),
                        e
                    );
                }
            });
        }
        while calls.join_next().await.is_some() {}
    }

    pub fn publish_event(&self, event: WorkerEvent) {
        // Send only fails when nobody is subscribed.
        let _ = self.events.send(event);
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.events.subscribe()
    }
}

/// Interprets worker bytes as the JSON `content` of a data envelope.
fn content_value(content: Vec<u8>) -> Result<Value, DispatchError> {
    if content.is_empty() {
        return Ok(Value::Null);
    }
    match serde_json::from_slice(&content) {
        Ok(value) => Ok(value),
        Err(_) => String::from_utf8(content)
            .map(Value::String)
            .map_err(|_| DispatchError::InvalidContent("content is neither JSON nor UTF-8".into())),
    }
}
