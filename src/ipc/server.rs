use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::frame::{read_request, write_response, Request, Response, WorkerInfo};
use super::IpcError;
use crate::config::AgentConfig;
use crate::dispatch::{Dispatcher, SenderIdentity, TransmitRequest};
use crate::registry::WorkerDescriptor;
use crate::supervisor::WorkerSupervisor;

/// The agent socket. Workers register and transmit through it; the CLI
/// uses it to inject messages and watch worker events.
pub struct IpcServer {
    socket_path: PathBuf,
    worker_socket_dir: PathBuf,
    dispatcher: Arc<Dispatcher>,
    supervisor: Option<Arc<WorkerSupervisor>>,
    started_at: Instant,
    version: String,
}

impl IpcServer {
    pub fn new(config: &AgentConfig, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            socket_path: config.socket_path.clone(),
            worker_socket_dir: config.worker_socket_dir(),
            dispatcher,
            supervisor: None,
            started_at: Instant::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Lets registrations fall back to the worker's config file for
    /// features and content mode.
    pub fn with_supervisor(mut self, supervisor: Arc<WorkerSupervisor>) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Creates the socket, replacing a stale one, readable by the owner only.
    pub fn bind(&self) -> Result<UnixListener, IpcError> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let listener = UnixListener::bind(&self.socket_path)?;

        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&self.socket_path, perms)?;

        info!("IPC server listening on: {}", self.socket_path.display());
        Ok(listener)
    }

    pub async fn run(self: Arc<Self>, token: CancellationToken) -> Result<(), IpcError> {
        let listener = self.bind()?;
        self.serve(listener, token).await
    }

    /// Accepts connections until `token` is cancelled, then removes the socket.
    pub async fn serve(
        self: Arc<Self>,
        listener: UnixListener,
        token: CancellationToken,
    ) -> Result<(), IpcError> {
        loop {
            tokio::select! {
                conn = listener.accept() => match conn {
                    Ok((stream, _)) => {
                        let server = Arc::clone(&self);
                        let token = token.clone();
                        tokio::spawn(async move {
                            if let Err(e) = server.handle_connection(stream, token).await {
                                match e {
                                    IpcError::Closed => trace!("Client hung up"),
                                    e => error!("Connection handler error: {}", e),
                                }
                            }
                        });
                    }
                    Err(e) => error!("Accept error: {}", e),
                },
                _ = token.cancelled() => break,
            }
        }

        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }
        debug!("IPC server stopped");
        Ok(())
    }

    async fn handle_connection(
        &self,
        mut stream: UnixStream,
        token: CancellationToken,
    ) -> Result<(), IpcError> {
        trace!("New connection accepted");
        let peer = stream
            .peer_cred()
            .ok()
            .and_then(|cred| cred.pid())
            .and_then(|pid| u32::try_from(pid).ok());

        let request = read_request(&mut stream).await?;
        if let Request::Subscribe { worker } = request {
            return self.stream_events(stream, worker, token).await;
        }

        let response = self.handle_request(request, peer).await;
        write_response(&mut stream, &response).await?;
        trace!("Response sent");
        Ok(())
    }

    async fn handle_request(&self, request: Request, peer: Option<u32>) -> Response {
        match request {
            Request::Ping => {
                debug!("Handling: Ping");
                Response::Pong {
                    uptime_secs: self.started_at.elapsed().as_secs(),
                    version: self.version.clone(),
                }
            }

            Request::Register {
                handler,
                pid,
                address,
                features,
                detached_content,
            } => {
                debug!("Handling: Register({})", handler);
                self.register(handler, peer.or(pid), address, features, detached_content)
            }

            Request::Unregister { handler } => {
                debug!("Handling: Unregister({})", handler);
                if let Err(response) = self.check_owner(&handler, peer) {
                    return response;
                }
                match self.dispatcher.unregister_worker(&handler) {
                    Some(_) => Response::Ok,
                    None => error_response(format!("handler '{}' is not registered", handler)),
                }
            }

            Request::Transmit {
                handler,
                addr,
                message_id,
                response_to,
                metadata,
                content,
            } => {
                debug!("Handling: Transmit({} -> {})", handler, addr);
                let sender = SenderIdentity { handler, pid: peer };
                let request = TransmitRequest {
                    addr,
                    message_id,
                    response_to,
                    metadata,
                    content,
                };
                match self.dispatcher.transmit(&sender, request).await {
                    Ok(response) => Response::Transmitted {
                        code: response.code,
                        metadata: response.metadata,
                        data: response.data,
                    },
                    Err(e) => error_response(e),
                }
            }

            Request::FeaturesChanged { handler, features } => {
                debug!("Handling: FeaturesChanged({})", handler);
                if let Err(response) = self.check_owner(&handler, peer) {
                    return response;
                }
                match self.dispatcher.feature_changed(&handler, features) {
                    Ok(()) => Response::Ok,
                    Err(e) => error_response(e),
                }
            }

            Request::EmitEvent(event) => {
                trace!(
                    "Handling: EmitEvent({} {})",
                    event.worker,
                    event.name.as_str()
                );
                if let Err(response) = self.check_owner(&event.worker, peer) {
                    return response;
                }
                self.dispatcher.publish_event(event);
                Response::Ok
            }

            Request::Dispatch(message) => {
                debug!("Handling: Dispatch({})", message.directive);
                match self.dispatcher.dispatch(message).await {
                    Ok(()) => Response::Ok,
                    Err(e) => error_response(e),
                }
            }

            Request::ListWorkers => {
                debug!("Handling: ListWorkers");
                let list = self
                    .dispatcher
                    .registry()
                    .descriptors()
                    .into_iter()
                    .map(WorkerInfo::from)
                    .collect();
                Response::Workers { list }
            }

            Request::Subscribe { .. } => error_response("subscribe needs a dedicated connection"),

            Request::Deliver(_) | Request::Cancel { .. } | Request::Notify { .. } => {
                error_response("worker-bound request sent to the agent")
            }
        }
    }

    fn register(
        &self,
        handler: String,
        pid: Option<u32>,
        address: String,
        mut features: std::collections::BTreeMap<String, String>,
        mut detached_content: bool,
    ) -> Response {
        if let Some(declared) = self
            .supervisor
            .as_ref()
            .and_then(|s| s.declared(&handler))
        {
            if features.is_empty() {
                features = declared.features;
            }
            detached_content |= declared.remote_content;
        }

        let address = if address.is_empty() {
            self.assign_address(&handler)
        } else {
            address
        };

        let mut descriptor = WorkerDescriptor::new(handler, address.clone())
            .features(features)
            .detached_content(detached_content);
        if let Some(pid) = pid {
            descriptor = descriptor.process_id(pid);
        }

        match self.dispatcher.register_worker(descriptor) {
            Ok(()) => Response::Registered { address },
            Err(e) => error_response(e),
        }
    }

    fn assign_address(&self, handler: &str) -> String {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        self.worker_socket_dir
            .join(format!("{}-{}.sock", handler, &suffix[..8]))
            .display()
            .to_string()
    }

    async fn stream_events(
        &self,
        mut stream: UnixStream,
        worker: Option<String>,
        token: CancellationToken,
    ) -> Result<(), IpcError> {
        debug!("Handling: Subscribe({:?})", worker);
        let mut events = self.dispatcher.subscribe_events();
        write_response(&mut stream, &Response::Ok).await?;

        loop {
            let event = tokio::select! {
                event = events.recv() => event,
                _ = token.cancelled() => break,
            };
            match event {
                Ok(event) => {
                    if worker.as_ref().is_some_and(|w| *w != event.worker) {
                        continue;
                    }
                    write_response(&mut stream, &Response::Event(event)).await?;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Event subscriber lagged, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        write_response(&mut stream, &Response::StreamEnd).await
    }

    /// Rejects a caller whose peer PID differs from the PID that registered
    /// `handler`. Unknown PIDs on either side are let through.
    fn check_owner(&self, handler: &str, peer: Option<u32>) -> Result<(), Response> {
        let owner = self
            .dispatcher
            .registry()
            .lookup(handler)
            .and_then(|w| w.process_id);
        match (peer, owner) {
            (Some(peer), Some(owner)) if peer != owner => {
                warn!("Process {} tried to act as handler '{}'", peer, handler);
                Err(error_response(format!(
                    "process {} does not own handler '{}'",
                    peer, handler
                )))
            }
            _ => Ok(()),
        }
    }
}

fn error_response(message: impl ToString) -> Response {
    Response::Error {
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{DispatcherConfig, HttpContentFetcher};
    use crate::ipc::{AgentClient, IpcError, SocketEndpoint, WorkerEvent, WorkerEventName};
    use crate::registry::WorkerRegistry;
    use std::collections::BTreeMap;
    use std::time::Duration;

    struct Harness {
        _dir: tempfile::TempDir,
        client: AgentClient,
        dispatcher: Arc<Dispatcher>,
        token: CancellationToken,
    }

    async fn start() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let config = AgentConfig::for_state_dir(dir.path());
        let (dispatcher, _channels) = Dispatcher::new(
            DispatcherConfig::default(),
            Arc::new(WorkerRegistry::new()),
            Arc::new(SocketEndpoint::new(Duration::from_secs(5))),
            Arc::new(HttpContentFetcher::new(reqwest::Client::new())),
        );
        let dispatcher = Arc::new(dispatcher);
        let server = Arc::new(IpcServer::new(&config, Arc::clone(&dispatcher)));
        let listener = server.bind().unwrap();
        let token = CancellationToken::new();
        tokio::spawn(server.serve(listener, token.clone()));

        Harness {
            client: AgentClient::new(&config.socket_path),
            _dir: dir,
            dispatcher,
            token,
        }
    }

    #[tokio::test]
    async fn test_ping() {
        let h = start().await;
        let (_, version) = h.client.ping().await.unwrap();
        assert_eq!(version, env!("CARGO_PKG_VERSION"));
        h.token.cancel();
    }

    #[tokio::test]
    async fn test_register_assigns_address() {
        let h = start().await;
        let address = h
            .client
            .register("echo", None, BTreeMap::new(), false)
            .await
            .unwrap();
        assert!(address.contains("sockets"));
        assert!(address.ends_with(".sock"));

        let workers = h.client.list_workers().await.unwrap();
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].handler, "echo");
        assert_eq!(workers[0].pid, Some(std::process::id()));

        let err = h
            .client
            .register("echo", Some("/tmp/other.sock"), BTreeMap::new(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, IpcError::Remote(_)));
        h.token.cancel();
    }

    #[tokio::test]
    async fn test_dispatch_to_unknown_directive() {
        let h = start().await;
        let err = h
            .client
            .dispatch("nobody", Default::default(), b"{}".to_vec())
            .await
            .unwrap_err();
        match err {
            IpcError::Remote(message) => assert!(message.contains("nobody")),
            other => panic!("unexpected error {:?}", other),
        }
        h.token.cancel();
    }

    #[tokio::test]
    async fn test_subscribe_filters_by_worker() {
        let h = start().await;
        let mut stream = h.client.subscribe(Some("echo")).await.unwrap();

        h.dispatcher
            .publish_event(WorkerEvent::new("other", WorkerEventName::Begin));
        h.dispatcher
            .publish_event(WorkerEvent::new("echo", WorkerEventName::Working).message_id("m-1"));

        let event = stream.next().await.unwrap().unwrap();
        assert_eq!(event.worker, "echo");
        assert_eq!(event.message_id, "m-1");

        h.token.cancel();
        assert_eq!(stream.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unregister_and_features() {
        let h = start().await;
        h.client
            .register("echo", Some("/tmp/echo.sock"), BTreeMap::new(), false)
            .await
            .unwrap();

        let mut features = BTreeMap::new();
        features.insert("version".to_string(), "2".to_string());
        h.client.features_changed("echo", features).await.unwrap();
        assert_eq!(
            h.dispatcher.dispatchers()["echo"].get("version").map(String::as_str),
            Some("2")
        );

        h.client.unregister("echo").await.unwrap();
        assert!(h.client.unregister("echo").await.is_err());
        h.token.cancel();
    }

    #[tokio::test]
    async fn test_foreign_process_cannot_act_as_worker() {
        let h = start().await;
        let owner = std::process::id().wrapping_add(1);
        h.dispatcher
            .register_worker(WorkerDescriptor::new("echo", "/tmp/echo.sock").process_id(owner))
            .unwrap();
        let mut events = h.dispatcher.subscribe_events();

        let mut features = BTreeMap::new();
        features.insert("version".to_string(), "2".to_string());
        let err = h.client.features_changed("echo", features).await.unwrap_err();
        assert!(matches!(err, IpcError::Remote(ref m) if m.contains("does not own")));
        assert!(h.dispatcher.dispatchers()["echo"].get("version").is_none());

        let err = h
            .client
            .emit_event(WorkerEvent::new("echo", WorkerEventName::Working))
            .await
            .unwrap_err();
        assert!(matches!(err, IpcError::Remote(_)));
        assert!(events.try_recv().is_err());

        assert!(h.client.unregister("echo").await.is_err());
        assert!(h.dispatcher.registry().lookup("echo").is_some());
        h.token.cancel();
    }
}
