//! Control logic between the transport and the dispatcher.
//!
//! The client turns inbound envelopes into dispatches and commands,
//! publishes outbound worker data, and announces the dispatcher map in
//! connection-status messages.

pub mod status;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::dispatch::{DispatchError, Dispatcher, DispatcherChannels};
use crate::ipc::{DispatcherEvent, WorkerMessage};
use crate::protocol::{
    Command, CommandName, Data, DispatcherMap, Envelope, Event, EventName, ProtocolError, Response,
};
use crate::transport::{Channel, Transport, TransportError, TransportEvent, TransportEvents};

pub use status::{DispatcherDigest, StatusBuilder, StatusError};

/// How long the transport gets to flush before a disconnect.
pub const DISCONNECT_QUIESCE: Duration = Duration::from_millis(500);

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("invalid reconnect delay '{0}': expected a non-negative number of seconds")]
    InvalidDelay(String),

    #[error("{command} command has no '{argument}' argument")]
    MissingArgument {
        command: &'static str,
        argument: &'static str,
    },

    #[error("unsupported control message of type '{0}'")]
    UnsupportedMessage(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/// Connection lifecycle as seen by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

pub struct Client {
    transport: Arc<dyn Transport>,
    dispatcher: Arc<Dispatcher>,
    status: StatusBuilder,
    digest: DispatcherDigest,
    state: watch::Sender<ClientState>,
    delay_unit: Duration,
}

impl Client {
    pub fn new(
        transport: Arc<dyn Transport>,
        dispatcher: Arc<Dispatcher>,
        status: StatusBuilder,
    ) -> Self {
        let (state, _) = watch::channel(ClientState::Disconnected);
        Self {
            transport,
            dispatcher,
            status,
            digest: DispatcherDigest::new(),
            state,
            delay_unit: Duration::from_secs(1),
        }
    }

    /// Scales the `delay` argument of reconnect commands.
    pub fn with_delay_unit(mut self, unit: Duration) -> Self {
        self.delay_unit = unit;
        self
    }

    pub fn state(&self) -> ClientState {
        *self.state.borrow()
    }

    fn set_state(&self, state: ClientState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Client state {:?} -> {:?}", previous, state);
        }
    }

    pub async fn connect(&self) -> Result<(), ClientError> {
        self.set_state(ClientState::Connecting);
        match self.transport.connect().await {
            Ok(()) => {
                self.set_state(ClientState::Connected);
                Ok(())
            }
            Err(e) => {
                self.set_state(ClientState::Disconnected);
                Err(e.into())
            }
        }
    }

    pub async fn disconnect(&self, quiesce: Duration) {
        self.set_state(ClientState::Disconnecting);
        self.transport.disconnect(quiesce).await;
        self.set_state(ClientState::Disconnected);
    }

    pub async fn reconnect(&self, delay: Duration) -> Result<(), ClientError> {
        self.disconnect(DISCONNECT_QUIESCE).await;
        if !delay.is_zero() {
            info!("Reconnecting in {:?}", delay);
            tokio::time::sleep(delay).await;
        }
        self.connect().await
    }

    /// Starts the loops feeding the client. They end when `token` is
    /// cancelled or their source closes.
    pub fn start(
        self: &Arc<Self>,
        channels: DispatcherChannels,
        events: TransportEvents,
        token: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let DispatcherChannels {
            mut outbound,
            mut dispatchers,
        } = channels;
        let mut events = events;

        let outbound_loop = {
            let client = Arc::clone(self);
            let token = token.clone();
            tokio::spawn(async move {
                loop {
                    let data = tokio::select! {
                        data = outbound.recv() => match data {
                            Some(data) => data,
                            None => break,
                        },
                        _ = token.cancelled() => break,
                    };
                    client.forward_outbound(data).await;
                }
                trace!("Outbound loop ended");
            })
        };

        let dispatchers_loop = {
            let client = Arc::clone(self);
            let token = token.clone();
            tokio::spawn(async move {
                loop {
                    let map = tokio::select! {
                        map = dispatchers.recv() => match map {
                            Some(map) => map,
                            None => break,
                        },
                        _ = token.cancelled() => break,
                    };
                    if let Err(e) = client.publish_dispatchers(map).await {
                        error!("Cannot send connection status: {}", e);
                    }
                }
                trace!("Dispatcher map loop ended");
            })
        };

        let events_loop = {
            let client = Arc::clone(self);
            tokio::spawn(async move {
                loop {
                    let event = tokio::select! {
                        event = events.recv() => match event {
                            Some(event) => event,
                            None => break,
                        },
                        _ = token.cancelled() => break,
                    };
                    client.handle_transport_event(event);
                }
                trace!("Transport event loop ended");
            })
        };

        vec![outbound_loop, dispatchers_loop, events_loop]
    }

    async fn forward_outbound(&self, data: Data) {
        let message_id = data.message_id.clone();
        let response = match self.send_envelope(Channel::Data, &Envelope::Data(data)).await {
            Ok(response) => {
                debug!(message_id = %message_id, "Published data message");
                response
            }
            Err(e) => {
                error!(message_id = %message_id, "Cannot send data message: {}", e);
                Response::error(e.to_string())
            }
        };
        if !self.dispatcher.complete_transmit(&message_id, response) {
            debug!(message_id = %message_id, "Transmitter stopped waiting");
        }
    }

    /// Reacts to one transport event. Message handling runs on its own task.
    pub fn handle_transport_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {
                self.set_state(ClientState::Connected);
                let client = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(e) = client.publish_connection_status().await {
                        error!("Cannot send connection status: {}", e);
                    }
                    client
                        .dispatcher
                        .notify_workers(DispatcherEvent::ConnectionRestored)
                        .await;
                });
            }
            TransportEvent::Disconnected => {
                // The transport retries on its own.
                self.set_state(ClientState::Connecting);
                let dispatcher = Arc::clone(&self.dispatcher);
                tokio::spawn(async move {
                    dispatcher
                        .notify_workers(DispatcherEvent::UnexpectedDisconnect)
                        .await;
                });
            }
            TransportEvent::Received { channel, payload } => {
                let client = Arc::clone(self);
                tokio::spawn(async move {
                    let result = match channel {
                        Channel::Data => client.handle_data(&payload).await,
                        Channel::Control => client.handle_control(&payload).await,
                    };
                    if let Err(e) = result {
                        error!("Cannot process {} message: {}", channel.as_str(), e);
                    }
                });
            }
        }
    }

    /// Routes a data envelope to its worker.
    pub async fn handle_data(&self, payload: &[u8]) -> Result<(), ClientError> {
        let data = Envelope::data_from_slice(payload)?;
        debug!(message_id = %data.message_id, directive = %data.directive, "Received data message");
        let content = data.content_bytes()?;
        let message = WorkerMessage::new(data.directive, content)
            .message_id(data.message_id)
            .response_to(data.response_to)
            .metadata(data.metadata);
        self.dispatcher.dispatch(message).await?;
        Ok(())
    }

    pub async fn handle_control(&self, payload: &[u8]) -> Result<(), ClientError> {
        match Envelope::from_slice(payload)? {
            Envelope::Command(command) => self.handle_command(command).await,
            other => Err(ClientError::UnsupportedMessage(other.kind().to_string())),
        }
    }

    pub async fn handle_command(&self, command: Command) -> Result<(), ClientError> {
        debug!(message_id = %command.message_id, "Received {} command", command.content.command);
        trace!("Command: {:?}", command);

        match &command.content.command {
            CommandName::Ping => {
                let pong = Event::new(EventName::Pong, command.message_id.clone());
                self.send_envelope(Channel::Control, &Envelope::Event(pong))
                    .await?;
                Ok(())
            }
            CommandName::Disconnect => {
                info!("Disconnecting...");
                self.dispatcher.disconnect_workers().await;
                self.disconnect(DISCONNECT_QUIESCE).await;
                Ok(())
            }
            CommandName::Reconnect => {
                let raw = command
                    .content
                    .arguments
                    .get("delay")
                    .map(String::as_str)
                    .unwrap_or_default();
                let delay = parse_delay(raw)?;
                info!("Reconnecting...");
                self.reconnect(self.delay_unit * delay).await
            }
            CommandName::Cancel => {
                let directive = command.content.arguments.get("directive").ok_or(
                    ClientError::MissingArgument {
                        command: "cancel",
                        argument: "directive",
                    },
                )?;
                let cancel_id = command.content.arguments.get("messageID").ok_or(
                    ClientError::MissingArgument {
                        command: "cancel",
                        argument: "messageID",
                    },
                )?;
                info!("Cancelling message {}", cancel_id);
                self.dispatcher
                    .cancel(directive, &command.message_id, cancel_id)
                    .await?;
                Ok(())
            }
            CommandName::Other(name) => Err(ClientError::UnknownCommand(name.clone())),
        }
    }

    /// Announces the current dispatcher map regardless of what was sent before.
    pub async fn publish_connection_status(&self) -> Result<(), ClientError> {
        let map = self.dispatcher.dispatchers();
        self.digest.changed(&map);
        self.send_status(map).await
    }

    /// Announces `map` unless it equals the last announced map.
    pub async fn publish_dispatchers(&self, map: DispatcherMap) -> Result<(), ClientError> {
        if !self.digest.changed(&map) {
            return Ok(());
        }
        self.send_status(map).await
    }

    async fn send_status(&self, map: DispatcherMap) -> Result<(), ClientError> {
        let status = self.status.online(map);
        let message_id = status.message_id.clone();
        self.send_envelope(Channel::Control, &Envelope::ConnectionStatus(status))
            .await?;
        debug!(message_id = %message_id, "Published connection status");
        Ok(())
    }

    async fn send_envelope(
        &self,
        channel: Channel,
        envelope: &Envelope,
    ) -> Result<Response, ClientError> {
        let payload = envelope.to_vec()?;
        Ok(self.transport.send(channel, payload).await?)
    }
}

/// Reconnect delay in whole seconds.
pub fn parse_delay(raw: &str) -> Result<u32, ClientError> {
    raw.trim().parse::<u32>().map_err(|_| {
        warn!("Rejecting reconnect delay '{}'", raw);
        ClientError::InvalidDelay(raw.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use crate::dispatch::{
        ContentFetcher, DispatcherConfig, FetchError, SenderIdentity, TransmitRequest,
    };
    use crate::ipc::{IpcError, LocalIpcEndpoint};
    use crate::protocol::{ConnectionStatus, Features};
    use crate::registry::{WorkerDescriptor, WorkerRegistry};
    use crate::transport::TlsMaterial;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use url::Url;

    #[derive(Default)]
    struct FakeTransport {
        sent: Mutex<Vec<(Channel, Vec<u8>)>>,
        connects: Mutex<u32>,
        disconnects: Mutex<u32>,
    }

    impl FakeTransport {
        fn sent(&self) -> Vec<(Channel, Envelope)> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|(c, p)| (*c, Envelope::from_slice(p).unwrap()))
                .collect()
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        fn kind(&self) -> &'static str {
            "fake"
        }

        async fn connect(&self) -> Result<(), TransportError> {
            *self.connects.lock().unwrap() += 1;
            Ok(())
        }

        async fn disconnect(&self, _quiesce: Duration) {
            *self.disconnects.lock().unwrap() += 1;
        }

        async fn send(&self, channel: Channel, payload: Vec<u8>) -> Result<Response, TransportError> {
            self.sent.lock().unwrap().push((channel, payload));
            Ok(Response::ok())
        }

        async fn reload_tls(&self, _material: TlsMaterial) -> Result<(), TransportError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeEndpoint {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl LocalIpcEndpoint for FakeEndpoint {
        async fn dispatch(&self, w: &WorkerDescriptor, m: WorkerMessage) -> Result<(), IpcError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("dispatch {} {}", w.handler, m.message_id));
            Ok(())
        }

        async fn cancel(&self, w: &WorkerDescriptor, id: &str, cancel: &str) -> Result<(), IpcError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("cancel {} {} {}", w.handler, id, cancel));
            Ok(())
        }

        async fn notify(&self, w: &WorkerDescriptor, e: DispatcherEvent) -> Result<(), IpcError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("notify {} {}", w.handler, e.as_str()));
            Ok(())
        }
    }

    struct NoFetch;

    #[async_trait]
    impl ContentFetcher for NoFetch {
        async fn get(&self, url: &Url) -> Result<Vec<u8>, FetchError> {
            Err(FetchError::InvalidUrl {
                url: url.to_string(),
                reason: "offline".to_string(),
            })
        }

        async fn post(
            &self,
            url: &Url,
            _metadata: &HashMap<String, String>,
            _body: Vec<u8>,
        ) -> Result<Response, FetchError> {
            Err(FetchError::InvalidUrl {
                url: url.to_string(),
                reason: "offline".to_string(),
            })
        }
    }

    struct Harness {
        client: Arc<Client>,
        transport: Arc<FakeTransport>,
        endpoint: Arc<FakeEndpoint>,
        dispatcher: Arc<Dispatcher>,
        channels: Option<DispatcherChannels>,
        _dir: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let config = AgentConfig::for_state_dir(dir.path());
        let transport = Arc::new(FakeTransport::default());
        let endpoint = Arc::new(FakeEndpoint::default());
        let (dispatcher, channels) = Dispatcher::new(
            DispatcherConfig::default(),
            Arc::new(WorkerRegistry::new()),
            endpoint.clone(),
            Arc::new(NoFetch),
        );
        let dispatcher = Arc::new(dispatcher);
        dispatcher
            .register_worker(WorkerDescriptor::new("echo", "/tmp/echo.sock"))
            .unwrap();
        let client = Client::new(
            transport.clone(),
            Arc::clone(&dispatcher),
            StatusBuilder::from_config(&config),
        )
        .with_delay_unit(Duration::from_millis(1));

        Harness {
            client: Arc::new(client),
            transport,
            endpoint,
            dispatcher,
            channels: Some(channels),
            _dir: dir,
        }
    }

    fn command(name: &str, args: &[(&str, &str)]) -> Command {
        let arguments = args
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Command::new(CommandName::from(name.to_string()), arguments)
    }

    #[tokio::test]
    async fn test_ping_answers_with_pong() {
        let h = harness();
        let ping = command("ping", &[]);
        h.client.handle_command(ping.clone()).await.unwrap();

        let sent = h.transport.sent();
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            (Channel::Control, Envelope::Event(event)) => {
                assert_eq!(event.content, "pong");
                assert_eq!(event.response_to, ping.message_id);
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_disconnect_notifies_workers() {
        let h = harness();
        h.client.connect().await.unwrap();
        h.client
            .handle_command(command("disconnect", &[]))
            .await
            .unwrap();

        assert_eq!(h.client.state(), ClientState::Disconnected);
        assert_eq!(*h.transport.disconnects.lock().unwrap(), 1);
        assert_eq!(
            *h.endpoint.calls.lock().unwrap(),
            vec!["notify echo received-disconnect".to_string()]
        );
    }

    #[tokio::test]
    async fn test_reconnect_with_valid_delay() {
        let h = harness();
        h.client.connect().await.unwrap();
        h.client
            .handle_command(command("reconnect", &[("delay", "2")]))
            .await
            .unwrap();

        assert_eq!(h.client.state(), ClientState::Connected);
        assert_eq!(*h.transport.disconnects.lock().unwrap(), 1);
        assert_eq!(*h.transport.connects.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_reconnect_with_bad_delay_keeps_connection() {
        let h = harness();
        h.client.connect().await.unwrap();
        for bad in ["-5", "soon", ""] {
            let err = h
                .client
                .handle_command(command("reconnect", &[("delay", bad)]))
                .await
                .unwrap_err();
            assert!(matches!(err, ClientError::InvalidDelay(_)));
        }
        assert_eq!(h.client.state(), ClientState::Connected);
        assert_eq!(*h.transport.disconnects.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cancel_routes_to_worker() {
        let h = harness();
        let cancel = command("cancel", &[("directive", "echo"), ("messageID", "m-1")]);
        h.client.handle_command(cancel.clone()).await.unwrap();
        assert_eq!(
            *h.endpoint.calls.lock().unwrap(),
            vec![format!("cancel echo {} m-1", cancel.message_id)]
        );

        let err = h
            .client
            .handle_command(command("cancel", &[("directive", "echo")]))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::MissingArgument { argument: "messageID", .. }));
    }

    #[tokio::test]
    async fn test_unknown_command_and_message_type() {
        let h = harness();
        let err = h
            .client
            .handle_command(command("self-destruct", &[]))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::UnknownCommand(ref name) if name == "self-destruct"));

        let event = Envelope::Event(Event::new(EventName::Pong, "x")).to_vec().unwrap();
        let err = h.client.handle_control(&event).await.unwrap_err();
        assert!(matches!(err, ClientError::UnsupportedMessage(ref kind) if kind == "event"));
    }

    #[tokio::test]
    async fn test_data_message_is_dispatched() {
        let h = harness();
        let data = Data::new("echo", HashMap::new(), serde_json::json!({"hello": "world"}));
        let payload = Envelope::Data(data.clone()).to_vec().unwrap();
        h.client.handle_data(&payload).await.unwrap();
        assert_eq!(
            *h.endpoint.calls.lock().unwrap(),
            vec![format!("dispatch echo {}", data.message_id)]
        );
    }

    #[tokio::test]
    async fn test_connection_status_is_deduplicated() {
        let h = harness();
        let map = h.dispatcher.dispatchers();
        h.client.publish_dispatchers(map.clone()).await.unwrap();
        h.client.publish_dispatchers(map.clone()).await.unwrap();

        let sent = h.transport.sent();
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            (Channel::Control, Envelope::ConnectionStatus(ConnectionStatus { content, .. })) => {
                assert!(content.dispatchers.contains_key("echo"));
            }
            other => panic!("unexpected message {:?}", other),
        }

        let mut changed = map;
        changed.insert("other".to_string(), Features::new());
        h.client.publish_dispatchers(changed).await.unwrap();
        assert_eq!(h.transport.sent().len(), 2);
    }

    #[tokio::test]
    async fn test_transmit_is_published_and_answered() {
        let mut h = harness();
        let token = CancellationToken::new();
        let (_tx, events) = tokio::sync::mpsc::unbounded_channel();
        let handles = h
            .client
            .start(h.channels.take().unwrap(), events, token.clone());

        let sender = SenderIdentity {
            handler: "echo".to_string(),
            pid: None,
        };
        let response = h
            .dispatcher
            .transmit(
                &sender,
                TransmitRequest {
                    addr: "echo".to_string(),
                    message_id: "m-42".to_string(),
                    response_to: String::new(),
                    metadata: HashMap::new(),
                    content: br#"{"ok": true}"#.to_vec(),
                },
            )
            .await
            .unwrap();
        assert_eq!(response.code, 0);

        let sent = h.transport.sent();
        assert!(sent.iter().any(|(channel, envelope)| {
            *channel == Channel::Data && envelope.message_id() == "m-42"
        }));

        token.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[test]
    fn test_parse_delay() {
        assert_eq!(parse_delay("30").unwrap(), 30);
        assert_eq!(parse_delay(" 0 ").unwrap(), 0);
        assert!(parse_delay("-1").is_err());
        assert!(parse_delay("1.5").is_err());
    }
}
