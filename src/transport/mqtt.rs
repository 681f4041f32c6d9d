use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet, QoS, TlsConfiguration,
};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use url::Url;

use super::{Channel, TlsMaterial, Transport, TransportError, TransportEvent, TransportEvents};
use crate::config::AgentConfig;
use crate::protocol::{ConnectionStatus, Response};

const DEFAULT_PORT: u16 = 1883;
const DEFAULT_TLS_PORT: u16 = 8883;
const KEEP_ALIVE: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const REQUEST_CAPACITY: usize = 64;

/// `<prefix>/<client-id>/{data,control}/{in,out}`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    pub data_in: String,
    pub data_out: String,
    pub control_in: String,
    pub control_out: String,
}

impl Topics {
    pub fn new(prefix: &str, client_id: &str) -> Self {
        let base = format!("{}/{}", prefix.trim_end_matches('/'), client_id);
        Self {
            data_in: format!("{}/data/in", base),
            data_out: format!("{}/data/out", base),
            control_in: format!("{}/control/in", base),
            control_out: format!("{}/control/out", base),
        }
    }

    pub fn outbound(&self, channel: Channel) -> &str {
        match channel {
            Channel::Data => &self.data_out,
            Channel::Control => &self.control_out,
        }
    }

    pub fn inbound_channel(&self, topic: &str) -> Option<Channel> {
        if topic == self.data_in {
            Some(Channel::Data)
        } else if topic == self.control_in {
            Some(Channel::Control)
        } else {
            None
        }
    }
}

/// Host, port and whether the broker expects TLS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl BrokerAddress {
    pub fn parse(server: &str) -> Result<Self, TransportError> {
        let invalid = |reason: &str| TransportError::InvalidServer {
            server: server.to_string(),
            reason: reason.to_string(),
        };
        let url = Url::parse(server).map_err(|e| invalid(&e.to_string()))?;
        let tls = match url.scheme() {
            "mqtt" | "tcp" => false,
            "mqtts" | "ssl" | "tls" => true,
            _ => return Err(invalid("scheme must be mqtt, tcp, mqtts, ssl or tls")),
        };
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| invalid("missing host"))?
            .to_string();
        let port = url
            .port()
            .unwrap_or(if tls { DEFAULT_TLS_PORT } else { DEFAULT_PORT });
        Ok(Self { host, port, tls })
    }
}

impl std::fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let scheme = if self.tls { "mqtts" } else { "mqtt" };
        write!(f, "{}://{}:{}", scheme, self.host, self.port)
    }
}

struct Session {
    client: AsyncClient,
    closing: Arc<AtomicBool>,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct MqttTransport {
    client_id: String,
    brokers: Vec<BrokerAddress>,
    topics: Topics,
    last_will: Vec<u8>,
    tls: RwLock<Option<TlsMaterial>>,
    events: mpsc::UnboundedSender<TransportEvent>,
    session: Mutex<Option<Session>>,
}

impl MqttTransport {
    pub fn new(
        config: &AgentConfig,
        tls: Option<TlsMaterial>,
    ) -> Result<(Self, TransportEvents), TransportError> {
        let brokers = config
            .server
            .iter()
            .map(|s| BrokerAddress::parse(s))
            .collect::<Result<Vec<_>, _>>()?;
        if brokers.is_empty() {
            return Err(TransportError::InvalidServer {
                server: String::new(),
                reason: "no MQTT broker configured".to_string(),
            });
        }

        let offline = ConnectionStatus::offline(env!("CARGO_PKG_VERSION"));
        let last_will = serde_json::to_vec(&offline).map_err(crate::protocol::ProtocolError::from)?;
        let (events, rx) = mpsc::unbounded_channel();

        let transport = Self {
            client_id: config.client_id.clone(),
            brokers,
            topics: Topics::new(&config.path_prefix, &config.client_id),
            last_will,
            tls: RwLock::new(tls),
            events,
            session: Mutex::new(None),
        };
        Ok((transport, rx))
    }

    fn options(&self, broker: &BrokerAddress) -> Result<MqttOptions, TransportError> {
        let mut options = MqttOptions::new(&self.client_id, &broker.host, broker.port);
        options.set_keep_alive(KEEP_ALIVE);
        options.set_clean_session(true);
        options.set_last_will(LastWill::new(
            &self.topics.control_out,
            self.last_will.clone(),
            QoS::AtLeastOnce,
            false,
        ));

        if broker.tls {
            let material = self
                .tls
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
                .unwrap_or_default();
            let network = if material.ca_roots.is_empty() && !material.has_identity() {
                rumqttc::Transport::tls_with_default_config()
            } else {
                let client_auth = match (material.cert_pem, material.key_pem) {
                    (Some(cert), Some(key)) => Some((cert, key)),
                    _ => None,
                };
                if material.ca_roots.is_empty() {
                    return Err(TransportError::Tls(
                        "client certificates need at least one CA root for MQTT".to_string(),
                    ));
                }
                rumqttc::Transport::Tls(TlsConfiguration::Simple {
                    ca: material.ca_roots.concat(),
                    alpn: None,
                    client_auth,
                })
            };
            options.set_transport(network);
        }
        Ok(options)
    }

    async fn open(&self, broker: &BrokerAddress) -> Result<Session, TransportError> {
        let options = self.options(broker)?;
        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let closing = Arc::new(AtomicBool::new(false));
        let token = CancellationToken::new();
        let (ready_tx, ready_rx) = oneshot::channel();

        let handle = tokio::spawn(run_event_loop(EventLoopContext {
            broker: broker.to_string(),
            eventloop,
            client: client.clone(),
            topics: self.topics.clone(),
            events: self.events.clone(),
            closing: Arc::clone(&closing),
            token: token.clone(),
            ready: Some(ready_tx),
        }));

        let failed = |reason: String| TransportError::Connect {
            server: broker.to_string(),
            reason,
        };
        let outcome = match tokio::time::timeout(CONNECT_TIMEOUT, ready_rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(reason))) => Err(failed(reason)),
            Ok(Err(_)) => Err(failed("event loop ended".to_string())),
            Err(_) => Err(failed("timed out waiting for CONNACK".to_string())),
        };
        match outcome {
            Ok(()) => Ok(Session {
                client,
                closing,
                token,
                handle,
            }),
            Err(e) => {
                token.cancel();
                handle.abort();
                Err(e)
            }
        }
    }

    async fn close(session: Session, quiesce: Duration) {
        session.closing.store(true, Ordering::SeqCst);
        if let Err(e) = session.client.disconnect().await {
            debug!("MQTT disconnect request failed: {}", e);
        }
        let mut handle = session.handle;
        if tokio::time::timeout(quiesce, &mut handle).await.is_err() {
            trace!("MQTT event loop still busy after {:?}, stopping it", quiesce);
            session.token.cancel();
            handle.abort();
        }
    }
}

#[async_trait]
impl Transport for MqttTransport {
    fn kind(&self) -> &'static str {
        "mqtt"
    }

    async fn connect(&self) -> Result<(), TransportError> {
        let mut session = self.session.lock().await;
        if session.is_some() {
            return Ok(());
        }

        let mut last_error = TransportError::NotConnected;
        for broker in &self.brokers {
            debug!("Connecting to MQTT broker {}", broker);
            match self.open(broker).await {
                Ok(opened) => {
                    *session = Some(opened);
                    return Ok(());
                }
                Err(e) => {
                    warn!("{}", e);
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    async fn disconnect(&self, quiesce: Duration) {
        let session = self.session.lock().await.take();
        if let Some(session) = session {
            info!("Disconnecting from MQTT broker");
            Self::close(session, quiesce).await;
        }
    }

    async fn send(&self, channel: Channel, payload: Vec<u8>) -> Result<Response, TransportError> {
        let client = match self.session.lock().await.as_ref() {
            Some(session) => session.client.clone(),
            None => return Err(TransportError::NotConnected),
        };
        let topic = self.topics.outbound(channel);
        client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await?;
        debug!("Published message to topic {}", topic);
        Ok(Response::ok())
    }

    async fn reload_tls(&self, material: TlsMaterial) -> Result<(), TransportError> {
        *self.tls.write().unwrap_or_else(PoisonError::into_inner) = Some(material);
        let was_connected = self.session.lock().await.is_some();
        if was_connected {
            info!("TLS material changed, reconnecting to MQTT broker");
            self.disconnect(Duration::from_millis(500)).await;
            self.connect().await?;
        }
        Ok(())
    }
}

struct EventLoopContext {
    broker: String,
    eventloop: EventLoop,
    client: AsyncClient,
    topics: Topics,
    events: mpsc::UnboundedSender<TransportEvent>,
    closing: Arc<AtomicBool>,
    token: CancellationToken,
    ready: Option<oneshot::Sender<Result<(), String>>>,
}

/// Drives the connection. rumqttc reconnects on the next poll after an error.
async fn run_event_loop(mut ctx: EventLoopContext) {
    let mut online = false;
    loop {
        let polled = tokio::select! {
            polled = ctx.eventloop.poll() => polled,
            _ = ctx.token.cancelled() => break,
        };

        match polled {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("Connected to MQTT broker {}", ctx.broker);
                on_connect(&ctx.client, &ctx.topics);
                online = true;
                if let Some(ready) = ctx.ready.take() {
                    let _ = ready.send(Ok(()));
                }
                let _ = ctx.events.send(TransportEvent::Connected);
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                debug!("Received a message on topic {}", publish.topic);
                match ctx.topics.inbound_channel(&publish.topic) {
                    Some(channel) => {
                        let _ = ctx.events.send(TransportEvent::Received {
                            channel,
                            payload: publish.payload.to_vec(),
                        });
                    }
                    None => error!("Unhandled message on topic {}", publish.topic),
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("Sent MQTT disconnect");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                if ctx.closing.load(Ordering::SeqCst) {
                    break;
                }
                if let Some(ready) = ctx.ready.take() {
                    let _ = ready.send(Err(e.to_string()));
                    break;
                }
                if online {
                    error!("Connection lost unexpectedly: {}", e);
                    online = false;
                    let _ = ctx.events.send(TransportEvent::Disconnected);
                } else {
                    debug!("Reconnect to {} failed: {}", ctx.broker, e);
                }
                tokio::select! {
                    _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                    _ = ctx.token.cancelled() => break,
                }
            }
        }
    }
    trace!("MQTT event loop for {} ended", ctx.broker);
}

fn on_connect(client: &AsyncClient, topics: &Topics) {
    // Some brokers only create a topic once something was published to it.
    if let Err(e) = client.try_publish(&topics.data_out, QoS::AtMostOnce, false, Vec::new()) {
        warn!("Cannot publish to {}: {}", topics.data_out, e);
    }
    for topic in [&topics.data_in, &topics.control_in] {
        match client.try_subscribe(topic, QoS::AtLeastOnce) {
            Ok(()) => trace!("Subscribed to topic {}", topic),
            Err(e) => error!("Cannot subscribe to {}: {}", topic, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topics() {
        let topics = Topics::new("yggdrasil", "abc");
        assert_eq!(topics.data_in, "yggdrasil/abc/data/in");
        assert_eq!(topics.outbound(Channel::Control), "yggdrasil/abc/control/out");
        assert_eq!(topics.inbound_channel("yggdrasil/abc/control/in"), Some(Channel::Control));
        assert_eq!(topics.inbound_channel("yggdrasil/abc/data/out"), None);
    }

    #[test]
    fn test_broker_address() {
        assert_eq!(
            BrokerAddress::parse("mqtt://broker.example.com").unwrap(),
            BrokerAddress {
                host: "broker.example.com".to_string(),
                port: 1883,
                tls: false
            }
        );
        let tls = BrokerAddress::parse("ssl://broker.example.com:9000").unwrap();
        assert!(tls.tls);
        assert_eq!(tls.port, 9000);
        assert!(BrokerAddress::parse("http://broker.example.com").is_err());
        assert!(BrokerAddress::parse("broker.example.com").is_err());
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AgentConfig::for_state_dir(dir.path());
        config.server = vec!["mqtt://127.0.0.1:1".to_string()];
        let (transport, _events) = MqttTransport::new(&config, None).unwrap();

        let err = transport.send(Channel::Data, b"{}".to_vec()).await.unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AgentConfig::for_state_dir(dir.path());
        config.server = vec!["mqtt://127.0.0.1:1".to_string()];
        let (transport, _events) = MqttTransport::new(&config, None).unwrap();

        let err = transport.connect().await.unwrap_err();
        assert!(matches!(err, TransportError::Connect { .. }));
    }
}
