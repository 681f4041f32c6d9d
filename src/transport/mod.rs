//! Broker connections.
//!
//! Every transport moves opaque byte payloads on two channels, `data` and
//! `control`, and reports what happens on the connection as
//! [`TransportEvent`]s through the receiver handed out by its constructor.

pub mod http;
pub mod mqtt;
pub mod noop;
pub mod tls;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::{AgentConfig, Protocol};
use crate::protocol::{ProtocolError, Response};

pub use http::HttpTransport;
pub use mqtt::MqttTransport;
pub use noop::NoopTransport;
pub use tls::TlsMaterial;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Data,
    Control,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Data => "data",
            Channel::Control => "control",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    /// The connection dropped without being asked to.
    Disconnected,
    Received { channel: Channel, payload: Vec<u8> },
}

pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("invalid server '{server}': {reason}")]
    InvalidServer { server: String, reason: String },

    #[error("cannot connect to {server}: {reason}")]
    Connect { server: String, reason: String },

    #[error("not connected")]
    NotConnected,

    #[error("MQTT client error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server responded with {code}: {body}")]
    Status { code: u16, body: String },

    #[error("cannot read TLS material {path}: {source}")]
    TlsFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid TLS material: {0}")]
    Tls(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// A connection to the remote broker or server.
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> &'static str;

    async fn connect(&self) -> Result<(), TransportError>;

    /// Closes the connection, giving in-flight work up to `quiesce` to finish.
    async fn disconnect(&self, quiesce: Duration);

    async fn send(&self, channel: Channel, payload: Vec<u8>) -> Result<Response, TransportError>;

    /// Swaps in new certificates. A live connection is re-established.
    async fn reload_tls(&self, material: TlsMaterial) -> Result<(), TransportError>;
}

/// Builds the transport selected by `config.protocol`.
pub fn from_config(
    config: &AgentConfig,
    tls: Option<TlsMaterial>,
) -> Result<(Arc<dyn Transport>, TransportEvents), TransportError> {
    match config.protocol {
        Protocol::Mqtt => {
            let (transport, events) = MqttTransport::new(config, tls)?;
            Ok((Arc::new(transport), events))
        }
        Protocol::Http => {
            let (transport, events) = HttpTransport::new(config, tls)?;
            Ok((Arc::new(transport), events))
        }
        Protocol::None => {
            let (transport, events) = NoopTransport::new();
            Ok((Arc::new(transport), events))
        }
    }
}

/// User agent sent on every HTTP request.
pub fn user_agent() -> String {
    format!("courier/{}", env!("CARGO_PKG_VERSION"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_from_config_selects_transport() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AgentConfig::for_state_dir(dir.path());
        let (transport, _events) = from_config(&config, None).unwrap();
        assert_eq!(transport.kind(), "none");

        config.protocol = Protocol::Http;
        config.server = vec!["localhost:8080".to_string()];
        let (transport, _events) = from_config(&config, None).unwrap();
        assert_eq!(transport.kind(), "http");

        config.protocol = Protocol::Mqtt;
        config.server = vec!["mqtt://localhost:1883".to_string()];
        let (transport, _events) = from_config(&config, None).unwrap();
        assert_eq!(transport.kind(), "mqtt");
    }

    #[test]
    fn test_channel_names() {
        assert_eq!(Channel::Data.as_str(), "data");
        assert_eq!(Channel::Control.as_str(), "control");
    }
}
