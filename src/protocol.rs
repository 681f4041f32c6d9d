//! Broker wire envelopes and their JSON encoding.
//!
//! Every envelope shares the header fields `type`, `message_id`,
//! `response_to`, `version` and `sent`. Decoding goes through [`Envelope`],
//! which keeps unrecognised `type` values around so the client layer can
//! decide what to do with them.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Envelope format version written into every message.
pub const PROTOCOL_VERSION: u32 = 1;

/// Response code reported for a successful transmission.
pub const TX_RESPONSE_OK: i32 = 0;
/// Response code reported when a transmission failed.
pub const TX_RESPONSE_ERR: i32 = -1;

/// Capability map announced by a worker.
pub type Features = BTreeMap<String, String>;

/// Handler name to features, as published in connection-status messages.
pub type DispatcherMap = BTreeMap<String, Features>;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("malformed envelope: {0}")]
    Json(#[from] serde_json::Error),

    #[error("envelope has no 'type' field")]
    MissingType,

    #[error("expected a '{expected}' envelope, got '{found}'")]
    UnexpectedType { expected: MessageType, found: MessageType },
}

/// Accepted values of the `type` header field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    ConnectionStatus,
    Command,
    Event,
    Data,
    /// Any value this agent does not understand, kept verbatim.
    Other(String),
}

impl MessageType {
    pub fn as_str(&self) -> &str {
        match self {
            MessageType::ConnectionStatus => "connection-status",
            MessageType::Command => "command",
            MessageType::Event => "event",
            MessageType::Data => "data",
            MessageType::Other(s) => s.as_str(),
        }
    }
}

impl From<String> for MessageType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "connection-status" => MessageType::ConnectionStatus,
            "command" => MessageType::Command,
            "event" => MessageType::Event,
            "data" => MessageType::Data,
            _ => MessageType::Other(value),
        }
    }
}

impl From<MessageType> for String {
    fn from(value: MessageType) -> Self {
        value.as_str().to_string()
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Value of the `state` field of a connection-status message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Online,
    Offline,
}

/// Commands the server can send on the control channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CommandName {
    Ping,
    Disconnect,
    Reconnect,
    Cancel,
    Other(String),
}

impl CommandName {
    pub fn as_str(&self) -> &str {
        match self {
            CommandName::Ping => "ping",
            CommandName::Disconnect => "disconnect",
            CommandName::Reconnect => "reconnect",
            CommandName::Cancel => "cancel",
            CommandName::Other(s) => s.as_str(),
        }
    }
}

impl From<String> for CommandName {
    fn from(value: String) -> Self {
        match value.as_str() {
            "ping" => CommandName::Ping,
            "disconnect" => CommandName::Disconnect,
            "reconnect" => CommandName::Reconnect,
            "cancel" => CommandName::Cancel,
            _ => CommandName::Other(value),
        }
    }
}

impl From<CommandName> for String {
    fn from(value: CommandName) -> Self {
        value.as_str().to_string()
    }
}

impl std::fmt::Display for CommandName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events the agent publishes on the control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventName {
    Pong,
}

impl EventName {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventName::Pong => "pong",
        }
    }
}

/// Payload routed to and from workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Data {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub message_id: String,
    #[serde(default)]
    pub response_to: String,
    pub version: u32,
    pub sent: DateTime<Utc>,
    pub directive: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub content: Value,
}

impl Data {
    pub fn new(directive: impl Into<String>, metadata: HashMap<String, String>, content: Value) -> Self {
        Self {
            kind: MessageType::Data,
            message_id: new_message_id(),
            response_to: String::new(),
            version: PROTOCOL_VERSION,
            sent: Utc::now(),
            directive: directive.into(),
            metadata,
            content,
        }
    }

    /// Keeps a caller-supplied message ID, e.g. one chosen by a worker.
    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = message_id.into();
        self
    }

    pub fn in_response_to(mut self, response_to: impl Into<String>) -> Self {
        self.response_to = response_to.into();
        self
    }

    /// Content as handed to a worker: the raw JSON text of `content`.
    pub fn content_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(&self.content)?)
    }
}

/// Body of a command envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandContent {
    pub command: CommandName,
    #[serde(default, deserialize_with = "null_as_default")]
    pub arguments: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub message_id: String,
    #[serde(default)]
    pub response_to: String,
    pub version: u32,
    pub sent: DateTime<Utc>,
    pub content: CommandContent,
}

impl Command {
    pub fn new(command: CommandName, arguments: HashMap<String, String>) -> Self {
        Self {
            kind: MessageType::Command,
            message_id: new_message_id(),
            response_to: String::new(),
            version: PROTOCOL_VERSION,
            sent: Utc::now(),
            content: CommandContent { command, arguments },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub message_id: String,
    #[serde(default)]
    pub response_to: String,
    pub version: u32,
    pub sent: DateTime<Utc>,
    pub content: String,
}

impl Event {
    pub fn new(name: EventName, response_to: impl Into<String>) -> Self {
        Self {
            kind: MessageType::Event,
            message_id: new_message_id(),
            response_to: response_to.into(),
            version: PROTOCOL_VERSION,
            sent: Utc::now(),
            content: name.as_str().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStatusContent {
    #[serde(default)]
    pub canonical_facts: Value,
    #[serde(default, deserialize_with = "null_as_default")]
    pub dispatchers: DispatcherMap,
    pub state: ConnectionState,
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub tags: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub message_id: String,
    #[serde(default)]
    pub response_to: String,
    pub version: u32,
    pub sent: DateTime<Utc>,
    pub content: ConnectionStatusContent,
}

impl ConnectionStatus {
    pub fn new(content: ConnectionStatusContent) -> Self {
        Self {
            kind: MessageType::ConnectionStatus,
            message_id: new_message_id(),
            response_to: String::new(),
            version: PROTOCOL_VERSION,
            sent: Utc::now(),
            content,
        }
    }

    /// The "offline" status registered as the broker's last will.
    pub fn offline(client_version: impl Into<String>) -> Self {
        Self::new(ConnectionStatusContent {
            canonical_facts: Value::Null,
            dispatchers: DispatcherMap::new(),
            state: ConnectionState::Offline,
            tags: BTreeMap::new(),
            client_version: Some(client_version.into()),
        })
    }
}

/// An envelope whose `type` is not one of the known kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEnvelope {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default)]
    pub message_id: String,
    #[serde(default)]
    pub response_to: String,
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub sent: Option<DateTime<Utc>>,
    #[serde(default)]
    pub content: Value,
}

/// Any decoded envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Data(Data),
    Command(Command),
    Event(Event),
    ConnectionStatus(ConnectionStatus),
    Unknown(RawEnvelope),
}

impl Envelope {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_slice(bytes)?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .map(|s| MessageType::from(s.to_string()))
            .ok_or(ProtocolError::MissingType)?;

        let envelope = match kind {
            MessageType::Data => Envelope::Data(serde_json::from_value(value)?),
            MessageType::Command => Envelope::Command(serde_json::from_value(value)?),
            MessageType::Event => Envelope::Event(serde_json::from_value(value)?),
            MessageType::ConnectionStatus => {
                Envelope::ConnectionStatus(serde_json::from_value(value)?)
            }
            MessageType::Other(_) => Envelope::Unknown(serde_json::from_value(value)?),
        };
        Ok(envelope)
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, ProtocolError> {
        let bytes = match self {
            Envelope::Data(m) => serde_json::to_vec(m)?,
            Envelope::Command(m) => serde_json::to_vec(m)?,
            Envelope::Event(m) => serde_json::to_vec(m)?,
            Envelope::ConnectionStatus(m) => serde_json::to_vec(m)?,
            Envelope::Unknown(m) => serde_json::to_vec(m)?,
        };
        Ok(bytes)
    }

    pub fn kind(&self) -> MessageType {
        match self {
            Envelope::Data(m) => m.kind.clone(),
            Envelope::Command(m) => m.kind.clone(),
            Envelope::Event(m) => m.kind.clone(),
            Envelope::ConnectionStatus(m) => m.kind.clone(),
            Envelope::Unknown(m) => m.kind.clone(),
        }
    }

    pub fn message_id(&self) -> &str {
        match self {
            Envelope::Data(m) => &m.message_id,
            Envelope::Command(m) => &m.message_id,
            Envelope::Event(m) => &m.message_id,
            Envelope::ConnectionStatus(m) => &m.message_id,
            Envelope::Unknown(m) => &m.message_id,
        }
    }

    /// Decodes bytes that must be a data envelope.
    pub fn data_from_slice(bytes: &[u8]) -> Result<Data, ProtocolError> {
        match Self::from_slice(bytes)? {
            Envelope::Data(data) => Ok(data),
            other => Err(ProtocolError::UnexpectedType {
                expected: MessageType::Data,
                found: other.kind(),
            }),
        }
    }
}

/// Result of pushing data upstream, returned to the transmitting worker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    pub code: i32,
    pub metadata: HashMap<String, String>,
    pub data: Vec<u8>,
}

impl Response {
    pub fn ok() -> Self {
        Self {
            code: TX_RESPONSE_OK,
            ..Default::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        let mut metadata = HashMap::new();
        metadata.insert("error".to_string(), message.into());
        Self {
            code: TX_RESPONSE_ERR,
            metadata,
            data: Vec::new(),
        }
    }
}

pub fn new_message_id() -> String {
    Uuid::new_v4().to_string()
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
