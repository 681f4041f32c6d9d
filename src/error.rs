use thiserror::Error;

use crate::client::{ClientError, StatusError};
use crate::config::ConfigError;
use crate::dispatch::{DispatchError, FetchError};
use crate::ipc::IpcError;
use crate::protocol::ProtocolError;
use crate::registry::RegistryError;
use crate::supervisor::SupervisorError;
use crate::telemetry::TelemetryError;
use crate::transport::TransportError;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Telemetry(#[from] TelemetryError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Ipc(#[from] IpcError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Status(#[from] StatusError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
