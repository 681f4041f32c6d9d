pub mod agent;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod ipc;
pub mod protocol;
pub mod registry;
pub mod supervisor;
pub mod telemetry;
pub mod transport;

pub use agent::Agent;
pub use config::AgentConfig;
pub use dispatch::Dispatcher;
pub use error::{Error, Result};
pub use ipc::AgentClient;
pub use registry::WorkerRegistry;
