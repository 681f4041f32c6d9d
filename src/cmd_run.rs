use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use courier::config::{AgentConfig, PartialConfig};
use courier::{telemetry, Agent};

pub async fn cmd_run(config_file: Option<&Path>, flags: PartialConfig) -> Result<()> {
    let config = AgentConfig::load(config_file, flags).context("Failed to load configuration")?;
    telemetry::init(&config.log_level)?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        socket = %config.socket_path.display(),
        "Running courierd in foreground"
    );

    Agent::new(config).run().await?;
    Ok(())
}

/// Socket of the running agent, for the client subcommands.
pub fn socket_path(config_file: Option<&Path>, socket: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(socket) = socket {
        return Ok(socket);
    }
    AgentConfig::socket_path(config_file, PartialConfig::default())
        .context("Failed to resolve agent socket")
}
