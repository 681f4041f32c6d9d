//! Agent wiring.
//!
//! Startup order: sweep orphaned workers, open the IPC socket, connect the
//! transport, then start workers. Shutdown runs the other way around.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::{Client, StatusBuilder, DISCONNECT_QUIESCE};
use crate::config::AgentConfig;
use crate::dispatch::{Dispatcher, DispatcherConfig, HttpContentFetcher};
use crate::ipc::{IpcServer, SocketEndpoint};
use crate::registry::WorkerRegistry;
use crate::supervisor::{watch, SupervisorEvent, WorkerSupervisor};
use crate::transport::{self, tls, TlsMaterial};
use crate::Result;

/// Timeout for agent-to-worker IPC calls.
const WORKER_CALL_TIMEOUT: Duration = Duration::from_secs(60);

pub struct Agent {
    config: Arc<AgentConfig>,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Runs until SIGTERM or SIGINT.
    pub async fn run(self) -> Result<()> {
        let shutdown = CancellationToken::new();

        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let handle = shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM"),
                _ = sigint.recv() => info!("Received SIGINT"),
            }
            handle.cancel();
        });

        self.run_until(shutdown).await
    }

    pub async fn run_until(self, shutdown: CancellationToken) -> Result<()> {
        let config = self.config;
        info!(
            client_id = %config.client_id,
            protocol = config.protocol.as_str(),
            "Courier agent starting"
        );

        let tls_material = TlsMaterial::from_config(&config)?;
        let http = tls::build_http_client(&transport::user_agent(), tls_material.as_ref())?;
        let (dispatcher, channels) = Dispatcher::new(
            DispatcherConfig {
                data_host: config.data_host.clone(),
                transmit_timeout: config.transmit_timeout,
            },
            Arc::new(WorkerRegistry::new()),
            Arc::new(SocketEndpoint::new(WORKER_CALL_TIMEOUT)),
            Arc::new(HttpContentFetcher::new(http)),
        );
        let dispatcher = Arc::new(dispatcher);

        let (supervisor, supervisor_events) = WorkerSupervisor::new(Arc::clone(&config));
        supervisor.stop_recorded().await;

        let tasks = CancellationToken::new();
        let server = Arc::new(
            IpcServer::new(&config, Arc::clone(&dispatcher)).with_supervisor(Arc::clone(&supervisor)),
        );
        let listener = server.bind()?;
        let server_task = tokio::spawn(Arc::clone(&server).serve(listener, tasks.clone()));

        let (transport, transport_events) = transport::from_config(&config, tls_material)?;
        let client = Arc::new(Client::new(
            transport,
            Arc::clone(&dispatcher),
            StatusBuilder::from_config(&config),
        ));
        let mut loops = client.start(channels, transport_events, tasks.clone());
        if let Err(e) = client.connect().await {
            error!("Cannot connect: {}", e);
            tasks.cancel();
            return Err(e.into());
        }

        loops.push(tokio::spawn(track_workers(
            supervisor_events,
            Arc::clone(&dispatcher),
            tasks.clone(),
        )));
        let started = supervisor.start_all()?;
        info!("Started {} workers", started);
        let watcher = watch::spawn_watcher(Arc::clone(&supervisor), &config.worker_config_dir)?;

        info!("Courier agent ready");
        shutdown.cancelled().await;
        info!("Shutting down");

        client.disconnect(DISCONNECT_QUIESCE).await;
        supervisor.stop_all().await;
        tasks.cancel();

        for handle in loops {
            let _ = handle.await;
        }
        let _ = watcher.await;
        match server_task.await {
            Ok(Err(e)) => warn!("IPC server stopped with error: {}", e),
            Err(e) => warn!("IPC server task failed: {}", e),
            Ok(Ok(())) => {}
        }
        info!("Courier agent stopped");
        Ok(())
    }
}

/// Drops registrations of worker processes that exited.
async fn track_workers(
    mut events: mpsc::UnboundedReceiver<SupervisorEvent>,
    dispatcher: Arc<Dispatcher>,
    token: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
            _ = token.cancelled() => break,
        };
        match event {
            SupervisorEvent::Started { directive, pid } => {
                debug!("Worker '{}' running as PID {}", directive, pid);
            }
            SupervisorEvent::Exited { directive, pid } => {
                let dropped = dispatcher.worker_exited(pid);
                debug!("Worker '{}' exited, dropped {:?}", directive, dropped);
            }
            SupervisorEvent::GaveUp { directive } => {
                error!("Worker '{}' will not be restarted", directive);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::AgentClient;

    #[tokio::test]
    async fn test_agent_serves_ipc_until_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let config = AgentConfig::for_state_dir(dir.path());
        let socket = config.socket_path.clone();
        let shutdown = CancellationToken::new();
        let agent = tokio::spawn(Agent::new(config).run_until(shutdown.clone()));

        let client = AgentClient::new(&socket);
        let mut pong = None;
        for _ in 0..50 {
            if let Ok(p) = client.ping().await {
                pong = Some(p);
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(pong.is_some());

        shutdown.cancel();
        agent.await.unwrap().unwrap();
        assert!(!socket.exists());
    }
}
