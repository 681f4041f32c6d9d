use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use courier::config::{PartialConfig, Protocol};

#[derive(Parser)]
#[command(name = "courierd")]
#[command(version)]
#[command(about = "Host agent bridging a message broker to local workers", long_about = None)]
pub(crate) struct Cli {
    /// Config file (default: <config-dir>/config.toml). Can also be set via COURIER_CONFIG.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Agent IPC socket. Can also be set via COURIER_SOCKET.
    #[arg(long, global = true)]
    pub socket: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Run the agent in the foreground
    Run(RunArgs),

    /// Send a message to a local worker through the running agent
    Dispatch {
        /// Directive of the target worker
        #[arg(short, long)]
        worker: String,

        /// Metadata as a JSON object of strings
        #[arg(short, long)]
        metadata: Option<String>,

        /// Content file, or "-" for stdin
        file: PathBuf,
    },

    /// Stream events emitted by workers
    Listen {
        /// Only show events from this worker
        #[arg(short, long)]
        worker: Option<String>,
    },

    /// Inspect registered workers
    Workers {
        #[command(subcommand)]
        command: WorkerCommands,
    },
}

#[derive(Subcommand)]
pub(crate) enum WorkerCommands {
    /// List workers registered with the agent
    List {
        #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum OutputFormat {
    Json,
    Table,
    Text,
}

/// Flags overriding config file and environment settings.
#[derive(Args, Default)]
pub(crate) struct RunArgs {
    /// Broker address; repeat for fallbacks
    #[arg(long)]
    pub server: Vec<String>,

    #[arg(long, value_enum)]
    pub protocol: Option<Protocol>,

    #[arg(long)]
    pub client_id: Option<String>,

    /// Log filter (e.g. info, courier=debug)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Topic prefix (MQTT) or URL path prefix (HTTP)
    #[arg(long)]
    pub path_prefix: Option<String>,

    /// Host serving detached content; overrides URL hosts
    #[arg(long)]
    pub data_host: Option<String>,

    #[arg(long)]
    pub cert_file: Option<PathBuf>,

    #[arg(long)]
    pub key_file: Option<PathBuf>,

    /// Extra CA certificate; repeatable
    #[arg(long)]
    pub ca_root: Vec<PathBuf>,

    #[arg(long)]
    pub facts_file: Option<PathBuf>,

    #[arg(long)]
    pub tags_file: Option<PathBuf>,

    #[arg(long)]
    pub config_dir: Option<PathBuf>,

    #[arg(long)]
    pub worker_dir: Option<PathBuf>,

    #[arg(long)]
    pub state_dir: Option<PathBuf>,

    /// Volatile directory for worker PID files (default: $XDG_RUNTIME_DIR/courier or /run/courier)
    #[arg(long)]
    pub run_dir: Option<PathBuf>,

    /// Worker directive not to start; repeatable
    #[arg(long)]
    pub exclude_worker: Vec<String>,
}

impl RunArgs {
    pub fn into_layer(self, socket: Option<PathBuf>) -> PartialConfig {
        PartialConfig {
            client_id: self.client_id,
            server: non_empty(self.server),
            protocol: self.protocol,
            path_prefix: self.path_prefix,
            data_host: self.data_host,
            log_level: self.log_level,
            cert_file: self.cert_file,
            key_file: self.key_file,
            ca_root: non_empty(self.ca_root),
            facts_file: self.facts_file,
            tags_file: self.tags_file,
            config_dir: self.config_dir,
            worker_config_dir: self.worker_dir,
            state_dir: self.state_dir,
            run_dir: self.run_dir,
            socket_path: socket,
            exclude_workers: non_empty(self.exclude_worker),
            ..PartialConfig::default()
        }
    }
}

fn non_empty<T>(values: Vec<T>) -> Option<Vec<T>> {
    (!values.is_empty()).then_some(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_flags_build_layer() {
        let cli = Cli::parse_from([
            "courierd",
            "--socket",
            "/tmp/agent.sock",
            "run",
            "--server",
            "mqtts://broker:8883",
            "--server",
            "mqtt://fallback",
            "--protocol",
            "mqtt",
            "--exclude-worker",
            "echo",
        ]);
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        let layer = args.into_layer(cli.socket);
        assert_eq!(layer.server.unwrap().len(), 2);
        assert_eq!(layer.protocol, Some(Protocol::Mqtt));
        assert_eq!(layer.exclude_workers, Some(vec!["echo".to_string()]));
        assert_eq!(layer.socket_path, Some(PathBuf::from("/tmp/agent.sock")));
        assert!(layer.ca_root.is_none());
    }

    #[test]
    fn test_dispatch_args() {
        let cli = Cli::parse_from(["courierd", "dispatch", "--worker", "echo", "-"]);
        match cli.command {
            Commands::Dispatch { worker, file, metadata } => {
                assert_eq!(worker, "echo");
                assert_eq!(file, PathBuf::from("-"));
                assert!(metadata.is_none());
            }
            _ => panic!("expected dispatch"),
        }
    }
}
