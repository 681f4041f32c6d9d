mod args;
mod cmd_dispatch;
mod cmd_listen;
mod cmd_run;
mod cmd_workers;

use args::{Cli, Commands, WorkerCommands};
use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let config_file = cli.config.as_deref();

    match cli.command {
        Commands::Run(args) => cmd_run::cmd_run(config_file, args.into_layer(cli.socket)).await?,
        Commands::Dispatch {
            worker,
            metadata,
            file,
        } => {
            let socket = cmd_run::socket_path(config_file, cli.socket)?;
            cmd_dispatch::cmd_dispatch(&socket, &worker, metadata.as_deref(), &file).await?
        }
        Commands::Listen { worker } => {
            let socket = cmd_run::socket_path(config_file, cli.socket)?;
            cmd_listen::cmd_listen(&socket, worker.as_deref()).await?
        }
        Commands::Workers {
            command: WorkerCommands::List { format },
        } => {
            let socket = cmd_run::socket_path(config_file, cli.socket)?;
            cmd_workers::cmd_list(&socket, format).await?
        }
    }

    Ok(())
}
