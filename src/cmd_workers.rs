use std::path::Path;

use anyhow::{Context, Result};
use courier::ipc::WorkerInfo;
use courier::AgentClient;

use crate::args::OutputFormat;

pub async fn cmd_list(socket: &Path, format: OutputFormat) -> Result<()> {
    let workers = AgentClient::new(socket)
        .list_workers()
        .await
        .context("Failed to query the agent")?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&workers)?),
        OutputFormat::Table => print_table(&workers),
        OutputFormat::Text => {
            for w in &workers {
                println!("{}", w.handler);
            }
        }
    }
    Ok(())
}

fn print_table(workers: &[WorkerInfo]) {
    if workers.is_empty() {
        println!("No workers registered");
        return;
    }
    let width = workers
        .iter()
        .map(|w| w.handler.len())
        .max()
        .unwrap_or(0)
        .max("WORKER".len());
    println!("{:<width$}  {:>8}  {:<8}  ADDRESS", "WORKER", "PID", "DETACHED");
    for w in workers {
        let pid = w.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string());
        println!(
            "{:<width$}  {:>8}  {:<8}  {}",
            w.handler, pid, w.detached_content, w.address
        );
    }
}
