use std::path::Path;

use anyhow::{Context, Result};
use courier::AgentClient;

pub async fn cmd_listen(socket: &Path, worker: Option<&str>) -> Result<()> {
    let client = AgentClient::new(socket);
    let mut stream = client
        .subscribe(worker)
        .await
        .context("Failed to subscribe to worker events")?;

    loop {
        tokio::select! {
            next = stream.next() => match next? {
                Some(event) => println!("{}", serde_json::to_string(&event)?),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    Ok(())
}
