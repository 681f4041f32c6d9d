use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use courier::AgentClient;

pub async fn cmd_dispatch(
    socket: &Path,
    worker: &str,
    metadata: Option<&str>,
    file: &Path,
) -> Result<()> {
    let metadata: HashMap<String, String> = match metadata {
        Some(raw) => serde_json::from_str(raw).context("Metadata must be a JSON object of strings")?,
        None => HashMap::new(),
    };
    let content = read_content(file)?;

    let client = AgentClient::new(socket);
    let message_id = client
        .dispatch(worker, metadata, content)
        .await
        .with_context(|| format!("Failed to dispatch to '{}'", worker))?;
    println!("Dispatched message {} to {}", message_id, worker);
    Ok(())
}

fn read_content(file: &Path) -> Result<Vec<u8>> {
    if file == Path::new("-") {
        let mut buf = Vec::new();
        std::io::stdin()
            .read_to_end(&mut buf)
            .context("Failed to read stdin")?;
        return Ok(buf);
    }
    std::fs::read(file).with_context(|| format!("Failed to read {}", file.display()))
}
