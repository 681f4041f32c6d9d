use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use super::{Channel, TlsMaterial, Transport, TransportError, TransportEvent, TransportEvents};
use crate::protocol::Response;

/// Keeps the agent off the network. Workers still get local dispatches.
pub struct NoopTransport {
    // Held so the event stream stays open for the agent's lifetime.
    _events: mpsc::UnboundedSender<TransportEvent>,
}

impl NoopTransport {
    pub fn new() -> (Self, TransportEvents) {
        let (events, rx) = mpsc::unbounded_channel();
        (Self { _events: events }, rx)
    }
}

#[async_trait]
impl Transport for NoopTransport {
    fn kind(&self) -> &'static str {
        "none"
    }

    async fn connect(&self) -> Result<(), TransportError> {
        debug!("No transport configured, staying offline");
        Ok(())
    }

    async fn disconnect(&self, _quiesce: Duration) {}

    async fn send(&self, channel: Channel, payload: Vec<u8>) -> Result<Response, TransportError> {
        debug!(
            "Dropping {} bytes for the {} channel",
            payload.len(),
            channel.as_str()
        );
        Ok(Response::default())
    }

    async fn reload_tls(&self, _material: TlsMaterial) -> Result<(), TransportError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_accepts_everything() {
        let (t, mut events) = NoopTransport::new();
        t.connect().await.unwrap();
        let response = t.send(Channel::Data, b"{}".to_vec()).await.unwrap();
        assert_eq!(response.code, 0);
        t.disconnect(Duration::from_millis(500)).await;
        assert!(events.try_recv().is_err());
    }
}
