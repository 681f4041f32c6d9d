use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use super::tls::build_http_client;
use super::{
    user_agent, Channel, TlsMaterial, Transport, TransportError, TransportEvent, TransportEvents,
};
use crate::config::AgentConfig;
use crate::protocol::Response;

/// Polls `.../{channel}/{client-id}/in` and posts to `.../out`.
pub struct HttpTransport {
    base: String,
    prefix: String,
    client_id: String,
    polling_interval: Duration,
    http: Arc<RwLock<reqwest::Client>>,
    events: mpsc::UnboundedSender<TransportEvent>,
    polling: Mutex<Option<CancellationToken>>,
}

impl HttpTransport {
    pub fn new(
        config: &AgentConfig,
        tls: Option<TlsMaterial>,
    ) -> Result<(Self, TransportEvents), TransportError> {
        let server = config
            .server
            .first()
            .ok_or_else(|| TransportError::InvalidServer {
                server: String::new(),
                reason: "no HTTP server configured".to_string(),
            })?;
        let secure = tls.as_ref().is_some_and(TlsMaterial::has_identity);
        let http = build_http_client(&user_agent(), tls.as_ref())?;
        let (events, rx) = mpsc::unbounded_channel();

        let transport = Self {
            base: base_url(server, secure),
            prefix: config.path_prefix.trim_matches('/').to_string(),
            client_id: config.client_id.clone(),
            polling_interval: config.http_polling_interval,
            http: Arc::new(RwLock::new(http)),
            events,
            polling: Mutex::new(None),
        };
        Ok((transport, rx))
    }

    pub fn url(&self, channel: Channel, direction: &str) -> String {
        let mut url = self.base.clone();
        if !self.prefix.is_empty() {
            url.push('/');
            url.push_str(&self.prefix);
        }
        format!("{}/{}/{}/{}", url, channel.as_str(), self.client_id, direction)
    }

    fn client(&self) -> reqwest::Client {
        self.http
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn spawn_poller(&self, channel: Channel, token: CancellationToken) {
        let url = self.url(channel, "in");
        let http = Arc::clone(&self.http);
        let events = self.events.clone();
        let interval = self.polling_interval;

        tokio::spawn(async move {
            debug!("Polling {} every {:?}", url, interval);
            loop {
                let client = http.read().unwrap_or_else(PoisonError::into_inner).clone();
                match get(&client, &url).await {
                    Ok(payload) if !payload.is_empty() => {
                        let _ = events.send(TransportEvent::Received { channel, payload });
                    }
                    Ok(_) => trace!("No {} work", channel.as_str()),
                    Err(e) => error!("Error while getting work: {}", e),
                }
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = token.cancelled() => break,
                }
            }
            debug!("Stopped polling {}", url);
        });
    }
}

/// Scheme-less servers get `https` when a client certificate is configured.
fn base_url(server: &str, secure: bool) -> String {
    let server = server.trim_end_matches('/');
    if server.contains("://") {
        server.to_string()
    } else if secure {
        format!("https://{}", server)
    } else {
        format!("http://{}", server)
    }
}

async fn get(client: &reqwest::Client, url: &str) -> Result<Vec<u8>, TransportError> {
    debug!("Sending HTTP request: GET {}", url);
    let response = client.get(url).send().await?;
    let status = response.status();
    let body = response.bytes().await?;
    debug!("Received HTTP {}", status);
    if status.as_u16() >= 400 {
        return Err(TransportError::Status {
            code: status.as_u16(),
            body: String::from_utf8_lossy(&body).trim().to_string(),
        });
    }
    Ok(body.to_vec())
}

#[async_trait]
impl Transport for HttpTransport {
    fn kind(&self) -> &'static str {
        "http"
    }

    async fn connect(&self) -> Result<(), TransportError> {
        {
            let mut polling = self.polling.lock().unwrap_or_else(PoisonError::into_inner);
            if polling.is_some() {
                return Ok(());
            }
            let token = CancellationToken::new();
            self.spawn_poller(Channel::Control, token.clone());
            self.spawn_poller(Channel::Data, token.clone());
            *polling = Some(token);
        }
        info!("Polling {} for work", self.base);
        let _ = self.events.send(TransportEvent::Connected);
        Ok(())
    }

    async fn disconnect(&self, _quiesce: Duration) {
        let token = self
            .polling
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(token) = token {
            info!("Stopped polling {}", self.base);
            token.cancel();
        }
    }

    async fn send(&self, channel: Channel, payload: Vec<u8>) -> Result<Response, TransportError> {
        let url = self.url(channel, "out");
        debug!("Sending HTTP request: POST {}", url);
        trace!("Sending {}", String::from_utf8_lossy(&payload));

        let response = self
            .client()
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(payload)
            .send()
            .await?;
        let status = response.status();
        let metadata: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
            .collect();
        let body = response.bytes().await?;
        debug!("Received HTTP {}", status);

        if status.as_u16() >= 400 {
            return Err(TransportError::Status {
                code: status.as_u16(),
                body: String::from_utf8_lossy(&body).trim().to_string(),
            });
        }
        Ok(Response {
            code: i32::from(status.as_u16()),
            metadata,
            data: body.to_vec(),
        })
    }

    async fn reload_tls(&self, material: TlsMaterial) -> Result<(), TransportError> {
        let client = build_http_client(&user_agent(), Some(&material))?;
        *self.http.write().unwrap_or_else(PoisonError::into_inner) = client;
        info!("Reloaded TLS material for HTTP transport");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport(server: &str) -> HttpTransport {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AgentConfig::for_state_dir(dir.path());
        config.server = vec![server.to_string()];
        config.client_id = "abc".to_string();
        config.path_prefix = "api/v1".to_string();
        HttpTransport::new(&config, None).unwrap().0
    }

    #[test]
    fn test_urls() {
        let t = transport("localhost:8080");
        assert_eq!(
            t.url(Channel::Data, "in"),
            "http://localhost:8080/api/v1/data/abc/in"
        );
        assert_eq!(
            t.url(Channel::Control, "out"),
            "http://localhost:8080/api/v1/control/abc/out"
        );

        let t = transport("https://server.example.com/");
        assert_eq!(
            t.url(Channel::Data, "out"),
            "https://server.example.com/api/v1/data/abc/out"
        );
    }

    #[test]
    fn test_base_url() {
        assert_eq!(base_url("host:1", true), "https://host:1");
        assert_eq!(base_url("host:1", false), "http://host:1");
    }

    #[tokio::test]
    async fn test_connect_is_idempotent_and_disconnect_stops() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AgentConfig::for_state_dir(dir.path());
        config.server = vec!["127.0.0.1:1".to_string()];
        let (t, mut events) = HttpTransport::new(&config, None).unwrap();

        t.connect().await.unwrap();
        t.connect().await.unwrap();
        assert_eq!(events.recv().await, Some(TransportEvent::Connected));
        assert!(events.try_recv().is_err());

        t.disconnect(Duration::ZERO).await;
        assert!(t.polling.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_send_to_unreachable_server_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AgentConfig::for_state_dir(dir.path());
        config.server = vec!["127.0.0.1:1".to_string()];
        let (t, _events) = HttpTransport::new(&config, None).unwrap();

        let err = t.send(Channel::Data, b"{}".to_vec()).await.unwrap_err();
        assert!(matches!(err, TransportError::Http(_)));
    }
}
