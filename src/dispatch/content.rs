use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;
use url::Url;

use crate::protocol::Response;

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// HTTP access for workers whose content lives outside the envelope.
#[async_trait]
pub trait ContentFetcher: Send + Sync {
    async fn get(&self, url: &Url) -> Result<Vec<u8>, FetchError>;

    async fn post(
        &self,
        url: &Url,
        headers: &HashMap<String, String>,
        body: Vec<u8>,
    ) -> Result<Response, FetchError>;
}

pub struct HttpContentFetcher {
    client: reqwest::Client,
}

impl HttpContentFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ContentFetcher for HttpContentFetcher {
    async fn get(&self, url: &Url) -> Result<Vec<u8>, FetchError> {
        let response = self.client.get(url.as_str()).send().await?;
        let response = response.error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }

    async fn post(
        &self,
        url: &Url,
        headers: &HashMap<String, String>,
        body: Vec<u8>,
    ) -> Result<Response, FetchError> {
        let mut request = self.client.post(url.as_str()).body(body);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        let response = request.send().await?;

        let code = i32::from(response.status().as_u16());
        let metadata = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let data = response.bytes().await?.to_vec();
        Ok(Response {
            code,
            metadata,
            data,
        })
    }
}

/// Extracts the URL carried in a detached-content payload.
///
/// The payload is normally a JSON string; bare UTF-8 text is accepted too.
pub fn detached_url(content: &[u8], data_host: Option<&str>) -> Result<Url, FetchError> {
    let text = match serde_json::from_slice::<String>(content) {
        Ok(s) => s,
        Err(_) => String::from_utf8_lossy(content).trim().to_string(),
    };
    parse_with_host(&text, data_host)
}

/// Parses `raw`, replacing its authority with `data_host` when one is set.
pub fn parse_with_host(raw: &str, data_host: Option<&str>) -> Result<Url, FetchError> {
    let mut url = Url::parse(raw).map_err(|e| FetchError::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;
    if let Some(host) = data_host.filter(|h| !h.is_empty()) {
        override_host(&mut url, host)?;
    }
    Ok(url)
}

fn override_host(url: &mut Url, authority: &str) -> Result<(), FetchError> {
    let original = url.to_string();
    let invalid = |reason: String| FetchError::InvalidUrl {
        url: original.clone(),
        reason,
    };
    let (host, port) = match authority.rsplit_once(':') {
        Some((h, p)) if !h.is_empty() && p.chars().all(|c| c.is_ascii_digit()) => {
            let port = p
                .parse::<u16>()
                .map_err(|e| invalid(format!("bad port in data host: {}", e)))?;
            (h, Some(port))
        }
        _ => (authority, None),
    };
    url.set_host(Some(host))
        .map_err(|e| invalid(format!("bad data host: {}", e)))?;
    if port.is_some() {
        url.set_port(port)
            .map_err(|_| invalid("URL cannot carry a port".to_string()))?;
    }
    Ok(())
}

/// True when `addr` parses as an absolute URL.
pub fn has_scheme(addr: &str) -> bool {
    Url::parse(addr).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detached_url_from_json_string() {
        let url = detached_url(br#""https://cdn.example.com/p/1""#, None).unwrap();
        assert_eq!(url.as_str(), "https://cdn.example.com/p/1");
    }

    #[test]
    fn test_detached_url_from_raw_text() {
        let url = detached_url(b"https://cdn.example.com/p/1\n", None).unwrap();
        assert_eq!(url.host_str(), Some("cdn.example.com"));
    }

    #[test]
    fn test_data_host_override() {
        let url = detached_url(br#""https://cdn.example.com/p/1?x=2""#, Some("mirror.local:8443"))
            .unwrap();
        assert_eq!(url.as_str(), "https://mirror.local:8443/p/1?x=2");

        let url = parse_with_host("http://a.example/x", Some("b.example")).unwrap();
        assert_eq!(url.as_str(), "http://b.example/x");
    }

    #[test]
    fn test_invalid_detached_url() {
        let err = detached_url(br#""not a url""#, None).unwrap_err();
        assert!(matches!(err, FetchError::InvalidUrl { .. }));
    }

    #[test]
    fn test_has_scheme() {
        assert!(has_scheme("https://example.com/upload"));
        assert!(!has_scheme("echo"));
        assert!(!has_scheme(""));
    }
}
