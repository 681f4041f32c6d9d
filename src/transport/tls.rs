use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::TransportError;
use crate::config::AgentConfig;

/// PEM-encoded client certificate, key and extra CA roots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsMaterial {
    pub cert_pem: Option<Vec<u8>>,
    pub key_pem: Option<Vec<u8>>,
    pub ca_roots: Vec<Vec<u8>>,
}

impl TlsMaterial {
    /// Reads the configured files. Returns `None` when nothing is configured.
    pub fn from_config(config: &AgentConfig) -> Result<Option<Self>, TransportError> {
        Self::load(
            config.cert_file.as_deref(),
            config.key_file.as_deref(),
            &config.ca_root,
        )
    }

    pub fn load(
        cert_file: Option<&Path>,
        key_file: Option<&Path>,
        ca_root: &[PathBuf],
    ) -> Result<Option<Self>, TransportError> {
        if cert_file.is_none() && key_file.is_none() && ca_root.is_empty() {
            return Ok(None);
        }
        let material = Self {
            cert_pem: cert_file.map(read).transpose()?,
            key_pem: key_file.map(read).transpose()?,
            ca_roots: ca_root
                .iter()
                .map(|p| read(p))
                .collect::<Result<_, _>>()?,
        };
        debug!(
            client_auth = material.has_identity(),
            ca_roots = material.ca_roots.len(),
            "Loaded TLS material"
        );
        Ok(Some(material))
    }

    pub fn has_identity(&self) -> bool {
        self.cert_pem.is_some() && self.key_pem.is_some()
    }

    /// Key followed by certificate chain, the form rustls identities expect.
    pub fn identity_pem(&self) -> Option<Vec<u8>> {
        let (cert, key) = (self.cert_pem.as_ref()?, self.key_pem.as_ref()?);
        let mut pem = key.clone();
        if !pem.ends_with(b"\n") {
            pem.push(b'\n');
        }
        pem.extend_from_slice(cert);
        Some(pem)
    }

    /// All CA roots in one PEM bundle.
    pub fn ca_bundle(&self) -> Vec<u8> {
        let mut bundle = Vec::new();
        for root in &self.ca_roots {
            bundle.extend_from_slice(root);
            if !bundle.ends_with(b"\n") {
                bundle.push(b'\n');
            }
        }
        bundle
    }
}

fn read(path: &Path) -> Result<Vec<u8>, TransportError> {
    fs::read(path).map_err(|source| TransportError::TlsFile {
        path: path.to_path_buf(),
        source,
    })
}

/// HTTP client carrying the agent's user agent and TLS material.
pub fn build_http_client(
    user_agent: &str,
    material: Option<&TlsMaterial>,
) -> Result<reqwest::Client, TransportError> {
    let mut builder = reqwest::Client::builder().user_agent(user_agent);
    if let Some(material) = material {
        for root in &material.ca_roots {
            let cert = reqwest::Certificate::from_pem(root)
                .map_err(|e| TransportError::Tls(e.to_string()))?;
            builder = builder.add_root_certificate(cert);
        }
        if let Some(pem) = material.identity_pem() {
            let identity = reqwest::Identity::from_pem(&pem)
                .map_err(|e| TransportError::Tls(e.to_string()))?;
            builder = builder.identity(identity);
        }
    }
    Ok(builder.build()?)
}
