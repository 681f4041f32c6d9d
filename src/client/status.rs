use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{error, trace};

use crate::config::AgentConfig;
use crate::protocol::{ConnectionState, ConnectionStatus, ConnectionStatusContent, DispatcherMap};

const TAGS_FILE_NAME: &str = "tags.toml";

#[derive(Error, Debug)]
pub enum StatusError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot parse facts file {path}: {source}")]
    Facts {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("cannot parse tags: {0}")]
    Tags(#[from] toml::de::Error),

    #[error("cannot use {kind} value of tag '{key}' as a string")]
    TagValue { key: String, kind: &'static str },
}

/// Assembles connection-status messages from the facts and tags files.
#[derive(Debug, Clone)]
pub struct StatusBuilder {
    facts_file: Option<PathBuf>,
    tags_file: PathBuf,
    client_version: String,
}

impl StatusBuilder {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            facts_file: config.facts_file.clone(),
            tags_file: config
                .tags_file
                .clone()
                .unwrap_or_else(|| config.config_dir.join(TAGS_FILE_NAME)),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// An "online" status. Unreadable facts or tags are logged and left out.
    pub fn online(&self, dispatchers: DispatcherMap) -> ConnectionStatus {
        let canonical_facts = match &self.facts_file {
            Some(path) => read_facts(path).unwrap_or_else(|e| {
                error!("{}", e);
                Value::Null
            }),
            None => Value::Null,
        };

        let tags = if self.tags_file.exists() {
            read_tags(&self.tags_file).unwrap_or_else(|e| {
                error!("Cannot load tags: {}", e);
                BTreeMap::new()
            })
        } else {
            BTreeMap::new()
        };

        ConnectionStatus::new(ConnectionStatusContent {
            canonical_facts,
            dispatchers,
            state: ConnectionState::Online,
            tags,
            client_version: Some(self.client_version.clone()),
        })
    }
}

pub fn read_facts(path: &Path) -> Result<Value, StatusError> {
    let data = fs::read(path).map_err(|source| StatusError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&data).map_err(|source| StatusError::Facts {
        path: path.to_path_buf(),
        source,
    })
}

pub fn read_tags(path: &Path) -> Result<BTreeMap<String, String>, StatusError> {
    let text = fs::read_to_string(path).map_err(|source| StatusError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_tags(&text)
}

/// Top-level string, integer, float and boolean TOML values, stringified.
pub fn parse_tags(text: &str) -> Result<BTreeMap<String, String>, StatusError> {
    let table: toml::Table = toml::from_str(text)?;
    table
        .into_iter()
        .map(|(key, value)| {
            let value = match value {
                toml::Value::String(s) => s,
                toml::Value::Integer(i) => i.to_string(),
                toml::Value::Float(f) => f.to_string(),
                toml::Value::Boolean(b) => b.to_string(),
                other => {
                    return Err(StatusError::TagValue {
                        key,
                        kind: other.type_str(),
                    })
                }
            };
            Ok((key, value))
        })
        .collect()
}

/// Remembers the hash of the last published dispatcher map.
#[derive(Debug, Default)]
pub struct DispatcherDigest {
    last: Mutex<Option<[u8; 32]>>,
}

impl DispatcherDigest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `map` and reports whether it differs from the previous one.
    pub fn changed(&self, map: &DispatcherMap) -> bool {
        let json = match serde_json::to_vec(map) {
            Ok(json) => json,
            Err(e) => {
                error!("Cannot encode dispatcher map: {}", e);
                return true;
            }
        };
        let sum: [u8; 32] = Sha256::digest(&json).into();
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        if *last == Some(sum) {
            trace!("Dispatcher map unchanged");
            return false;
        }
        *last = Some(sum);
        true
    }

    pub fn reset(&self) {
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}
