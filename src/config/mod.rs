//! Agent configuration.
//!
//! Settings are layered: built-in defaults, then the TOML config file,
//! then `COURIER_*` environment variables, then command-line flags. The
//! result is an immutable [`AgentConfig`] shared by every component.

pub mod env;

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

const COURIER_SUBDIR: &str = "courier";
const FALLBACK_CONFIG_DIR: &str = "/etc";
const FALLBACK_STATE_DIR: &str = "/var/lib";
const FALLBACK_RUN_DIR: &str = "/run";
const CONFIG_FILE_NAME: &str = "config.toml";
const CLIENT_ID_FILE_NAME: &str = "client-id";
const SOCKET_FILE_NAME: &str = "agent.sock";

pub const DEFAULT_PATH_PREFIX: &str = "yggdrasil";
pub const DEFAULT_LOG_LEVEL: &str = "info";
pub const DEFAULT_HTTP_POLLING_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_TRANSMIT_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid value '{value}' for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("failed to persist client ID at {path}: {source}")]
    ClientId {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Broker transport selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Mqtt,
    Http,
    None,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Mqtt => "mqtt",
            Protocol::Http => "http",
            Protocol::None => "none",
        }
    }
}

impl FromStr for Protocol {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mqtt" => Ok(Protocol::Mqtt),
            "http" => Ok(Protocol::Http),
            "none" | "" => Ok(Protocol::None),
            other => Err(ConfigError::InvalidValue {
                key: "protocol".to_string(),
                value: other.to_string(),
                reason: "expected mqtt, http or none".to_string(),
            }),
        }
    }
}

/// One configuration layer; unset fields fall through to lower layers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartialConfig {
    pub client_id: Option<String>,
    pub server: Option<Vec<String>>,
    pub protocol: Option<Protocol>,
    pub path_prefix: Option<String>,
    pub data_host: Option<String>,
    pub log_level: Option<String>,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub ca_root: Option<Vec<PathBuf>>,
    pub facts_file: Option<PathBuf>,
    pub tags_file: Option<PathBuf>,
    pub config_dir: Option<PathBuf>,
    pub worker_config_dir: Option<PathBuf>,
    pub state_dir: Option<PathBuf>,
    pub run_dir: Option<PathBuf>,
    pub socket_path: Option<PathBuf>,
    pub exclude_workers: Option<Vec<String>>,
    pub http_polling_interval_secs: Option<u64>,
    pub transmit_timeout_ms: Option<u64>,
}

impl PartialConfig {
    /// Reads a TOML layer. A missing file yields an empty layer.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        tracing::trace!(path = %path.display(), "Loading config file");
        if !path.exists() {
            tracing::trace!("Config file does not exist, using defaults");
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Fields set in `higher` win over fields set in `self`.
    pub fn overlay(self, higher: PartialConfig) -> PartialConfig {
        PartialConfig {
            client_id: higher.client_id.or(self.client_id),
            server: higher.server.or(self.server),
            protocol: higher.protocol.or(self.protocol),
            path_prefix: higher.path_prefix.or(self.path_prefix),
            data_host: higher.data_host.or(self.data_host),
            log_level: higher.log_level.or(self.log_level),
            cert_file: higher.cert_file.or(self.cert_file),
            key_file: higher.key_file.or(self.key_file),
            ca_root: higher.ca_root.or(self.ca_root),
            facts_file: higher.facts_file.or(self.facts_file),
            tags_file: higher.tags_file.or(self.tags_file),
            config_dir: higher.config_dir.or(self.config_dir),
            worker_config_dir: higher.worker_config_dir.or(self.worker_config_dir),
            state_dir: higher.state_dir.or(self.state_dir),
            run_dir: higher.run_dir.or(self.run_dir),
            socket_path: higher.socket_path.or(self.socket_path),
            exclude_workers: higher.exclude_workers.or(self.exclude_workers),
            http_polling_interval_secs: higher
                .http_polling_interval_secs
                .or(self.http_polling_interval_secs),
            transmit_timeout_ms: higher.transmit_timeout_ms.or(self.transmit_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentConfig {
    pub client_id: String,
    pub server: Vec<String>,
    pub protocol: Protocol,
    pub path_prefix: String,
    pub data_host: Option<String>,
    pub log_level: String,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub ca_root: Vec<PathBuf>,
    pub facts_file: Option<PathBuf>,
    pub tags_file: Option<PathBuf>,
    /// Passed to workers so they can find their own settings.
    pub config_dir: PathBuf,
    pub worker_config_dir: PathBuf,
    /// Persistent state: client ID, worker sockets.
    pub state_dir: PathBuf,
    /// Volatile runtime state cleared on reboot: worker PID files.
    pub run_dir: PathBuf,
    /// Agent IPC socket.
    pub socket_path: PathBuf,
    pub exclude_workers: Vec<String>,
    pub http_polling_interval: Duration,
    pub transmit_timeout: Duration,
}

impl AgentConfig {
    /// Resolves the full layer stack. `cli` holds command-line overrides.
    pub fn load(config_file: Option<&Path>, cli: PartialConfig) -> Result<Self, ConfigError> {
        Self::resolve(merged_layers(config_file, cli)?)
    }

    /// Agent socket location, without settling a client ID.
    pub fn socket_path(config_file: Option<&Path>, cli: PartialConfig) -> Result<PathBuf, ConfigError> {
        let layer = merged_layers(config_file, cli)?;
        Ok(layer.socket_path.unwrap_or_else(|| {
            layer
                .state_dir
                .unwrap_or_else(default_state_dir)
                .join(SOCKET_FILE_NAME)
        }))
    }


    /// Fills unset fields with defaults and settles the client ID.
    pub fn resolve(layer: PartialConfig) -> Result<Self, ConfigError> {
        let config_dir = layer.config_dir.unwrap_or_else(default_config_dir);
        let state_dir = layer.state_dir.unwrap_or_else(default_state_dir);
        let client_id = match layer.client_id.filter(|id| !id.trim().is_empty()) {
            Some(id) => id,
            None => load_or_create_client_id(&state_dir)?,
        };

        let config = Self {
            client_id,
            server: layer.server.unwrap_or_default(),
            protocol: layer.protocol.unwrap_or(Protocol::None),
            path_prefix: layer
                .path_prefix
                .unwrap_or_else(|| DEFAULT_PATH_PREFIX.to_string()),
            data_host: layer.data_host.filter(|h| !h.is_empty()),
            log_level: layer
                .log_level
                .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
            cert_file: layer.cert_file,
            key_file: layer.key_file,
            ca_root: layer.ca_root.unwrap_or_default(),
            facts_file: layer.facts_file,
            tags_file: layer.tags_file,
            worker_config_dir: layer
                .worker_config_dir
                .unwrap_or_else(|| config_dir.join("workers")),
            run_dir: layer.run_dir.unwrap_or_else(default_run_dir),
            socket_path: layer
                .socket_path
                .unwrap_or_else(|| state_dir.join(SOCKET_FILE_NAME)),
            config_dir,
            state_dir,
            exclude_workers: layer.exclude_workers.unwrap_or_default(),
            http_polling_interval: env::secs(layer.http_polling_interval_secs)
                .unwrap_or(DEFAULT_HTTP_POLLING_INTERVAL),
            transmit_timeout: layer
                .transmit_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_TRANSMIT_TIMEOUT),
        };
        config.validate()?;
        tracing::debug!(
            client_id = %config.client_id,
            protocol = config.protocol.as_str(),
            "Configuration resolved"
        );
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.protocol != Protocol::None && self.server.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "server".to_string(),
                value: String::new(),
                reason: format!("protocol '{}' needs at least one server", self.protocol.as_str()),
            });
        }
        if self.cert_file.is_some() != self.key_file.is_some() {
            return Err(ConfigError::InvalidValue {
                key: "cert-file".to_string(),
                value: String::new(),
                reason: "cert-file and key-file must be set together".to_string(),
            });
        }
        if self.http_polling_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "http-polling-interval".to_string(),
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }

    /// Worker PID files live here.
    pub fn pid_dir(&self) -> PathBuf {
        self.run_dir.join("workers")
    }

    /// Sockets assigned to workers that register without an address.
    pub fn worker_socket_dir(&self) -> PathBuf {
        self.state_dir.join("sockets")
    }

    pub fn is_excluded(&self, directive: &str) -> bool {
        self.exclude_workers.iter().any(|w| w == directive)
    }

    /// A config that needs no filesystem defaults, rooted at `state_dir`.
    pub fn for_state_dir(state_dir: impl Into<PathBuf>) -> Self {
        let state_dir = state_dir.into();
        Self {
            client_id: "test-client".to_string(),
            server: Vec::new(),
            protocol: Protocol::None,
            path_prefix: DEFAULT_PATH_PREFIX.to_string(),
            data_host: None,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            cert_file: None,
            key_file: None,
            ca_root: Vec::new(),
            facts_file: None,
            tags_file: None,
            config_dir: state_dir.join("etc"),
            worker_config_dir: state_dir.join("workers"),
            socket_path: state_dir.join("agent.sock"),
            run_dir: state_dir.join("run"),
            state_dir,
            exclude_workers: Vec::new(),
            http_polling_interval: DEFAULT_HTTP_POLLING_INTERVAL,
            transmit_timeout: DEFAULT_TRANSMIT_TIMEOUT,
        }
    }
}

fn merged_layers(config_file: Option<&Path>, cli: PartialConfig) -> Result<PartialConfig, ConfigError> {
    let env_layer = env::load()?;

    let config_dir = cli
        .config_dir
        .clone()
        .or_else(|| env_layer.config_dir.clone())
        .unwrap_or_else(default_config_dir);
    let file_path = config_file
        .map(Path::to_path_buf)
        .or_else(env::config_file)
        .unwrap_or_else(|| config_dir.join(CONFIG_FILE_NAME));

    Ok(PartialConfig::from_file(&file_path)?
        .overlay(env_layer)
        .overlay(cli))
}

/// Courier config directory (~/.config/courier, or /etc/courier)
pub fn default_config_dir() -> PathBuf {
    let dir = dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from(FALLBACK_CONFIG_DIR))
        .join(COURIER_SUBDIR);
    tracing::trace!(dir = %dir.display(), "Resolved config directory");
    dir
}

/// Courier state directory (~/.local/state/courier, or /var/lib/courier)
pub fn default_state_dir() -> PathBuf {
    let dir = dirs::state_dir()
        .or_else(dirs::data_local_dir)
        .unwrap_or_else(|| PathBuf::from(FALLBACK_STATE_DIR))
        .join(COURIER_SUBDIR);
    tracing::trace!(dir = %dir.display(), "Resolved state directory");
    dir
}

/// Courier runtime directory ($XDG_RUNTIME_DIR/courier, or /run/courier)
pub fn default_run_dir() -> PathBuf {
    let dir = dirs::runtime_dir()
        .unwrap_or_else(|| PathBuf::from(FALLBACK_RUN_DIR))
        .join(COURIER_SUBDIR);
    tracing::trace!(dir = %dir.display(), "Resolved runtime directory");
    dir
}

/// Reads `<state_dir>/client-id`, generating and persisting one if absent.
pub fn load_or_create_client_id(state_dir: &Path) -> Result<String, ConfigError> {
    let path = state_dir.join(CLIENT_ID_FILE_NAME);
    let wrap = |source| ConfigError::ClientId {
        path: path.clone(),
        source,
    };

    match fs::read_to_string(&path) {
        Ok(content) if !content.trim().is_empty() => return Ok(content.trim().to_string()),
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(wrap(e)),
    }

    let id = uuid::Uuid::new_v4().to_string();
    fs::create_dir_all(state_dir).map_err(wrap)?;
    fs::write(&path, &id).map_err(wrap)?;
    tracing::info!("Generated client ID {}", id);
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlay_prefers_higher_layer() {
        let file = PartialConfig {
            path_prefix: Some("file".to_string()),
            log_level: Some("debug".to_string()),
            ..Default::default()
        };
        let cli = PartialConfig {
            path_prefix: Some("cli".to_string()),
            ..Default::default()
        };

        let merged = file.overlay(cli);
        assert_eq!(merged.path_prefix.as_deref(), Some("cli"));
        assert_eq!(merged.log_level.as_deref(), Some("debug"));
    }

    #[test]
    fn test_resolve_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AgentConfig::resolve(PartialConfig {
            state_dir: Some(dir.path().to_path_buf()),
            config_dir: Some(dir.path().join("etc")),
            client_id: Some("abc".to_string()),
            ..Default::default()
        })
        .unwrap();

        assert_eq!(config.client_id, "abc");
        assert_eq!(config.protocol, Protocol::None);
        assert_eq!(config.path_prefix, DEFAULT_PATH_PREFIX);
        assert_eq!(config.transmit_timeout, Duration::from_secs(1));
        assert_eq!(config.worker_config_dir, dir.path().join("etc").join("workers"));
        assert_eq!(config.socket_path, dir.path().join("agent.sock"));
        assert_eq!(config.run_dir, default_run_dir());
        assert!(!config.pid_dir().starts_with(dir.path()));
        assert!(config.pid_dir().ends_with("courier/workers"));
    }

    #[test]
    fn test_client_id_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let first = load_or_create_client_id(dir.path()).unwrap();
        let second = load_or_create_client_id(dir.path()).unwrap();
        assert_eq!(first, second);
        assert!(uuid::Uuid::parse_str(&first).is_ok());
    }

    #[test]
    fn test_protocol_needs_server() {
        let dir = tempfile::tempdir().unwrap();
        let err = AgentConfig::resolve(PartialConfig {
            state_dir: Some(dir.path().to_path_buf()),
            client_id: Some("abc".to_string()),
            protocol: Some(Protocol::Mqtt),
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "server"));
    }

    #[test]
    fn test_toml_layer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
server = ["mqtts://broker.example.com:8883"]
protocol = "mqtt"
data_host = "mirror.example.com"
exclude_workers = ["noisy"]
"#,
        )
        .unwrap();

        let layer = PartialConfig::from_file(&path).unwrap();
        assert_eq!(layer.protocol, Some(Protocol::Mqtt));
        assert_eq!(layer.exclude_workers, Some(vec!["noisy".to_string()]));

        let missing = PartialConfig::from_file(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(missing, PartialConfig::default());
    }

    #[test]
    fn test_protocol_from_str() {
        assert_eq!("MQTT".parse::<Protocol>().unwrap(), Protocol::Mqtt);
        assert!("carrier-pigeon".parse::<Protocol>().is_err());
    }
}
