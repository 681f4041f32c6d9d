use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::SupervisorError;
use crate::config::{env, AgentConfig};
use crate::protocol::Features;

/// `PATH` every worker starts with. Workers cannot override it.
pub const WORKER_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Prefix of variables the agent sets for workers. Workers cannot override them.
pub const RESERVED_ENV_PREFIX: &str = "YGG_";

pub const WORKER_CONFIG_EXTENSION: &str = "toml";

/// A worker descriptor file from the worker config directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Command line, split on whitespace.
    pub exec: String,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub features: Features,
    #[serde(default)]
    pub remote_content: bool,
    #[serde(skip)]
    pub directive: String,
    #[serde(skip)]
    pub path: PathBuf,
}

impl WorkerConfig {
    pub fn load(path: &Path) -> Result<Self, SupervisorError> {
        let directive =
            directive_from_path(path).ok_or_else(|| SupervisorError::NoDirective(path.to_path_buf()))?;
        let content = fs::read_to_string(path).map_err(|source| SupervisorError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Self = toml::from_str(&content).map_err(|source| SupervisorError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.directive = directive;
        config.path = path.to_path_buf();
        Ok(config)
    }

    /// Program and arguments from `exec`.
    pub fn argv(&self) -> Result<(String, Vec<String>), SupervisorError> {
        let mut parts = self.exec.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| SupervisorError::EmptyExec(self.directive.clone()))?;
        Ok((program, parts.collect()))
    }
}

/// Directive name of a worker config file: its base name without extension.
pub fn directive_from_path(path: &Path) -> Option<String> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

pub fn is_worker_config(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(WORKER_CONFIG_EXTENSION)
}

/// Accepts a `KEY=VALUE` entry unless it targets `PATH` or a reserved variable.
pub fn valid_env_var(entry: &str) -> bool {
    match entry.split_once('=') {
        Some((key, _)) if !key.is_empty() => {
            key != "PATH" && !key.starts_with(RESERVED_ENV_PREFIX)
        }
        _ => false,
    }
}

/// Full environment of a worker process; nothing is inherited implicitly.
pub fn worker_env(agent: &AgentConfig, worker: &WorkerConfig) -> Vec<(String, String)> {
    let mut vars = vec![
        ("PATH".to_string(), WORKER_PATH.to_string()),
        (
            "YGG_CONFIG_DIR".to_string(),
            agent.config_dir.display().to_string(),
        ),
        ("YGG_LOG_LEVEL".to_string(), agent.log_level.clone()),
        ("YGG_CLIENT_ID".to_string(), agent.client_id.clone()),
        (
            "YGG_SOCKET_ADDR".to_string(),
            format!("unix:{}", agent.socket_path.display()),
        ),
    ];

    for (name, value) in env::proxy_vars() {
        vars.push((name.to_string(), value));
    }

    for entry in &worker.env {
        if !valid_env_var(entry) {
            warn!(
                "Ignoring env entry '{}' of worker '{}'",
                entry, worker.directive
            );
            continue;
        }
        if let Some((key, value)) = entry.split_once('=') {
            vars.push((key.to_string(), value.to_string()));
        }
    }
    vars
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_env_var() {
        assert!(!valid_env_var("PATH=/x"));
        assert!(!valid_env_var("YGG_FOO=1"));
        assert!(!valid_env_var("YGG_CLIENT_ID=spoofed"));
        assert!(valid_env_var("HTTP_PROXY=http://x"));
        assert!(valid_env_var("LD_LIBRARY_PATH=/opt/lib"));
        assert!(valid_env_var("EMPTY="));
        assert!(!valid_env_var("NO_EQUALS_SIGN"));
        assert!(!valid_env_var("=value"));
    }

    #[test]
    fn test_load_worker_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("package_manager.toml");
        fs::write(
            &path,
            r#"
exec = "/usr/libexec/pkg-worker --verbose"
env = ["PKG_CACHE=/var/cache/pkg", "PATH=/tmp/evil"]
remote_content = true

[features]
version = "2"
"#,
        )
        .unwrap();

        let config = WorkerConfig::load(&path).unwrap();
        assert_eq!(config.directive, "package_manager");
        assert!(config.remote_content);
        assert_eq!(config.features.get("version").map(String::as_str), Some("2"));

        let (program, args) = config.argv().unwrap();
        assert_eq!(program, "/usr/libexec/pkg-worker");
        assert_eq!(args, vec!["--verbose".to_string()]);
    }

    #[test]
    fn test_empty_exec() {
        let config = WorkerConfig {
            exec: "   ".to_string(),
            env: Vec::new(),
            features: Features::new(),
            remote_content: false,
            directive: "blank".to_string(),
            path: PathBuf::new(),
        };
        assert!(matches!(config.argv(), Err(SupervisorError::EmptyExec(_))));
    }

    #[test]
    fn test_worker_env_filters_reserved_entries() {
        let agent = AgentConfig::for_state_dir("/var/lib/courier");
        let worker = WorkerConfig {
            exec: "/bin/true".to_string(),
            env: vec![
                "PATH=/tmp/evil".to_string(),
                "YGG_CLIENT_ID=spoofed".to_string(),
                "GREETING=hello=world".to_string(),
            ],
            features: Features::new(),
            remote_content: false,
            directive: "echo".to_string(),
            path: PathBuf::new(),
        };

        let vars = worker_env(&agent, &worker);
        let get = |name: &str| {
            vars.iter()
                .filter(|(k, _)| k == name)
                .map(|(_, v)| v.as_str())
                .collect::<Vec<_>>()
        };

        assert_eq!(get("PATH"), vec![WORKER_PATH]);
        assert_eq!(get("YGG_CLIENT_ID"), vec!["test-client"]);
        assert_eq!(get("GREETING"), vec!["hello=world"]);
        assert_eq!(get("YGG_SOCKET_ADDR"), vec!["unix:/var/lib/courier/agent.sock"]);
    }

    #[test]
    fn test_is_worker_config() {
        assert!(is_worker_config(Path::new("/etc/courier/workers/echo.toml")));
        assert!(!is_worker_config(Path::new("/etc/courier/workers/echo.toml.swp")));
        assert!(!is_worker_config(Path::new("/etc/courier/workers/README")));
    }
}
