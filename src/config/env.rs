//! `COURIER_*` environment accessors.

use std::path::PathBuf;
use std::time::Duration;

use super::{ConfigError, PartialConfig, Protocol};

macro_rules! env_vars {
    ($($variant:ident => $name:literal),* $(,)?) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum EnvVar {
            $($variant),*
        }

        impl EnvVar {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(EnvVar::$variant => $name),*
                }
            }
        }
    };
}

env_vars! {
    ConfigFile          => "COURIER_CONFIG",
    ClientId            => "COURIER_CLIENT_ID",
    Server              => "COURIER_SERVER",
    Protocol            => "COURIER_PROTOCOL",
    PathPrefix          => "COURIER_PATH_PREFIX",
    DataHost            => "COURIER_DATA_HOST",
    LogLevel            => "COURIER_LOG_LEVEL",
    CertFile            => "COURIER_CERT_FILE",
    KeyFile             => "COURIER_KEY_FILE",
    CaRoot              => "COURIER_CA_ROOT",
    FactsFile           => "COURIER_FACTS_FILE",
    TagsFile            => "COURIER_TAGS_FILE",
    ConfigDir           => "COURIER_CONFIG_DIR",
    WorkerDir           => "COURIER_WORKER_DIR",
    StateDir            => "COURIER_STATE_DIR",
    RunDir              => "COURIER_RUN_DIR",
    Socket              => "COURIER_SOCKET",
    ExcludeWorkers      => "COURIER_EXCLUDE_WORKERS",
    HttpPollingInterval => "COURIER_HTTP_POLLING_INTERVAL",
    TransmitTimeout     => "COURIER_TRANSMIT_TIMEOUT_MS",
}

/// Value of `var`, treating an empty string as unset.
pub fn env_opt(var: EnvVar) -> Option<String> {
    std::env::var(var.as_str()).ok().filter(|v| !v.is_empty())
}

fn env_path(var: EnvVar) -> Option<PathBuf> {
    env_opt(var).map(PathBuf::from)
}

fn env_list(var: EnvVar) -> Option<Vec<String>> {
    env_opt(var).map(|v| split_list(&v))
}

fn env_u64(var: EnvVar) -> Result<Option<u64>, ConfigError> {
    env_opt(var)
        .map(|v| {
            v.trim().parse::<u64>().map_err(|e| ConfigError::InvalidValue {
                key: var.as_str().to_string(),
                value: v.clone(),
                reason: e.to_string(),
            })
        })
        .transpose()
}

/// Splits a comma separated list, dropping blanks.
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Explicit config file path ($COURIER_CONFIG)
pub fn config_file() -> Option<PathBuf> {
    let path = env_path(EnvVar::ConfigFile);
    tracing::trace!(path = ?path, "COURIER_CONFIG env var");
    path
}

/// Reads every `COURIER_*` setting into a config layer.
pub fn load() -> Result<PartialConfig, ConfigError> {
    let protocol = env_opt(EnvVar::Protocol)
        .map(|v| v.parse::<Protocol>())
        .transpose()?;

    let layer = PartialConfig {
        client_id: env_opt(EnvVar::ClientId),
        server: env_list(EnvVar::Server),
        protocol,
        path_prefix: env_opt(EnvVar::PathPrefix),
        data_host: env_opt(EnvVar::DataHost),
        log_level: env_opt(EnvVar::LogLevel),
        cert_file: env_path(EnvVar::CertFile),
        key_file: env_path(EnvVar::KeyFile),
        ca_root: env_list(EnvVar::CaRoot).map(|l| l.into_iter().map(PathBuf::from).collect()),
        facts_file: env_path(EnvVar::FactsFile),
        tags_file: env_path(EnvVar::TagsFile),
        config_dir: env_path(EnvVar::ConfigDir),
        worker_config_dir: env_path(EnvVar::WorkerDir),
        state_dir: env_path(EnvVar::StateDir),
        run_dir: env_path(EnvVar::RunDir),
        socket_path: env_path(EnvVar::Socket),
        exclude_workers: env_list(EnvVar::ExcludeWorkers),
        http_polling_interval_secs: env_u64(EnvVar::HttpPollingInterval)?,
        transmit_timeout_ms: env_u64(EnvVar::TransmitTimeout)?,
    };
    tracing::trace!(?layer, "Environment config layer");
    Ok(layer)
}

/// Proxy settings inherited by workers, upper-case spelling first.
pub fn proxy_vars() -> Vec<(&'static str, String)> {
    [
        ("HTTP_PROXY", "http_proxy"),
        ("HTTPS_PROXY", "https_proxy"),
        ("NO_PROXY", "no_proxy"),
    ]
    .into_iter()
    .filter_map(|(upper, lower)| {
        std::env::var(upper)
            .ok()
            .filter(|v| !v.is_empty())
            .or_else(|| std::env::var(lower).ok().filter(|v| !v.is_empty()))
            .map(|v| (upper, v))
    })
    .collect()
}

pub(crate) fn secs(value: Option<u64>) -> Option<Duration> {
    value.map(Duration::from_secs)
}
