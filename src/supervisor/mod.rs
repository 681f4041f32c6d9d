//! Worker process supervision
//!
//! The worker config directory is the source of truth for which workers
//! run. Each `<directive>.toml` gets one supervision task that spawns the
//! process, records its PID, waits for it, and restarts it while the
//! config file exists and the backoff allows.

pub mod backoff;
pub mod config;
pub mod pidfile;
pub mod process;
pub mod watch;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::AgentConfig;
use backoff::{RestartBackoff, RestartDecision};
use pidfile::{PidDirectory, PidRecord};
use process::ExitReport;

pub use backoff::RestartPolicy;
pub use config::{valid_env_var, worker_env, WorkerConfig};

/// How long a stopped worker gets between SIGTERM and SIGKILL.
pub const STOP_GRACE: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot parse worker config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("no directive name in {0}")]
    NoDirective(PathBuf),

    #[error("worker '{0}' has an empty exec line")]
    EmptyExec(String),

    #[error("cannot start worker '{directive}': {source}")]
    Spawn {
        directive: String,
        source: std::io::Error,
    },

    #[error("cannot wait for worker '{directive}': {source}")]
    Wait {
        directive: String,
        source: std::io::Error,
    },

    #[error("PID file {path}: {source}")]
    PidFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot signal PID {pid}: {source}")]
    Signal { pid: u32, source: std::io::Error },

    #[error("worker '{0}' is not running")]
    NotRunning(String),

    #[error("directory watch failed: {0}")]
    Watch(#[from] notify::Error),
}

/// Liveness changes reported to the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    Started { directive: String, pid: u32 },
    Exited { directive: String, pid: u32 },
    GaveUp { directive: String },
}

pub struct WorkerSupervisor {
    config: Arc<AgentConfig>,
    policy: RestartPolicy,
    pids: PidDirectory,
    declared: RwLock<HashMap<String, WorkerConfig>>,
    supervised: Mutex<HashSet<String>>,
    /// PIDs of children spawned by this supervisor and not yet reaped.
    running: Mutex<HashMap<String, u32>>,
    events: mpsc::UnboundedSender<SupervisorEvent>,
    token: CancellationToken,
}

impl WorkerSupervisor {
    pub fn new(config: Arc<AgentConfig>) -> (Arc<Self>, mpsc::UnboundedReceiver<SupervisorEvent>) {
        Self::with_policy(config, RestartPolicy::default())
    }

    pub fn with_policy(
        config: Arc<AgentConfig>,
        policy: RestartPolicy,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<SupervisorEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let supervisor = Self {
            pids: PidDirectory::new(config.pid_dir()),
            config,
            policy,
            declared: RwLock::new(HashMap::new()),
            supervised: Mutex::new(HashSet::new()),
            running: Mutex::new(HashMap::new()),
            events,
            token: CancellationToken::new(),
        };
        (Arc::new(supervisor), rx)
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn pid_directory(&self) -> &PidDirectory {
        &self.pids
    }

    /// Config the worker runs, or will run on its next start.
    pub fn declared(&self, directive: &str) -> Option<WorkerConfig> {
        self.declared
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(directive)
            .cloned()
    }

    pub fn is_supervised(&self, directive: &str) -> bool {
        self.supervised
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(directive)
    }

    /// Starts every worker config found in the worker directory.
    pub fn start_all(self: &Arc<Self>) -> Result<usize, SupervisorError> {
        let dir = &self.config.worker_config_dir;
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Worker config directory {} does not exist", dir.display());
                return Ok(0);
            }
            Err(source) => {
                return Err(SupervisorError::Read {
                    path: dir.clone(),
                    source,
                })
            }
        };

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| config::is_worker_config(p))
            .collect();
        paths.sort();

        let mut started = 0;
        for path in paths {
            match self.start_path(&path) {
                Ok(true) => started += 1,
                Ok(false) => {}
                Err(e) => error!("Cannot start worker from {}: {}", path.display(), e),
            }
        }
        Ok(started)
    }

    pub fn start_path(self: &Arc<Self>, path: &Path) -> Result<bool, SupervisorError> {
        let config = WorkerConfig::load(path)?;
        Ok(self.start(config))
    }

    /// Begins supervising `config`. Returns false when the worker is excluded,
    /// already supervised, or the supervisor is shutting down. An already
    /// supervised worker picks up `config` on its next start.
    pub fn start(self: &Arc<Self>, config: WorkerConfig) -> bool {
        let directive = config.directive.clone();
        if self.token.is_cancelled() {
            return false;
        }
        if self.config.is_excluded(&directive) {
            info!("Skipping excluded worker '{}'", directive);
            return false;
        }

        let mut supervised = self.supervised.lock().unwrap_or_else(PoisonError::into_inner);
        self.declared
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(directive.clone(), config);
        if !supervised.insert(directive.clone()) {
            debug!("Worker '{}' is already supervised, config updated", directive);
            return false;
        }
        drop(supervised);

        tokio::spawn(Arc::clone(self).supervise(directive));
        true
    }

    async fn supervise(self: Arc<Self>, directive: String) {
        let mut backoff = RestartBackoff::with_policy(self.policy);
        let mut delay = Duration::ZERO;

        loop {
            if !delay.is_zero() {
                trace!("Delaying start of worker '{}' for {:?}", directive, delay);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = self.token.cancelled() => {}
                }
            }
            let config = match self.runnable(&directive) {
                Some(config) => config,
                None if self.release(&directive) => break,
                None => continue,
            };

            let report = match self.run_once(&config).await {
                Ok(report) => report,
                Err(e) => {
                    error!("{}", e);
                    self.forget(&directive);
                    break;
                }
            };
            info!("Worker '{}' stopped: {}", directive, report);

            if self.runnable(&directive).is_none() {
                if self.release(&directive) {
                    break;
                }
                // Config came back while the old process was exiting.
                backoff = RestartBackoff::with_policy(self.policy);
                delay = Duration::ZERO;
                continue;
            }
            match backoff.record_exit(report.system_time) {
                RestartDecision::Restart { after } => delay = after,
                RestartDecision::GiveUp => {
                    error!(
                        "Worker '{}' failed to start too many times, giving up",
                        directive
                    );
                    let _ = self.events.send(SupervisorEvent::GaveUp {
                        directive: directive.clone(),
                    });
                    self.forget(&directive);
                    break;
                }
            }
        }
    }

    /// Current config of `directive` if it should be (re)started.
    fn runnable(&self, directive: &str) -> Option<WorkerConfig> {
        if self.token.is_cancelled() {
            return None;
        }
        self.declared(directive).filter(|c| c.path.exists())
    }

    /// Ends supervision unless the worker became runnable again. Checked
    /// under the `supervised` lock so a concurrent `start` is never lost.
    fn release(&self, directive: &str) -> bool {
        let mut supervised = self.supervised.lock().unwrap_or_else(PoisonError::into_inner);
        if self.runnable(directive).is_some() {
            return false;
        }
        supervised.remove(directive);
        debug!("Supervision of worker '{}' ended", directive);
        true
    }

    fn forget(&self, directive: &str) {
        self.supervised
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(directive);
        debug!("Supervision of worker '{}' ended", directive);
    }

    fn running_pid(&self, directive: &str) -> Option<u32> {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(directive)
            .copied()
    }

    async fn run_once(&self, config: &WorkerConfig) -> Result<ExitReport, SupervisorError> {
        let directive = &config.directive;
        let (program, args) = config.argv()?;
        let env = worker_env(&self.config, config);

        let mut child = process::spawn(&program, &args, &env).map_err(|source| {
            SupervisorError::Spawn {
                directive: directive.clone(),
                source,
            }
        })?;
        let pid = child.id();
        info!("Started worker '{}' with PID {}", directive, pid);
        process::drain_output(directive, &mut child, &self.token);
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(directive.clone(), pid);

        let record = PidRecord {
            pid,
            start_time: process::start_time(pid),
        };
        if let Err(e) = self.pids.write(directive, record) {
            warn!("{}", e);
        }
        let _ = self.events.send(SupervisorEvent::Started {
            directive: directive.clone(),
            pid,
        });

        let waited = process::wait(pid).await;
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(directive);
        let report = waited.map_err(|source| SupervisorError::Wait {
            directive: directive.clone(),
            source,
        })?;

        if let Err(e) = self.pids.remove_if(directive, pid) {
            warn!("{}", e);
        }
        let _ = self.events.send(SupervisorEvent::Exited {
            directive: directive.clone(),
            pid,
        });
        Ok(report)
    }

    /// Stops a worker and stops supervising it.
    ///
    /// A PID known only from its PID file is signalled only when the file's
    /// start time matches the live process; stale files are removed.
    pub async fn stop(&self, directive: &str) -> Result<(), SupervisorError> {
        self.declared
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(directive);

        let pid = match self.running_pid(directive) {
            Some(pid) => pid,
            None => match self.pids.read_record(directive)? {
                Some(record) if is_same_process(&record) => record.pid,
                Some(record) => {
                    warn!(
                        "Ignoring stale PID file of worker '{}' (PID {})",
                        directive, record.pid
                    );
                    return self.pids.remove(directive);
                }
                None => return Err(SupervisorError::NotRunning(directive.to_string())),
            },
        };
        info!("Stopping worker '{}' (PID {})", directive, pid);
        process::terminate(pid, STOP_GRACE)
            .await
            .map_err(|source| SupervisorError::Signal { pid, source })?;
        self.pids.remove_if(directive, pid).map(|_| ())
    }

    /// Stops every running worker and every process with a PID file,
    /// including ones left behind by a previous agent run.
    pub async fn stop_recorded(&self) {
        let mut directives = match self.pids.list() {
            Ok(directives) => directives,
            Err(e) => {
                warn!("Cannot list worker PID files: {}", e);
                Vec::new()
            }
        };
        directives.extend(
            self.running
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .keys()
                .cloned(),
        );
        directives.sort();
        directives.dedup();

        for directive in directives {
            if let Err(e) = self.stop(&directive).await {
                warn!("Failed to stop worker '{}': {}", directive, e);
            }
        }
    }

    /// Ends all supervision and stops every recorded worker.
    pub async fn stop_all(&self) {
        self.token.cancel();
        self.stop_recorded().await;
    }
}

/// True when `record` still describes a live process.
fn is_same_process(record: &PidRecord) -> bool {
    record.start_time.is_some() && process::start_time(record.pid) == record.start_time
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<SupervisorEvent>) -> SupervisorEvent {
        tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("supervisor event")
            .expect("channel open")
    }

    fn write_worker(dir: &Path, name: &str, exec: &str) -> PathBuf {
        std::fs::create_dir_all(dir).unwrap();
        let path = dir.join(format!("{}.toml", name));
        std::fs::write(&path, format!("exec = \"{}\"\n", exec)).unwrap();
        path
    }

    #[tokio::test]
    async fn test_start_and_stop_worker() {
        let state = tempfile::tempdir().unwrap();
        let config = Arc::new(AgentConfig::for_state_dir(state.path()));
        write_worker(&config.worker_config_dir, "sleeper", "/bin/sleep 30");
        let (supervisor, mut events) = WorkerSupervisor::new(Arc::clone(&config));

        assert_eq!(supervisor.start_all().unwrap(), 1);
        let pid = match next_event(&mut events).await {
            SupervisorEvent::Started { directive, pid } => {
                assert_eq!(directive, "sleeper");
                pid
            }
            other => panic!("unexpected event {:?}", other),
        };
        assert_eq!(supervisor.pid_directory().read("sleeper").unwrap(), Some(pid));
        assert!(supervisor.declared("sleeper").is_some());

        supervisor.stop("sleeper").await.unwrap();

        assert_eq!(
            next_event(&mut events).await,
            SupervisorEvent::Exited {
                directive: "sleeper".to_string(),
                pid
            }
        );
        assert_eq!(supervisor.pid_directory().read("sleeper").unwrap(), None);
        assert!(supervisor.declared("sleeper").is_none());
    }

    #[tokio::test]
    async fn test_excluded_worker_is_skipped() {
        let state = tempfile::tempdir().unwrap();
        let mut config = AgentConfig::for_state_dir(state.path());
        config.exclude_workers = vec!["noisy".to_string()];
        let path = write_worker(&config.worker_config_dir, "noisy", "/bin/sleep 30");
        let (supervisor, _events) = WorkerSupervisor::new(Arc::new(config));

        assert!(!supervisor.start_path(&path).unwrap());
        assert!(!supervisor.is_supervised("noisy"));
    }

    #[tokio::test]
    async fn test_duplicate_start_is_ignored() {
        let state = tempfile::tempdir().unwrap();
        let config = Arc::new(AgentConfig::for_state_dir(state.path()));
        let path = write_worker(&config.worker_config_dir, "sleeper", "/bin/sleep 30");
        let (supervisor, mut events) = WorkerSupervisor::new(config);

        assert!(supervisor.start_path(&path).unwrap());
        assert!(!supervisor.start_path(&path).unwrap());

        next_event(&mut events).await;
        supervisor.stop_all().await;
        assert!(supervisor.pid_directory().list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_worker_is_not_restarted_after_config_removal() {
        let state = tempfile::tempdir().unwrap();
        let config = Arc::new(AgentConfig::for_state_dir(state.path()));
        let path = write_worker(&config.worker_config_dir, "once", "/bin/sleep 1");
        let (supervisor, mut events) = WorkerSupervisor::new(config);

        assert!(supervisor.start_path(&path).unwrap());
        assert!(matches!(next_event(&mut events).await, SupervisorEvent::Started { .. }));
        std::fs::remove_file(&path).unwrap();

        assert!(matches!(next_event(&mut events).await, SupervisorEvent::Exited { .. }));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!supervisor.is_supervised("once"));
    }

    #[tokio::test]
    async fn test_missing_executable_ends_supervision() {
        let state = tempfile::tempdir().unwrap();
        let config = Arc::new(AgentConfig::for_state_dir(state.path()));
        let path = write_worker(&config.worker_config_dir, "ghost", "/nonexistent/ghost");
        let (supervisor, _events) = WorkerSupervisor::new(config);

        assert!(supervisor.start_path(&path).unwrap());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!supervisor.is_supervised("ghost"));
        assert!(supervisor.pid_directory().list().unwrap().is_empty());
    }

    fn quick_policy(give_up_at: Duration) -> RestartPolicy {
        RestartPolicy {
            step: Duration::from_millis(100),
            give_up_at,
            ..RestartPolicy::default()
        }
    }

    #[tokio::test]
    async fn test_stale_pid_file_does_not_signal_bystander() {
        let state = tempfile::tempdir().unwrap();
        let config = Arc::new(AgentConfig::for_state_dir(state.path()));
        let (supervisor, _events) = WorkerSupervisor::new(config);

        let mut bystander = std::process::Command::new("/bin/sleep").arg("30").spawn().unwrap();
        let pid = bystander.id();
        let pids = supervisor.pid_directory();
        pids.write("echo", PidRecord { pid, start_time: None }).unwrap();
        let recycled = PidRecord {
            pid,
            start_time: Some(process::start_time(pid).unwrap_or(0) + 1),
        };
        pids.write("relay", recycled).unwrap();

        supervisor.stop_recorded().await;

        assert!(bystander.try_wait().unwrap().is_none());
        assert!(pids.list().unwrap().is_empty());
        bystander.kill().unwrap();
        bystander.wait().unwrap();
    }

    #[tokio::test]
    async fn test_recorded_orphan_is_stopped() {
        let state = tempfile::tempdir().unwrap();
        let config = Arc::new(AgentConfig::for_state_dir(state.path()));
        let (supervisor, _events) = WorkerSupervisor::new(config);

        let mut orphan = std::process::Command::new("/bin/sleep").arg("30").spawn().unwrap();
        let pid = orphan.id();
        let Some(start_time) = process::start_time(pid) else {
            orphan.kill().unwrap();
            orphan.wait().unwrap();
            return;
        };
        supervisor
            .pid_directory()
            .write("echo", PidRecord { pid, start_time: Some(start_time) })
            .unwrap();
        // Reap concurrently so the zombie does not outlive SIGTERM.
        let reaper = std::thread::spawn(move || orphan.wait());

        supervisor.stop_recorded().await;

        let status = reaper.join().unwrap().unwrap();
        assert!(!status.success());
        assert!(supervisor.pid_directory().list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failing_worker_is_restarted_then_given_up() {
        let state = tempfile::tempdir().unwrap();
        let config = Arc::new(AgentConfig::for_state_dir(state.path()));
        let path = write_worker(&config.worker_config_dir, "broken", "/bin/false");
        let (supervisor, mut events) =
            WorkerSupervisor::with_policy(config, quick_policy(Duration::from_millis(300)));

        assert!(supervisor.start_path(&path).unwrap());

        let mut started = 0;
        loop {
            match next_event(&mut events).await {
                SupervisorEvent::Started { .. } => started += 1,
                SupervisorEvent::Exited { .. } => {}
                SupervisorEvent::GaveUp { directive } => {
                    assert_eq!(directive, "broken");
                    break;
                }
            }
        }
        assert_eq!(started, 3);
        assert!(!supervisor.is_supervised("broken"));
        assert!(supervisor.pid_directory().list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_config_recreated_while_worker_exits() {
        let state = tempfile::tempdir().unwrap();
        let config = Arc::new(AgentConfig::for_state_dir(state.path()));
        let dir = config.worker_config_dir.clone();
        let path = write_worker(&dir, "sleeper", "/bin/sleep 30");
        let (supervisor, mut events) =
            WorkerSupervisor::with_policy(config, quick_policy(Duration::from_secs(30)));

        assert!(supervisor.start_path(&path).unwrap());
        let first = match next_event(&mut events).await {
            SupervisorEvent::Started { pid, .. } => pid,
            other => panic!("unexpected event {:?}", other),
        };

        std::fs::remove_file(&path).unwrap();
        supervisor.stop("sleeper").await.unwrap();
        let path = write_worker(&dir, "sleeper", "/bin/sleep 30");
        supervisor.start_path(&path).unwrap();

        assert_eq!(
            next_event(&mut events).await,
            SupervisorEvent::Exited {
                directive: "sleeper".to_string(),
                pid: first
            }
        );
        let second = match next_event(&mut events).await {
            SupervisorEvent::Started { pid, .. } => pid,
            other => panic!("unexpected event {:?}", other),
        };
        assert_ne!(first, second);
        assert!(supervisor.is_supervised("sleeper"));

        supervisor.stop_all().await;
    }
}
