use std::fmt;
use std::io;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// How a worker process ended, with the CPU time it spent in the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitReport {
    pub pid: u32,
    pub code: Option<i32>,
    pub signal: Option<i32>,
    pub system_time: Duration,
}

impl fmt::Display for ExitReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "PID {} exited with status {}", self.pid, code),
            (None, Some(signal)) => write!(f, "PID {} killed by signal {}", self.pid, signal),
            (None, None) => write!(f, "PID {} ended", self.pid),
        }
    }
}

/// Starts `program` with exactly `env` as its environment.
pub fn spawn(program: &str, args: &[String], env: &[(String, String)]) -> io::Result<Child> {
    Command::new(program)
        .args(args)
        .env_clear()
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
}

/// Forwards the child's stdout at trace level and stderr at warn level
/// until EOF or until `token` is cancelled.
///
/// A helper forked by the worker can hold the pipes open after the worker
/// exits, so the readers must not outlive the supervisor.
pub fn drain_output(directive: &str, child: &mut Child, token: &CancellationToken) {
    if let Some(stdout) = child.stdout.take() {
        match tokio::process::ChildStdout::from_std(stdout) {
            Ok(stdout) => {
                let name = directive.to_string();
                let token = token.clone();
                tokio::spawn(async move {
                    let mut lines = BufReader::new(stdout).lines();
                    loop {
                        tokio::select! {
                            line = lines.next_line() => match line {
                                Ok(Some(line)) => trace!(worker = %name, "{}", line),
                                Ok(None) => break,
                                Err(e) => {
                                    debug!("Stopped reading stdout of '{}': {}", name, e);
                                    break;
                                }
                            },
                            _ = token.cancelled() => break,
                        }
                    }
                });
            }
            Err(e) => warn!("Cannot read stdout of '{}': {}", directive, e),
        }
    }
    if let Some(stderr) = child.stderr.take() {
        match tokio::process::ChildStderr::from_std(stderr) {
            Ok(stderr) => {
                let name = directive.to_string();
                let token = token.clone();
                tokio::spawn(async move {
                    let mut lines = BufReader::new(stderr).lines();
                    loop {
                        tokio::select! {
                            line = lines.next_line() => match line {
                                Ok(Some(line)) => warn!(worker = %name, "{}", line),
                                Ok(None) => break,
                                Err(e) => {
                                    debug!("Stopped reading stderr of '{}': {}", name, e);
                                    break;
                                }
                            },
                            _ = token.cancelled() => break,
                        }
                    }
                });
            }
            Err(e) => warn!("Cannot read stderr of '{}': {}", directive, e),
        }
    }
}

/// Reaps `pid`, collecting its resource usage.
pub async fn wait(pid: u32) -> io::Result<ExitReport> {
    tokio::task::spawn_blocking(move || wait_blocking(pid))
        .await
        .map_err(io::Error::other)?
}

fn wait_blocking(pid: u32) -> io::Result<ExitReport> {
    let mut status: libc::c_int = 0;
    // SAFETY: rusage is plain old data; all-zero is a valid value.
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };

    loop {
        // SAFETY: status and usage are valid for writes for the duration of the call.
        let rc = unsafe { libc::wait4(pid as libc::pid_t, &mut status, 0, &mut usage) };
        if rc != -1 {
            break;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }

    let system_time = Duration::from_secs(usage.ru_stime.tv_sec.max(0) as u64)
        + Duration::from_micros(usage.ru_stime.tv_usec.max(0) as u64);
    let code = libc::WIFEXITED(status).then(|| libc::WEXITSTATUS(status));
    let signal = libc::WIFSIGNALED(status).then(|| libc::WTERMSIG(status));

    Ok(ExitReport {
        pid,
        code,
        signal,
        system_time,
    })
}

pub fn signal(pid: u32, signal: libc::c_int) -> io::Result<()> {
    // SAFETY: kill has no memory-safety preconditions.
    let rc = unsafe { libc::kill(pid as libc::pid_t, signal) };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Start time of `pid` in clock ticks after boot, from `/proc/<pid>/stat`.
/// Together with the PID it identifies one process instance.
pub fn start_time(pid: u32) -> Option<u64> {
    let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    parse_start_time(&stat)
}

fn parse_start_time(stat: &str) -> Option<u64> {
    // The command name may contain spaces and parens; fields resume after the last ')'.
    let rest = &stat[stat.rfind(')')? + 1..];
    // `state` is field 3, `starttime` is field 22.
    rest.split_whitespace().nth(19)?.parse().ok()
}

pub fn is_running(pid: u32) -> bool {
    signal(pid, 0).is_ok()
}

/// Sends SIGTERM, then SIGKILL if the process outlives `grace`.
pub async fn terminate(pid: u32, grace: Duration) -> io::Result<()> {
    match signal(pid, libc::SIGTERM) {
        Ok(()) => {}
        Err(e) if e.raw_os_error() == Some(libc::ESRCH) => return Ok(()),
        Err(e) => return Err(e),
    }

    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        if !is_running(pid) {
            debug!("PID {} stopped gracefully", pid);
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    warn!("PID {} did not stop in time, force killing", pid);
    match signal(pid, libc::SIGKILL) {
        Err(e) if e.raw_os_error() != Some(libc::ESRCH) => Err(e),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Child {
        spawn(
            "/bin/sh",
            &["-c".to_string(), script.to_string()],
            &[("PATH".to_string(), "/usr/bin:/bin".to_string())],
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_wait_reports_exit_code() {
        let mut child = sh("exit 3");
        drain_output("test", &mut child, &CancellationToken::new());

        let report = wait(child.id()).await.unwrap();
        assert_eq!(report.code, Some(3));
        assert_eq!(report.signal, None);
        assert!(report.system_time < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_env_is_exactly_what_was_given() {
        let mut child = spawn(
            "/bin/sh",
            &["-c".to_string(), "test -z \"$HOME\" && test \"$GREETING\" = hi".to_string()],
            &[
                ("PATH".to_string(), "/usr/bin:/bin".to_string()),
                ("GREETING".to_string(), "hi".to_string()),
            ],
        )
        .unwrap();
        drain_output("test", &mut child, &CancellationToken::new());

        let report = wait(child.id()).await.unwrap();
        assert_eq!(report.code, Some(0));
    }

    #[tokio::test]
    async fn test_terminate_running_process() {
        let mut child = sh("sleep 30");
        drain_output("test", &mut child, &CancellationToken::new());
        let pid = child.id();
        let waiter = tokio::spawn(wait(pid));

        terminate(pid, Duration::from_secs(5)).await.unwrap();

        let report = waiter.await.unwrap().unwrap();
        assert_eq!(report.signal, Some(libc::SIGTERM));
    }

    #[test]
    fn test_forked_helper_does_not_hold_up_shutdown() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let report = runtime.block_on(async {
            let mut child = sh("sleep 3 & exit 0");
            drain_output("helper", &mut child, &CancellationToken::new());
            wait(child.id()).await.unwrap()
        });
        assert_eq!(report.code, Some(0));

        let started = std::time::Instant::now();
        drop(runtime);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_parse_start_time() {
        let stat = "4242 (my (odd) worker) S 1 4242 4242 0 -1 4194560 100 0 0 0 1 2 0 0 20 0 1 0 987654 1000 10";
        assert_eq!(parse_start_time(stat), Some(987654));
        assert_eq!(parse_start_time("garbage"), None);
    }

    #[test]
    fn test_start_time_of_own_process() {
        let own = start_time(std::process::id());
        if std::path::Path::new("/proc/self/stat").exists() {
            assert!(own.is_some());
            assert_eq!(own, start_time(std::process::id()));
        }
    }

    #[test]
    fn test_spawn_missing_program() {
        let err = spawn("/nonexistent/worker", &[], &[]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
