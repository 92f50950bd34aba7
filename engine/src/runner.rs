//! Process execution
//! Spawns proxy-core executables, captures their output, and reports
//! exits through watch channels instead of polling

use crate::domain::{BackendDescriptor, DomainError, Result};
use crate::logs::{LogBroadcaster, LogLine, LogSource};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// How long a fresh process must survive before start() reports success
pub const DEFAULT_GRACE_MS: u64 = 750;

/// SIGTERM to SIGKILL escalation timeout
pub const DEFAULT_STOP_TIMEOUT_SEC: u64 = 5;

/// Timeout for the `<executable> version` probe
const VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Everything needed to launch one backend process
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub backend_id: String,
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

/// Handle over a spawned process
///
/// `exited` starts at None and flips to Some(exit_code) exactly once.
/// Cloned receivers all observe the same exit.
#[derive(Debug)]
pub struct SpawnedProcess {
    pub pid: u32,
    pub exited: watch::Receiver<Option<i32>>,
}

/// Emitted to the supervisor when a spawned process exits
#[derive(Debug, Clone)]
pub struct BackendExitEvent {
    pub backend_id: String,
    pub pid: u32,
    pub exit_code: i32,
}

/// Seam between supervision logic and the OS
#[async_trait]
pub trait ProcessExecutor: Send + Sync {
    async fn spawn(&self, spec: SpawnSpec) -> Result<SpawnedProcess>;

    fn signal(&self, pid: u32, signal: i32) -> Result<()>;
}

/// Real executor backed by tokio::process
pub struct TokioProcessExecutor {
    logs: Arc<LogBroadcaster>,
}

impl TokioProcessExecutor {
    pub fn new(logs: Arc<LogBroadcaster>) -> Self {
        Self { logs }
    }
}

#[async_trait]
impl ProcessExecutor for TokioProcessExecutor {
    async fn spawn(&self, spec: SpawnSpec) -> Result<SpawnedProcess> {
        let mut command = Command::new(&spec.executable);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &spec.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| DomainError::Launch {
            id: spec.backend_id.clone(),
            reason: format!("spawn of {} failed: {e}", spec.executable.display()),
        })?;

        let pid = child.id().ok_or_else(|| DomainError::Launch {
            id: spec.backend_id.clone(),
            reason: "process exited before a pid could be observed".to_string(),
        })?;

        if let Some(stdout) = child.stdout.take() {
            spawn_capture(
                self.logs.clone(),
                spec.backend_id.clone(),
                LogSource::Stdout,
                stdout,
            );
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_capture(
                self.logs.clone(),
                spec.backend_id.clone(),
                LogSource::Stderr,
                stderr,
            );
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let backend_id = spec.backend_id.clone();
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => exit_code_of(status),
                Err(e) => {
                    warn!(backend = %backend_id, error = %e, "wait on child process failed");
                    -1
                }
            };
            debug!(backend = %backend_id, pid = pid, exit_code = code, "process exited");
            let _ = exit_tx.send(Some(code));
        });

        info!(
            backend = %spec.backend_id,
            pid = pid,
            executable = %spec.executable.display(),
            "process spawned"
        );
        Ok(SpawnedProcess {
            pid,
            exited: exit_rx,
        })
    }

    fn signal(&self, pid: u32, signal: i32) -> Result<()> {
        // ESRCH means the process already exited, which callers treat
        // as the desired end state
        let rc = unsafe { libc::kill(pid as libc::pid_t, signal) };
        if rc == -1 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ESRCH) {
                return Ok(());
            }
            return Err(DomainError::io("sending signal", err));
        }
        Ok(())
    }
}

fn spawn_capture<R>(logs: Arc<LogBroadcaster>, backend_id: String, source: LogSource, reader: R)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(text)) = lines.next_line().await {
            logs.publish(LogLine::now(backend_id.clone(), source, text));
        }
    });
}

/// Normalize an exit status to one i32: the exit code, or 128 + signal
/// for signal deaths (matching shell convention)
fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}

/// How a stop request concluded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Exited within the timeout after SIGTERM
    Graceful,
    /// Needed SIGKILL
    Forced,
    /// Already gone when the stop was requested
    AlreadyStopped,
}

/// Start/stop/reload primitives over a `ProcessExecutor`
///
/// Holds no per-backend state; the supervisor owns that.
pub struct ProcessRunner {
    executor: Arc<dyn ProcessExecutor>,
    grace: Duration,
    stop_timeout: Duration,
}

impl ProcessRunner {
    pub fn new(executor: Arc<dyn ProcessExecutor>, grace: Duration, stop_timeout: Duration) -> Self {
        Self {
            executor,
            grace,
            stop_timeout,
        }
    }

    /// Launch `descriptor` against its config file and hold the result
    /// for a short grace window. A process that dies inside the window
    /// is a failed launch, not a crash.
    pub async fn start(&self, descriptor: &BackendDescriptor) -> Result<SpawnedProcess> {
        let spec = SpawnSpec {
            backend_id: descriptor.id.clone(),
            executable: descriptor.executable.clone(),
            args: descriptor.launch_args(&descriptor.config_path),
            working_dir: descriptor.working_dir.clone(),
        };

        let process = self.executor.spawn(spec).await?;

        let mut exited = process.exited.clone();
        let early_exit = tokio::time::timeout(self.grace, wait_for_exit(&mut exited)).await;
        if let Ok(code) = early_exit {
            return Err(DomainError::Launch {
                id: descriptor.id.clone(),
                reason: format!("exited with code {code} during the startup grace window"),
            });
        }

        Ok(process)
    }

    /// SIGTERM, wait up to the stop timeout, then SIGKILL
    pub async fn stop(
        &self,
        backend_id: &str,
        pid: u32,
        mut exited: watch::Receiver<Option<i32>>,
    ) -> Result<StopOutcome> {
        if exited.borrow().is_some() {
            return Ok(StopOutcome::AlreadyStopped);
        }

        self.executor.signal(pid, libc::SIGTERM)?;
        debug!(backend = backend_id, pid = pid, "sent SIGTERM");

        if tokio::time::timeout(self.stop_timeout, wait_for_exit(&mut exited))
            .await
            .is_ok()
        {
            return Ok(StopOutcome::Graceful);
        }

        warn!(
            backend = backend_id,
            pid = pid,
            timeout_sec = self.stop_timeout.as_secs(),
            "process ignored SIGTERM, escalating to SIGKILL"
        );
        self.executor.signal(pid, libc::SIGKILL)?;
        wait_for_exit(&mut exited).await;
        Ok(StopOutcome::Forced)
    }

    /// Ask the engine to re-read its config file
    pub fn reload(&self, backend_id: &str, pid: u32) -> Result<()> {
        self.executor.signal(pid, libc::SIGHUP)?;
        debug!(backend = backend_id, pid = pid, "sent SIGHUP for config reload");
        Ok(())
    }
}

/// Resolve once `exited` carries an exit code. Returns -1 if the
/// sender vanished without reporting one.
pub async fn wait_for_exit(exited: &mut watch::Receiver<Option<i32>>) -> i32 {
    loop {
        let current = *exited.borrow();
        if let Some(code) = current {
            return code;
        }
        if exited.changed().await.is_err() {
            return -1;
        }
    }
}

/// Forward the eventual exit of `exited` as a `BackendExitEvent`
pub fn forward_exit(
    backend_id: String,
    pid: u32,
    mut exited: watch::Receiver<Option<i32>>,
    events: mpsc::UnboundedSender<BackendExitEvent>,
) {
    tokio::spawn(async move {
        let exit_code = wait_for_exit(&mut exited).await;
        let _ = events.send(BackendExitEvent {
            backend_id,
            pid,
            exit_code,
        });
    });
}

/// Run `<executable> version` and pull the version token out of the
/// first output line. Both supported engines print one, e.g.
/// `Xray 1.8.4 (...)` and `sing-box version 1.8.0`.
pub async fn probe_core_version(executable: &Path) -> Option<String> {
    let output = tokio::time::timeout(
        VERSION_PROBE_TIMEOUT,
        Command::new(executable)
            .arg("version")
            .stdin(Stdio::null())
            .output(),
    )
    .await
    .ok()?
    .ok()?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let first_line = stdout.lines().next()?;
    parse_version_token(first_line)
}

fn parse_version_token(line: &str) -> Option<String> {
    line.split_whitespace()
        .find(|token| {
            token.contains('.')
                && token.chars().next().is_some_and(|c| c.is_ascii_digit())
        })
        .map(|token| token.trim_end_matches(',').to_string())
}
