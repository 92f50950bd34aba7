//! Backend entity
//! Immutable registration data plus runtime bookkeeping for one
//! supervised proxy-core backend

use crate::domain::{BackendState, DomainError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// Base of the exponential restart backoff
pub const RESTART_BACKOFF_BASE: u32 = 2;

/// Kind of proxy-core engine a backend runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    Xray,
    SingBox,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Xray => write!(f, "xray"),
            BackendKind::SingBox => write!(f, "sing-box"),
        }
    }
}

/// Registration data for a managed backend. Immutable after startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendDescriptor {
    pub id: String,

    pub kind: BackendKind,

    /// Path to the proxy-core executable
    pub executable: PathBuf,

    /// Config file the executable reads; written exclusively by the
    /// config store via atomic replace
    pub config_path: PathBuf,

    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// Arguments placed before the config path. Empty means the
    /// engine default (`run -c`).
    #[serde(default)]
    pub args: Vec<String>,

    /// Config schema the backend accepts, e.g. "xray.v1"
    pub schema_version: String,

    /// Whether the engine re-reads its config on SIGHUP
    #[serde(default)]
    pub supports_reload: bool,

    /// Inbound tags to keep when filtering pushed configuration.
    /// Empty means keep everything.
    #[serde(default)]
    pub inbound_filter: Vec<String>,
}

impl BackendDescriptor {
    /// Full argument vector for launching the backend against `config_path`
    pub fn launch_args(&self, config_path: &Path) -> Vec<String> {
        let mut args = if self.args.is_empty() {
            vec!["run".to_string(), "-c".to_string()]
        } else {
            self.args.clone()
        };
        args.push(config_path.display().to_string());
        args
    }
}

/// Thresholds for automatic crash recovery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartPolicy {
    /// Crashes restarted immediately (no delay) before backoff kicks in
    #[serde(default = "default_max_immediate_restarts")]
    pub max_immediate_restarts: u32,

    /// First backoff delay in seconds
    #[serde(default = "default_backoff_base_sec")]
    pub backoff_base_sec: u64,

    /// Backoff cap in seconds
    #[serde(default = "default_backoff_max_sec")]
    pub backoff_max_sec: u64,

    /// Consecutive failures within the window that latch Degraded
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,

    /// Sliding window for counting failures, in seconds
    #[serde(default = "default_failure_window_sec")]
    pub failure_window_sec: u64,
}

fn default_max_immediate_restarts() -> u32 {
    2
}

fn default_backoff_base_sec() -> u64 {
    1
}

fn default_backoff_max_sec() -> u64 {
    60
}

fn default_max_failures() -> u32 {
    5
}

fn default_failure_window_sec() -> u64 {
    300
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_immediate_restarts: default_max_immediate_restarts(),
            backoff_base_sec: default_backoff_base_sec(),
            backoff_max_sec: default_backoff_max_sec(),
            max_failures: default_max_failures(),
            failure_window_sec: default_failure_window_sec(),
        }
    }
}

impl RestartPolicy {
    /// Delay before the next restart attempt given the consecutive
    /// failure count (1-based: the first crash has `failures == 1`).
    ///
    /// The first `max_immediate_restarts` attempts are immediate, then
    /// the delay grows as `backoff_base_sec * 2^n`, capped.
    pub fn restart_delay(&self, consecutive_failures: u32) -> Duration {
        if consecutive_failures <= self.max_immediate_restarts {
            return Duration::ZERO;
        }

        let exponent = consecutive_failures - self.max_immediate_restarts - 1;
        // Saturate instead of overflowing for pathological counters
        let delay = (RESTART_BACKOFF_BASE as u64)
            .checked_pow(exponent)
            .and_then(|factor| factor.checked_mul(self.backoff_base_sec))
            .unwrap_or(self.backoff_max_sec);

        Duration::from_secs(delay.min(self.backoff_max_sec))
    }
}

/// Runtime bookkeeping for one backend
///
/// Exclusively owned by its supervised unit; all mutation happens under
/// the unit's lock.
#[derive(Debug, Clone)]
pub struct Backend {
    descriptor: BackendDescriptor,
    state: BackendState,
    pid: Option<u32>,
    started_at: Option<SystemTime>,
    last_exit_code: Option<i32>,
    last_error: Option<String>,
    core_version: Option<String>,
    consecutive_failures: u32,
    failure_times: Vec<SystemTime>,
    run_count: u32,
}

impl Backend {
    pub fn new(descriptor: BackendDescriptor) -> Self {
        Self {
            descriptor,
            state: BackendState::Stopped,
            pid: None,
            started_at: None,
            last_exit_code: None,
            last_error: None,
            core_version: None,
            consecutive_failures: 0,
            failure_times: Vec::new(),
            run_count: 0,
        }
    }

    // ===== Accessors =====

    pub fn descriptor(&self) -> &BackendDescriptor {
        &self.descriptor
    }

    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    pub fn state(&self) -> BackendState {
        self.state
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn last_exit_code(&self) -> Option<i32> {
        self.last_exit_code
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn core_version(&self) -> Option<&str> {
        self.core_version.as_deref()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn run_count(&self) -> u32 {
        self.run_count
    }

    pub fn uptime(&self) -> Option<Duration> {
        if !matches!(self.state, BackendState::Running) {
            return None;
        }
        self.started_at.and_then(|t| t.elapsed().ok())
    }

    // ===== State transitions =====

    pub fn mark_starting(&mut self) -> Result<(), DomainError> {
        self.transition(BackendState::Starting)?;
        self.started_at = Some(SystemTime::now());
        Ok(())
    }

    pub fn mark_running(&mut self, pid: u32) -> Result<(), DomainError> {
        self.transition(BackendState::Running)?;
        self.pid = Some(pid);
        self.run_count += 1;
        Ok(())
    }

    pub fn mark_stopping(&mut self) -> Result<(), DomainError> {
        self.transition(BackendState::Stopping)
    }

    pub fn mark_stopped(&mut self) -> Result<(), DomainError> {
        self.transition(BackendState::Stopped)?;
        self.pid = None;
        Ok(())
    }

    /// Spontaneous exit while the process was supposed to be running
    pub fn mark_crashed(&mut self, exit_code: i32) -> Result<(), DomainError> {
        self.transition(BackendState::Crashed(exit_code))?;
        self.pid = None;
        self.last_exit_code = Some(exit_code);
        Ok(())
    }

    pub fn mark_degraded(&mut self) -> Result<(), DomainError> {
        self.transition(BackendState::Degraded)
    }

    fn transition(&mut self, to: BackendState) -> Result<(), DomainError> {
        if !self.state.can_transition_to(to) {
            return Err(DomainError::InvalidStateTransition {
                from: self.state.to_string(),
                to: to.to_string(),
            });
        }
        self.state = to;
        Ok(())
    }

    // ===== Failure tracking =====

    pub fn record_failure(&mut self) {
        self.consecutive_failures += 1;
        self.failure_times.push(SystemTime::now());
    }

    pub fn reset_failures(&mut self) {
        self.consecutive_failures = 0;
        self.failure_times.clear();
    }

    pub fn set_last_error(&mut self, error: impl Into<String>) {
        self.last_error = Some(error.into());
    }

    pub fn clear_last_error(&mut self) {
        self.last_error = None;
    }

    pub fn set_core_version(&mut self, version: Option<String>) {
        self.core_version = version;
    }

    /// Failures that fall inside the policy's sliding window.
    /// Older entries are pruned as a side effect.
    pub fn failures_in_window(&mut self, policy: &RestartPolicy) -> u32 {
        let cutoff = SystemTime::now() - Duration::from_secs(policy.failure_window_sec);
        self.failure_times.retain(|&t| t >= cutoff);
        self.failure_times.len() as u32
    }

    /// True once the windowed failure count exhausts the budget
    pub fn restart_budget_exhausted(&mut self, policy: &RestartPolicy) -> bool {
        self.failures_in_window(policy) >= policy.max_failures
    }
}
