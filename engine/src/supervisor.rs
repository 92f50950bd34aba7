//! Backend supervision
//! Owns the backend registry, serializes lifecycle operations per
//! backend, and drives crash recovery from exit events

use crate::config_store::ConfigStore;
use crate::domain::{
    Backend, BackendDescriptor, BackendKind, BackendState, DomainError, RestartPolicy, Result,
};
use crate::logs::{LogBroadcaster, LogSubscription};
use crate::runner::{
    forward_exit, probe_core_version, BackendExitEvent, ProcessRunner, StopOutcome,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Point-in-time health view of one backend
#[derive(Debug, Clone, Serialize)]
pub struct BackendHealth {
    pub id: String,
    pub kind: BackendKind,
    pub state: BackendState,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub uptime: Option<Duration>,
    pub config_revision: Option<u64>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub core_version: Option<String>,
}

/// Agent-level status report
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub agent_version: String,
    pub uptime: Duration,
    pub backends: Vec<BackendHealth>,
}

struct Unit {
    backend: Backend,
    exited: Option<tokio::sync::watch::Receiver<Option<i32>>>,
}

/// One registered backend: its config store plus mutable runtime
/// state behind a per-backend lock
struct ManagedBackend {
    store: ConfigStore,
    unit: Mutex<Unit>,
    // Last-known health, refreshed after every state change. Status
    // queries fall back to it when the unit lock is busy in a slow
    // subprocess operation.
    last_health: std::sync::RwLock<BackendHealth>,
}

impl ManagedBackend {
    fn new(descriptor: BackendDescriptor) -> Self {
        let store = ConfigStore::new(descriptor.clone());
        let backend = Backend::new(descriptor);
        let last_health = std::sync::RwLock::new(Self::compute_health(&store, &backend));
        Self {
            store,
            unit: Mutex::new(Unit {
                backend,
                exited: None,
            }),
            last_health,
        }
    }

    fn compute_health(store: &ConfigStore, backend: &Backend) -> BackendHealth {
        BackendHealth {
            id: backend.id().to_string(),
            kind: backend.descriptor().kind,
            state: backend.state(),
            pid: backend.pid(),
            exit_code: backend.last_exit_code(),
            uptime: backend.uptime(),
            config_revision: store.current().map(|s| s.revision),
            consecutive_failures: backend.consecutive_failures(),
            last_error: backend.last_error().map(str::to_string),
            core_version: backend.core_version().map(str::to_string),
        }
    }

    fn refresh_health(&self, unit: &Unit) -> BackendHealth {
        let health = Self::compute_health(&self.store, &unit.backend);
        *self.last_health.write().unwrap() = health.clone();
        health
    }

    fn cached_health(&self) -> BackendHealth {
        self.last_health.read().unwrap().clone()
    }
}

/// Supervises the set of backends registered at startup
///
/// The registry is immutable after construction. All operations on one
/// backend serialize through its unit lock, so callers observe each
/// operation's effects atomically.
pub struct Supervisor {
    backends: HashMap<String, ManagedBackend>,
    runner: ProcessRunner,
    policy: RestartPolicy,
    logs: Arc<LogBroadcaster>,
    exit_tx: mpsc::UnboundedSender<BackendExitEvent>,
    started_at: Instant,
}

impl Supervisor {
    /// Build the registry from `descriptors`. The returned receiver
    /// carries process exit events and must be handed to [`run`].
    ///
    /// [`run`]: Supervisor::run
    pub fn new(
        descriptors: Vec<BackendDescriptor>,
        policy: RestartPolicy,
        runner: ProcessRunner,
        logs: Arc<LogBroadcaster>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<BackendExitEvent>) {
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();

        let backends = descriptors
            .into_iter()
            .map(|descriptor| (descriptor.id.clone(), ManagedBackend::new(descriptor)))
            .collect();

        let supervisor = Arc::new(Self {
            backends,
            runner,
            policy,
            logs,
            exit_tx,
            started_at: Instant::now(),
        });
        (supervisor, exit_rx)
    }

    fn managed(&self, id: &str) -> Result<&ManagedBackend> {
        self.backends
            .get(id)
            .ok_or_else(|| DomainError::BackendNotFound(id.to_string()))
    }

    // ===== Lifecycle operations =====

    /// Start a backend against its active configuration. Resets the
    /// failure budget: an explicit start is a fresh beginning.
    pub async fn start(&self, id: &str) -> Result<BackendHealth> {
        let managed = self.managed(id)?;
        let mut unit = managed.unit.lock().await;

        if let Some(pid) = unit.backend.pid() {
            if unit.backend.state().is_active() {
                return Err(DomainError::AlreadyRunning {
                    id: id.to_string(),
                    pid,
                });
            }
        }
        if managed.store.current().is_none() {
            return Err(DomainError::InvalidConfig(format!(
                "backend '{id}' has no active configuration"
            )));
        }

        unit.backend.reset_failures();
        let launched = self.launch(&mut unit).await;
        let health = managed.refresh_health(&unit);
        launched?;
        Ok(health)
    }

    /// Stop a backend. Safe to call in any state; stopping something
    /// that holds no process reports `AlreadyStopped`.
    pub async fn stop(&self, id: &str) -> Result<StopOutcome> {
        let managed = self.managed(id)?;
        let mut unit = managed.unit.lock().await;

        match unit.backend.state() {
            BackendState::Stopped => Ok(StopOutcome::AlreadyStopped),
            BackendState::Crashed(_) | BackendState::Degraded => {
                unit.backend.mark_stopped()?;
                managed.refresh_health(&unit);
                Ok(StopOutcome::AlreadyStopped)
            }
            _ => {
                let (pid, exited) = match (unit.backend.pid(), unit.exited.clone()) {
                    (Some(pid), Some(exited)) => (pid, exited),
                    _ => {
                        unit.backend.mark_stopped()?;
                        managed.refresh_health(&unit);
                        return Ok(StopOutcome::AlreadyStopped);
                    }
                };

                unit.backend.mark_stopping()?;
                let outcome = self.runner.stop(id, pid, exited).await?;
                unit.backend.mark_stopped()?;
                unit.exited = None;
                managed.refresh_health(&unit);
                info!(backend = id, outcome = ?outcome, "backend stopped");
                Ok(outcome)
            }
        }
    }

    /// Stop then start. Also a fresh beginning for the failure budget.
    pub async fn restart(&self, id: &str) -> Result<BackendHealth> {
        self.stop(id).await?;
        self.start(id).await
    }

    /// Validate and activate a new configuration. A Degraded backend
    /// drops back to Stopped with a clean failure budget; starting it
    /// again stays an explicit operator action.
    pub async fn configure(
        &self,
        id: &str,
        schema_version: &str,
        blob: &[u8],
    ) -> Result<(u64, BackendState)> {
        let managed = self.managed(id)?;
        let revision = managed.store.propose(schema_version, blob).await?;

        let mut unit = managed.unit.lock().await;
        let applied = self.apply_active_config(id, &mut unit).await;
        managed.refresh_health(&unit);
        applied?;
        Ok((revision, unit.backend.state()))
    }

    /// Re-activate the previous configuration snapshot
    pub async fn rollback(&self, id: &str) -> Result<(u64, BackendState)> {
        let managed = self.managed(id)?;
        let revision = managed.store.rollback().await?;

        let mut unit = managed.unit.lock().await;
        let applied = self.apply_active_config(id, &mut unit).await;
        managed.refresh_health(&unit);
        applied?;
        Ok((revision, unit.backend.state()))
    }

    /// Hot-apply via SIGHUP when the engine supports it, otherwise
    /// restart a running backend onto the new file
    async fn apply_active_config(&self, id: &str, unit: &mut Unit) -> Result<()> {
        match unit.backend.state() {
            BackendState::Degraded => {
                unit.backend.mark_stopped()?;
                unit.backend.reset_failures();
                unit.backend.clear_last_error();
                info!(
                    backend = id,
                    "new configuration cleared degraded latch, backend left stopped"
                );
            }
            BackendState::Running if unit.backend.descriptor().supports_reload => {
                if let Some(pid) = unit.backend.pid() {
                    self.runner.reload(id, pid)?;
                }
            }
            BackendState::Running => {
                debug!(
                    backend = id,
                    "engine does not reload in place, restarting onto the new config"
                );
                if let (Some(pid), Some(exited)) = (unit.backend.pid(), unit.exited.clone()) {
                    unit.backend.mark_stopping()?;
                    self.runner.stop(id, pid, exited).await?;
                    unit.backend.mark_stopped()?;
                    unit.exited = None;
                    self.launch(unit).await?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    // ===== Status and logs =====

    /// Never waits on a unit lock: a backend mid-operation reports its
    /// last-known health instead of stalling the caller
    pub async fn status(&self) -> NodeStatus {
        let mut backends = Vec::with_capacity(self.backends.len());
        for managed in self.backends.values() {
            let health = match managed.unit.try_lock() {
                Ok(unit) => managed.refresh_health(&unit),
                Err(_) => managed.cached_health(),
            };
            backends.push(health);
        }
        backends.sort_by(|a, b| a.id.cmp(&b.id));

        NodeStatus {
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
            uptime: self.started_at.elapsed(),
            backends,
        }
    }

    pub async fn status_of(&self, id: &str) -> Result<BackendHealth> {
        let managed = self.managed(id)?;
        match managed.unit.try_lock() {
            Ok(unit) => Ok(managed.refresh_health(&unit)),
            Err(_) => Ok(managed.cached_health()),
        }
    }

    /// Log stream for one backend: ring backlog first, then live lines
    pub fn subscribe_logs(&self, id: &str) -> Result<LogSubscription> {
        self.managed(id)?;
        Ok(self.logs.subscribe(id))
    }

    // ===== Crash recovery =====

    /// Consume exit events until cancellation, then stop every active
    /// backend
    pub async fn run(
        self: Arc<Self>,
        mut exit_rx: mpsc::UnboundedReceiver<BackendExitEvent>,
        cancel: CancellationToken,
    ) {
        info!(backends = self.backends.len(), "supervisor loop started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = exit_rx.recv() => match event {
                    Some(event) => self.handle_exit(event, &cancel).await,
                    None => break,
                },
            }
        }
        self.shutdown_all().await;
        info!("supervisor loop stopped");
    }

    async fn handle_exit(self: &Arc<Self>, event: BackendExitEvent, cancel: &CancellationToken) {
        let Ok(managed) = self.managed(&event.backend_id) else {
            return;
        };
        let mut unit = managed.unit.lock().await;

        // Events from a previous incarnation of the backend arrive
        // after a stop or restart already ran; the pid tells them apart
        if unit.backend.pid() != Some(event.pid) {
            debug!(
                backend = %event.backend_id,
                pid = event.pid,
                "ignoring exit event for a stale pid"
            );
            return;
        }
        if unit.backend.state() != BackendState::Running {
            return;
        }

        warn!(
            backend = %event.backend_id,
            pid = event.pid,
            exit_code = event.exit_code,
            "backend exited unexpectedly"
        );
        if let Err(e) = unit.backend.mark_crashed(event.exit_code) {
            warn!(backend = %event.backend_id, error = %e, "crash transition rejected");
            return;
        }
        unit.exited = None;
        unit.backend.record_failure();
        unit.backend
            .set_last_error(format!("exited unexpectedly with code {}", event.exit_code));

        if unit.backend.restart_budget_exhausted(&self.policy) {
            let _ = unit.backend.mark_degraded();
            warn!(
                backend = %event.backend_id,
                failures = unit.backend.consecutive_failures(),
                "restart budget exhausted, backend degraded until operator action"
            );
        } else {
            let delay = self.policy.restart_delay(unit.backend.consecutive_failures());
            self.schedule_restart(event.backend_id.clone(), delay, cancel.clone());
        }
        managed.refresh_health(&unit);
    }

    fn schedule_restart(self: &Arc<Self>, id: String, delay: Duration, cancel: CancellationToken) {
        info!(backend = %id, delay_ms = delay.as_millis() as u64, "restart scheduled");
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            if delay > Duration::ZERO {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            // Shutdown may have won the race; the backend is either
            // already stopped or about to be
            if cancel.is_cancelled() {
                debug!(backend = %id, "scheduled restart abandoned by shutdown");
                return;
            }
            supervisor.attempt_restart(&id, &cancel).await;
        });
    }

    /// One automatic restart attempt. The backend stays Crashed while
    /// the attempt is in flight, so an abandoned attempt needs no
    /// cleanup transition.
    async fn attempt_restart(self: &Arc<Self>, id: &str, cancel: &CancellationToken) {
        let Ok(managed) = self.managed(id) else { return };
        let mut unit = managed.unit.lock().await;

        if !matches!(unit.backend.state(), BackendState::Crashed(_)) {
            debug!(
                backend = id,
                state = %unit.backend.state(),
                "restart abandoned, operator intervened"
            );
            return;
        }

        info!(
            backend = id,
            attempt = unit.backend.consecutive_failures(),
            "attempting automatic restart"
        );
        match self.launch(&mut unit).await {
            Ok(()) => {}
            Err(e) => {
                unit.backend.record_failure();
                unit.backend.set_last_error(e.to_string());
                if unit.backend.restart_budget_exhausted(&self.policy) {
                    let _ = unit.backend.mark_degraded();
                    warn!(
                        backend = id,
                        error = %e,
                        "restart failed and budget exhausted, backend degraded"
                    );
                } else {
                    let delay = self.policy.restart_delay(unit.backend.consecutive_failures());
                    warn!(backend = id, error = %e, "restart attempt failed");
                    self.schedule_restart(id.to_string(), delay, cancel.clone());
                }
            }
        }
        managed.refresh_health(&unit);
    }

    /// Spawn the backend's process and move it to Running. On failure
    /// the state is left where the caller can retry or report.
    async fn launch(&self, unit: &mut Unit) -> Result<()> {
        let id = unit.backend.id().to_string();
        let executable = unit.backend.descriptor().executable.clone();
        let previous_state = unit.backend.state();

        match self.runner.start(unit.backend.descriptor()).await {
            Ok(process) => {
                unit.backend.mark_starting()?;
                unit.backend.mark_running(process.pid)?;
                unit.backend.clear_last_error();
                if unit.backend.core_version().is_none() {
                    unit.backend
                        .set_core_version(probe_core_version(&executable).await);
                }
                forward_exit(
                    id.clone(),
                    process.pid,
                    process.exited.clone(),
                    self.exit_tx.clone(),
                );
                unit.exited = Some(process.exited);
                info!(backend = %id, pid = process.pid, "backend running");
                Ok(())
            }
            Err(e) => {
                unit.backend.set_last_error(e.to_string());
                // A failed explicit start lands in Stopped; a failed
                // automatic restart stays Crashed for the retry loop
                if previous_state == BackendState::Stopped
                    || previous_state == BackendState::Degraded
                {
                    unit.backend.mark_starting()?;
                    unit.backend.mark_stopped()?;
                }
                Err(e)
            }
        }
    }

    async fn shutdown_all(&self) {
        for (id, managed) in &self.backends {
            let mut unit = managed.unit.lock().await;
            if !unit.backend.state().is_active() {
                continue;
            }
            let (Some(pid), Some(exited)) = (unit.backend.pid(), unit.exited.clone()) else {
                continue;
            };
            if unit.backend.mark_stopping().is_err() {
                continue;
            }
            match self.runner.stop(id, pid, exited).await {
                Ok(outcome) => {
                    let _ = unit.backend.mark_stopped();
                    info!(backend = %id, outcome = ?outcome, "backend stopped for shutdown");
                }
                Err(e) => {
                    warn!(backend = %id, error = %e, "shutdown stop failed");
                }
            }
            managed.refresh_health(&unit);
        }
    }
}
