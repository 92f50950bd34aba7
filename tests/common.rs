//! Shared helpers for end-to-end supervisor tests
//!
//! These tests run real child processes through /bin/sh. A backend
//! descriptor's launch contract appends the config path after the
//! engine arguments, so `args = ["-c", "<script>"]` makes the config
//! path land in `$0`, which the shell ignores.

use na_engine::domain::{BackendDescriptor, BackendKind, RestartPolicy};
use na_engine::logs::LogBroadcaster;
use na_engine::runner::{BackendExitEvent, ProcessRunner, TokioProcessExecutor};
use na_engine::supervisor::{BackendHealth, Supervisor};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

pub const BACKEND_ID: &str = "core-a";

/// Grace window short enough to keep tests quick, long enough that a
/// `sleep`-based script counts as started
pub const TEST_GRACE_MS: u64 = 100;

pub fn shell_backend(dir: &Path, id: &str, script: &str) -> BackendDescriptor {
    BackendDescriptor {
        id: id.to_string(),
        kind: BackendKind::Xray,
        executable: PathBuf::from("/bin/sh"),
        config_path: dir.join(format!("{id}.json")),
        working_dir: None,
        args: vec!["-c".to_string(), script.to_string()],
        schema_version: "xray.v1".to_string(),
        supports_reload: false,
        inbound_filter: vec![],
    }
}

pub fn quick_restart_policy(max_failures: u32) -> RestartPolicy {
    RestartPolicy {
        max_immediate_restarts: 10,
        backoff_base_sec: 1,
        backoff_max_sec: 5,
        max_failures,
        failure_window_sec: 300,
    }
}

pub fn build_supervisor(
    descriptors: Vec<BackendDescriptor>,
    policy: RestartPolicy,
) -> (
    Arc<Supervisor>,
    mpsc::UnboundedReceiver<BackendExitEvent>,
    Arc<LogBroadcaster>,
) {
    let logs = Arc::new(LogBroadcaster::default());
    let runner = ProcessRunner::new(
        Arc::new(TokioProcessExecutor::new(logs.clone())),
        Duration::from_millis(TEST_GRACE_MS),
        Duration::from_secs(5),
    );
    let (supervisor, exit_rx) = Supervisor::new(descriptors, policy, runner, logs.clone());
    (supervisor, exit_rx, logs)
}

/// Push a minimal valid configuration so the backend can start
pub async fn configure(supervisor: &Supervisor, id: &str) -> u64 {
    let blob = serde_json::json!({ "inbounds": [] }).to_string();
    let (revision, _) = supervisor
        .configure(id, "xray.v1", blob.as_bytes())
        .await
        .expect("configure failed");
    revision
}

/// Poll the backend's health until `pred` holds or 10s elapse
pub async fn wait_for<F>(supervisor: &Supervisor, id: &str, pred: F) -> BackendHealth
where
    F: Fn(&BackendHealth) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let health = supervisor.status_of(id).await.expect("status failed");
        if pred(&health) {
            return health;
        }
        if Instant::now() > deadline {
            panic!(
                "timed out waiting for backend '{id}', state {} pid {:?}",
                health.state, health.pid
            );
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Kill a real process from outside the supervisor, like an OOM kill
pub fn kill_process(pid: u32) {
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGKILL);
    }
}
