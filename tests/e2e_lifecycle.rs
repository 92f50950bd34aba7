//! End-to-end lifecycle: configure, start, stop, restart against real
//! child processes

use na_e2e_tests::{build_supervisor, configure, quick_restart_policy, shell_backend, BACKEND_ID};
use na_engine::domain::{BackendState, DomainError};
use na_engine::runner::StopOutcome;

#[tokio::test]
async fn test_configure_start_stop() {
    let dir = tempfile::tempdir().unwrap();
    let (supervisor, _exit_rx, _logs) = build_supervisor(
        vec![shell_backend(dir.path(), BACKEND_ID, "sleep 30")],
        quick_restart_policy(5),
    );

    let revision = configure(&supervisor, BACKEND_ID).await;
    assert_eq!(revision, 1);

    // The config file the process would read exists before launch
    assert!(dir.path().join("core-a.json").exists());

    let health = supervisor.start(BACKEND_ID).await.unwrap();
    assert_eq!(health.state, BackendState::Running);
    let pid = health.pid.expect("running backend has a pid");
    assert!(pid > 0);

    let outcome = supervisor.stop(BACKEND_ID).await.unwrap();
    assert_eq!(outcome, StopOutcome::Graceful);

    let health = supervisor.status_of(BACKEND_ID).await.unwrap();
    assert_eq!(health.state, BackendState::Stopped);
    assert_eq!(health.pid, None);
}

#[tokio::test]
async fn test_start_without_config_fails() {
    let dir = tempfile::tempdir().unwrap();
    let (supervisor, _exit_rx, _logs) = build_supervisor(
        vec![shell_backend(dir.path(), BACKEND_ID, "sleep 30")],
        quick_restart_policy(5),
    );

    let err = supervisor.start(BACKEND_ID).await.unwrap_err();
    assert!(matches!(err, DomainError::InvalidConfig(_)));
}

#[tokio::test]
async fn test_double_start_reports_running_pid() {
    let dir = tempfile::tempdir().unwrap();
    let (supervisor, _exit_rx, _logs) = build_supervisor(
        vec![shell_backend(dir.path(), BACKEND_ID, "sleep 30")],
        quick_restart_policy(5),
    );
    configure(&supervisor, BACKEND_ID).await;

    let health = supervisor.start(BACKEND_ID).await.unwrap();
    match supervisor.start(BACKEND_ID).await.unwrap_err() {
        DomainError::AlreadyRunning { id, pid } => {
            assert_eq!(id, BACKEND_ID);
            assert_eq!(Some(pid), health.pid);
        }
        other => panic!("unexpected error: {other}"),
    }

    supervisor.stop(BACKEND_ID).await.unwrap();
}

#[tokio::test]
async fn test_stop_when_never_started() {
    let dir = tempfile::tempdir().unwrap();
    let (supervisor, _exit_rx, _logs) = build_supervisor(
        vec![shell_backend(dir.path(), BACKEND_ID, "sleep 30")],
        quick_restart_policy(5),
    );

    assert_eq!(
        supervisor.stop(BACKEND_ID).await.unwrap(),
        StopOutcome::AlreadyStopped
    );
}

#[tokio::test]
async fn test_restart_replaces_process() {
    let dir = tempfile::tempdir().unwrap();
    let (supervisor, _exit_rx, _logs) = build_supervisor(
        vec![shell_backend(dir.path(), BACKEND_ID, "sleep 30")],
        quick_restart_policy(5),
    );
    configure(&supervisor, BACKEND_ID).await;

    let before = supervisor.start(BACKEND_ID).await.unwrap();
    let after = supervisor.restart(BACKEND_ID).await.unwrap();
    assert_eq!(after.state, BackendState::Running);
    assert_ne!(after.pid, before.pid);

    supervisor.stop(BACKEND_ID).await.unwrap();
}

#[tokio::test]
async fn test_launch_failure_reports_and_leaves_stopped() {
    let dir = tempfile::tempdir().unwrap();
    // Dies immediately, well inside the grace window
    let (supervisor, _exit_rx, _logs) = build_supervisor(
        vec![shell_backend(dir.path(), BACKEND_ID, "exit 5")],
        quick_restart_policy(5),
    );
    configure(&supervisor, BACKEND_ID).await;

    let err = supervisor.start(BACKEND_ID).await.unwrap_err();
    assert!(matches!(err, DomainError::Launch { .. }));

    let health = supervisor.status_of(BACKEND_ID).await.unwrap();
    assert_eq!(health.state, BackendState::Stopped);
    assert!(health.last_error.unwrap().contains("code 5"));
}

#[test]
fn test_io_errors_carry_call_site_context() {
    // Callers outside the engine crate wrap their own io failures too
    let err = DomainError::io(
        "reading agent config",
        std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
    );
    assert!(err.to_string().contains("reading agent config"));
    assert!(matches!(err, DomainError::Io(_)));
}

#[tokio::test]
async fn test_two_backends_are_independent() {
    let dir = tempfile::tempdir().unwrap();
    let (supervisor, _exit_rx, _logs) = build_supervisor(
        vec![
            shell_backend(dir.path(), "core-a", "sleep 30"),
            shell_backend(dir.path(), "core-b", "sleep 30"),
        ],
        quick_restart_policy(5),
    );
    configure(&supervisor, "core-a").await;
    configure(&supervisor, "core-b").await;

    supervisor.start("core-a").await.unwrap();
    let status = supervisor.status().await;
    assert_eq!(status.backends.len(), 2);
    assert_eq!(status.backends[0].state, BackendState::Running);
    assert_eq!(status.backends[1].state, BackendState::Stopped);

    supervisor.start("core-b").await.unwrap();
    supervisor.stop("core-a").await.unwrap();
    let status = supervisor.status().await;
    assert_eq!(status.backends[0].state, BackendState::Stopped);
    assert_eq!(status.backends[1].state, BackendState::Running);

    supervisor.stop("core-b").await.unwrap();
}
