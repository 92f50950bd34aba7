//! End-to-end configuration flow: revisions, on-disk files, rollback
//! and validation through the supervisor

use na_e2e_tests::{build_supervisor, configure, quick_restart_policy, shell_backend, BACKEND_ID};
use na_engine::domain::DomainError;
use serde_json::Value;

#[tokio::test]
async fn test_revisions_are_monotonic_and_files_atomic() {
    let dir = tempfile::tempdir().unwrap();
    let (supervisor, _exit_rx, _logs) = build_supervisor(
        vec![shell_backend(dir.path(), BACKEND_ID, "sleep 30")],
        quick_restart_policy(5),
    );

    assert_eq!(configure(&supervisor, BACKEND_ID).await, 1);

    let blob = serde_json::json!({ "inbounds": [{ "tag": "vmess-in" }] }).to_string();
    let (revision, _) = supervisor
        .configure(BACKEND_ID, "xray.v1", blob.as_bytes())
        .await
        .unwrap();
    assert_eq!(revision, 2);

    let config_file = dir.path().join("core-a.json");
    let on_disk: Value = serde_json::from_slice(&std::fs::read(&config_file).unwrap()).unwrap();
    assert_eq!(on_disk["inbounds"][0]["tag"], "vmess-in");
    // No temp file left behind by the atomic swap
    assert!(!dir.path().join(".core-a.json.tmp").exists());
}

#[tokio::test]
async fn test_rollback_restores_previous_blob_under_new_revision() {
    let dir = tempfile::tempdir().unwrap();
    let (supervisor, _exit_rx, _logs) = build_supervisor(
        vec![shell_backend(dir.path(), BACKEND_ID, "sleep 30")],
        quick_restart_policy(5),
    );

    let first = serde_json::json!({ "inbounds": [{ "tag": "first" }] }).to_string();
    let second = serde_json::json!({ "inbounds": [{ "tag": "second" }] }).to_string();
    supervisor
        .configure(BACKEND_ID, "xray.v1", first.as_bytes())
        .await
        .unwrap();
    supervisor
        .configure(BACKEND_ID, "xray.v1", second.as_bytes())
        .await
        .unwrap();

    let (revision, _) = supervisor.rollback(BACKEND_ID).await.unwrap();
    assert_eq!(revision, 3);

    let config_file = dir.path().join("core-a.json");
    let on_disk: Value = serde_json::from_slice(&std::fs::read(&config_file).unwrap()).unwrap();
    assert_eq!(on_disk["inbounds"][0]["tag"], "first");

    // Rolling back again toggles to the other snapshot, never further
    let (revision, _) = supervisor.rollback(BACKEND_ID).await.unwrap();
    assert_eq!(revision, 4);
    let on_disk: Value = serde_json::from_slice(&std::fs::read(&config_file).unwrap()).unwrap();
    assert_eq!(on_disk["inbounds"][0]["tag"], "second");
}

#[tokio::test]
async fn test_rejected_config_leaves_file_and_revision_alone() {
    let dir = tempfile::tempdir().unwrap();
    let (supervisor, _exit_rx, _logs) = build_supervisor(
        vec![shell_backend(dir.path(), BACKEND_ID, "sleep 30")],
        quick_restart_policy(5),
    );
    configure(&supervisor, BACKEND_ID).await;
    let before = std::fs::read(dir.path().join("core-a.json")).unwrap();

    let err = supervisor
        .configure(BACKEND_ID, "xray.v1", b"{broken")
        .await
        .unwrap_err();
    assert!(matches!(err, DomainError::InvalidConfig(_)));

    let err = supervisor
        .configure(BACKEND_ID, "xray.v1", br#"{"inbounds": 42}"#)
        .await
        .unwrap_err();
    assert!(matches!(err, DomainError::InvalidConfig(_)));

    let err = supervisor
        .configure(BACKEND_ID, "wrong.v9", br#"{}"#)
        .await
        .unwrap_err();
    assert!(matches!(err, DomainError::InvalidConfig(_)));

    let health = supervisor.status_of(BACKEND_ID).await.unwrap();
    assert_eq!(health.config_revision, Some(1));
    assert_eq!(
        std::fs::read(dir.path().join("core-a.json")).unwrap(),
        before
    );
}

#[tokio::test]
async fn test_inbound_filter_prunes_pushed_config() {
    let dir = tempfile::tempdir().unwrap();
    let mut descriptor = shell_backend(dir.path(), BACKEND_ID, "sleep 30");
    descriptor.inbound_filter = vec!["vless-in".to_string()];
    let (supervisor, _exit_rx, _logs) =
        build_supervisor(vec![descriptor], quick_restart_policy(5));

    let blob = serde_json::json!({
        "log": { "level": "silent" },
        "inbounds": [{ "tag": "vless-in" }, { "tag": "vmess-in" }]
    })
    .to_string();
    supervisor
        .configure(BACKEND_ID, "xray.v1", blob.as_bytes())
        .await
        .unwrap();

    let on_disk: Value =
        serde_json::from_slice(&std::fs::read(dir.path().join("core-a.json")).unwrap()).unwrap();
    let tags: Vec<&str> = on_disk["inbounds"]
        .as_array()
        .unwrap()
        .iter()
        .map(|i| i["tag"].as_str().unwrap())
        .collect();
    assert_eq!(tags, vec!["vless-in"]);
    // A silent engine would hide crashes from the log stream
    assert_eq!(on_disk["log"]["level"], "warn");
}
