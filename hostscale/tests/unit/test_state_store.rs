//! State store tests

use chrono::{TimeZone, Utc};
use serde_json::json;
use tokio_test::{assert_err, assert_ok};

use hostscale::filesys::file::File;
use hostscale::models::deployment::{
    BackendHandle, BackendStatus, DeployParams, DeploymentDescriptor, Mode, ReplicaStatus,
};
use hostscale::storage::state::StateStore;

fn clustered(replicas: u32) -> DeploymentDescriptor {
    let params = DeployParams {
        replicas,
        port: 9090,
        image: "ghcr.io/acme/web:5".to_string(),
        env_file: None,
    };
    let handle = BackendHandle::Clustered {
        service_name: "web".to_string(),
        service_id: "k2x9".to_string(),
    };
    let started_at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
    DeploymentDescriptor::new(handle, &params, started_at).unwrap()
}

fn store(dir: &tempfile::TempDir) -> StateStore {
    StateStore::new(File::new(dir.path().join("state.json")))
}

#[tokio::test]
async fn test_load_without_file_is_none() {
    let dir = tempfile::tempdir().unwrap();
    assert_eq!(assert_ok!(store(&dir).load().await), None);
}

#[tokio::test]
async fn test_save_replaces_record() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(&dir);

    assert_ok!(store.save(&clustered(3)).await);
    assert_ok!(store.save(&clustered(5)).await);

    let loaded = assert_ok!(store.load().await).unwrap();
    assert_eq!(loaded, clustered(5));
    assert_eq!(loaded.mode(), Mode::Clustered);
}

#[tokio::test]
async fn test_state_file_shape() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(&dir);
    assert_ok!(store.save(&clustered(3)).await);

    let raw = std::fs::read_to_string(dir.path().join("state.json")).unwrap();
    let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(
        value,
        json!({
            "mode": "clustered",
            "service_name": "web",
            "service_id": "k2x9",
            "replicas": 3,
            "port": 9090,
            "image": "ghcr.io/acme/web:5",
            "env_file": null,
            "started_at": "2026-03-01T12:00:00Z"
        })
    );
}

#[tokio::test]
async fn test_corrupt_file_is_storage_error() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("state.json"), "{ not json").unwrap();

    let err = assert_err!(store(&dir).load().await);
    assert_eq!(err.kind(), "storage");
}

#[tokio::test]
async fn test_direct_record_with_many_replicas_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let record = json!({
        "mode": "direct",
        "container_id": "abc",
        "replicas": 2,
        "port": 80,
        "image": "nginx",
        "started_at": "2026-03-01T12:00:00Z"
    });
    std::fs::write(dir.path().join("state.json"), record.to_string()).unwrap();

    let err = assert_err!(store(&dir).load().await);
    assert_eq!(err.kind(), "storage");
}

#[tokio::test]
async fn test_delete_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(&dir);

    assert_ok!(store.delete().await);
    assert_ok!(store.save(&clustered(2)).await);
    assert_ok!(store.delete().await);
    assert_ok!(store.delete().await);
    assert_eq!(assert_ok!(store.load().await), None);
}

#[tokio::test]
async fn test_reconcile_only_removes_on_clean_absence() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(&dir);
    assert_ok!(store.save(&clustered(2)).await);

    let live = BackendStatus::new(vec![ReplicaStatus {
        id: "t1".to_string(),
        running: true,
        healthy: false,
    }]);
    assert!(!assert_ok!(store.reconcile(&live).await));

    let degraded = BackendStatus::degraded("Cannot connect to the Docker daemon");
    assert!(!assert_ok!(store.reconcile(&degraded).await));
    assert!(assert_ok!(store.load().await).is_some());

    assert!(assert_ok!(store.reconcile(&BackendStatus::new(Vec::new())).await));
    assert_eq!(assert_ok!(store.load().await), None);
}
