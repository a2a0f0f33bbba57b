//! Engine tests against in-memory backends

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tempfile::TempDir;
use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;
use url::Url;

use hostscale::app::engine::{Orchestrator, StartReport, StartRequest};
use hostscale::app::options::EngineOptions;
use hostscale::deploy::preflight::HostProbe;
use hostscale::deploy::runner::LogStream;
use hostscale::deploy::{Backend, BackendProvider};
use hostscale::errors::OrchestratorError;
use hostscale::health::probe::HealthProbe;
use hostscale::models::deployment::{
    BackendHandle, BackendStatus, DeployParams, Mode, ModeRationale, ModeRequest, ReplicaStatus,
    Termination,
};
use hostscale::storage::layout::StorageLayout;

struct FakeBackend {
    mode: Mode,
    live: Mutex<Option<u32>>,
    degraded: Mutex<Option<String>>,
    fail_terminate: AtomicBool,
    fail_cleanup: AtomicBool,
    deploys: AtomicUsize,
    rescales: AtomicUsize,
    terminations: AtomicUsize,
    cleanups: AtomicUsize,
}

impl FakeBackend {
    fn new(mode: Mode) -> Arc<Self> {
        Arc::new(Self {
            mode,
            live: Mutex::new(None),
            degraded: Mutex::new(None),
            fail_terminate: AtomicBool::new(false),
            fail_cleanup: AtomicBool::new(false),
            deploys: AtomicUsize::new(0),
            rescales: AtomicUsize::new(0),
            terminations: AtomicUsize::new(0),
            cleanups: AtomicUsize::new(0),
        })
    }

    fn handle(&self) -> BackendHandle {
        match self.mode {
            Mode::Direct => BackendHandle::Direct {
                container_id: "c0ffee".to_string(),
            },
            Mode::Clustered => BackendHandle::Clustered {
                service_name: "hostscale-app".to_string(),
                service_id: "svc1".to_string(),
            },
            Mode::Composed => BackendHandle::Composed {
                compose_project: "hostscale-app".to_string(),
            },
        }
    }

    fn live_replicas(&self) -> Option<u32> {
        *self.live.lock().unwrap()
    }

    /// Resources disappear behind our back
    fn vanish(&self) {
        *self.live.lock().unwrap() = None;
    }
}

#[async_trait]
impl Backend for FakeBackend {
    fn mode(&self) -> Mode {
        self.mode
    }

    async fn deploy(
        &self,
        params: &DeployParams,
        _cancel: &CancellationToken,
    ) -> Result<BackendHandle, OrchestratorError> {
        self.deploys.fetch_add(1, Ordering::SeqCst);
        *self.live.lock().unwrap() = Some(params.replicas);
        Ok(self.handle())
    }

    async fn rescale(
        &self,
        handle: &BackendHandle,
        params: &DeployParams,
        _cancel: &CancellationToken,
    ) -> Result<BackendHandle, OrchestratorError> {
        if self.mode == Mode::Direct {
            return Err(OrchestratorError::UnsupportedOperation("direct".to_string()));
        }
        self.rescales.fetch_add(1, Ordering::SeqCst);
        *self.live.lock().unwrap() = Some(params.replicas);
        Ok(handle.clone())
    }

    async fn terminate(
        &self,
        _handle: &BackendHandle,
        _purge_data: bool,
    ) -> Result<Termination, OrchestratorError> {
        self.terminations.fetch_add(1, Ordering::SeqCst);
        if self.fail_terminate.load(Ordering::SeqCst) {
            return Err(OrchestratorError::Terminate("daemon unreachable".to_string()));
        }
        match self.live.lock().unwrap().take() {
            Some(_) => Ok(Termination::Removed),
            None => Ok(Termination::AlreadyAbsent),
        }
    }

    async fn inspect(&self, _handle: &BackendHandle) -> BackendStatus {
        if let Some(reason) = self.degraded.lock().unwrap().clone() {
            return BackendStatus::degraded(reason);
        }
        let replicas = self.live_replicas().unwrap_or(0);
        BackendStatus::new(
            (0..replicas)
                .map(|i| ReplicaStatus {
                    id: format!("r{}", i),
                    running: true,
                    healthy: true,
                })
                .collect(),
        )
    }

    async fn fetch_logs(
        &self,
        _handle: &BackendHandle,
        tail: usize,
        follow: bool,
    ) -> Result<LogStream, OrchestratorError> {
        let lines: Vec<Result<String, OrchestratorError>> =
            (0..tail).map(|i| Ok(format!("line {}", i))).collect();
        let head = stream::iter(lines);
        if follow {
            Ok(Box::pin(head.chain(stream::pending())))
        } else {
            Ok(Box::pin(head))
        }
    }

    async fn cleanup_artifacts(&self) -> Result<(), OrchestratorError> {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        if self.fail_cleanup.load(Ordering::SeqCst) {
            return Err(OrchestratorError::IoError(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "stack file is read-only",
            )));
        }
        Ok(())
    }
}

struct FakeBackends {
    direct: Arc<FakeBackend>,
    clustered: Arc<FakeBackend>,
    composed: Arc<FakeBackend>,
}

impl BackendProvider for FakeBackends {
    fn backend(&self, mode: Mode) -> Arc<dyn Backend> {
        match mode {
            Mode::Direct => self.direct.clone(),
            Mode::Clustered => self.clustered.clone(),
            Mode::Composed => self.composed.clone(),
        }
    }
}

struct FakeHost {
    cluster: AtomicBool,
}

#[async_trait]
impl HostProbe for FakeHost {
    async fn check_runtime(&self, _mode: Mode) -> Result<(), String> {
        Ok(())
    }
    async fn cluster_available(&self) -> bool {
        self.cluster.load(Ordering::SeqCst)
    }
    async fn port_in_use(&self, _port: u16) -> bool {
        false
    }
    async fn image_resolvable(&self, _image: &str) -> bool {
        true
    }
}

struct FakeHealth {
    healthy: AtomicBool,
    probes: Mutex<Vec<String>>,
}

#[async_trait]
impl HealthProbe for FakeHealth {
    async fn wait_healthy(
        &self,
        endpoint: &Url,
        _timeout: Duration,
        _cancel: &CancellationToken,
    ) -> bool {
        self.probes.lock().unwrap().push(endpoint.to_string());
        self.healthy.load(Ordering::SeqCst)
    }
}

struct Harness {
    _dir: TempDir,
    engine: Orchestrator,
    backends: Arc<FakeBackends>,
    host: Arc<FakeHost>,
    health: Arc<FakeHealth>,
}

impl Harness {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let options = EngineOptions {
            layout: StorageLayout::new(dir.path()),
            health_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let backends = Arc::new(FakeBackends {
            direct: FakeBackend::new(Mode::Direct),
            clustered: FakeBackend::new(Mode::Clustered),
            composed: FakeBackend::new(Mode::Composed),
        });
        let host = Arc::new(FakeHost {
            cluster: AtomicBool::new(false),
        });
        let health = Arc::new(FakeHealth {
            healthy: AtomicBool::new(true),
            probes: Mutex::new(Vec::new()),
        });
        let engine = Orchestrator::new(options, backends.clone(), host.clone(), health.clone());
        Self {
            _dir: dir,
            engine,
            backends,
            host,
            health,
        }
    }

    fn with_cluster(self) -> Self {
        self.host.cluster.store(true, Ordering::SeqCst);
        self
    }

    async fn start(
        &self,
        replicas: u32,
        mode: ModeRequest,
    ) -> Result<StartReport, OrchestratorError> {
        let request = StartRequest {
            replicas,
            mode,
            port: 8080,
            image: "acme/api:1".to_string(),
            env_file: None,
        };
        self.engine.start(request, &CancellationToken::new()).await
    }

    async fn recorded_replicas(&self) -> Option<u32> {
        self.engine.store().load().await.unwrap().map(|d| d.replicas)
    }
}

#[tokio::test]
async fn test_single_replica_starts_direct() {
    let h = Harness::new();

    let report = assert_ok!(h.start(1, ModeRequest::Auto).await);

    assert_eq!(report.decision.mode, Mode::Direct);
    assert_eq!(report.decision.rationale, ModeRationale::SingleReplica);
    assert_eq!(h.recorded_replicas().await, Some(1));
    assert_eq!(
        h.health.probes.lock().unwrap().as_slice(),
        ["http://127.0.0.1:8080/health".to_string()]
    );
}

#[tokio::test]
async fn test_clustered_lifecycle_start_scale_stop() {
    let h = Harness::new().with_cluster();
    let cancel = CancellationToken::new();

    let report = assert_ok!(h.start(3, ModeRequest::Auto).await);
    assert_eq!(report.decision.mode, Mode::Clustered);

    let scaled = assert_ok!(h.engine.scale(5, &cancel).await);
    assert!(scaled.changed);
    assert_eq!(scaled.previous_replicas, 3);
    assert_eq!(h.recorded_replicas().await, Some(5));
    assert_eq!(h.backends.clustered.live_replicas(), Some(5));

    let stopped = assert_ok!(h.engine.stop(false).await);
    assert!(stopped.stopped);
    assert_eq!(stopped.termination, Some(Termination::Removed));
    assert_eq!(h.recorded_replicas().await, None);
    assert_eq!(h.backends.clustered.cleanups.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_many_replicas_without_cluster_are_composed() {
    let h = Harness::new();

    let report = assert_ok!(h.start(3, ModeRequest::Auto).await);

    assert_eq!(report.decision.mode, Mode::Composed);
    assert_eq!(report.decision.rationale, ModeRationale::ClusterUnavailable);
    assert_eq!(h.backends.composed.live_replicas(), Some(3));
}

#[tokio::test]
async fn test_explicit_mode_wins() {
    let h = Harness::new().with_cluster();

    let report = assert_ok!(h.start(4, ModeRequest::Explicit(Mode::Composed)).await);

    assert_eq!(report.decision.mode, Mode::Composed);
    assert_eq!(report.decision.rationale, ModeRationale::Explicit);
}

#[tokio::test]
async fn test_second_start_is_rejected() {
    let h = Harness::new();
    assert_ok!(h.start(1, ModeRequest::Auto).await);
    let before = h.engine.store().load().await.unwrap();

    let err = assert_err!(h.start(3, ModeRequest::Auto).await);

    assert_eq!(err.kind(), "already_running");
    assert_eq!(h.engine.store().load().await.unwrap(), before);
    assert_eq!(h.backends.direct.deploys.load(Ordering::SeqCst), 1);
    assert_eq!(h.backends.composed.deploys.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_start_replaces_stale_record() {
    let h = Harness::new();
    assert_ok!(h.start(1, ModeRequest::Auto).await);
    h.backends.direct.vanish();

    assert_ok!(h.start(1, ModeRequest::Auto).await);
    assert_eq!(h.backends.direct.deploys.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_failed_health_check_leaves_nothing_behind() {
    let h = Harness::new();
    h.health.healthy.store(false, Ordering::SeqCst);

    let err = assert_err!(h.start(2, ModeRequest::Auto).await);

    assert_eq!(err.kind(), "health_check_failed");
    assert_eq!(h.recorded_replicas().await, None);
    assert_eq!(h.backends.composed.terminations.load(Ordering::SeqCst), 1);
    assert_eq!(h.backends.composed.cleanups.load(Ordering::SeqCst), 1);
    assert_eq!(h.backends.composed.live_replicas(), None);
}

#[tokio::test]
async fn test_direct_with_many_replicas_fails_preflight() {
    let h = Harness::new();

    let err = assert_err!(h.start(2, ModeRequest::Explicit(Mode::Direct)).await);

    assert_eq!(err.kind(), "preflight");
    assert_eq!(h.backends.direct.deploys.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_scale_direct_is_unsupported() {
    let h = Harness::new();
    assert_ok!(h.start(1, ModeRequest::Auto).await);

    let err = assert_err!(h.engine.scale(3, &CancellationToken::new()).await);

    assert_eq!(err.kind(), "unsupported_operation");
    assert!(err.to_string().contains("restart"));
    assert_eq!(h.recorded_replicas().await, Some(1));
}

#[tokio::test]
async fn test_scale_to_same_count_is_noop() {
    let h = Harness::new().with_cluster();
    assert_ok!(h.start(3, ModeRequest::Auto).await);

    let report = assert_ok!(h.engine.scale(3, &CancellationToken::new()).await);

    assert!(!report.changed);
    assert_eq!(h.backends.clustered.rescales.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_scale_health_failure_keeps_previous_record() {
    let h = Harness::new();
    assert_ok!(h.start(2, ModeRequest::Auto).await);
    h.health.healthy.store(false, Ordering::SeqCst);

    let err = assert_err!(h.engine.scale(6, &CancellationToken::new()).await);

    assert_eq!(err.kind(), "health_check_failed");
    assert_eq!(h.recorded_replicas().await, Some(2));
}

#[tokio::test]
async fn test_scale_and_logs_require_deployment() {
    let h = Harness::new();
    let cancel = CancellationToken::new();

    let err = assert_err!(h.engine.scale(2, &cancel).await);
    assert!(matches!(err, OrchestratorError::NotRunning));

    let err = assert_err!(h.engine.restart(None, &cancel).await);
    assert!(matches!(err, OrchestratorError::NotRunning));

    assert!(matches!(
        h.engine.logs(10, false, &cancel).await,
        Err(OrchestratorError::NotRunning)
    ));
}

#[tokio::test]
async fn test_stop_without_deployment_is_noop() {
    let h = Harness::new();

    let report = assert_ok!(h.engine.stop(true).await);

    assert!(!report.stopped);
    assert!(report.termination.is_none());
    for backend in [&h.backends.direct, &h.backends.clustered, &h.backends.composed] {
        assert_eq!(backend.terminations.load(Ordering::SeqCst), 0);
        assert_eq!(backend.cleanups.load(Ordering::SeqCst), 0);
    }
}

#[tokio::test]
async fn test_stop_failure_retains_record() {
    let h = Harness::new();
    assert_ok!(h.start(1, ModeRequest::Auto).await);
    h.backends.direct.fail_terminate.store(true, Ordering::SeqCst);

    let err = assert_err!(h.engine.stop(false).await);

    assert_eq!(err.kind(), "terminate");
    assert_eq!(h.recorded_replicas().await, Some(1));
}

#[tokio::test]
async fn test_stop_cleanup_failure_can_be_retried() {
    let h = Harness::new();
    assert_ok!(h.start(3, ModeRequest::Auto).await);
    h.backends.composed.fail_cleanup.store(true, Ordering::SeqCst);

    let err = assert_err!(h.engine.stop(false).await);
    assert_eq!(err.kind(), "io");
    assert_eq!(h.recorded_replicas().await, Some(3));
    assert_eq!(h.backends.composed.live_replicas(), None);

    h.backends.composed.fail_cleanup.store(false, Ordering::SeqCst);
    let report = assert_ok!(h.engine.stop(false).await);

    assert!(report.stopped);
    assert_eq!(report.termination, Some(Termination::AlreadyAbsent));
    assert_eq!(h.backends.composed.cleanups.load(Ordering::SeqCst), 2);
    assert_eq!(h.recorded_replicas().await, None);
}

#[tokio::test]
async fn test_stop_when_resources_already_gone() {
    let h = Harness::new();
    assert_ok!(h.start(1, ModeRequest::Auto).await);
    h.backends.direct.vanish();

    let report = assert_ok!(h.engine.stop(false).await);

    assert_eq!(report.termination, Some(Termination::AlreadyAbsent));
    assert_eq!(h.recorded_replicas().await, None);
}

#[tokio::test]
async fn test_status_reports_live_view() {
    let h = Harness::new();

    let report = assert_ok!(h.engine.status().await);
    assert!(!report.running);
    assert!(!report.drift_reconciled);

    assert_ok!(h.start(3, ModeRequest::Auto).await);
    let report = assert_ok!(h.engine.status().await);
    assert!(report.running);
    assert_eq!(report.running_replicas, 3);
    assert_eq!(report.healthy_replicas, 3);
    assert!(report.uptime_secs.is_some());
}

#[tokio::test]
async fn test_status_reconciles_drift() {
    let h = Harness::new();
    assert_ok!(h.start(3, ModeRequest::Auto).await);
    h.backends.composed.vanish();

    let report = assert_ok!(h.engine.status().await);

    assert!(!report.running);
    assert!(report.drift_reconciled);
    assert_eq!(h.recorded_replicas().await, None);
}

#[tokio::test]
async fn test_status_degraded_backend_keeps_record() {
    let h = Harness::new();
    assert_ok!(h.start(3, ModeRequest::Auto).await);
    h.backends.composed.vanish();
    *h.backends.composed.degraded.lock().unwrap() = Some("docker unreachable".to_string());

    let report = assert_ok!(h.engine.status().await);

    assert!(report.running);
    assert!(!report.drift_reconciled);
    assert_eq!(report.live.unwrap().degraded.as_deref(), Some("docker unreachable"));
    assert_eq!(h.recorded_replicas().await, Some(3));
}

#[tokio::test]
async fn test_restart_direct_with_more_replicas_reselects_mode() {
    let h = Harness::new().with_cluster();
    assert_ok!(h.start(1, ModeRequest::Auto).await);

    let report = assert_ok!(h.engine.restart(Some(3), &CancellationToken::new()).await);

    assert_eq!(report.stopped.mode, Some(Mode::Direct));
    assert_eq!(report.started.decision.mode, Mode::Clustered);
    assert_eq!(report.started.deployment.image, "acme/api:1");
    assert_eq!(h.backends.direct.live_replicas(), None);
    assert_eq!(h.recorded_replicas().await, Some(3));
}

#[tokio::test]
async fn test_restart_preserves_mode() {
    let h = Harness::new().with_cluster();
    assert_ok!(h.start(2, ModeRequest::Explicit(Mode::Composed)).await);

    let report = assert_ok!(h.engine.restart(None, &CancellationToken::new()).await);

    assert_eq!(report.started.decision.mode, Mode::Composed);
    assert_eq!(report.started.deployment.replicas, 2);
}

#[tokio::test]
async fn test_restart_with_failed_start_leaves_nothing_running() {
    let h = Harness::new().with_cluster();
    assert_ok!(h.start(3, ModeRequest::Auto).await);
    h.health.healthy.store(false, Ordering::SeqCst);

    let err = assert_err!(h.engine.restart(None, &CancellationToken::new()).await);

    assert_eq!(err.kind(), "health_check_failed");
    assert_eq!(h.recorded_replicas().await, None);
    let clustered = &h.backends.clustered;
    assert_eq!(clustered.deploys.load(Ordering::SeqCst), 2);
    // once by the stop half, once when the failed start is discarded
    assert_eq!(clustered.terminations.load(Ordering::SeqCst), 2);
    assert_eq!(clustered.live_replicas(), None);
}

#[tokio::test]
async fn test_restart_with_failed_stop_keeps_original() {
    let h = Harness::new().with_cluster();
    assert_ok!(h.start(3, ModeRequest::Auto).await);
    let before = h.engine.store().load().await.unwrap();
    h.backends.clustered.fail_terminate.store(true, Ordering::SeqCst);

    let err = assert_err!(h.engine.restart(Some(5), &CancellationToken::new()).await);

    assert_eq!(err.kind(), "terminate");
    assert_eq!(h.engine.store().load().await.unwrap(), before);
    assert_eq!(h.backends.clustered.deploys.load(Ordering::SeqCst), 1);
    assert_eq!(h.backends.clustered.live_replicas(), Some(3));
}

#[tokio::test]
async fn test_start_records_absolute_env_file() {
    let h = Harness::new();
    let request = StartRequest {
        replicas: 2,
        mode: ModeRequest::Auto,
        port: 8080,
        image: "acme/api:1".to_string(),
        env_file: Some("Cargo.toml".into()),
    };

    let report = assert_ok!(h.engine.start(request, &CancellationToken::new()).await);

    let recorded = h.engine.store().load().await.unwrap().unwrap();
    let env_file = recorded.env_file.unwrap();
    assert!(env_file.is_absolute());
    assert!(env_file.ends_with("Cargo.toml"));
    assert_eq!(report.deployment.env_file, Some(env_file));
}

#[tokio::test]
async fn test_logs_stream_and_cancel() {
    let h = Harness::new();
    assert_ok!(h.start(1, ModeRequest::Auto).await);

    let cancel = CancellationToken::new();
    let lines: Vec<_> = assert_ok!(h.engine.logs(3, false, &cancel).await).collect().await;
    assert_eq!(lines.len(), 3);

    let mut follow = assert_ok!(h.engine.logs(2, true, &cancel).await);
    assert!(follow.next().await.is_some());
    assert!(follow.next().await.is_some());
    cancel.cancel();
    let ended = tokio::time::timeout(Duration::from_secs(1), follow.next()).await;
    assert!(matches!(ended, Ok(None)));
}
