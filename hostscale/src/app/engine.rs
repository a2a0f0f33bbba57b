//! Orchestration engine: start, status, scale, stop, restart and logs

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::app::options::EngineOptions;
use crate::deploy::fsm::{LifecycleEvent, LifecycleFsm};
use crate::deploy::preflight::{self, DockerHost, HostProbe};
use crate::deploy::runner::{LogStream, SystemRunner};
use crate::deploy::docker::DockerCli;
use crate::deploy::selector;
use crate::deploy::{Backend, BackendProvider, DockerBackends};
use crate::errors::OrchestratorError;
use crate::health::probe::{health_endpoint, HealthProbe, HttpHealthProber};
use crate::models::deployment::{
    BackendHandle, BackendStatus, DeployParams, DeploymentDescriptor, Mode, ModeDecision,
    ModeRequest, Termination,
};
use crate::storage::state::StateStore;

/// Arguments of a start
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartRequest {
    pub replicas: u32,
    pub mode: ModeRequest,
    pub port: u16,
    pub image: String,
    pub env_file: Option<PathBuf>,
}

impl StartRequest {
    fn params(&self) -> DeployParams {
        DeployParams {
            replicas: self.replicas,
            port: self.port,
            image: self.image.clone(),
            env_file: self.env_file.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StartReport {
    pub decision: ModeDecision,
    pub deployment: DeploymentDescriptor,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusReport {
    pub running: bool,

    /// The record pointed at resources that no longer exist and was removed
    pub drift_reconciled: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployment: Option<DeploymentDescriptor>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_secs: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub live: Option<BackendStatus>,

    pub running_replicas: usize,
    pub healthy_replicas: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScaleReport {
    pub previous_replicas: u32,
    pub replicas: u32,
    pub changed: bool,
    pub deployment: DeploymentDescriptor,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StopReport {
    /// False when nothing was deployed
    pub stopped: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<Mode>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub termination: Option<Termination>,

    pub purged: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestartReport {
    pub stopped: StopReport,
    pub started: StartReport,
}

/// Coordinates mode selection, backends, health gating and the state store
pub struct Orchestrator {
    options: EngineOptions,
    store: StateStore,
    backends: Arc<dyn BackendProvider>,
    host: Arc<dyn HostProbe>,
    health: Arc<dyn HealthProbe>,
}

impl Orchestrator {
    pub fn new(
        options: EngineOptions,
        backends: Arc<dyn BackendProvider>,
        host: Arc<dyn HostProbe>,
        health: Arc<dyn HealthProbe>,
    ) -> Self {
        let store = StateStore::new(options.layout.state_file());
        Self {
            options,
            store,
            backends,
            host,
            health,
        }
    }

    /// Engine wired to the docker CLI and real HTTP probing
    pub fn with_docker(options: EngineOptions) -> Result<Self, OrchestratorError> {
        let runner = Arc::new(SystemRunner);
        let backends = Arc::new(DockerBackends::new(
            runner.clone(),
            &options.docker_bin,
            options.backend.clone(),
            options.layout.clone(),
        ));
        let host = Arc::new(DockerHost::new(DockerCli::new(runner, options.docker_bin.clone())));
        let health = Arc::new(HttpHealthProber::new(options.health_poll_interval)?);
        Ok(Self::new(options, backends, host, health))
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    fn backend(&self, mode: Mode) -> Arc<dyn Backend> {
        self.backends.backend(mode)
    }

    async fn wait_healthy(
        &self,
        port: u16,
        cancel: &CancellationToken,
    ) -> Result<bool, OrchestratorError> {
        let endpoint = health_endpoint(port, &self.options.health_path)?;
        Ok(self
            .health
            .wait_healthy(&endpoint, self.options.health_timeout, cancel)
            .await)
    }

    /// Load the record, dropping it when its resources are gone
    async fn load_live(&self) -> Result<Option<DeploymentDescriptor>, OrchestratorError> {
        let Some(descriptor) = self.store.load().await? else {
            return Ok(None);
        };
        let live = self.backend(descriptor.mode()).inspect(&descriptor.handle).await;
        if self.store.reconcile(&live).await? {
            return Ok(None);
        }
        Ok(Some(descriptor))
    }

    pub async fn start(
        &self,
        request: StartRequest,
        cancel: &CancellationToken,
    ) -> Result<StartReport, OrchestratorError> {
        let existing = self.load_live().await?;
        let mut fsm = LifecycleFsm::observed(existing.is_some());
        if let Err(reason) = fsm.process(LifecycleEvent::Start) {
            let detail = existing
                .map(|d| {
                    format!(
                        "{} deployment of {} with {} replicas on port {}",
                        d.mode(),
                        d.image,
                        d.replicas,
                        d.port
                    )
                })
                .unwrap_or(reason);
            return Err(OrchestratorError::AlreadyRunning(detail));
        }

        match self.start_fresh(&request, cancel).await {
            Ok(report) => {
                transition(&mut fsm, LifecycleEvent::Started)?;
                Ok(report)
            }
            Err(e) => {
                transition(&mut fsm, LifecycleEvent::StartFailed(e.to_string()))?;
                error!("Start failed: {}", e);
                Err(e)
            }
        }
    }

    async fn start_fresh(
        &self,
        request: &StartRequest,
        cancel: &CancellationToken,
    ) -> Result<StartReport, OrchestratorError> {
        let params = request.params();
        if params.replicas == 0 {
            return Err(OrchestratorError::Preflight(
                "replicas must be at least 1".to_string(),
            ));
        }

        let cluster_available = match request.mode {
            ModeRequest::Auto if params.replicas > 1 => self.host.cluster_available().await,
            _ => false,
        };
        let decision = selector::select(params.replicas, request.mode, cluster_available);
        info!(
            "Selected {} mode for {} replicas ({:?})",
            decision.mode, params.replicas, decision.rationale
        );

        let params = preflight::check(self.host.as_ref(), &params, decision.mode).await?;

        let backend = self.backend(decision.mode);
        let handle = backend.deploy(&params, cancel).await?;

        if !self.wait_healthy(params.port, cancel).await? {
            self.discard(backend.as_ref(), &handle).await;
            return Err(OrchestratorError::HealthCheckFailed(format!(
                "no successful response on port {} within {:?}",
                params.port, self.options.health_timeout
            )));
        }

        let descriptor = DeploymentDescriptor::new(handle.clone(), &params, Utc::now())?;
        if let Err(e) = self.store.save(&descriptor).await {
            self.discard(backend.as_ref(), &handle).await;
            return Err(e);
        }

        info!(
            "Started {} deployment {} with {} replicas",
            descriptor.mode(),
            handle.reference(),
            descriptor.replicas
        );
        Ok(StartReport {
            decision,
            deployment: descriptor,
        })
    }

    /// Tear down a deployment that never got recorded
    async fn discard(&self, backend: &dyn Backend, handle: &BackendHandle) {
        warn!("Removing unrecorded deployment {}", handle.reference());
        if let Err(e) = backend.terminate(handle, false).await {
            warn!("Failed to terminate {}: {}", handle.reference(), e);
        }
        if let Err(e) = backend.cleanup_artifacts().await {
            warn!("Failed to remove generated artifacts: {}", e);
        }
    }

    pub async fn status(&self) -> Result<StatusReport, OrchestratorError> {
        let Some(descriptor) = self.store.load().await? else {
            return Ok(StatusReport::default());
        };
        let mut fsm = LifecycleFsm::observed(true);

        let live = self.backend(descriptor.mode()).inspect(&descriptor.handle).await;
        if self.store.reconcile(&live).await? {
            transition(&mut fsm, LifecycleEvent::Reconciled)?;
            return Ok(StatusReport {
                drift_reconciled: true,
                live: Some(live),
                ..Default::default()
            });
        }

        Ok(StatusReport {
            running: true,
            drift_reconciled: false,
            uptime_secs: Some(descriptor.uptime_secs(Utc::now())),
            running_replicas: live.running_count(),
            healthy_replicas: live.healthy_count(),
            deployment: Some(descriptor),
            live: Some(live),
        })
    }

    pub async fn scale(
        &self,
        replicas: u32,
        cancel: &CancellationToken,
    ) -> Result<ScaleReport, OrchestratorError> {
        if replicas == 0 {
            return Err(OrchestratorError::Preflight(
                "replicas must be at least 1".to_string(),
            ));
        }

        let live = self.load_live().await?;
        let mut fsm = LifecycleFsm::observed(live.is_some());
        let Some(descriptor) = live else {
            return Err(OrchestratorError::NotRunning);
        };

        if descriptor.mode() == Mode::Direct {
            return Err(OrchestratorError::UnsupportedOperation(format!(
                "direct deployments cannot be scaled; \
                 run `hostscale restart --replicas={}` to redeploy",
                replicas
            )));
        }

        if descriptor.replicas == replicas {
            info!("Deployment already runs {} replicas", replicas);
            return Ok(ScaleReport {
                previous_replicas: replicas,
                replicas,
                changed: false,
                deployment: descriptor,
            });
        }

        transition(&mut fsm, LifecycleEvent::Scale)?;

        match self.rescale(&descriptor, replicas, cancel).await {
            Ok(updated) => {
                transition(&mut fsm, LifecycleEvent::Scaled)?;
                info!("Scaled from {} to {} replicas", descriptor.replicas, replicas);
                Ok(ScaleReport {
                    previous_replicas: descriptor.replicas,
                    replicas,
                    changed: true,
                    deployment: updated,
                })
            }
            Err(e) => {
                transition(&mut fsm, LifecycleEvent::ScaleFailed(e.to_string()))?;
                error!("Scale failed: {}", e);
                Err(e)
            }
        }
    }

    async fn rescale(
        &self,
        descriptor: &DeploymentDescriptor,
        replicas: u32,
        cancel: &CancellationToken,
    ) -> Result<DeploymentDescriptor, OrchestratorError> {
        let params = DeployParams {
            replicas,
            ..descriptor.params()
        };
        let handle = self
            .backend(descriptor.mode())
            .rescale(&descriptor.handle, &params, cancel)
            .await?;

        if !self.wait_healthy(params.port, cancel).await? {
            return Err(OrchestratorError::HealthCheckFailed(format!(
                "no successful response on port {} within {:?} after scaling to {}",
                params.port, self.options.health_timeout, replicas
            )));
        }

        let updated = DeploymentDescriptor::new(handle, &params, descriptor.started_at)?;
        self.store.save(&updated).await?;
        Ok(updated)
    }

    pub async fn stop(&self, purge_data: bool) -> Result<StopReport, OrchestratorError> {
        let recorded = self.store.load().await?;
        let mut fsm = LifecycleFsm::observed(recorded.is_some());
        let (Some(descriptor), Ok(())) = (recorded, fsm.process(LifecycleEvent::Stop)) else {
            info!("Nothing deployed, nothing to stop");
            return Ok(StopReport::default());
        };

        let backend = self.backend(descriptor.mode());
        let teardown = async {
            let termination = backend.terminate(&descriptor.handle, purge_data).await?;
            // the record goes last so a failed step can be retried
            backend.cleanup_artifacts().await?;
            self.store.delete().await?;
            Ok::<_, OrchestratorError>(termination)
        };
        let termination = match teardown.await {
            Ok(termination) => termination,
            Err(e) => {
                transition(&mut fsm, LifecycleEvent::StopFailed(e.to_string()))?;
                error!("Stop failed, keeping the deployment record: {}", e);
                return Err(e);
            }
        };
        transition(&mut fsm, LifecycleEvent::Stopped)?;

        info!(
            "Stopped {} deployment {} ({:?})",
            descriptor.mode(),
            descriptor.handle.reference(),
            termination
        );
        Ok(StopReport {
            stopped: true,
            mode: Some(descriptor.mode()),
            termination: Some(termination),
            purged: purge_data,
        })
    }

    /// Stop and start again with the recorded parameters
    pub async fn restart(
        &self,
        replicas: Option<u32>,
        cancel: &CancellationToken,
    ) -> Result<RestartReport, OrchestratorError> {
        if replicas == Some(0) {
            return Err(OrchestratorError::Preflight(
                "replicas must be at least 1".to_string(),
            ));
        }

        let descriptor = self.store.load().await?.ok_or(OrchestratorError::NotRunning)?;
        let request = restart_request(&descriptor, replicas);

        info!(
            "Restarting {} deployment with {} replicas",
            descriptor.mode(),
            request.replicas
        );
        let stopped = self.stop(false).await?;
        let started = self.start(request, cancel).await?;
        Ok(RestartReport { stopped, started })
    }

    /// Stream deployment logs until the stream ends or `cancel` fires
    pub async fn logs(
        &self,
        tail: usize,
        follow: bool,
        cancel: &CancellationToken,
    ) -> Result<LogStream, OrchestratorError> {
        let descriptor = self.store.load().await?.ok_or(OrchestratorError::NotRunning)?;
        let stream = self
            .backend(descriptor.mode())
            .fetch_logs(&descriptor.handle, tail, follow)
            .await?;
        Ok(Box::pin(stream.take_until(cancel.clone().cancelled_owned())))
    }
}

/// Parameters a restart redeploys with
pub fn restart_request(descriptor: &DeploymentDescriptor, replicas: Option<u32>) -> StartRequest {
    let replicas = replicas.unwrap_or(descriptor.replicas);
    let mode = if descriptor.mode() == Mode::Direct && replicas > 1 {
        ModeRequest::Auto
    } else {
        ModeRequest::Explicit(descriptor.mode())
    };
    StartRequest {
        replicas,
        mode,
        port: descriptor.port,
        image: descriptor.image.clone(),
        env_file: descriptor.env_file.clone(),
    }
}

fn transition(fsm: &mut LifecycleFsm, event: LifecycleEvent) -> Result<(), OrchestratorError> {
    fsm.process(event).map_err(OrchestratorError::Internal)
}
