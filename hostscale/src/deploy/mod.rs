//! Deployment backends

pub mod compose;
pub mod docker;
pub mod fsm;
pub mod preflight;
pub mod runner;
pub mod selector;
pub mod swarm;
pub mod templates;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::errors::OrchestratorError;
use crate::models::deployment::{BackendHandle, BackendStatus, DeployParams, Mode, Termination};
use crate::storage::layout::StorageLayout;

use self::compose::ComposeBackend;
use self::docker::{DirectBackend, DockerCli};
use self::runner::{CommandRunner, LogStream};
use self::swarm::SwarmBackend;

/// Uniform operation set every deployment mode implements
#[async_trait]
pub trait Backend: Send + Sync {
    fn mode(&self) -> Mode;

    /// Create the resources and wait until the backend reports them running.
    ///
    /// Anything created before a failure is removed before returning.
    async fn deploy(
        &self,
        params: &DeployParams,
        cancel: &CancellationToken,
    ) -> Result<BackendHandle, OrchestratorError>;

    /// Change the replica count in place. `params.replicas` is the new count.
    async fn rescale(
        &self,
        handle: &BackendHandle,
        params: &DeployParams,
        cancel: &CancellationToken,
    ) -> Result<BackendHandle, OrchestratorError>;

    /// Tear everything down. Missing resources are not an error.
    async fn terminate(
        &self,
        handle: &BackendHandle,
        purge_data: bool,
    ) -> Result<Termination, OrchestratorError>;

    /// Live view; backend trouble shows up as a degraded status
    async fn inspect(&self, handle: &BackendHandle) -> BackendStatus;

    async fn fetch_logs(
        &self,
        handle: &BackendHandle,
        tail: usize,
        follow: bool,
    ) -> Result<LogStream, OrchestratorError>;

    /// Remove generated configuration files
    async fn cleanup_artifacts(&self) -> Result<(), OrchestratorError> {
        Ok(())
    }
}

/// Settings shared by all backends
#[derive(Debug, Clone)]
pub struct BackendOptions {
    /// Container, service and compose project name
    pub service_name: String,

    /// Port the application listens on inside the container
    pub container_port: u16,

    /// Budget for backend-reported readiness
    pub readiness_timeout: Duration,

    /// Delay between readiness polls
    pub poll_interval: Duration,

    /// Upgraded-connection paths for the composed proxy
    pub streaming_paths: Vec<String>,

    /// Advertise address for `docker swarm init`
    pub swarm_advertise_addr: Option<String>,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            service_name: "hostscale-app".to_string(),
            container_port: 8000,
            readiness_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
            streaming_paths: vec!["/ws".to_string()],
            swarm_advertise_addr: None,
        }
    }
}

/// Hands out the backend for a mode
pub trait BackendProvider: Send + Sync {
    fn backend(&self, mode: Mode) -> Arc<dyn Backend>;
}

/// The docker-based backends
pub struct DockerBackends {
    direct: Arc<DirectBackend>,
    clustered: Arc<SwarmBackend>,
    composed: Arc<ComposeBackend>,
}

impl DockerBackends {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        docker_bin: &str,
        options: BackendOptions,
        layout: StorageLayout,
    ) -> Self {
        let cli = DockerCli::new(runner, docker_bin);
        Self {
            direct: Arc::new(DirectBackend::new(cli.clone(), options.clone())),
            clustered: Arc::new(SwarmBackend::new(cli.clone(), options.clone())),
            composed: Arc::new(ComposeBackend::new(cli, options, layout)),
        }
    }
}

impl BackendProvider for DockerBackends {
    fn backend(&self, mode: Mode) -> Arc<dyn Backend> {
        match mode {
            Mode::Direct => self.direct.clone(),
            Mode::Clustered => self.clustered.clone(),
            Mode::Composed => self.composed.clone(),
        }
    }
}
