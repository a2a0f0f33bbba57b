//! Host checks run before anything is created

use async_trait::async_trait;
use tokio::net::TcpListener;
use tracing::debug;

use crate::deploy::compose::{detect_compose, NO_COMPOSE};
use crate::deploy::docker::DockerCli;
use crate::deploy::swarm::{swarm_state, SwarmState};
use crate::errors::OrchestratorError;
use crate::models::deployment::{DeployParams, Mode};

/// What the host can do for us
#[async_trait]
pub trait HostProbe: Send + Sync {
    /// Whether the tooling for `mode` is installed and the daemon answers
    async fn check_runtime(&self, mode: Mode) -> Result<(), String>;

    /// Whether this host already belongs to an active swarm
    async fn cluster_available(&self) -> bool;

    async fn port_in_use(&self, port: u16) -> bool;

    /// Whether the image exists locally or in its registry
    async fn image_resolvable(&self, image: &str) -> bool;
}

/// Probe backed by the docker CLI and local sockets
pub struct DockerHost {
    cli: DockerCli,
}

impl DockerHost {
    pub fn new(cli: DockerCli) -> Self {
        Self { cli }
    }
}

#[async_trait]
impl HostProbe for DockerHost {
    async fn check_runtime(&self, mode: Mode) -> Result<(), String> {
        let out = self
            .cli
            .run(&["version", "--format", "{{.Server.Version}}"])
            .await
            .map_err(|e| format!("{} is not runnable: {}", self.cli.bin(), e))?;
        if !out.success {
            return Err(format!("docker daemon unavailable: {}", out.diagnostic()));
        }
        debug!("Docker server version {}", out.stdout.trim());

        match mode {
            Mode::Composed => detect_compose(&self.cli)
                .await
                .map(|_| ())
                .ok_or_else(|| NO_COMPOSE.to_string()),
            Mode::Clustered => match swarm_state(&self.cli).await {
                Ok(state) if state.is_usable() => Ok(()),
                Ok(state) => Err(format!("swarm is not usable on this host ({:?})", state)),
                Err(e) => Err(e),
            },
            Mode::Direct => Ok(()),
        }
    }

    async fn cluster_available(&self) -> bool {
        match swarm_state(&self.cli).await {
            Ok(state) => state == SwarmState::Active,
            Err(e) => {
                debug!("Swarm state unavailable: {}", e);
                false
            }
        }
    }

    async fn port_in_use(&self, port: u16) -> bool {
        TcpListener::bind(("0.0.0.0", port)).await.is_err()
    }

    async fn image_resolvable(&self, image: &str) -> bool {
        if let Ok(out) = self.cli.run(&["image", "inspect", image]).await {
            if out.success {
                return true;
            }
        }
        debug!("Image {} not present locally, checking registry", image);
        matches!(
            self.cli.run(&["manifest", "inspect", image]).await,
            Ok(out) if out.success
        )
    }
}

/// Validate a start request for `mode` against the host.
///
/// Returns the parameters to deploy and persist, with the environment file
/// made absolute. Every failure is a [`OrchestratorError::Preflight`];
/// nothing is created.
pub async fn check(
    probe: &dyn HostProbe,
    params: &DeployParams,
    mode: Mode,
) -> Result<DeployParams, OrchestratorError> {
    if params.replicas == 0 {
        return Err(OrchestratorError::Preflight(
            "replicas must be at least 1".to_string(),
        ));
    }
    if params.port == 0 {
        return Err(OrchestratorError::Preflight(
            "port must be between 1 and 65535".to_string(),
        ));
    }
    if mode == Mode::Direct && params.replicas != 1 {
        return Err(OrchestratorError::Preflight(format!(
            "direct mode runs exactly one container, {} replicas requested",
            params.replicas
        )));
    }
    if params.image.trim().is_empty() {
        return Err(OrchestratorError::Preflight("image must not be empty".to_string()));
    }

    let mut resolved = params.clone();
    if let Some(env_file) = &params.env_file {
        // compose reads env files relative to the stack file, not our cwd
        let absolute = tokio::fs::canonicalize(env_file).await.map_err(|e| {
            OrchestratorError::Preflight(format!(
                "environment file {} is not accessible: {}",
                env_file.display(),
                e
            ))
        })?;
        debug!("Resolved environment file {} to {}", env_file.display(), absolute.display());
        resolved.env_file = Some(absolute);
    }

    probe
        .check_runtime(mode)
        .await
        .map_err(OrchestratorError::Preflight)?;

    if probe.port_in_use(params.port).await {
        return Err(OrchestratorError::Preflight(format!(
            "port {} is already in use",
            params.port
        )));
    }

    if !probe.image_resolvable(&params.image).await {
        return Err(OrchestratorError::Preflight(format!(
            "image {} was not found locally or in its registry",
            params.image
        )));
    }

    Ok(resolved)
}
