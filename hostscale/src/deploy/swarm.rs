//! Clustered deployment as a Docker Swarm service

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::deploy::docker::{is_not_found, short_id, to_args, DockerCli};
use crate::deploy::runner::LogStream;
use crate::deploy::templates::DEPLOYMENT_LABEL;
use crate::deploy::{Backend, BackendOptions};
use crate::errors::OrchestratorError;
use crate::models::deployment::{
    BackendHandle, BackendStatus, DeployParams, Mode, ReplicaStatus, Termination,
};
use crate::utils::{poll_until, PollOutcome};

const SWARM_SERVICE_LABEL: &str = "com.docker.swarm.service.name";

/// Swarm node state as reported by `docker info`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwarmState {
    Active,
    Inactive,
    Other(String),
}

impl SwarmState {
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "active" => SwarmState::Active,
            "inactive" => SwarmState::Inactive,
            other => SwarmState::Other(other.to_string()),
        }
    }

    /// Active, or inactive and able to bootstrap on an explicit request
    pub fn is_usable(&self) -> bool {
        matches!(self, SwarmState::Active | SwarmState::Inactive)
    }
}

/// Query the local swarm state
pub async fn swarm_state(cli: &DockerCli) -> Result<SwarmState, String> {
    let out = cli
        .run(&["info", "--format", "{{.Swarm.LocalNodeState}}"])
        .await
        .map_err(|e| e.to_string())?;
    if !out.success {
        return Err(out.diagnostic());
    }
    Ok(SwarmState::parse(&out.stdout))
}

/// Parse `running/desired` out of `docker service ls` replica column
fn parse_replicas(column: &str) -> Option<(u32, u32)> {
    let counts = column.split_whitespace().next()?;
    let (running, desired) = counts.split_once('/')?;
    Some((running.parse().ok()?, desired.parse().ok()?))
}

pub struct SwarmBackend {
    cli: DockerCli,
    options: BackendOptions,
}

impl SwarmBackend {
    pub fn new(cli: DockerCli, options: BackendOptions) -> Self {
        Self { cli, options }
    }

    /// Initialize a single-node swarm when none is active
    async fn ensure_cluster(&self) -> Result<(), OrchestratorError> {
        let state = swarm_state(&self.cli)
            .await
            .map_err(|e| OrchestratorError::Deploy(format!("Unable to query swarm state: {}", e)))?;

        match state {
            SwarmState::Active => Ok(()),
            SwarmState::Inactive => {
                info!("No active swarm, initializing a single-node cluster");
                let mut args = to_args(&["swarm", "init"]);
                if let Some(addr) = &self.options.swarm_advertise_addr {
                    args.push("--advertise-addr".to_string());
                    args.push(addr.clone());
                }
                let out = self.cli.run_args(args).await?;
                if !out.success {
                    return Err(OrchestratorError::Deploy(format!(
                        "docker swarm init failed: {}",
                        out.diagnostic()
                    )));
                }
                Ok(())
            }
            SwarmState::Other(state) => Err(OrchestratorError::Deploy(format!(
                "Swarm is not usable (state: {})",
                state
            ))),
        }
    }

    async fn replica_counts(&self, name: &str) -> Option<(u32, u32)> {
        let filter = format!("name={}", name);
        let out = self
            .cli
            .run(&[
                "service",
                "ls",
                "--filter",
                filter.as_str(),
                "--format",
                "{{.Name}}\t{{.Replicas}}",
            ])
            .await
            .ok()?;
        if !out.success {
            return None;
        }
        // the name filter is a prefix match
        out.stdout.lines().find_map(|line| {
            let (service, replicas) = line.split_once('\t')?;
            (service.trim() == name).then(|| parse_replicas(replicas)).flatten()
        })
    }

    async fn wait_converged(
        &self,
        name: &str,
        replicas: u32,
        cancel: &CancellationToken,
    ) -> PollOutcome {
        poll_until(
            self.options.readiness_timeout,
            self.options.poll_interval,
            cancel,
            || async move {
                match self.replica_counts(name).await {
                    Some((running, desired)) => {
                        debug!("Service {}: {}/{} replicas running", name, running, desired);
                        desired == replicas && running == replicas
                    }
                    None => false,
                }
            },
        )
        .await
    }

    async fn service_exists(&self, name: &str) -> Result<bool, String> {
        match self.cli.run(&["service", "inspect", "--format", "{{.ID}}", name]).await {
            Ok(out) if out.success => Ok(true),
            Ok(out) if is_not_found(&out.diagnostic()) => Ok(false),
            Ok(out) => Err(out.diagnostic()),
            Err(e) => Err(e.to_string()),
        }
    }

    /// Task containers of the service on this node
    async fn task_containers(&self, name: &str) -> Result<Vec<String>, String> {
        let filter = format!("label={}={}", SWARM_SERVICE_LABEL, name);
        let out = self
            .cli
            .run(&["ps", "-a", "-q", "--filter", filter.as_str()])
            .await
            .map_err(|e| e.to_string())?;
        if !out.success {
            return Err(out.diagnostic());
        }
        Ok(out.stdout.split_whitespace().map(str::to_string).collect())
    }

    /// `service rm` returns before the task containers are gone
    async fn wait_tasks_removed(&self, name: &str) {
        let outcome = poll_until(
            self.options.readiness_timeout,
            self.options.poll_interval,
            &CancellationToken::new(),
            || async move {
                matches!(self.task_containers(name).await, Ok(tasks) if tasks.is_empty())
            },
        )
        .await;
        if !outcome.is_ready() {
            warn!("Task containers of {} are still present ({:?})", name, outcome);
        }
    }

    async fn remove_service(&self, name: &str) {
        match self.cli.run(&["service", "rm", name]).await {
            Ok(out) if out.success => debug!("Removed service {}", name),
            Ok(out) => warn!("Failed to remove service {}: {}", name, out.diagnostic()),
            Err(e) => warn!("Failed to remove service {}: {}", name, e),
        }
    }
}

#[async_trait]
impl Backend for SwarmBackend {
    fn mode(&self) -> Mode {
        Mode::Clustered
    }

    async fn deploy(
        &self,
        params: &DeployParams,
        cancel: &CancellationToken,
    ) -> Result<BackendHandle, OrchestratorError> {
        let name = self.options.service_name.as_str();
        info!(
            "Deploying {} as swarm service {} with {} replicas",
            params.image, name, params.replicas
        );

        self.ensure_cluster().await?;

        if let Ok(true) = self.service_exists(name).await {
            debug!("Removing stale service {}", name);
            self.remove_service(name).await;
        }

        let label = format!("{}={}", DEPLOYMENT_LABEL, name);
        let replicas = params.replicas.to_string();
        let publish = format!(
            "published={},target={}",
            params.port, self.options.container_port
        );
        let mut args = to_args(&[
            "service",
            "create",
            "--detach",
            "--name",
            name,
            "--label",
            label.as_str(),
            "--container-label",
            label.as_str(),
            "--replicas",
            replicas.as_str(),
            "--publish",
            publish.as_str(),
        ]);
        if let Some(env_file) = &params.env_file {
            args.push("--env-file".to_string());
            args.push(env_file.to_string_lossy().into_owned());
        }
        args.push(params.image.clone());

        let out = self.cli.run_args(args).await?;
        if !out.success {
            if let Ok(true) = self.service_exists(name).await {
                self.remove_service(name).await;
            }
            return Err(OrchestratorError::Deploy(format!(
                "docker service create failed: {}",
                out.diagnostic()
            )));
        }
        let service_id = out.stdout.trim().to_string();

        let outcome = self.wait_converged(name, params.replicas, cancel).await;
        if !outcome.is_ready() {
            self.remove_service(name).await;
            return Err(OrchestratorError::Deploy(format!(
                "Service {} did not converge to {} replicas ({:?})",
                name, params.replicas, outcome
            )));
        }

        info!("Service {} ({}) converged", name, short_id(&service_id));
        Ok(BackendHandle::Clustered {
            service_name: name.to_string(),
            service_id,
        })
    }

    async fn rescale(
        &self,
        handle: &BackendHandle,
        params: &DeployParams,
        cancel: &CancellationToken,
    ) -> Result<BackendHandle, OrchestratorError> {
        let name = handle.reference();
        info!("Scaling service {} to {} replicas", name, params.replicas);

        let target = format!("{}={}", name, params.replicas);
        let out = self
            .cli
            .run(&["service", "scale", "--detach", target.as_str()])
            .await?;
        if !out.success {
            return Err(OrchestratorError::Rescale(format!(
                "docker service scale failed: {}",
                out.diagnostic()
            )));
        }

        let outcome = self.wait_converged(name, params.replicas, cancel).await;
        if !outcome.is_ready() {
            return Err(OrchestratorError::Rescale(format!(
                "Service {} did not converge to {} replicas ({:?})",
                name, params.replicas, outcome
            )));
        }

        Ok(handle.clone())
    }

    async fn terminate(
        &self,
        handle: &BackendHandle,
        purge_data: bool,
    ) -> Result<Termination, OrchestratorError> {
        let name = handle.reference();

        let exists = self
            .service_exists(name)
            .await
            .map_err(|e| {
                OrchestratorError::Terminate(format!("Unable to inspect service {}: {}", name, e))
            })?;

        // volumes outlive their tasks; collect them before the tasks go away
        let volumes = if purge_data {
            match self.task_containers(name).await {
                Ok(tasks) => self.cli.container_volumes(&tasks).await,
                Err(e) => {
                    warn!("Unable to list tasks of {}: {}", name, e);
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        let termination = if exists {
            let out = self.cli.run(&["service", "rm", name]).await?;
            if out.success {
                info!("Removed service {}", name);
                Termination::Removed
            } else if is_not_found(&out.diagnostic()) {
                Termination::AlreadyAbsent
            } else {
                return Err(OrchestratorError::Terminate(format!(
                    "docker service rm failed for {}: {}",
                    name,
                    out.diagnostic()
                )));
            }
        } else {
            info!("Service {} is already gone", name);
            Termination::AlreadyAbsent
        };

        if !volumes.is_empty() {
            self.wait_tasks_removed(name).await;
            self.cli.remove_volumes(&volumes).await;
        }
        Ok(termination)
    }

    async fn inspect(&self, handle: &BackendHandle) -> BackendStatus {
        let name = handle.reference();
        let out = match self
            .cli
            .run(&[
                "service",
                "ps",
                name,
                "--filter",
                "desired-state=running",
                "--format",
                "{{.ID}}\t{{.CurrentState}}",
            ])
            .await
        {
            Ok(out) => out,
            Err(e) => return BackendStatus::degraded(e.to_string()),
        };

        if !out.success {
            let diag = out.diagnostic();
            if is_not_found(&diag) {
                return BackendStatus::new(Vec::new());
            }
            return BackendStatus::degraded(diag);
        }

        let replicas = out
            .stdout
            .lines()
            .filter_map(|line| {
                let (id, state) = line.split_once('\t')?;
                let running = state.trim_start().starts_with("Running");
                Some(ReplicaStatus {
                    id: id.trim().to_string(),
                    running,
                    healthy: running,
                })
            })
            .collect();
        BackendStatus::new(replicas)
    }

    async fn fetch_logs(
        &self,
        handle: &BackendHandle,
        tail: usize,
        follow: bool,
    ) -> Result<LogStream, OrchestratorError> {
        let tail = tail.to_string();
        let mut args = to_args(&["service", "logs", "--tail", tail.as_str()]);
        if follow {
            args.push("--follow".to_string());
        }
        args.push(handle.reference().to_string());
        self.cli.stream(None, args).await
    }
}
