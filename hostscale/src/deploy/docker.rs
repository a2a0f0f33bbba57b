//! Direct deployment via `docker run`

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::deploy::runner::{CommandOutput, CommandRunner, LogStream};
use crate::deploy::templates::DEPLOYMENT_LABEL;
use crate::deploy::{Backend, BackendOptions};
use crate::errors::OrchestratorError;
use crate::models::deployment::{
    BackendHandle, BackendStatus, DeployParams, Mode, ReplicaStatus, Termination,
};
use crate::utils::poll_until;

const VOLUME_FORMAT: &str = "{{range .Mounts}}{{if eq .Type \"volume\"}}{{.Name}} {{end}}{{end}}";

/// Thin front over the docker CLI
#[derive(Clone)]
pub struct DockerCli {
    runner: Arc<dyn CommandRunner>,
    bin: String,
}

impl DockerCli {
    pub fn new(runner: Arc<dyn CommandRunner>, bin: impl Into<String>) -> Self {
        Self {
            runner,
            bin: bin.into(),
        }
    }

    pub async fn run(&self, args: &[&str]) -> Result<CommandOutput, OrchestratorError> {
        self.run_args(to_args(args)).await
    }

    pub async fn run_args(&self, args: Vec<String>) -> Result<CommandOutput, OrchestratorError> {
        self.runner.run(&self.bin, &args).await
    }

    pub async fn run_program(
        &self,
        program: &str,
        args: Vec<String>,
    ) -> Result<CommandOutput, OrchestratorError> {
        self.runner.run(program, &args).await
    }

    pub async fn stream(
        &self,
        program: Option<&str>,
        args: Vec<String>,
    ) -> Result<LogStream, OrchestratorError> {
        self.runner.stream(program.unwrap_or(&self.bin), &args).await
    }

    pub fn bin(&self) -> &str {
        &self.bin
    }

    /// Named volumes mounted by `containers`, sorted and deduplicated
    pub async fn container_volumes(&self, containers: &[String]) -> Vec<String> {
        if containers.is_empty() {
            return Vec::new();
        }
        let mut args = to_args(&["inspect", "--type", "container", "--format", VOLUME_FORMAT]);
        args.extend(containers.iter().cloned());

        let listed = match self.run_args(args).await {
            Ok(out) if out.success => out.stdout,
            Ok(out) => {
                warn!("Unable to list volumes of {:?}: {}", containers, out.diagnostic());
                return Vec::new();
            }
            Err(e) => {
                warn!("Unable to list volumes of {:?}: {}", containers, e);
                return Vec::new();
            }
        };

        let mut volumes: Vec<String> = listed.split_whitespace().map(str::to_string).collect();
        volumes.sort();
        volumes.dedup();
        volumes
    }

    /// Remove volumes; failures are logged
    pub async fn remove_volumes(&self, volumes: &[String]) {
        for volume in volumes {
            match self.run(&["volume", "rm", volume.as_str()]).await {
                Ok(out) if out.success => debug!("Removed volume {}", volume),
                Ok(out) if is_not_found(&out.diagnostic()) => {
                    debug!("Volume {} was already removed", volume)
                }
                Ok(out) => warn!("Unable to remove volume {}: {}", volume, out.diagnostic()),
                Err(e) => warn!("Unable to remove volume {}: {}", volume, e),
            }
        }
    }
}

pub(crate) fn to_args(args: &[&str]) -> Vec<String> {
    args.iter().map(|a| a.to_string()).collect()
}

/// Whether docker's error text means the object does not exist
pub fn is_not_found(diagnostic: &str) -> bool {
    let lower = diagnostic.to_lowercase();
    lower.contains("no such container")
        || lower.contains("no such object")
        || lower.contains("no such service")
        || lower.contains("not found")
}

/// Short form of a container or service id
pub(crate) fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}

/// Single-container backend. Never scales.
pub struct DirectBackend {
    cli: DockerCli,
    options: BackendOptions,
}

impl DirectBackend {
    pub fn new(cli: DockerCli, options: BackendOptions) -> Self {
        Self { cli, options }
    }

    async fn container_state(&self, id: &str) -> Result<(String, String), String> {
        let format = "{{.State.Status}}|{{if .State.Health}}{{.State.Health.Status}}{{end}}";
        match self.cli.run(&["inspect", "--type", "container", "-f", format, id]).await {
            Ok(out) if out.success => {
                let line = out.stdout.trim();
                let (status, health) = line.split_once('|').unwrap_or((line, ""));
                Ok((status.to_string(), health.to_string()))
            }
            Ok(out) => Err(out.diagnostic()),
            Err(e) => Err(e.to_string()),
        }
    }

    async fn force_remove(&self, id: &str) {
        if let Err(e) = self.cli.run(&["rm", "-f", id]).await {
            warn!("Failed to remove container {}: {}", id, e);
        }
    }
}

#[async_trait]
impl Backend for DirectBackend {
    fn mode(&self) -> Mode {
        Mode::Direct
    }

    async fn deploy(
        &self,
        params: &DeployParams,
        cancel: &CancellationToken,
    ) -> Result<BackendHandle, OrchestratorError> {
        let name = &self.options.service_name;
        info!("Deploying {} as a single container ({})", params.image, name);

        // A leftover container from an earlier run would block the name
        debug!("Removing stale container {} if present", name);
        let _ = self.cli.run(&["rm", "-f", name.as_str()]).await;

        let label = format!("{}={}", DEPLOYMENT_LABEL, name);
        let publish = format!("{}:{}", params.port, self.options.container_port);
        let mut args = to_args(&[
            "run",
            "-d",
            "--name",
            name.as_str(),
            "--label",
            label.as_str(),
            "-p",
            publish.as_str(),
            "--restart",
            "unless-stopped",
        ]);
        if let Some(env_file) = &params.env_file {
            args.push("--env-file".to_string());
            args.push(env_file.to_string_lossy().into_owned());
        }
        args.push(params.image.clone());

        let out = self.cli.run_args(args).await?;
        if !out.success {
            self.force_remove(name).await;
            return Err(OrchestratorError::Deploy(format!(
                "docker run failed for {}: {}",
                params.image,
                out.diagnostic()
            )));
        }

        let container_id = out.stdout.trim().to_string();
        if container_id.is_empty() {
            self.force_remove(name).await;
            return Err(OrchestratorError::Deploy(
                "docker run did not report a container id".to_string(),
            ));
        }

        let last_state = Arc::new(Mutex::new(String::new()));
        let outcome = poll_until(
            self.options.readiness_timeout,
            self.options.poll_interval,
            cancel,
            || {
                let last_state = last_state.clone();
                let id = container_id.clone();
                async move {
                    let state = match self.container_state(&id).await {
                        Ok((status, _)) => status,
                        Err(e) => e,
                    };
                    let settled = matches!(state.as_str(), "running" | "exited" | "dead");
                    if let Ok(mut last) = last_state.lock() {
                        *last = state;
                    }
                    settled
                }
            },
        )
        .await;

        let state = last_state.lock().map(|s| s.clone()).unwrap_or_default();
        if !outcome.is_ready() || state != "running" {
            self.force_remove(&container_id).await;
            return Err(OrchestratorError::Deploy(format!(
                "Container {} did not reach running state ({:?}, last state: {})",
                short_id(&container_id),
                outcome,
                if state.is_empty() { "unknown" } else { state.as_str() }
            )));
        }

        info!("Container {} is running", short_id(&container_id));
        Ok(BackendHandle::Direct { container_id })
    }

    async fn rescale(
        &self,
        _handle: &BackendHandle,
        _params: &DeployParams,
        _cancel: &CancellationToken,
    ) -> Result<BackendHandle, OrchestratorError> {
        Err(OrchestratorError::UnsupportedOperation(
            "direct deployments run a single container; stop and start again with more replicas"
                .to_string(),
        ))
    }

    async fn terminate(
        &self,
        handle: &BackendHandle,
        purge_data: bool,
    ) -> Result<Termination, OrchestratorError> {
        let id = handle.reference();

        match self.container_state(id).await {
            Err(diag) if is_not_found(&diag) => {
                info!("Container {} is already gone", short_id(id));
                if purge_data {
                    debug!("No container left to locate volumes of {}", short_id(id));
                }
                return Ok(Termination::AlreadyAbsent);
            }
            _ => {}
        }

        // named volumes survive `rm -v`, so note them while the container exists
        let volumes = if purge_data {
            self.cli.container_volumes(&[id.to_string()]).await
        } else {
            Vec::new()
        };

        let args: &[&str] = if purge_data {
            &["rm", "-f", "-v", id]
        } else {
            &["rm", "-f", id]
        };
        let out = self.cli.run(args).await?;
        if !out.success {
            let diag = out.diagnostic();
            if is_not_found(&diag) {
                return Ok(Termination::AlreadyAbsent);
            }
            return Err(OrchestratorError::Terminate(format!(
                "docker rm failed for {}: {}",
                short_id(id),
                diag
            )));
        }

        self.cli.remove_volumes(&volumes).await;
        info!("Removed container {}", short_id(id));
        Ok(Termination::Removed)
    }

    async fn inspect(&self, handle: &BackendHandle) -> BackendStatus {
        let id = handle.reference();
        match self.container_state(id).await {
            Ok((status, health)) => {
                let running = status == "running";
                let healthy = running && health != "unhealthy" && health != "starting";
                BackendStatus::new(vec![ReplicaStatus {
                    id: short_id(id).to_string(),
                    running,
                    healthy,
                }])
            }
            Err(diag) if is_not_found(&diag) => BackendStatus::new(Vec::new()),
            Err(diag) => BackendStatus::degraded(diag),
        }
    }

    async fn fetch_logs(
        &self,
        handle: &BackendHandle,
        tail: usize,
        follow: bool,
    ) -> Result<LogStream, OrchestratorError> {
        let tail = tail.to_string();
        let mut args = to_args(&["logs", "--tail", tail.as_str()]);
        if follow {
            args.push("--follow".to_string());
        }
        args.push(handle.reference().to_string());
        self.cli.stream(None, args).await
    }
}
