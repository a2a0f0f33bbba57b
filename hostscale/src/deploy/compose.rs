//! Composed deployment: app replicas behind an nginx proxy via Docker Compose

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::deploy::docker::{to_args, DockerCli};
use crate::deploy::runner::{CommandOutput, LogStream};
use crate::deploy::templates::{self, StackParams, APP_SERVICE, PROXY_SERVICE};
use crate::deploy::{Backend, BackendOptions};
use crate::errors::OrchestratorError;
use crate::models::deployment::{
    BackendHandle, BackendStatus, DeployParams, Mode, ReplicaStatus, Termination,
};
use crate::storage::layout::StorageLayout;
use crate::utils::{poll_until, PollOutcome};

const PROJECT_LABEL: &str = "com.docker.compose.project";
const SERVICE_LABEL: &str = "com.docker.compose.service";

pub(crate) const NO_COMPOSE: &str = "neither 'docker compose' nor 'docker-compose' is available";

/// Which compose front-end is installed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComposeCli {
    /// `docker compose`
    Plugin,
    /// legacy `docker-compose`
    Standalone,
}

/// Find a working compose CLI, preferring the docker plugin
pub async fn detect_compose(cli: &DockerCli) -> Option<ComposeCli> {
    if let Ok(out) = cli.run(&["compose", "version"]).await {
        if out.success {
            return Some(ComposeCli::Plugin);
        }
    }

    debug!("docker compose plugin unavailable, trying docker-compose...");
    match cli.run_program("docker-compose", to_args(&["version"])).await {
        Ok(out) if out.success => Some(ComposeCli::Standalone),
        _ => None,
    }
}

/// One container of the project as listed by `docker ps`
#[derive(Debug, Clone, PartialEq, Eq)]
struct ProjectContainer {
    id: String,
    service: String,
    running: bool,
    healthy: bool,
}

fn parse_ps(stdout: &str) -> Vec<ProjectContainer> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut columns = line.splitn(3, '\t');
            let id = columns.next()?.trim();
            let service = columns.next()?.trim();
            let status = columns.next()?.trim();
            if id.is_empty() {
                return None;
            }
            let running = status.starts_with("Up");
            let healthy =
                running && !status.contains("(unhealthy)") && !status.contains("health: starting");
            Some(ProjectContainer {
                id: id.to_string(),
                service: service.to_string(),
                running,
                healthy,
            })
        })
        .collect()
}

pub struct ComposeBackend {
    cli: DockerCli,
    options: BackendOptions,
    layout: StorageLayout,
    compose: OnceCell<ComposeCli>,
}

impl ComposeBackend {
    pub fn new(cli: DockerCli, options: BackendOptions, layout: StorageLayout) -> Self {
        Self {
            cli,
            options,
            layout,
            compose: OnceCell::new(),
        }
    }

    /// Project name for new deployments; existing ones use their handle
    fn project(&self) -> &str {
        &self.options.service_name
    }

    pub fn stack_params(&self, project: &str, params: &DeployParams) -> StackParams {
        StackParams {
            project: project.to_string(),
            replicas: params.replicas,
            port: params.port,
            image: params.image.clone(),
            env_file: params.env_file.clone(),
            container_port: self.options.container_port,
            streaming_paths: self.options.streaming_paths.clone(),
            proxy_config_dir: self.layout.proxy_dir().path().to_path_buf(),
        }
    }

    /// Render and write the stack definition and proxy config
    pub async fn write_artifacts(
        &self,
        project: &str,
        params: &DeployParams,
    ) -> Result<(), OrchestratorError> {
        let rendered = templates::render(&self.stack_params(project, params))?;
        self.layout.proxy_dir().create().await?;
        self.layout
            .proxy_config_file()
            .write_atomic(rendered.proxy.as_bytes())
            .await?;
        self.layout
            .stack_file()
            .write_atomic(rendered.stack.as_bytes())
            .await?;
        debug!(
            "Wrote compose artifacts to {} (digest {})",
            self.layout.base_dir.display(),
            rendered.digest()
        );
        Ok(())
    }

    async fn compose_cli(&self) -> Result<&ComposeCli, String> {
        self.compose
            .get_or_try_init(|| async {
                detect_compose(&self.cli)
                    .await
                    .ok_or_else(|| NO_COMPOSE.to_string())
            })
            .await
    }

    /// Program and leading arguments for a compose invocation
    async fn compose_command(
        &self,
        project: &str,
        with_file: bool,
    ) -> Result<(String, Vec<String>), String> {
        let compose = self.compose_cli().await?;
        let (program, mut args) = match compose {
            ComposeCli::Plugin => (self.cli.bin().to_string(), vec!["compose".to_string()]),
            ComposeCli::Standalone => ("docker-compose".to_string(), Vec::new()),
        };
        args.push("-p".to_string());
        args.push(project.to_string());
        if with_file {
            args.push("-f".to_string());
            args.push(self.layout.stack_file().path().to_string_lossy().into_owned());
        }
        Ok((program, args))
    }

    async fn compose(
        &self,
        project: &str,
        with_file: bool,
        extra: &[&str],
    ) -> Result<CommandOutput, String> {
        let (program, mut args) = self.compose_command(project, with_file).await?;
        args.extend(to_args(extra));
        self.cli
            .run_program(&program, args)
            .await
            .map_err(|e| e.to_string())
    }

    async fn up(&self, project: &str, replicas: u32) -> Result<(), String> {
        let scale = format!("{}={}", APP_SERVICE, replicas);
        let out = self
            .compose(project, true, &["up", "-d", "--remove-orphans", "--scale", scale.as_str()])
            .await?;
        if out.success {
            Ok(())
        } else {
            Err(out.diagnostic())
        }
    }

    async fn down(&self, project: &str, purge_data: bool) -> Result<CommandOutput, String> {
        let with_file = self.layout.stack_file().exists().await;
        let mut args = vec!["down", "--remove-orphans"];
        if purge_data {
            args.push("-v");
        }
        self.compose(project, with_file, &args).await
    }

    async fn containers(&self, project: &str) -> Result<Vec<ProjectContainer>, String> {
        let filter = format!("label={}={}", PROJECT_LABEL, project);
        let format = format!("{{{{.ID}}}}\t{{{{.Label \"{}\"}}}}\t{{{{.Status}}}}", SERVICE_LABEL);
        let out = self
            .cli
            .run(&["ps", "-a", "--filter", filter.as_str(), "--format", format.as_str()])
            .await
            .map_err(|e| e.to_string())?;
        if !out.success {
            return Err(out.diagnostic());
        }
        Ok(parse_ps(&out.stdout))
    }

    async fn wait_ready(
        &self,
        project: &str,
        replicas: u32,
        cancel: &CancellationToken,
    ) -> PollOutcome {
        poll_until(
            self.options.readiness_timeout,
            self.options.poll_interval,
            cancel,
            || async move {
                let Ok(containers) = self.containers(project).await else {
                    return false;
                };
                let app_running = containers
                    .iter()
                    .filter(|c| c.service == APP_SERVICE && c.running)
                    .count();
                let proxy_running = containers
                    .iter()
                    .any(|c| c.service == PROXY_SERVICE && c.running);
                debug!(
                    "Compose project {}: {}/{} app replicas running, proxy running: {}",
                    project,
                    app_running,
                    replicas,
                    proxy_running
                );
                app_running == replicas as usize && proxy_running
            },
        )
        .await
    }

    async fn reload_proxy(&self, project: &str) {
        let config = templates::proxy_config_in_container();
        match self
            .compose(
                project,
                true,
                &["exec", "-T", PROXY_SERVICE, "nginx", "-c", config.as_str(), "-s", "reload"],
            )
            .await
        {
            Ok(out) if out.success => debug!("Reloaded proxy configuration"),
            Ok(out) => warn!("Proxy reload failed: {}", out.diagnostic()),
            Err(e) => warn!("Proxy reload failed: {}", e),
        }
    }

    /// Best-effort teardown after a failed deploy
    async fn discard(&self, project: &str) {
        match self.down(project, false).await {
            Ok(out) if !out.success => warn!("Cleanup after failed deploy: {}", out.diagnostic()),
            Err(e) => warn!("Cleanup after failed deploy: {}", e),
            _ => {}
        }
        if let Err(e) = self.cleanup_artifacts().await {
            warn!("Failed to remove compose artifacts: {}", e);
        }
    }
}

#[async_trait]
impl Backend for ComposeBackend {
    fn mode(&self) -> Mode {
        Mode::Composed
    }

    async fn deploy(
        &self,
        params: &DeployParams,
        cancel: &CancellationToken,
    ) -> Result<BackendHandle, OrchestratorError> {
        let project = self.project();
        info!(
            "Deploying {} as compose project {} with {} replicas",
            params.image, project, params.replicas
        );

        self.compose_cli()
            .await
            .map_err(OrchestratorError::Deploy)?;
        self.write_artifacts(project, params).await?;

        if let Err(e) = self.up(project, params.replicas).await {
            self.discard(project).await;
            return Err(OrchestratorError::Deploy(format!("compose up failed: {}", e)));
        }

        let outcome = self.wait_ready(project, params.replicas, cancel).await;
        if !outcome.is_ready() {
            self.discard(project).await;
            return Err(OrchestratorError::Deploy(format!(
                "Compose project {} did not become ready ({:?})",
                project, outcome
            )));
        }

        info!("Compose project {} is up", project);
        Ok(BackendHandle::Composed {
            compose_project: project.to_string(),
        })
    }

    async fn rescale(
        &self,
        handle: &BackendHandle,
        params: &DeployParams,
        cancel: &CancellationToken,
    ) -> Result<BackendHandle, OrchestratorError> {
        let project = handle.reference();
        info!("Scaling compose project {} to {} replicas", project, params.replicas);

        self.write_artifacts(project, params).await?;
        self.up(project, params.replicas)
            .await
            .map_err(|e| OrchestratorError::Rescale(format!("compose up failed: {}", e)))?;

        let outcome = self.wait_ready(project, params.replicas, cancel).await;
        if !outcome.is_ready() {
            return Err(OrchestratorError::Rescale(format!(
                "Compose project {} did not reach {} replicas ({:?})",
                project, params.replicas, outcome
            )));
        }

        self.reload_proxy(project).await;
        Ok(handle.clone())
    }

    async fn terminate(
        &self,
        handle: &BackendHandle,
        purge_data: bool,
    ) -> Result<Termination, OrchestratorError> {
        let project = handle.reference();
        let before = self.inspect(handle).await;

        let out = match self.down(project, purge_data).await {
            Ok(out) => out,
            Err(e) if before.is_absent() => {
                debug!("Compose unavailable but nothing is running: {}", e);
                return Ok(Termination::AlreadyAbsent);
            }
            Err(e) => return Err(OrchestratorError::Terminate(e)),
        };

        if !out.success && !before.is_absent() {
            return Err(OrchestratorError::Terminate(format!(
                "compose down failed for {}: {}",
                project,
                out.diagnostic()
            )));
        }

        if before.is_absent() {
            info!("Compose project {} is already gone", project);
            Ok(Termination::AlreadyAbsent)
        } else {
            info!("Removed compose project {}", project);
            Ok(Termination::Removed)
        }
    }

    async fn inspect(&self, handle: &BackendHandle) -> BackendStatus {
        let containers = match self.containers(handle.reference()).await {
            Ok(containers) => containers,
            Err(e) => return BackendStatus::degraded(e),
        };

        let replicas: Vec<ReplicaStatus> = containers
            .iter()
            .filter(|c| c.service == APP_SERVICE)
            .map(|c| ReplicaStatus {
                id: c.id.clone(),
                running: c.running,
                healthy: c.healthy,
            })
            .collect();

        if replicas.is_empty() && !containers.is_empty() {
            return BackendStatus::degraded("proxy present without application replicas");
        }
        BackendStatus::new(replicas)
    }

    async fn fetch_logs(
        &self,
        handle: &BackendHandle,
        tail: usize,
        follow: bool,
    ) -> Result<LogStream, OrchestratorError> {
        let with_file = self.layout.stack_file().exists().await;
        let (program, mut args) = self
            .compose_command(handle.reference(), with_file)
            .await
            .map_err(OrchestratorError::Internal)?;
        args.push("logs".to_string());
        args.push("--tail".to_string());
        args.push(tail.to_string());
        if follow {
            args.push("--follow".to_string());
        }
        args.push(APP_SERVICE.to_string());
        self.cli.stream(Some(&program), args).await
    }

    async fn cleanup_artifacts(&self) -> Result<(), OrchestratorError> {
        self.layout.stack_file().delete().await?;
        self.layout.proxy_config_file().delete().await?;
        Ok(())
    }
}
