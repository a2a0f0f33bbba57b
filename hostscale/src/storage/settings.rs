//! Settings file management

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::OrchestratorError;
use crate::filesys::file::File;
use crate::logs::LogLevel;

/// Orchestrator settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Emit JSON log lines
    #[serde(default)]
    pub json_logs: bool,

    /// Also write logs under the logs directory
    #[serde(default)]
    pub log_to_file: bool,

    /// Name used for containers, services and the compose project
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Port the application listens on inside its container
    #[serde(default = "default_container_port")]
    pub container_port: u16,

    /// Path of the liveness endpoint
    #[serde(default = "default_health_path")]
    pub health_path: String,

    /// Health probing budget in seconds
    #[serde(default = "default_health_timeout")]
    pub health_timeout_secs: u64,

    /// Delay between health probes in milliseconds
    #[serde(default = "default_health_poll_interval")]
    pub health_poll_interval_ms: u64,

    /// Backend readiness budget in seconds
    #[serde(default = "default_readiness_timeout")]
    pub readiness_timeout_secs: u64,

    /// Paths proxied as upgraded (websocket) connections in composed mode
    #[serde(default = "default_streaming_paths")]
    pub streaming_paths: Vec<String>,

    /// Address passed to `docker swarm init --advertise-addr`
    #[serde(default)]
    pub swarm_advertise_addr: Option<String>,

    /// Docker CLI binary
    #[serde(default = "default_docker_bin")]
    pub docker_bin: String,
}

fn default_service_name() -> String {
    "hostscale-app".to_string()
}

fn default_container_port() -> u16 {
    8000
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_health_timeout() -> u64 {
    30
}

fn default_health_poll_interval() -> u64 {
    1000
}

fn default_readiness_timeout() -> u64 {
    60
}

fn default_streaming_paths() -> Vec<String> {
    vec!["/ws".to_string()]
}

fn default_docker_bin() -> String {
    "docker".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            json_logs: false,
            log_to_file: false,
            service_name: default_service_name(),
            container_port: default_container_port(),
            health_path: default_health_path(),
            health_timeout_secs: default_health_timeout(),
            health_poll_interval_ms: default_health_poll_interval(),
            readiness_timeout_secs: default_readiness_timeout(),
            streaming_paths: default_streaming_paths(),
            swarm_advertise_addr: None,
            docker_bin: default_docker_bin(),
        }
    }
}

impl Settings {
    /// Load settings, falling back to defaults when the file is missing
    pub async fn load(settings_file: &File) -> Result<Self, OrchestratorError> {
        let Some(contents) = settings_file.read_string_opt().await? else {
            debug!("No settings file at {}, using defaults", settings_file.path().display());
            return Ok(Self::default());
        };

        let settings: Settings = serde_json::from_str(&contents).map_err(|e| {
            OrchestratorError::ConfigError(format!(
                "Invalid settings file {}: {}",
                settings_file.path().display(),
                e
            ))
        })?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), OrchestratorError> {
        if self.service_name.is_empty()
            || !self
                .service_name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(OrchestratorError::ConfigError(format!(
                "Invalid service name: {:?}",
                self.service_name
            )));
        }
        if self.container_port == 0 {
            return Err(OrchestratorError::ConfigError(
                "container_port must be between 1 and 65535".to_string(),
            ));
        }
        if !self.health_path.starts_with('/') {
            return Err(OrchestratorError::ConfigError(format!(
                "health_path must start with '/': {}",
                self.health_path
            )));
        }
        Ok(())
    }
}
