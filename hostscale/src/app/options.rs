//! Engine configuration options

use std::time::Duration;

use crate::deploy::BackendOptions;
use crate::logs::LogOptions;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;

/// Options the orchestration engine runs with
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Storage layout paths
    pub layout: StorageLayout,

    /// Path probed on the published port after deploy and scale
    pub health_path: String,

    /// Budget for the health gate
    pub health_timeout: Duration,

    /// Delay between health probes
    pub health_poll_interval: Duration,

    /// Docker executable
    pub docker_bin: String,

    /// Options shared by every backend
    pub backend: BackendOptions,
}

impl EngineOptions {
    pub fn from_settings(settings: &Settings, layout: StorageLayout) -> Self {
        Self {
            layout,
            health_path: settings.health_path.clone(),
            health_timeout: Duration::from_secs(settings.health_timeout_secs),
            health_poll_interval: Duration::from_millis(settings.health_poll_interval_ms),
            docker_bin: settings.docker_bin.clone(),
            backend: BackendOptions {
                service_name: settings.service_name.clone(),
                container_port: settings.container_port,
                readiness_timeout: Duration::from_secs(settings.readiness_timeout_secs),
                poll_interval: Duration::from_millis(settings.health_poll_interval_ms),
                streaming_paths: settings.streaming_paths.clone(),
                swarm_advertise_addr: settings.swarm_advertise_addr.clone(),
            },
        }
    }
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::from_settings(&Settings::default(), StorageLayout::default())
    }
}

/// Logging options derived from settings
pub fn log_options(settings: &Settings, layout: &StorageLayout) -> LogOptions {
    LogOptions {
        log_level: settings.log_level.clone(),
        stderr: true,
        log_dir: settings
            .log_to_file
            .then(|| layout.logs_dir().path().to_path_buf()),
        json_format: settings.json_logs,
    }
}
