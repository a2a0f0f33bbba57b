//! Error types for hostscale

use thiserror::Error;

/// Main error type for the orchestration core
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Pre-flight check failed: {0}")]
    Preflight(String),

    #[error("Deployment error: {0}")]
    Deploy(String),

    #[error("Rescale error: {0}")]
    Rescale(String),

    #[error("Terminate error: {0}")]
    Terminate(String),

    #[error("Health check failed: {0}")]
    HealthCheckFailed(String),

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("A deployment is already running: {0}")]
    AlreadyRunning(String),

    #[error("No deployment is running")]
    NotRunning,

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    /// Stable identifier used in result envelopes
    pub fn kind(&self) -> &'static str {
        match self {
            OrchestratorError::IoError(_) => "io",
            OrchestratorError::JsonError(_) => "json",
            OrchestratorError::YamlError(_) => "yaml",
            OrchestratorError::HttpError(_) => "http",
            OrchestratorError::Preflight(_) => "preflight",
            OrchestratorError::Deploy(_) => "deploy",
            OrchestratorError::Rescale(_) => "rescale",
            OrchestratorError::Terminate(_) => "terminate",
            OrchestratorError::HealthCheckFailed(_) => "health_check_failed",
            OrchestratorError::UnsupportedOperation(_) => "unsupported_operation",
            OrchestratorError::AlreadyRunning(_) => "already_running",
            OrchestratorError::NotRunning => "not_running",
            OrchestratorError::StorageError(_) => "storage",
            OrchestratorError::ConfigError(_) => "config",
            OrchestratorError::Internal(_) => "internal",
        }
    }
}

impl From<anyhow::Error> for OrchestratorError {
    fn from(err: anyhow::Error) -> Self {
        OrchestratorError::Internal(err.to_string())
    }
}
