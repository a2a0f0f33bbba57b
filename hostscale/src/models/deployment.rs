//! Deployment models

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::OrchestratorError;

/// Concrete deployment backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Single container via `docker run`
    Direct,

    /// Swarm service with built-in load balancing
    Clustered,

    /// Compose stack behind an nginx proxy
    Composed,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Direct => "direct",
            Mode::Clustered => "clustered",
            Mode::Composed => "composed",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "direct" | "docker" => Ok(Mode::Direct),
            "clustered" | "swarm" => Ok(Mode::Clustered),
            "composed" | "compose" => Ok(Mode::Composed),
            _ => Err(OrchestratorError::ConfigError(format!("Invalid mode: {}", s))),
        }
    }
}

/// Mode requested by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModeRequest {
    #[default]
    Auto,
    Explicit(Mode),
}

impl FromStr for ModeRequest {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("auto") {
            return Ok(ModeRequest::Auto);
        }
        s.parse().map(ModeRequest::Explicit)
    }
}

/// Why a mode was picked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModeRationale {
    Explicit,
    SingleReplica,
    ClusterAvailable,
    ClusterUnavailable,
}

/// Resolved mode for one start invocation; never persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ModeDecision {
    pub mode: Mode,
    pub rationale: ModeRationale,
}

/// Identifier(s) a backend hands back for its resources.
///
/// The variant doubles as the deployment mode, so the two can never be
/// written separately.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum BackendHandle {
    Direct {
        container_id: String,
    },
    Clustered {
        service_name: String,
        service_id: String,
    },
    Composed {
        compose_project: String,
    },
}

impl BackendHandle {
    pub fn mode(&self) -> Mode {
        match self {
            BackendHandle::Direct { .. } => Mode::Direct,
            BackendHandle::Clustered { .. } => Mode::Clustered,
            BackendHandle::Composed { .. } => Mode::Composed,
        }
    }

    /// Reference passed to the backend tooling
    pub fn reference(&self) -> &str {
        match self {
            BackendHandle::Direct { container_id } => container_id,
            BackendHandle::Clustered { service_name, .. } => service_name,
            BackendHandle::Composed { compose_project } => compose_project,
        }
    }
}

/// Parameters a backend needs to create a deployment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployParams {
    pub replicas: u32,
    pub port: u16,
    pub image: String,
    pub env_file: Option<PathBuf>,
}

/// The single persisted record of the active deployment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentDescriptor {
    /// Mode tag plus backend-specific identifiers
    #[serde(flatten)]
    pub handle: BackendHandle,

    pub replicas: u32,

    pub port: u16,

    pub image: String,

    #[serde(default)]
    pub env_file: Option<PathBuf>,

    pub started_at: DateTime<Utc>,
}

impl DeploymentDescriptor {
    /// Build a descriptor, enforcing the replica invariants
    pub fn new(
        handle: BackendHandle,
        params: &DeployParams,
        started_at: DateTime<Utc>,
    ) -> Result<Self, OrchestratorError> {
        let descriptor = Self {
            handle,
            replicas: params.replicas,
            port: params.port,
            image: params.image.clone(),
            env_file: params.env_file.clone(),
            started_at,
        };
        descriptor.validate()?;
        Ok(descriptor)
    }

    pub fn mode(&self) -> Mode {
        self.handle.mode()
    }

    pub fn validate(&self) -> Result<(), OrchestratorError> {
        if self.replicas == 0 {
            return Err(OrchestratorError::StorageError(
                "Replica count must be at least 1".to_string(),
            ));
        }
        if self.port == 0 {
            return Err(OrchestratorError::StorageError(
                "Port must be between 1 and 65535".to_string(),
            ));
        }
        if self.mode() == Mode::Direct && self.replicas != 1 {
            return Err(OrchestratorError::StorageError(format!(
                "Direct deployments run exactly one replica, got {}",
                self.replicas
            )));
        }
        Ok(())
    }

    /// Deployment parameters this descriptor was created with
    pub fn params(&self) -> DeployParams {
        DeployParams {
            replicas: self.replicas,
            port: self.port,
            image: self.image.clone(),
            env_file: self.env_file.clone(),
        }
    }

    /// Seconds since the deployment started
    pub fn uptime_secs(&self, now: DateTime<Utc>) -> u64 {
        (now - self.started_at).num_seconds().max(0) as u64
    }
}

/// Live state of a single replica
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaStatus {
    pub id: String,
    pub running: bool,
    pub healthy: bool,
}

/// Live view of a deployment as reported by its backend
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendStatus {
    pub replicas: Vec<ReplicaStatus>,

    /// Set when the backend could only be partially queried
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degraded: Option<String>,
}

impl BackendStatus {
    pub fn new(replicas: Vec<ReplicaStatus>) -> Self {
        Self {
            replicas,
            degraded: None,
        }
    }

    pub fn degraded(reason: impl Into<String>) -> Self {
        Self {
            replicas: Vec::new(),
            degraded: Some(reason.into()),
        }
    }

    pub fn running_count(&self) -> usize {
        self.replicas.iter().filter(|r| r.running).count()
    }

    pub fn healthy_count(&self) -> usize {
        self.replicas.iter().filter(|r| r.running && r.healthy).count()
    }

    /// True when the backend answered and nothing matching the handle exists
    pub fn is_absent(&self) -> bool {
        self.degraded.is_none() && self.replicas.is_empty()
    }
}

/// Result of tearing a deployment down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    Removed,
    AlreadyAbsent,
}
