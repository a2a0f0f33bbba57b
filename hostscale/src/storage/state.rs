//! Persisted deployment descriptor

use tracing::{debug, info, warn};

use crate::errors::OrchestratorError;
use crate::filesys::file::File;
use crate::models::deployment::{BackendStatus, DeploymentDescriptor};

/// Single-record store for the active deployment.
///
/// There is no cross-process locking; two operators racing on the same host
/// can still clobber each other.
#[derive(Debug, Clone)]
pub struct StateStore {
    file: File,
}

impl StateStore {
    pub fn new(file: File) -> Self {
        Self { file }
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    /// Load the descriptor, `None` when nothing is recorded
    pub async fn load(&self) -> Result<Option<DeploymentDescriptor>, OrchestratorError> {
        let Some(contents) = self.file.read_string_opt().await? else {
            return Ok(None);
        };

        let descriptor: DeploymentDescriptor = serde_json::from_str(&contents).map_err(|e| {
            OrchestratorError::StorageError(format!(
                "Corrupt state file {}: {}",
                self.file.path().display(),
                e
            ))
        })?;
        descriptor.validate()?;
        Ok(Some(descriptor))
    }

    /// Replace the stored record
    pub async fn save(&self, descriptor: &DeploymentDescriptor) -> Result<(), OrchestratorError> {
        descriptor.validate()?;
        self.file.write_json(descriptor).await?;
        debug!(
            "Saved {} deployment ({} replicas) to {}",
            descriptor.mode(),
            descriptor.replicas,
            self.file.path().display()
        );
        Ok(())
    }

    /// Remove the stored record
    pub async fn delete(&self) -> Result<(), OrchestratorError> {
        self.file.delete().await
    }

    /// Drop the record if the backend no longer has anything for it.
    ///
    /// Returns true when the record was removed. Degraded statuses never
    /// trigger a removal.
    pub async fn reconcile(&self, live: &BackendStatus) -> Result<bool, OrchestratorError> {
        if let Some(reason) = &live.degraded {
            warn!("Skipping reconciliation, backend status is degraded: {}", reason);
            return Ok(false);
        }
        if !live.is_absent() {
            return Ok(false);
        }

        info!("No live resources match the recorded deployment, clearing stale state");
        self.delete().await?;
        Ok(true)
    }
}
