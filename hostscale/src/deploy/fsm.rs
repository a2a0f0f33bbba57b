//! Finite State Machine for the deployment lifecycle

use serde::{Deserialize, Serialize};

/// Lifecycle state of the managed deployment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    /// Nothing deployed
    Absent,

    /// Deploy and health gate in progress
    Starting,

    /// Deployed and recorded
    Running,

    /// Replica count change in progress
    Scaling,

    /// Teardown in progress
    Stopping,
}

/// Lifecycle event
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    /// Begin a start
    Start,

    /// Start finished and the descriptor was persisted
    Started,

    /// Start failed; nothing is recorded
    StartFailed(String),

    /// Begin a rescale
    Scale,

    /// Rescale finished
    Scaled,

    /// Rescale failed; the previous descriptor stays
    ScaleFailed(String),

    /// Begin a teardown
    Stop,

    /// Teardown finished and the descriptor was deleted
    Stopped,

    /// Teardown failed; the descriptor is retained
    StopFailed(String),

    /// Live resources vanished and the record was dropped
    Reconciled,
}

/// Deployment lifecycle FSM
#[derive(Debug, Clone)]
pub struct LifecycleFsm {
    state: LifecycleState,
    error: Option<String>,
}

impl LifecycleFsm {
    /// Create a new FSM with nothing deployed
    pub fn new() -> Self {
        Self::at(LifecycleState::Absent)
    }

    /// Resume from a known state
    pub fn at(state: LifecycleState) -> Self {
        Self { state, error: None }
    }

    /// FSM for whatever the state store currently holds
    pub fn observed(recorded: bool) -> Self {
        if recorded {
            Self::at(LifecycleState::Running)
        } else {
            Self::new()
        }
    }

    /// Get current state
    pub fn state(&self) -> &LifecycleState {
        &self.state
    }

    /// Error of the last failed step, if any
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Process an event and transition state
    pub fn process(&mut self, event: LifecycleEvent) -> Result<(), String> {
        let new_state = match (&self.state, &event) {
            // From Absent
            (LifecycleState::Absent, LifecycleEvent::Start) => {
                self.error = None;
                LifecycleState::Starting
            }

            // From Starting
            (LifecycleState::Starting, LifecycleEvent::Started) => LifecycleState::Running,
            (LifecycleState::Starting, LifecycleEvent::StartFailed(err)) => {
                self.error = Some(err.clone());
                LifecycleState::Absent
            }

            // From Running
            (LifecycleState::Running, LifecycleEvent::Scale) => {
                self.error = None;
                LifecycleState::Scaling
            }
            (LifecycleState::Running, LifecycleEvent::Stop) => {
                self.error = None;
                LifecycleState::Stopping
            }
            (LifecycleState::Running, LifecycleEvent::Reconciled) => LifecycleState::Absent,

            // From Scaling
            (LifecycleState::Scaling, LifecycleEvent::Scaled) => LifecycleState::Running,
            (LifecycleState::Scaling, LifecycleEvent::ScaleFailed(err)) => {
                self.error = Some(err.clone());
                LifecycleState::Running
            }

            // From Stopping
            (LifecycleState::Stopping, LifecycleEvent::Stopped) => LifecycleState::Absent,
            (LifecycleState::Stopping, LifecycleEvent::StopFailed(err)) => {
                self.error = Some(err.clone());
                LifecycleState::Running
            }

            // Invalid transitions
            (state, event) => {
                return Err(format!("Invalid transition: {:?} -> {:?}", state, event));
            }
        };

        self.state = new_state;
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.state == LifecycleState::Running
    }
}

impl Default for LifecycleFsm {
    fn default() -> Self {
        Self::new()
    }
}
