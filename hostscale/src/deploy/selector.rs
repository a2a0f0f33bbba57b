//! Deployment mode selection

use crate::models::deployment::{Mode, ModeDecision, ModeRationale, ModeRequest};

/// Pick the backend for a start request.
///
/// An explicit request is returned untouched even when it cannot work for
/// the replica count; validation happens later, during pre-flight.
pub fn select(replicas: u32, requested: ModeRequest, cluster_available: bool) -> ModeDecision {
    match requested {
        ModeRequest::Explicit(mode) => ModeDecision {
            mode,
            rationale: ModeRationale::Explicit,
        },
        ModeRequest::Auto if replicas == 1 => ModeDecision {
            mode: Mode::Direct,
            rationale: ModeRationale::SingleReplica,
        },
        ModeRequest::Auto if cluster_available => ModeDecision {
            mode: Mode::Clustered,
            rationale: ModeRationale::ClusterAvailable,
        },
        ModeRequest::Auto => ModeDecision {
            mode: Mode::Composed,
            rationale: ModeRationale::ClusterUnavailable,
        },
    }
}
