use uuid::Uuid;

use crate::domain::plan::Plan;

/// The six error kinds named in the core's error handling design. Network
/// and transient errors are retried locally with bounded backoff before
/// surfacing here; persistent failure degrades the owning component to
/// `stale` without tearing down the rest of the core.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("{source} is unreachable or stale")]
    ProviderUnavailable { source: String },

    #[error("optimizer could not satisfy a hard target, shortfall {shortfall_kwh:.3} kWh")]
    Infeasible {
        best_effort: Box<Plan>,
        shortfall_kwh: f64,
    },

    #[error("plan store detected inconsistency for box {box_id}")]
    CorruptState { box_id: String },

    #[error("command {command} failed after retries")]
    ActuationFailed { command: String },

    #[error("service shield is suspended, plan {plan_id} externally overridden")]
    Overridden { plan_id: Uuid },

    #[error("validation failed: {reason}")]
    Validation { reason: String },
}

impl From<crate::domain::plan::PlanError> for CoreError {
    fn from(e: crate::domain::plan::PlanError) -> Self {
        CoreError::Validation { reason: e.to_string() }
    }
}
