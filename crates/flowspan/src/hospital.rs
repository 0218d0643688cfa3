//! The flow hospital interface.
//!
//! Internally errored flows are parked rather than propagated: the node
//! admits them to a hospital, an external policy engine that decides what
//! happens next. The engine itself only knows how to carry out the
//! hospital's commands.

use async_trait::async_trait;
use tracing::warn;

use crate::error::FlowError;
use crate::flow::FlowId;

/// What a hospital can order for an admitted flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HospitalCommand {
    /// Discard in-memory progress and restart from the last committed
    /// checkpoint.
    RetryFromSafePoint,
    /// Give up on the flow: propagate its errors to peers and tear it down.
    StartErrorPropagation,
    /// Keep the flow parked for operator attention.
    Pause,
    /// Remove the flow immediately.
    Kill,
}

/// A flow handed over to the hospital.
#[derive(Debug, Clone)]
pub struct Admission {
    /// The errored flow.
    pub flow_id: FlowId,
    /// The error that caused the admission.
    pub error: FlowError,
}

/// External supervision policy for errored flows.
///
/// `admit` may return an immediate command; returning `None` leaves the
/// flow hospitalized until a later
/// [`FlowNode::deliver_hospital_command`](crate::FlowNode::deliver_hospital_command).
#[async_trait]
pub trait FlowHospital: Send + Sync {
    /// Take charge of an errored flow.
    async fn admit(&self, admission: Admission) -> Option<HospitalCommand>;
}

/// Default hospital: keeps every patient parked and logs the admission.
///
/// Operators (or tests) issue commands explicitly through the node.
#[derive(Debug, Default)]
pub struct KeepUnderObservation;

#[async_trait]
impl FlowHospital for KeepUnderObservation {
    async fn admit(&self, admission: Admission) -> Option<HospitalCommand> {
        warn!(
            flow_id = %admission.flow_id,
            error_id = admission.error.error_id,
            "Flow admitted to hospital; awaiting operator command"
        );
        None
    }
}
