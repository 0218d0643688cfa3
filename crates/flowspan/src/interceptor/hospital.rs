//! Hospitalising interceptor.

use tokio::sync::mpsc;
use tracing::warn;

use crate::checkpoint::{CheckpointStatus, MachineState};
use crate::error::FlowFault;
use crate::event::Event;
use crate::flow::FlowId;
use crate::hospital::Admission;
use crate::transition::{Continuation, TransitionResult};

use super::{NextInterceptor, TransitionInterceptor};

/// Routes internal-error transitions into the hospital's supervision domain
/// instead of ordinary error propagation.
///
/// A user exception propagates to peers on its own; an internal fault parks
/// the flow as `Hospitalized` and hands it to the hospital, which may later
/// command a retry, a propagation, a pause, or a kill.
pub struct Hospitaliser {
    admissions: mpsc::UnboundedSender<Admission>,
}

impl Hospitaliser {
    /// Create a hospitaliser reporting admissions into `admissions`.
    pub fn new(admissions: mpsc::UnboundedSender<Admission>) -> Self {
        Self { admissions }
    }
}

impl TransitionInterceptor for Hospitaliser {
    fn intercept(
        &self,
        flow_id: FlowId,
        _prev: &MachineState,
        event: &Event,
        result: TransitionResult,
        next: NextInterceptor<'_>,
    ) -> TransitionResult {
        let hospitalize = match event {
            Event::Error { error } => match &error.fault {
                FlowFault::Internal { .. } => Some(error.clone()),
                FlowFault::User(_) => None,
            },
            _ => None,
        };

        let mut result = next(result);

        if let Some(error) = hospitalize {
            warn!(
                %flow_id,
                error_id = error.error_id,
                "Internal error; parking flow for the hospital"
            );
            result.state.checkpoint.status = CheckpointStatus::Hospitalized;
            result.continuation = Continuation::ProcessEvents;
            result.actions.clear();
            let _ = self.admissions.send(Admission { flow_id, error });
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::Checkpoint;
    use crate::error::{FlowError, FlowException};
    use crate::flow::{FlowOrigin, InvocationContext};
    use crate::interceptor::InterceptorChain;
    use serde_json::json;
    use std::sync::Arc;
    use time::OffsetDateTime;

    fn state() -> MachineState {
        MachineState::new(Checkpoint::unstarted(
            FlowId::random(),
            InvocationContext {
                origin: FlowOrigin::Client,
                flow_class: "quote".into(),
                started_at: OffsetDateTime::UNIX_EPOCH,
                args: json!({}),
                client_id: None,
            },
        ))
    }

    #[test]
    fn internal_errors_park_the_flow() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let chain = InterceptorChain::new(vec![Arc::new(Hospitaliser::new(tx)) as _]);
        let state = state();
        let flow_id = state.checkpoint.id;

        let mut errored = state.clone();
        errored
            .checkpoint
            .error_state
            .record(FlowError::internal(7, "store unreachable"));
        let result = TransitionResult {
            state: errored,
            actions: vec![],
            continuation: Continuation::ProcessEvents,
        };

        let out = chain.run(
            flow_id,
            &state,
            &Event::Error {
                error: FlowError::internal(7, "store unreachable"),
            },
            result,
        );

        assert_eq!(out.state.checkpoint.status, CheckpointStatus::Hospitalized);
        let admission = rx.try_recv().unwrap();
        assert_eq!(admission.flow_id, flow_id);
        assert_eq!(admission.error.error_id, 7);
    }

    #[test]
    fn user_errors_pass_through() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let chain = InterceptorChain::new(vec![Arc::new(Hospitaliser::new(tx)) as _]);
        let state = state();
        let flow_id = state.checkpoint.id;

        let result = TransitionResult {
            state: state.clone(),
            actions: vec![],
            continuation: Continuation::ProcessEvents,
        };
        let out = chain.run(
            flow_id,
            &state,
            &Event::Error {
                error: FlowError::user(9, FlowException::new("nope")),
            },
            result,
        );

        assert_eq!(out.state.checkpoint.status, CheckpointStatus::Runnable);
        assert!(rx.try_recv().is_err());
    }
}
