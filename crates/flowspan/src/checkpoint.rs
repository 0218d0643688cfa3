//! The durable checkpoint model.
//!
//! A checkpoint is everything needed to resume a flow after a crash: why it
//! is suspended, its frozen user state, its session table, its error state,
//! and the deduplication facts that must become durable together with it.
//! Between any two suspension points the engine can be killed, restarted
//! from the last committed checkpoint, and resumed without observable
//! divergence.

use std::collections::BTreeMap;

use nonempty::NonEmpty;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::FlowError;
use crate::flow::{FlowId, InvocationContext, SuspendReason};
use crate::session::{DedupHandler, DedupId, SessionId, SessionState};

/// Execution phase of a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FlowState {
    /// Created but user code has not run yet.
    Unstarted {
        /// The start arguments.
        args: Value,
    },
    /// Running, suspended at a well-defined point.
    Started {
        /// Why the flow is suspended.
        suspension: SuspendReason,
        /// The flow's frozen user state, restored on resume.
        frozen_stack: Value,
    },
    /// The flow has produced its outcome.
    Finished {
        /// The orderly result, if the flow did not error.
        result: Option<Value>,
    },
}

/// Session table and commit counter.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CheckpointState {
    /// All sessions this flow owns, by our session id.
    pub sessions: BTreeMap<SessionId, SessionState>,
    /// How many sessions this flow has ever opened. Session ids derive from
    /// `(flow id, ordinal)`, so this must survive closes for a replayed step
    /// to land on the same ids.
    pub sessions_created: u64,
    /// Strictly monotone commit counter; the version for optimistic-replace
    /// upserts in the checkpoint store.
    pub num_commits: u64,
}

/// Whether the flow has errored, and how far propagation has advanced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ErrorState {
    /// No errors recorded.
    Clean,
    /// One or more errors recorded.
    Errored {
        /// The errors, in the order they were raised.
        errors: NonEmpty<FlowError>,
        /// Errors below this index have been propagated and are never
        /// retransmitted on the same session. Never decreases.
        propagated_index: usize,
        /// Whether the engine has been told to propagate.
        propagating: bool,
    },
}

impl ErrorState {
    /// Returns `true` if any error has been recorded.
    pub fn is_errored(&self) -> bool {
        matches!(self, ErrorState::Errored { .. })
    }

    /// Append an error, transitioning from `Clean` if necessary.
    pub fn record(&mut self, error: FlowError) {
        match self {
            ErrorState::Clean => {
                *self = ErrorState::Errored {
                    errors: NonEmpty::new(error),
                    propagated_index: 0,
                    propagating: false,
                };
            }
            ErrorState::Errored { errors, .. } => errors.push(error),
        }
    }
}

/// Operator-visible status of a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CheckpointStatus {
    /// Eligible to run.
    Runnable,
    /// Parked under flow-hospital supervision.
    Hospitalized,
    /// Paused by an operator or hospital command.
    Paused,
    /// Finished with an orderly result.
    Completed,
    /// Finished with errors.
    Failed,
    /// Removed by an explicit kill.
    Killed,
}

impl CheckpointStatus {
    /// Returns `true` for statuses that will never run again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CheckpointStatus::Completed | CheckpointStatus::Failed | CheckpointStatus::Killed
        )
    }
}

/// The durable unit: one flow's complete recoverable snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// The flow this checkpoint belongs to.
    pub id: FlowId,
    /// Who started the flow, when, and with what arguments.
    pub invocation_context: InvocationContext,
    /// Execution phase.
    pub flow_state: FlowState,
    /// Session table and commit counter.
    pub checkpoint_state: CheckpointState,
    /// Error record.
    pub error_state: ErrorState,
    /// Operator-visible status.
    pub status: CheckpointStatus,
    /// Deduplication identities of inbound messages consumed since the last
    /// commit. Persisted to the durable dedup log in the same transaction as
    /// this checkpoint, then cleared.
    pub pending_dedup_facts: Vec<DedupId>,
}

impl Checkpoint {
    /// Build the initial checkpoint for a freshly created flow.
    pub fn unstarted(id: FlowId, invocation_context: InvocationContext) -> Self {
        let args = invocation_context.args.clone();
        Self {
            id,
            invocation_context,
            flow_state: FlowState::Unstarted { args },
            checkpoint_state: CheckpointState::default(),
            error_state: ErrorState::Clean,
            status: CheckpointStatus::Runnable,
            pending_dedup_facts: Vec::new(),
        }
    }

    /// Look up a session by our session id.
    pub fn session(&self, id: SessionId) -> Option<&SessionState> {
        self.checkpoint_state.sessions.get(&id)
    }

    /// The suspension reason, when the flow is `Started`.
    pub fn suspension(&self) -> Option<&SuspendReason> {
        match &self.flow_state {
            FlowState::Started { suspension, .. } => Some(suspension),
            _ => None,
        }
    }

    /// Every session id this flow owns.
    pub fn session_ids(&self) -> Vec<SessionId> {
        self.checkpoint_state.sessions.keys().copied().collect()
    }
}

/// The outcome of a finished flow, retrievable by `client_id` after removal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FlowOutcome {
    /// The flow finished normally.
    OrderlyFinish(Value),
    /// The flow finished with errors.
    ErrorFinish(Vec<FlowError>),
}

/// The transition layer's full view of one flow.
///
/// The checkpoint is the durable part; `removed` tracks whether the terminal
/// teardown has already executed. A removed flow can linger in memory while
/// still-initiating sessions hold unpropagated errors open.
#[derive(Debug, Clone, PartialEq)]
pub struct MachineState {
    /// The flow's checkpoint.
    pub checkpoint: Checkpoint,
    /// Whether `RemoveFlow` has already been emitted for this flow.
    pub removed: bool,
    /// Ack tokens for deliveries consumed since the last commit. Runtime
    /// only: after a restart the list is empty and the bus redelivers, with
    /// the durable dedup log suppressing the replays.
    pub pending_acks: Vec<DedupHandler>,
}

impl MachineState {
    /// Wrap a checkpoint loaded from the store or freshly created.
    pub fn new(checkpoint: Checkpoint) -> Self {
        Self {
            checkpoint,
            removed: false,
            pending_acks: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FlowException;
    use crate::flow::FlowOrigin;
    use serde_json::json;
    use time::OffsetDateTime;

    fn context() -> InvocationContext {
        InvocationContext {
            origin: FlowOrigin::Client,
            flow_class: "quote".into(),
            started_at: OffsetDateTime::UNIX_EPOCH,
            args: json!({"symbol": "XAU"}),
            client_id: None,
        }
    }

    #[test]
    fn unstarted_checkpoint_shape() {
        let id = FlowId::random();
        let cp = Checkpoint::unstarted(id, context());

        assert_eq!(cp.id, id);
        assert_eq!(cp.status, CheckpointStatus::Runnable);
        assert_eq!(cp.checkpoint_state.num_commits, 0);
        assert!(matches!(cp.flow_state, FlowState::Unstarted { .. }));
        assert!(cp.pending_dedup_facts.is_empty());
    }

    #[test]
    fn error_state_accumulates() {
        let mut state = ErrorState::Clean;
        assert!(!state.is_errored());

        state.record(FlowError::user(1, FlowException::new("first")));
        state.record(FlowError::internal(2, "second"));

        match state {
            ErrorState::Errored {
                errors,
                propagated_index,
                propagating,
            } => {
                assert_eq!(errors.len(), 2);
                assert_eq!(propagated_index, 0);
                assert!(!propagating);
            }
            ErrorState::Clean => panic!("expected errored state"),
        }
    }

    #[test]
    fn checkpoint_round_trips_through_json() {
        let mut cp = Checkpoint::unstarted(FlowId::random(), context());
        cp.flow_state = FlowState::Started {
            suspension: SuspendReason::ReceiveFrom(vec![SessionId::from(3)]),
            frozen_stack: json!({"counter": 2}),
        };
        cp.checkpoint_state.num_commits = 4;
        cp.error_state
            .record(FlowError::user(8, FlowException::new("boom")));
        cp.pending_dedup_facts.push(DedupId::Error {
            error_id: 8,
            source_session_id: SessionId::from(3),
        });

        let json = serde_json::to_value(&cp).unwrap();
        let back: Checkpoint = serde_json::from_value(json).unwrap();
        assert_eq!(back, cp);
    }

    #[test]
    fn terminal_statuses() {
        assert!(!CheckpointStatus::Runnable.is_terminal());
        assert!(!CheckpointStatus::Hospitalized.is_terminal());
        assert!(!CheckpointStatus::Paused.is_terminal());
        assert!(CheckpointStatus::Completed.is_terminal());
        assert!(CheckpointStatus::Failed.is_terminal());
        assert!(CheckpointStatus::Killed.is_terminal());
    }
}
