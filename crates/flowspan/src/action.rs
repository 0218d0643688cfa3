//! The sealed action vocabulary.
//!
//! Actions are the only way a transition affects the world. The transition
//! function emits them as data; the [`ActionExecutor`](crate::ActionExecutor)
//! interprets them strictly in order, never reordering, batching, or
//! dropping. Within one list, exactly one `CreateTransaction` precedes any
//! persistence action and exactly one `CommitTransaction` or
//! `RollbackTransaction` terminates the transactional span.

use serde_json::Value;
use time::OffsetDateTime;

use crate::checkpoint::Checkpoint;
use crate::error::FlowError;
use crate::flow::FlowId;
use crate::session::{
    DedupHandler, DedupId, ErrorSessionMessage, ExistingSessionMessage, InitialSessionMessage,
    PartyName, SessionId,
};

/// An initiated peer session targeted by error propagation.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorTarget {
    /// The peer party.
    pub peer: PartyName,
    /// The peer-side session id the error messages are addressed to.
    pub peer_session_id: SessionId,
    /// Our side of the session; part of the error dedup identity.
    pub our_session_id: SessionId,
}

/// Why a flow is being removed from the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum RemovalReason {
    /// The flow finished normally.
    OrderlyFinish(Value),
    /// The flow finished with errors.
    ErrorFinish(Vec<FlowError>),
    /// An explicit kill.
    Killed,
}

/// A side effect requested by a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Open the transactional span for the persistence actions that follow.
    CreateTransaction,
    /// Commit the open span; everything persisted since `CreateTransaction`
    /// becomes durable atomically.
    CommitTransaction,
    /// Abandon the open span.
    RollbackTransaction,
    /// Upsert the flow's checkpoint, keyed by `(id, num_commits)`. The store
    /// rejects the write when `num_commits` is not strictly greater than the
    /// stored value.
    PersistCheckpoint {
        /// The flow.
        id: FlowId,
        /// The checkpoint to write.
        checkpoint: Box<Checkpoint>,
        /// `false` only for the very first persist of a flow.
        is_update: bool,
    },
    /// Delete the checkpoint row. Result retrieval rows are kept iff
    /// `may_have_persistent_results`.
    RemoveCheckpoint {
        /// The flow.
        id: FlowId,
        /// Keep result rows for external retrieval.
        may_have_persistent_results: bool,
    },
    /// Insert dedup facts into the durable log. A conflict means the message
    /// was already delivered, which is not an error.
    PersistDeduplicationFacts {
        /// The facts to insert.
        facts: Vec<DedupId>,
    },
    /// Acknowledge consumed deliveries to the bus. Runs only after commit;
    /// loss here is tolerable because the dedup log suppresses replays.
    AcknowledgeMessages {
        /// Handlers to acknowledge.
        handlers: Vec<DedupHandler>,
    },
    /// Publish a session-initiating message.
    SendInitial {
        /// The peer to deliver to.
        destination: PartyName,
        /// The initiating message.
        message: InitialSessionMessage,
        /// Sender-side dedup identity; the peer's bus suppresses replays.
        dedup_id: DedupId,
    },
    /// Publish a message on an established session.
    SendExisting {
        /// The peer to deliver to.
        peer: PartyName,
        /// The message.
        message: ExistingSessionMessage,
        /// Sender-side dedup identity.
        dedup_id: DedupId,
    },
    /// Emit each error message to each listed initiated session.
    PropagateErrors {
        /// The errors to propagate, in raise order.
        messages: Vec<ErrorSessionMessage>,
        /// The sessions to error.
        sessions: Vec<ErrorTarget>,
        /// The erroring flow, for diagnostics.
        sender: FlowId,
    },
    /// Arm the flow's overall timeout. Idempotent per flow.
    ScheduleFlowTimeout {
        /// The flow.
        flow_id: FlowId,
        /// When the timeout fires.
        at: OffsetDateTime,
    },
    /// Disarm the flow's overall timeout. Idempotent per flow.
    CancelFlowTimeout {
        /// The flow.
        flow_id: FlowId,
    },
    /// Arm the wake-up for a sleeping flow. Idempotent per flow.
    SleepUntil {
        /// The flow.
        flow_id: FlowId,
        /// When to wake it.
        until: OffsetDateTime,
    },
    /// Hand an operation to the async-op runner. The runner deduplicates by
    /// `dedup_id`, so replayed submissions collapse; completion returns as an
    /// [`Event::AsyncOpCompleted`](crate::Event::AsyncOpCompleted).
    ExecuteAsyncOperation {
        /// The flow awaiting the result.
        flow_id: FlowId,
        /// Deduplication key, stable across replays.
        dedup_id: String,
        /// Opaque operation descriptor.
        operation: Value,
    },
    /// Release the advisory locks held on state this flow consumed.
    ReleaseSoftLocks {
        /// The flow.
        flow_id: FlowId,
    },
    /// Drop the node-level `session id -> flow` routing entries.
    RemoveSessionBindings {
        /// The sessions to unbind.
        session_ids: Vec<SessionId>,
    },
    /// Retire the flow from the scheduler, surfacing its outcome.
    RemoveFlow {
        /// The flow.
        flow_id: FlowId,
        /// Why it is being removed.
        reason: RemovalReason,
    },
    /// Discard the fiber and restart the flow from its last committed
    /// checkpoint.
    RetryFlowFromSafePoint {
        /// The flow.
        flow_id: FlowId,
    },
}

impl Action {
    /// Short tag for logs.
    pub fn tag(&self) -> &'static str {
        match self {
            Action::CreateTransaction => "create_transaction",
            Action::CommitTransaction => "commit_transaction",
            Action::RollbackTransaction => "rollback_transaction",
            Action::PersistCheckpoint { .. } => "persist_checkpoint",
            Action::RemoveCheckpoint { .. } => "remove_checkpoint",
            Action::PersistDeduplicationFacts { .. } => "persist_dedup_facts",
            Action::AcknowledgeMessages { .. } => "acknowledge_messages",
            Action::SendInitial { .. } => "send_initial",
            Action::SendExisting { .. } => "send_existing",
            Action::PropagateErrors { .. } => "propagate_errors",
            Action::ScheduleFlowTimeout { .. } => "schedule_flow_timeout",
            Action::CancelFlowTimeout { .. } => "cancel_flow_timeout",
            Action::SleepUntil { .. } => "sleep_until",
            Action::ExecuteAsyncOperation { .. } => "execute_async_operation",
            Action::ReleaseSoftLocks { .. } => "release_soft_locks",
            Action::RemoveSessionBindings { .. } => "remove_session_bindings",
            Action::RemoveFlow { .. } => "remove_flow",
            Action::RetryFlowFromSafePoint { .. } => "retry_flow_from_safe_point",
        }
    }

    /// Whether this action must run inside the transactional span.
    pub fn requires_transaction(&self) -> bool {
        matches!(
            self,
            Action::PersistCheckpoint { .. }
                | Action::RemoveCheckpoint { .. }
                | Action::PersistDeduplicationFacts { .. }
        )
    }
}
