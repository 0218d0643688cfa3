//! Core flow traits and identifiers.

use std::time::Duration;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::FlowException;
use crate::session::{PartyName, SessionId};

/// A flow instance identifier.
///
/// Assigned once at flow creation and immutable thereafter. The checkpoint
/// store holds at most one checkpoint per `FlowId`.
///
/// # Example
///
/// ```
/// use flowspan::FlowId;
///
/// let id = FlowId::random();
/// assert_ne!(id, FlowId::random());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlowId(Uuid);

impl FlowId {
    /// Assign a fresh flow identifier.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Borrow the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl std::fmt::Display for FlowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl From<Uuid> for FlowId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// Who started a flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowOrigin {
    /// Started locally through [`FlowNode::start_flow`](crate::FlowNode::start_flow).
    Client,
    /// Started by a peer's session-initiating message.
    Peer {
        /// The initiating party.
        party: PartyName,
        /// Our side of the session the initiator opened.
        session_id: SessionId,
    },
}

/// Immutable record of how a flow was invoked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationContext {
    /// Who started the flow.
    pub origin: FlowOrigin,
    /// Registered class name of the flow program.
    pub flow_class: String,
    /// When the flow was created.
    pub started_at: OffsetDateTime,
    /// Arguments the flow was started with.
    pub args: Value,
    /// Client correlation key for external result retrieval.
    ///
    /// When set, the flow's checkpoint row outlives removal so the outcome
    /// can be fetched by this id.
    pub client_id: Option<String>,
}

/// Why a flow is suspended, recorded in its checkpoint.
///
/// The suspension reason is what the engine consults to decide whether an
/// inbound event can resume the flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SuspendReason {
    /// Awaiting one inbound message from each listed session.
    ReceiveFrom(Vec<SessionId>),
    /// Sleeping until the given instant.
    Sleep {
        /// When the flow should wake.
        until: OffsetDateTime,
    },
    /// Awaiting completion of an asynchronous operation.
    AwaitAsyncOp {
        /// Deduplication key for the operation; resubmission after a crash
        /// must reuse it so the runner collapses duplicates.
        dedup_id: String,
        /// Opaque operation descriptor handed to the runner.
        operation: Value,
    },
    /// Explicit checkpoint: persist, then resume immediately.
    Checkpoint,
}

/// The value a flow step is resumed with.
#[derive(Debug, Clone, PartialEq)]
pub enum ResumeValue {
    /// First resumption: the flow's start arguments, plus the inbound session
    /// for peer-initiated flows.
    Start {
        /// Invocation arguments.
        args: Value,
        /// The already-initiated session when a peer started this flow.
        initiated_session: Option<SessionId>,
    },
    /// One message per awaited session, oldest first, in the order the
    /// sessions were awaited.
    Messages(Vec<(SessionId, Value)>),
    /// An awaited session delivered an error instead of data.
    SessionError {
        /// The session that errored.
        session_id: SessionId,
        /// The exception to surface to user code.
        exception: FlowException,
    },
    /// An awaited session was closed by the peer before delivering data.
    SessionEnded {
        /// The session that ended.
        session_id: SessionId,
    },
    /// The awaited asynchronous operation completed.
    AsyncOpResult(Value),
    /// The requested sleep elapsed.
    SleepFinished,
    /// The explicit checkpoint committed.
    Checkpointed,
}

/// What a flow step decided to do next.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Yield at a suspension point; the engine checkpoints before resuming.
    Suspend(SuspendReason),
    /// The flow is done; the value is its orderly result.
    Finish(Value),
}

/// Why a flow step failed.
#[derive(Debug, Clone, PartialEq)]
pub enum StepError {
    /// An uncaught user exception. Becomes a [`FlowError`](crate::FlowError)
    /// and propagates to live peer sessions.
    Exception(FlowException),
    /// Force hospitalisation even from an otherwise-recoverable context.
    /// Nothing propagates; the flow parks under hospital supervision.
    Hospitalize(String),
}

impl From<FlowException> for StepError {
    fn from(exception: FlowException) -> Self {
        StepError::Exception(exception)
    }
}

/// A session operation requested by a flow step.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionRequest {
    /// Open a session to a peer. The payload rides in the initiating message.
    Initiate {
        /// Engine-assigned id for the new session.
        session_id: SessionId,
        /// The peer to open the session to.
        destination: PartyName,
        /// Flow class the peer should instantiate.
        flow_class: String,
        /// First payload, delivered as part of initiation.
        payload: Value,
    },
    /// Send a data payload on an open (or still-initiating) session.
    Send {
        /// The session to send on.
        session_id: SessionId,
        /// The payload.
        payload: Value,
    },
    /// Close our side of a session.
    Close {
        /// The session to close.
        session_id: SessionId,
    },
}

/// Session operations collected during one flow step.
///
/// `FlowIo` is a pure recorder: nothing is sent until the step's suspension
/// commits. Requests are applied to the session table and turned into send
/// actions by the transition layer, preserving request order.
#[derive(Debug)]
pub struct FlowIo {
    flow_id: FlowId,
    session_count: u64,
    requests: Vec<SessionRequest>,
}

impl FlowIo {
    /// Create a recorder for a flow that already owns `session_count` sessions.
    pub(crate) fn new(flow_id: FlowId, session_count: u64) -> Self {
        Self {
            flow_id,
            session_count,
            requests: Vec::new(),
        }
    }

    /// Open a session to `destination` running `flow_class`, delivering
    /// `payload` as part of initiation. Returns the new session's id.
    ///
    /// The id is derived deterministically from the flow id and the number of
    /// sessions the flow has opened, so a replayed step allocates the same id.
    pub fn initiate(
        &mut self,
        destination: PartyName,
        flow_class: impl Into<String>,
        payload: Value,
    ) -> SessionId {
        let session_id = SessionId::derive(&self.flow_id, self.session_count);
        self.session_count += 1;
        self.requests.push(SessionRequest::Initiate {
            session_id,
            destination,
            flow_class: flow_class.into(),
            payload,
        });
        session_id
    }

    /// Queue a data payload for `session_id`.
    pub fn send(&mut self, session_id: SessionId, payload: Value) {
        self.requests.push(SessionRequest::Send {
            session_id,
            payload,
        });
    }

    /// Close our side of `session_id`.
    pub fn close(&mut self, session_id: SessionId) {
        self.requests.push(SessionRequest::Close { session_id });
    }

    /// Consume the recorder into its ordered request list.
    pub(crate) fn into_requests(self) -> Vec<SessionRequest> {
        self.requests
    }
}

/// A suspendable flow program.
///
/// A flow is written as an explicit state machine: all local variables that
/// must survive a suspension live in [`Self::State`], which the engine
/// freezes into the checkpoint at every suspension point and restores on
/// resume. `step` is called with the value produced at the previous
/// suspension point and decides what to do next.
///
/// `step` must be deterministic: after a crash the engine re-runs the step
/// following the last committed checkpoint, and its sends must come out
/// byte-identical so the bus can suppress the duplicates.
///
/// # Example
///
/// ```ignore
/// struct PingFlow;
///
/// impl Flow for PingFlow {
///     type State = PingState;
///
///     const CLASS: &'static str = "ping";
///
///     fn step(
///         state: &mut PingState,
///         input: ResumeValue,
///         io: &mut FlowIo,
///     ) -> Result<StepOutcome, StepError> {
///         match input {
///             ResumeValue::Start { args, .. } => {
///                 let peer = PartyName::new(args["peer"].as_str().unwrap());
///                 let session = io.initiate(peer, "pong", json!("ping"));
///                 state.session = Some(session);
///                 Ok(StepOutcome::Suspend(SuspendReason::ReceiveFrom(vec![session])))
///             }
///             ResumeValue::Messages(messages) => {
///                 let (_, reply) = messages.into_iter().next().unwrap();
///                 Ok(StepOutcome::Finish(reply))
///             }
///             other => Err(FlowException::new(format!("unexpected resume: {other:?}")).into()),
///         }
///     }
/// }
/// ```
pub trait Flow: Send + Sync + 'static {
    /// Everything the flow needs to survive a suspension.
    ///
    /// Frozen to JSON in the checkpoint; must round-trip losslessly.
    type State: Serialize + DeserializeOwned + Default + Send;

    /// Stable class name, used by peers to instantiate this flow and by the
    /// node registry for routing. Must be stable across deployments.
    const CLASS: &'static str;

    /// Run the flow from one suspension point to the next.
    ///
    /// Returning `Err` raises an uncaught user exception: the flow enters
    /// error state and the exception propagates to live peer sessions.
    fn step(
        state: &mut Self::State,
        input: ResumeValue,
        io: &mut FlowIo,
    ) -> std::result::Result<StepOutcome, StepError>;

    /// Overall timeout for the flow, after which the engine retries it from
    /// the last committed checkpoint (not a cancellation).
    ///
    /// Default: no timeout.
    fn timeout() -> Option<Duration> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn flow_io_assigns_stable_session_ids() {
        let flow_id = FlowId::random();
        let mut first = FlowIo::new(flow_id, 0);
        let a = first.initiate(PartyName::new("acme"), "quote", json!(1));

        // A replayed step sees the same starting session count and must
        // derive the same id.
        let mut replay = FlowIo::new(flow_id, 0);
        let b = replay.initiate(PartyName::new("acme"), "quote", json!(1));
        assert_eq!(a, b);

        let c = replay.initiate(PartyName::new("acme"), "quote", json!(2));
        assert_ne!(b, c);
    }

    #[test]
    fn flow_io_preserves_request_order() {
        let mut io = FlowIo::new(FlowId::random(), 2);
        let existing = SessionId::derive(&FlowId::random(), 0);
        io.send(existing, json!("x"));
        let new_session = io.initiate(PartyName::new("bob"), "pong", json!("hello"));
        io.send(new_session, json!("y"));
        io.close(existing);

        let requests = io.into_requests();
        assert_eq!(requests.len(), 4);
        assert!(matches!(requests[0], SessionRequest::Send { .. }));
        assert!(matches!(requests[1], SessionRequest::Initiate { .. }));
        assert!(matches!(requests[2], SessionRequest::Send { .. }));
        assert!(matches!(requests[3], SessionRequest::Close { .. }));
    }
}
