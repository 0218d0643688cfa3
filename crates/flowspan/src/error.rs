//! Error types for flowspan.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::flow::FlowId;
use crate::session::SessionId;

/// A `Result` alias with [`enum@Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in flowspan operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Failed to serialize or deserialize a checkpoint, wire message, or
    /// frozen flow state.
    ///
    /// This typically indicates a mismatch between the persisted blob and the
    /// current `Flow::State` type definition.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// PostgreSQL storage error.
    ///
    /// Preserves the full `sqlx::Error` for matching on specific database
    /// error conditions (connection timeout, constraint violation, etc.).
    #[cfg(feature = "postgres")]
    #[error("postgres error: {0}")]
    Postgres(#[from] sqlx::Error),

    /// A checkpoint upsert carried a `num_commits` that is not strictly
    /// greater than the stored one.
    ///
    /// This is the optimistic-replace conflict: the executing transition is a
    /// replay of one that already committed. It is not user-visible; the
    /// engine rolls back and retries from the stored checkpoint.
    #[error("stale checkpoint for flow {flow_id}: store holds commit {stored}, attempted {attempted}")]
    StaleCheckpoint {
        /// The flow whose checkpoint was being replaced.
        flow_id: FlowId,
        /// The commit count currently stored.
        stored: u64,
        /// The commit count the upsert attempted to write.
        attempted: u64,
    },

    /// Flow class was not registered on the node.
    #[error("unknown flow class: {0}")]
    UnknownFlowClass(String),

    /// Flow class was registered more than once.
    #[error("duplicate flow class registration: {0}")]
    DuplicateFlowClass(String),

    /// No checkpoint exists for the flow.
    #[error("flow {0} not found")]
    FlowNotFound(FlowId),

    /// A wire message referenced a session the engine has no binding for.
    #[error("no session binding for session {0}")]
    UnknownSession(SessionId),

    /// The action list violated the executor's transactional bracketing
    /// rules (persistence outside a transaction, double begin, unterminated
    /// span).
    #[error("action ordering violation: {0}")]
    ActionOrdering(String),

    /// A message-bus operation failed.
    #[error("message bus error: {0}")]
    Bus(String),

    /// The per-flow event mailbox is gone; the fiber has terminated.
    #[error("fiber for flow {0} is not running")]
    FiberGone(FlowId),

    /// Catch-all for checkpoint store backends.
    #[error("checkpoint store error: {0}")]
    Store(String),
}

/// An exception raised by user flow code.
///
/// `FlowException`s are user-visible and serialisable: they propagate across
/// sessions carrying their payload on the first hop. A re-raised exception
/// (one surfaced to a flow because a *peer* errored) carries the originating
/// `error_id` in `original_error_id` and its payload is not forwarded again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowException {
    /// Human-readable description, shown to the peer on the first hop.
    pub message: String,
    /// The error id this exception was re-raised from, if it reached this
    /// flow through a session rather than being raised locally.
    pub original_error_id: Option<u64>,
}

impl FlowException {
    /// Raise a new user exception.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            original_error_id: None,
        }
    }

    /// Rebuild an exception surfaced by a peer's propagated error.
    pub fn rethrown(message: impl Into<String>, original_error_id: u64) -> Self {
        Self {
            message: message.into(),
            original_error_id: Some(original_error_id),
        }
    }
}

impl std::fmt::Display for FlowException {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for FlowException {}

/// The cause recorded inside a [`FlowError`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowFault {
    /// A user exception raised inside flow code.
    User(FlowException),
    /// An engine, bus, or database failure.
    ///
    /// Internal faults never carry their payload to peers; only the error id
    /// crosses the wire. `hospitalize` forces hospitalisation even from
    /// otherwise-recoverable contexts.
    Internal {
        /// Description for the operator, never sent to peers.
        description: String,
        /// Skip the bounded-retry path and admit straight to the hospital.
        hospitalize: bool,
    },
}

impl FlowFault {
    /// Returns `true` for internal (engine-originated) faults.
    pub fn is_internal(&self) -> bool {
        matches!(self, FlowFault::Internal { .. })
    }
}

/// An error recorded against a flow.
///
/// `error_id` is globally unique and is what peers use to correlate a
/// propagated error with the flow that raised it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowError {
    /// Globally unique identifier for this error.
    pub error_id: u64,
    /// What went wrong.
    pub fault: FlowFault,
}

impl FlowError {
    /// Record a user exception under a fresh error id.
    pub fn user(error_id: u64, exception: FlowException) -> Self {
        Self {
            error_id,
            fault: FlowFault::User(exception),
        }
    }

    /// Record an internal fault under a fresh error id.
    pub fn internal(error_id: u64, description: impl Into<String>) -> Self {
        Self {
            error_id,
            fault: FlowFault::Internal {
                description: description.into(),
                hospitalize: false,
            },
        }
    }

    /// The exception user code observes when this error surfaces through a
    /// session it is receiving on.
    pub fn surfaced_exception(&self) -> FlowException {
        match &self.fault {
            FlowFault::User(e) => e.clone(),
            FlowFault::Internal { .. } => {
                FlowException::rethrown("peer flow errored", self.error_id)
            }
        }
    }

    /// Rebuild the exception a peer should observe for this error.
    ///
    /// User exceptions keep their payload on the first hop
    /// (`original_error_id == None`); anything else surfaces as a generic
    /// error carrying only the id.
    pub fn as_peer_exception(&self) -> FlowException {
        match &self.fault {
            FlowFault::User(e) if e.original_error_id.is_none() => e.clone(),
            _ => FlowException::rethrown("peer flow errored", self.error_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_exception_payload_travels_on_first_hop_only() {
        let raised = FlowError::user(7, FlowException::new("nope"));
        let first_hop = raised.as_peer_exception();
        assert_eq!(first_hop.message, "nope");
        assert_eq!(first_hop.original_error_id, None);

        // A re-raised exception does not forward its payload again.
        let rethrown = FlowError::user(9, FlowException::rethrown("nope", 7));
        let second_hop = rethrown.as_peer_exception();
        assert_eq!(second_hop.original_error_id, Some(9));
        assert_ne!(second_hop.message, "nope");
    }

    #[test]
    fn internal_fault_never_carries_payload() {
        let err = FlowError::internal(11, "database connection reset");
        let surfaced = err.as_peer_exception();
        assert_eq!(surfaced.original_error_id, Some(11));
        assert!(!surfaced.message.contains("database"));
    }

    #[test]
    fn flow_error_round_trips_through_json() {
        let err = FlowError::user(42, FlowException::new("bad input"));
        let json = serde_json::to_value(&err).unwrap();
        let back: FlowError = serde_json::from_value(json).unwrap();
        assert_eq!(back, err);
    }
}
