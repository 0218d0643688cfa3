//! The sealed event vocabulary.
//!
//! Every input the state machine can react to is a variant here. The
//! transition function matches exhaustively over `(flow phase, event)`, so
//! adding a variant forces every phase to handle it or delegate explicitly.

use serde_json::Value;

use crate::error::FlowError;
use crate::flow::{SessionRequest, SuspendReason};
use crate::session::{DedupHandler, SessionId, SessionPayload};

/// Which engine timer fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// A `sleep` suspension elapsed.
    Sleep,
    /// The flow's overall timeout elapsed; the flow is retried from its last
    /// committed checkpoint, not cancelled.
    FlowTimeout,
}

/// An input to the transition function.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Begin executing an `Unstarted` flow.
    Start,
    /// Re-examine the current suspension: satisfy it from buffered session
    /// state, or re-arm its external trigger (sleep timer, async op).
    ///
    /// Fed by the fiber after every suspension commit and on restart; a
    /// wake-up that changes nothing produces an empty action list.
    WakeUp,
    /// A message arrived from the bus for one of this flow's sessions.
    MessageReceived {
        /// Our session id the message was routed to.
        session_id: SessionId,
        /// The classified payload.
        payload: SessionPayload,
        /// Ack token, acknowledged only after the next commit.
        handler: DedupHandler,
    },
    /// The user fiber yielded at a suspension point.
    Suspend {
        /// Why the flow suspended.
        reason: SuspendReason,
        /// The flow's frozen user state.
        frozen_stack: Value,
        /// Session operations requested during the step, in order.
        requests: Vec<SessionRequest>,
    },
    /// The user fiber ran to completion.
    FlowFinished {
        /// The orderly result.
        result: Value,
        /// Session operations requested during the final step, in order.
        requests: Vec<SessionRequest>,
    },
    /// An error was raised against the flow. Recording only; propagation is
    /// triggered separately by [`Event::StartErrorPropagation`].
    Error {
        /// The error to record.
        error: FlowError,
    },
    /// Begin propagating recorded errors to live peer sessions and tear the
    /// flow down.
    StartErrorPropagation,
    /// An asynchronous operation submitted by this flow completed.
    AsyncOpCompleted {
        /// The operation's deduplication key.
        dedup_id: String,
        /// The operation's result.
        result: Value,
    },
    /// An engine timer for this flow fired.
    TimerExpired {
        /// Which timer.
        timer: TimerKind,
    },
    /// Discard in-memory progress and restart from the last committed
    /// checkpoint.
    RetryFromSafePoint,
    /// Drain gracefully: park the fiber at the current suspension point,
    /// leaving the checkpoint runnable for the next process.
    SoftShutdown,
    /// Park the flow under operator control without removing it.
    Pause,
    /// Remove the flow immediately, firing compensating actions.
    Kill,
}

impl Event {
    /// Short tag for logs and transition-history records.
    pub fn tag(&self) -> &'static str {
        match self {
            Event::Start => "start",
            Event::WakeUp => "wake_up",
            Event::MessageReceived { .. } => "message_received",
            Event::Suspend { .. } => "suspend",
            Event::FlowFinished { .. } => "flow_finished",
            Event::Error { .. } => "error",
            Event::StartErrorPropagation => "start_error_propagation",
            Event::AsyncOpCompleted { .. } => "async_op_completed",
            Event::TimerExpired { .. } => "timer_expired",
            Event::RetryFromSafePoint => "retry_from_safe_point",
            Event::SoftShutdown => "soft_shutdown",
            Event::Pause => "pause",
            Event::Kill => "kill",
        }
    }
}
