//! The pure transition layer.
//!
//! [`transition`] is the only place the machine's rules live. It maps
//! `(current state, inbound event)` to `(next state, ordered action list,
//! continuation)` and performs no I/O, so it can be unit-tested, replayed
//! after a crash, and wrapped by interceptors. Running the same transition
//! against the same pre-state and event produces an identical post-state and
//! action list.
//!
//! Transitions are organised by flow phase. A flow whose `error_state` is
//! `Errored` routes every event through the error-flow transition in
//! [`error_flow`]; clean flows are handled in [`normal`].

mod error_flow;
mod normal;
mod sessions;

use std::time::Duration;

use time::OffsetDateTime;

use crate::action::Action;
use crate::checkpoint::{Checkpoint, MachineState};
use crate::event::Event;
use crate::flow::{FlowId, ResumeValue};
use crate::session::PartyName;

/// What the fiber should do after executing a transition's actions.
#[derive(Debug, Clone, PartialEq)]
pub enum Continuation {
    /// Run the next user step with this value.
    Resume(ResumeValue),
    /// Wait for the next event.
    ProcessEvents,
    /// Stop driving this flow; the fiber exits.
    Abort,
}

/// The output of one transition.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionResult {
    /// The post-state.
    pub state: MachineState,
    /// Side effects to interpret, strictly in order.
    pub actions: Vec<Action>,
    /// What the fiber does next.
    pub continuation: Continuation,
}

/// Ambient facts a transition may read.
///
/// Everything here is supplied by the fiber per event, including the clock:
/// the transition itself must stay deterministic.
#[derive(Debug, Clone)]
pub struct TransitionContext {
    /// The flow being driven.
    pub flow_id: FlowId,
    /// Our node's name on the bus.
    pub local_party: PartyName,
    /// Application identifier stamped into initiating messages.
    pub app_name: String,
    /// Platform version stamped into initiating messages.
    pub platform_version: u32,
    /// Overall flow timeout, when the flow class declares one.
    pub flow_timeout: Option<Duration>,
    /// The instant the event is being processed at.
    pub now: OffsetDateTime,
}

/// Apply one event to one flow.
///
/// Pure: no I/O, no clocks, no randomness. Errored flows are routed through
/// the error-flow transition regardless of the event.
pub fn transition(ctx: &TransitionContext, state: &MachineState, event: Event) -> TransitionResult {
    if state.checkpoint.error_state.is_errored() {
        error_flow::transition(ctx, state, event)
    } else {
        normal::transition(ctx, state, event)
    }
}

/// Accumulates a transition's state mutations and action list.
///
/// The builder enforces the executor's bracketing rules as the list is
/// built: persistence actions only inside a `CreateTransaction` span, and at
/// most one span per transition. A transition that changes nothing finishes
/// through [`TransitionBuilder::no_change`], which discards the working copy
/// so replays stay idempotent.
pub(crate) struct TransitionBuilder<'a> {
    pub(crate) ctx: &'a TransitionContext,
    pub(crate) state: MachineState,
    actions: Vec<Action>,
    in_transaction: bool,
    transaction_used: bool,
}

impl<'a> TransitionBuilder<'a> {
    pub(crate) fn new(ctx: &'a TransitionContext, prev: &MachineState) -> Self {
        Self {
            ctx,
            state: prev.clone(),
            actions: Vec::new(),
            in_transaction: false,
            transaction_used: false,
        }
    }

    pub(crate) fn checkpoint(&mut self) -> &mut Checkpoint {
        &mut self.state.checkpoint
    }

    /// Append an action, checking the bracketing discipline.
    pub(crate) fn action(&mut self, action: Action) {
        match &action {
            Action::CreateTransaction => {
                debug_assert!(!self.in_transaction, "nested CreateTransaction");
                debug_assert!(!self.transaction_used, "second transaction in one transition");
                self.in_transaction = true;
                self.transaction_used = true;
            }
            Action::CommitTransaction | Action::RollbackTransaction => {
                // A bare RollbackTransaction (retry path) may close a span the
                // executor opened in an earlier, faulted transition.
                self.in_transaction = false;
            }
            other if other.requires_transaction() => {
                debug_assert!(
                    self.in_transaction,
                    "{} outside transaction span",
                    other.tag()
                );
            }
            _ => {}
        }
        self.actions.push(action);
    }

    pub(crate) fn actions(&mut self, actions: impl IntoIterator<Item = Action>) {
        for action in actions {
            self.action(action);
        }
    }

    /// Bump the commit counter, returning the new value.
    pub(crate) fn bump_commits(&mut self) -> u64 {
        let commits = &mut self.state.checkpoint.checkpoint_state.num_commits;
        *commits += 1;
        *commits
    }

    /// Drain the pending dedup facts and ack handlers for persistence.
    ///
    /// The facts must be cleared from the checkpoint before it is persisted:
    /// after the commit they live in the durable dedup log, never both.
    pub(crate) fn take_dedup_work(
        &mut self,
    ) -> (Vec<crate::session::DedupId>, Vec<crate::session::DedupHandler>) {
        let facts = std::mem::take(&mut self.state.checkpoint.pending_dedup_facts);
        let acks = std::mem::take(&mut self.state.pending_acks);
        (facts, acks)
    }

    pub(crate) fn resume(self, value: ResumeValue) -> TransitionResult {
        self.finish(Continuation::Resume(value))
    }

    pub(crate) fn process_events(self) -> TransitionResult {
        self.finish(Continuation::ProcessEvents)
    }

    pub(crate) fn abort(self) -> TransitionResult {
        self.finish(Continuation::Abort)
    }

    /// Finish without touching state or emitting actions.
    pub(crate) fn no_change(self, prev: &MachineState) -> TransitionResult {
        debug_assert!(self.actions.is_empty(), "no_change with pending actions");
        TransitionResult {
            state: prev.clone(),
            actions: Vec::new(),
            continuation: Continuation::ProcessEvents,
        }
    }

    fn finish(self, continuation: Continuation) -> TransitionResult {
        debug_assert!(!self.in_transaction, "unterminated transaction span");
        TransitionResult {
            state: self.state,
            actions: self.actions,
            continuation,
        }
    }
}
