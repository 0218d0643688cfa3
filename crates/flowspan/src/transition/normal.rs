//! Transitions for flows whose `error_state` is `Clean`.

use serde_json::Value;

use crate::action::{Action, RemovalReason};
use crate::checkpoint::{CheckpointStatus, FlowState, MachineState};
use crate::error::FlowError;
use crate::event::{Event, TimerKind};
use crate::flow::{FlowOrigin, ResumeValue, SessionRequest, SuspendReason};
use crate::session::{
    DedupHandler, DedupId, ExistingSessionMessage, ReceivedPayload, SessionId, SessionPayload,
    SessionState,
};

use super::sessions::{
    apply_session_error, apply_session_requests, confirm_session, queue_received,
    try_satisfy_suspension, RequestOutcome,
};
use super::{TransitionBuilder, TransitionContext, TransitionResult};

pub(super) fn transition(
    ctx: &TransitionContext,
    state: &MachineState,
    event: Event,
) -> TransitionResult {
    match event {
        Event::Start => start(ctx, state),
        Event::WakeUp => wake_up(ctx, state),
        Event::MessageReceived {
            session_id,
            payload,
            handler,
        } => message_received(ctx, state, session_id, payload, handler),
        Event::Suspend {
            reason,
            frozen_stack,
            requests,
        } => suspend(ctx, state, reason, frozen_stack, requests),
        Event::FlowFinished { result, requests } => flow_finished(ctx, state, result, requests),
        Event::Error { error } => record_error(ctx, state, error),
        // Nothing recorded, nothing to propagate.
        Event::StartErrorPropagation => TransitionBuilder::new(ctx, state).no_change(state),
        Event::AsyncOpCompleted { dedup_id, result } => {
            async_op_completed(ctx, state, dedup_id, result)
        }
        Event::TimerExpired { timer } => timer_expired(ctx, state, timer),
        Event::RetryFromSafePoint => retry_from_safe_point(ctx, state),
        Event::SoftShutdown => TransitionBuilder::new(ctx, state).abort(),
        Event::Pause => pause(ctx, state),
        Event::Kill => kill(ctx, state),
    }
}

/// Promote an `Unstarted` flow into execution.
///
/// The checkpoint is persisted still `Unstarted`: a crash after this commit
/// restarts the flow from the beginning, which is correct because no
/// suspension point has been reached yet. Peer-created flows confirm the
/// inbound session in the same bracket so the initiator can unbuffer.
fn start(ctx: &TransitionContext, state: &MachineState) -> TransitionResult {
    let FlowState::Unstarted { args } = &state.checkpoint.flow_state else {
        // Duplicate start, e.g. replayed after a crash mid-recovery.
        return TransitionBuilder::new(ctx, state).no_change(state);
    };
    let args = args.clone();

    let mut b = TransitionBuilder::new(ctx, state);
    let commits = b.bump_commits();

    let initiated_session = match &b.state.checkpoint.invocation_context.origin {
        FlowOrigin::Peer { session_id, .. } => Some(*session_id),
        FlowOrigin::Client => None,
    };
    let confirm = initiated_session.and_then(|our_sid| {
        match b.state.checkpoint.session(our_sid) {
            Some(SessionState::Initiated {
                peer_session_id,
                peer_party,
                ..
            }) => Some((peer_party.clone(), *peer_session_id, our_sid)),
            _ => None,
        }
    });

    let (facts, acks) = b.take_dedup_work();
    b.action(Action::CreateTransaction);
    let checkpoint = b.state.checkpoint.clone();
    b.action(Action::PersistCheckpoint {
        id: ctx.flow_id,
        checkpoint: Box::new(checkpoint),
        is_update: commits > 1,
    });
    if !facts.is_empty() {
        b.action(Action::PersistDeduplicationFacts { facts });
    }
    if let Some((peer, peer_session_id, our_session_id)) = confirm {
        b.action(Action::SendExisting {
            peer,
            message: ExistingSessionMessage {
                recipient_session_id: peer_session_id,
                payload: SessionPayload::Confirm {
                    initiated_session_id: our_session_id,
                },
            },
            dedup_id: DedupId::Normal {
                sender: ctx.flow_id,
                session_id: our_session_id,
                seq: 0,
            },
        });
    }
    if let Some(timeout) = ctx.flow_timeout {
        b.action(Action::ScheduleFlowTimeout {
            flow_id: ctx.flow_id,
            at: ctx.now + timeout,
        });
    }
    b.action(Action::CommitTransaction);
    if !acks.is_empty() {
        b.action(Action::AcknowledgeMessages { handlers: acks });
    }

    b.resume(ResumeValue::Start {
        args,
        initiated_session,
    })
}

/// Re-examine the current suspension.
///
/// Satisfies a receive from buffered session state, or re-arms the sleep
/// timer / async operation. Re-arming is idempotent on the collaborator
/// side, so replaying a wake-up is harmless.
fn wake_up(ctx: &TransitionContext, state: &MachineState) -> TransitionResult {
    let Some(suspension) = state.checkpoint.suspension().cloned() else {
        return TransitionBuilder::new(ctx, state).no_change(state);
    };

    let mut b = TransitionBuilder::new(ctx, state);
    match &suspension {
        SuspendReason::ReceiveFrom(_) => match try_satisfy_suspension(&mut b, &suspension) {
            Some(value) => b.resume(value),
            None => b.no_change(state),
        },
        SuspendReason::Sleep { until } => {
            b.action(Action::SleepUntil {
                flow_id: ctx.flow_id,
                until: *until,
            });
            b.process_events()
        }
        SuspendReason::AwaitAsyncOp {
            dedup_id,
            operation,
        } => {
            b.action(Action::ExecuteAsyncOperation {
                flow_id: ctx.flow_id,
                dedup_id: dedup_id.clone(),
                operation: operation.clone(),
            });
            b.process_events()
        }
        SuspendReason::Checkpoint => b.resume(ResumeValue::Checkpointed),
    }
}

fn message_received(
    ctx: &TransitionContext,
    state: &MachineState,
    session_id: SessionId,
    payload: SessionPayload,
    handler: DedupHandler,
) -> TransitionResult {
    let mut b = TransitionBuilder::new(ctx, state);

    // The dedup fact always rides with the next checkpoint commit, whatever
    // the payload turns out to mean.
    b.checkpoint()
        .pending_dedup_facts
        .push(handler.dedup_id.clone());
    b.state.pending_acks.push(handler);

    match payload {
        SessionPayload::Confirm {
            initiated_session_id,
        } => confirm_session(&mut b, session_id, initiated_session_id),
        SessionPayload::Data { seq, payload } => {
            queue_received(&mut b, session_id, seq, ReceivedPayload::Data(payload));
        }
        SessionPayload::End => {
            if let Some(SessionState::Initiated {
                other_side_closed, ..
            }) = b
                .checkpoint()
                .checkpoint_state
                .sessions
                .get_mut(&session_id)
            {
                *other_side_closed = true;
            }
        }
        SessionPayload::Error(message) => apply_session_error(&mut b, session_id, message),
    }

    if let Some(suspension) = b.state.checkpoint.suspension().cloned() {
        if let Some(value) = try_satisfy_suspension(&mut b, &suspension) {
            return b.resume(value);
        }
    }
    b.process_events()
}

/// Persist a suspension point requested by the user fiber.
///
/// Sends requested during the step go on the wire inside the same bracket,
/// before the commit: a crash in between replays the step and re-sends with
/// identical dedup ids, which the peer's bus suppresses.
fn suspend(
    ctx: &TransitionContext,
    state: &MachineState,
    reason: SuspendReason,
    frozen_stack: Value,
    requests: Vec<SessionRequest>,
) -> TransitionResult {
    let mut b = TransitionBuilder::new(ctx, state);
    let sends = match apply_session_requests(&mut b, requests, true) {
        RequestOutcome::Applied(sends) => sends,
        RequestOutcome::Interrupt(value) => {
            // The step touched a dead session: none of its effects commit;
            // the flow is resumed with the session's outcome instead.
            return TransitionBuilder::new(ctx, state).resume(value);
        }
    };

    b.checkpoint().flow_state = FlowState::Started {
        suspension: reason,
        frozen_stack,
    };
    let commits = b.bump_commits();
    let (facts, acks) = b.take_dedup_work();

    b.action(Action::CreateTransaction);
    let checkpoint = b.state.checkpoint.clone();
    b.action(Action::PersistCheckpoint {
        id: ctx.flow_id,
        checkpoint: Box::new(checkpoint),
        is_update: commits > 1,
    });
    if !facts.is_empty() {
        b.action(Action::PersistDeduplicationFacts { facts });
    }
    b.actions(sends);
    b.action(Action::CommitTransaction);
    if !acks.is_empty() {
        b.action(Action::AcknowledgeMessages { handlers: acks });
    }

    b.process_events()
}

/// Tear down an orderly finish.
fn flow_finished(
    ctx: &TransitionContext,
    state: &MachineState,
    result: Value,
    requests: Vec<SessionRequest>,
) -> TransitionResult {
    let mut b = TransitionBuilder::new(ctx, state);
    let mut sends = match apply_session_requests(&mut b, requests, false) {
        RequestOutcome::Applied(sends) => sends,
        RequestOutcome::Interrupt(_) => unreachable!("lenient application never interrupts"),
    };

    // Close every still-open session so peers observe an orderly end rather
    // than silence.
    let open: Vec<SessionId> = b
        .state
        .checkpoint
        .checkpoint_state
        .sessions
        .iter()
        .filter_map(|(id, s)| match s {
            SessionState::Initiated {
                other_side_errored: false,
                ..
            } => Some(*id),
            _ => None,
        })
        .collect();
    for session_id in open {
        if let Some(SessionState::Initiated {
            peer_session_id,
            peer_party,
            next_send_seq,
            ..
        }) = b
            .checkpoint()
            .checkpoint_state
            .sessions
            .get_mut(&session_id)
        {
            let seq = *next_send_seq;
            *next_send_seq += 1;
            let peer = peer_party.clone();
            let recipient = *peer_session_id;
            sends.push(Action::SendExisting {
                peer,
                message: ExistingSessionMessage {
                    recipient_session_id: recipient,
                    payload: SessionPayload::End,
                },
                dedup_id: DedupId::Normal {
                    sender: ctx.flow_id,
                    session_id,
                    seq,
                },
            });
        }
    }

    let bindings = b.state.checkpoint.session_ids();
    b.checkpoint().flow_state = FlowState::Finished {
        result: Some(result.clone()),
    };
    b.checkpoint().status = CheckpointStatus::Completed;
    b.bump_commits();
    let (facts, acks) = b.take_dedup_work();
    let client_id = b.state.checkpoint.invocation_context.client_id.clone();

    b.action(Action::CreateTransaction);
    if client_id.is_none() {
        b.action(Action::RemoveCheckpoint {
            id: ctx.flow_id,
            may_have_persistent_results: false,
        });
    } else {
        let checkpoint = b.state.checkpoint.clone();
        b.action(Action::PersistCheckpoint {
            id: ctx.flow_id,
            checkpoint: Box::new(checkpoint),
            is_update: true,
        });
    }
    if !facts.is_empty() {
        b.action(Action::PersistDeduplicationFacts { facts });
    }
    b.actions(sends);
    b.action(Action::ReleaseSoftLocks {
        flow_id: ctx.flow_id,
    });
    b.action(Action::CommitTransaction);
    if !acks.is_empty() {
        b.action(Action::AcknowledgeMessages { handlers: acks });
    }
    if !bindings.is_empty() {
        b.action(Action::RemoveSessionBindings {
            session_ids: bindings,
        });
    }
    if ctx.flow_timeout.is_some() {
        b.action(Action::CancelFlowTimeout {
            flow_id: ctx.flow_id,
        });
    }
    b.action(Action::RemoveFlow {
        flow_id: ctx.flow_id,
        reason: RemovalReason::OrderlyFinish(result),
    });

    b.state.removed = true;
    b.abort()
}

/// Record an error against the flow.
///
/// Recording emits no actions; propagation and teardown happen when
/// [`Event::StartErrorPropagation`] arrives (from the fiber for user errors,
/// from the hospital for internal ones).
fn record_error(
    ctx: &TransitionContext,
    state: &MachineState,
    error: FlowError,
) -> TransitionResult {
    let mut b = TransitionBuilder::new(ctx, state);
    b.checkpoint().error_state.record(error);
    b.process_events()
}

fn async_op_completed(
    ctx: &TransitionContext,
    state: &MachineState,
    dedup_id: String,
    result: Value,
) -> TransitionResult {
    match state.checkpoint.suspension() {
        Some(SuspendReason::AwaitAsyncOp {
            dedup_id: expected, ..
        }) if *expected == dedup_id => {
            TransitionBuilder::new(ctx, state).resume(ResumeValue::AsyncOpResult(result))
        }
        // Stale completion from a superseded suspension.
        _ => TransitionBuilder::new(ctx, state).no_change(state),
    }
}

fn timer_expired(
    ctx: &TransitionContext,
    state: &MachineState,
    timer: TimerKind,
) -> TransitionResult {
    match timer {
        TimerKind::Sleep => match state.checkpoint.suspension() {
            Some(SuspendReason::Sleep { .. }) => {
                TransitionBuilder::new(ctx, state).resume(ResumeValue::SleepFinished)
            }
            _ => TransitionBuilder::new(ctx, state).no_change(state),
        },
        // A flow timeout is a retry from the last committed checkpoint, not
        // a cancellation.
        TimerKind::FlowTimeout => retry_from_safe_point(ctx, state),
    }
}

pub(super) fn retry_from_safe_point(
    ctx: &TransitionContext,
    state: &MachineState,
) -> TransitionResult {
    let mut b = TransitionBuilder::new(ctx, state);
    b.action(Action::RollbackTransaction);
    b.action(Action::RetryFlowFromSafePoint {
        flow_id: ctx.flow_id,
    });
    b.abort()
}

pub(super) fn pause(ctx: &TransitionContext, state: &MachineState) -> TransitionResult {
    let mut b = TransitionBuilder::new(ctx, state);
    b.checkpoint().status = CheckpointStatus::Paused;
    let commits = b.bump_commits();

    b.action(Action::CreateTransaction);
    let checkpoint = b.state.checkpoint.clone();
    b.action(Action::PersistCheckpoint {
        id: ctx.flow_id,
        checkpoint: Box::new(checkpoint),
        is_update: commits > 1,
    });
    b.action(Action::CommitTransaction);
    if ctx.flow_timeout.is_some() {
        b.action(Action::CancelFlowTimeout {
            flow_id: ctx.flow_id,
        });
    }
    b.abort()
}

/// Immediate removal of a clean flow.
///
/// Open sessions get an `End` so peers unblock; there is no error to
/// propagate from a clean flow.
fn kill(ctx: &TransitionContext, state: &MachineState) -> TransitionResult {
    let mut b = TransitionBuilder::new(ctx, state);

    let mut sends = Vec::new();
    let open: Vec<SessionId> = b
        .state
        .checkpoint
        .checkpoint_state
        .sessions
        .iter()
        .filter_map(|(id, s)| match s {
            SessionState::Initiated {
                other_side_errored: false,
                other_side_closed: false,
                ..
            } => Some(*id),
            _ => None,
        })
        .collect();
    for session_id in open {
        if let Some(SessionState::Initiated {
            peer_session_id,
            peer_party,
            next_send_seq,
            ..
        }) = b
            .checkpoint()
            .checkpoint_state
            .sessions
            .get_mut(&session_id)
        {
            let seq = *next_send_seq;
            *next_send_seq += 1;
            sends.push(Action::SendExisting {
                peer: peer_party.clone(),
                message: ExistingSessionMessage {
                    recipient_session_id: *peer_session_id,
                    payload: SessionPayload::End,
                },
                dedup_id: DedupId::Normal {
                    sender: ctx.flow_id,
                    session_id,
                    seq,
                },
            });
        }
    }

    let bindings = b.state.checkpoint.session_ids();
    let client_id = b.state.checkpoint.invocation_context.client_id.clone();
    b.checkpoint().flow_state = FlowState::Finished { result: None };
    b.checkpoint().status = CheckpointStatus::Killed;
    b.bump_commits();
    let (facts, acks) = b.take_dedup_work();

    b.action(Action::CreateTransaction);
    if client_id.is_some() {
        // Refresh the row first so the removal extracts the terminal
        // outcome, not the last suspension.
        let checkpoint = b.state.checkpoint.clone();
        b.action(Action::PersistCheckpoint {
            id: ctx.flow_id,
            checkpoint: Box::new(checkpoint),
            is_update: true,
        });
    }
    b.action(Action::RemoveCheckpoint {
        id: ctx.flow_id,
        may_have_persistent_results: client_id.is_some(),
    });
    if !facts.is_empty() {
        b.action(Action::PersistDeduplicationFacts { facts });
    }
    b.actions(sends);
    b.action(Action::ReleaseSoftLocks {
        flow_id: ctx.flow_id,
    });
    b.action(Action::CommitTransaction);
    if !acks.is_empty() {
        b.action(Action::AcknowledgeMessages { handlers: acks });
    }
    if !bindings.is_empty() {
        b.action(Action::RemoveSessionBindings {
            session_ids: bindings,
        });
    }
    if ctx.flow_timeout.is_some() {
        b.action(Action::CancelFlowTimeout {
            flow_id: ctx.flow_id,
        });
    }
    b.action(Action::RemoveFlow {
        flow_id: ctx.flow_id,
        reason: RemovalReason::Killed,
    });

    b.state.removed = true;
    b.abort()
}
