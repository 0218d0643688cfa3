//! Transitions for flows whose `error_state` is `Errored`.
//!
//! Once a flow has recorded an error, every event routes through here. The
//! flow no longer resumes user code; it propagates its errors to live peer
//! sessions, tears itself down, and lingers only while still-initiating
//! sessions hold unpropagated errors open.

use crate::action::{Action, ErrorTarget, RemovalReason};
use crate::checkpoint::{CheckpointStatus, ErrorState, FlowState, MachineState};
use crate::error::{FlowError, FlowFault};
use crate::event::{Event, TimerKind};
use crate::session::{
    DedupHandler, DedupId, ErrorSessionMessage, ReceivedPayload, SessionId, SessionPayload,
    SessionState,
};

use super::sessions::{apply_session_error, confirm_session, queue_received};
use super::{normal, TransitionBuilder, TransitionContext, TransitionResult};

pub(super) fn transition(
    ctx: &TransitionContext,
    state: &MachineState,
    event: Event,
) -> TransitionResult {
    match event {
        Event::StartErrorPropagation => {
            let mut b = TransitionBuilder::new(ctx, state);
            if let ErrorState::Errored { propagating, .. } = &mut b.checkpoint().error_state {
                *propagating = true;
            }
            propagate_and_teardown(b)
        }
        Event::Error { error } => {
            let mut b = TransitionBuilder::new(ctx, state);
            b.checkpoint().error_state.record(error);
            if is_propagating(&b.state) {
                // Late errors propagate immediately; the index advances past
                // all of them in one step.
                propagate_and_teardown(b)
            } else {
                b.process_events()
            }
        }
        Event::MessageReceived {
            session_id,
            payload,
            handler,
        } => message_received(ctx, state, session_id, payload, handler),
        Event::Kill => kill(ctx, state),
        Event::RetryFromSafePoint
        | Event::TimerExpired {
            timer: TimerKind::FlowTimeout,
        } => {
            // The last committed checkpoint predates the error; retrying
            // discards the error state along with the fiber.
            normal::retry_from_safe_point(ctx, state)
        }
        Event::Pause => normal::pause(ctx, state),
        Event::SoftShutdown => TransitionBuilder::new(ctx, state).abort(),
        // An errored flow never resumes user code.
        Event::Start
        | Event::WakeUp
        | Event::AsyncOpCompleted { .. }
        | Event::TimerExpired {
            timer: TimerKind::Sleep,
        }
        | Event::Suspend { .. }
        | Event::FlowFinished { .. } => TransitionBuilder::new(ctx, state).no_change(state),
    }
}

fn is_propagating(state: &MachineState) -> bool {
    matches!(
        state.checkpoint.error_state,
        ErrorState::Errored {
            propagating: true,
            ..
        }
    )
}

/// Sessions that keep a removed flow alive: still initiating, not rejected,
/// waiting for a confirm to flush their buffered errors.
fn held_open_sessions(state: &MachineState) -> Vec<SessionId> {
    state
        .checkpoint
        .checkpoint_state
        .sessions
        .iter()
        .filter_map(|(id, s)| match s {
            SessionState::Initiating {
                rejection_error: None,
                ..
            } => Some(*id),
            _ => None,
        })
        .collect()
}

/// Propagate unpropagated errors, then tear the flow down.
///
/// Error messages are prepended to the buffers of still-initiating sessions
/// (so a peer that has not yet confirmed receives `(init, error)` back to
/// back) and pushed to every initiated session whose other side has not
/// itself errored. `propagated_index` then advances past everything in one
/// step and never decreases.
fn propagate_and_teardown(mut b: TransitionBuilder<'_>) -> TransitionResult {
    let flow_id = b.ctx.flow_id;
    let ErrorState::Errored {
        errors,
        propagated_index,
        ..
    } = b.state.checkpoint.error_state.clone()
    else {
        unreachable!("error-flow transition requires an errored state");
    };

    let remaining: Vec<FlowError> = errors.iter().skip(propagated_index).cloned().collect();
    if !remaining.is_empty() {
        let messages: Vec<ErrorSessionMessage> = remaining
            .iter()
            .map(|error| ErrorSessionMessage {
                flow_exception: match &error.fault {
                    FlowFault::User(exception) if exception.original_error_id.is_none() => {
                        Some(exception.clone())
                    }
                    _ => None,
                },
                error_id: error.error_id,
            })
            .collect();

        // Prepend to still-initiating sessions so the errors beat any
        // buffered data onto the wire.
        for session_id in held_open_sessions(&b.state) {
            if let Some(SessionState::Initiating {
                buffered_messages, ..
            }) = b
                .checkpoint()
                .checkpoint_state
                .sessions
                .get_mut(&session_id)
            {
                let mut combined: Vec<(DedupId, SessionPayload)> = messages
                    .iter()
                    .map(|m| {
                        (
                            DedupId::Error {
                                error_id: m.error_id,
                                source_session_id: session_id,
                            },
                            SessionPayload::Error(m.clone()),
                        )
                    })
                    .collect();
                combined.append(buffered_messages);
                *buffered_messages = combined;
            }
        }

        let targets: Vec<ErrorTarget> = b
            .state
            .checkpoint
            .checkpoint_state
            .sessions
            .values()
            .filter_map(|s| match s {
                SessionState::Initiated {
                    our_session_id,
                    peer_session_id,
                    peer_party,
                    other_side_errored: false,
                    ..
                } => Some(ErrorTarget {
                    peer: peer_party.clone(),
                    peer_session_id: *peer_session_id,
                    our_session_id: *our_session_id,
                }),
                _ => None,
            })
            .collect();
        if !targets.is_empty() {
            b.action(Action::PropagateErrors {
                messages,
                sessions: targets,
                sender: flow_id,
            });
        }

        if let ErrorState::Errored {
            errors,
            propagated_index,
            ..
        } = &mut b.checkpoint().error_state
        {
            *propagated_index = errors.len();
        }
    }

    let held_open = held_open_sessions(&b.state);
    if !b.state.removed {
        let client_id = b.state.checkpoint.invocation_context.client_id.clone();
        let bindings: Vec<SessionId> = b
            .state
            .checkpoint
            .session_ids()
            .into_iter()
            .filter(|id| !held_open.contains(id))
            .collect();

        b.checkpoint().status = CheckpointStatus::Failed;
        b.checkpoint().flow_state = FlowState::Finished { result: None };
        b.bump_commits();
        let (facts, acks) = b.take_dedup_work();

        b.action(Action::CreateTransaction);
        if client_id.is_none() {
            b.action(Action::RemoveCheckpoint {
                id: flow_id,
                may_have_persistent_results: false,
            });
        } else {
            let checkpoint = b.state.checkpoint.clone();
            b.action(Action::PersistCheckpoint {
                id: flow_id,
                checkpoint: Box::new(checkpoint),
                is_update: true,
            });
        }
        if !facts.is_empty() {
            b.action(Action::PersistDeduplicationFacts { facts });
        }
        b.action(Action::ReleaseSoftLocks { flow_id });
        b.action(Action::CommitTransaction);
        if !acks.is_empty() {
            b.action(Action::AcknowledgeMessages { handlers: acks });
        }
        if !bindings.is_empty() {
            b.action(Action::RemoveSessionBindings {
                session_ids: bindings,
            });
        }
        if b.ctx.flow_timeout.is_some() {
            b.action(Action::CancelFlowTimeout { flow_id });
        }
        b.action(Action::RemoveFlow {
            flow_id,
            reason: RemovalReason::ErrorFinish(errors.into_iter().collect()),
        });
        b.state.removed = true;
    }

    if held_open.is_empty() {
        b.abort()
    } else {
        // Unpropagated errors ride in the initiating buffers; stay alive
        // until the peers confirm or reject.
        b.process_events()
    }
}

/// Events from the bus while errored.
///
/// Confirms still upgrade and flush (delivering the prepended errors);
/// rejections release held-open sessions; everything else just records its
/// dedup fact.
fn message_received(
    ctx: &TransitionContext,
    state: &MachineState,
    session_id: SessionId,
    payload: SessionPayload,
    handler: DedupHandler,
) -> TransitionResult {
    let mut b = TransitionBuilder::new(ctx, state);
    b.checkpoint()
        .pending_dedup_facts
        .push(handler.dedup_id.clone());
    b.state.pending_acks.push(handler);

    match payload {
        SessionPayload::Confirm {
            initiated_session_id,
        } => {
            confirm_session(&mut b, session_id, initiated_session_id);
            if b.state.removed {
                // The flow only stayed alive to flush this session's errors.
                b.checkpoint()
                    .checkpoint_state
                    .sessions
                    .remove(&session_id);
                b.action(Action::RemoveSessionBindings {
                    session_ids: vec![session_id],
                });
            }
        }
        SessionPayload::Error(message) => {
            apply_session_error(&mut b, session_id, message);
            if b.state.removed {
                // A rejected initiation will never confirm; drop it.
                if matches!(
                    b.state.checkpoint.session(session_id),
                    Some(SessionState::Initiating {
                        rejection_error: Some(_),
                        ..
                    })
                ) {
                    b.checkpoint()
                        .checkpoint_state
                        .sessions
                        .remove(&session_id);
                    b.action(Action::RemoveSessionBindings {
                        session_ids: vec![session_id],
                    });
                }
            }
        }
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
    }

    if b.state.removed && held_open_sessions(&b.state).is_empty() {
        b.abort()
    } else {
        b.process_events()
    }
}

/// Kill an errored flow: propagate what remains, then remove unconditionally.
fn kill(ctx: &TransitionContext, state: &MachineState) -> TransitionResult {
    let mut b = TransitionBuilder::new(ctx, state);
    let flow_id = ctx.flow_id;
    let ErrorState::Errored { errors, .. } = b.state.checkpoint.error_state.clone() else {
        unreachable!("error-flow transition requires an errored state");
    };

    if let ErrorState::Errored { propagating, .. } = &mut b.checkpoint().error_state {
        *propagating = true;
    }

    if !b.state.removed {
        // Reuse the propagation pass but finish with a kill teardown.
        let targets: Vec<ErrorTarget> = b
            .state
            .checkpoint
            .checkpoint_state
            .sessions
            .values()
            .filter_map(|s| match s {
                SessionState::Initiated {
                    our_session_id,
                    peer_session_id,
                    peer_party,
                    other_side_errored: false,
                    ..
                } => Some(ErrorTarget {
                    peer: peer_party.clone(),
                    peer_session_id: *peer_session_id,
                    our_session_id: *our_session_id,
                }),
                _ => None,
            })
            .collect();
        let ErrorState::Errored {
            propagated_index, ..
        } = &b.state.checkpoint.error_state
        else {
            unreachable!("checked above");
        };
        let messages: Vec<ErrorSessionMessage> = errors
            .iter()
            .skip(*propagated_index)
            .map(|error| ErrorSessionMessage {
                flow_exception: match &error.fault {
                    FlowFault::User(exception) if exception.original_error_id.is_none() => {
                        Some(exception.clone())
                    }
                    _ => None,
                },
                error_id: error.error_id,
            })
            .collect();
        if !targets.is_empty() && !messages.is_empty() {
            b.action(Action::PropagateErrors {
                messages,
                sessions: targets,
                sender: flow_id,
            });
        }
        if let ErrorState::Errored {
            errors,
            propagated_index,
            ..
        } = &mut b.checkpoint().error_state
        {
            *propagated_index = errors.len();
        }
    }

    let client_id = b.state.checkpoint.invocation_context.client_id.clone();
    let bindings = b.state.checkpoint.session_ids();
    b.checkpoint().status = CheckpointStatus::Killed;
    b.checkpoint().flow_state = FlowState::Finished { result: None };
    b.bump_commits();
    let (facts, acks) = b.take_dedup_work();

    b.action(Action::CreateTransaction);
    if client_id.is_some() {
        // Refresh the row first so the removal extracts the terminal
        // outcome, not the last suspension.
        let checkpoint = b.state.checkpoint.clone();
        b.action(Action::PersistCheckpoint {
            id: flow_id,
            checkpoint: Box::new(checkpoint),
            is_update: true,
        });
    }
    b.action(Action::RemoveCheckpoint {
        id: flow_id,
        may_have_persistent_results: client_id.is_some(),
    });
    if !facts.is_empty() {
        b.action(Action::PersistDeduplicationFacts { facts });
    }
    b.action(Action::ReleaseSoftLocks { flow_id });
    b.action(Action::CommitTransaction);
    if !acks.is_empty() {
        b.action(Action::AcknowledgeMessages { handlers: acks });
    }
    if !bindings.is_empty() {
        b.action(Action::RemoveSessionBindings {
            session_ids: bindings,
        });
    }
    if b.ctx.flow_timeout.is_some() {
        b.action(Action::CancelFlowTimeout { flow_id });
    }
    b.action(Action::RemoveFlow {
        flow_id,
        reason: RemovalReason::Killed,
    });

    b.state.removed = true;
    b.abort()
}
