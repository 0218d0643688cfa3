//! Session-table mechanics shared by the normal and error-flow transitions.

use crate::action::Action;
use crate::flow::{ResumeValue, SessionRequest, SuspendReason};
use crate::session::{
    DedupId, ExistingSessionMessage, InitialSessionMessage, ReceivedPayload, SessionId,
    SessionPayload, SessionState,
};

use super::TransitionBuilder;

/// How applying a step's session requests ended.
pub(crate) enum RequestOutcome {
    /// All requests applied; the send actions are in request order.
    Applied(Vec<Action>),
    /// A request touched a dead session; the step must not commit and the
    /// flow is resumed with what the session has to say instead.
    Interrupt(ResumeValue),
}

/// Apply the session operations a flow step requested.
///
/// Mutates the builder's session table and returns the send actions to emit
/// inside the suspension's transactional bracket. When `strict`, a send
/// aimed at an errored or ended session interrupts the whole step: none of
/// its sends go out and the flow is resumed with the session's error
/// instead. Lenient application (the finish path, where there is no step
/// left to resume) drops such sends.
pub(crate) fn apply_session_requests(
    builder: &mut TransitionBuilder<'_>,
    requests: Vec<SessionRequest>,
    strict: bool,
) -> RequestOutcome {
    let flow_id = builder.ctx.flow_id;
    let mut sends = Vec::new();

    for request in requests {
        match request {
            SessionRequest::Initiate {
                session_id,
                destination,
                flow_class,
                payload,
            } => {
                builder.checkpoint().checkpoint_state.sessions_created += 1;
                builder.checkpoint().checkpoint_state.sessions.insert(
                    session_id,
                    SessionState::Uninitiated {
                        destination,
                        flow_class,
                        payload,
                    },
                );
            }
            SessionRequest::Send {
                session_id,
                payload,
            } => {
                // Sending on a not-yet-sent session flushes the initiation
                // first, so the peer sees (init, data) back to back.
                flush_uninitiated(builder, session_id, &mut sends);

                let Some(session) = builder
                    .checkpoint()
                    .checkpoint_state
                    .sessions
                    .get_mut(&session_id)
                else {
                    if strict {
                        return RequestOutcome::Interrupt(ResumeValue::SessionEnded {
                            session_id,
                        });
                    }
                    continue;
                };
                match session {
                    SessionState::Uninitiated { .. } => unreachable!("flushed above"),
                    SessionState::Initiating {
                        buffered_messages,
                        rejection_error,
                        ..
                    } => {
                        if let Some(error) = rejection_error {
                            if strict {
                                return RequestOutcome::Interrupt(ResumeValue::SessionError {
                                    session_id,
                                    exception: error.surfaced_exception(),
                                });
                            }
                            continue;
                        }
                        let seq = next_buffered_seq(buffered_messages);
                        buffered_messages.push((
                            DedupId::Normal {
                                sender: flow_id,
                                session_id,
                                seq,
                            },
                            SessionPayload::Data { seq, payload },
                        ));
                    }
                    SessionState::Initiated {
                        peer_session_id,
                        peer_party,
                        next_send_seq,
                        received_messages,
                        other_side_errored,
                        other_side_closed,
                        ..
                    } => {
                        if *other_side_errored {
                            if strict {
                                let exception = received_error(received_messages)
                                    .map(|e| e.surfaced_exception())
                                    .unwrap_or_else(|| {
                                        crate::error::FlowException::new("peer flow errored")
                                    });
                                return RequestOutcome::Interrupt(ResumeValue::SessionError {
                                    session_id,
                                    exception,
                                });
                            }
                            continue;
                        }
                        if *other_side_closed {
                            if strict {
                                return RequestOutcome::Interrupt(ResumeValue::SessionEnded {
                                    session_id,
                                });
                            }
                            continue;
                        }
                        let seq = *next_send_seq;
                        *next_send_seq += 1;
                        sends.push(Action::SendExisting {
                            peer: peer_party.clone(),
                            message: ExistingSessionMessage {
                                recipient_session_id: *peer_session_id,
                                payload: SessionPayload::Data { seq, payload },
                            },
                            dedup_id: DedupId::Normal {
                                sender: flow_id,
                                session_id,
                                seq,
                            },
                        });
                    }
                }
            }
            SessionRequest::Close { session_id } => {
                close_session(builder, session_id, &mut sends);
            }
        }
    }

    // Initiations with no eager send still go on the wire at this
    // suspension point.
    let pending: Vec<SessionId> = builder
        .checkpoint()
        .checkpoint_state
        .sessions
        .iter()
        .filter(|(_, s)| matches!(s, SessionState::Uninitiated { .. }))
        .map(|(id, _)| *id)
        .collect();
    for session_id in pending {
        flush_uninitiated(builder, session_id, &mut sends);
    }

    RequestOutcome::Applied(sends)
}

/// Upgrade an `Uninitiated` session to `Initiating`, emitting `SendInitial`.
fn flush_uninitiated(
    builder: &mut TransitionBuilder<'_>,
    session_id: SessionId,
    sends: &mut Vec<Action>,
) {
    let flow_id = builder.ctx.flow_id;
    let app_name = builder.ctx.app_name.clone();
    let platform_version = builder.ctx.platform_version;

    let sessions = &mut builder.checkpoint().checkpoint_state.sessions;
    let Some(SessionState::Uninitiated { .. }) = sessions.get(&session_id) else {
        return;
    };
    let Some(SessionState::Uninitiated {
        destination,
        flow_class,
        payload,
    }) = sessions.remove(&session_id)
    else {
        unreachable!("checked above");
    };

    let message = InitialSessionMessage {
        initiator_session_id: session_id,
        flow_class_name: flow_class,
        app_name,
        platform_version,
        payload,
    };
    sends.push(Action::SendInitial {
        destination: destination.clone(),
        message: message.clone(),
        dedup_id: DedupId::Normal {
            sender: flow_id,
            session_id,
            seq: 0,
        },
    });
    sessions.insert(
        session_id,
        SessionState::Initiating {
            our_session_id: session_id,
            destination,
            initiating_message: message,
            sent: true,
            buffered_messages: Vec::new(),
            rejection_error: None,
        },
    );
}

/// Close our side of a session.
///
/// Established sessions get an `End` on the wire and leave the table;
/// still-initiating sessions buffer the `End` for the confirm flush.
fn close_session(
    builder: &mut TransitionBuilder<'_>,
    session_id: SessionId,
    sends: &mut Vec<Action>,
) {
    enum ClosePlan {
        Keep,
        DropQuietly,
        EndAndDrop {
            peer: crate::session::PartyName,
            recipient: SessionId,
            seq: u64,
            suppress_send: bool,
        },
    }

    let flow_id = builder.ctx.flow_id;
    let plan = match builder
        .checkpoint()
        .checkpoint_state
        .sessions
        .get_mut(&session_id)
    {
        None => ClosePlan::Keep,
        // Never sent; the peer never learns the session existed.
        Some(SessionState::Uninitiated { .. }) => ClosePlan::DropQuietly,
        Some(SessionState::Initiating {
            buffered_messages, ..
        }) => {
            let seq = next_buffered_seq(buffered_messages);
            buffered_messages.push((
                DedupId::Normal {
                    sender: flow_id,
                    session_id,
                    seq,
                },
                SessionPayload::End,
            ));
            ClosePlan::Keep
        }
        Some(SessionState::Initiated {
            peer_session_id,
            peer_party,
            next_send_seq,
            other_side_errored,
            ..
        }) => ClosePlan::EndAndDrop {
            peer: peer_party.clone(),
            recipient: *peer_session_id,
            seq: *next_send_seq,
            suppress_send: *other_side_errored,
        },
    };

    match plan {
        ClosePlan::Keep => {}
        ClosePlan::DropQuietly => {
            builder
                .checkpoint()
                .checkpoint_state
                .sessions
                .remove(&session_id);
        }
        ClosePlan::EndAndDrop {
            peer,
            recipient,
            seq,
            suppress_send,
        } => {
            if !suppress_send {
                sends.push(Action::SendExisting {
                    peer,
                    message: ExistingSessionMessage {
                        recipient_session_id: recipient,
                        payload: SessionPayload::End,
                    },
                    dedup_id: DedupId::Normal {
                        sender: flow_id,
                        session_id,
                        seq,
                    },
                });
            }
            builder
                .checkpoint()
                .checkpoint_state
                .sessions
                .remove(&session_id);
            builder.action(Action::RemoveSessionBindings {
                session_ids: vec![session_id],
            });
        }
    }
}

/// Upgrade `Initiating -> Initiated` and release the buffered sends.
pub(crate) fn confirm_session(
    b: &mut TransitionBuilder<'_>,
    our_sid: SessionId,
    peer_sid: SessionId,
) {
    let sessions = &mut b.checkpoint().checkpoint_state.sessions;
    if !matches!(sessions.get(&our_sid), Some(SessionState::Initiating { .. })) {
        // Duplicate confirm, or confirm for a session we no longer track.
        return;
    }
    let Some(SessionState::Initiating {
        destination,
        buffered_messages,
        ..
    }) = sessions.remove(&our_sid)
    else {
        unreachable!("matched above");
    };

    let next_send_seq = 1 + buffered_messages
        .iter()
        .filter(|(dedup, _)| matches!(dedup, DedupId::Normal { .. }))
        .count() as u64;
    sessions.insert(
        our_sid,
        SessionState::Initiated {
            our_session_id: our_sid,
            peer_session_id: peer_sid,
            peer_party: destination.clone(),
            next_send_seq,
            received_messages: Vec::new(),
            other_side_errored: false,
            other_side_closed: false,
        },
    );

    for (dedup_id, payload) in buffered_messages {
        b.action(Action::SendExisting {
            peer: destination.clone(),
            message: ExistingSessionMessage {
                recipient_session_id: peer_sid,
                payload,
            },
            dedup_id,
        });
    }
}

/// Record a peer error against the session it arrived on.
///
/// This errors the *session*, not the flow: the flow errors only if user
/// code observes the exception and lets it escape. An error on an
/// already-errored session is a replay and changes nothing.
pub(crate) fn apply_session_error(
    b: &mut TransitionBuilder<'_>,
    session_id: SessionId,
    message: crate::session::ErrorSessionMessage,
) {
    use crate::error::{FlowError, FlowException, FlowFault};

    let flow_error = FlowError {
        error_id: message.error_id,
        fault: FlowFault::User(match message.flow_exception {
            Some(mut exception) => {
                exception.original_error_id = Some(message.error_id);
                exception
            }
            None => FlowException::rethrown("peer flow errored", message.error_id),
        }),
    };

    match b
        .checkpoint()
        .checkpoint_state
        .sessions
        .get_mut(&session_id)
    {
        Some(SessionState::Initiating {
            rejection_error, ..
        }) => {
            if rejection_error.is_none() {
                *rejection_error = Some(flow_error);
            }
        }
        Some(SessionState::Initiated {
            other_side_errored,
            received_messages,
            ..
        }) => {
            if !*other_side_errored {
                *other_side_errored = true;
                received_messages.push((0, ReceivedPayload::Error(flow_error)));
            }
        }
        _ => {}
    }
}

/// Sequence for the next payload buffered on an `Initiating` session.
///
/// Seq 0 is the initiating message itself; error prepends use their own
/// dedup identity and do not consume sequence numbers.
fn next_buffered_seq(buffered: &[(DedupId, SessionPayload)]) -> u64 {
    1 + buffered
        .iter()
        .filter(|(dedup, _)| matches!(dedup, DedupId::Normal { .. }))
        .count() as u64
}

fn received_error(received: &[(u64, ReceivedPayload)]) -> Option<&crate::error::FlowError> {
    received.iter().find_map(|(_, payload)| match payload {
        ReceivedPayload::Error(error) => Some(error),
        ReceivedPayload::Data(_) => None,
    })
}

/// What the first scan over awaited sessions decided.
enum SuspensionScan {
    /// An awaited session can never deliver; resume with this value now.
    Terminal(ResumeValue),
    /// An awaited session has an error queued at its front; pop and resume.
    PopError(SessionId),
    /// Every awaited session has data queued.
    AllData,
    /// Keep waiting.
    NotReady,
}

/// Try to satisfy the current suspension from buffered session state.
///
/// Returns the resume value and applies the pops to the builder when the
/// suspension can complete now. Error and end-of-session outcomes take
/// precedence and resume immediately; data resumes only once every awaited
/// session has a payload queued.
pub(crate) fn try_satisfy_suspension(
    builder: &mut TransitionBuilder<'_>,
    suspension: &SuspendReason,
) -> Option<ResumeValue> {
    let SuspendReason::ReceiveFrom(awaited) = suspension else {
        return None;
    };

    match scan_awaited(&builder.state.checkpoint, awaited) {
        SuspensionScan::NotReady => None,
        SuspensionScan::Terminal(value) => Some(value),
        SuspensionScan::PopError(session_id) => {
            let Some(ReceivedPayload::Error(error)) = pop_received(builder, session_id) else {
                unreachable!("scan saw an error at the front");
            };
            Some(ResumeValue::SessionError {
                session_id,
                exception: error.surfaced_exception(),
            })
        }
        SuspensionScan::AllData => {
            let mut messages = Vec::with_capacity(awaited.len());
            for session_id in awaited {
                let Some(ReceivedPayload::Data(payload)) = pop_received(builder, *session_id)
                else {
                    unreachable!("scan saw data at every front");
                };
                messages.push((*session_id, payload));
            }
            Some(ResumeValue::Messages(messages))
        }
    }
}

fn scan_awaited(checkpoint: &crate::checkpoint::Checkpoint, awaited: &[SessionId]) -> SuspensionScan {
    // Terminal outcomes anywhere in the awaited set win over waiting for
    // data on the others; data resumes only when every session is ready.
    let mut all_data = !awaited.is_empty();
    for session_id in awaited {
        match checkpoint.session(*session_id) {
            None => {
                return SuspensionScan::Terminal(ResumeValue::SessionEnded {
                    session_id: *session_id,
                })
            }
            Some(SessionState::Uninitiated { .. }) => all_data = false,
            Some(SessionState::Initiating {
                rejection_error, ..
            }) => match rejection_error {
                Some(error) => {
                    return SuspensionScan::Terminal(ResumeValue::SessionError {
                        session_id: *session_id,
                        exception: error.surfaced_exception(),
                    })
                }
                None => all_data = false,
            },
            Some(SessionState::Initiated {
                received_messages,
                other_side_closed,
                ..
            }) => match received_messages.first() {
                Some((_, ReceivedPayload::Error(_))) => {
                    return SuspensionScan::PopError(*session_id)
                }
                Some((_, ReceivedPayload::Data(_))) => {}
                None => {
                    if *other_side_closed {
                        return SuspensionScan::Terminal(ResumeValue::SessionEnded {
                            session_id: *session_id,
                        });
                    }
                    all_data = false;
                }
            },
        }
    }
    if all_data {
        SuspensionScan::AllData
    } else {
        SuspensionScan::NotReady
    }
}

fn pop_received(builder: &mut TransitionBuilder<'_>, session_id: SessionId) -> Option<ReceivedPayload> {
    match builder
        .checkpoint()
        .checkpoint_state
        .sessions
        .get_mut(&session_id)
    {
        Some(SessionState::Initiated {
            received_messages, ..
        }) if !received_messages.is_empty() => Some(received_messages.remove(0).1),
        _ => None,
    }
}

/// Queue an inbound payload on an `Initiated` session, keeping arrival order.
pub(crate) fn queue_received(
    builder: &mut TransitionBuilder<'_>,
    session_id: SessionId,
    seq: u64,
    payload: ReceivedPayload,
) {
    if let Some(SessionState::Initiated {
        received_messages, ..
    }) = builder
        .checkpoint()
        .checkpoint_state
        .sessions
        .get_mut(&session_id)
    {
        received_messages.push((seq, payload));
    }
}

