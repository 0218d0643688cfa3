//! The action executor.
//!
//! Interprets a transition's action list against real resources, strictly in
//! order, without reordering, batching, or dropping. Exactly one
//! `CreateTransaction` may open the transactional span and exactly one
//! `CommitTransaction`/`RollbackTransaction` closes it; persistence actions
//! are only legal inside the span. Sends are not transactional with the
//! store: the engine compensates by pairing dedup facts with checkpoint
//! commits, so a crash between send and commit replays into suppressed
//! duplicates.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::action::{Action, RemovalReason};
use crate::asyncop::AsyncOpRunner;
use crate::bus::MessageBus;
use crate::error::{Error, Result};
use crate::event::TimerKind;
use crate::flow::FlowId;
use crate::session::{ExistingSessionMessage, PartyName, SessionId, SessionMessage, SessionPayload};
use crate::store::{CheckpointStore, CheckpointTx};
use crate::timer::TimerService;

/// Node-level routing table from session ids to flows.
///
/// Written synchronously by the executor (a binding must exist before the
/// initiating message can be answered) and read by the delivery pump.
#[derive(Clone, Default)]
pub struct SessionBindings {
    inner: Arc<Mutex<HashMap<SessionId, FlowId>>>,
}

impl SessionBindings {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a session to its owning flow.
    pub fn bind(&self, session_id: SessionId, flow_id: FlowId) {
        self.inner
            .lock()
            .expect("bindings lock")
            .insert(session_id, flow_id);
    }

    /// Look up the flow owning a session.
    pub fn lookup(&self, session_id: SessionId) -> Option<FlowId> {
        self.inner
            .lock()
            .expect("bindings lock")
            .get(&session_id)
            .copied()
    }

    /// Drop a set of bindings.
    pub fn remove(&self, session_ids: &[SessionId]) {
        let mut inner = self.inner.lock().expect("bindings lock");
        for session_id in session_ids {
            inner.remove(session_id);
        }
    }
}

/// Advisory locks on state consumed by flows.
#[async_trait]
pub trait SoftLockManager: Send + Sync {
    /// Release every soft lock held by `flow_id`.
    async fn release(&self, flow_id: FlowId);
}

/// Default lock manager for deployments without soft-locked state.
#[derive(Debug, Default)]
pub struct NoopSoftLocks;

#[async_trait]
impl SoftLockManager for NoopSoftLocks {
    async fn release(&self, _flow_id: FlowId) {}
}

/// Requests the executor cannot satisfy itself and hands to the node.
#[derive(Debug)]
pub enum NodeCommand {
    /// Retire a flow from the scheduler.
    RemoveFlow {
        /// The flow.
        flow_id: FlowId,
        /// Why it finished.
        reason: RemovalReason,
    },
    /// Discard the fiber and restart from the last committed checkpoint.
    RetryFromSafePoint {
        /// The flow.
        flow_id: FlowId,
    },
    /// The fiber hit an internal failure it cannot recover from in place.
    InternalFailure {
        /// The flow.
        flow_id: FlowId,
        /// Operator-facing description.
        description: String,
    },
}

/// Interprets action lists for one flow.
pub struct ActionExecutor<S: CheckpointStore> {
    flow_id: FlowId,
    local_party: PartyName,
    store: S,
    bus: Arc<dyn MessageBus>,
    timers: Arc<dyn TimerService>,
    async_ops: Arc<dyn AsyncOpRunner>,
    soft_locks: Arc<dyn SoftLockManager>,
    bindings: SessionBindings,
    commands: mpsc::UnboundedSender<NodeCommand>,
}

impl<S: CheckpointStore> ActionExecutor<S> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        flow_id: FlowId,
        local_party: PartyName,
        store: S,
        bus: Arc<dyn MessageBus>,
        timers: Arc<dyn TimerService>,
        async_ops: Arc<dyn AsyncOpRunner>,
        soft_locks: Arc<dyn SoftLockManager>,
        bindings: SessionBindings,
        commands: mpsc::UnboundedSender<NodeCommand>,
    ) -> Self {
        Self {
            flow_id,
            local_party,
            store,
            bus,
            timers,
            async_ops,
            soft_locks,
            bindings,
            commands,
        }
    }

    /// Execute a transition's actions in order.
    ///
    /// On error the open transactional span (if any) is dropped, which rolls
    /// it back; the caller decides between retry and hospitalisation.
    pub(crate) async fn execute_all(&self, actions: Vec<Action>) -> Result<()> {
        let mut tx: Option<S::Tx> = None;

        for action in actions {
            trace!(flow_id = %self.flow_id, action = action.tag(), "Executing action");
            match action {
                Action::CreateTransaction => {
                    if tx.is_some() {
                        return Err(Error::ActionOrdering("nested CreateTransaction".into()));
                    }
                    tx = Some(self.store.begin().await?);
                }
                Action::CommitTransaction => {
                    let span = tx.take().ok_or_else(|| {
                        Error::ActionOrdering("commit without open transaction".into())
                    })?;
                    span.commit().await?;
                }
                Action::RollbackTransaction => {
                    // A bare rollback (the retry path) may arrive with no
                    // span open; that is a no-op.
                    if let Some(span) = tx.take() {
                        span.rollback().await?;
                    }
                }
                Action::PersistCheckpoint {
                    id,
                    checkpoint,
                    is_update,
                } => {
                    let span = tx.as_mut().ok_or_else(|| {
                        Error::ActionOrdering("persist outside transaction".into())
                    })?;
                    span.upsert(id, &checkpoint, is_update).await?;
                }
                Action::RemoveCheckpoint {
                    id,
                    may_have_persistent_results,
                } => {
                    let span = tx.as_mut().ok_or_else(|| {
                        Error::ActionOrdering("remove outside transaction".into())
                    })?;
                    span.remove(id, may_have_persistent_results).await?;
                }
                Action::PersistDeduplicationFacts { facts } => {
                    let span = tx.as_mut().ok_or_else(|| {
                        Error::ActionOrdering("dedup facts outside transaction".into())
                    })?;
                    span.persist_dedup_facts(facts).await?;
                }
                Action::AcknowledgeMessages { handlers } => {
                    for handler in &handlers {
                        self.bus.acknowledge(handler).await?;
                    }
                }
                Action::SendInitial {
                    destination,
                    message,
                    dedup_id,
                } => {
                    // The peer's confirm routes by the initiator session id,
                    // so the binding must exist before the send.
                    self.bindings
                        .bind(message.initiator_session_id, self.flow_id);
                    self.bus
                        .send(
                            &self.local_party,
                            &destination,
                            SessionMessage::Initial(message),
                            dedup_id,
                        )
                        .await?;
                }
                Action::SendExisting {
                    peer,
                    message,
                    dedup_id,
                } => {
                    self.bus
                        .send(
                            &self.local_party,
                            &peer,
                            SessionMessage::Existing(message),
                            dedup_id,
                        )
                        .await?;
                }
                Action::PropagateErrors {
                    messages,
                    sessions,
                    sender,
                } => {
                    debug!(
                        flow_id = %sender,
                        errors = messages.len(),
                        sessions = sessions.len(),
                        "Propagating errors to peer sessions"
                    );
                    for target in &sessions {
                        for message in &messages {
                            self.bus
                                .send(
                                    &self.local_party,
                                    &target.peer,
                                    SessionMessage::Existing(ExistingSessionMessage {
                                        recipient_session_id: target.peer_session_id,
                                        payload: SessionPayload::Error(message.clone()),
                                    }),
                                    crate::session::DedupId::Error {
                                        error_id: message.error_id,
                                        source_session_id: target.our_session_id,
                                    },
                                )
                                .await?;
                        }
                    }
                }
                Action::ScheduleFlowTimeout { flow_id, at } => {
                    self.timers
                        .schedule(flow_id, TimerKind::FlowTimeout, at)
                        .await;
                }
                Action::CancelFlowTimeout { flow_id } => {
                    self.timers.cancel(flow_id, TimerKind::FlowTimeout).await;
                }
                Action::SleepUntil { flow_id, until } => {
                    self.timers.schedule(flow_id, TimerKind::Sleep, until).await;
                }
                Action::ExecuteAsyncOperation {
                    flow_id,
                    dedup_id,
                    operation,
                } => {
                    self.async_ops.submit(flow_id, dedup_id, operation).await;
                }
                Action::ReleaseSoftLocks { flow_id } => {
                    self.soft_locks.release(flow_id).await;
                }
                Action::RemoveSessionBindings { session_ids } => {
                    self.bindings.remove(&session_ids);
                }
                Action::RemoveFlow { flow_id, reason } => {
                    let _ = self.commands.send(NodeCommand::RemoveFlow { flow_id, reason });
                }
                Action::RetryFlowFromSafePoint { flow_id } => {
                    let _ = self
                        .commands
                        .send(NodeCommand::RetryFromSafePoint { flow_id });
                }
            }
        }

        if tx.is_some() {
            return Err(Error::ActionOrdering(
                "transaction span left open at end of action list".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use time::OffsetDateTime;
    use tokio::sync::mpsc;

    use crate::asyncop::TaskAsyncOpRunner;
    use crate::bus::{InMemoryBus, MessageBus};
    use crate::checkpoint::{Checkpoint, MachineState};
    use crate::event::Event;
    use crate::flow::{FlowId, FlowOrigin, InvocationContext, SessionRequest, SuspendReason};
    use crate::session::{PartyName, SessionId};
    use crate::store::{CheckpointStore, InMemoryCheckpointStore};
    use crate::timer::TokioTimerService;
    use crate::transition::{transition, TransitionContext};

    use super::*;

    fn test_executor(
        flow_id: FlowId,
        store: InMemoryCheckpointStore,
        bus: Arc<InMemoryBus>,
    ) -> ActionExecutor<InMemoryCheckpointStore> {
        let (timer_tx, _timer_rx) = mpsc::unbounded_channel();
        let (completion_tx, _completion_rx) = mpsc::unbounded_channel();
        let (command_tx, _command_rx) = mpsc::unbounded_channel();
        ActionExecutor::new(
            flow_id,
            PartyName::new("alice"),
            store,
            bus,
            Arc::new(TokioTimerService::new(timer_tx)),
            Arc::new(TaskAsyncOpRunner::new(
                |_| async { serde_json::Value::Null },
                completion_tx,
            )),
            Arc::new(NoopSoftLocks),
            SessionBindings::new(),
            command_tx,
        )
    }

    fn suspended_state(flow_id: FlowId) -> MachineState {
        let mut state = MachineState::new(Checkpoint::unstarted(
            flow_id,
            InvocationContext {
                origin: FlowOrigin::Client,
                flow_class: "quote".into(),
                started_at: OffsetDateTime::UNIX_EPOCH,
                args: json!({}),
                client_id: None,
            },
        ));
        state.checkpoint.flow_state = crate::checkpoint::FlowState::Started {
            suspension: SuspendReason::Checkpoint,
            frozen_stack: json!({}),
        };
        state.checkpoint.checkpoint_state.num_commits = 1;
        state
    }

    /// Crash between send and commit: the peer saw the message, the
    /// checkpoint did not commit. The replayed transition re-sends with the
    /// same dedup identity, which the peer's bus suppresses, and then
    /// commits.
    #[tokio::test]
    async fn replay_after_crash_between_send_and_commit_deduplicates() {
        let flow_id = FlowId::random();
        let store = InMemoryCheckpointStore::new();
        let bus = Arc::new(InMemoryBus::new());
        let mut bob_deliveries = bus.register(&PartyName::new("bob")).await.unwrap();
        let executor = test_executor(flow_id, store.clone(), Arc::clone(&bus));

        let ctx = TransitionContext {
            flow_id,
            local_party: PartyName::new("alice"),
            app_name: "flowspan-test".into(),
            platform_version: 1,
            flow_timeout: None,
            now: OffsetDateTime::UNIX_EPOCH,
        };
        let state = suspended_state(flow_id);
        let new_session = SessionId::derive(&flow_id, 0);
        let result = transition(
            &ctx,
            &state,
            Event::Suspend {
                reason: SuspendReason::ReceiveFrom(vec![new_session]),
                frozen_stack: json!({}),
                requests: vec![SessionRequest::Initiate {
                    session_id: new_session,
                    destination: PartyName::new("bob"),
                    flow_class: "echo".into(),
                    payload: json!("hello"),
                }],
            },
        );

        // "Crash": everything up to, but not including, the commit runs.
        let commit_at = result
            .actions
            .iter()
            .position(|a| matches!(a, Action::CommitTransaction))
            .expect("suspend must commit");
        let before_crash: Vec<Action> = result.actions[..commit_at].to_vec();
        assert!(executor.execute_all(before_crash).await.is_err());

        // The peer received the message, but nothing committed.
        assert!(bob_deliveries.recv().await.is_some());
        assert!(store.get(flow_id).await.unwrap().is_none());

        // Restart replays the same transition against the same pre-state:
        // identical actions, identical dedup ids.
        let replay = transition(
            &ctx,
            &state,
            Event::Suspend {
                reason: SuspendReason::ReceiveFrom(vec![new_session]),
                frozen_stack: json!({}),
                requests: vec![SessionRequest::Initiate {
                    session_id: new_session,
                    destination: PartyName::new("bob"),
                    flow_class: "echo".into(),
                    payload: json!("hello"),
                }],
            },
        );
        assert_eq!(replay.actions, result.actions);
        executor.execute_all(replay.actions).await.unwrap();

        // The duplicate publish was suppressed; the peer observed exactly
        // one message; the checkpoint is now durable.
        assert_eq!(bus.suppressed_count(), 1);
        assert!(bob_deliveries.try_recv().is_err());
        assert_eq!(
            store
                .get(flow_id)
                .await
                .unwrap()
                .unwrap()
                .checkpoint_state
                .num_commits,
            2
        );
    }

    #[tokio::test]
    async fn persistence_outside_a_transaction_is_rejected() {
        let flow_id = FlowId::random();
        let store = InMemoryCheckpointStore::new();
        let bus = Arc::new(InMemoryBus::new());
        let executor = test_executor(flow_id, store, bus);

        let state = suspended_state(flow_id);
        let err = executor
            .execute_all(vec![Action::PersistCheckpoint {
                id: flow_id,
                checkpoint: Box::new(state.checkpoint),
                is_update: true,
            }])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ActionOrdering(_)));
    }
}
