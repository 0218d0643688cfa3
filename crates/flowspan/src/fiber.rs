//! The flow fiber: the execution vehicle for one flow.
//!
//! A fiber is a logically single-threaded loop that feeds events to the
//! transition function, runs the interceptor chain, hands the resulting
//! actions to the executor, and either resumes user code, waits for the
//! next event, or exits. A flow's events are totally ordered because they
//! all pass through its fiber's mailbox; cross-flow concurrency comes from
//! running many fibers as independent tasks.

use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::checkpoint::{FlowState, MachineState};
use crate::error::{Error, FlowError, FlowException, FlowFault};
use crate::event::Event;
use crate::executor::{ActionExecutor, NodeCommand};
use crate::flow::{Flow, FlowIo, ResumeValue, StepError, StepOutcome};
use crate::interceptor::InterceptorChain;
use crate::session::PartyName;
use crate::store::CheckpointStore;
use crate::transition::{transition, Continuation, TransitionContext};

/// Globally unique error id for a freshly raised error.
///
/// Generated in the fiber, never inside the transition function, so the
/// transition layer stays deterministic.
pub(crate) fn fresh_error_id() -> u64 {
    Uuid::new_v4().as_u64_pair().0
}

/// How a flow step can fail, as seen by the fiber.
pub(crate) enum FiberStepError {
    /// User exception escaping the step.
    User(FlowException),
    /// User code demanded hospitalisation.
    Hospitalize(String),
    /// The engine failed to thaw or freeze the flow's state.
    Internal(String),
}

/// Object-safe view of a registered flow class.
pub(crate) trait ErasedFlow: Send + Sync {
    fn class(&self) -> &'static str;
    fn timeout(&self) -> Option<Duration>;
    fn step(
        &self,
        frozen: &mut Value,
        input: ResumeValue,
        io: &mut FlowIo,
    ) -> Result<StepOutcome, FiberStepError>;
}

/// Captures a concrete [`Flow`] type behind [`ErasedFlow`].
pub(crate) struct TypedFlow<F: Flow>(PhantomData<F>);

impl<F: Flow> Default for TypedFlow<F> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<F: Flow> ErasedFlow for TypedFlow<F> {
    fn class(&self) -> &'static str {
        F::CLASS
    }

    fn timeout(&self) -> Option<Duration> {
        F::timeout()
    }

    fn step(
        &self,
        frozen: &mut Value,
        input: ResumeValue,
        io: &mut FlowIo,
    ) -> Result<StepOutcome, FiberStepError> {
        let mut state: F::State = if frozen.is_null() {
            F::State::default()
        } else {
            serde_json::from_value(frozen.clone()).map_err(|e| {
                FiberStepError::Internal(format!("failed to thaw flow state: {e}"))
            })?
        };

        let outcome = F::step(&mut state, input, io).map_err(|e| match e {
            StepError::Exception(exception) => FiberStepError::User(exception),
            StepError::Hospitalize(description) => FiberStepError::Hospitalize(description),
        })?;

        *frozen = serde_json::to_value(&state)
            .map_err(|e| FiberStepError::Internal(format!("failed to freeze flow state: {e}")))?;
        Ok(outcome)
    }
}

/// Node identity stamped into every transition context.
#[derive(Clone)]
pub(crate) struct FiberIdentity {
    pub local_party: PartyName,
    pub app_name: String,
    pub platform_version: u32,
}

/// One flow's event loop.
pub(crate) struct FlowFiber<S: CheckpointStore> {
    flow_id: crate::flow::FlowId,
    flow: Arc<dyn ErasedFlow>,
    state: MachineState,
    frozen: Value,
    mailbox: mpsc::UnboundedReceiver<Event>,
    executor: ActionExecutor<S>,
    commands: mpsc::UnboundedSender<NodeCommand>,
    interceptors: InterceptorChain,
    identity: FiberIdentity,
}

impl<S: CheckpointStore> FlowFiber<S> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        state: MachineState,
        flow: Arc<dyn ErasedFlow>,
        mailbox: mpsc::UnboundedReceiver<Event>,
        executor: ActionExecutor<S>,
        commands: mpsc::UnboundedSender<NodeCommand>,
        interceptors: InterceptorChain,
        identity: FiberIdentity,
    ) -> Self {
        let frozen = match &state.checkpoint.flow_state {
            FlowState::Started { frozen_stack, .. } => frozen_stack.clone(),
            _ => Value::Null,
        };
        Self {
            flow_id: state.checkpoint.id,
            flow,
            state,
            frozen,
            mailbox,
            executor,
            commands,
            interceptors,
            identity,
        }
    }

    fn context(&self) -> TransitionContext {
        TransitionContext {
            flow_id: self.flow_id,
            local_party: self.identity.local_party.clone(),
            app_name: self.identity.app_name.clone(),
            platform_version: self.identity.platform_version,
            flow_timeout: self.flow.timeout(),
            now: OffsetDateTime::now_utc(),
        }
    }

    /// Drive the flow until it aborts or its mailbox closes.
    pub(crate) async fn run(mut self) {
        // Events generated by the fiber itself (step outcomes, wake-ups)
        // take priority over the mailbox so a resumed step's outcome is the
        // very next transition.
        let mut pending: VecDeque<Event> = VecDeque::new();
        match &self.state.checkpoint.flow_state {
            FlowState::Unstarted { .. } => pending.push_back(Event::Start),
            FlowState::Started { .. } => pending.push_back(Event::WakeUp),
            FlowState::Finished { .. } => {}
        }

        debug!(flow_id = %self.flow_id, class = self.flow.class(), "Fiber started");

        loop {
            let event = match pending.pop_front() {
                Some(event) => event,
                None => match self.mailbox.recv().await {
                    Some(event) => event,
                    None => break,
                },
            };
            let was_suspend = matches!(event, Event::Suspend { .. });

            let ctx = self.context();
            let result = transition(&ctx, &self.state, event.clone());
            let result = self
                .interceptors
                .run(self.flow_id, &self.state, &event, result);
            debug!(
                flow_id = %self.flow_id,
                event = event.tag(),
                actions = result.actions.len(),
                "Applying transition"
            );

            match self.executor.execute_all(result.actions).await {
                Ok(()) => {}
                Err(Error::StaleCheckpoint {
                    stored, attempted, ..
                }) => {
                    // This transition already committed once; reload the
                    // committed state and replay instead of double-applying.
                    warn!(
                        flow_id = %self.flow_id,
                        stored,
                        attempted,
                        "Stale checkpoint commit; retrying from safe point"
                    );
                    let _ = self.commands.send(NodeCommand::RetryFromSafePoint {
                        flow_id: self.flow_id,
                    });
                    return;
                }
                Err(e) => {
                    warn!(flow_id = %self.flow_id, error = %e, "Action execution failed");
                    let _ = self.commands.send(NodeCommand::InternalFailure {
                        flow_id: self.flow_id,
                        description: e.to_string(),
                    });
                    return;
                }
            }

            self.state = result.state;

            match result.continuation {
                Continuation::ProcessEvents => {
                    // A committed suspension may already be satisfiable from
                    // buffered session state.
                    if was_suspend {
                        pending.push_back(Event::WakeUp);
                    }
                }
                Continuation::Resume(value) => {
                    for event in self.run_step(value).into_iter().rev() {
                        pending.push_front(event);
                    }
                }
                Continuation::Abort => break,
            }
        }

        debug!(flow_id = %self.flow_id, "Fiber stopped");
    }

    /// Run one user step and translate its outcome into events.
    fn run_step(&mut self, value: ResumeValue) -> Vec<Event> {
        let mut io = FlowIo::new(
            self.flow_id,
            self.state.checkpoint.checkpoint_state.sessions_created,
        );

        match self.flow.step(&mut self.frozen, value, &mut io) {
            Ok(StepOutcome::Suspend(reason)) => vec![Event::Suspend {
                reason,
                frozen_stack: self.frozen.clone(),
                requests: io.into_requests(),
            }],
            Ok(StepOutcome::Finish(result)) => vec![Event::FlowFinished {
                result,
                requests: io.into_requests(),
            }],
            Err(FiberStepError::User(exception)) => {
                // Uncaught user exception: record, then propagate to peers.
                let error = FlowError::user(fresh_error_id(), exception);
                vec![Event::Error { error }, Event::StartErrorPropagation]
            }
            Err(FiberStepError::Hospitalize(description)) => vec![Event::Error {
                error: FlowError {
                    error_id: fresh_error_id(),
                    fault: FlowFault::Internal {
                        description,
                        hospitalize: true,
                    },
                },
            }],
            Err(FiberStepError::Internal(description)) => vec![Event::Error {
                error: FlowError::internal(fresh_error_id(), description),
            }],
        }
    }
}
