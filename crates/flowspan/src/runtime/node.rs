//! Flow node: registry, builder, and the event pumps.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::asyncop::{AsyncOpCompletion, AsyncOpRunner, TaskAsyncOpRunner};
use crate::bus::{Delivery, MessageBus};
use crate::checkpoint::{Checkpoint, CheckpointStatus, FlowOutcome, MachineState};
use crate::error::{Error, FlowError, FlowException, Result};
use crate::event::{Event, TimerKind};
use crate::executor::{ActionExecutor, NodeCommand, NoopSoftLocks, SessionBindings, SoftLockManager};
use crate::fiber::{fresh_error_id, ErasedFlow, FiberIdentity, FlowFiber, TypedFlow};
use crate::flow::{Flow, FlowId, FlowOrigin, InvocationContext};
use crate::hospital::{Admission, FlowHospital, HospitalCommand, KeepUnderObservation};
use crate::interceptor::{HistoryRecorder, Hospitaliser, InterceptorChain};
use crate::session::{
    DedupId, ErrorSessionMessage, ExistingSessionMessage, InitialSessionMessage, PartyName,
    SessionId, SessionMessage, SessionPayload, SessionState,
};
use crate::store::{CheckpointStore, FlowSummary};
use crate::timer::{TimerService, TokioTimerService};

use super::RuntimeConfig;

/// Namespace for deriving peer-created flow ids from initiating-message
/// identities. A redelivered initiation lands on the same flow id, which is
/// what keeps the confirm dedup-stable across a receiver crash.
const FLOW_ID_NAMESPACE: Uuid = Uuid::NAMESPACE_OID;

type AsyncOpHandler =
    Arc<dyn Fn(Value) -> Pin<Box<dyn Future<Output = Value> + Send>> + Send + Sync>;

/// Registry mapping flow class names to their erased implementations.
struct FlowRegistry {
    entries: HashMap<&'static str, Arc<dyn ErasedFlow>>,
}

impl FlowRegistry {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    fn get(&self, class: &str) -> Option<Arc<dyn ErasedFlow>> {
        self.entries.get(class).cloned()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// A live fiber's handle in the scheduler's arena.
///
/// Sessions and events reference flows by [`FlowId`] only; this map is the
/// single place that resolves an id to a running fiber.
struct FiberHandle {
    sender: mpsc::UnboundedSender<Event>,
    task: JoinHandle<()>,
}

/// Builder for a [`FlowNode`].
///
/// # Example
///
/// ```ignore
/// let node = FlowNode::builder(PartyName::new("alice"), store, bus)
///     .register::<QuoteFlow>()
///     .register::<PriceFlow>()
///     .config(RuntimeConfig::default())
///     .build()?;
///
/// node.run(async { signal::ctrl_c().await.ok(); }).await?;
/// ```
pub struct NodeBuilder<S: CheckpointStore> {
    party: PartyName,
    store: S,
    bus: Arc<dyn MessageBus>,
    registry: FlowRegistry,
    duplicate_flow_class: Option<String>,
    config: RuntimeConfig,
    hospital: Arc<dyn FlowHospital>,
    soft_locks: Arc<dyn SoftLockManager>,
    async_op_handler: AsyncOpHandler,
}

impl<S: CheckpointStore> NodeBuilder<S> {
    fn new(party: PartyName, store: S, bus: Arc<dyn MessageBus>) -> Self {
        Self {
            party,
            store,
            bus,
            registry: FlowRegistry::new(),
            duplicate_flow_class: None,
            config: RuntimeConfig::default(),
            hospital: Arc::new(KeepUnderObservation),
            soft_locks: Arc::new(NoopSoftLocks),
            async_op_handler: Arc::new(|_| Box::pin(async { Value::Null })),
        }
    }

    /// Register a flow class. Each class can only be registered once;
    /// duplicates are reported at build time.
    pub fn register<F: Flow>(mut self) -> Self {
        if self.registry.entries.contains_key(F::CLASS) {
            if self.duplicate_flow_class.is_none() {
                self.duplicate_flow_class = Some(F::CLASS.to_string());
            }
            return self;
        }
        self.registry
            .entries
            .insert(F::CLASS, Arc::new(TypedFlow::<F>::default()));
        self
    }

    /// Set the runtime configuration.
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Install a flow hospital. Defaults to
    /// [`KeepUnderObservation`](crate::hospital::KeepUnderObservation).
    pub fn hospital(mut self, hospital: Arc<dyn FlowHospital>) -> Self {
        self.hospital = hospital;
        self
    }

    /// Install a soft-lock manager. Defaults to a no-op.
    pub fn soft_locks(mut self, soft_locks: Arc<dyn SoftLockManager>) -> Self {
        self.soft_locks = soft_locks;
        self
    }

    /// Install the handler that executes `AwaitAsyncOp` operations.
    ///
    /// Defaults to a handler that completes every operation with `null`.
    pub fn async_ops<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Value> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.async_op_handler = Arc::new(move |operation| {
            let handler = Arc::clone(&handler);
            Box::pin(async move { handler(operation).await })
        });
        self
    }

    /// Build the node.
    pub fn build(self) -> Result<Arc<FlowNode<S>>> {
        if let Some(class) = self.duplicate_flow_class {
            return Err(Error::DuplicateFlowClass(class));
        }

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (timers_tx, timers_rx) = mpsc::unbounded_channel();
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let (admissions_tx, admissions_rx) = mpsc::unbounded_channel();

        let timers: Arc<dyn TimerService> = Arc::new(TokioTimerService::new(timers_tx));
        let handler = self.async_op_handler;
        let async_ops: Arc<dyn AsyncOpRunner> = Arc::new(TaskAsyncOpRunner::new(
            move |operation| handler(operation),
            completions_tx,
        ));

        let history: Arc<dyn crate::interceptor::TransitionInterceptor> =
            Arc::new(HistoryRecorder::new(self.config.history_capacity));
        let interceptors =
            InterceptorChain::new(vec![history, Arc::new(Hospitaliser::new(admissions_tx))]);

        Ok(Arc::new(FlowNode {
            party: self.party,
            store: self.store,
            bus: self.bus,
            timers,
            async_ops,
            soft_locks: self.soft_locks,
            hospital: self.hospital,
            registry: self.registry,
            config: self.config,
            bindings: SessionBindings::new(),
            fibers: Mutex::new(HashMap::new()),
            retry_counts: Mutex::new(HashMap::new()),
            commands: commands_tx,
            interceptors,
            pumps: Mutex::new(Some(Pumps {
                commands: commands_rx,
                timers: timers_rx,
                completions: completions_rx,
                admissions: admissions_rx,
            })),
        }))
    }
}

struct Pumps {
    commands: mpsc::UnboundedReceiver<NodeCommand>,
    timers: mpsc::UnboundedReceiver<(FlowId, TimerKind)>,
    completions: mpsc::UnboundedReceiver<AsyncOpCompletion>,
    admissions: mpsc::UnboundedReceiver<Admission>,
}

/// One party's flow engine.
pub struct FlowNode<S: CheckpointStore> {
    party: PartyName,
    store: S,
    bus: Arc<dyn MessageBus>,
    timers: Arc<dyn TimerService>,
    async_ops: Arc<dyn AsyncOpRunner>,
    soft_locks: Arc<dyn SoftLockManager>,
    hospital: Arc<dyn FlowHospital>,
    registry: FlowRegistry,
    config: RuntimeConfig,
    bindings: SessionBindings,
    fibers: Mutex<HashMap<FlowId, FiberHandle>>,
    retry_counts: Mutex<HashMap<FlowId, u32>>,
    commands: mpsc::UnboundedSender<NodeCommand>,
    interceptors: InterceptorChain,
    pumps: Mutex<Option<Pumps>>,
}

impl<S: CheckpointStore> FlowNode<S> {
    /// Create a node builder.
    pub fn builder(party: PartyName, store: S, bus: Arc<dyn MessageBus>) -> NodeBuilder<S> {
        NodeBuilder::new(party, store, bus)
    }

    /// This node's party name.
    pub fn party(&self) -> &PartyName {
        &self.party
    }

    /// Number of registered flow classes.
    pub fn flow_class_count(&self) -> usize {
        self.registry.len()
    }

    /// Start a flow locally.
    ///
    /// The flow is persisted `Unstarted` before its first user step runs;
    /// pass a `client_id` to make the outcome retrievable after removal.
    pub async fn start_flow(
        &self,
        flow_class: &str,
        args: Value,
        client_id: Option<String>,
    ) -> Result<FlowId> {
        let flow = self
            .registry
            .get(flow_class)
            .ok_or_else(|| Error::UnknownFlowClass(flow_class.to_string()))?;

        let flow_id = FlowId::random();
        let checkpoint = Checkpoint::unstarted(
            flow_id,
            InvocationContext {
                origin: FlowOrigin::Client,
                flow_class: flow_class.to_string(),
                started_at: OffsetDateTime::now_utc(),
                args,
                client_id,
            },
        );
        info!(%flow_id, flow_class, "Starting flow");
        self.spawn_fiber(MachineState::new(checkpoint), flow).await;
        Ok(flow_id)
    }

    /// Current status of a flow, if its checkpoint is stored.
    pub async fn flow_status(&self, flow_id: FlowId) -> Result<Option<CheckpointStatus>> {
        Ok(self.store.get(flow_id).await?.map(|cp| cp.status))
    }

    /// List stored flows, optionally filtered by status.
    pub async fn list_flows(
        &self,
        status_filter: Option<CheckpointStatus>,
    ) -> Result<Vec<FlowSummary>> {
        self.store.list(status_filter).await
    }

    /// Fetch a finished flow's outcome by client correlation key.
    pub async fn result_for_client(&self, client_id: &str) -> Result<Option<FlowOutcome>> {
        self.store.result_for_client(client_id).await
    }

    /// Apply a hospital (or operator) command to a flow.
    pub async fn deliver_hospital_command(
        &self,
        flow_id: FlowId,
        command: HospitalCommand,
    ) -> Result<()> {
        self.apply_hospital_command(flow_id, command).await
    }

    /// Run the node until `shutdown` completes.
    ///
    /// Registers on the bus, recovers runnable flows from the store, then
    /// pumps deliveries, commands, timers, async-op completions, and
    /// hospital admissions into fibers. On shutdown every fiber is asked to
    /// drain at its next suspension point, bounded by
    /// [`RuntimeConfig::shutdown_timeout`].
    pub async fn run<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let mut deliveries = self.bus.register(&self.party).await?;
        let mut pumps = self
            .pumps
            .lock()
            .expect("pumps lock")
            .take()
            .ok_or_else(|| Error::Store("node is already running".into()))?;

        self.recover().await?;

        info!(
            party = %self.party,
            flow_classes = self.registry.len(),
            "Node started"
        );

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                Some(delivery) = deliveries.recv() => {
                    if let Err(e) = self.handle_delivery(delivery).await {
                        warn!(error = %e, "Error handling delivery");
                    }
                }
                Some(command) = pumps.commands.recv() => {
                    if let Err(e) = self.handle_command(command).await {
                        warn!(error = %e, "Error handling node command");
                    }
                }
                Some((flow_id, kind)) = pumps.timers.recv() => {
                    self.send_event(flow_id, Event::TimerExpired { timer: kind });
                }
                Some(completion) = pumps.completions.recv() => {
                    self.send_event(
                        completion.flow_id,
                        Event::AsyncOpCompleted {
                            dedup_id: completion.dedup_id,
                            result: completion.result,
                        },
                    );
                }
                Some(admission) = pumps.admissions.recv() => {
                    if let Err(e) = self.handle_admission(admission).await {
                        warn!(error = %e, "Error handling hospital admission");
                    }
                }
                _ = &mut shutdown => {
                    info!(party = %self.party, "Node shutting down");
                    break;
                }
            }
        }

        // Graceful drain: every fiber parks at its next suspension point.
        let handles: Vec<(FlowId, FiberHandle)> = {
            let mut fibers = self.fibers.lock().expect("fibers lock");
            fibers.drain().collect()
        };
        for (_, handle) in &handles {
            let _ = handle.sender.send(Event::SoftShutdown);
        }
        let drain = async {
            for (_, handle) in handles {
                let _ = handle.task.await;
            }
        };
        if tokio::time::timeout(self.config.shutdown_timeout, drain)
            .await
            .is_err()
        {
            warn!(
                party = %self.party,
                timeout_secs = self.config.shutdown_timeout.as_secs(),
                "Shutdown timeout exceeded, forcing stop"
            );
        }

        Ok(())
    }

    /// Load runnable flows from the store and bring their fibers back.
    async fn recover(&self) -> Result<()> {
        let runnable = self.store.list(Some(CheckpointStatus::Runnable)).await?;
        for summary in runnable {
            let Some(checkpoint) = self.store.get(summary.flow_id).await? else {
                continue;
            };
            let Some(flow) = self.registry.get(&checkpoint.invocation_context.flow_class) else {
                warn!(
                    flow_id = %summary.flow_id,
                    flow_class = %checkpoint.invocation_context.flow_class,
                    "Recovered flow references an unregistered class; leaving it stored"
                );
                continue;
            };
            for session_id in checkpoint.session_ids() {
                self.bindings.bind(session_id, checkpoint.id);
            }
            debug!(flow_id = %checkpoint.id, "Recovering flow");
            self.spawn_fiber(MachineState::new(checkpoint), flow).await;
        }
        Ok(())
    }

    async fn spawn_fiber(&self, state: MachineState, flow: Arc<dyn ErasedFlow>) {
        let flow_id = state.checkpoint.id;

        // Re-arm the flow timeout for resumed flows; fresh flows arm it in
        // their start transition.
        if state.checkpoint.suspension().is_some() {
            if let Some(timeout) = flow.timeout() {
                self.timers
                    .schedule(
                        flow_id,
                        TimerKind::FlowTimeout,
                        OffsetDateTime::now_utc() + timeout,
                    )
                    .await;
            }
        }

        let (sender, mailbox) = mpsc::unbounded_channel();
        let executor = ActionExecutor::new(
            flow_id,
            self.party.clone(),
            self.store.clone(),
            Arc::clone(&self.bus),
            Arc::clone(&self.timers),
            Arc::clone(&self.async_ops),
            Arc::clone(&self.soft_locks),
            self.bindings.clone(),
            self.commands.clone(),
        );
        let fiber = FlowFiber::new(
            state,
            flow,
            mailbox,
            executor,
            self.commands.clone(),
            self.interceptors.clone(),
            FiberIdentity {
                local_party: self.party.clone(),
                app_name: self.config.app_name.clone(),
                platform_version: self.config.platform_version,
            },
        );
        let task = tokio::spawn(fiber.run());

        let mut fibers = self.fibers.lock().expect("fibers lock");
        if let Some(previous) = fibers.insert(flow_id, FiberHandle { sender, task }) {
            // A respawn replaces the old handle; the old fiber has either
            // exited or exits once its mailbox closes.
            drop(previous.sender);
        }
    }

    fn send_event(&self, flow_id: FlowId, event: Event) {
        let sender = self
            .fibers
            .lock()
            .expect("fibers lock")
            .get(&flow_id)
            .map(|handle| handle.sender.clone());
        match sender {
            Some(sender) => {
                let _ = sender.send(event);
            }
            None => debug!(%flow_id, event = event.tag(), "Dropping event for absent fiber"),
        }
    }

    async fn handle_delivery(&self, delivery: Delivery) -> Result<()> {
        // At-least-once inbound: a fact in the durable log means this
        // message's effects already committed.
        if self.store.is_duplicate(&delivery.handler.dedup_id).await? {
            debug!(dedup_id = %delivery.handler.dedup_id, "Dropping already-processed delivery");
            return self.bus.acknowledge(&delivery.handler).await;
        }

        let sender = delivery.sender.clone();
        match delivery.message.clone() {
            SessionMessage::Initial(message) => {
                self.handle_initial(sender, message, delivery).await
            }
            SessionMessage::Existing(message) => self.handle_existing(message, delivery).await,
        }
    }

    /// A peer opened a session: create the counterpart flow.
    async fn handle_initial(
        &self,
        sender: PartyName,
        message: InitialSessionMessage,
        delivery: Delivery,
    ) -> Result<()> {
        let Some(flow) = self.registry.get(&message.flow_class_name) else {
            // Reject the initiation so the peer's session errors instead of
            // hanging.
            let error_id = Uuid::new_v5(
                &FLOW_ID_NAMESPACE,
                delivery.handler.dedup_id.to_string().as_bytes(),
            )
            .as_u64_pair()
            .0;
            warn!(
                flow_class = %message.flow_class_name,
                peer = %sender,
                "Rejecting session initiation for unknown flow class"
            );
            self.bus
                .send(
                    &self.party,
                    &sender,
                    SessionMessage::Existing(ExistingSessionMessage {
                        recipient_session_id: message.initiator_session_id,
                        payload: SessionPayload::Error(ErrorSessionMessage {
                            flow_exception: Some(FlowException::new(format!(
                                "unknown flow class: {}",
                                message.flow_class_name
                            ))),
                            error_id,
                        }),
                    }),
                    DedupId::Error {
                        error_id,
                        source_session_id: message.initiator_session_id,
                    },
                )
                .await?;
            return self.bus.acknowledge(&delivery.handler).await;
        };

        // Derive the flow id from the message identity: a redelivery after a
        // crash recreates the same flow with the same session id, so its
        // confirm deduplicates at the initiator.
        let flow_id = FlowId::from(Uuid::new_v5(
            &FLOW_ID_NAMESPACE,
            delivery.handler.dedup_id.to_string().as_bytes(),
        ));
        let fiber_exists = self
            .fibers
            .lock()
            .expect("fibers lock")
            .contains_key(&flow_id);
        if fiber_exists || self.store.get(flow_id).await?.is_some() {
            // The first delivery's flow is still in flight (or committed);
            // its pending fact covers this copy.
            return self.bus.acknowledge(&delivery.handler).await;
        }

        let our_session_id = SessionId::derive(&flow_id, 0);
        let mut checkpoint = Checkpoint::unstarted(
            flow_id,
            InvocationContext {
                origin: FlowOrigin::Peer {
                    party: sender.clone(),
                    session_id: our_session_id,
                },
                flow_class: message.flow_class_name.clone(),
                started_at: OffsetDateTime::now_utc(),
                args: message.payload.clone(),
                client_id: None,
            },
        );
        checkpoint.checkpoint_state.sessions.insert(
            our_session_id,
            SessionState::Initiated {
                our_session_id,
                peer_session_id: message.initiator_session_id,
                peer_party: sender.clone(),
                next_send_seq: 1,
                received_messages: Vec::new(),
                other_side_errored: false,
                other_side_closed: false,
            },
        );
        checkpoint.checkpoint_state.sessions_created = 1;
        checkpoint
            .pending_dedup_facts
            .push(delivery.handler.dedup_id.clone());

        let mut state = MachineState::new(checkpoint);
        state.pending_acks.push(delivery.handler);

        self.bindings.bind(our_session_id, flow_id);
        info!(
            %flow_id,
            flow_class = %message.flow_class_name,
            peer = %sender,
            "Creating peer-initiated flow"
        );
        self.spawn_fiber(state, flow).await;
        Ok(())
    }

    async fn handle_existing(
        &self,
        message: ExistingSessionMessage,
        delivery: Delivery,
    ) -> Result<()> {
        let Some(flow_id) = self.bindings.lookup(message.recipient_session_id) else {
            // A straggler for a session this node no longer (or never)
            // tracks can never be resolved; acknowledge it so the bus stops
            // redelivering.
            warn!(
                session_id = %message.recipient_session_id,
                "Dropping message for unbound session"
            );
            return self.bus.acknowledge(&delivery.handler).await;
        };
        self.send_event(
            flow_id,
            Event::MessageReceived {
                session_id: message.recipient_session_id,
                payload: message.payload,
                handler: delivery.handler,
            },
        );
        Ok(())
    }

    async fn handle_command(&self, command: NodeCommand) -> Result<()> {
        match command {
            NodeCommand::RemoveFlow { flow_id, reason } => {
                debug!(%flow_id, ?reason, "Removing flow");
                self.fibers.lock().expect("fibers lock").remove(&flow_id);
                self.retry_counts
                    .lock()
                    .expect("retry lock")
                    .remove(&flow_id);
                self.timers.cancel_all(flow_id).await;
                Ok(())
            }
            NodeCommand::RetryFromSafePoint { flow_id } => self.respawn(flow_id).await,
            NodeCommand::InternalFailure {
                flow_id,
                description,
            } => {
                let attempts = {
                    let mut counts = self.retry_counts.lock().expect("retry lock");
                    let entry = counts.entry(flow_id).or_insert(0);
                    *entry += 1;
                    *entry
                };
                if attempts <= self.config.internal_error_retry_budget {
                    warn!(
                        %flow_id,
                        attempts,
                        budget = self.config.internal_error_retry_budget,
                        description = %description,
                        "Internal failure; retrying from last committed checkpoint"
                    );
                    self.respawn(flow_id).await
                } else {
                    warn!(%flow_id, description = %description, "Retry budget exhausted; hospitalising");
                    self.fibers.lock().expect("fibers lock").remove(&flow_id);
                    if let Err(e) = self
                        .store
                        .update_status(flow_id, CheckpointStatus::Hospitalized)
                        .await
                    {
                        debug!(%flow_id, error = %e, "Could not mark flow hospitalized");
                    }
                    let command = self
                        .hospital
                        .admit(Admission {
                            flow_id,
                            error: FlowError::internal(fresh_error_id(), description),
                        })
                        .await;
                    match command {
                        Some(command) => self.apply_hospital_command(flow_id, command).await,
                        None => Ok(()),
                    }
                }
            }
        }
    }

    /// Discard the fiber and rebuild it from the last committed checkpoint.
    async fn respawn(&self, flow_id: FlowId) -> Result<()> {
        self.fibers.lock().expect("fibers lock").remove(&flow_id);

        let Some(mut checkpoint) = self.store.get(flow_id).await? else {
            debug!(%flow_id, "Nothing committed to retry from");
            return Ok(());
        };
        let Some(flow) = self.registry.get(&checkpoint.invocation_context.flow_class) else {
            return Err(Error::UnknownFlowClass(
                checkpoint.invocation_context.flow_class.clone(),
            ));
        };

        if matches!(
            checkpoint.status,
            CheckpointStatus::Hospitalized | CheckpointStatus::Paused
        ) {
            checkpoint.status = CheckpointStatus::Runnable;
            self.store
                .update_status(flow_id, CheckpointStatus::Runnable)
                .await?;
        }

        for session_id in checkpoint.session_ids() {
            self.bindings.bind(session_id, flow_id);
        }
        info!(%flow_id, "Respawning flow from last committed checkpoint");
        self.spawn_fiber(MachineState::new(checkpoint), flow).await;
        Ok(())
    }

    async fn handle_admission(&self, admission: Admission) -> Result<()> {
        let flow_id = admission.flow_id;
        let command = self.hospital.admit(admission).await;
        if let Err(e) = self
            .store
            .update_status(flow_id, CheckpointStatus::Hospitalized)
            .await
        {
            debug!(%flow_id, error = %e, "Could not mark flow hospitalized");
        }
        match command {
            Some(command) => self.apply_hospital_command(flow_id, command).await,
            None => Ok(()),
        }
    }

    async fn apply_hospital_command(
        &self,
        flow_id: FlowId,
        command: HospitalCommand,
    ) -> Result<()> {
        info!(%flow_id, ?command, "Applying hospital command");
        let fiber_alive = self
            .fibers
            .lock()
            .expect("fibers lock")
            .contains_key(&flow_id);

        match command {
            HospitalCommand::RetryFromSafePoint => {
                if fiber_alive {
                    self.send_event(flow_id, Event::RetryFromSafePoint);
                    Ok(())
                } else {
                    self.respawn(flow_id).await
                }
            }
            HospitalCommand::StartErrorPropagation => {
                if fiber_alive {
                    self.send_event(flow_id, Event::StartErrorPropagation);
                    Ok(())
                } else {
                    warn!(%flow_id, "No live fiber to propagate errors from");
                    Ok(())
                }
            }
            HospitalCommand::Pause => {
                if fiber_alive {
                    self.send_event(flow_id, Event::Pause);
                    Ok(())
                } else {
                    self.store
                        .update_status(flow_id, CheckpointStatus::Paused)
                        .await
                }
            }
            HospitalCommand::Kill => {
                if !fiber_alive {
                    self.respawn(flow_id).await?;
                }
                self.send_event(flow_id, Event::Kill);
                Ok(())
            }
        }
    }
}
