//! Durable flow state machine with exactly-once messaging between peers.
//!
//! Flowspan executes long-running, suspendable flows that open sessions to
//! remote peers, exchange ordered messages, checkpoint at every suspension
//! point, and propagate errors deterministically. Between any two
//! suspension points the engine can crash, restart from the last committed
//! checkpoint, and resume without observable divergence:
//!
//! - **Pure transition core** — [`transition`](transition::transition) maps
//!   `(state, event)` to `(state', actions, continuation)` with no side
//!   effects, so the machine's rules can be unit-tested and replayed
//! - **Ordered action interpretation** — every side effect is an
//!   [`Action`] executed strictly in order inside one transactional span
//! - **Exactly-once messaging** — inbound dedup facts commit with the
//!   checkpoint; outbound sends carry stable dedup ids the peer suppresses
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                            FlowFiber                                 │
//! │                                                                      │
//! │   1. Pop event (mailbox, totally ordered per flow)                   │
//! │   2. transition(state, event) → state' + actions + continuation      │
//! │   3. Interceptor chain (history, hospitaliser)                       │
//! │   4. Executor drains actions (begin → persist → send → commit → ack) │
//! │   5. Resume user step, wait for events, or abort                     │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use flowspan::{
//!     Flow, FlowIo, FlowNode, InMemoryBus, InMemoryCheckpointStore, PartyName,
//!     ResumeValue, StepError, StepOutcome, SuspendReason,
//! };
//!
//! struct PingFlow;
//!
//! impl Flow for PingFlow {
//!     type State = PingState;
//!
//!     const CLASS: &'static str = "ping";
//!
//!     fn step(
//!         state: &mut PingState,
//!         input: ResumeValue,
//!         io: &mut FlowIo,
//!     ) -> Result<StepOutcome, StepError> {
//!         match input {
//!             ResumeValue::Start { args, .. } => {
//!                 let session = io.initiate(PartyName::new("bob"), "pong", args);
//!                 Ok(StepOutcome::Suspend(SuspendReason::ReceiveFrom(vec![session])))
//!             }
//!             ResumeValue::Messages(mut messages) => {
//!                 let (_, reply) = messages.remove(0);
//!                 Ok(StepOutcome::Finish(reply))
//!             }
//!             _ => Ok(StepOutcome::Finish(serde_json::Value::Null)),
//!         }
//!     }
//! }
//!
//! let node = FlowNode::builder(PartyName::new("alice"), store, bus)
//!     .register::<PingFlow>()
//!     .build()?;
//! node.run(shutdown_signal).await?;
//! ```
//!
//! # Feature Flags
//!
//! - `postgres` — Enables [`PgCheckpointStore`] for production use with
//!   PostgreSQL
//!
//! # Design Documentation
//!
//! See `DESIGN.md` for architectural decisions.

mod action;
pub mod asyncop;
pub mod bus;
mod checkpoint;
mod error;
mod event;
mod executor;
mod fiber;
mod flow;
pub mod hospital;
pub mod interceptor;
mod runtime;
mod session;
pub mod store;
mod timer;
pub mod transition;

pub use action::{Action, ErrorTarget, RemovalReason};
pub use asyncop::{AsyncOpCompletion, AsyncOpRunner, TaskAsyncOpRunner};
pub use bus::{Delivery, InMemoryBus, MessageBus};
pub use checkpoint::{
    Checkpoint, CheckpointState, CheckpointStatus, ErrorState, FlowOutcome, FlowState,
    MachineState,
};
pub use error::{Error, FlowError, FlowException, FlowFault, Result};
pub use event::{Event, TimerKind};
pub use executor::{ActionExecutor, NoopSoftLocks, SessionBindings, SoftLockManager};
pub use flow::{
    Flow, FlowId, FlowIo, FlowOrigin, InvocationContext, ResumeValue, SessionRequest, StepError,
    StepOutcome, SuspendReason,
};
pub use hospital::{Admission, FlowHospital, HospitalCommand, KeepUnderObservation};
pub use interceptor::{HistoryRecorder, Hospitaliser, InterceptorChain, TransitionInterceptor};
pub use nonempty::NonEmpty;
pub use runtime::{FlowNode, NodeBuilder, RuntimeConfig};
pub use session::{
    DedupHandler, DedupId, ErrorSessionMessage, ExistingSessionMessage, InitialSessionMessage,
    PartyName, ReceivedPayload, SessionId, SessionMessage, SessionPayload, SessionState,
};
#[cfg(feature = "postgres")]
pub use store::PgCheckpointStore;
pub use store::{CheckpointStore, CheckpointTx, FlowSummary, InMemoryCheckpointStore};
pub use timer::{TimerService, TokioTimerService};
pub use transition::{Continuation, TransitionContext, TransitionResult};
