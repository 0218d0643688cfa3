//! Checkpoint storage abstraction.
//!
//! The engine consumes a durable key-value checkpoint store through
//! [`CheckpointStore`]. Writes happen inside a [`CheckpointTx`] span opened
//! by the action executor's `CreateTransaction`; everything staged in the
//! span becomes durable atomically on commit, or not at all.
//!
//! Two implementations are provided:
//!
//! - [`InMemoryCheckpointStore`] — tests and single-process deployments
//! - [`PgCheckpointStore`] — PostgreSQL, behind the `postgres` feature

mod memory;
#[cfg(feature = "postgres")]
mod postgres;

use std::future::Future;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::checkpoint::{Checkpoint, CheckpointStatus, FlowOutcome, FlowState};
use crate::error::Result;
use crate::flow::FlowId;
use crate::session::DedupId;

pub use memory::InMemoryCheckpointStore;
#[cfg(feature = "postgres")]
pub use postgres::PgCheckpointStore;

/// Summary of one stored flow for listing and monitoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowSummary {
    /// The flow.
    pub flow_id: FlowId,
    /// Registered class of the flow program.
    pub flow_class: String,
    /// Operator-visible status.
    pub status: CheckpointStatus,
    /// Commit counter at the last persisted checkpoint.
    pub num_commits: u64,
    /// When the flow was created.
    pub started_at: OffsetDateTime,
}

/// Derive the externally visible outcome of a terminal checkpoint.
pub fn outcome_of(checkpoint: &Checkpoint) -> Option<FlowOutcome> {
    match checkpoint.status {
        CheckpointStatus::Completed => match &checkpoint.flow_state {
            FlowState::Finished { result } => Some(FlowOutcome::OrderlyFinish(
                result.clone().unwrap_or(serde_json::Value::Null),
            )),
            _ => None,
        },
        CheckpointStatus::Failed | CheckpointStatus::Killed => {
            match &checkpoint.error_state {
                crate::checkpoint::ErrorState::Errored { errors, .. } => {
                    Some(FlowOutcome::ErrorFinish(errors.iter().cloned().collect()))
                }
                crate::checkpoint::ErrorState::Clean => Some(FlowOutcome::ErrorFinish(vec![])),
            }
        }
        _ => None,
    }
}

/// Durable storage for checkpoints, dedup facts, and flow results.
///
/// Implementations must provide atomic multi-write transactions and
/// optimistic-replace semantics on the checkpoint rows: an upsert whose
/// `num_commits` is not strictly greater than the stored value is rejected
/// with [`Error::StaleCheckpoint`](crate::Error::StaleCheckpoint).
///
/// Reads outside a transaction see the last committed state (read-committed
/// isolation is sufficient; a flow's checkpoint is only ever written by its
/// owning fiber).
pub trait CheckpointStore: Send + Sync + Clone + 'static {
    /// The transactional span type.
    type Tx: CheckpointTx + Send;

    /// Open a transactional span.
    fn begin(&self) -> impl Future<Output = Result<Self::Tx>> + Send;

    /// Fetch a flow's last committed checkpoint.
    fn get(&self, id: FlowId) -> impl Future<Output = Result<Option<Checkpoint>>> + Send;

    /// List stored flows, optionally filtered by status.
    fn list(
        &self,
        status_filter: Option<CheckpointStatus>,
    ) -> impl Future<Output = Result<Vec<FlowSummary>>> + Send;

    /// Overwrite a flow's status without touching the rest of the checkpoint.
    fn update_status(
        &self,
        id: FlowId,
        status: CheckpointStatus,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Whether an inbound message's dedup identity is already in the durable
    /// log, i.e. its effects have committed.
    fn is_duplicate(&self, dedup_id: &DedupId) -> impl Future<Output = Result<bool>> + Send;

    /// Fetch the outcome of a finished flow by its client correlation key.
    ///
    /// Works both while the (terminal) checkpoint row is still present and
    /// after a removal that kept result rows.
    fn result_for_client(
        &self,
        client_id: &str,
    ) -> impl Future<Output = Result<Option<FlowOutcome>>> + Send;
}

/// A transactional span over the checkpoint store.
///
/// Writes are staged and become durable atomically on [`commit`](Self::commit).
/// Dropping the span without committing discards everything staged.
pub trait CheckpointTx {
    /// Stage a checkpoint upsert keyed by `(id, num_commits)`.
    ///
    /// The staleness check runs against the committed row at commit time:
    /// a `num_commits` that does not strictly exceed the stored value fails
    /// the whole transaction.
    fn upsert(
        &mut self,
        id: FlowId,
        checkpoint: &Checkpoint,
        is_update: bool,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Stage removal of a checkpoint row. Result rows for the flow's
    /// `client_id` are written iff `may_have_persistent_results`.
    fn remove(
        &mut self,
        id: FlowId,
        may_have_persistent_results: bool,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Stage dedup-fact inserts. A fact that already exists is not an error;
    /// it means the message's effects already committed once.
    fn persist_dedup_facts(
        &mut self,
        facts: Vec<DedupId>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Commit the span atomically.
    fn commit(self) -> impl Future<Output = Result<()>> + Send;

    /// Discard the span.
    fn rollback(self) -> impl Future<Output = Result<()>> + Send;
}
