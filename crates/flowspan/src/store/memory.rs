//! In-memory checkpoint store.
//!
//! Backs the test suite and single-process deployments. Transactions stage
//! their writes and apply them under one lock on commit, so a span is
//! all-or-nothing exactly like the Postgres store.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::checkpoint::{Checkpoint, CheckpointStatus, FlowOutcome};
use crate::error::{Error, Result};
use crate::flow::FlowId;
use crate::session::DedupId;

use super::{outcome_of, CheckpointStore, CheckpointTx, FlowSummary};

#[derive(Default)]
struct Inner {
    checkpoints: HashMap<FlowId, Checkpoint>,
    dedup_log: HashSet<DedupId>,
    results: HashMap<String, FlowOutcome>,
}

/// An in-memory [`CheckpointStore`].
#[derive(Clone, Default)]
pub struct InMemoryCheckpointStore {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryCheckpointStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of checkpoint rows currently stored. Test observability.
    pub fn checkpoint_count(&self) -> usize {
        self.inner.lock().expect("store lock").checkpoints.len()
    }

    /// Number of dedup facts in the durable log. Test observability.
    pub fn dedup_fact_count(&self) -> usize {
        self.inner.lock().expect("store lock").dedup_log.len()
    }
}

enum TxOp {
    Upsert(FlowId, Box<Checkpoint>),
    Remove(FlowId, bool),
    Facts(Vec<DedupId>),
}

/// A staged transaction over [`InMemoryCheckpointStore`].
pub struct InMemoryTx {
    inner: Arc<Mutex<Inner>>,
    ops: Vec<TxOp>,
}

impl CheckpointStore for InMemoryCheckpointStore {
    type Tx = InMemoryTx;

    async fn begin(&self) -> Result<InMemoryTx> {
        Ok(InMemoryTx {
            inner: Arc::clone(&self.inner),
            ops: Vec::new(),
        })
    }

    async fn get(&self, id: FlowId) -> Result<Option<Checkpoint>> {
        Ok(self
            .inner
            .lock()
            .expect("store lock")
            .checkpoints
            .get(&id)
            .cloned())
    }

    async fn list(&self, status_filter: Option<CheckpointStatus>) -> Result<Vec<FlowSummary>> {
        let inner = self.inner.lock().expect("store lock");
        let mut summaries: Vec<FlowSummary> = inner
            .checkpoints
            .values()
            .filter(|cp| status_filter.is_none_or(|status| cp.status == status))
            .map(|cp| FlowSummary {
                flow_id: cp.id,
                flow_class: cp.invocation_context.flow_class.clone(),
                status: cp.status,
                num_commits: cp.checkpoint_state.num_commits,
                started_at: cp.invocation_context.started_at,
            })
            .collect();
        summaries.sort_by_key(|s| s.flow_id);
        Ok(summaries)
    }

    async fn update_status(&self, id: FlowId, status: CheckpointStatus) -> Result<()> {
        let mut inner = self.inner.lock().expect("store lock");
        let checkpoint = inner
            .checkpoints
            .get_mut(&id)
            .ok_or(Error::FlowNotFound(id))?;
        checkpoint.status = status;
        Ok(())
    }

    async fn is_duplicate(&self, dedup_id: &DedupId) -> Result<bool> {
        Ok(self
            .inner
            .lock()
            .expect("store lock")
            .dedup_log
            .contains(dedup_id))
    }

    async fn result_for_client(&self, client_id: &str) -> Result<Option<FlowOutcome>> {
        let inner = self.inner.lock().expect("store lock");
        if let Some(outcome) = inner.results.get(client_id) {
            return Ok(Some(outcome.clone()));
        }
        Ok(inner
            .checkpoints
            .values()
            .find(|cp| cp.invocation_context.client_id.as_deref() == Some(client_id))
            .and_then(outcome_of))
    }
}

impl CheckpointTx for InMemoryTx {
    async fn upsert(&mut self, id: FlowId, checkpoint: &Checkpoint, _is_update: bool) -> Result<()> {
        self.ops.push(TxOp::Upsert(id, Box::new(checkpoint.clone())));
        Ok(())
    }

    async fn remove(&mut self, id: FlowId, may_have_persistent_results: bool) -> Result<()> {
        self.ops.push(TxOp::Remove(id, may_have_persistent_results));
        Ok(())
    }

    async fn persist_dedup_facts(&mut self, facts: Vec<DedupId>) -> Result<()> {
        self.ops.push(TxOp::Facts(facts));
        Ok(())
    }

    async fn commit(self) -> Result<()> {
        let mut inner = self.inner.lock().expect("store lock");

        // Validate before applying anything so a stale upsert aborts the
        // whole span.
        for op in &self.ops {
            if let TxOp::Upsert(id, checkpoint) = op {
                if let Some(stored) = inner.checkpoints.get(id) {
                    let stored_commits = stored.checkpoint_state.num_commits;
                    let attempted = checkpoint.checkpoint_state.num_commits;
                    if attempted <= stored_commits {
                        return Err(Error::StaleCheckpoint {
                            flow_id: *id,
                            stored: stored_commits,
                            attempted,
                        });
                    }
                }
            }
        }

        for op in self.ops {
            match op {
                TxOp::Upsert(id, checkpoint) => {
                    inner.checkpoints.insert(id, *checkpoint);
                }
                TxOp::Remove(id, may_have_persistent_results) => {
                    if let Some(checkpoint) = inner.checkpoints.remove(&id) {
                        if may_have_persistent_results {
                            if let (Some(client_id), Some(outcome)) = (
                                checkpoint.invocation_context.client_id.clone(),
                                outcome_of(&checkpoint),
                            ) {
                                inner.results.insert(client_id, outcome);
                            }
                        }
                    }
                }
                TxOp::Facts(facts) => {
                    // A conflicting fact means the message was already
                    // delivered once; that is not an error.
                    inner.dedup_log.extend(facts);
                }
            }
        }
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{FlowOrigin, InvocationContext};
    use serde_json::json;
    use time::OffsetDateTime;

    fn checkpoint(flow_id: FlowId, commits: u64) -> Checkpoint {
        let mut cp = Checkpoint::unstarted(
            flow_id,
            InvocationContext {
                origin: FlowOrigin::Client,
                flow_class: "quote".into(),
                started_at: OffsetDateTime::UNIX_EPOCH,
                args: json!({}),
                client_id: Some("c1".into()),
            },
        );
        cp.checkpoint_state.num_commits = commits;
        cp
    }

    #[tokio::test]
    async fn commit_applies_atomically() {
        let store = InMemoryCheckpointStore::new();
        let flow_id = FlowId::random();

        let mut tx = store.begin().await.unwrap();
        tx.upsert(flow_id, &checkpoint(flow_id, 1), false)
            .await
            .unwrap();
        tx.persist_dedup_facts(vec![DedupId::Error {
            error_id: 1,
            source_session_id: crate::session::SessionId::from(1),
        }])
        .await
        .unwrap();

        // Nothing is visible before commit.
        assert!(store.get(flow_id).await.unwrap().is_none());
        assert_eq!(store.dedup_fact_count(), 0);

        tx.commit().await.unwrap();
        assert!(store.get(flow_id).await.unwrap().is_some());
        assert_eq!(store.dedup_fact_count(), 1);
    }

    #[tokio::test]
    async fn stale_upsert_rejects_the_whole_span() {
        let store = InMemoryCheckpointStore::new();
        let flow_id = FlowId::random();

        let mut tx = store.begin().await.unwrap();
        tx.upsert(flow_id, &checkpoint(flow_id, 7), false)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        // Replayed commit at the same version must be rejected, and its
        // side writes must not land.
        let mut replay = store.begin().await.unwrap();
        replay
            .upsert(flow_id, &checkpoint(flow_id, 7), true)
            .await
            .unwrap();
        replay
            .persist_dedup_facts(vec![DedupId::Error {
                error_id: 9,
                source_session_id: crate::session::SessionId::from(2),
            }])
            .await
            .unwrap();
        let err = replay.commit().await.unwrap_err();
        assert!(matches!(err, Error::StaleCheckpoint { stored: 7, attempted: 7, .. }));
        assert_eq!(store.dedup_fact_count(), 0);
    }

    #[tokio::test]
    async fn rollback_discards_staged_writes() {
        let store = InMemoryCheckpointStore::new();
        let flow_id = FlowId::random();

        let mut tx = store.begin().await.unwrap();
        tx.upsert(flow_id, &checkpoint(flow_id, 1), false)
            .await
            .unwrap();
        tx.rollback().await.unwrap();

        assert!(store.get(flow_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn remove_with_results_keeps_the_outcome() {
        let store = InMemoryCheckpointStore::new();
        let flow_id = FlowId::random();

        let mut cp = checkpoint(flow_id, 1);
        cp.status = CheckpointStatus::Completed;
        cp.flow_state = crate::checkpoint::FlowState::Finished {
            result: Some(json!("done")),
        };
        let mut tx = store.begin().await.unwrap();
        tx.upsert(flow_id, &cp, false).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        tx.remove(flow_id, true).await.unwrap();
        tx.commit().await.unwrap();

        assert!(store.get(flow_id).await.unwrap().is_none());
        assert_eq!(
            store.result_for_client("c1").await.unwrap(),
            Some(FlowOutcome::OrderlyFinish(json!("done")))
        );
    }
}
