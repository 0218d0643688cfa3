//! Asynchronous-operation hand-off.
//!
//! A flow suspended on `AwaitAsyncOp` has handed an opaque operation
//! descriptor to the runner. The runner executes it off the fiber and posts
//! the result back as an [`Event::AsyncOpCompleted`](crate::Event::AsyncOpCompleted).
//! Submissions are deduplicated by the suspension's `dedup_id`, so the
//! wake-up resubmission after a crash does not run the operation twice.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::flow::FlowId;

/// A completed asynchronous operation, routed back to its flow.
#[derive(Debug, Clone)]
pub struct AsyncOpCompletion {
    /// The flow awaiting the result.
    pub flow_id: FlowId,
    /// The operation's deduplication key.
    pub dedup_id: String,
    /// The result.
    pub result: Value,
}

/// Executes operations a flow cannot run on its own fiber.
#[async_trait]
pub trait AsyncOpRunner: Send + Sync {
    /// Hand an operation off for execution.
    ///
    /// Must deduplicate by `dedup_id`: a resubmission for an operation that
    /// is in flight or already completed is dropped.
    async fn submit(&self, flow_id: FlowId, dedup_id: String, operation: Value);
}

/// Runs each operation as a tokio task through a user-supplied handler.
pub struct TaskAsyncOpRunner<F> {
    handler: Arc<F>,
    completions: mpsc::UnboundedSender<AsyncOpCompletion>,
    in_flight: Mutex<HashSet<String>>,
    completed: Arc<Mutex<HashMap<String, Value>>>,
}

impl<F, Fut> TaskAsyncOpRunner<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Value> + Send + 'static,
{
    /// Create a runner posting completions into `completions`.
    pub fn new(handler: F, completions: mpsc::UnboundedSender<AsyncOpCompletion>) -> Self {
        Self {
            handler: Arc::new(handler),
            completions,
            in_flight: Mutex::new(HashSet::new()),
            completed: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

#[async_trait]
impl<F, Fut> AsyncOpRunner for TaskAsyncOpRunner<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Value> + Send + 'static,
{
    async fn submit(&self, flow_id: FlowId, dedup_id: String, operation: Value) {
        // An already-finished operation re-delivers its result instead of
        // re-running: the resubmitting flow may have missed the completion
        // across a retry.
        if let Some(result) = self
            .completed
            .lock()
            .expect("runner lock")
            .get(&dedup_id)
            .cloned()
        {
            let _ = self.completions.send(AsyncOpCompletion {
                flow_id,
                dedup_id,
                result,
            });
            return;
        }
        {
            let mut in_flight = self.in_flight.lock().expect("runner lock");
            if !in_flight.insert(dedup_id.clone()) {
                debug!(%flow_id, dedup_id, "Dropping duplicate async-op submission");
                return;
            }
        }

        let handler = Arc::clone(&self.handler);
        let completions = self.completions.clone();
        let completed = Arc::clone(&self.completed);
        tokio::spawn(async move {
            let result = handler(operation).await;
            completed
                .lock()
                .expect("runner lock")
                .insert(dedup_id.clone(), result.clone());
            let _ = completions.send(AsyncOpCompletion {
                flow_id,
                dedup_id,
                result,
            });
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn duplicate_submissions_complete_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let runner = TaskAsyncOpRunner::new(
            |op: Value| async move {
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                json!({"echo": op})
            },
            tx,
        );
        let flow_id = FlowId::random();

        runner
            .submit(flow_id, "op-1".into(), json!("payload"))
            .await;
        // In flight: the duplicate is dropped, not re-run.
        runner
            .submit(flow_id, "op-1".into(), json!("payload"))
            .await;

        let completion = rx.recv().await.unwrap();
        assert_eq!(completion.dedup_id, "op-1");
        assert_eq!(completion.result, json!({"echo": "payload"}));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn resubmission_after_completion_redelivers_the_result() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let runner = TaskAsyncOpRunner::new(|op: Value| async move { json!({"echo": op}) }, tx);
        let flow_id = FlowId::random();

        runner
            .submit(flow_id, "op-1".into(), json!("payload"))
            .await;
        let first = rx.recv().await.unwrap();

        // A retried flow that missed the completion resubmits; the stored
        // result comes back without re-running the operation.
        runner
            .submit(flow_id, "op-1".into(), json!("payload"))
            .await;
        let second = rx.recv().await.unwrap();
        assert_eq!(first.result, second.result);
    }
}
