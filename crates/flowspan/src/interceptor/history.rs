//! Transition history recorder.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use time::OffsetDateTime;
use tracing::warn;

use crate::checkpoint::{ErrorState, MachineState};
use crate::event::Event;
use crate::flow::FlowId;
use crate::transition::{Continuation, TransitionResult};

use super::{NextInterceptor, TransitionInterceptor};

/// One recorded transition.
#[derive(Debug, Clone)]
pub struct HistoryRecord {
    /// When the transition executed.
    pub at: OffsetDateTime,
    /// The event's tag.
    pub event: &'static str,
    /// Commit counter before the transition.
    pub commits_before: u64,
    /// Commit counter after the transition.
    pub commits_after: u64,
    /// How many actions the transition emitted.
    pub actions: usize,
    /// The continuation's tag.
    pub continuation: &'static str,
}

/// Keeps a bounded per-flow ring of recent transitions.
///
/// When an errored flow starts propagating, the ring is dumped to the log so
/// the operator can see how it got there. The ring is purged once the flow
/// is removed.
pub struct HistoryRecorder {
    capacity: usize,
    rings: Mutex<HashMap<FlowId, VecDeque<HistoryRecord>>>,
}

impl HistoryRecorder {
    /// Create a recorder keeping `capacity` records per flow.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            rings: Mutex::new(HashMap::new()),
        }
    }

    /// Snapshot one flow's recorded history. Test observability.
    pub fn history(&self, flow_id: FlowId) -> Vec<HistoryRecord> {
        self.rings
            .lock()
            .expect("history lock")
            .get(&flow_id)
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn dump(&self, flow_id: FlowId) {
        let rings = self.rings.lock().expect("history lock");
        if let Some(ring) = rings.get(&flow_id) {
            warn!(%flow_id, "Flow errored and is propagating; recent transitions follow");
            for record in ring {
                warn!(
                    %flow_id,
                    at = %record.at,
                    event = record.event,
                    commits_before = record.commits_before,
                    commits_after = record.commits_after,
                    actions = record.actions,
                    continuation = record.continuation,
                    "transition"
                );
            }
        }
    }
}

fn continuation_tag(continuation: &Continuation) -> &'static str {
    match continuation {
        Continuation::Resume(_) => "resume",
        Continuation::ProcessEvents => "process_events",
        Continuation::Abort => "abort",
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

impl TransitionInterceptor for HistoryRecorder {
    fn intercept(
        &self,
        flow_id: FlowId,
        prev: &MachineState,
        event: &Event,
        result: TransitionResult,
        next: NextInterceptor<'_>,
    ) -> TransitionResult {
        let result = next(result);

        let record = HistoryRecord {
            at: OffsetDateTime::now_utc(),
            event: event.tag(),
            commits_before: prev.checkpoint.checkpoint_state.num_commits,
            commits_after: result.state.checkpoint.checkpoint_state.num_commits,
            actions: result.actions.len(),
            continuation: continuation_tag(&result.continuation),
        };
        {
            let mut rings = self.rings.lock().expect("history lock");
            let ring = rings.entry(flow_id).or_default();
            if ring.len() == self.capacity {
                ring.pop_front();
            }
            ring.push_back(record);
        }

        if !is_propagating(prev) && is_propagating(&result.state) {
            self.dump(flow_id);
        }
        if result.state.removed && matches!(result.continuation, Continuation::Abort) {
            self.rings.lock().expect("history lock").remove(&flow_id);
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::Checkpoint;
    use crate::flow::{FlowOrigin, InvocationContext};
    use crate::interceptor::InterceptorChain;
    use serde_json::json;
    use std::sync::Arc;

    fn state() -> MachineState {
        MachineState::new(Checkpoint::unstarted(
            FlowId::random(),
            InvocationContext {
                origin: FlowOrigin::Client,
                flow_class: "quote".into(),
                started_at: OffsetDateTime::UNIX_EPOCH,
                args: json!({}),
                client_id: None,
            },
        ))
    }

    #[test]
    fn ring_is_bounded() {
        let recorder = Arc::new(HistoryRecorder::new(2));
        let chain = InterceptorChain::new(vec![Arc::clone(&recorder) as _]);
        let state = state();
        let flow_id = state.checkpoint.id;

        for _ in 0..5 {
            let result = TransitionResult {
                state: state.clone(),
                actions: vec![],
                continuation: Continuation::ProcessEvents,
            };
            chain.run(flow_id, &state, &Event::WakeUp, result);
        }

        assert_eq!(recorder.history(flow_id).len(), 2);
    }

    #[test]
    fn removal_purges_the_ring() {
        let recorder = Arc::new(HistoryRecorder::new(8));
        let chain = InterceptorChain::new(vec![Arc::clone(&recorder) as _]);
        let state = state();
        let flow_id = state.checkpoint.id;

        let mut removed = state.clone();
        removed.removed = true;
        let result = TransitionResult {
            state: removed,
            actions: vec![],
            continuation: Continuation::Abort,
        };
        chain.run(flow_id, &state, &Event::Kill, result);

        assert!(recorder.history(flow_id).is_empty());
    }
}
