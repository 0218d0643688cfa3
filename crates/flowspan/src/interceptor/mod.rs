//! The transition interceptor chain.
//!
//! Interceptors wrap the transition executor: each sees the pre-state, the
//! event, and the inner result, and may pass it through, inspect it, or
//! replace it. Composition is an explicit ordered list, outermost first.

mod history;
mod hospital;

use std::sync::Arc;

use crate::checkpoint::MachineState;
use crate::event::Event;
use crate::flow::FlowId;
use crate::transition::TransitionResult;

pub use history::{HistoryRecord, HistoryRecorder};
pub use hospital::Hospitaliser;

/// The rest of the chain below an interceptor.
pub type NextInterceptor<'a> = &'a mut dyn FnMut(TransitionResult) -> TransitionResult;

/// A wrapper around transition execution.
pub trait TransitionInterceptor: Send + Sync {
    /// Observe or replace one transition result.
    ///
    /// `result` is what the layer above produced; call `next` to hand it to
    /// the layer below and receive the final result back.
    fn intercept(
        &self,
        flow_id: FlowId,
        prev: &MachineState,
        event: &Event,
        result: TransitionResult,
        next: NextInterceptor<'_>,
    ) -> TransitionResult;
}

/// An ordered interceptor stack.
#[derive(Clone, Default)]
pub struct InterceptorChain {
    interceptors: Vec<Arc<dyn TransitionInterceptor>>,
}

impl InterceptorChain {
    /// Build a chain from outermost to innermost.
    pub fn new(interceptors: Vec<Arc<dyn TransitionInterceptor>>) -> Self {
        Self { interceptors }
    }

    /// Run the chain over a transition result.
    pub fn run(
        &self,
        flow_id: FlowId,
        prev: &MachineState,
        event: &Event,
        result: TransitionResult,
    ) -> TransitionResult {
        run_from(&self.interceptors, 0, flow_id, prev, event, result)
    }
}

fn run_from(
    interceptors: &[Arc<dyn TransitionInterceptor>],
    index: usize,
    flow_id: FlowId,
    prev: &MachineState,
    event: &Event,
    result: TransitionResult,
) -> TransitionResult {
    match interceptors.get(index) {
        None => result,
        Some(interceptor) => interceptor.intercept(flow_id, prev, event, result, &mut |inner| {
            run_from(interceptors, index + 1, flow_id, prev, event, inner)
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::Checkpoint;
    use crate::flow::{FlowOrigin, InvocationContext};
    use crate::transition::Continuation;
    use serde_json::json;
    use std::sync::Mutex;
    use time::OffsetDateTime;

    struct Tagger {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl TransitionInterceptor for Tagger {
        fn intercept(
            &self,
            _flow_id: FlowId,
            _prev: &MachineState,
            _event: &Event,
            result: TransitionResult,
            next: NextInterceptor<'_>,
        ) -> TransitionResult {
            self.log.lock().unwrap().push(self.name);
            next(result)
        }
    }

    #[test]
    fn chain_runs_outermost_first() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = InterceptorChain::new(vec![
            Arc::new(Tagger {
                name: "outer",
                log: Arc::clone(&log),
            }),
            Arc::new(Tagger {
                name: "inner",
                log: Arc::clone(&log),
            }),
        ]);

        let state = MachineState::new(Checkpoint::unstarted(
            FlowId::random(),
            InvocationContext {
                origin: FlowOrigin::Client,
                flow_class: "quote".into(),
                started_at: OffsetDateTime::UNIX_EPOCH,
                args: json!({}),
                client_id: None,
            },
        ));
        let result = TransitionResult {
            state: state.clone(),
            actions: vec![],
            continuation: Continuation::ProcessEvents,
        };

        let out = chain.run(state.checkpoint.id, &state, &Event::WakeUp, result.clone());
        assert_eq!(out, result);
        assert_eq!(*log.lock().unwrap(), vec!["outer", "inner"]);
    }
}
