//! The timer service interface and a tokio-backed implementation.
//!
//! The engine schedules two kinds of per-flow timers: sleep wake-ups and
//! the overall flow timeout. Both are idempotent per `(flow, kind)`:
//! scheduling again replaces the pending timer, which is what makes the
//! wake-up re-arm after a crash harmless.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::event::TimerKind;
use crate::flow::FlowId;

/// Per-flow timer scheduling.
#[async_trait]
pub trait TimerService: Send + Sync {
    /// Arm (or re-arm) the `(flow, kind)` timer to fire at `at`.
    async fn schedule(&self, flow_id: FlowId, kind: TimerKind, at: OffsetDateTime);

    /// Disarm the `(flow, kind)` timer. Cancelling a timer that is not
    /// pending is a no-op.
    async fn cancel(&self, flow_id: FlowId, kind: TimerKind);

    /// Disarm everything for a removed flow.
    async fn cancel_all(&self, flow_id: FlowId);
}

/// Tokio-backed [`TimerService`].
///
/// Expirations are pushed into the channel handed to [`new`](Self::new);
/// the node routes them to fibers as
/// [`Event::TimerExpired`](crate::Event::TimerExpired).
pub struct TokioTimerService {
    expirations: mpsc::UnboundedSender<(FlowId, TimerKind)>,
    pending: Mutex<HashMap<(FlowId, TimerKind), JoinHandle<()>>>,
}

impl TokioTimerService {
    /// Create a service that reports expirations into `expirations`.
    pub fn new(expirations: mpsc::UnboundedSender<(FlowId, TimerKind)>) -> Self {
        Self {
            expirations,
            pending: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl TimerService for TokioTimerService {
    async fn schedule(&self, flow_id: FlowId, kind: TimerKind, at: OffsetDateTime) {
        let delay = at - OffsetDateTime::now_utc();
        let delay = if delay.is_positive() {
            std::time::Duration::try_from(delay).unwrap_or(std::time::Duration::ZERO)
        } else {
            std::time::Duration::ZERO
        };

        let expirations = self.expirations.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = expirations.send((flow_id, kind));
        });

        let mut pending = self.pending.lock().expect("timer lock");
        if let Some(previous) = pending.insert((flow_id, kind), handle) {
            debug!(%flow_id, ?kind, "Replacing pending timer");
            previous.abort();
        }
    }

    async fn cancel(&self, flow_id: FlowId, kind: TimerKind) {
        if let Some(handle) = self
            .pending
            .lock()
            .expect("timer lock")
            .remove(&(flow_id, kind))
        {
            handle.abort();
        }
    }

    async fn cancel_all(&self, flow_id: FlowId) {
        let mut pending = self.pending.lock().expect("timer lock");
        for kind in [TimerKind::Sleep, TimerKind::FlowTimeout] {
            if let Some(handle) = pending.remove(&(flow_id, kind)) {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn overdue_timer_fires_immediately() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let timers = TokioTimerService::new(tx);
        let flow_id = FlowId::random();

        timers
            .schedule(flow_id, TimerKind::Sleep, OffsetDateTime::UNIX_EPOCH)
            .await;

        let (fired, kind) = rx.recv().await.unwrap();
        assert_eq!(fired, flow_id);
        assert_eq!(kind, TimerKind::Sleep);
    }

    #[tokio::test]
    async fn rescheduling_replaces_the_pending_timer() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let timers = TokioTimerService::new(tx);
        let flow_id = FlowId::random();

        // The far-future timer is replaced by one already due, so exactly
        // one expiration arrives.
        timers
            .schedule(
                flow_id,
                TimerKind::FlowTimeout,
                OffsetDateTime::now_utc() + time::Duration::hours(1),
            )
            .await;
        timers
            .schedule(flow_id, TimerKind::FlowTimeout, OffsetDateTime::UNIX_EPOCH)
            .await;

        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn cancel_prevents_expiry() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let timers = TokioTimerService::new(tx);
        let flow_id = FlowId::random();

        timers
            .schedule(
                flow_id,
                TimerKind::Sleep,
                OffsetDateTime::now_utc() + time::Duration::milliseconds(20),
            )
            .await;
        timers.cancel(flow_id, TimerKind::Sleep).await;

        tokio::time::sleep(std::time::Duration::from_millis(60)).await;
        assert!(rx.try_recv().is_err());
    }
}
