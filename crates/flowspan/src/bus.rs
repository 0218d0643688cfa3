//! The message bus interface and an in-process implementation.
//!
//! The engine assumes a reliable, at-least-once bus with per-destination
//! send deduplication: publishing twice with the same
//! [`DedupId`] delivers at most once. Inbound deliveries carry a
//! [`DedupHandler`] the engine acknowledges only after the commit that made
//! the message's effects durable; unacknowledged deliveries may be replayed.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::Result;
use crate::session::{DedupHandler, DedupId, PartyName, SessionMessage};

/// One inbound message handed to a node.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// The party that published the message.
    pub sender: PartyName,
    /// The message.
    pub message: SessionMessage,
    /// Ack token; acknowledge only after the message's effects commit.
    pub handler: DedupHandler,
}

/// Reliable messaging between nodes.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Register a party and obtain its delivery stream.
    ///
    /// Re-registering the same party (a restarted node) replaces the stream;
    /// messages published while no stream was attached are delivered once
    /// one is.
    async fn register(&self, party: &PartyName) -> Result<mpsc::UnboundedReceiver<Delivery>>;

    /// Publish a message.
    ///
    /// A replayed publish carrying an already-seen `dedup_id` for the same
    /// destination is suppressed; order is preserved per destination.
    async fn send(
        &self,
        from: &PartyName,
        destination: &PartyName,
        message: SessionMessage,
        dedup_id: DedupId,
    ) -> Result<()>;

    /// Confirm a delivery has been durably processed.
    async fn acknowledge(&self, handler: &DedupHandler) -> Result<()>;
}

#[derive(Default)]
struct BusInner {
    endpoints: HashMap<PartyName, mpsc::UnboundedSender<Delivery>>,
    backlog: HashMap<PartyName, VecDeque<Delivery>>,
    seen: HashMap<PartyName, HashSet<DedupId>>,
    unacked: HashMap<u64, (PartyName, Delivery)>,
    next_tag: u64,
    suppressed: u64,
}

/// In-process [`MessageBus`] connecting nodes in one process.
///
/// Backs the integration tests; the same instance is shared by every node
/// taking part in a scenario. Deliveries that are never acknowledged stay
/// queued and can be replayed with [`redeliver_unacked`](Self::redeliver_unacked),
/// which is how crash tests exercise the at-least-once path.
#[derive(Default)]
pub struct InMemoryBus {
    inner: Mutex<BusInner>,
}

impl InMemoryBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// How many publishes were suppressed as duplicates. Test observability.
    pub fn suppressed_count(&self) -> u64 {
        self.inner.lock().expect("bus lock").suppressed
    }

    /// How many deliveries are awaiting acknowledgement. Test observability.
    pub fn unacked_count(&self) -> usize {
        self.inner.lock().expect("bus lock").unacked.len()
    }

    /// Replay every unacknowledged delivery for `party`.
    pub fn redeliver_unacked(&self, party: &PartyName) {
        let mut inner = self.inner.lock().expect("bus lock");
        let replays: Vec<Delivery> = inner
            .unacked
            .values()
            .filter(|(dest, _)| dest == party)
            .map(|(_, delivery)| delivery.clone())
            .collect();
        for delivery in replays {
            deliver(&mut inner, party, delivery);
        }
    }
}

fn deliver(inner: &mut BusInner, destination: &PartyName, delivery: Delivery) {
    let delivered = match inner.endpoints.get(destination) {
        Some(endpoint) => endpoint.send(delivery.clone()).is_ok(),
        None => false,
    };
    if !delivered {
        inner
            .backlog
            .entry(destination.clone())
            .or_default()
            .push_back(delivery);
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn register(&self, party: &PartyName) -> Result<mpsc::UnboundedReceiver<Delivery>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().expect("bus lock");
        if let Some(pending) = inner.backlog.remove(party) {
            for delivery in pending {
                let _ = tx.send(delivery);
            }
        }
        inner.endpoints.insert(party.clone(), tx);
        Ok(rx)
    }

    async fn send(
        &self,
        from: &PartyName,
        destination: &PartyName,
        message: SessionMessage,
        dedup_id: DedupId,
    ) -> Result<()> {
        let mut inner = self.inner.lock().expect("bus lock");
        if !inner
            .seen
            .entry(destination.clone())
            .or_default()
            .insert(dedup_id.clone())
        {
            inner.suppressed += 1;
            debug!(%dedup_id, %destination, "Suppressed duplicate publish");
            return Ok(());
        }

        inner.next_tag += 1;
        let tag = inner.next_tag;
        let delivery = Delivery {
            sender: from.clone(),
            message,
            handler: DedupHandler {
                dedup_id,
                delivery_tag: tag,
            },
        };
        inner
            .unacked
            .insert(tag, (destination.clone(), delivery.clone()));
        deliver(&mut inner, destination, delivery);
        Ok(())
    }

    async fn acknowledge(&self, handler: &DedupHandler) -> Result<()> {
        let mut inner = self.inner.lock().expect("bus lock");
        if inner.unacked.remove(&handler.delivery_tag).is_none() {
            // Acking twice (or acking a replayed tag) is harmless.
            debug!(tag = handler.delivery_tag, "Ack for unknown delivery tag");
        }
        Ok(())
    }
}

impl std::fmt::Debug for InMemoryBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBus").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::FlowId;
    use crate::session::{ExistingSessionMessage, SessionId, SessionPayload};
    use serde_json::json;

    fn message(seq: u64) -> SessionMessage {
        SessionMessage::Existing(ExistingSessionMessage {
            recipient_session_id: SessionId::from(1),
            payload: SessionPayload::Data {
                seq,
                payload: json!("x"),
            },
        })
    }

    fn dedup(seq: u64) -> DedupId {
        DedupId::Normal {
            sender: FlowId::from(uuid::Uuid::from_u128(1)),
            session_id: SessionId::from(1),
            seq,
        }
    }

    #[tokio::test]
    async fn duplicate_publish_is_suppressed() {
        let bus = InMemoryBus::new();
        let alice = PartyName::new("alice");
        let bob = PartyName::new("bob");
        let mut rx = bus.register(&bob).await.unwrap();

        bus.send(&alice, &bob, message(1), dedup(1)).await.unwrap();
        bus.send(&alice, &bob, message(1), dedup(1)).await.unwrap();

        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());
        assert_eq!(bus.suppressed_count(), 1);
    }

    #[tokio::test]
    async fn backlog_flushes_on_register() {
        let bus = InMemoryBus::new();
        let alice = PartyName::new("alice");
        let bob = PartyName::new("bob");

        bus.send(&alice, &bob, message(1), dedup(1)).await.unwrap();

        // Bob comes up after the publish and still receives it.
        let mut rx = bus.register(&bob).await.unwrap();
        let delivery = rx.recv().await.unwrap();
        assert_eq!(delivery.sender, alice);
    }

    #[tokio::test]
    async fn unacked_deliveries_replay() {
        let bus = InMemoryBus::new();
        let alice = PartyName::new("alice");
        let bob = PartyName::new("bob");
        let mut rx = bus.register(&bob).await.unwrap();

        bus.send(&alice, &bob, message(1), dedup(1)).await.unwrap();
        let first = rx.recv().await.unwrap();
        assert_eq!(bus.unacked_count(), 1);

        // A crashed consumer never acked; replay hands it over again.
        bus.redeliver_unacked(&bob);
        let second = rx.recv().await.unwrap();
        assert_eq!(first.handler.dedup_id, second.handler.dedup_id);

        bus.acknowledge(&first.handler).await.unwrap();
        assert_eq!(bus.unacked_count(), 0);
    }
}
