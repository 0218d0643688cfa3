//! End-to-end scenarios across two in-process nodes.

#[allow(dead_code)]
mod support;

use std::sync::Arc;

use flowspan::{
    CheckpointStatus, DedupId, ExistingSessionMessage, FlowId, FlowNode, FlowOutcome, InMemoryBus,
    InMemoryCheckpointStore, MessageBus, PartyName, SessionId, SessionMessage, SessionPayload,
};
use serde_json::json;

use support::flows::{EchoFlow, LookupFlow, NapFlow, RefusingFlow, RequestReplyFlow};
use support::harness::{init_test_tracing, wait_until, RunningNode, DEFAULT_TEST_TIMEOUT};

fn two_nodes(bus: &Arc<InMemoryBus>) -> anyhow::Result<(RunningNode, RunningNode)> {
    let alice_store = InMemoryCheckpointStore::new();
    let alice = FlowNode::builder(
        PartyName::new("alice"),
        alice_store.clone(),
        Arc::clone(bus) as _,
    )
    .register::<RequestReplyFlow>()
    .build()?;

    let bob_store = InMemoryCheckpointStore::new();
    let bob = FlowNode::builder(
        PartyName::new("bob"),
        bob_store.clone(),
        Arc::clone(bus) as _,
    )
    .register::<EchoFlow>()
    .register::<RefusingFlow>()
    .build()?;

    Ok((
        RunningNode::spawn(alice, alice_store),
        RunningNode::spawn(bob, bob_store),
    ))
}

#[tokio::test(flavor = "multi_thread")]
async fn happy_path_two_party_flow() -> anyhow::Result<()> {
    init_test_tracing();
    let bus = Arc::new(InMemoryBus::new());
    let (alice, bob) = two_nodes(&bus)?;

    alice
        .node
        .start_flow(
            "request-reply",
            json!({"peer": "bob", "responder": "echo", "payload": "ping"}),
            Some("c1".into()),
        )
        .await?;

    wait_until(DEFAULT_TEST_TIMEOUT, || async {
        alice
            .node
            .result_for_client("c1")
            .await
            .ok()
            .flatten()
            .is_some()
    })
    .await?;

    assert_eq!(
        alice.node.result_for_client("c1").await?,
        Some(FlowOutcome::OrderlyFinish(json!("ping:echo")))
    );

    // Alice's checkpoint row survives for the client lookup; Bob's flow had
    // no client id and is gone entirely.
    let completed = alice.node.list_flows(Some(CheckpointStatus::Completed)).await?;
    assert_eq!(completed.len(), 1);
    wait_until(DEFAULT_TEST_TIMEOUT, || async {
        bob.store.checkpoint_count() == 0
    })
    .await?;

    // Consumed messages left dedup facts behind on both sides.
    assert!(alice.store.dedup_fact_count() > 0);
    assert!(bob.store.dedup_fact_count() > 0);

    alice.stop().await;
    bob.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn peer_error_propagates_and_both_flows_fail() -> anyhow::Result<()> {
    init_test_tracing();
    let bus = Arc::new(InMemoryBus::new());
    let (alice, bob) = two_nodes(&bus)?;

    alice
        .node
        .start_flow(
            "request-reply",
            json!({"peer": "bob", "responder": "refusing", "payload": "please"}),
            Some("c2".into()),
        )
        .await?;

    wait_until(DEFAULT_TEST_TIMEOUT, || async {
        alice
            .node
            .result_for_client("c2")
            .await
            .ok()
            .flatten()
            .is_some()
    })
    .await?;

    // The exception payload made the first hop; our flow rethrew it and
    // finished errored.
    let outcome = alice.node.result_for_client("c2").await?.unwrap();
    let FlowOutcome::ErrorFinish(errors) = outcome else {
        panic!("expected error finish, got {outcome:?}");
    };
    assert_eq!(errors.len(), 1);
    let exception = errors[0].surfaced_exception();
    assert_eq!(exception.message, "nope");
    assert!(exception.original_error_id.is_some());

    // Bob's errored flow had no client id: checkpoint removed after the
    // error teardown.
    wait_until(DEFAULT_TEST_TIMEOUT, || async {
        bob.store.checkpoint_count() == 0
    })
    .await?;

    alice.stop().await;
    bob.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn initiating_to_an_unknown_flow_class_is_rejected() -> anyhow::Result<()> {
    init_test_tracing();
    let bus = Arc::new(InMemoryBus::new());
    let (alice, bob) = two_nodes(&bus)?;

    alice
        .node
        .start_flow(
            "request-reply",
            json!({"peer": "bob", "responder": "no-such-flow", "payload": "hello"}),
            Some("c3".into()),
        )
        .await?;

    wait_until(DEFAULT_TEST_TIMEOUT, || async {
        alice
            .node
            .result_for_client("c3")
            .await
            .ok()
            .flatten()
            .is_some()
    })
    .await?;

    let outcome = alice.node.result_for_client("c3").await?.unwrap();
    let FlowOutcome::ErrorFinish(errors) = outcome else {
        panic!("expected error finish, got {outcome:?}");
    };
    assert!(errors[0]
        .surfaced_exception()
        .message
        .contains("unknown flow class"));

    alice.stop().await;
    bob.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn message_for_an_unbound_session_is_acknowledged() -> anyhow::Result<()> {
    init_test_tracing();
    let bus = Arc::new(InMemoryBus::new());
    let store = InMemoryCheckpointStore::new();
    let node = FlowNode::builder(
        PartyName::new("alice"),
        store.clone(),
        Arc::clone(&bus) as _,
    )
    .register::<RequestReplyFlow>()
    .build()?;
    let running = RunningNode::spawn(node, store);

    // A straggler for a session this node never bound: it cannot be
    // resolved, but it must still be acknowledged or the bus redelivers it
    // forever.
    let stray_session = SessionId::from(0xDEAD);
    bus.send(
        &PartyName::new("bob"),
        &PartyName::new("alice"),
        SessionMessage::Existing(ExistingSessionMessage {
            recipient_session_id: stray_session,
            payload: SessionPayload::Data {
                seq: 1,
                payload: json!("stray"),
            },
        }),
        DedupId::Normal {
            sender: FlowId::random(),
            session_id: stray_session,
            seq: 1,
        },
    )
    .await?;

    wait_until(DEFAULT_TEST_TIMEOUT, || async { bus.unacked_count() == 0 }).await?;

    running.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn sleeping_flow_wakes_and_finishes() -> anyhow::Result<()> {
    init_test_tracing();
    let bus = Arc::new(InMemoryBus::new());
    let store = InMemoryCheckpointStore::new();
    let node = FlowNode::builder(PartyName::new("alice"), store.clone(), bus as _)
        .register::<NapFlow>()
        .build()?;
    let running = RunningNode::spawn(node, store);

    running
        .node
        .start_flow("nap", json!(null), Some("sleeper".into()))
        .await?;

    wait_until(DEFAULT_TEST_TIMEOUT, || async {
        running
            .node
            .result_for_client("sleeper")
            .await
            .ok()
            .flatten()
            .is_some()
    })
    .await?;

    assert_eq!(
        running.node.result_for_client("sleeper").await?,
        Some(FlowOutcome::OrderlyFinish(json!("rested")))
    );

    running.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn async_operation_result_resumes_the_flow() -> anyhow::Result<()> {
    init_test_tracing();
    let bus = Arc::new(InMemoryBus::new());
    let store = InMemoryCheckpointStore::new();
    let node = FlowNode::builder(PartyName::new("alice"), store.clone(), bus as _)
        .register::<LookupFlow>()
        .async_ops(|operation| async move { json!({"looked_up": operation}) })
        .build()?;
    let running = RunningNode::spawn(node, store);

    running
        .node
        .start_flow("lookup", json!("XAU"), Some("looker".into()))
        .await?;

    wait_until(DEFAULT_TEST_TIMEOUT, || async {
        running
            .node
            .result_for_client("looker")
            .await
            .ok()
            .flatten()
            .is_some()
    })
    .await?;

    assert_eq!(
        running.node.result_for_client("looker").await?,
        Some(FlowOutcome::OrderlyFinish(json!({"looked_up": "XAU"})))
    );

    running.stop().await;
    Ok(())
}
