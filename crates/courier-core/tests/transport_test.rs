// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Listener backpressure and sending-agent behavior over the in-memory
//! transport.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use common::*;
use courier_core::config::{DurabilityMode, DurabilitySettings};
use courier_core::listener::ListeningStatus;
use courier_core::persistence::{DeadLetterFilter, MessageStore};
use courier_core::sending::SendResult;
use courier_core::testing::InMemoryTransport;
use courier_core::transport::SendOutcome;
use courier_core::{DeliveryOptions, EndpointOptions, Envelope, Message, MessageIdentity, SendError};

fn order_message(order_id: u32) -> courier_core::TransportMessage {
    Envelope::new(
        OrderPlaced::MESSAGE_TYPE,
        serde_json::to_vec(&OrderPlaced { order_id }).unwrap(),
    )
    .to_transport()
}

fn counting_handler(
    counter: &Arc<AtomicUsize>,
) -> impl Fn(OrderPlaced, courier_core::MessageContext) -> std::future::Ready<courier_core::HandlerResult>
+ Send
+ Sync
+ 'static {
    let counter = counter.clone();
    move |_order, _ctx| {
        counter.fetch_add(1, Ordering::SeqCst);
        std::future::ready(Ok(()))
    }
}

#[tokio::test]
async fn test_listener_too_busy_then_back_without_losing_messages() {
    let store = memory_store().await;
    let transport = InMemoryTransport::new();
    let orders = InMemoryTransport::uri("orders");
    let handled = Arc::new(AtomicUsize::new(0));

    let runtime = builder(store, manual_clock(), DurabilityMode::Solo)
        .transport(Arc::new(transport.clone()))
        .listen(
            orders.clone(),
            EndpointOptions::buffered().with_buffering(4, 2).sequential(),
        )
        .handle(counting_handler(&handled))
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();
    let mut events = runtime.subscribe_listener(&orders).unwrap();

    for order_id in 0..10 {
        transport
            .deliver(&orders, vec![order_message(order_id)])
            .await
            .unwrap();
    }
    assert_eq!(runtime.listener_status(&orders), Some(ListeningStatus::TooBusy));
    assert_eq!(transport.backlog(&orders), 6);

    assert!(eventually(|| handled.load(Ordering::SeqCst) == 10).await);
    assert_eq!(transport.backlog(&orders), 0);
    assert_eq!(runtime.listener_status(&orders), Some(ListeningStatus::Active));

    let first = events.recv().await.unwrap();
    assert_eq!(first.previous, ListeningStatus::Active);
    assert_eq!(first.current, ListeningStatus::TooBusy);
    let second = events.recv().await.unwrap();
    assert_eq!(second.previous, ListeningStatus::TooBusy);
    assert_eq!(second.current, ListeningStatus::Active);

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_durable_listener_skips_redelivered_envelopes() {
    let store = memory_store().await;
    let transport = InMemoryTransport::new();
    let orders = InMemoryTransport::uri("orders");
    let handled = Arc::new(AtomicUsize::new(0));

    let runtime = builder(store.clone(), manual_clock(), DurabilityMode::Solo)
        .transport(Arc::new(transport.clone()))
        .listen(orders.clone(), EndpointOptions::durable())
        .handle(counting_handler(&handled))
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();

    let message = order_message(1);
    transport.deliver(&orders, vec![message.clone()]).await.unwrap();
    assert!(eventually_counts(store.as_ref(), |c| c.handled == 1).await);

    transport.deliver(&orders, vec![message]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(handled.load(Ordering::SeqCst), 1);
    assert_eq!(store.fetch_counts().await.unwrap().handled, 1);

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_reused_id_is_kept_per_destination() {
    let store = memory_store_with_identity(MessageIdentity::IdAndDestination).await;
    let transport = InMemoryTransport::new();
    let orders = InMemoryTransport::uri("orders");
    let audit = InMemoryTransport::uri("audit");
    let handled = Arc::new(AtomicUsize::new(0));

    let runtime = builder(store.clone(), manual_clock(), DurabilityMode::Solo)
        .transport(Arc::new(transport.clone()))
        .listen(orders.clone(), EndpointOptions::durable())
        .listen(audit.clone(), EndpointOptions::durable())
        .handle(counting_handler(&handled))
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();

    let message = order_message(1);
    transport.deliver(&orders, vec![message.clone()]).await.unwrap();
    transport.deliver(&audit, vec![message.clone()]).await.unwrap();
    assert!(eventually_counts(store.as_ref(), |c| c.handled == 2).await);
    assert_eq!(handled.load(Ordering::SeqCst), 2);

    // Still a duplicate at the same destination.
    transport.deliver(&orders, vec![message]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(handled.load(Ordering::SeqCst), 2);
    assert_eq!(store.fetch_counts().await.unwrap().handled, 2);

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_malformed_message_is_dead_lettered_with_the_batch() {
    let store = memory_store().await;
    let transport = InMemoryTransport::new();
    let orders = InMemoryTransport::uri("orders");
    let handled = Arc::new(AtomicUsize::new(0));

    let runtime = builder(store.clone(), manual_clock(), DurabilityMode::Solo)
        .transport(Arc::new(transport.clone()))
        .listen(orders.clone(), EndpointOptions::durable())
        .handle(counting_handler(&handled))
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();

    let mut malformed = order_message(1);
    malformed
        .headers
        .insert("attempts".to_string(), "not-a-number".to_string());
    transport
        .deliver(&orders, vec![malformed.clone(), order_message(2)])
        .await
        .unwrap();

    assert!(eventually_counts(store.as_ref(), |c| c.handled == 1).await);
    assert_eq!(handled.load(Ordering::SeqCst), 1);
    let counts = store.fetch_counts().await.unwrap();
    assert_eq!(counts.dead_letter, 1);
    assert_eq!(counts.incoming, 0);

    let dead_letters = runtime.dead_letters();
    let filter = DeadLetterFilter::default().exception_type("EnvelopeError");
    assert_eq!(dead_letters.count(&filter).await.unwrap(), 1);
    let dead = dead_letters
        .query(&filter, Default::default())
        .await
        .unwrap()
        .into_iter()
        .next()
        .unwrap();
    assert_eq!(dead.envelope.data, malformed.body);
    assert_eq!(dead.envelope.received_at, Some(orders.clone()));
    assert!(dead.exception_message.contains("attempts"));

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_sender_latches_and_recovers_when_destination_returns() {
    let store = memory_store().await;
    let transport = InMemoryTransport::new();
    let billing = InMemoryTransport::uri("billing");
    let handled = Arc::new(AtomicUsize::new(0));

    let runtime = builder(store.clone(), manual_clock(), DurabilityMode::Solo)
        .durability(DurabilitySettings {
            max_attempts: 10,
            ..quiet_settings(DurabilityMode::Solo)
        })
        .transport(Arc::new(transport.clone()))
        .listen(billing.clone(), EndpointOptions::durable())
        .route_message::<OrderPlaced>(billing.clone())
        .handle(counting_handler(&handled))
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();
    let bus = runtime.bus();
    let mut results = bus.send_results();

    transport.set_reachable(&billing, false);
    let sent = bus
        .send(&OrderPlaced { order_id: 3 }, DeliveryOptions::new())
        .await
        .unwrap();

    for _ in 0..3 {
        let SendResult { envelope_id, outcome, .. } = results.recv().await.unwrap();
        assert_eq!(envelope_id, sent[0].id);
        assert_eq!(outcome, SendOutcome::Failed(SendError::TimedOut));
    }
    assert!(
        eventually_counts(store.as_ref(), |c| c.outgoing == 1).await,
        "latched envelope must stay in the outbox"
    );
    let report = runtime.recover_now().await.unwrap();
    assert_eq!(report.outgoing_claimed, 0);

    transport.set_reachable(&billing, true);
    let mut claimed = 0;
    for _ in 0..200 {
        claimed += runtime.recover_now().await.unwrap().outgoing_claimed;
        if claimed > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(claimed, 1);

    assert!(eventually(|| handled.load(Ordering::SeqCst) == 1).await);
    assert!(eventually_counts(store.as_ref(), |c| c.outgoing == 0).await);
    assert_eq!(store.fetch_counts().await.unwrap().dead_letter, 0);

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_attempt_cap_dead_letters_before_sender_latches() {
    let store = memory_store().await;
    let transport = InMemoryTransport::new();
    let billing = InMemoryTransport::uri("billing");

    let runtime = builder(store.clone(), manual_clock(), DurabilityMode::Solo)
        .durability(DurabilitySettings {
            max_attempts: 2,
            sender_failures_before_latch: 3,
            ..quiet_settings(DurabilityMode::Solo)
        })
        .transport(Arc::new(transport.clone()))
        .endpoint(billing.clone(), EndpointOptions::durable())
        .route_message::<OrderPlaced>(billing.clone())
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();
    let bus = runtime.bus();
    let mut results = bus.send_results();

    transport.set_reachable(&billing, false);
    let sent = bus
        .send(&OrderPlaced { order_id: 4 }, DeliveryOptions::new())
        .await
        .unwrap();

    let first = results.recv().await.unwrap();
    assert_eq!(first.outcome, SendOutcome::Failed(SendError::TimedOut));
    let second = results.recv().await.unwrap();
    assert_eq!(second.envelope_id, sent[0].id);
    assert_eq!(second.outcome, SendOutcome::DeadLettered(SendError::TimedOut));

    let dead = runtime.dead_letters().find(sent[0].id).await.unwrap().unwrap();
    assert_eq!(dead.envelope.attempts, 2);
    assert_eq!(store.fetch_counts().await.unwrap().outgoing, 0);

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_permanent_send_error_dead_letters_immediately() {
    let store = memory_store().await;
    let transport = InMemoryTransport::new();
    let nowhere = InMemoryTransport::uri("nowhere");

    let runtime = builder(store.clone(), manual_clock(), DurabilityMode::Solo)
        .transport(Arc::new(transport.clone()))
        .endpoint(nowhere.clone(), EndpointOptions::durable())
        .route_message::<OrderPlaced>(nowhere.clone())
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();
    let bus = runtime.bus();
    let mut results = bus.send_results();

    let sent = bus
        .send(&OrderPlaced { order_id: 8 }, DeliveryOptions::new())
        .await
        .unwrap();
    let result = results.recv().await.unwrap();
    assert_eq!(
        result.outcome,
        SendOutcome::DeadLettered(SendError::DestinationDoesNotExist)
    );

    let dead = runtime.dead_letters().find(sent[0].id).await.unwrap().unwrap();
    assert_eq!(dead.exception_type, "DestinationDoesNotExist");
    assert_eq!(dead.envelope.destination, Some(nowhere));
    assert_eq!(store.fetch_counts().await.unwrap().outgoing, 0);

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_inline_send_surfaces_transport_error() {
    let store = memory_store().await;
    let transport = InMemoryTransport::new();
    let billing = InMemoryTransport::uri("billing");

    let runtime = builder(store.clone(), manual_clock(), DurabilityMode::Solo)
        .transport(Arc::new(transport.clone()))
        .endpoint(billing.clone(), EndpointOptions::inline())
        .route_message::<OrderPlaced>(billing.clone())
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();

    transport.fail_sends(&billing, 1, SendError::ProcessingFailed("queue full".into()));
    let err = runtime
        .bus()
        .send(&OrderPlaced { order_id: 1 }, DeliveryOptions::new())
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "SEND_FAILED");
    assert_eq!(store.fetch_counts().await.unwrap().outgoing, 0);

    runtime.shutdown().await.unwrap();
}
