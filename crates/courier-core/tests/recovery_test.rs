// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Ownership, crash recovery and durable scheduling across nodes sharing
//! one store.

mod common;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use uuid::Uuid;

use common::*;
use courier_core::config::{DurabilityMode, DurabilitySettings};
use courier_core::durability::LeadershipState;
use courier_core::persistence::MessageStore;
use courier_core::{Clock, EndpointOptions, Envelope, EnvelopeStatus, SqliteStore, Uri};

fn unowned_order(order_id: u32) -> Envelope {
    let mut envelope = Envelope::new(
        "order.placed",
        serde_json::to_vec(&OrderPlaced { order_id }).unwrap(),
    );
    envelope.status = EnvelopeStatus::Incoming;
    envelope.owner_id = 0;
    envelope.destination = Some(Uri::local("orders"));
    envelope.received_at = Some(Uri::local("orders"));
    envelope
}

#[tokio::test]
async fn test_two_nodes_never_claim_the_same_envelope() {
    let store = memory_store().await;
    let clock = manual_clock();
    let seen = Arc::new(Mutex::new(Vec::<Uuid>::new()));
    let settings = DurabilitySettings {
        recovery_batch_size: 5,
        ..quiet_settings(DurabilityMode::Balanced)
    };

    let mut nodes = Vec::new();
    for _ in 0..2 {
        let seen = seen.clone();
        let node = builder(store.clone(), clock.clone(), DurabilityMode::Balanced)
            .durability(settings.clone())
            .local_queue("orders", EndpointOptions::durable())
            .route_message::<OrderPlaced>(Uri::local("orders"))
            .handle(move |_order: OrderPlaced, ctx| {
                let seen = seen.clone();
                async move {
                    seen.lock().unwrap().push(ctx.envelope_id());
                    Ok(())
                }
            })
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();
        nodes.push(node);
    }
    assert_ne!(nodes[0].node_number(), nodes[1].node_number());

    let envelopes: Vec<Envelope> = (0..20).map(unowned_order).collect();
    assert_eq!(store.store_incoming(&envelopes).await.unwrap().len(), 20);

    let mut claimed = 0;
    for _ in 0..10 {
        let reports = join_all(nodes.iter().map(|node| node.recover_now())).await;
        for report in reports {
            claimed += report.unwrap().incoming_claimed;
        }
        if claimed == 20 {
            break;
        }
    }
    assert_eq!(claimed, 20);

    assert!(eventually_counts(store.as_ref(), |c| c.handled == 20).await);
    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 20);
    assert_eq!(seen.iter().collect::<HashSet<_>>().len(), 20);

    let leaders = nodes
        .iter()
        .filter(|node| node.leadership() == LeadershipState::Leader)
        .count();
    assert_eq!(leaders, 1);

    for node in nodes {
        node.shutdown().await.unwrap();
    }
}

#[tokio::test]
async fn test_crashed_node_envelopes_are_recovered() {
    let store = memory_store().await;
    let clock = manual_clock();
    let entered = Arc::new(AtomicBool::new(false));
    let handled = Arc::new(AtomicUsize::new(0));

    let crashing = builder(store.clone(), clock.clone(), DurabilityMode::Balanced)
        .local_queue("orders", EndpointOptions::durable())
        .route_message::<OrderPlaced>(Uri::local("orders"))
        .handle({
            let entered = entered.clone();
            move |_order: OrderPlaced, _ctx| {
                let entered = entered.clone();
                async move {
                    entered.store(true, Ordering::SeqCst);
                    std::future::pending::<()>().await;
                    Ok(())
                }
            }
        })
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();
    assert_eq!(crashing.leadership(), LeadershipState::Leader);

    let sent = crashing
        .bus()
        .send(&OrderPlaced { order_id: 5 }, Default::default())
        .await
        .unwrap();
    assert!(eventually(|| entered.load(Ordering::SeqCst)).await);
    let crashed_owner = crashing.node_number();
    crashing.abort();

    let owned = store.find_incoming(sent[0].id).await.unwrap().unwrap();
    assert_eq!(owned.owner_id, crashed_owner);

    let survivor = builder(store.clone(), clock.clone(), DurabilityMode::Balanced)
        .local_queue("orders", EndpointOptions::durable())
        .route_message::<OrderPlaced>(Uri::local("orders"))
        .handle({
            let handled = handled.clone();
            move |_order: OrderPlaced, _ctx| {
                let handled = handled.clone();
                async move {
                    handled.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }
        })
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();

    // The crashed node still looks alive and keeps its lease.
    let report = survivor.recover_now().await.unwrap();
    assert!(!report.leader);
    assert_eq!(report.incoming_claimed, 0);

    clock.advance(Duration::from_secs(61));
    let report = survivor.recover_now().await.unwrap();
    assert!(report.leader);
    assert_eq!(report.evicted_nodes, 1);
    assert_eq!(report.incoming_claimed, 1);

    assert!(eventually_counts(store.as_ref(), |c| c.handled == 1).await);
    assert_eq!(handled.load(Ordering::SeqCst), 1);
    assert_eq!(store.load_nodes().await.unwrap().len(), 1);

    survivor.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_releases_everything_owned() {
    let store = memory_store().await;
    let clock = manual_clock();

    let runtime = builder(store.clone(), clock, DurabilityMode::Balanced)
        .local_queue("orders", EndpointOptions::durable())
        .route_message::<OrderPlaced>(Uri::local("orders"))
        .handle(|_order: OrderPlaced, _ctx| async move { Ok(()) })
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();
    let node_id = runtime.node_id();
    assert!(store.current_leader(epoch()).await.unwrap().is_some());

    runtime.shutdown().await.unwrap();

    assert!(store.load_nodes().await.unwrap().is_empty());
    assert!(
        store
            .load_assignments()
            .await
            .unwrap()
            .iter()
            .all(|assignment| assignment.node_id != node_id)
    );
    assert!(store.current_leader(epoch()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_scheduled_delivery_survives_restart_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("courier.db");
    let clock = manual_clock();
    let calls = Arc::new(AtomicUsize::new(0));

    let start = |store: Arc<SqliteStore>| {
        let calls = calls.clone();
        builder(store, clock.clone(), DurabilityMode::Solo)
            .local_queue("orders", EndpointOptions::durable())
            .route_message::<OrderPlaced>(Uri::local("orders"))
            .handle(move |_order: OrderPlaced, _ctx| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .build()
            .unwrap()
            .start()
    };

    let store = Arc::new(SqliteStore::from_path(&path).await.unwrap());
    let first = start(store.clone()).await.unwrap();
    let due = epoch() + chrono::Duration::seconds(60);
    let scheduled = first
        .bus()
        .schedule(&OrderPlaced { order_id: 9 }, due)
        .await
        .unwrap();
    assert_eq!(scheduled[0].status, EnvelopeStatus::Scheduled);
    assert_eq!(store.fetch_counts().await.unwrap().scheduled, 1);
    assert_eq!(first.scheduled_count(), 1);

    // Not due yet on this node either.
    assert_eq!(first.play_scheduled(clock.now()).await, 0);
    first.shutdown().await.unwrap();
    store.pool().close().await;

    let store = Arc::new(SqliteStore::from_path(&path).await.unwrap());
    let second = start(store.clone()).await.unwrap();
    assert_eq!(store.fetch_counts().await.unwrap().scheduled, 1);

    clock.advance(Duration::from_secs(30));
    assert_eq!(second.recover_now().await.unwrap().scheduled_promoted, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    clock.advance(Duration::from_secs(31));
    assert_eq!(second.recover_now().await.unwrap().scheduled_promoted, 1);
    assert!(eventually_counts(store.as_ref(), |c| c.handled == 1).await);

    assert_eq!(second.recover_now().await.unwrap().scheduled_promoted, 0);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(store.fetch_counts().await.unwrap().scheduled, 0);

    second.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_cancelled_schedule_never_fires() {
    let store = memory_store().await;
    let clock = manual_clock();
    let calls = Arc::new(AtomicUsize::new(0));

    let runtime = builder(store.clone(), clock.clone(), DurabilityMode::Solo)
        .local_queue("orders", EndpointOptions::durable())
        .route_message::<OrderPlaced>(Uri::local("orders"))
        .handle({
            let calls = calls.clone();
            move |_order: OrderPlaced, _ctx| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }
        })
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();

    let scheduled = runtime
        .bus()
        .schedule(&OrderPlaced { order_id: 4 }, epoch() + chrono::Duration::seconds(10))
        .await
        .unwrap();
    assert!(runtime.bus().cancel_scheduled(scheduled[0].id).await.unwrap());
    assert_eq!(runtime.scheduled_count(), 0);

    clock.advance(Duration::from_secs(20));
    assert_eq!(runtime.recover_now().await.unwrap().scheduled_promoted, 0);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(store.fetch_counts().await.unwrap().scheduled, 0);

    runtime.shutdown().await.unwrap();
}
