// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL store tests.
//!
//! These run against a real database and are skipped when
//! `TEST_DATABASE_URL` is not set. Rows are addressed by fresh ids so the
//! tests can share one database.

use chrono::Utc;
use uuid::Uuid;

use courier_core::persistence::{ANY_NODE, ErrorReport, MessageStore};
use courier_core::{Envelope, EnvelopeStatus, PostgresStore, Uri};

macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        }
    };
}

async fn connect() -> PostgresStore {
    let url = std::env::var("TEST_DATABASE_URL").expect("TEST_DATABASE_URL must be set");
    PostgresStore::connect(&url)
        .await
        .expect("Failed to connect to test database")
}

fn incoming() -> Envelope {
    let mut envelope = Envelope::new("order.placed", br#"{"order_id":1}"#.to_vec());
    envelope.status = EnvelopeStatus::Incoming;
    envelope.destination = Some(Uri::local("orders"));
    envelope.received_at = Some(Uri::local("orders"));
    envelope
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn test_store_incoming_is_idempotent() {
    skip_if_no_db!();
    let store = connect().await;
    let envelope = incoming();

    let first = store.store_incoming(&[envelope.clone()]).await.unwrap();
    let second = store.store_incoming(&[envelope.clone()]).await.unwrap();
    assert_eq!(first, vec![envelope.id]);
    assert!(second.is_empty());

    let loaded = store.find_incoming(envelope.id).await.unwrap().unwrap();
    assert_eq!(loaded.data, envelope.data);
    assert_eq!(loaded.owner_id, ANY_NODE);

    store.delete_incoming_envelopes(&[loaded]).await.unwrap();
    assert!(store.find_incoming(envelope.id).await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn test_reassign_is_conditional_on_owner() {
    skip_if_no_db!();
    let store = connect().await;
    let envelope = incoming();
    store.store_incoming(&[envelope.clone()]).await.unwrap();

    let batch = vec![envelope.clone()];
    let won = store.reassign_incoming(9001, ANY_NODE, &batch).await.unwrap();
    let lost = store.reassign_incoming(9002, ANY_NODE, &batch).await.unwrap();
    assert_eq!(won.len(), 1);
    assert_eq!(won[0].owner_id, 9001);
    assert!(lost.is_empty());

    let loaded = store.find_incoming(envelope.id).await.unwrap().unwrap();
    assert_eq!(loaded.owner_id, 9001);

    store.delete_incoming_envelopes(&won).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn test_leadership_lease_and_node_lifecycle() {
    skip_if_no_db!();
    let store = connect().await;
    let now = Utc::now();
    let lease = chrono::Duration::seconds(30);
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    let a_number = store.register_node(a, "orders-service", now).await.unwrap();
    let b_number = store.register_node(b, "orders-service", now).await.unwrap();
    assert!(b_number > a_number);

    let cutoff = now - lease;
    assert!(
        store
            .try_attain_leadership(a, a_number, now, now + lease, cutoff)
            .await
            .unwrap()
    );
    assert!(
        !store
            .try_attain_leadership(b, b_number, now, now + lease, cutoff)
            .await
            .unwrap()
    );
    assert_eq!(store.current_leader(now).await.unwrap().unwrap().node_id, a);

    let later = now + chrono::Duration::seconds(31);
    assert!(
        store
            .try_attain_leadership(b, b_number, later, later + lease, later - lease)
            .await
            .unwrap()
    );
    store.release_leadership(b).await.unwrap();
    assert!(store.current_leader(later).await.unwrap().is_none());

    assert!(store.heartbeat(a, later).await.unwrap());
    store.delete_node(a).await.unwrap();
    store.delete_node(b).await.unwrap();
    assert!(!store.heartbeat(a, later).await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn test_dead_letter_replay_restores_incoming_row() {
    skip_if_no_db!();
    let store = connect().await;
    let now = Utc::now();
    let mut envelope = incoming();
    envelope.attempts = 3;
    store.store_incoming(&[envelope.clone()]).await.unwrap();

    store
        .move_to_dead_letter_storage(
            &[ErrorReport::new(
                envelope.clone(),
                "Timeout",
                "took too long",
                "exhausted",
            )],
            "orders-service",
            now,
            None,
        )
        .await
        .unwrap();
    assert!(store.find_incoming(envelope.id).await.unwrap().is_none());

    let dead = store.find_dead_letter(envelope.id).await.unwrap().unwrap();
    assert_eq!(dead.exception_type, "Timeout");
    assert_eq!(dead.service_name, "orders-service");
    assert_eq!(dead.envelope.attempts, 3);

    assert_eq!(store.replay_dead_letters(&[envelope.id]).await.unwrap(), 1);
    assert!(store.find_dead_letter(envelope.id).await.unwrap().is_none());

    let replayed = store.find_incoming(envelope.id).await.unwrap().unwrap();
    assert_eq!(replayed.attempts, 0);
    assert_eq!(replayed.owner_id, ANY_NODE);
    assert_eq!(replayed.data, envelope.data);

    store.delete_incoming_envelopes(&[replayed]).await.unwrap();
}
