// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for courier-core integration tests.
//!
//! Provides an in-memory SQLite store, a manual clock, sample messages and
//! a runtime builder with background intervals long enough that tests drive
//! recovery and scheduling explicitly.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePoolOptions;

use courier_core::config::{DurabilityMode, DurabilitySettings};
use courier_core::runtime::{CourierRuntime, CourierRuntimeBuilder};
use courier_core::testing::ManualClock;
use courier_core::persistence::{MessageStore, PersistedCounts};
use courier_core::{Message, MessageIdentity, SqliteStore};

/// Order placed by a customer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderPlaced {
    pub order_id: u32,
}

impl Message for OrderPlaced {
    const MESSAGE_TYPE: &'static str = "order.placed";
}

/// Invoice raised for an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceIssued {
    pub order_id: u32,
}

impl Message for InvoiceIssued {
    const MESSAGE_TYPE: &'static str = "invoice.issued";
}

/// Fixed start time for manual clocks.
pub fn epoch() -> DateTime<Utc> {
    DateTime::from_timestamp(1_800_000_000, 0).unwrap()
}

pub fn manual_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(epoch()))
}

/// Migrated in-memory SQLite store on a single connection.
pub async fn memory_store() -> Arc<SqliteStore> {
    memory_store_with_identity(MessageIdentity::IdOnly).await
}

/// Migrated in-memory SQLite store that de-duplicates by `identity`.
pub async fn memory_store_with_identity(identity: MessageIdentity) -> Arc<SqliteStore> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to open in-memory SQLite");
    courier_core::migrations::run_sqlite(&pool)
        .await
        .expect("Failed to run migrations");
    Arc::new(SqliteStore::new(pool).with_identity(identity))
}

/// Settings whose background loops never fire during a test.
pub fn quiet_settings(mode: DurabilityMode) -> DurabilitySettings {
    let hour = Duration::from_secs(3600);
    DurabilitySettings {
        mode,
        health_check_interval: hour,
        recovery_interval: hour,
        scheduled_poll_interval: hour,
        retention_interval: hour,
        sender_ping_interval: Duration::from_millis(20),
        shutdown_timeout: Duration::from_secs(2),
        ..DurabilitySettings::default()
    }
}

/// Builder with a store, a clock and quiet settings.
pub fn builder(
    store: Arc<SqliteStore>,
    clock: Arc<ManualClock>,
    mode: DurabilityMode,
) -> CourierRuntimeBuilder {
    CourierRuntime::builder()
        .store(store)
        .clock(clock)
        .service_name("orders-service")
        .durability(quiet_settings(mode))
}

/// Poll `condition` until it holds or five seconds pass.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Poll the store's row counts until `condition` holds or five seconds pass.
pub async fn eventually_counts(
    store: &dyn MessageStore,
    condition: impl Fn(&PersistedCounts) -> bool,
) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if condition(&store.fetch_counts().await.expect("Failed to fetch counts")) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
