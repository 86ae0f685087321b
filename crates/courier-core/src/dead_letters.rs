// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Dead-letter administration.
//!
//! Bulk operations accept either explicit ids or a filter. Filter-based
//! operations work through matching rows in batches until none are left.

use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use crate::error::Result;
use crate::persistence::{
    DeadLetterEnvelope, DeadLetterFilter, DeadLetterSummary, MessageStore, Page,
};

/// Rows touched per batch by filter-based operations.
const BATCH_SIZE: i64 = 500;

/// Which dead letters an operation applies to.
#[derive(Debug, Clone)]
pub enum DeadLetterSelection {
    /// These ids.
    Ids(Vec<Uuid>),
    /// Every row matching the filter.
    Filter(DeadLetterFilter),
}

impl From<Vec<Uuid>> for DeadLetterSelection {
    fn from(ids: Vec<Uuid>) -> Self {
        Self::Ids(ids)
    }
}

impl From<DeadLetterFilter> for DeadLetterSelection {
    fn from(filter: DeadLetterFilter) -> Self {
        Self::Filter(filter)
    }
}

/// Query, replay and discard dead letters.
#[derive(Clone)]
pub struct DeadLetters {
    store: Arc<dyn MessageStore>,
}

impl std::fmt::Debug for DeadLetters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetters").finish_non_exhaustive()
    }
}

impl DeadLetters {
    /// Administer dead letters in `store`.
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self { store }
    }

    /// Counts grouped by service, listener, message type and exception type.
    pub async fn summarize(&self) -> Result<Vec<DeadLetterSummary>> {
        self.store.summarize_dead_letters().await
    }

    /// One page of matching dead letters, newest first.
    pub async fn query(&self, filter: &DeadLetterFilter, page: Page) -> Result<Vec<DeadLetterEnvelope>> {
        self.store.query_dead_letters(filter, page).await
    }

    /// Number of matching dead letters.
    pub async fn count(&self, filter: &DeadLetterFilter) -> Result<i64> {
        self.store.count_dead_letters(filter).await
    }

    /// One dead letter.
    pub async fn find(&self, id: Uuid) -> Result<Option<DeadLetterEnvelope>> {
        self.store.find_dead_letter(id).await
    }

    /// Move dead letters back to incoming with a fresh attempt count. The
    /// recovery agent picks them up on its next cycle.
    pub async fn replay(&self, selection: impl Into<DeadLetterSelection>) -> Result<u64> {
        let replayed = match selection.into() {
            DeadLetterSelection::Ids(ids) => self.store.replay_dead_letters(&ids).await?,
            DeadLetterSelection::Filter(filter) => {
                let mut total = 0;
                loop {
                    let ids = self.store.dead_letter_ids(&filter, BATCH_SIZE).await?;
                    if ids.is_empty() {
                        break;
                    }
                    let replayed = self.store.replay_dead_letters(&ids).await?;
                    total += replayed;
                    if replayed == 0 {
                        break;
                    }
                }
                total
            }
        };
        info!(count = replayed, "Replayed dead letters");
        Ok(replayed)
    }

    /// Delete dead letters for good.
    pub async fn discard(&self, selection: impl Into<DeadLetterSelection>) -> Result<u64> {
        let discarded = match selection.into() {
            DeadLetterSelection::Ids(ids) => self.store.discard_dead_letters(&ids).await?,
            DeadLetterSelection::Filter(filter) => {
                let mut total = 0;
                loop {
                    let ids = self.store.dead_letter_ids(&filter, BATCH_SIZE).await?;
                    if ids.is_empty() {
                        break;
                    }
                    let discarded = self.store.discard_dead_letters(&ids).await?;
                    total += discarded;
                    if discarded == 0 {
                        break;
                    }
                }
                total
            }
        };
        info!(count = discarded, "Discarded dead letters");
        Ok(discarded)
    }

    /// Flag dead letters for replay by the leader's recovery cycle.
    pub async fn mark_replayable(&self, selection: impl Into<DeadLetterSelection>) -> Result<u64> {
        match selection.into() {
            DeadLetterSelection::Ids(ids) => self.store.mark_dead_letters_replayable(&ids).await,
            DeadLetterSelection::Filter(filter) => {
                let filter = DeadLetterFilter {
                    replayable: Some(false),
                    ..filter
                };
                let mut total = 0;
                loop {
                    let ids = self.store.dead_letter_ids(&filter, BATCH_SIZE).await?;
                    if ids.is_empty() {
                        break;
                    }
                    let marked = self.store.mark_dead_letters_replayable(&ids).await?;
                    total += marked;
                    if marked == 0 {
                        break;
                    }
                }
                Ok(total)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Envelope;
    use crate::persistence::{ErrorReport, SqliteStore};
    use chrono::Utc;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn admin() -> (DeadLetters, Arc<SqliteStore>) {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::migrations::run_sqlite(&pool).await.unwrap();
        let store = Arc::new(SqliteStore::new(pool));
        (DeadLetters::new(store.clone()), store)
    }

    async fn bury(store: &SqliteStore, message_type: &str, exception_type: &str) -> Uuid {
        let envelope = Envelope::new(message_type, b"{}".to_vec());
        let id = envelope.id;
        store
            .move_to_dead_letter_storage(
                &[ErrorReport::new(envelope, exception_type, "boom", "test")],
                "billing",
                Utc::now(),
                None,
            )
            .await
            .unwrap();
        id
    }

    #[tokio::test]
    async fn test_discard_by_filter_leaves_other_rows() {
        let (admin, store) = admin().await;
        for _ in 0..3 {
            bury(&store, "order.placed", "Timeout").await;
        }
        let kept = bury(&store, "invoice.issued", "Timeout").await;

        let discarded = admin
            .discard(DeadLetterFilter::default().message_type("order.placed"))
            .await
            .unwrap();
        assert_eq!(discarded, 3);
        assert_eq!(admin.count(&DeadLetterFilter::default()).await.unwrap(), 1);
        assert!(admin.find(kept).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_replay_by_ids() {
        let (admin, store) = admin().await;
        let id = bury(&store, "order.placed", "Timeout").await;

        assert_eq!(admin.replay(vec![id]).await.unwrap(), 1);
        assert!(admin.find(id).await.unwrap().is_none());
        let replayed = store.find_incoming(id).await.unwrap().unwrap();
        assert_eq!(replayed.attempts, 0);
        assert_eq!(replayed.owner_id, 0);
    }

    #[tokio::test]
    async fn test_mark_replayable_by_filter() {
        let (admin, store) = admin().await;
        bury(&store, "order.placed", "Timeout").await;
        bury(&store, "order.placed", "Validation").await;

        let marked = admin
            .mark_replayable(DeadLetterFilter::default().exception_type("Timeout"))
            .await
            .unwrap();
        assert_eq!(marked, 1);

        let replayable = DeadLetterFilter {
            replayable: Some(true),
            ..DeadLetterFilter::default()
        };
        assert_eq!(admin.count(&replayable).await.unwrap(), 1);

        let summary = admin.summarize().await.unwrap();
        assert_eq!(summary.iter().map(|row| row.count).sum::<i64>(), 2);
    }
}
