// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed message store.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool};
use tracing::warn;
use uuid::Uuid;

use crate::envelope::{Envelope, EnvelopeStatus, MessageIdentity};
use crate::error::{CoreError, Result};
use crate::migrations;
use crate::uri::Uri;

use super::{
    AgentAssignment, ControlCommand, DEAD_LETTER_COLUMNS, DeadLetterEnvelope, DeadLetterFilter,
    DeadLetterRow, DeadLetterSummary, ENVELOPE_COLUMNS, EnvelopeRow, EnvelopeTransaction,
    ErrorReport, LeaderLease, MessageStore, NodeRecord, Page, PersistedCounts, ScheduledJob,
    headers_json, rows_to_envelopes,
};

type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

/// SQLite-backed message store.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    identity: MessageIdentity,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Create a store from an existing, migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            identity: MessageIdentity::IdOnly,
        }
    }

    /// Set the duplicate-detection mode for incoming envelopes.
    pub fn with_identity(mut self, identity: MessageIdentity) -> Self {
        self.identity = identity;
        self
    }

    /// Create and initialize a store from a file path.
    ///
    /// This convenience constructor handles all setup:
    /// - Creates parent directories if they don't exist
    /// - Creates the database file if it doesn't exist
    /// - Connects to the database with sensible defaults
    /// - Runs all migrations
    ///
    /// # Example
    ///
    /// ```ignore
    /// let store = SqliteStore::from_path(".data/courier.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                CoreError::database(
                    "create_dir",
                    format!("Failed to create directory {:?}: {}", parent, e),
                )
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| {
                CoreError::database(
                    "connect",
                    format!("Failed to connect to SQLite at {:?}: {}", path, e),
                )
            })?;

        migrations::run_sqlite(&pool).await?;

        Ok(Self::new(pool))
    }

    /// The underlying pool, for enlisting business writes in the same
    /// database.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn insert_sql(table: &str, extra_columns: &[&str], conflict: &str) -> String {
    let count = ENVELOPE_COLUMNS.split(',').count() + extra_columns.len();
    let mut columns = ENVELOPE_COLUMNS.to_string();
    for column in extra_columns {
        columns.push_str(", ");
        columns.push_str(column);
    }
    format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT {}",
        table,
        columns,
        vec!["?"; count].join(", "),
        conflict
    )
}

fn bind_envelope<'q>(query: SqliteQuery<'q>, envelope: &'q Envelope, headers: String) -> SqliteQuery<'q> {
    query
        .bind(envelope.id)
        .bind(envelope.status.as_str())
        .bind(envelope.owner_id)
        .bind(envelope.attempts)
        .bind(envelope.data.as_slice())
        .bind(envelope.message_type.as_str())
        .bind(envelope.content_type.as_str())
        .bind(envelope.scheduled_time)
        .bind(envelope.keep_until)
        .bind(envelope.deliver_by)
        .bind(envelope.destination.as_ref().map(Uri::as_str))
        .bind(envelope.received_at.as_ref().map(Uri::as_str))
        .bind(envelope.reply_uri.as_ref().map(Uri::as_str))
        .bind(envelope.source.as_deref())
        .bind(envelope.correlation_id.as_deref())
        .bind(envelope.conversation_id)
        .bind(envelope.parent_id.as_deref())
        .bind(envelope.saga_id.as_deref())
        .bind(envelope.tenant_id.as_deref())
        .bind(envelope.sent_at)
        .bind(headers)
}

async fn insert_incoming(
    conn: &mut SqliteConnection,
    identity: MessageIdentity,
    envelopes: &[Envelope],
) -> Result<Vec<Uuid>> {
    let sql = insert_sql(
        "incoming_envelopes",
        &["identity_scope"],
        "(id, identity_scope) DO NOTHING",
    );
    let mut inserted = Vec::with_capacity(envelopes.len());
    for envelope in envelopes {
        let result = bind_envelope(sqlx::query(&sql), envelope, headers_json(envelope)?)
            .bind(envelope.identity_scope(identity))
            .execute(&mut *conn)
            .await?;
        if result.rows_affected() > 0 {
            inserted.push(envelope.id);
        }
    }
    Ok(inserted)
}

async fn insert_outgoing(conn: &mut SqliteConnection, envelopes: &[Envelope]) -> Result<()> {
    let sql = insert_sql("outgoing_envelopes", &[], "(id) DO NOTHING");
    for envelope in envelopes {
        bind_envelope(sqlx::query(&sql), envelope, headers_json(envelope)?)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

async fn insert_cascades(
    conn: &mut SqliteConnection,
    identity: MessageIdentity,
    cascades: &[Envelope],
) -> Result<()> {
    let (outgoing, incoming): (Vec<Envelope>, Vec<Envelope>) = cascades
        .iter()
        .cloned()
        .partition(|e| e.status == EnvelopeStatus::Outgoing);
    insert_outgoing(conn, &outgoing).await?;
    insert_incoming(conn, identity, &incoming).await?;
    Ok(())
}

#[async_trait]
impl<'c> EnvelopeTransaction for sqlx::Transaction<'c, Sqlite> {
    async fn persist_outgoing(&mut self, envelopes: &[Envelope]) -> Result<()> {
        insert_outgoing(&mut **self, envelopes).await
    }

    async fn persist_incoming(
        &mut self,
        identity: MessageIdentity,
        envelopes: &[Envelope],
    ) -> Result<()> {
        insert_incoming(&mut **self, identity, envelopes).await?;
        Ok(())
    }
}

#[async_trait]
impl MessageStore for SqliteStore {
    fn identity(&self) -> MessageIdentity {
        self.identity
    }

    async fn store_incoming(&self, envelopes: &[Envelope]) -> Result<Vec<Uuid>> {
        let mut tx = self.pool.begin().await?;
        let inserted = insert_incoming(&mut tx, self.identity, envelopes).await?;
        tx.commit().await?;
        Ok(inserted)
    }

    async fn find_incoming(&self, id: Uuid) -> Result<Option<Envelope>> {
        let row = sqlx::query_as::<_, EnvelopeRow>(&format!(
            "SELECT {} FROM incoming_envelopes WHERE id = ? LIMIT 1",
            ENVELOPE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Envelope::try_from).transpose()
    }

    async fn load_page_of_globally_owned_incoming(&self, limit: usize) -> Result<Vec<Envelope>> {
        let rows = sqlx::query_as::<_, EnvelopeRow>(&format!(
            r#"
            SELECT {}
            FROM incoming_envelopes
            WHERE owner_id = 0 AND status = 'Incoming'
            ORDER BY sent_at
            LIMIT ?
            "#,
            ENVELOPE_COLUMNS
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows_to_envelopes(rows)
    }

    async fn reassign_incoming(
        &self,
        new_owner: i32,
        expected_owner: i32,
        envelopes: &[Envelope],
    ) -> Result<Vec<Envelope>> {
        let mut tx = self.pool.begin().await?;
        let mut claimed = Vec::new();
        for envelope in envelopes {
            let result = sqlx::query(
                r#"
                UPDATE incoming_envelopes
                SET owner_id = ?
                WHERE id = ? AND identity_scope = ? AND owner_id = ? AND status = 'Incoming'
                "#,
            )
            .bind(new_owner)
            .bind(envelope.id)
            .bind(envelope.identity_scope(self.identity))
            .bind(expected_owner)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 1 {
                let mut owned = envelope.clone();
                owned.owner_id = new_owner;
                claimed.push(owned);
            }
        }
        tx.commit().await?;
        Ok(claimed)
    }

    async fn mark_incoming_handled(
        &self,
        envelope: &Envelope,
        keep_until: Option<DateTime<Utc>>,
        cascades: &[Envelope],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let scope = envelope.identity_scope(self.identity);
        match keep_until {
            Some(keep_until) => {
                sqlx::query(
                    r#"
                    UPDATE incoming_envelopes
                    SET status = 'Handled', keep_until = ?, owner_id = 0
                    WHERE id = ? AND identity_scope = ?
                    "#,
                )
                .bind(keep_until)
                .bind(envelope.id)
                .bind(scope)
                .execute(&mut *tx)
                .await?;
            }
            None => {
                sqlx::query("DELETE FROM incoming_envelopes WHERE id = ? AND identity_scope = ?")
                    .bind(envelope.id)
                    .bind(scope)
                    .execute(&mut *tx)
                    .await?;
            }
        }
        insert_cascades(&mut tx, self.identity, cascades).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn delete_incoming_envelopes(&self, envelopes: &[Envelope]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for envelope in envelopes {
            sqlx::query("DELETE FROM incoming_envelopes WHERE id = ? AND identity_scope = ?")
                .bind(envelope.id)
                .bind(envelope.identity_scope(self.identity))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn increment_incoming_attempts(&self, envelope: &Envelope) -> Result<()> {
        sqlx::query(
            "UPDATE incoming_envelopes SET attempts = ? WHERE id = ? AND identity_scope = ?",
        )
        .bind(envelope.attempts)
        .bind(envelope.id)
        .bind(envelope.identity_scope(self.identity))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn schedule_incoming(&self, envelope: &Envelope, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE incoming_envelopes
            SET status = 'Scheduled', execution_time = ?, attempts = ?, owner_id = 0
            WHERE id = ? AND identity_scope = ?
            "#,
        )
        .bind(at)
        .bind(envelope.attempts)
        .bind(envelope.id)
        .bind(envelope.identity_scope(self.identity))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn move_to_dead_letter_storage(
        &self,
        reports: &[ErrorReport],
        service_name: &str,
        now: DateTime<Utc>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let sql = insert_sql(
            "dead_letter_envelopes",
            &[
                "identity_scope",
                "exception_type",
                "exception_message",
                "explanation",
                "replayable",
                "failed_at",
                "expires_at",
                "service_name",
            ],
            "(id, identity_scope) DO NOTHING",
        );

        let mut tx = self.pool.begin().await?;
        for report in reports {
            let mut envelope = report.envelope.clone();
            envelope.status = EnvelopeStatus::DeadLetter;
            let scope = envelope.identity_scope(self.identity);

            sqlx::query("DELETE FROM incoming_envelopes WHERE id = ? AND identity_scope = ?")
                .bind(envelope.id)
                .bind(&scope)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM outgoing_envelopes WHERE id = ?")
                .bind(envelope.id)
                .execute(&mut *tx)
                .await?;

            let headers = headers_json(&envelope)?;
            bind_envelope(sqlx::query(&sql), &envelope, headers)
                .bind(&scope)
                .bind(report.exception_type.as_str())
                .bind(report.exception_message.as_str())
                .bind(report.explanation.as_str())
                .bind(false)
                .bind(now)
                .bind(expires_at)
                .bind(service_name)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn move_incoming_to_outgoing(&self, envelope: &Envelope, owner: i32) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let deleted = sqlx::query(
            "DELETE FROM incoming_envelopes WHERE id = ? AND identity_scope = ? AND status = 'Incoming'",
        )
        .bind(envelope.id)
        .bind(envelope.identity_scope(self.identity))
        .execute(&mut *tx)
        .await?;

        if deleted.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        let mut outgoing = envelope.clone();
        outgoing.status = EnvelopeStatus::Outgoing;
        outgoing.owner_id = owner;
        outgoing.scheduled_time = None;
        insert_outgoing(&mut tx, std::slice::from_ref(&outgoing)).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn release_incoming(&self, owner: i32) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE incoming_envelopes
            SET owner_id = 0
            WHERE owner_id = ? AND status IN ('Incoming', 'Scheduled')
            "#,
        )
        .bind(owner)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn load_due_scheduled(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Envelope>> {
        let rows = sqlx::query_as::<_, EnvelopeRow>(&format!(
            r#"
            SELECT {}
            FROM incoming_envelopes
            WHERE status = 'Scheduled' AND execution_time <= ?
            ORDER BY execution_time
            LIMIT ?
            "#,
            ENVELOPE_COLUMNS
        ))
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows_to_envelopes(rows)
    }

    async fn promote_scheduled(
        &self,
        envelopes: &[Envelope],
        new_owner: i32,
        now: DateTime<Utc>,
    ) -> Result<Vec<Envelope>> {
        let mut tx = self.pool.begin().await?;
        let mut promoted = Vec::new();
        for envelope in envelopes {
            let result = sqlx::query(
                r#"
                UPDATE incoming_envelopes
                SET status = 'Incoming', owner_id = ?, execution_time = NULL
                WHERE id = ? AND identity_scope = ?
                  AND status = 'Scheduled' AND execution_time <= ?
                "#,
            )
            .bind(new_owner)
            .bind(envelope.id)
            .bind(envelope.identity_scope(self.identity))
            .bind(now)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 1 {
                let mut ready = envelope.clone();
                ready.status = EnvelopeStatus::Incoming;
                ready.owner_id = new_owner;
                ready.scheduled_time = None;
                promoted.push(ready);
            }
        }
        tx.commit().await?;
        Ok(promoted)
    }

    async fn list_scheduled(&self, limit: usize) -> Result<Vec<ScheduledJob>> {
        let jobs = sqlx::query_as::<_, ScheduledJob>(
            r#"
            SELECT id AS envelope_id, execution_time, message_type, received_at, destination
            FROM incoming_envelopes
            WHERE status = 'Scheduled'
            ORDER BY execution_time
            LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    async fn cancel_scheduled(&self, id: Uuid) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM incoming_envelopes WHERE id = ? AND status = 'Scheduled'")
                .bind(id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn store_outgoing(&self, envelopes: &[Envelope]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        insert_outgoing(&mut tx, envelopes).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn load_outgoing(&self, owner: i32, limit: usize) -> Result<Vec<Envelope>> {
        let rows = sqlx::query_as::<_, EnvelopeRow>(&format!(
            r#"
            SELECT {}
            FROM outgoing_envelopes
            WHERE owner_id = ?
            ORDER BY sent_at
            LIMIT ?
            "#,
            ENVELOPE_COLUMNS
        ))
        .bind(owner)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows_to_envelopes(rows)
    }

    async fn load_page_of_globally_owned_outgoing(&self, limit: usize) -> Result<Vec<Envelope>> {
        self.load_outgoing(super::ANY_NODE, limit).await
    }

    async fn reassign_outgoing(
        &self,
        new_owner: i32,
        expected_owner: i32,
        envelopes: &[Envelope],
    ) -> Result<Vec<Envelope>> {
        let mut tx = self.pool.begin().await?;
        let mut claimed = Vec::new();
        for envelope in envelopes {
            let result = sqlx::query(
                "UPDATE outgoing_envelopes SET owner_id = ? WHERE id = ? AND owner_id = ?",
            )
            .bind(new_owner)
            .bind(envelope.id)
            .bind(expected_owner)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 1 {
                let mut owned = envelope.clone();
                owned.owner_id = new_owner;
                claimed.push(owned);
            }
        }
        tx.commit().await?;
        Ok(claimed)
    }

    async fn delete_outgoing(&self, envelopes: &[Envelope]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for envelope in envelopes {
            sqlx::query("DELETE FROM outgoing_envelopes WHERE id = ?")
                .bind(envelope.id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn increment_outgoing_attempts(&self, envelope: &Envelope) -> Result<()> {
        sqlx::query("UPDATE outgoing_envelopes SET attempts = ? WHERE id = ?")
            .bind(envelope.attempts)
            .bind(envelope.id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn release_outgoing(&self, owner: i32, destination: Option<&Uri>) -> Result<u64> {
        let result = match destination {
            Some(destination) => {
                sqlx::query(
                    "UPDATE outgoing_envelopes SET owner_id = 0 WHERE owner_id = ? AND destination = ?",
                )
                .bind(owner)
                .bind(destination.as_str())
                .execute(&self.pool)
                .await?
            }
            None => {
                sqlx::query("UPDATE outgoing_envelopes SET owner_id = 0 WHERE owner_id = ?")
                    .bind(owner)
                    .execute(&self.pool)
                    .await?
            }
        };
        Ok(result.rows_affected())
    }

    async fn release_orphaned_envelopes(&self) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let incoming = sqlx::query(
            r#"
            UPDATE incoming_envelopes
            SET owner_id = 0
            WHERE owner_id <> 0
              AND status IN ('Incoming', 'Scheduled')
              AND owner_id NOT IN (SELECT node_number FROM nodes)
            "#,
        )
        .execute(&mut *tx)
        .await?;
        let outgoing = sqlx::query(
            r#"
            UPDATE outgoing_envelopes
            SET owner_id = 0
            WHERE owner_id <> 0
              AND owner_id NOT IN (SELECT node_number FROM nodes)
            "#,
        )
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(incoming.rows_affected() + outgoing.rows_affected())
    }

    async fn register_node(
        &self,
        node_id: Uuid,
        service_name: &str,
        now: DateTime<Utc>,
    ) -> Result<i32> {
        let node_number: i32 = sqlx::query_scalar(
            r#"
            INSERT INTO nodes (node_id, service_name, started_at, last_heartbeat)
            VALUES (?, ?, ?, ?)
            RETURNING node_number
            "#,
        )
        .bind(node_id)
        .bind(service_name)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(node_number)
    }

    async fn restore_node(
        &self,
        node_number: i32,
        node_id: Uuid,
        service_name: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO nodes (node_number, node_id, service_name, started_at, last_heartbeat)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(node_number)
        .bind(node_id)
        .bind(service_name)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn heartbeat(&self, node_id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query("UPDATE nodes SET last_heartbeat = ? WHERE node_id = ?")
            .bind(now)
            .bind(node_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn load_nodes(&self) -> Result<Vec<NodeRecord>> {
        let nodes = sqlx::query_as::<_, NodeRecord>(
            r#"
            SELECT node_number, node_id, service_name, started_at, last_heartbeat
            FROM nodes
            ORDER BY node_number
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(nodes)
    }

    async fn delete_node(&self, node_id: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for sql in [
            "DELETE FROM node_assignments WHERE node_id = ?",
            "DELETE FROM control_queue WHERE node_id = ?",
            "DELETE FROM leader_lease WHERE node_id = ?",
            "DELETE FROM nodes WHERE node_id = ?",
        ] {
            sqlx::query(sql).bind(node_id).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn try_attain_leadership(
        &self,
        node_id: Uuid,
        node_number: i32,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
        stale_cutoff: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO leader_lease (lock_id, node_id, node_number, acquired_at, expires_at)
            VALUES (1, ?1, ?2, ?3, ?4)
            ON CONFLICT (lock_id) DO UPDATE SET
                node_id = excluded.node_id,
                node_number = excluded.node_number,
                acquired_at = CASE
                    WHEN leader_lease.node_id = excluded.node_id THEN leader_lease.acquired_at
                    ELSE excluded.acquired_at
                END,
                expires_at = excluded.expires_at
            WHERE leader_lease.node_id = excluded.node_id
               OR leader_lease.expires_at < ?3
               OR NOT EXISTS (
                    SELECT 1 FROM nodes
                    WHERE nodes.node_id = leader_lease.node_id
                      AND nodes.last_heartbeat >= ?5
               )
            "#,
        )
        .bind(node_id)
        .bind(node_number)
        .bind(now)
        .bind(expires_at)
        .bind(stale_cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn release_leadership(&self, node_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM leader_lease WHERE node_id = ?")
            .bind(node_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn current_leader(&self, now: DateTime<Utc>) -> Result<Option<LeaderLease>> {
        let lease = sqlx::query_as::<_, LeaderLease>(
            r#"
            SELECT node_id, node_number, acquired_at, expires_at
            FROM leader_lease
            WHERE expires_at >= ?
            "#,
        )
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(lease)
    }

    async fn load_assignments(&self) -> Result<Vec<AgentAssignment>> {
        let assignments = sqlx::query_as::<_, AgentAssignment>(
            "SELECT agent_uri, node_id, assigned_at FROM node_assignments ORDER BY agent_uri",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(assignments)
    }

    async fn assign_agent(
        &self,
        agent_uri: &str,
        node_id: Uuid,
        expected: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = match expected {
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO node_assignments (agent_uri, node_id, assigned_at)
                    VALUES (?, ?, ?)
                    ON CONFLICT (agent_uri) DO NOTHING
                    "#,
                )
                .bind(agent_uri)
                .bind(node_id)
                .bind(now)
                .execute(&self.pool)
                .await?
            }
            Some(expected) => {
                sqlx::query(
                    r#"
                    UPDATE node_assignments
                    SET node_id = ?, assigned_at = ?
                    WHERE agent_uri = ? AND node_id = ?
                    "#,
                )
                .bind(node_id)
                .bind(now)
                .bind(agent_uri)
                .bind(expected)
                .execute(&self.pool)
                .await?
            }
        };
        Ok(result.rows_affected() > 0)
    }

    async fn send_control(
        &self,
        node_id: Uuid,
        command: ControlCommand,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query("INSERT INTO control_queue (node_id, command, posted_at) VALUES (?, ?, ?)")
            .bind(node_id)
            .bind(command.as_str())
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn take_control_messages(&self, node_id: Uuid) -> Result<Vec<ControlCommand>> {
        let raw: Vec<String> =
            sqlx::query_scalar("DELETE FROM control_queue WHERE node_id = ? RETURNING command")
                .bind(node_id)
                .fetch_all(&self.pool)
                .await?;

        Ok(raw
            .into_iter()
            .filter_map(|command| match command.parse() {
                Ok(command) => Some(command),
                Err(e) => {
                    warn!(error = %e, "Skipping unknown control command");
                    None
                }
            })
            .collect())
    }

    async fn query_dead_letters(
        &self,
        filter: &DeadLetterFilter,
        page: Page,
    ) -> Result<Vec<DeadLetterEnvelope>> {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {}, {} FROM dead_letter_envelopes",
            ENVELOPE_COLUMNS, DEAD_LETTER_COLUMNS
        ));
        filter.push_where(&mut builder);
        builder
            .push(" ORDER BY failed_at, id LIMIT ")
            .push_bind(page.limit)
            .push(" OFFSET ")
            .push_bind(page.offset);

        let rows = builder
            .build_query_as::<DeadLetterRow>()
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(DeadLetterEnvelope::try_from).collect()
    }

    async fn count_dead_letters(&self, filter: &DeadLetterFilter) -> Result<i64> {
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT COUNT(*) FROM dead_letter_envelopes");
        filter.push_where(&mut builder);
        let count = builder
            .build_query_scalar::<i64>()
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn summarize_dead_letters(&self) -> Result<Vec<DeadLetterSummary>> {
        let summary = sqlx::query_as::<_, DeadLetterSummary>(
            r#"
            SELECT service_name, received_at, message_type, exception_type, COUNT(*) AS count
            FROM dead_letter_envelopes
            GROUP BY service_name, received_at, message_type, exception_type
            ORDER BY service_name, received_at, message_type, exception_type
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(summary)
    }

    async fn find_dead_letter(&self, id: Uuid) -> Result<Option<DeadLetterEnvelope>> {
        let row = sqlx::query_as::<_, DeadLetterRow>(&format!(
            "SELECT {}, {} FROM dead_letter_envelopes WHERE id = ? LIMIT 1",
            ENVELOPE_COLUMNS, DEAD_LETTER_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(DeadLetterEnvelope::try_from).transpose()
    }

    async fn dead_letter_ids(&self, filter: &DeadLetterFilter, limit: i64) -> Result<Vec<Uuid>> {
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT id FROM dead_letter_envelopes");
        filter.push_where(&mut builder);
        builder.push(" ORDER BY failed_at LIMIT ").push_bind(limit);
        let ids = builder
            .build_query_scalar::<Uuid>()
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }

    async fn mark_dead_letters_replayable(&self, ids: &[Uuid]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut marked = 0;
        for id in ids {
            marked += sqlx::query("UPDATE dead_letter_envelopes SET replayable = ? WHERE id = ?")
                .bind(true)
                .bind(id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;
        Ok(marked)
    }

    async fn replay_dead_letters(&self, ids: &[Uuid]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut replayed = 0;
        for id in ids {
            sqlx::query(
                r#"
                DELETE FROM incoming_envelopes
                WHERE id = ?1
                  AND identity_scope IN (SELECT identity_scope FROM dead_letter_envelopes WHERE id = ?1)
                "#,
            )
            .bind(id)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                r#"
                INSERT INTO incoming_envelopes (
                    id, identity_scope, status, owner_id, attempts, body, message_type,
                    content_type, execution_time, keep_until, deliver_by, destination,
                    received_at, reply_uri, source, correlation_id, conversation_id,
                    parent_id, saga_id, tenant_id, sent_at, headers
                )
                SELECT id, identity_scope, 'Incoming', 0, 0, body, message_type,
                       content_type, NULL, NULL, NULL, destination,
                       received_at, reply_uri, source, correlation_id, conversation_id,
                       parent_id, saga_id, tenant_id, sent_at, headers
                FROM dead_letter_envelopes
                WHERE id = ?1
                "#,
            )
            .bind(id)
            .execute(&mut *tx)
            .await?;

            replayed += sqlx::query("DELETE FROM dead_letter_envelopes WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;
        Ok(replayed)
    }

    async fn discard_dead_letters(&self, ids: &[Uuid]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut discarded = 0;
        for id in ids {
            discarded += sqlx::query("DELETE FROM dead_letter_envelopes WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;
        Ok(discarded)
    }

    async fn delete_expired_handled(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM incoming_envelopes WHERE status = 'Handled' AND keep_until <= ?",
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn delete_expired_dead_letters(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM dead_letter_envelopes WHERE expires_at IS NOT NULL AND expires_at <= ?",
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn fetch_counts(&self) -> Result<PersistedCounts> {
        let counts = sqlx::query_as::<_, PersistedCounts>(
            r#"
            SELECT
                (SELECT COUNT(*) FROM incoming_envelopes WHERE status = 'Incoming') AS incoming,
                (SELECT COUNT(*) FROM incoming_envelopes WHERE status = 'Scheduled') AS scheduled,
                (SELECT COUNT(*) FROM incoming_envelopes WHERE status = 'Handled') AS handled,
                (SELECT COUNT(*) FROM outgoing_envelopes) AS outgoing,
                (SELECT COUNT(*) FROM dead_letter_envelopes) AS dead_letter
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(counts)
    }

    async fn health_check(&self) -> Result<bool> {
        let result: std::result::Result<(i64,), _> =
            sqlx::query_as("SELECT 1").fetch_one(&self.pool).await;
        Ok(result.is_ok())
    }
}
