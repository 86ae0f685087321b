// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Durable store interfaces and backends for courier-core.
//!
//! The store holds five logical tables: incoming envelopes (with a
//! `Scheduled` status flag standing in for the scheduled table), outgoing
//! envelopes, dead letters, the node registry and the control queue.
//!
//! Every ownership change is a conditional update: it only applies when the
//! row's owner (or status) still matches what the caller observed. A caller
//! that loses such a race simply gets fewer rows back.

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresStore;
pub use self::sqlite::SqliteStore;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::QueryBuilder;
use uuid::Uuid;

use crate::envelope::{Envelope, EnvelopeStatus, MessageIdentity};
use crate::error::{CoreError, Result};
use crate::uri::Uri;

/// Owner id meaning "any node may claim this row".
pub const ANY_NODE: i32 = 0;

/// Columns shared by the incoming, outgoing and dead-letter tables.
pub(crate) const ENVELOPE_COLUMNS: &str = "id, status, owner_id, attempts, body, message_type, \
     content_type, execution_time, keep_until, deliver_by, destination, received_at, reply_uri, \
     source, correlation_id, conversation_id, parent_id, saga_id, tenant_id, sent_at, headers";

/// Dead-letter columns beyond [`ENVELOPE_COLUMNS`].
pub(crate) const DEAD_LETTER_COLUMNS: &str =
    "exception_type, exception_message, explanation, replayable, failed_at, expires_at, service_name";

/// Envelope row as stored in the incoming, outgoing and dead-letter tables.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EnvelopeRow {
    /// Envelope id.
    pub id: Uuid,
    /// Persisted [`EnvelopeStatus`].
    pub status: String,
    /// Owning node number.
    pub owner_id: i32,
    /// Delivery attempts.
    pub attempts: i32,
    /// Serialized payload.
    pub body: Vec<u8>,
    /// Message type name.
    pub message_type: String,
    /// Payload content type.
    pub content_type: String,
    /// When a scheduled envelope becomes due.
    pub execution_time: Option<DateTime<Utc>>,
    /// Retention deadline for handled rows.
    pub keep_until: Option<DateTime<Utc>>,
    /// Delivery deadline.
    pub deliver_by: Option<DateTime<Utc>>,
    /// Destination address.
    pub destination: Option<String>,
    /// Receiving listener address.
    pub received_at: Option<String>,
    /// Reply address.
    pub reply_uri: Option<String>,
    /// Sending service.
    pub source: Option<String>,
    /// Correlation id.
    pub correlation_id: Option<String>,
    /// Causing envelope id.
    pub conversation_id: Option<Uuid>,
    /// Parent id.
    pub parent_id: Option<String>,
    /// Saga id.
    pub saga_id: Option<String>,
    /// Tenant id.
    pub tenant_id: Option<String>,
    /// Creation time at the sender.
    pub sent_at: DateTime<Utc>,
    /// User headers as a JSON object.
    pub headers: String,
}

impl TryFrom<EnvelopeRow> for Envelope {
    type Error = CoreError;

    fn try_from(row: EnvelopeRow) -> Result<Self> {
        let headers: BTreeMap<String, String> = if row.headers.is_empty() {
            BTreeMap::new()
        } else {
            serde_json::from_str(&row.headers)?
        };

        Ok(Envelope {
            id: row.id,
            message_type: row.message_type,
            content_type: row.content_type,
            data: row.body,
            status: row.status.parse()?,
            owner_id: row.owner_id,
            attempts: row.attempts,
            scheduled_time: row.execution_time,
            keep_until: row.keep_until,
            deliver_by: row.deliver_by,
            destination: parse_uri(row.destination)?,
            received_at: parse_uri(row.received_at)?,
            reply_uri: parse_uri(row.reply_uri)?,
            source: row.source,
            correlation_id: row.correlation_id,
            conversation_id: row.conversation_id,
            parent_id: row.parent_id,
            saga_id: row.saga_id,
            tenant_id: row.tenant_id,
            sent_at: row.sent_at,
            headers,
        })
    }
}

fn parse_uri(raw: Option<String>) -> Result<Option<Uri>> {
    raw.map(|value| Uri::parse(&value)).transpose()
}

pub(crate) fn rows_to_envelopes(rows: Vec<EnvelopeRow>) -> Result<Vec<Envelope>> {
    rows.into_iter().map(Envelope::try_from).collect()
}

pub(crate) fn headers_json(envelope: &Envelope) -> Result<String> {
    Ok(serde_json::to_string(&envelope.headers)?)
}

/// Dead-letter row: the envelope plus failure details.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DeadLetterRow {
    /// Envelope columns.
    #[sqlx(flatten)]
    pub envelope: EnvelopeRow,
    /// Error kind that caused the move.
    pub exception_type: String,
    /// Error message.
    pub exception_message: String,
    /// Why the envelope was dead-lettered.
    pub explanation: String,
    /// Whether the recovery agent should replay it.
    pub replayable: bool,
    /// When it was dead-lettered.
    pub failed_at: DateTime<Utc>,
    /// Retention deadline.
    pub expires_at: Option<DateTime<Utc>>,
    /// Service that dead-lettered it.
    pub service_name: String,
}

/// A permanently failed envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetterEnvelope {
    /// The envelope as it was when it failed.
    pub envelope: Envelope,
    /// Error kind that caused the move.
    pub exception_type: String,
    /// Error message.
    pub exception_message: String,
    /// Why the envelope was dead-lettered.
    pub explanation: String,
    /// Whether the recovery agent should replay it.
    pub replayable: bool,
    /// When it was dead-lettered.
    pub failed_at: DateTime<Utc>,
    /// Retention deadline.
    pub expires_at: Option<DateTime<Utc>>,
    /// Service that dead-lettered it.
    pub service_name: String,
}

impl TryFrom<DeadLetterRow> for DeadLetterEnvelope {
    type Error = CoreError;

    fn try_from(row: DeadLetterRow) -> Result<Self> {
        let mut envelope = Envelope::try_from(row.envelope)?;
        envelope.status = EnvelopeStatus::DeadLetter;
        Ok(Self {
            envelope,
            exception_type: row.exception_type,
            exception_message: row.exception_message,
            explanation: row.explanation,
            replayable: row.replayable,
            failed_at: row.failed_at,
            expires_at: row.expires_at,
            service_name: row.service_name,
        })
    }
}

/// Request to move an envelope to dead-letter storage.
#[derive(Debug, Clone)]
pub struct ErrorReport {
    /// The failed envelope.
    pub envelope: Envelope,
    /// Error kind.
    pub exception_type: String,
    /// Error message.
    pub exception_message: String,
    /// Why the envelope is being dead-lettered.
    pub explanation: String,
}

impl ErrorReport {
    /// Build a report.
    pub fn new(
        envelope: Envelope,
        exception_type: impl Into<String>,
        exception_message: impl Into<String>,
        explanation: impl Into<String>,
    ) -> Self {
        Self {
            envelope,
            exception_type: exception_type.into(),
            exception_message: exception_message.into(),
            explanation: explanation.into(),
        }
    }
}

/// Filter for dead-letter queries and bulk operations.
///
/// Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct DeadLetterFilter {
    /// Message type.
    pub message_type: Option<String>,
    /// Exception type.
    pub exception_type: Option<String>,
    /// Receiving address.
    pub received_at: Option<String>,
    /// Service name.
    pub service_name: Option<String>,
    /// Dead-lettered at or after.
    pub from: Option<DateTime<Utc>>,
    /// Dead-lettered before.
    pub until: Option<DateTime<Utc>>,
    /// Replayable flag.
    pub replayable: Option<bool>,
}

impl DeadLetterFilter {
    /// Filter on message type.
    pub fn message_type(mut self, message_type: impl Into<String>) -> Self {
        self.message_type = Some(message_type.into());
        self
    }

    /// Filter on exception type.
    pub fn exception_type(mut self, exception_type: impl Into<String>) -> Self {
        self.exception_type = Some(exception_type.into());
        self
    }

    /// Filter on receiving address.
    pub fn received_at(mut self, uri: &Uri) -> Self {
        self.received_at = Some(uri.to_string());
        self
    }

    /// Filter on time range `[from, until)`.
    pub fn between(mut self, from: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        self.from = Some(from);
        self.until = Some(until);
        self
    }

    /// Append `WHERE` clauses for this filter to a query.
    pub(crate) fn push_where<'a, DB>(&self, builder: &mut QueryBuilder<'a, DB>)
    where
        DB: sqlx::Database,
        String: sqlx::Encode<'a, DB> + sqlx::Type<DB>,
        DateTime<Utc>: sqlx::Encode<'a, DB> + sqlx::Type<DB>,
        bool: sqlx::Encode<'a, DB> + sqlx::Type<DB>,
    {
        builder.push(" WHERE 1 = 1");
        if let Some(value) = &self.message_type {
            builder.push(" AND message_type = ").push_bind(value.clone());
        }
        if let Some(value) = &self.exception_type {
            builder.push(" AND exception_type = ").push_bind(value.clone());
        }
        if let Some(value) = &self.received_at {
            builder.push(" AND received_at = ").push_bind(value.clone());
        }
        if let Some(value) = &self.service_name {
            builder.push(" AND service_name = ").push_bind(value.clone());
        }
        if let Some(value) = self.from {
            builder.push(" AND failed_at >= ").push_bind(value);
        }
        if let Some(value) = self.until {
            builder.push(" AND failed_at < ").push_bind(value);
        }
        if let Some(value) = self.replayable {
            builder.push(" AND replayable = ").push_bind(value);
        }
    }
}

/// Offset/limit paging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    /// Rows to skip.
    pub offset: i64,
    /// Maximum rows to return.
    pub limit: i64,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 100,
        }
    }
}

/// Dead-letter count for one group.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct DeadLetterSummary {
    /// Service name.
    pub service_name: String,
    /// Receiving address.
    pub received_at: Option<String>,
    /// Message type.
    pub message_type: String,
    /// Exception type.
    pub exception_type: String,
    /// Rows in the group.
    pub count: i64,
}

/// View over a scheduled envelope.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ScheduledJob {
    /// Envelope id.
    pub envelope_id: Uuid,
    /// When the job is due.
    pub execution_time: DateTime<Utc>,
    /// Message type.
    pub message_type: String,
    /// Receiving address, if the envelope was received.
    pub received_at: Option<String>,
    /// Destination for scheduled sends.
    pub destination: Option<String>,
}

/// Row counts for health reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, sqlx::FromRow)]
pub struct PersistedCounts {
    /// Incoming rows awaiting execution.
    pub incoming: i64,
    /// Incoming rows deferred to a later time.
    pub scheduled: i64,
    /// Handled rows kept for de-duplication.
    pub handled: i64,
    /// Outgoing rows awaiting acknowledgement.
    pub outgoing: i64,
    /// Dead-letter rows.
    pub dead_letter: i64,
}

/// Node registry row.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct NodeRecord {
    /// Monotonic node number, used as envelope owner id.
    pub node_number: i32,
    /// Unique node id.
    pub node_id: Uuid,
    /// Service name.
    pub service_name: String,
    /// Registration time.
    pub started_at: DateTime<Utc>,
    /// Last heartbeat.
    pub last_heartbeat: DateTime<Utc>,
}

impl NodeRecord {
    /// Whether the heartbeat is at or after `cutoff`.
    pub fn is_live(&self, cutoff: DateTime<Utc>) -> bool {
        self.last_heartbeat >= cutoff
    }
}

/// Singleton agent assignment row.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct AgentAssignment {
    /// Agent URI.
    pub agent_uri: String,
    /// Node running the agent.
    pub node_id: Uuid,
    /// Assignment time.
    pub assigned_at: DateTime<Utc>,
}

/// Leadership lease row.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct LeaderLease {
    /// Leader node id.
    pub node_id: Uuid,
    /// Leader node number.
    pub node_number: i32,
    /// When the current holder first acquired the lease.
    pub acquired_at: DateTime<Utc>,
    /// When the lease lapses unless renewed.
    pub expires_at: DateTime<Utc>,
}

/// Node-to-node command delivered through the control queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlCommand {
    /// Release the leadership lease.
    StandDown,
    /// Re-read singleton agent assignments.
    CheckAssignments,
}

impl ControlCommand {
    /// Persisted representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StandDown => "StandDown",
            Self::CheckAssignments => "CheckAssignments",
        }
    }
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ControlCommand {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "StandDown" => Ok(Self::StandDown),
            "CheckAssignments" => Ok(Self::CheckAssignments),
            other => Err(CoreError::ValidationError {
                field: "command".to_string(),
                message: format!("unknown control command '{}'", other),
            }),
        }
    }
}

/// Unit-of-work contract.
///
/// Implemented for caller-owned sqlx transactions so that business writes
/// and message writes commit or roll back together.
#[async_trait]
pub trait EnvelopeTransaction: Send {
    /// Insert outgoing envelopes. Duplicates are ignored.
    async fn persist_outgoing(&mut self, envelopes: &[Envelope]) -> Result<()>;

    /// Insert incoming envelopes. Duplicates are ignored.
    async fn persist_incoming(
        &mut self,
        identity: MessageIdentity,
        envelopes: &[Envelope],
    ) -> Result<()>;
}

/// Durable store contract.
///
/// Batch operations run as single transactions.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Duplicate-detection mode for incoming rows.
    fn identity(&self) -> MessageIdentity;

    // ---- incoming ----

    /// Idempotent insert. Returns the ids that were newly inserted; a
    /// duplicate (including a retained handled row) is skipped.
    async fn store_incoming(&self, envelopes: &[Envelope]) -> Result<Vec<Uuid>>;

    /// Incoming row with `id` in any status.
    async fn find_incoming(&self, id: Uuid) -> Result<Option<Envelope>>;

    /// Incoming rows owned by [`ANY_NODE`], oldest first.
    async fn load_page_of_globally_owned_incoming(&self, limit: usize) -> Result<Vec<Envelope>>;

    /// Flip ownership to `new_owner` for rows still owned by
    /// `expected_owner`. Returns the envelopes actually claimed.
    async fn reassign_incoming(
        &self,
        new_owner: i32,
        expected_owner: i32,
        envelopes: &[Envelope],
    ) -> Result<Vec<Envelope>>;

    /// Mark handled (or delete when `keep_until` is `None`) and persist the
    /// cascaded envelopes in the same transaction. Cascades with status
    /// `Outgoing` land in the outgoing table, the rest in incoming.
    async fn mark_incoming_handled(
        &self,
        envelope: &Envelope,
        keep_until: Option<DateTime<Utc>>,
        cascades: &[Envelope],
    ) -> Result<()>;

    /// Delete incoming rows outright.
    async fn delete_incoming_envelopes(&self, envelopes: &[Envelope]) -> Result<()>;

    /// Persist `envelope.attempts` for the row.
    async fn increment_incoming_attempts(&self, envelope: &Envelope) -> Result<()>;

    /// Defer a row to `at`, releasing it to any node.
    async fn schedule_incoming(&self, envelope: &Envelope, at: DateTime<Utc>) -> Result<()>;

    /// Delete the incoming or outgoing row and insert dead letters, in one
    /// transaction.
    async fn move_to_dead_letter_storage(
        &self,
        reports: &[ErrorReport],
        service_name: &str,
        now: DateTime<Utc>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<()>;

    /// Replace a due incoming row with an outgoing row owned by `owner`.
    async fn move_incoming_to_outgoing(&self, envelope: &Envelope, owner: i32) -> Result<bool>;

    /// Release rows owned by `owner` back to [`ANY_NODE`].
    async fn release_incoming(&self, owner: i32) -> Result<u64>;

    // ---- scheduled ----

    /// `Scheduled` rows due at or before `now`, earliest first.
    async fn load_due_scheduled(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Envelope>>;

    /// Flip `Scheduled` rows that are due at `now` to `Incoming` owned by
    /// `new_owner`. Rows already promoted elsewhere are skipped.
    async fn promote_scheduled(
        &self,
        envelopes: &[Envelope],
        new_owner: i32,
        now: DateTime<Utc>,
    ) -> Result<Vec<Envelope>>;

    /// Pending scheduled rows, earliest first.
    async fn list_scheduled(&self, limit: usize) -> Result<Vec<ScheduledJob>>;

    /// Delete a row if it is still `Scheduled`. Returns whether it was.
    async fn cancel_scheduled(&self, id: Uuid) -> Result<bool>;

    // ---- outgoing ----

    /// Insert outgoing rows.
    async fn store_outgoing(&self, envelopes: &[Envelope]) -> Result<()>;

    /// Outgoing rows owned by `owner`, oldest first.
    async fn load_outgoing(&self, owner: i32, limit: usize) -> Result<Vec<Envelope>>;

    /// Outgoing rows owned by [`ANY_NODE`], oldest first.
    async fn load_page_of_globally_owned_outgoing(&self, limit: usize) -> Result<Vec<Envelope>>;

    /// Outgoing counterpart of [`MessageStore::reassign_incoming`].
    async fn reassign_outgoing(
        &self,
        new_owner: i32,
        expected_owner: i32,
        envelopes: &[Envelope],
    ) -> Result<Vec<Envelope>>;

    /// Delete acknowledged outgoing rows.
    async fn delete_outgoing(&self, envelopes: &[Envelope]) -> Result<()>;

    /// Persist `envelope.attempts` for the outgoing row.
    async fn increment_outgoing_attempts(&self, envelope: &Envelope) -> Result<()>;

    /// Release outgoing rows of `owner`, optionally only for one destination.
    async fn release_outgoing(&self, owner: i32, destination: Option<&Uri>) -> Result<u64>;

    /// Release incoming and outgoing rows whose owner has no node row.
    async fn release_orphaned_envelopes(&self) -> Result<u64>;

    // ---- nodes ----

    /// Insert a node row and return its node number.
    async fn register_node(
        &self,
        node_id: Uuid,
        service_name: &str,
        now: DateTime<Utc>,
    ) -> Result<i32>;

    /// Re-insert a node row that was evicted while the node was alive.
    async fn restore_node(
        &self,
        node_number: i32,
        node_id: Uuid,
        service_name: &str,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Refresh the heartbeat. Returns false when the row no longer exists.
    async fn heartbeat(&self, node_id: Uuid, now: DateTime<Utc>) -> Result<bool>;

    /// Every registered node, by node number.
    async fn load_nodes(&self) -> Result<Vec<NodeRecord>>;

    /// Delete a node row with its agent assignments.
    async fn delete_node(&self, node_id: Uuid) -> Result<()>;

    // ---- leadership ----

    /// Take or renew the lease. Succeeds only if the lease is ours, has
    /// expired, or belongs to a node whose heartbeat is older than
    /// `stale_cutoff`.
    async fn try_attain_leadership(
        &self,
        node_id: Uuid,
        node_number: i32,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
        stale_cutoff: DateTime<Utc>,
    ) -> Result<bool>;

    /// Drop the lease if `node_id` holds it.
    async fn release_leadership(&self, node_id: Uuid) -> Result<()>;

    /// Holder of an unexpired lease at `now`.
    async fn current_leader(&self, now: DateTime<Utc>) -> Result<Option<LeaderLease>>;

    // ---- assignments ----

    /// Current agent-to-node assignments.
    async fn load_assignments(&self) -> Result<Vec<AgentAssignment>>;

    /// Assign `agent_uri` to `node_id` if its current holder is `expected`
    /// (`None` meaning unassigned).
    async fn assign_agent(
        &self,
        agent_uri: &str,
        node_id: Uuid,
        expected: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    // ---- control queue ----

    /// Post a command for `node_id`.
    async fn send_control(
        &self,
        node_id: Uuid,
        command: ControlCommand,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Remove and return every command addressed to `node_id`.
    async fn take_control_messages(&self, node_id: Uuid) -> Result<Vec<ControlCommand>>;

    // ---- dead letters ----

    /// One page of dead letters matching `filter`.
    async fn query_dead_letters(
        &self,
        filter: &DeadLetterFilter,
        page: Page,
    ) -> Result<Vec<DeadLetterEnvelope>>;

    /// Number of dead letters matching `filter`.
    async fn count_dead_letters(&self, filter: &DeadLetterFilter) -> Result<i64>;

    /// Dead-letter counts grouped by service, listener, message type and
    /// exception type.
    async fn summarize_dead_letters(&self) -> Result<Vec<DeadLetterSummary>>;

    /// Dead letter with `id`.
    async fn find_dead_letter(&self, id: Uuid) -> Result<Option<DeadLetterEnvelope>>;

    /// Ids of up to `limit` dead letters matching `filter`, oldest failure
    /// first.
    async fn dead_letter_ids(&self, filter: &DeadLetterFilter, limit: i64) -> Result<Vec<Uuid>>;

    /// Flag dead letters for the leader to replay on its next cycle.
    async fn mark_dead_letters_replayable(&self, ids: &[Uuid]) -> Result<u64>;

    /// Re-insert dead letters as fresh incoming rows (attempts 0, any
    /// owner) and delete them, in one transaction.
    async fn replay_dead_letters(&self, ids: &[Uuid]) -> Result<u64>;

    /// Delete dead letters for good.
    async fn discard_dead_letters(&self, ids: &[Uuid]) -> Result<u64>;

    // ---- maintenance ----

    /// Delete handled rows whose `keep_until` has passed.
    async fn delete_expired_handled(&self, now: DateTime<Utc>) -> Result<u64>;

    /// Delete dead letters whose `expires_at` has passed.
    async fn delete_expired_dead_letters(&self, now: DateTime<Utc>) -> Result<u64>;

    /// Row counts per table and status.
    async fn fetch_counts(&self) -> Result<PersistedCounts>;

    /// Whether the database answers a trivial query.
    async fn health_check(&self) -> Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row() -> EnvelopeRow {
        EnvelopeRow {
            id: Uuid::new_v4(),
            status: "Incoming".to_string(),
            owner_id: 3,
            attempts: 1,
            body: b"{}".to_vec(),
            message_type: "order.placed".to_string(),
            content_type: "application/json".to_string(),
            execution_time: None,
            keep_until: None,
            deliver_by: None,
            destination: Some("local://orders".to_string()),
            received_at: Some("local://orders".to_string()),
            reply_uri: None,
            source: Some("shop".to_string()),
            correlation_id: None,
            conversation_id: None,
            parent_id: None,
            saga_id: None,
            tenant_id: None,
            sent_at: Utc::now(),
            headers: r#"{"x-trace":"1"}"#.to_string(),
        }
    }

    #[test]
    fn test_row_to_envelope() {
        let envelope = Envelope::try_from(row()).unwrap();
        assert_eq!(envelope.status, EnvelopeStatus::Incoming);
        assert_eq!(envelope.owner_id, 3);
        assert_eq!(envelope.received_at, Some(Uri::local("orders")));
        assert_eq!(envelope.headers.get("x-trace").map(String::as_str), Some("1"));
    }

    #[test]
    fn test_row_with_unknown_status_is_rejected() {
        let mut bad = row();
        bad.status = "Lost".to_string();
        let err = Envelope::try_from(bad).unwrap_err();
        assert_eq!(err.error_code(), "INVALID_ENVELOPE");
    }

    #[test]
    fn test_control_command_parse() {
        assert_eq!(
            "StandDown".parse::<ControlCommand>().unwrap(),
            ControlCommand::StandDown
        );
        assert_eq!(
            ControlCommand::CheckAssignments.to_string(),
            "CheckAssignments"
        );
        assert!("Reboot".parse::<ControlCommand>().is_err());
    }

    #[test]
    fn test_dead_letter_filter_sql() {
        let filter = DeadLetterFilter::default()
            .message_type("order.placed")
            .exception_type("Timeout");
        let mut builder = QueryBuilder::<sqlx::Sqlite>::new("SELECT id FROM dead_letter_envelopes");
        filter.push_where(&mut builder);
        let sql = builder.sql();
        assert!(sql.contains("message_type = ?"));
        assert!(sql.contains("exception_type = ?"));
        assert!(!sql.contains("failed_at"));
    }
}
