// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Recovery cycle.
//!
//! One cycle, in order:
//!
//! 1. renew or contend for leadership
//! 2. promote due scheduled rows when this node holds the scheduled-jobs agent
//! 3. as leader: evict stale nodes, reassign singleton agents and replay dead
//!    letters marked replayable
//! 4. claim a batch of incoming envelopes owned by any node
//! 5. claim a batch of outgoing envelopes owned by any node whose destination
//!    is reachable from here and not latched
//! 6. when this node holds the retention agent: delete expired handled rows
//!    and dead letters

use std::sync::Arc;

use tracing::{debug, info};

use super::{DurabilityAgent, LeadershipState, RETENTION_AGENT, SCHEDULED_JOBS_AGENT};
use crate::clock::to_chrono;
use crate::envelope::Envelope;
use crate::error::Result;
use crate::persistence::{ANY_NODE, DeadLetterFilter};

/// What one recovery cycle did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Leadership state after the cycle.
    pub leader: bool,
    /// Scheduled rows promoted by this node.
    pub scheduled_promoted: usize,
    /// Stale nodes evicted.
    pub evicted_nodes: usize,
    /// Envelopes released from evicted or unknown owners.
    pub released: u64,
    /// Incoming envelopes claimed.
    pub incoming_claimed: usize,
    /// Outgoing envelopes claimed.
    pub outgoing_claimed: usize,
    /// Replayable dead letters moved back to incoming.
    pub dead_letters_replayed: u64,
    /// Handled rows past retention deleted.
    pub handled_deleted: u64,
    /// Dead letters past retention deleted.
    pub dead_letters_deleted: u64,
}

impl RecoveryReport {
    /// Whether the cycle found nothing to do.
    pub fn is_idle(&self) -> bool {
        *self
            == RecoveryReport {
                leader: self.leader,
                ..RecoveryReport::default()
            }
    }
}

impl DurabilityAgent {
    /// Run one recovery cycle.
    pub(crate) async fn recover_once(self: &Arc<Self>) -> Result<RecoveryReport> {
        let context = &self.context;
        let mut report = RecoveryReport::default();

        report.leader = self.leadership.tick(context).await? == LeadershipState::Leader;

        if self.assignments.runs(SCHEDULED_JOBS_AGENT) {
            report.scheduled_promoted = context.promote_due_scheduled().await?;
        }

        if report.leader {
            let duties = self.run_leader_duties().await?;
            report.evicted_nodes = duties.evicted_nodes;
            report.released = duties.released;
            report.dead_letters_replayed = self.replay_replayable().await?;
        }

        report.incoming_claimed = self.claim_incoming().await?;
        report.outgoing_claimed = self.claim_outgoing().await?;

        if self.assignments.runs(RETENTION_AGENT) && self.retention_due() {
            let now = context.clock.now();
            report.handled_deleted = context.store.delete_expired_handled(now).await?;
            report.dead_letters_deleted = context.store.delete_expired_dead_letters(now).await?;
        }

        if !report.is_idle() {
            info!(
                leader = report.leader,
                promoted = report.scheduled_promoted,
                evicted = report.evicted_nodes,
                incoming = report.incoming_claimed,
                outgoing = report.outgoing_claimed,
                replayed = report.dead_letters_replayed,
                "Recovery cycle"
            );
        }
        Ok(report)
    }

    async fn claim_incoming(&self) -> Result<usize> {
        let context = &self.context;
        let page = context
            .store
            .load_page_of_globally_owned_incoming(context.settings.recovery_batch_size)
            .await?;
        if page.is_empty() {
            return Ok(0);
        }

        let claimed = context
            .store
            .reassign_incoming(context.node_number, ANY_NODE, &page)
            .await?;
        let count = claimed.len();
        debug!(found = page.len(), claimed = count, "Claimed incoming envelopes");
        for envelope in claimed {
            context.dispatch_owned(envelope).await?;
        }
        Ok(count)
    }

    async fn claim_outgoing(&self) -> Result<usize> {
        let context = &self.context;
        let page: Vec<Envelope> = context
            .store
            .load_page_of_globally_owned_outgoing(context.settings.recovery_batch_size)
            .await?
            .into_iter()
            .filter(|envelope| {
                envelope.destination.as_ref().is_some_and(|destination| {
                    context.senders.can_send_to(destination)
                        && !context.senders.is_latched(destination)
                })
            })
            .collect();
        if page.is_empty() {
            return Ok(0);
        }

        let claimed = context
            .store
            .reassign_outgoing(context.node_number, ANY_NODE, &page)
            .await?;
        let count = claimed.len();
        debug!(found = page.len(), claimed = count, "Claimed outgoing envelopes");
        for envelope in claimed {
            context.senders.enqueue(envelope)?;
        }
        Ok(count)
    }

    async fn replay_replayable(&self) -> Result<u64> {
        let store = &self.context.store;
        let filter = DeadLetterFilter {
            replayable: Some(true),
            ..DeadLetterFilter::default()
        };
        let ids = store
            .dead_letter_ids(&filter, self.context.settings.recovery_batch_size as i64)
            .await?;
        if ids.is_empty() {
            return Ok(0);
        }
        store.replay_dead_letters(&ids).await
    }

    fn retention_due(&self) -> bool {
        let now = self.context.clock.now();
        let interval = to_chrono(self.context.settings.retention_interval);
        let mut last = self
            .last_retention
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match *last {
            Some(at) if now - at < interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}
