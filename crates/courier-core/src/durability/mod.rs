// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Node coordination and recovery.
//!
//! Each node runs three background loops:
//!
//! - the node agent heartbeats the node row and drains the control queue
//! - the recovery agent renews leadership, runs leader duties and claims
//!   envelopes released to any node
//! - the scheduled-jobs poll promotes due durable rows when this node holds
//!   the scheduled-jobs agent
//!
//! Singleton agents are assigned to one live node at a time by the leader
//! through the `node_assignments` table.

pub mod leadership;
pub mod node_agent;
pub mod recovery;

use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::DurabilityMode;
use crate::error::Result;
use crate::runtime::RuntimeContext;

pub use self::leadership::{LeadershipElection, LeadershipState};
pub use self::recovery::RecoveryReport;

/// Agent that promotes due scheduled rows.
pub const SCHEDULED_JOBS_AGENT: &str = "courier://agents/scheduled-jobs";

/// Agent that deletes expired handled rows and dead letters.
pub const RETENTION_AGENT: &str = "courier://agents/retention";

/// Every singleton agent the leader assigns.
pub const SINGLETON_AGENTS: &[&str] = &[SCHEDULED_JOBS_AGENT, RETENTION_AGENT];

/// Singleton agents assigned to this node.
#[derive(Debug, Default)]
pub struct AgentAssignments {
    mine: RwLock<BTreeSet<String>>,
}

impl AgentAssignments {
    /// Whether this node runs `agent`.
    pub fn runs(&self, agent: &str) -> bool {
        self.mine
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(agent)
    }

    /// Agents this node runs.
    pub fn agents(&self) -> Vec<String> {
        self.mine
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    fn replace(&self, agents: BTreeSet<String>) -> bool {
        let mut mine = self
            .mine
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let changed = *mine != agents;
        *mine = agents;
        changed
    }
}

#[derive(Debug, Clone, Copy)]
enum Cycle {
    Heartbeat,
    Recovery,
    ScheduledPoll,
}

/// Background durability work of one node.
pub(crate) struct DurabilityAgent {
    pub(crate) context: Arc<RuntimeContext>,
    pub(crate) leadership: LeadershipElection,
    pub(crate) assignments: AgentAssignments,
    last_retention: RwLock<Option<DateTime<Utc>>>,
}

impl DurabilityAgent {
    pub(crate) fn new(context: Arc<RuntimeContext>) -> Self {
        Self {
            context,
            leadership: LeadershipElection::new(),
            assignments: AgentAssignments::default(),
            last_retention: RwLock::new(None),
        }
    }

    fn is_solo(&self) -> bool {
        self.context.settings.mode == DurabilityMode::Solo
    }

    /// Reload the singleton agents assigned to this node.
    pub(crate) async fn refresh_assignments(&self) -> Result<()> {
        let agents: BTreeSet<String> = if self.is_solo() {
            SINGLETON_AGENTS.iter().map(|agent| agent.to_string()).collect()
        } else {
            self.context
                .store
                .load_assignments()
                .await?
                .into_iter()
                .filter(|assignment| assignment.node_id == self.context.node_id)
                .map(|assignment| assignment.agent_uri)
                .collect()
        };

        if self.assignments.replace(agents) {
            info!(
                node_number = self.context.node_number,
                agents = ?self.assignments.agents(),
                "Agent assignments changed"
            );
        }
        Ok(())
    }

    /// Spawn the heartbeat, recovery and scheduled-poll loops.
    pub(crate) fn spawn(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        [Cycle::Heartbeat, Cycle::Recovery, Cycle::ScheduledPoll]
            .into_iter()
            .map(|cycle| tokio::spawn(Arc::clone(self).run_loop(cycle, shutdown.clone())))
            .collect()
    }

    async fn run_loop(self: Arc<Self>, cycle: Cycle, mut shutdown: watch::Receiver<bool>) {
        let settings = &self.context.settings;
        let interval = match cycle {
            Cycle::Heartbeat => settings.health_check_interval,
            Cycle::Recovery => settings.recovery_interval,
            Cycle::ScheduledPoll => settings.scheduled_poll_interval,
        };
        info!(agent = ?cycle, interval_secs = interval.as_secs(), "Durability agent started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(interval) => {
                    let result = match cycle {
                        Cycle::Heartbeat => self.health_check_once().await,
                        Cycle::Recovery => self.recover_once().await.map(|_| ()),
                        Cycle::ScheduledPoll => self.poll_scheduled_once().await.map(|_| ()),
                    };
                    if let Err(e) = result {
                        error!(agent = ?cycle, error = %e, "Durability agent cycle failed");
                    }
                }
            }
        }
        info!(agent = ?cycle, "Durability agent stopped");
    }

    /// Promote due scheduled rows if this node holds the scheduled-jobs agent.
    pub(crate) async fn poll_scheduled_once(&self) -> Result<usize> {
        if !self.assignments.runs(SCHEDULED_JOBS_AGENT) {
            return Ok(0);
        }
        self.context.promote_due_scheduled().await
    }

    /// Give up everything this node owns: leadership, envelopes, agent
    /// assignments and the node row.
    pub(crate) async fn release(&self) -> Result<()> {
        let store = &self.context.store;
        let node_number = self.context.node_number;

        if self.leadership.state() == LeadershipState::Leader {
            self.leadership.stand_down(&self.context).await?;
        }
        let incoming = store.release_incoming(node_number).await?;
        let outgoing = store.release_outgoing(node_number, None).await?;
        store.delete_node(self.context.node_id).await?;
        info!(
            node_number = node_number,
            incoming = incoming,
            outgoing = outgoing,
            "Released node ownership"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assignments_replace_reports_change() {
        let assignments = AgentAssignments::default();
        assert!(!assignments.runs(SCHEDULED_JOBS_AGENT));

        let set: BTreeSet<String> = [SCHEDULED_JOBS_AGENT.to_string()].into();
        assert!(assignments.replace(set.clone()));
        assert!(!assignments.replace(set));
        assert!(assignments.runs(SCHEDULED_JOBS_AGENT));
        assert!(!assignments.runs(RETENTION_AGENT));
        assert_eq!(assignments.agents(), vec![SCHEDULED_JOBS_AGENT.to_string()]);
    }
}
