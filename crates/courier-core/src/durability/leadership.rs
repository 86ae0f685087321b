// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Leadership election over a leased row, and the leader's duties.
//!
//! At most one node holds a non-expired lease. A lease held by a node whose
//! heartbeat went stale may be taken over before it expires.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use super::{DurabilityAgent, SINGLETON_AGENTS};
use crate::clock::to_chrono;
use crate::config::DurabilityMode;
use crate::error::Result;
use crate::persistence::ControlCommand;
use crate::runtime::RuntimeContext;

/// Leadership state of this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeadershipState {
    /// Not yet contended.
    Candidate,
    /// Holds the lease.
    Leader,
    /// Another node holds the lease.
    Follower,
}

/// Leadership state machine of one node.
#[derive(Debug)]
pub struct LeadershipElection {
    state: watch::Sender<LeadershipState>,
}

impl Default for LeadershipElection {
    fn default() -> Self {
        Self::new()
    }
}

impl LeadershipElection {
    /// Start as a candidate.
    pub fn new() -> Self {
        let (state, _) = watch::channel(LeadershipState::Candidate);
        Self { state }
    }

    /// Current state.
    pub fn state(&self) -> LeadershipState {
        *self.state.borrow()
    }

    /// Watch the state.
    pub fn watch(&self) -> watch::Receiver<LeadershipState> {
        self.state.subscribe()
    }

    fn set(&self, next: LeadershipState, node_number: i32) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!(
                node_number = node_number,
                previous = ?previous,
                current = ?next,
                "Leadership changed"
            );
        }
    }

    /// Take or renew the lease.
    pub(crate) async fn tick(&self, context: &RuntimeContext) -> Result<LeadershipState> {
        if context.settings.mode == DurabilityMode::Solo {
            self.set(LeadershipState::Leader, context.node_number);
            return Ok(LeadershipState::Leader);
        }

        let now = context.clock.now();
        let attained = context
            .store
            .try_attain_leadership(
                context.node_id,
                context.node_number,
                now,
                now + to_chrono(context.settings.leadership_lease),
                now - to_chrono(context.settings.stale_node_threshold),
            )
            .await?;

        let next = if attained {
            LeadershipState::Leader
        } else {
            LeadershipState::Follower
        };
        self.set(next, context.node_number);
        Ok(next)
    }

    /// Release the lease.
    pub(crate) async fn stand_down(&self, context: &RuntimeContext) -> Result<()> {
        if context.settings.mode != DurabilityMode::Solo {
            context.store.release_leadership(context.node_id).await?;
        }
        self.set(LeadershipState::Follower, context.node_number);
        Ok(())
    }
}

/// What one round of leader duties did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LeaderDuties {
    /// Stale nodes evicted.
    pub evicted_nodes: usize,
    /// Envelopes released from evicted or unknown owners.
    pub released: u64,
    /// Singleton agents (re)assigned.
    pub reassigned_agents: usize,
}

impl DurabilityAgent {
    /// Evict stale nodes and make sure every singleton agent runs on a live
    /// node.
    pub(crate) async fn run_leader_duties(self: &Arc<Self>) -> Result<LeaderDuties> {
        let context = &self.context;
        let store = &context.store;
        let now = context.clock.now();
        let cutoff = now - to_chrono(context.settings.stale_node_threshold);
        let mut duties = LeaderDuties::default();

        let nodes = store.load_nodes().await?;
        let mut live: Vec<Uuid> = Vec::new();
        for node in &nodes {
            if node.node_id == context.node_id || node.is_live(cutoff) {
                live.push(node.node_id);
                continue;
            }
            warn!(
                node_number = node.node_number,
                node_id = %node.node_id,
                last_heartbeat = %node.last_heartbeat,
                "Evicting stale node"
            );
            duties.released += store.release_incoming(node.node_number).await?;
            duties.released += store.release_outgoing(node.node_number, None).await?;
            store.delete_node(node.node_id).await?;
            duties.evicted_nodes += 1;
        }
        if !live.contains(&context.node_id) {
            live.push(context.node_id);
        }
        duties.released += store.release_orphaned_envelopes().await?;

        let assignments = store.load_assignments().await?;
        let mut load: HashMap<Uuid, usize> = live.iter().map(|node| (*node, 0)).collect();
        for assignment in &assignments {
            if let Some(count) = load.get_mut(&assignment.node_id) {
                *count += 1;
            }
        }

        for agent in SINGLETON_AGENTS {
            let current = assignments
                .iter()
                .find(|assignment| assignment.agent_uri == *agent)
                .map(|assignment| assignment.node_id);
            if current.is_some_and(|holder| load.contains_key(&holder)) {
                continue;
            }

            let Some(target) = least_loaded(&load) else {
                continue;
            };
            if store.assign_agent(agent, target, current, now).await? {
                if let Some(count) = load.get_mut(&target) {
                    *count += 1;
                }
                duties.reassigned_agents += 1;
                info!(agent = %agent, node_id = %target, "Assigned singleton agent");
                if target == context.node_id {
                    self.refresh_assignments().await?;
                } else {
                    store
                        .send_control(target, ControlCommand::CheckAssignments, now)
                        .await?;
                }
            }
        }

        Ok(duties)
    }
}

fn least_loaded(load: &HashMap<Uuid, usize>) -> Option<Uuid> {
    load.iter()
        .min_by(|(a_id, a), (b_id, b)| a.cmp(b).then_with(|| a_id.cmp(b_id)))
        .map(|(node, _)| *node)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_least_loaded_prefers_fewest_agents() {
        let busy = Uuid::from_u128(1);
        let idle = Uuid::from_u128(2);
        let load: HashMap<Uuid, usize> = [(busy, 2), (idle, 0)].into();
        assert_eq!(least_loaded(&load), Some(idle));
        assert_eq!(least_loaded(&HashMap::new()), None);
    }

    #[test]
    fn test_least_loaded_breaks_ties_by_id() {
        let first = Uuid::from_u128(1);
        let second = Uuid::from_u128(2);
        let load: HashMap<Uuid, usize> = [(second, 1), (first, 1)].into();
        assert_eq!(least_loaded(&load), Some(first));
    }

    #[test]
    fn test_election_starts_as_candidate() {
        let election = LeadershipElection::new();
        assert_eq!(election.state(), LeadershipState::Candidate);
        let watcher = election.watch();
        election.set(LeadershipState::Leader, 1);
        assert_eq!(*watcher.borrow(), LeadershipState::Leader);
    }
}
