// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Heartbeat and control-queue handling.

use tracing::{debug, warn};

use super::DurabilityAgent;
use crate::error::Result;
use crate::persistence::ControlCommand;

impl DurabilityAgent {
    /// Refresh the heartbeat and act on queued control commands.
    ///
    /// A node row deleted by a leader that wrongly judged this node stale is
    /// restored under the same node number.
    pub(crate) async fn health_check_once(&self) -> Result<()> {
        let context = &self.context;
        let now = context.clock.now();

        if !context.store.heartbeat(context.node_id, now).await? {
            warn!(
                node_number = context.node_number,
                "Node row missing, restoring registration"
            );
            context
                .store
                .restore_node(context.node_number, context.node_id, &context.service_name, now)
                .await?;
        }

        for command in context.store.take_control_messages(context.node_id).await? {
            self.apply_control(command).await?;
        }
        self.refresh_assignments().await
    }

    async fn apply_control(&self, command: ControlCommand) -> Result<()> {
        debug!(node_number = self.context.node_number, command = %command, "Control command");
        match command {
            ControlCommand::StandDown => self.leadership.stand_down(&self.context).await,
            ControlCommand::CheckAssignments => self.refresh_assignments().await,
        }
    }
}
