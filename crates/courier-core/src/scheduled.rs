// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Scheduled delivery.
//!
//! Deferred envelopes are tracked twice: in an in-memory timer on the node
//! that deferred them, and (for durable endpoints) as `Scheduled` rows that
//! the node holding the scheduled-jobs agent polls for. Both paths promote a
//! durable row through a conditional update, so whichever fires first wins
//! and the envelope executes once.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Notify, watch};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::envelope::{Envelope, EnvelopeStatus};
use crate::error::Result;
use crate::runtime::RuntimeContext;

/// Longest the timer sleeps before re-reading the clock.
const MAX_TIMER_SLEEP: Duration = Duration::from_secs(1);

/// In-memory timer of deferred envelopes, ordered by execution time.
#[derive(Debug, Default)]
pub struct InMemoryScheduledJobs {
    jobs: Mutex<BTreeMap<(DateTime<Utc>, Uuid), Envelope>>,
    changed: Notify,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl InMemoryScheduledJobs {
    /// Empty timer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `envelope` until its scheduled time. Envelopes without one are
    /// due immediately.
    pub fn enqueue(&self, envelope: Envelope) {
        let at = envelope.scheduled_time.unwrap_or(DateTime::<Utc>::MIN_UTC);
        lock(&self.jobs).insert((at, envelope.id), envelope);
        self.changed.notify_one();
    }

    /// Remove and return every envelope due at or before `cutoff`.
    pub fn play(&self, cutoff: DateTime<Utc>) -> Vec<Envelope> {
        let mut jobs = lock(&self.jobs);
        let later = match cutoff.checked_add_signed(chrono::Duration::nanoseconds(1)) {
            Some(bound) => jobs.split_off(&(bound, Uuid::nil())),
            None => BTreeMap::new(),
        };
        let due = std::mem::replace(&mut *jobs, later);
        due.into_values().collect()
    }

    /// Remove and return everything.
    pub fn play_all(&self) -> Vec<Envelope> {
        std::mem::take(&mut *lock(&self.jobs)).into_values().collect()
    }

    /// Forget the envelope with `id`.
    pub fn cancel(&self, id: Uuid) -> bool {
        let mut jobs = lock(&self.jobs);
        let key = jobs.keys().find(|(_, job)| *job == id).copied();
        key.and_then(|key| jobs.remove(&key)).is_some()
    }

    /// Tracked envelopes.
    pub fn count(&self) -> usize {
        lock(&self.jobs).len()
    }

    /// Earliest execution time.
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        lock(&self.jobs).keys().next().map(|(at, _)| *at)
    }
}

impl RuntimeContext {
    /// Hand due in-memory jobs to execution. Returns how many fired.
    pub(crate) async fn play_scheduled(self: &Arc<Self>, cutoff: DateTime<Utc>) -> usize {
        let due = self.scheduler.play(cutoff);
        let fired = due.len();
        for envelope in due {
            if let Err(e) = self.fire_scheduled(envelope).await {
                error!(error = %e, "Failed to fire scheduled envelope");
            }
        }
        fired
    }

    async fn fire_scheduled(self: &Arc<Self>, mut envelope: Envelope) -> Result<()> {
        if self.is_durable(&envelope) {
            let now = self.clock.now();
            let promoted = self
                .store
                .promote_scheduled(std::slice::from_ref(&envelope), self.node_number, now)
                .await?;
            if promoted.is_empty() {
                debug!(envelope_id = %envelope.id, "Scheduled envelope already promoted elsewhere");
            }
            for envelope in promoted {
                self.dispatch_owned(envelope).await?;
            }
            return Ok(());
        }

        envelope.scheduled_time = None;
        envelope.status = EnvelopeStatus::Incoming;
        self.dispatch_buffered(envelope).await
    }

    /// Promote due durable rows and execute them. Returns how many this node
    /// claimed.
    pub(crate) async fn promote_due_scheduled(self: &Arc<Self>) -> Result<usize> {
        let now = self.clock.now();
        let due = self
            .store
            .load_due_scheduled(now, self.settings.scheduled_batch_size)
            .await?;
        if due.is_empty() {
            return Ok(0);
        }

        let promoted = self
            .store
            .promote_scheduled(&due, self.node_number, now)
            .await?;
        let claimed = promoted.len();
        for envelope in promoted {
            self.scheduler.cancel(envelope.id);
            self.dispatch_owned(envelope).await?;
        }
        if claimed > 0 {
            info!(count = claimed, "Promoted scheduled envelopes");
        }
        Ok(claimed)
    }
}

/// In-memory timer loop.
pub(crate) async fn run_timer(context: Arc<RuntimeContext>, mut shutdown: watch::Receiver<bool>) {
    loop {
        let now = context.clock.now();
        let wait = context
            .scheduler
            .next_due()
            .map(|at| (at - now).to_std().unwrap_or(Duration::ZERO))
            .unwrap_or(MAX_TIMER_SLEEP)
            .min(MAX_TIMER_SLEEP);

        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = context.scheduler.changed.notified() => continue,
            _ = tokio::time::sleep(wait) => {
                context.play_scheduled(context.clock.now()).await;
            }
        }
    }
    debug!("Scheduled timer stopped");
}
