// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Listener control: in-process queues, backpressure and circuit breaking.
//!
//! Every local queue and every transport listener gets a
//! [`ListenerController`]. The controller owns the queue of envelopes
//! waiting for a handler and the listener's [`ListeningStatus`]:
//!
//! - queue depth reaching the buffering maximum moves an active listener to
//!   `TooBusy` and pauses the transport; draining to the restart mark
//!   resumes it
//! - a tripped circuit breaker pauses the listener for the breaker's pause
//!   time, then half-opens and resumes
//! - stopping lets workers drain what is queued and then ends them

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Notify, broadcast, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::circuit_breaker::CircuitBreaker;
use crate::clock::{Clock, to_chrono};
use crate::envelope::{Envelope, EnvelopeStatus};
use crate::error::Result;
use crate::persistence::{ErrorReport, MessageStore};
use crate::routing::EndpointOptions;
use crate::scheduled::InMemoryScheduledJobs;
use crate::transport::{Listener, Receiver, TransportMessage};
use crate::uri::Uri;

/// Listener state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListeningStatus {
    /// Accepting and executing messages.
    Active,
    /// Queue depth reached the buffering maximum.
    TooBusy,
    /// Paused by the circuit breaker or a failure rule.
    Paused,
    /// Stopped for shutdown.
    Stopped,
}

/// Status transition published to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerStatusChange {
    /// Listener address.
    pub uri: Uri,
    /// Status before the transition.
    pub previous: ListeningStatus,
    /// Status after the transition.
    pub current: ListeningStatus,
    /// When it happened.
    pub at: DateTime<Utc>,
}

/// Queue and status of one listener.
pub struct ListenerController {
    uri: Uri,
    options: EndpointOptions,
    listener: Option<Arc<dyn Listener>>,
    queue: Mutex<VecDeque<Envelope>>,
    available: Notify,
    status: watch::Sender<ListeningStatus>,
    events: broadcast::Sender<ListenerStatusChange>,
    breaker: Option<Mutex<CircuitBreaker>>,
    in_flight: AtomicUsize,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for ListenerController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerController")
            .field("uri", &self.uri)
            .field("status", &*self.status.borrow())
            .field("depth", &self.depth())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ListenerController {
    /// Controller for `uri`. `listener` is `None` for local queues.
    pub fn new(
        uri: Uri,
        options: EndpointOptions,
        listener: Option<Arc<dyn Listener>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (status, _) = watch::channel(ListeningStatus::Active);
        let (events, _) = broadcast::channel(64);
        let breaker = options
            .circuit_breaker
            .clone()
            .map(|breaker| Mutex::new(CircuitBreaker::new(breaker)));
        Self {
            uri,
            options,
            listener,
            queue: Mutex::new(VecDeque::new()),
            available: Notify::new(),
            status,
            events,
            breaker,
            in_flight: AtomicUsize::new(0),
            clock,
        }
    }

    /// Listener address.
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// Endpoint options.
    pub fn options(&self) -> &EndpointOptions {
        &self.options
    }

    /// Whether received envelopes are persisted.
    pub fn is_durable(&self) -> bool {
        self.options.is_durable()
    }

    /// Current status.
    pub fn status(&self) -> ListeningStatus {
        *self.status.borrow()
    }

    /// Watch the status.
    pub fn watch_status(&self) -> watch::Receiver<ListeningStatus> {
        self.status.subscribe()
    }

    /// Subscribe to status transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<ListenerStatusChange> {
        self.events.subscribe()
    }

    /// Envelopes waiting for a worker.
    pub fn depth(&self) -> usize {
        lock(&self.queue).len()
    }

    /// Envelopes currently executing.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Queue an envelope for execution.
    pub async fn enqueue(&self, envelope: Envelope) {
        let depth = {
            let mut queue = lock(&self.queue);
            queue.push_back(envelope);
            queue.len()
        };
        self.available.notify_one();

        if depth >= self.options.buffering.maximum
            && self.transition(&[ListeningStatus::Active], ListeningStatus::TooBusy)
        {
            warn!(
                listener = %self.uri,
                depth = depth,
                maximum = self.options.buffering.maximum,
                "Listener too busy, pausing intake"
            );
            if let Some(listener) = &self.listener {
                listener.pause().await;
            }
        }
    }

    /// Put an envelope back at the tail of the queue.
    pub(crate) fn requeue(&self, envelope: Envelope) {
        lock(&self.queue).push_back(envelope);
        self.available.notify_one();
    }

    /// Wait for the next envelope. Returns `None` once the listener is
    /// stopped and its queue is drained.
    pub async fn next(&self) -> Option<Envelope> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let status = self.status();
            if status != ListeningStatus::Paused {
                if let Some(envelope) = lock(&self.queue).pop_front() {
                    self.in_flight.fetch_add(1, Ordering::SeqCst);
                    return Some(envelope);
                }
                if status == ListeningStatus::Stopped {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Report the outcome of an envelope taken with [`Self::next`].
    ///
    /// `None` means the outcome does not count towards the circuit breaker.
    pub async fn complete(self: &Arc<Self>, success: Option<bool>) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if let (Some(breaker), Some(success)) = (&self.breaker, success) {
            let tripped = lock(breaker).record(success, tokio::time::Instant::now());
            if tripped {
                let pause_time = lock(breaker).options().pause_time;
                self.pause_for(pause_time).await;
                return;
            }
        }

        if self.depth() <= self.options.buffering.restart
            && self.transition(&[ListeningStatus::TooBusy], ListeningStatus::Active)
        {
            info!(listener = %self.uri, depth = self.depth(), "Listener drained, resuming intake");
            if let Some(listener) = &self.listener {
                listener.resume().await;
            }
        }
    }

    /// Pause intake and execution for `duration`, then resume.
    pub async fn pause_for(self: &Arc<Self>, duration: Duration) {
        if !self.transition(
            &[ListeningStatus::Active, ListeningStatus::TooBusy],
            ListeningStatus::Paused,
        ) {
            return;
        }
        warn!(
            listener = %self.uri,
            pause_secs = duration.as_secs(),
            "Pausing listener"
        );
        if let Some(listener) = &self.listener {
            listener.pause().await;
        }

        let controller = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            controller.resume_after_pause().await;
        });
    }

    async fn resume_after_pause(&self) {
        if let Some(breaker) = &self.breaker {
            lock(breaker).half_open();
        }
        let next = if self.depth() >= self.options.buffering.maximum {
            ListeningStatus::TooBusy
        } else {
            ListeningStatus::Active
        };
        if self.transition(&[ListeningStatus::Paused], next) {
            info!(listener = %self.uri, status = ?next, "Listener resumed after pause");
            if next == ListeningStatus::Active
                && let Some(listener) = &self.listener
            {
                listener.resume().await;
            }
        }
    }

    /// Stop intake; workers drain the queue and then finish.
    pub async fn stop(&self) {
        let stopped = self.transition(
            &[
                ListeningStatus::Active,
                ListeningStatus::TooBusy,
                ListeningStatus::Paused,
            ],
            ListeningStatus::Stopped,
        );
        if stopped {
            debug!(listener = %self.uri, "Listener stopped");
            if let Some(listener) = &self.listener {
                listener.stop().await;
            }
        }
    }

    /// Take everything still queued.
    pub(crate) fn drain(&self) -> Vec<Envelope> {
        lock(&self.queue).drain(..).collect()
    }

    fn transition(&self, from: &[ListeningStatus], to: ListeningStatus) -> bool {
        let mut previous = to;
        let changed = self.status.send_if_modified(|status| {
            if from.contains(status) {
                previous = *status;
                *status = to;
                true
            } else {
                false
            }
        });
        if changed {
            let _ = self.events.send(ListenerStatusChange {
                uri: self.uri.clone(),
                previous,
                current: to,
                at: self.clock.now(),
            });
            self.available.notify_waiters();
        }
        changed
    }
}

/// Transport receiver that feeds a [`ListenerController`].
///
/// Durable listeners persist every batch before acknowledging it and only
/// queue envelopes that were not already stored. Messages that cannot be
/// mapped to an envelope go to dead-letter storage; the batch is only
/// acknowledged once they are stored there.
pub(crate) struct ListenerReceiver {
    pub(crate) controller: Arc<ListenerController>,
    pub(crate) store: Arc<dyn MessageStore>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) scheduler: Arc<InMemoryScheduledJobs>,
    pub(crate) owner: i32,
    pub(crate) service_name: String,
    pub(crate) dead_letter_retention: Option<Duration>,
}

/// Exception type recorded for messages that cannot be mapped.
const ENVELOPE_ERROR: &str = "EnvelopeError";

#[async_trait]
impl Receiver for ListenerReceiver {
    async fn received(&self, messages: Vec<TransportMessage>) -> Result<()> {
        let uri = self.controller.uri();
        let now = self.clock.now();

        let mut envelopes = Vec::with_capacity(messages.len());
        let mut rejected = Vec::new();
        for message in messages {
            match Envelope::from_transport(message.clone(), uri) {
                Ok(mut envelope) => {
                    envelope.mark_received(uri, self.owner, now);
                    envelopes.push(envelope);
                }
                Err(e) => {
                    error!(listener = %uri, error = %e, "Dead-lettering malformed message");
                    rejected.push(ErrorReport::new(
                        Envelope::unreadable(message, uri),
                        ENVELOPE_ERROR,
                        e.to_string(),
                        format!("Message received at {} could not be mapped to an envelope", uri),
                    ));
                }
            }
        }

        if !rejected.is_empty() {
            let expires_at = self
                .dead_letter_retention
                .map(|retention| now + to_chrono(retention));
            self.store
                .move_to_dead_letter_storage(&rejected, &self.service_name, now, expires_at)
                .await?;
        }

        if self.controller.is_durable() && !envelopes.is_empty() {
            let inserted: HashSet<Uuid> =
                self.store.store_incoming(&envelopes).await?.into_iter().collect();
            let received = envelopes.len();
            envelopes.retain(|envelope| inserted.contains(&envelope.id));
            if envelopes.len() < received {
                debug!(
                    listener = %uri,
                    duplicates = received - envelopes.len(),
                    "Skipped already received envelopes"
                );
            }
        }

        for envelope in envelopes {
            if envelope.status == EnvelopeStatus::Scheduled {
                self.scheduler.enqueue(envelope);
            } else {
                self.controller.enqueue(envelope).await;
            }
        }
        Ok(())
    }
}
