// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Handler execution and envelope dispatch.
//!
//! Workers take envelopes from a [`ListenerController`], run the handler and
//! apply the failure policy's continuation. A successful durable envelope is
//! marked handled in the same transaction that persists the messages its
//! handler sent.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::bus::MessageContext;
use crate::clock::to_chrono;
use crate::envelope::{DeliveryMode, Envelope, EnvelopeStatus};
use crate::error::{CoreError, Result};
use crate::handlers::HandlerError;
use crate::listener::ListenerController;
use crate::persistence::ErrorReport;
use crate::policy::Continuation;
use crate::runtime::RuntimeContext;

/// Exception type recorded when no handler exists.
const NO_HANDLER: &str = "NoHandler";

impl RuntimeContext {
    /// Whether `envelope` belongs to a durable endpoint.
    pub(crate) fn is_durable(&self, envelope: &Envelope) -> bool {
        envelope.execution_address().is_some_and(|uri| {
            self.queues
                .get(uri)
                .map(|queue| queue.is_durable())
                .unwrap_or_else(|| self.router.endpoint(uri).is_durable())
        })
    }

    /// Local queue that executes `envelope` on this node.
    fn queue_for(&self, envelope: &Envelope) -> Option<Arc<ListenerController>> {
        let conventional = || {
            self.router
                .conventional_queue(&envelope.message_type)
                .and_then(|uri| self.queues.get(&uri).cloned())
        };

        if let Some(received_at) = &envelope.received_at {
            return self.queues.get(received_at).cloned().or_else(conventional);
        }
        match &envelope.destination {
            Some(destination) if destination.is_local() => {
                self.queues.get(destination).cloned().or_else(conventional)
            }
            Some(_) => None,
            None => conventional(),
        }
    }

    /// Execute or forward an `Incoming` envelope this node owns.
    pub(crate) async fn dispatch_owned(self: &Arc<Self>, envelope: Envelope) -> Result<()> {
        if let Some(queue) = self.queue_for(&envelope) {
            queue.enqueue(envelope).await;
            return Ok(());
        }

        if let Some(destination) = envelope.destination.clone()
            && !destination.is_local()
            && self.senders.can_send_to(&destination)
        {
            if self
                .store
                .move_incoming_to_outgoing(&envelope, self.node_number)
                .await?
            {
                let mut outgoing = envelope;
                outgoing.status = EnvelopeStatus::Outgoing;
                outgoing.owner_id = self.node_number;
                outgoing.scheduled_time = None;
                self.senders.enqueue(outgoing)?;
            }
            return Ok(());
        }

        let explanation = format!(
            "No queue on this node executes '{}'",
            envelope.message_type
        );
        self.dead_letter(envelope, NO_HANDLER, &explanation, &explanation)
            .await
    }

    /// Execute or forward an envelope that is not persisted.
    pub(crate) async fn dispatch_buffered(self: &Arc<Self>, mut envelope: Envelope) -> Result<()> {
        if let Some(queue) = self.queue_for(&envelope) {
            queue.enqueue(envelope).await;
            return Ok(());
        }

        if envelope
            .destination
            .as_ref()
            .is_some_and(|destination| !destination.is_local())
        {
            envelope.status = EnvelopeStatus::Outgoing;
            return self.senders.enqueue(envelope);
        }

        let explanation = format!(
            "No queue on this node executes '{}'",
            envelope.message_type
        );
        self.dead_letter(envelope, NO_HANDLER, &explanation, &explanation)
            .await
    }

    /// Move an envelope to dead-letter storage.
    pub(crate) async fn dead_letter(
        &self,
        envelope: Envelope,
        exception_type: &str,
        exception_message: &str,
        explanation: &str,
    ) -> Result<()> {
        let now = self.clock.now();
        let expires_at = self
            .settings
            .dead_letter_retention
            .map(|retention| now + to_chrono(retention));
        error!(
            envelope_id = %envelope.id,
            message_type = %envelope.message_type,
            attempts = envelope.attempts,
            exception_type = %exception_type,
            "Moving envelope to dead letters"
        );
        let report = ErrorReport::new(envelope, exception_type, exception_message, explanation);
        self.store
            .move_to_dead_letter_storage(&[report], &self.service_name, now, expires_at)
            .await
    }

    /// Run the handler for an envelope taken from `queue`.
    pub(crate) async fn execute(
        self: &Arc<Self>,
        queue: &Arc<ListenerController>,
        mut envelope: Envelope,
    ) {
        let outcome = match self.execute_with_policy(queue, &mut envelope).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(
                    envelope_id = %envelope.id,
                    listener = %queue.uri(),
                    error = %e,
                    "Failed to record envelope outcome"
                );
                Some(false)
            }
        };
        queue.complete(outcome).await;
    }

    /// Returns the outcome to report to the circuit breaker.
    async fn execute_with_policy(
        self: &Arc<Self>,
        queue: &Arc<ListenerController>,
        envelope: &mut Envelope,
    ) -> Result<Option<bool>> {
        let durable = self.is_durable(envelope);

        if envelope.is_expired(self.clock.now()) {
            info!(envelope_id = %envelope.id, "Discarding expired envelope");
            if durable {
                self.store
                    .delete_incoming_envelopes(std::slice::from_ref(envelope))
                    .await?;
            }
            return Ok(None);
        }

        let Some(handler) = self.handlers.get(&envelope.message_type) else {
            let explanation = format!("No handler for '{}'", envelope.message_type);
            self.dead_letter(envelope.clone(), NO_HANDLER, &explanation, &explanation)
                .await?;
            return Ok(None);
        };

        loop {
            let context = MessageContext::new(Arc::clone(self), envelope);
            let error = match handler.handle(envelope, &context).await {
                Ok(()) => {
                    self.complete_success(envelope, durable, &context).await?;
                    return Ok(Some(true));
                }
                Err(error) => error,
            };

            let continuation = self.policies.determine(envelope, &error);
            debug!(
                envelope_id = %envelope.id,
                attempts = envelope.attempts,
                error = %error,
                continuation = ?continuation,
                "Handler failed"
            );

            match continuation {
                Continuation::RetryNow => {
                    self.record_attempt(envelope, durable).await?;
                    continue;
                }
                Continuation::ScheduleRetry(delay) => {
                    envelope.attempts += 1;
                    let at = self.clock.now() + to_chrono(delay);
                    if durable {
                        self.store.schedule_incoming(envelope, at).await?;
                    }
                    let mut deferred = envelope.clone();
                    deferred.status = EnvelopeStatus::Scheduled;
                    deferred.scheduled_time = Some(at);
                    deferred.owner_id = 0;
                    self.scheduler.enqueue(deferred);
                }
                Continuation::Requeue => {
                    self.record_attempt(envelope, durable).await?;
                    queue.requeue(envelope.clone());
                }
                Continuation::PauseListener(duration) => {
                    self.record_attempt(envelope, durable).await?;
                    queue.requeue(envelope.clone());
                    queue.pause_for(duration).await;
                }
                Continuation::MoveToDeadLetter => {
                    self.dead_letter(
                        envelope.clone(),
                        &error.kind,
                        &error.message,
                        &format!("Failed after {} attempt(s)", envelope.attempts + 1),
                    )
                    .await?;
                }
                Continuation::Discard => {
                    warn!(envelope_id = %envelope.id, error = %error, "Discarding failed envelope");
                    if durable {
                        self.store
                            .delete_incoming_envelopes(std::slice::from_ref(envelope))
                            .await?;
                    }
                }
            }
            return Ok(Some(false));
        }
    }

    async fn record_attempt(&self, envelope: &mut Envelope, durable: bool) -> Result<()> {
        envelope.attempts += 1;
        if durable {
            self.store.increment_incoming_attempts(envelope).await?;
        }
        Ok(())
    }

    async fn complete_success(
        self: &Arc<Self>,
        envelope: &Envelope,
        durable: bool,
        context: &MessageContext,
    ) -> Result<()> {
        let staged = context.take_staged();
        if durable {
            let cascades: Vec<Envelope> = staged
                .iter()
                .filter(|item| item.mode == DeliveryMode::Durable)
                .map(|item| item.envelope.clone())
                .collect();
            let keep_until = (!self.settings.keep_handled_for.is_zero())
                .then(|| self.clock.now() + to_chrono(self.settings.keep_handled_for));
            self.store
                .mark_incoming_handled(envelope, keep_until, &cascades)
                .await?;
        } else {
            self.persist_prepared(&staged).await?;
        }
        self.deliver_prepared(staged).await
    }

    /// Execute the handler once in the caller's task.
    pub(crate) async fn invoke_envelope(self: &Arc<Self>, envelope: Envelope) -> Result<()> {
        let handler = self
            .handlers
            .get(&envelope.message_type)
            .ok_or_else(|| CoreError::NoHandler {
                message_type: envelope.message_type.clone(),
            })?;

        let context = MessageContext::new(Arc::clone(self), &envelope);
        handler
            .handle(&envelope, &context)
            .await
            .map_err(|source: HandlerError| CoreError::HandlerFailed {
                message_type: envelope.message_type.clone(),
                source,
            })?;

        let staged = context.take_staged();
        self.persist_prepared(&staged).await?;
        self.deliver_prepared(staged).await
    }
}

/// Worker loop for one queue.
pub(crate) async fn run_worker(context: Arc<RuntimeContext>, queue: Arc<ListenerController>) {
    while let Some(envelope) = queue.next().await {
        context.execute(&queue, envelope).await;
    }
    debug!(listener = %queue.uri(), "Worker stopped");
}
