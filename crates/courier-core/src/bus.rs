// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Messaging API: the bus, the transactional outbox and the handler context.
//!
//! Sending first resolves routes and builds one envelope per destination.
//! Envelopes for durable endpoints are persisted before anything leaves the
//! process; the rest are handed straight to local queues or sending agents.
//!
//! [`Outbox`] lets callers write envelopes inside their own database
//! transaction with [`Outbox::enlist`] and hand them to transports only
//! after commit with [`Outbox::flush`]. Messages sent from a handler through
//! [`MessageContext`] are committed together with the envelope's completion.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error};
use uuid::Uuid;

use crate::clock::to_chrono;
use crate::envelope::{DeliveryMode, Envelope, EnvelopeStatus};
use crate::error::{CoreError, Result};
use crate::handlers::Message;
use crate::persistence::EnvelopeTransaction;
use crate::routing::Route;
use crate::runtime::RuntimeContext;
use crate::sending::SendResult;
use crate::uri::Uri;

pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Per-send options.
#[derive(Debug, Clone, Default)]
pub struct DeliveryOptions {
    /// Execute after this delay.
    pub delay: Option<Duration>,
    /// Execute at this time. Wins over `delay`.
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Drop the message if not delivered within this window.
    pub deliver_within: Option<Duration>,
    /// Extra headers.
    pub headers: BTreeMap<String, String>,
    /// Tenant id.
    pub tenant_id: Option<String>,
    /// Saga id.
    pub saga_id: Option<String>,
    /// Correlation id. Defaults to the causing message's, or the new id.
    pub correlation_id: Option<String>,
    /// Where replies go.
    pub reply_uri: Option<Uri>,
    /// Bypass routing and send here.
    pub destination: Option<Uri>,
}

impl DeliveryOptions {
    /// Default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Execute after `delay`.
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Execute at `at`.
    pub fn at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    /// Drop if not delivered within `window`.
    pub fn deliver_within(mut self, window: Duration) -> Self {
        self.deliver_within = Some(window);
        self
    }

    /// Add a header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Set the tenant.
    pub fn tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    /// Set the saga.
    pub fn saga(mut self, saga_id: impl Into<String>) -> Self {
        self.saga_id = Some(saga_id.into());
        self
    }

    /// Set the correlation id.
    pub fn correlated(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Ask for replies at `uri`.
    pub fn reply_to(mut self, uri: Uri) -> Self {
        self.reply_uri = Some(uri);
        self
    }

    /// Send to `uri` regardless of routing rules.
    pub fn to(mut self, uri: Uri) -> Self {
        self.destination = Some(uri);
        self
    }
}

/// An envelope ready for persistence and delivery.
#[derive(Debug, Clone)]
pub(crate) struct Prepared {
    pub(crate) envelope: Envelope,
    pub(crate) mode: DeliveryMode,
}

impl Prepared {
    fn is_durable(&self) -> bool {
        self.mode == DeliveryMode::Durable
    }

    fn is_local(&self) -> bool {
        self.envelope
            .destination
            .as_ref()
            .is_some_and(Uri::is_local)
    }
}

/// Durable envelopes split by target table.
fn durable_parts(prepared: &[Prepared]) -> (Vec<Envelope>, Vec<Envelope>) {
    let mut outgoing = Vec::new();
    let mut incoming = Vec::new();
    for item in prepared.iter().filter(|item| item.is_durable()) {
        if item.envelope.status == EnvelopeStatus::Outgoing {
            outgoing.push(item.envelope.clone());
        } else {
            incoming.push(item.envelope.clone());
        }
    }
    (outgoing, incoming)
}

fn serialize<M: Message>(message: &M) -> Result<Vec<u8>> {
    serde_json::to_vec(message).map_err(|e| CoreError::Serialization {
        message_type: M::MESSAGE_TYPE.to_string(),
        reason: e.to_string(),
    })
}

impl RuntimeContext {
    /// Build one envelope per destination of `message_type`.
    pub(crate) fn prepare(
        &self,
        message_type: &str,
        data: Vec<u8>,
        options: &DeliveryOptions,
        parent: Option<&Envelope>,
    ) -> Result<Vec<Prepared>> {
        let routes = match &options.destination {
            Some(destination) => vec![Route {
                destination: destination.clone(),
                mode: self.endpoint_mode(destination),
            }],
            None => self.router.route(message_type)?,
        };

        let now = self.clock.now();
        let scheduled_time = options
            .scheduled_at
            .or_else(|| options.delay.map(|delay| now + to_chrono(delay)))
            .filter(|at| *at > now);

        let mut prepared = Vec::with_capacity(routes.len());
        for route in routes {
            let destination = route.destination;
            if destination.is_local() {
                if !self.queues.contains_key(&destination) {
                    return Err(CoreError::UnknownEndpoint {
                        uri: destination.to_string(),
                    });
                }
            } else if !self.senders.can_send_to(&destination) {
                return Err(CoreError::UnknownEndpoint {
                    uri: destination.to_string(),
                });
            }

            let mut envelope = Envelope::new(message_type, data.clone());
            envelope.sent_at = now;
            envelope.source = Some(self.service_name.clone());
            envelope.headers = options.headers.clone();
            envelope.deliver_by = options.deliver_within.map(|window| now + to_chrono(window));
            envelope.reply_uri = options.reply_uri.clone();
            envelope.scheduled_time = scheduled_time;

            match parent {
                Some(parent) => {
                    envelope.correlation_id = options
                        .correlation_id
                        .clone()
                        .or_else(|| parent.correlation_id.clone())
                        .or_else(|| Some(parent.id.to_string()));
                    envelope.conversation_id = Some(parent.id);
                    envelope.parent_id = Some(parent.id.to_string());
                    envelope.tenant_id = options.tenant_id.clone().or_else(|| parent.tenant_id.clone());
                    envelope.saga_id = options.saga_id.clone().or_else(|| parent.saga_id.clone());
                }
                None => {
                    envelope.correlation_id = options
                        .correlation_id
                        .clone()
                        .or_else(|| Some(envelope.id.to_string()));
                    envelope.tenant_id = options.tenant_id.clone();
                    envelope.saga_id = options.saga_id.clone();
                }
            }

            if destination.is_local() {
                envelope.received_at = Some(destination.clone());
            }
            if scheduled_time.is_some() {
                envelope.status = EnvelopeStatus::Scheduled;
                envelope.owner_id = 0;
            } else if destination.is_local() {
                envelope.status = EnvelopeStatus::Incoming;
                envelope.owner_id = self.node_number;
            } else {
                envelope.status = EnvelopeStatus::Outgoing;
                envelope.owner_id = self.node_number;
            }
            envelope.destination = Some(destination);

            prepared.push(Prepared {
                envelope,
                mode: route.mode,
            });
        }
        Ok(prepared)
    }

    fn endpoint_mode(&self, uri: &Uri) -> DeliveryMode {
        self.queues
            .get(uri)
            .map(|queue| queue.options().mode)
            .unwrap_or_else(|| self.router.endpoint(uri).mode)
    }

    /// Persist durable envelopes outside any caller transaction.
    pub(crate) async fn persist_prepared(&self, prepared: &[Prepared]) -> Result<()> {
        let (outgoing, incoming) = durable_parts(prepared);
        for chunk in outgoing.chunks(self.settings.outbox_batch_size.max(1)) {
            self.store.store_outgoing(chunk).await?;
        }
        if !incoming.is_empty() {
            self.store.store_incoming(&incoming).await?;
        }
        Ok(())
    }

    /// Hand persisted or buffered envelopes to queues, timers and agents.
    ///
    /// Every envelope is attempted; the first error is returned. Boxed
    /// because inline local delivery re-enters it through
    /// `invoke_envelope`.
    pub(crate) fn deliver_prepared(
        self: &Arc<Self>,
        prepared: Vec<Prepared>,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut first_error = None;
            for item in prepared {
                let local = item.is_local();
                let envelope = item.envelope;
                let id = envelope.id;

                let result = if envelope.status == EnvelopeStatus::Scheduled {
                    self.scheduler.enqueue(envelope);
                    Ok(())
                } else {
                    match (item.mode, local) {
                        (DeliveryMode::Inline, true) => self.invoke_envelope(envelope).await,
                        (DeliveryMode::Inline, false) => self.senders.send_inline(&envelope).await,
                        (_, true) => self.dispatch_buffered(envelope).await,
                        (_, false) => self.senders.enqueue(envelope),
                    }
                };

                if let Err(e) = result {
                    error!(envelope_id = %id, error = %e, "Failed to deliver envelope");
                    first_error.get_or_insert(e);
                }
            }
            match first_error {
                Some(e) => Err(e),
                None => Ok(()),
            }
        })
    }

    fn ensure_accepting(&self) -> Result<()> {
        if self.is_accepting() {
            Ok(())
        } else {
            Err(CoreError::ShuttingDown)
        }
    }
}

/// Entry point for sending messages.
#[derive(Clone)]
pub struct MessageBus {
    context: Arc<RuntimeContext>,
}

impl fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageBus")
            .field("service_name", &self.context.service_name)
            .field("node_number", &self.context.node_number)
            .finish()
    }
}

impl MessageBus {
    pub(crate) fn new(context: Arc<RuntimeContext>) -> Self {
        Self { context }
    }

    /// Route and send a typed message. Returns one envelope per destination.
    pub async fn send<M: Message>(&self, message: &M, options: DeliveryOptions) -> Result<Vec<Envelope>> {
        let data = serialize(message)?;
        self.send_raw(M::MESSAGE_TYPE, data, options).await
    }

    /// Route and send an already serialized message.
    pub async fn send_raw(
        &self,
        message_type: &str,
        data: Vec<u8>,
        options: DeliveryOptions,
    ) -> Result<Vec<Envelope>> {
        self.context.ensure_accepting()?;
        let prepared = self.context.prepare(message_type, data, &options, None)?;
        self.context.persist_prepared(&prepared).await?;
        let envelopes = prepared.iter().map(|item| item.envelope.clone()).collect();
        self.context.deliver_prepared(prepared).await?;
        Ok(envelopes)
    }

    /// Send a typed message for execution at `at`.
    pub async fn schedule<M: Message>(&self, message: &M, at: DateTime<Utc>) -> Result<Vec<Envelope>> {
        self.send(message, DeliveryOptions::new().at(at)).await
    }

    /// Execute the local handler for `message` now, in the caller's task.
    pub async fn invoke<M: Message>(&self, message: &M) -> Result<()> {
        self.context.ensure_accepting()?;
        let mut envelope = Envelope::new(M::MESSAGE_TYPE, serialize(message)?);
        envelope.status = EnvelopeStatus::Incoming;
        envelope.sent_at = self.context.clock.now();
        envelope.source = Some(self.context.service_name.clone());
        envelope.correlation_id = Some(envelope.id.to_string());
        self.context.invoke_envelope(envelope).await
    }

    /// Cancel a scheduled envelope. Returns whether anything was cancelled.
    pub async fn cancel_scheduled(&self, id: Uuid) -> Result<bool> {
        let in_memory = self.context.scheduler.cancel(id);
        let durable = self.context.store.cancel_scheduled(id).await?;
        Ok(in_memory || durable)
    }

    /// Start a transactional outbox.
    pub fn outbox(&self) -> Outbox {
        Outbox {
            context: Arc::clone(&self.context),
            staged: Vec::new(),
            enlisted: false,
        }
    }

    /// Subscribe to sending-agent outcomes.
    pub fn send_results(&self) -> tokio::sync::broadcast::Receiver<SendResult> {
        self.context.senders.subscribe()
    }
}

/// Envelopes staged for one unit of work.
///
/// ```ignore
/// let mut tx = pool.begin().await?;
/// sqlx::query("UPDATE orders SET state = 'placed' WHERE id = ?").bind(id).execute(&mut *tx).await?;
/// let mut outbox = bus.outbox();
/// outbox.send(&OrderPlaced { id }, DeliveryOptions::new())?;
/// outbox.enlist(&mut tx).await?;
/// tx.commit().await?;
/// outbox.flush().await?;
/// ```
pub struct Outbox {
    context: Arc<RuntimeContext>,
    staged: Vec<Prepared>,
    enlisted: bool,
}

impl fmt::Debug for Outbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Outbox")
            .field("staged", &self.staged.len())
            .field("enlisted", &self.enlisted)
            .finish()
    }
}

impl Outbox {
    /// Stage a typed message.
    pub fn send<M: Message>(&mut self, message: &M, options: DeliveryOptions) -> Result<Vec<Envelope>> {
        let data = serialize(message)?;
        self.send_raw(M::MESSAGE_TYPE, data, options)
    }

    /// Stage a serialized message.
    pub fn send_raw(
        &mut self,
        message_type: &str,
        data: Vec<u8>,
        options: DeliveryOptions,
    ) -> Result<Vec<Envelope>> {
        let prepared = self.context.prepare(message_type, data, &options, None)?;
        let envelopes = prepared.iter().map(|item| item.envelope.clone()).collect();
        self.staged.extend(prepared);
        Ok(envelopes)
    }

    /// Staged envelopes.
    pub fn envelopes(&self) -> Vec<&Envelope> {
        self.staged.iter().map(|item| &item.envelope).collect()
    }

    /// Write the durable staged envelopes inside the caller's transaction.
    pub async fn enlist<T>(&mut self, tx: &mut T) -> Result<()>
    where
        T: EnvelopeTransaction + ?Sized,
    {
        let (outgoing, incoming) = durable_parts(&self.staged);
        if !outgoing.is_empty() {
            tx.persist_outgoing(&outgoing).await?;
        }
        if !incoming.is_empty() {
            tx.persist_incoming(self.context.store.identity(), &incoming)
                .await?;
        }
        self.enlisted = true;
        Ok(())
    }

    /// Hand staged envelopes to transports. Call after the caller's
    /// transaction committed; durable envelopes are persisted here when the
    /// outbox was never enlisted.
    pub async fn flush(self) -> Result<()> {
        self.context.ensure_accepting()?;
        if !self.enlisted {
            self.context.persist_prepared(&self.staged).await?;
        }
        debug!(count = self.staged.len(), "Flushing outbox");
        self.context.deliver_prepared(self.staged).await
    }

    /// Drop staged envelopes, e.g. after a rollback.
    pub fn discard(mut self) {
        self.staged.clear();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct ContextInner {
    context: Arc<RuntimeContext>,
    envelope: Envelope,
    staged: Mutex<Vec<Prepared>>,
}

/// Handle given to a handler for the envelope it executes.
///
/// Sends are staged and committed with the envelope's completion; they
/// inherit the correlation id, tenant and saga of the envelope and record it
/// as their conversation and parent.
#[derive(Clone)]
pub struct MessageContext {
    inner: Arc<ContextInner>,
}

impl fmt::Debug for MessageContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageContext")
            .field("envelope_id", &self.inner.envelope.id)
            .field("staged", &lock(&self.inner.staged).len())
            .finish()
    }
}

impl MessageContext {
    pub(crate) fn new(context: Arc<RuntimeContext>, envelope: &Envelope) -> Self {
        let mut envelope = envelope.clone();
        envelope.data = Vec::new();
        Self {
            inner: Arc::new(ContextInner {
                context,
                envelope,
                staged: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Metadata of the envelope being handled. The payload is not kept.
    pub fn envelope(&self) -> &Envelope {
        &self.inner.envelope
    }

    /// Id of the envelope being handled.
    pub fn envelope_id(&self) -> Uuid {
        self.inner.envelope.id
    }

    /// Failed attempts before this one.
    pub fn attempts(&self) -> i32 {
        self.inner.envelope.attempts
    }

    /// Tenant of the envelope being handled.
    pub fn tenant_id(&self) -> Option<&str> {
        self.inner.envelope.tenant_id.as_deref()
    }

    /// Stage a typed cascading message.
    pub fn send<M: Message>(&self, message: &M, options: DeliveryOptions) -> Result<Vec<Envelope>> {
        let data = serialize(message)?;
        self.send_raw(M::MESSAGE_TYPE, data, options)
    }

    /// Stage a serialized cascading message.
    pub fn send_raw(
        &self,
        message_type: &str,
        data: Vec<u8>,
        options: DeliveryOptions,
    ) -> Result<Vec<Envelope>> {
        let prepared =
            self.inner
                .context
                .prepare(message_type, data, &options, Some(&self.inner.envelope))?;
        let envelopes = prepared.iter().map(|item| item.envelope.clone()).collect();
        lock(&self.inner.staged).extend(prepared);
        Ok(envelopes)
    }

    /// Stage a reply to the envelope's reply address.
    pub fn respond<M: Message>(&self, message: &M) -> Result<Vec<Envelope>> {
        let reply_uri = self
            .inner
            .envelope
            .reply_uri
            .clone()
            .ok_or_else(|| CoreError::ValidationError {
                field: "reply_uri".to_string(),
                message: format!("envelope {} has no reply address", self.inner.envelope.id),
            })?;
        self.send(message, DeliveryOptions::new().to(reply_uri))
    }

    pub(crate) fn take_staged(&self) -> Vec<Prepared> {
        std::mem::take(&mut *lock(&self.inner.staged))
    }
}
