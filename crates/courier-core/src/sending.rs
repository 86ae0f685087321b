// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Sending agents.
//!
//! One agent per remote destination delivers envelopes in order through the
//! destination's [`Sender`]. After `sender_failures_before_latch`
//! consecutive transient failures the agent latches: durable envelopes are
//! released back to any node and buffered ones are held in memory, and a
//! ping loop probes the destination until it answers again.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::{Clock, to_chrono};
use crate::config::DurabilitySettings;
use crate::envelope::{Envelope, EnvelopeStatus};
use crate::error::{CoreError, Result};
use crate::persistence::{ErrorReport, MessageStore};
use crate::routing::MessageRouter;
use crate::transport::{SendError, SendOutcome, Sender, Transport};
use crate::uri::Uri;

/// Outcome of one envelope sent by an agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendResult {
    /// Envelope id.
    pub envelope_id: Uuid,
    /// Destination.
    pub destination: Uri,
    /// What happened.
    pub outcome: SendOutcome,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Delivery to one destination.
pub(crate) struct SendingAgent {
    destination: Uri,
    sender: Arc<dyn Sender>,
    durable: bool,
    latched: AtomicBool,
    failures: AtomicU32,
    held: Mutex<VecDeque<Envelope>>,
    queue: mpsc::UnboundedSender<Envelope>,
}

impl SendingAgent {
    pub(crate) fn is_latched(&self) -> bool {
        self.latched.load(Ordering::SeqCst)
    }
}

/// Every sending agent of a node.
pub(crate) struct SendingAgents {
    transports: HashMap<String, Arc<dyn Transport>>,
    router: MessageRouter,
    store: Arc<dyn MessageStore>,
    clock: Arc<dyn Clock>,
    settings: DurabilitySettings,
    service_name: String,
    node_number: i32,
    agents: Mutex<HashMap<Uri, Arc<SendingAgent>>>,
    outcomes: broadcast::Sender<SendResult>,
    shutdown: watch::Receiver<bool>,
}

impl SendingAgents {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        transports: HashMap<String, Arc<dyn Transport>>,
        router: MessageRouter,
        store: Arc<dyn MessageStore>,
        clock: Arc<dyn Clock>,
        settings: DurabilitySettings,
        service_name: String,
        node_number: i32,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (outcomes, _) = broadcast::channel(256);
        Self {
            transports,
            router,
            store,
            clock,
            settings,
            service_name,
            node_number,
            agents: Mutex::new(HashMap::new()),
            outcomes,
            shutdown,
        }
    }

    /// Whether a transport serves `uri`.
    pub(crate) fn can_send_to(&self, uri: &Uri) -> bool {
        self.transports.contains_key(uri.scheme())
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<SendResult> {
        self.outcomes.subscribe()
    }

    /// Whether the agent for `uri` exists and is latched.
    pub(crate) fn is_latched(&self, uri: &Uri) -> bool {
        lock(&self.agents)
            .get(uri)
            .is_some_and(|agent| agent.is_latched())
    }

    fn agent_for(self: &Arc<Self>, uri: &Uri) -> Result<Arc<SendingAgent>> {
        if let Some(agent) = lock(&self.agents).get(uri) {
            return Ok(Arc::clone(agent));
        }

        let transport = self
            .transports
            .get(uri.scheme())
            .ok_or_else(|| CoreError::UnknownEndpoint {
                uri: uri.to_string(),
            })?;
        let sender = transport.build_sender(uri)?;

        let mut agents = lock(&self.agents);
        if let Some(agent) = agents.get(uri) {
            return Ok(Arc::clone(agent));
        }
        let (queue, receiver) = mpsc::unbounded_channel();
        let agent = Arc::new(SendingAgent {
            destination: uri.clone(),
            sender,
            durable: self.router.endpoint(uri).is_durable(),
            latched: AtomicBool::new(false),
            failures: AtomicU32::new(0),
            held: Mutex::new(VecDeque::new()),
            queue,
        });
        agents.insert(uri.clone(), Arc::clone(&agent));
        drop(agents);

        debug!(destination = %uri, durable = agent.durable, "Started sending agent");
        tokio::spawn(Arc::clone(self).run_agent(Arc::clone(&agent), receiver));
        Ok(agent)
    }

    /// Queue an envelope for its destination's agent.
    pub(crate) fn enqueue(self: &Arc<Self>, envelope: Envelope) -> Result<()> {
        let destination = envelope
            .destination
            .clone()
            .ok_or_else(|| CoreError::ValidationError {
                field: "destination".to_string(),
                message: format!("outgoing envelope {} has no destination", envelope.id),
            })?;
        let agent = self.agent_for(&destination)?;
        agent.queue.send(envelope).map_err(|_| CoreError::ShuttingDown)
    }

    /// Send synchronously, surfacing the transport error to the caller.
    pub(crate) async fn send_inline(self: &Arc<Self>, envelope: &Envelope) -> Result<()> {
        let destination = envelope
            .destination
            .clone()
            .ok_or_else(|| CoreError::ValidationError {
                field: "destination".to_string(),
                message: format!("outgoing envelope {} has no destination", envelope.id),
            })?;
        let agent = self.agent_for(&destination)?;
        if agent.is_latched() {
            return Err(CoreError::Send {
                destination: destination.to_string(),
                source: SendError::SenderLatched,
            });
        }
        agent
            .sender
            .send(envelope.to_transport())
            .await
            .map_err(|source| CoreError::Send {
                destination: destination.to_string(),
                source,
            })
    }

    async fn run_agent(
        self: Arc<Self>,
        agent: Arc<SendingAgent>,
        mut receiver: mpsc::UnboundedReceiver<Envelope>,
    ) {
        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                next = receiver.recv() => match next {
                    Some(envelope) => {
                        if let Err(e) = self.deliver(&agent, envelope).await {
                            error!(destination = %agent.destination, error = %e, "Sending agent failed to record outcome");
                        }
                    }
                    None => break,
                },
            }
        }
        debug!(destination = %agent.destination, "Sending agent stopped");
    }

    async fn deliver(self: &Arc<Self>, agent: &Arc<SendingAgent>, mut envelope: Envelope) -> Result<()> {
        if agent.is_latched() {
            self.hold(agent, envelope).await?;
            return Ok(());
        }

        let now = self.clock.now();
        if envelope.is_expired(now) {
            if agent.durable {
                self.store.delete_outgoing(std::slice::from_ref(&envelope)).await?;
            }
            info!(envelope_id = %envelope.id, destination = %agent.destination, "Discarded expired envelope");
            self.report(&envelope, agent, SendOutcome::Expired);
            return Ok(());
        }

        match agent.sender.send(envelope.to_transport()).await {
            Ok(()) => {
                agent.failures.store(0, Ordering::SeqCst);
                if agent.durable {
                    self.store.delete_outgoing(std::slice::from_ref(&envelope)).await?;
                }
                self.report(&envelope, agent, SendOutcome::Succeeded);
            }
            Err(err) if err.is_permanent() => {
                self.dead_letter(&envelope, &err).await?;
                self.report(&envelope, agent, SendOutcome::DeadLettered(err));
            }
            Err(err) => {
                envelope.attempts += 1;
                let failures = agent.failures.fetch_add(1, Ordering::SeqCst) + 1;

                if envelope.attempts >= self.settings.max_attempts {
                    self.dead_letter(&envelope, &err).await?;
                    self.report(&envelope, agent, SendOutcome::DeadLettered(err));
                } else if failures >= self.settings.sender_failures_before_latch {
                    if agent.durable {
                        self.store.increment_outgoing_attempts(&envelope).await?;
                    }
                    self.report(&envelope, agent, SendOutcome::Failed(err));
                    self.latch(agent).await?;
                    self.hold(agent, envelope).await?;
                } else {
                    if agent.durable {
                        self.store.increment_outgoing_attempts(&envelope).await?;
                    }
                    debug!(
                        envelope_id = %envelope.id,
                        destination = %agent.destination,
                        attempts = envelope.attempts,
                        error = %err,
                        "Send failed, retrying"
                    );
                    self.report(&envelope, agent, SendOutcome::Failed(err));
                    agent.queue.send(envelope).map_err(|_| CoreError::ShuttingDown)?;
                }
            }
        }
        Ok(())
    }

    /// Park an envelope while the agent is latched. Durable rows go back to
    /// any node; the recovery agent claims them once the agent unlatches.
    async fn hold(&self, agent: &SendingAgent, envelope: Envelope) -> Result<()> {
        if agent.durable {
            self.store
                .release_outgoing(self.node_number, Some(&agent.destination))
                .await?;
        } else {
            lock(&agent.held).push_back(envelope);
        }
        Ok(())
    }

    async fn latch(self: &Arc<Self>, agent: &Arc<SendingAgent>) -> Result<()> {
        if agent.latched.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        warn!(
            destination = %agent.destination,
            failures = agent.failures.load(Ordering::SeqCst),
            "Sending agent latched"
        );
        if agent.durable {
            let released = self
                .store
                .release_outgoing(self.node_number, Some(&agent.destination))
                .await?;
            debug!(destination = %agent.destination, released = released, "Released outgoing envelopes");
        }
        tokio::spawn(Arc::clone(self).ping_until_reachable(Arc::clone(agent)));
        Ok(())
    }

    async fn ping_until_reachable(self: Arc<Self>, agent: Arc<SendingAgent>) {
        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => return,
                _ = tokio::time::sleep(self.settings.sender_ping_interval) => {
                    if agent.sender.ping().await {
                        break;
                    }
                }
            }
        }

        agent.failures.store(0, Ordering::SeqCst);
        agent.latched.store(false, Ordering::SeqCst);
        let held: Vec<Envelope> = lock(&agent.held).drain(..).collect();
        info!(destination = %agent.destination, held = held.len(), "Sending agent unlatched");
        for envelope in held {
            if agent.queue.send(envelope).is_err() {
                break;
            }
        }
    }

    async fn dead_letter(&self, envelope: &Envelope, err: &SendError) -> Result<()> {
        let now = self.clock.now();
        let mut dead = envelope.clone();
        dead.status = EnvelopeStatus::DeadLetter;
        let report = ErrorReport::new(
            dead,
            exception_type(err),
            err.to_string(),
            format!("Sending to {} failed", envelope.destination.as_ref().map(Uri::as_str).unwrap_or("?")),
        );
        let expires_at = self
            .settings
            .dead_letter_retention
            .map(|retention| now + to_chrono(retention));
        self.store
            .move_to_dead_letter_storage(&[report], &self.service_name, now, expires_at)
            .await?;
        error!(
            envelope_id = %envelope.id,
            attempts = envelope.attempts,
            error = %err,
            "Moved outgoing envelope to dead letters"
        );
        Ok(())
    }

    fn report(&self, envelope: &Envelope, agent: &SendingAgent, outcome: SendOutcome) {
        let _ = self.outcomes.send(SendResult {
            envelope_id: envelope.id,
            destination: agent.destination.clone(),
            outcome,
        });
    }

    /// Every buffered envelope held by latched agents.
    pub(crate) fn take_held(&self) -> Vec<Envelope> {
        lock(&self.agents)
            .values()
            .flat_map(|agent| lock(&agent.held).drain(..).collect::<Vec<_>>())
            .collect()
    }
}

fn exception_type(err: &SendError) -> &'static str {
    match err {
        SendError::TimedOut => "TimedOut",
        SendError::SerializationFailed(_) => "SerializationFailed",
        SendError::DestinationDoesNotExist => "DestinationDoesNotExist",
        SendError::ProcessingFailed(_) => "ProcessingFailed",
        SendError::SenderLatched => "SenderLatched",
    }
}
