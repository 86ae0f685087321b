// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable messaging runtime.
//!
//! [`CourierRuntime`] wires the durable store, transports, handlers and
//! routing together, registers the node and runs the background agents.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use courier_core::persistence::SqliteStore;
//! use courier_core::runtime::CourierRuntime;
//! use courier_core::routing::EndpointOptions;
//! use courier_core::uri::Uri;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(SqliteStore::from_path("data/courier.db").await?);
//!
//!     let runtime = CourierRuntime::builder()
//!         .store(store)
//!         .service_name("billing")
//!         .local_queue("invoices", EndpointOptions::durable())
//!         .handle(|invoice: InvoiceIssued, _ctx| async move {
//!             println!("invoice {}", invoice.number);
//!             Ok(())
//!         })
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     runtime.bus().send(&InvoiceIssued { number: 7 }, Default::default()).await?;
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::bus::MessageBus;
use crate::clock::{Clock, SystemClock};
use crate::config::{Config, DurabilitySettings};
use crate::dead_letters::DeadLetters;
use crate::durability::{DurabilityAgent, LeadershipState, RecoveryReport};
use crate::executor::run_worker;
use crate::handlers::{HandlerRegistry, HandlerResult, Message, MessageHandler};
use crate::listener::{ListenerController, ListenerReceiver, ListenerStatusChange, ListeningStatus};
use crate::persistence::{MessageStore, PersistedCounts};
use crate::policy::{FailurePolicies, FailureRule};
use crate::routing::{EndpointOptions, MessageRouter, RouteMatch};
use crate::scheduled::{InMemoryScheduledJobs, run_timer};
use crate::sending::SendingAgents;
use crate::transport::{Listener, Transport};
use crate::uri::Uri;

/// Shared state of a running node.
pub(crate) struct RuntimeContext {
    pub(crate) store: Arc<dyn MessageStore>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) settings: DurabilitySettings,
    pub(crate) service_name: String,
    pub(crate) node_id: Uuid,
    pub(crate) node_number: i32,
    pub(crate) router: MessageRouter,
    pub(crate) handlers: HandlerRegistry,
    pub(crate) policies: FailurePolicies,
    pub(crate) queues: HashMap<Uri, Arc<ListenerController>>,
    pub(crate) senders: Arc<SendingAgents>,
    pub(crate) scheduler: Arc<InMemoryScheduledJobs>,
    accepting: AtomicBool,
}

impl RuntimeContext {
    pub(crate) fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }
}

/// Builder for creating a [`CourierRuntime`].
pub struct CourierRuntimeBuilder {
    store: Option<Arc<dyn MessageStore>>,
    service_name: String,
    settings: DurabilitySettings,
    clock: Arc<dyn Clock>,
    transports: HashMap<String, Arc<dyn Transport>>,
    handlers: HandlerRegistry,
    router: MessageRouter,
    listeners: Vec<Uri>,
    policies: FailurePolicies,
}

impl std::fmt::Debug for CourierRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CourierRuntimeBuilder")
            .field("store", &self.store.as_ref().map(|_| "..."))
            .field("service_name", &self.service_name)
            .field("transports", &self.transports.keys().collect::<Vec<_>>())
            .field("handlers", &self.handlers)
            .field("listeners", &self.listeners)
            .finish()
    }
}

impl Default for CourierRuntimeBuilder {
    fn default() -> Self {
        Self {
            store: None,
            service_name: "courier".to_string(),
            settings: DurabilitySettings::default(),
            clock: Arc::new(SystemClock),
            transports: HashMap::new(),
            handlers: HandlerRegistry::new(),
            router: MessageRouter::new(),
            listeners: Vec::new(),
            policies: FailurePolicies::default(),
        }
    }
}

impl CourierRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the service name and durability settings from `config`.
    pub fn config(mut self, config: &Config) -> Self {
        self.service_name = config.service_name.clone();
        self.settings = config.durability.clone();
        self
    }

    /// Set the durable store (required).
    pub fn store(mut self, store: Arc<dyn MessageStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Service name recorded on sent envelopes, nodes and dead letters.
    ///
    /// Default: `courier`
    pub fn service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = name.into();
        self
    }

    /// Durability tunables.
    pub fn durability(mut self, settings: DurabilitySettings) -> Self {
        self.settings = settings;
        self
    }

    /// Time source for every durable comparison.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Register a transport for its scheme.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transports
            .insert(transport.scheme().to_string(), transport);
        self
    }

    /// Handle `M` with an async closure.
    pub fn handle<M, F, Fut>(mut self, f: F) -> Self
    where
        M: Message,
        F: Fn(M, crate::bus::MessageContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.handlers.register(f);
        self
    }

    /// Handle an arbitrary message type with a handler object.
    pub fn handler(mut self, message_type: impl Into<String>, handler: Arc<dyn MessageHandler>) -> Self {
        self.handlers.register_raw(message_type, handler);
        self
    }

    /// Route matching message types to `destination`.
    pub fn route(mut self, matcher: RouteMatch, destination: Uri) -> Self {
        self.router.add_rule(matcher, destination);
        self
    }

    /// Route `M` to `destination`.
    pub fn route_message<M: Message>(self, destination: Uri) -> Self {
        self.route(RouteMatch::Exact(M::MESSAGE_TYPE.to_string()), destination)
    }

    /// Declare a named local queue.
    pub fn local_queue(mut self, name: &str, options: EndpointOptions) -> Self {
        self.router.configure_endpoint(Uri::local(name), options);
        self
    }

    /// Configure any endpoint, local or remote.
    pub fn endpoint(mut self, uri: Uri, options: EndpointOptions) -> Self {
        self.router.configure_endpoint(uri, options);
        self
    }

    /// Receive from a transport listener at `uri`.
    pub fn listen(mut self, uri: Uri, options: EndpointOptions) -> Self {
        self.router.configure_endpoint(uri.clone(), options);
        if !self.listeners.contains(&uri) {
            self.listeners.push(uri);
        }
        self
    }

    /// Replace the failure policies.
    pub fn failure_policies(mut self, policies: FailurePolicies) -> Self {
        self.policies = policies;
        self
    }

    /// Add a failure rule for one message type.
    pub fn on_message_failure(mut self, message_type: impl Into<String>, rule: FailureRule) -> Self {
        self.policies = self.policies.on_message(message_type, rule);
        self
    }

    /// Add a failure rule for every message type.
    pub fn on_any_failure(mut self, rule: FailureRule) -> Self {
        self.policies = self.policies.on_any_message(rule);
        self
    }

    /// Drop messages without a route instead of failing the send.
    pub fn discard_missing_routes(mut self, discard: bool) -> Self {
        self.router.set_discard_missing_routes(discard);
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing or a listener has no
    /// transport.
    pub fn build(mut self) -> Result<CourierRuntimeConfig> {
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store is required"))?;

        for uri in &self.listeners {
            if !self.transports.contains_key(uri.scheme()) {
                anyhow::bail!("no transport registered for listener {}", uri);
            }
        }

        for message_type in self.handlers.message_types() {
            self.router.add_handled_type(message_type);
        }
        self.policies.set_max_attempts(self.settings.max_attempts);

        Ok(CourierRuntimeConfig {
            store,
            service_name: self.service_name,
            settings: self.settings,
            clock: self.clock,
            transports: self.transports,
            handlers: self.handlers,
            router: self.router,
            listeners: self.listeners,
            policies: self.policies,
        })
    }
}

/// Configuration for a [`CourierRuntime`].
pub struct CourierRuntimeConfig {
    store: Arc<dyn MessageStore>,
    service_name: String,
    settings: DurabilitySettings,
    clock: Arc<dyn Clock>,
    transports: HashMap<String, Arc<dyn Transport>>,
    handlers: HandlerRegistry,
    router: MessageRouter,
    listeners: Vec<Uri>,
    policies: FailurePolicies,
}

impl std::fmt::Debug for CourierRuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CourierRuntimeConfig")
            .field("store", &"...")
            .field("service_name", &self.service_name)
            .field("settings", &self.settings)
            .field("listeners", &self.listeners)
            .finish()
    }
}

impl CourierRuntimeConfig {
    /// Register the node, start listeners and workers, and spawn the
    /// background agents.
    pub async fn start(self) -> Result<CourierRuntime> {
        let node_id = Uuid::new_v4();
        let node_number = self
            .store
            .register_node(node_id, &self.service_name, self.clock.now())
            .await?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let senders = Arc::new(SendingAgents::new(
            self.transports.clone(),
            self.router.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
            self.settings.clone(),
            self.service_name.clone(),
            node_number,
            shutdown_rx.clone(),
        ));

        let mut queues: HashMap<Uri, Arc<ListenerController>> = HashMap::new();
        let mut local: Vec<Uri> = self
            .router
            .endpoints()
            .filter(|(uri, _)| uri.is_local())
            .map(|(uri, _)| uri.clone())
            .collect();
        local.extend(self.router.conventional_queues());
        for uri in local {
            let options = self.router.endpoint(&uri);
            queues.entry(uri.clone()).or_insert_with(|| {
                Arc::new(ListenerController::new(uri, options, None, Arc::clone(&self.clock)))
            });
        }

        let mut listeners: Vec<(Arc<ListenerController>, Arc<dyn Listener>)> = Vec::new();
        for uri in &self.listeners {
            let transport = self
                .transports
                .get(uri.scheme())
                .ok_or_else(|| anyhow::anyhow!("no transport registered for listener {}", uri))?;
            let listener = transport.build_listener(uri)?;
            let controller = Arc::new(ListenerController::new(
                uri.clone(),
                self.router.endpoint(uri),
                Some(Arc::clone(&listener)),
                Arc::clone(&self.clock),
            ));
            queues.insert(uri.clone(), Arc::clone(&controller));
            listeners.push((controller, listener));
        }

        let scheduler = Arc::new(InMemoryScheduledJobs::new());
        let context = Arc::new(RuntimeContext {
            store: self.store,
            clock: self.clock,
            settings: self.settings,
            service_name: self.service_name,
            node_id,
            node_number,
            router: self.router,
            handlers: self.handlers,
            policies: self.policies,
            queues,
            senders,
            scheduler,
            accepting: AtomicBool::new(true),
        });

        let mut workers = Vec::new();
        for queue in context.queues.values() {
            for _ in 0..queue.options().parallelism.max(1) {
                workers.push(tokio::spawn(run_worker(
                    Arc::clone(&context),
                    Arc::clone(queue),
                )));
            }
        }

        for (controller, listener) in listeners {
            let receiver = Arc::new(ListenerReceiver {
                controller,
                store: Arc::clone(&context.store),
                clock: Arc::clone(&context.clock),
                scheduler: Arc::clone(&context.scheduler),
                owner: node_number,
                service_name: context.service_name.clone(),
                dead_letter_retention: context.settings.dead_letter_retention,
            });
            listener.start(receiver).await?;
        }

        let durability = Arc::new(DurabilityAgent::new(Arc::clone(&context)));
        durability.refresh_assignments().await?;
        if let Err(e) = durability.recover_once().await {
            error!(error = %e, "Initial recovery cycle failed");
        }

        let mut tasks = durability.spawn(shutdown_rx.clone());
        tasks.push(tokio::spawn(run_timer(Arc::clone(&context), shutdown_rx)));

        info!(
            service = %context.service_name,
            node_number = node_number,
            node_id = %node_id,
            queues = context.queues.len(),
            "CourierRuntime started"
        );

        Ok(CourierRuntime {
            context,
            durability,
            shutdown_tx,
            workers,
            tasks,
        })
    }
}

/// A running messaging node embedded in an application.
///
/// The runtime manages:
/// - local queues and transport listeners with their workers
/// - sending agents per remote destination
/// - heartbeat, leadership, recovery and scheduled-job agents
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct CourierRuntime {
    context: Arc<RuntimeContext>,
    durability: Arc<DurabilityAgent>,
    shutdown_tx: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
    tasks: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for CourierRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CourierRuntime")
            .field("service_name", &self.context.service_name)
            .field("node_number", &self.context.node_number)
            .field("node_id", &self.context.node_id)
            .finish()
    }
}

impl CourierRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> CourierRuntimeBuilder {
        CourierRuntimeBuilder::new()
    }

    /// Send and schedule messages.
    pub fn bus(&self) -> MessageBus {
        MessageBus::new(Arc::clone(&self.context))
    }

    /// Administer dead letters.
    pub fn dead_letters(&self) -> DeadLetters {
        DeadLetters::new(Arc::clone(&self.context.store))
    }

    /// The durable store.
    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.context.store
    }

    /// Node id of this runtime.
    pub fn node_id(&self) -> Uuid {
        self.context.node_id
    }

    /// Node number owning this runtime's envelopes.
    pub fn node_number(&self) -> i32 {
        self.context.node_number
    }

    /// Persisted envelope counts by status.
    pub async fn counts(&self) -> crate::error::Result<PersistedCounts> {
        self.context.store.fetch_counts().await
    }

    /// Whether the store answers.
    pub async fn health_check(&self) -> crate::error::Result<bool> {
        self.context.store.health_check().await
    }

    /// Status of the queue or listener at `uri`.
    pub fn listener_status(&self, uri: &Uri) -> Option<ListeningStatus> {
        self.context.queues.get(uri).map(|queue| queue.status())
    }

    /// Subscribe to status changes of the queue or listener at `uri`.
    pub fn subscribe_listener(&self, uri: &Uri) -> Option<broadcast::Receiver<ListenerStatusChange>> {
        self.context.queues.get(uri).map(|queue| queue.subscribe())
    }

    /// Current leadership state.
    pub fn leadership(&self) -> LeadershipState {
        self.durability.leadership.state()
    }

    /// Singleton agents running on this node.
    pub fn agents(&self) -> Vec<String> {
        self.durability.assignments.agents()
    }

    /// Envelopes waiting in the in-memory scheduler.
    pub fn scheduled_count(&self) -> usize {
        self.context.scheduler.count()
    }

    /// Fire in-memory scheduled envelopes due at or before `cutoff`.
    pub async fn play_scheduled(&self, cutoff: DateTime<Utc>) -> usize {
        self.context.play_scheduled(cutoff).await
    }

    /// Run one recovery cycle now.
    pub async fn recover_now(&self) -> crate::error::Result<RecoveryReport> {
        self.durability.recover_once().await
    }

    /// Heartbeat and drain the control queue now.
    pub async fn heartbeat_now(&self) -> crate::error::Result<()> {
        self.durability.health_check_once().await
    }

    /// Gracefully shut down the runtime.
    ///
    /// Stops intake, lets workers drain for up to the shutdown timeout, then
    /// releases every envelope, the leadership lease and agent assignments
    /// and deletes the node row.
    pub async fn shutdown(mut self) -> Result<()> {
        info!(node_number = self.context.node_number, "CourierRuntime shutting down...");
        self.context.accepting.store(false, Ordering::SeqCst);

        for queue in self.context.queues.values() {
            queue.stop().await;
        }

        let timeout = self.context.settings.shutdown_timeout;
        let drained = tokio::time::timeout(timeout, async {
            for worker in self.workers.iter_mut() {
                let _ = worker.await;
            }
        })
        .await;
        if drained.is_err() {
            warn!(timeout_secs = timeout.as_secs(), "Workers did not drain in time");
            for worker in &self.workers {
                worker.abort();
            }
        }

        let _ = self.shutdown_tx.send(true);
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await
                && e.is_panic()
            {
                error!("CourierRuntime task panicked: {}", e);
            }
        }

        let abandoned: usize = self
            .context
            .queues
            .values()
            .map(|queue| queue.drain().len())
            .sum::<usize>()
            + self.context.scheduler.play_all().len()
            + self.context.senders.take_held().len();
        if abandoned > 0 {
            warn!(count = abandoned, "Dropped buffered envelopes at shutdown");
        }

        self.durability.release().await?;
        info!("CourierRuntime shutdown complete");
        Ok(())
    }

    /// Stop every task without touching the store, as if the process died.
    ///
    /// Envelopes owned by this node stay owned until a leader evicts it.
    pub fn abort(self) {
        warn!(node_number = self.context.node_number, "CourierRuntime aborted");
        self.context.accepting.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(true);
        for handle in self.workers.iter().chain(self.tasks.iter()) {
            handle.abort();
        }
    }

    /// Check if the background agents are still running.
    pub fn is_running(&self) -> bool {
        self.tasks.iter().all(|task| !task.is_finished())
    }
}
