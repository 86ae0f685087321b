// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Courier Core - Transactional Message Delivery Engine
//!
//! This crate provides the delivery-guarantee engine behind courier: durable
//! inbox and outbox storage, transactional send, retries and dead letters,
//! scheduled delivery, backpressure and crash recovery across a cluster of
//! nodes sharing one database.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Application code                                │
//! │            (MessageBus, Outbox, handlers, DeadLetters)                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//!          │ send / schedule                             ▲ execute
//!          ▼                                             │
//! ┌──────────────────────┐   route    ┌─────────────────────────────────────┐
//! │    MessageRouter     │──────────▶ │  ListenerController (local queues   │
//! │  rules, conventions  │            │  and transport listeners) + workers │
//! └──────────────────────┘            └─────────────────────────────────────┘
//!          │ remote                                      ▲ receive
//!          ▼                                             │
//! ┌──────────────────────┐            ┌─────────────────────────────────────┐
//! │    SendingAgents     │──────────▶ │          Transport (scheme)         │
//! │ one per destination  │   send     │        Listener / Sender            │
//! └──────────────────────┘            └─────────────────────────────────────┘
//!          │
//!          ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │   MessageStore (SQLite / PostgreSQL): incoming, outgoing, dead letters, │
//! │   nodes, leadership lease, agent assignments, control queue             │
//! └─────────────────────────────────────────────────────────────────────────┘
//!          ▲
//!          │ heartbeat, recovery, scheduled poll
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         DurabilityAgent                                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Delivery modes
//!
//! | Mode | Persisted | Survives crash | Send errors surface to caller |
//! |------|-----------|----------------|-------------------------------|
//! | `Durable` | inbox / outbox rows | yes | no, retried by agents |
//! | `BufferedInMemory` | no | no | no |
//! | `Inline` | no | no | yes |
//!
//! # Envelope ownership
//!
//! Every persisted envelope carries an `owner_id`: the node number of the
//! node processing it, or `0` when any node may claim it. Claims are
//! conditional updates, so two nodes never process the same row. Shutdown
//! releases everything a node owns; a crashed node's rows are released when
//! the leader evicts it after its heartbeat goes stale.
//!
//! # Modules
//!
//! - [`runtime`]: builder and lifecycle of an embedded node
//! - [`bus`]: sending, scheduling, the caller-owned outbox and handler context
//! - [`handlers`]: message contract and handler registry
//! - [`routing`]: route resolution and per-endpoint options
//! - [`listener`]: queues, backpressure and listener status
//! - [`policy`] / [`circuit_breaker`]: failure handling
//! - [`sending`]: per-destination sending agents with latching
//! - [`scheduled`]: in-memory and durable scheduled delivery
//! - [`durability`]: heartbeat, leadership, recovery and singleton agents
//! - [`dead_letters`]: dead-letter administration
//! - [`persistence`]: the [`MessageStore`] contract and its backends
//! - [`testing`]: manual clock and in-process transport

pub mod bus;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod dead_letters;
pub mod durability;
pub mod envelope;
pub mod error;
mod executor;
pub mod handlers;
pub mod listener;
pub mod migrations;
pub mod persistence;
pub mod policy;
pub mod routing;
pub mod runtime;
pub mod scheduled;
pub mod sending;
pub mod testing;
pub mod transport;
pub mod uri;

pub use bus::{DeliveryOptions, MessageBus, MessageContext, Outbox};
pub use clock::{Clock, SystemClock};
pub use config::{Config, DurabilityMode, DurabilitySettings};
pub use dead_letters::{DeadLetterSelection, DeadLetters};
pub use envelope::{DeliveryMode, Envelope, EnvelopeStatus, MessageIdentity};
pub use error::{CoreError, Result};
pub use handlers::{HandlerError, HandlerResult, Message, MessageHandler};
pub use persistence::{MessageStore, PostgresStore, SqliteStore};
pub use policy::{Continuation, FailurePolicies, FailureRule};
pub use routing::{EndpointOptions, RouteMatch};
pub use runtime::{CourierRuntime, CourierRuntimeBuilder, CourierRuntimeConfig};
pub use transport::{Listener, Receiver, SendError, Sender, Transport, TransportMessage};
pub use uri::Uri;
