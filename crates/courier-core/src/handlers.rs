// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Message handlers and the registry that dispatches to them.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::bus::MessageContext;
use crate::envelope::Envelope;

/// Failure kind reported when a payload cannot be deserialized.
pub const DESERIALIZATION_KIND: &str = "Deserialization";

/// A typed message with a stable wire name.
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Message type name used for routing and handler lookup.
    const MESSAGE_TYPE: &'static str;
}

/// Failure raised by a handler.
///
/// `kind` is what failure rules match on and what dead-letter rows record
/// as their exception type.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct HandlerError {
    /// Failure classification.
    pub kind: String,
    /// Human-readable message.
    pub message: String,
}

impl HandlerError {
    /// Create an error with an explicit kind.
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Wrap a typed error; the kind is the error's type name.
    pub fn from_error<E: std::error::Error + 'static>(err: &E) -> Self {
        Self::new(std::any::type_name::<E>(), err.to_string())
    }

    /// The payload could not be read.
    pub fn deserialization(reason: impl fmt::Display) -> Self {
        Self::new(DESERIALIZATION_KIND, reason.to_string())
    }

    /// Whether this is a deserialization failure.
    pub fn is_deserialization(&self) -> bool {
        self.kind == DESERIALIZATION_KIND
    }
}

/// Result returned by handlers.
pub type HandlerResult = std::result::Result<(), HandlerError>;

/// Executes one message type.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle one envelope. Messages sent through `context` are committed
    /// together with the envelope's completion.
    async fn handle(&self, envelope: &Envelope, context: &MessageContext) -> HandlerResult;
}

/// Adapter from a typed async closure to [`MessageHandler`].
struct FnHandler<M, F> {
    f: F,
    _message: PhantomData<fn(M)>,
}

#[async_trait]
impl<M, F, Fut> MessageHandler for FnHandler<M, F>
where
    M: Message,
    F: Fn(M, MessageContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, envelope: &Envelope, context: &MessageContext) -> HandlerResult {
        let message: M =
            serde_json::from_slice(&envelope.data).map_err(HandlerError::deserialization)?;
        (self.f)(message, context.clone()).await
    }
}

/// Handlers keyed by message type.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn MessageHandler>>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<&String> = self.handlers.keys().collect();
        types.sort();
        f.debug_struct("HandlerRegistry")
            .field("message_types", &types)
            .finish()
    }
}

impl HandlerRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed async closure for `M`. Replaces any earlier handler.
    pub fn register<M, F, Fut>(&mut self, f: F)
    where
        M: Message,
        F: Fn(M, MessageContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register_raw(
            M::MESSAGE_TYPE,
            Arc::new(FnHandler {
                f,
                _message: PhantomData,
            }),
        );
    }

    /// Register a handler object for an arbitrary message type.
    pub fn register_raw(&mut self, message_type: impl Into<String>, handler: Arc<dyn MessageHandler>) {
        self.handlers.insert(message_type.into(), handler);
    }

    /// Handler for `message_type`.
    pub fn get(&self, message_type: &str) -> Option<Arc<dyn MessageHandler>> {
        self.handlers.get(message_type).cloned()
    }

    /// Whether a handler exists for `message_type`.
    pub fn contains(&self, message_type: &str) -> bool {
        self.handlers.contains_key(message_type)
    }

    /// Registered message types, sorted.
    pub fn message_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }
}
