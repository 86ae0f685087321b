// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Transport contract.
//!
//! A transport contributes listeners and senders for one URI scheme. The
//! engine only ever sees opaque header-and-body messages; framing and broker
//! protocols live behind these traits.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::uri::Uri;

/// Opaque message as it crosses a transport boundary.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TransportMessage {
    /// String headers.
    pub headers: BTreeMap<String, String>,
    /// Serialized body.
    pub body: Vec<u8>,
}

/// Failure outcome of a transport send.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// The send did not complete in time.
    #[error("send timed out")]
    TimedOut,

    /// The envelope could not be written in the transport's format.
    #[error("serialization failed: {0}")]
    SerializationFailed(String),

    /// The destination is unknown to the broker.
    #[error("destination does not exist")]
    DestinationDoesNotExist,

    /// The transport accepted the message but reported a processing failure.
    #[error("processing failed: {0}")]
    ProcessingFailed(String),

    /// The sending agent is latched and is not sending.
    #[error("sender is latched")]
    SenderLatched,
}

impl SendError {
    /// Whether retrying the same envelope can never succeed.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::SerializationFailed(_) | Self::DestinationDoesNotExist
        )
    }
}

/// Outcome reported by a sending agent for one envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// The transport acknowledged the envelope.
    Succeeded,
    /// The envelope failed and will be retried.
    Failed(SendError),
    /// The envelope was moved to dead-letter storage.
    DeadLettered(SendError),
    /// The envelope passed its deliver-by deadline and was dropped.
    Expired,
}

/// Outbound half of a transport.
#[async_trait]
pub trait Sender: Send + Sync {
    /// Address this sender delivers to.
    fn destination(&self) -> &Uri;

    /// Hand one message to the transport.
    async fn send(&self, message: TransportMessage) -> std::result::Result<(), SendError>;

    /// Liveness probe used while the sending agent is latched.
    async fn ping(&self) -> bool;
}

/// Callback a listener invokes with received messages.
///
/// Returning `Ok` acknowledges the batch; the receiver has persisted or
/// queued every message by then. An error asks the transport to redeliver.
#[async_trait]
pub trait Receiver: Send + Sync {
    /// Accept a batch of raw messages.
    async fn received(&self, messages: Vec<TransportMessage>) -> Result<()>;
}

/// Inbound half of a transport.
#[async_trait]
pub trait Listener: Send + Sync {
    /// Address this listener receives on.
    fn address(&self) -> &Uri;

    /// Begin delivering messages to `receiver`.
    async fn start(&self, receiver: Arc<dyn Receiver>) -> Result<()>;

    /// Stop reading from the transport without dropping anything.
    async fn pause(&self);

    /// Resume reading after [`Listener::pause`].
    async fn resume(&self);

    /// Stop permanently.
    async fn stop(&self);
}

/// A transport for one URI scheme.
pub trait Transport: Send + Sync {
    /// Scheme this transport serves, e.g. `tcp`.
    fn scheme(&self) -> &str;

    /// Build a listener for `uri`.
    fn build_listener(&self, uri: &Uri) -> Result<Arc<dyn Listener>>;

    /// Build a sender for `uri`.
    fn build_sender(&self, uri: &Uri) -> Result<Arc<dyn Sender>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permanent_send_errors() {
        assert!(SendError::DestinationDoesNotExist.is_permanent());
        assert!(SendError::SerializationFailed("bad".into()).is_permanent());
        assert!(!SendError::TimedOut.is_permanent());
        assert!(!SendError::ProcessingFailed("busy".into()).is_permanent());
        assert!(!SendError::SenderLatched.is_permanent());
    }
}
