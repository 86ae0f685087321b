// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The envelope: a serialized message plus its delivery metadata.
//!
//! # Status State Machine
//!
//! ```text
//!   incoming side                          outgoing side
//!
//!   ┌───────────┐  delay / retry later     ┌──────────┐
//!   │ INCOMING  │─────────────────────┐    │ OUTGOING │──┐ retry
//!   └─────┬─────┘◄───────┐            │    └────┬─────┘◄─┘
//!         │   requeue    │            ▼         │
//!         │              │      ┌───────────┐   │ ack: row deleted
//!         │              └──────│ SCHEDULED │   │
//!         │                due  └─────┬─────┘   │ exhausted
//!         │ success                   │ send    ▼
//!         ▼                           └────► OUTGOING
//!   ┌───────────┐   exhausted   ┌────────────┐
//!   │  HANDLED  │               │ DEAD LETTER│──► replay ──► INCOMING
//!   └───────────┘               └────────────┘
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::transport::TransportMessage;
use crate::uri::Uri;

/// Content type written when nothing else is specified.
pub const DEFAULT_CONTENT_TYPE: &str = "application/json";

/// Message type recorded for unmappable messages without one.
pub const UNKNOWN_MESSAGE_TYPE: &str = "unknown";

/// Well-known transport header names.
pub mod headers {
    /// Envelope id.
    pub const ID: &str = "id";
    /// Message type name.
    pub const MESSAGE_TYPE: &str = "message-type";
    /// Body content type.
    pub const CONTENT_TYPE: &str = "content-type";
    /// Delivery attempts so far.
    pub const ATTEMPTS: &str = "attempts";
    /// Correlation id of the causal chain.
    pub const CORRELATION_ID: &str = "correlation-id";
    /// Id of the message that caused this one.
    pub const CONVERSATION_ID: &str = "conversation-id";
    /// Parent id.
    pub const PARENT_ID: &str = "parent-id";
    /// Saga id.
    pub const SAGA_ID: &str = "saga-id";
    /// Tenant id.
    pub const TENANT_ID: &str = "tenant-id";
    /// Reply address.
    pub const REPLY_URI: &str = "reply-uri";
    /// Sending service name.
    pub const SOURCE: &str = "source";
    /// Destination address.
    pub const DESTINATION: &str = "destination";
    /// Deadline after which the message must not be delivered.
    pub const DELIVER_BY: &str = "deliver-by";
    /// Scheduled execution time.
    pub const SCHEDULED_TIME: &str = "scheduled-time";
    /// Time the message was sent.
    pub const SENT_AT: &str = "sent-at";

    pub(crate) const RESERVED: &[&str] = &[
        ID,
        MESSAGE_TYPE,
        CONTENT_TYPE,
        ATTEMPTS,
        CORRELATION_ID,
        CONVERSATION_ID,
        PARENT_ID,
        SAGA_ID,
        TENANT_ID,
        REPLY_URI,
        SOURCE,
        DESTINATION,
        DELIVER_BY,
        SCHEDULED_TIME,
        SENT_AT,
    ];
}

/// Envelope mapping errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeError {
    /// A required header is absent.
    #[error("missing required header '{0}'")]
    MissingHeader(&'static str),

    /// A header value could not be parsed.
    #[error("invalid value '{value}' for header '{header}'")]
    InvalidHeader {
        /// Header name.
        header: &'static str,
        /// Offending value.
        value: String,
    },

    /// A persisted status string is not recognized.
    #[error("unknown envelope status '{0}'")]
    UnknownStatus(String),
}

/// Lifecycle status of a persisted envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnvelopeStatus {
    /// Persisted on the sending side, awaiting transport acknowledgement.
    Outgoing,
    /// Deferred until its execution time.
    Scheduled,
    /// Received, awaiting execution.
    Incoming,
    /// Successfully handled; retained only for duplicate detection.
    Handled,
    /// Permanently failed.
    DeadLetter,
}

impl EnvelopeStatus {
    /// Persisted representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Outgoing => "Outgoing",
            Self::Scheduled => "Scheduled",
            Self::Incoming => "Incoming",
            Self::Handled => "Handled",
            Self::DeadLetter => "DeadLetter",
        }
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: EnvelopeStatus) -> bool {
        use EnvelopeStatus::*;
        matches!(
            (self, next),
            (Incoming, Incoming)
                | (Incoming, Scheduled)
                | (Incoming, Handled)
                | (Incoming, DeadLetter)
                | (Scheduled, Incoming)
                | (Scheduled, Outgoing)
                | (Scheduled, DeadLetter)
                | (Outgoing, Outgoing)
                | (Outgoing, DeadLetter)
                | (DeadLetter, Incoming)
        )
    }

    /// Whether no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Handled)
    }
}

impl fmt::Display for EnvelopeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnvelopeStatus {
    type Err = EnvelopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Outgoing" => Ok(Self::Outgoing),
            "Scheduled" => Ok(Self::Scheduled),
            "Incoming" => Ok(Self::Incoming),
            "Handled" => Ok(Self::Handled),
            "DeadLetter" => Ok(Self::DeadLetter),
            other => Err(EnvelopeError::UnknownStatus(other.to_string())),
        }
    }
}

/// How received envelopes are identified for duplicate detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MessageIdentity {
    /// The envelope id alone is the identity.
    #[default]
    IdOnly,
    /// Id plus receiving address, for upstream systems that reuse ids.
    IdAndDestination,
}

/// Delivery mode of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DeliveryMode {
    /// Sent synchronously by the caller, never persisted.
    Inline,
    /// Queued in process; lost on crash.
    #[default]
    BufferedInMemory,
    /// Persisted before transport handoff.
    Durable,
}

/// A message plus delivery metadata, persisted or transmitted as one unit.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Globally unique id.
    pub id: Uuid,
    /// Message type name used for routing and handler dispatch.
    pub message_type: String,
    /// Content type of `data`.
    pub content_type: String,
    /// Serialized payload.
    pub data: Vec<u8>,
    /// Lifecycle status.
    pub status: EnvelopeStatus,
    /// Owning node number; `0` means any node may claim it.
    pub owner_id: i32,
    /// Failed delivery attempts so far. Zero on first receipt.
    pub attempts: i32,
    /// When a deferred envelope becomes due.
    pub scheduled_time: Option<DateTime<Utc>>,
    /// Retention deadline for handled envelopes.
    pub keep_until: Option<DateTime<Utc>>,
    /// Deadline after which the message must not be delivered.
    pub deliver_by: Option<DateTime<Utc>>,
    /// Where the envelope is going.
    pub destination: Option<Uri>,
    /// Listener address the envelope arrived on.
    pub received_at: Option<Uri>,
    /// Where responses should be sent.
    pub reply_uri: Option<Uri>,
    /// Name of the sending service.
    pub source: Option<String>,
    /// Ties a causal chain of messages together.
    pub correlation_id: Option<String>,
    /// Id of the message that caused this one.
    pub conversation_id: Option<Uuid>,
    /// Parent id.
    pub parent_id: Option<String>,
    /// Saga (stateful workflow) this message updates.
    pub saga_id: Option<String>,
    /// Tenant id.
    pub tenant_id: Option<String>,
    /// When the envelope was created by the sender.
    pub sent_at: DateTime<Utc>,
    /// User headers.
    pub headers: BTreeMap<String, String>,
}

impl Envelope {
    /// Create a fresh outgoing envelope.
    pub fn new(message_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4(),
            message_type: message_type.into(),
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            data,
            status: EnvelopeStatus::Outgoing,
            owner_id: 0,
            attempts: 0,
            scheduled_time: None,
            keep_until: None,
            deliver_by: None,
            destination: None,
            received_at: None,
            reply_uri: None,
            source: None,
            correlation_id: None,
            conversation_id: None,
            parent_id: None,
            saga_id: None,
            tenant_id: None,
            sent_at: Utc::now(),
            headers: BTreeMap::new(),
        }
    }

    /// Whether the deliver-by deadline has passed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.deliver_by.is_some_and(|deadline| deadline <= now)
    }

    /// Whether execution is deferred past `now`.
    pub fn is_scheduled_for_later(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_time.is_some_and(|at| at > now)
    }

    /// Key component that joins the id in the incoming primary key.
    pub fn identity_scope(&self, identity: MessageIdentity) -> String {
        match identity {
            MessageIdentity::IdOnly => String::new(),
            MessageIdentity::IdAndDestination => self
                .received_at
                .as_ref()
                .or(self.destination.as_ref())
                .map(|uri| uri.to_string())
                .unwrap_or_default(),
        }
    }

    /// Address whose queue executes this envelope.
    pub fn execution_address(&self) -> Option<&Uri> {
        self.received_at.as_ref().or(self.destination.as_ref())
    }

    /// Stamp the envelope as received on `listener`.
    ///
    /// Envelopes due now become `Incoming` owned by `owner`; envelopes due
    /// later become `Scheduled` and stay claimable by any node.
    pub fn mark_received(&mut self, listener: &Uri, owner: i32, now: DateTime<Utc>) {
        self.received_at = Some(listener.clone());
        if self.is_scheduled_for_later(now) {
            self.status = EnvelopeStatus::Scheduled;
            self.owner_id = 0;
        } else {
            self.status = EnvelopeStatus::Incoming;
            self.owner_id = owner;
        }
    }

    /// Keep an unmappable transport message for dead-letter storage.
    ///
    /// The envelope gets a fresh id and every raw header is kept as a user
    /// header, including values that failed to parse.
    pub fn unreadable(message: TransportMessage, received_at: &Uri) -> Self {
        let TransportMessage { headers: map, body } = message;
        let message_type = map
            .get(headers::MESSAGE_TYPE)
            .filter(|t| !t.is_empty())
            .cloned()
            .unwrap_or_else(|| UNKNOWN_MESSAGE_TYPE.to_string());

        let mut envelope = Self::new(message_type, body);
        if let Some(content_type) = map.get(headers::CONTENT_TYPE) {
            envelope.content_type = content_type.clone();
        }
        envelope.status = EnvelopeStatus::DeadLetter;
        envelope.destination = Some(received_at.clone());
        envelope.received_at = Some(received_at.clone());
        envelope.headers = map;
        envelope
    }

    /// Map the envelope to transport headers and body.
    ///
    /// User headers never override the envelope's own metadata.
    pub fn to_transport(&self) -> TransportMessage {
        let mut map: BTreeMap<String, String> = self
            .headers
            .iter()
            .filter(|(name, _)| !headers::RESERVED.contains(&name.as_str()))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        map.insert(headers::ID.to_string(), self.id.to_string());
        map.insert(headers::MESSAGE_TYPE.to_string(), self.message_type.clone());
        map.insert(headers::CONTENT_TYPE.to_string(), self.content_type.clone());
        map.insert(headers::ATTEMPTS.to_string(), self.attempts.to_string());
        map.insert(headers::SENT_AT.to_string(), self.sent_at.to_rfc3339());

        let optional = [
            (headers::CORRELATION_ID, self.correlation_id.clone()),
            (
                headers::CONVERSATION_ID,
                self.conversation_id.map(|id| id.to_string()),
            ),
            (headers::PARENT_ID, self.parent_id.clone()),
            (headers::SAGA_ID, self.saga_id.clone()),
            (headers::TENANT_ID, self.tenant_id.clone()),
            (headers::REPLY_URI, self.reply_uri.as_ref().map(Uri::to_string)),
            (headers::SOURCE, self.source.clone()),
            (
                headers::DESTINATION,
                self.destination.as_ref().map(Uri::to_string),
            ),
            (headers::DELIVER_BY, self.deliver_by.map(|t| t.to_rfc3339())),
            (
                headers::SCHEDULED_TIME,
                self.scheduled_time.map(|t| t.to_rfc3339()),
            ),
        ];
        for (name, value) in optional {
            if let Some(value) = value {
                map.insert(name.to_string(), value);
            }
        }

        TransportMessage {
            headers: map,
            body: self.data.clone(),
        }
    }

    /// Rebuild an envelope from transport headers and body.
    ///
    /// A missing id gets a fresh one; a missing message type is an error.
    pub fn from_transport(
        message: TransportMessage,
        received_at: &Uri,
    ) -> Result<Self, EnvelopeError> {
        let TransportMessage {
            headers: mut map,
            body,
        } = message;

        let id = match map.remove(headers::ID) {
            Some(raw) => Uuid::parse_str(&raw).map_err(|_| EnvelopeError::InvalidHeader {
                header: headers::ID,
                value: raw,
            })?,
            None => Uuid::new_v4(),
        };
        let message_type = map
            .remove(headers::MESSAGE_TYPE)
            .filter(|t| !t.is_empty())
            .ok_or(EnvelopeError::MissingHeader(headers::MESSAGE_TYPE))?;
        let attempts = match map.remove(headers::ATTEMPTS) {
            Some(raw) => raw
                .parse::<i32>()
                .ok()
                .filter(|a| *a >= 0)
                .ok_or(EnvelopeError::InvalidHeader {
                    header: headers::ATTEMPTS,
                    value: raw,
                })?,
            None => 0,
        };
        let conversation_id = match map.remove(headers::CONVERSATION_ID) {
            Some(raw) => Some(Uuid::parse_str(&raw).map_err(|_| {
                EnvelopeError::InvalidHeader {
                    header: headers::CONVERSATION_ID,
                    value: raw,
                }
            })?),
            None => None,
        };

        let envelope = Self {
            id,
            message_type,
            content_type: map
                .remove(headers::CONTENT_TYPE)
                .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
            data: body,
            status: EnvelopeStatus::Incoming,
            owner_id: 0,
            attempts,
            scheduled_time: take_time(&mut map, headers::SCHEDULED_TIME)?,
            keep_until: None,
            deliver_by: take_time(&mut map, headers::DELIVER_BY)?,
            destination: take_uri(&mut map, headers::DESTINATION)?,
            received_at: Some(received_at.clone()),
            reply_uri: take_uri(&mut map, headers::REPLY_URI)?,
            source: map.remove(headers::SOURCE),
            correlation_id: map.remove(headers::CORRELATION_ID),
            conversation_id,
            parent_id: map.remove(headers::PARENT_ID),
            saga_id: map.remove(headers::SAGA_ID),
            tenant_id: map.remove(headers::TENANT_ID),
            sent_at: take_time(&mut map, headers::SENT_AT)?.unwrap_or_else(Utc::now),
            headers: map,
        };

        Ok(envelope)
    }
}

fn take_time(
    map: &mut BTreeMap<String, String>,
    header: &'static str,
) -> Result<Option<DateTime<Utc>>, EnvelopeError> {
    match map.remove(header) {
        Some(raw) => DateTime::parse_from_rfc3339(&raw)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|_| EnvelopeError::InvalidHeader { header, value: raw }),
        None => Ok(None),
    }
}

fn take_uri(
    map: &mut BTreeMap<String, String>,
    header: &'static str,
) -> Result<Option<Uri>, EnvelopeError> {
    match map.remove(header) {
        Some(raw) => Uri::parse(&raw)
            .map(Some)
            .map_err(|_| EnvelopeError::InvalidHeader { header, value: raw }),
        None => Ok(None),
    }
}
