// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for courier-core.
//!
//! Provides a unified error type with stable error codes for health and
//! administrative reporting.

use thiserror::Error;

use crate::config::ConfigError;
use crate::envelope::EnvelopeError;
use crate::handlers::HandlerError;
use crate::transport::SendError;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors raised by the delivery engine.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CoreError {
    /// No destination could be resolved for an outgoing message.
    #[error("No route found for message type '{message_type}'")]
    NoRoute {
        /// The message type that could not be routed.
        message_type: String,
    },

    /// No handler is registered for an inbound message type.
    #[error("No handler registered for message type '{message_type}'")]
    NoHandler {
        /// The message type without a handler.
        message_type: String,
    },

    /// A message could not be serialized. Never retried.
    #[error("Failed to serialize message '{message_type}': {reason}")]
    Serialization {
        /// The message type being serialized.
        message_type: String,
        /// Serializer error details.
        reason: String,
    },

    /// Transport headers could not be mapped to an envelope.
    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(#[from] EnvelopeError),

    /// An inline handler invocation failed.
    #[error("Handler for '{message_type}' failed: {source}")]
    HandlerFailed {
        /// The message type being handled.
        message_type: String,
        /// The handler failure.
        #[source]
        source: HandlerError,
    },

    /// A destination uses a scheme no registered transport handles.
    #[error("No transport registered for endpoint '{uri}'")]
    UnknownEndpoint {
        /// The endpoint URI.
        uri: String,
    },

    /// A transport send failed.
    #[error("Send to '{destination}' failed: {source}")]
    Send {
        /// The destination URI.
        destination: String,
        /// The transport outcome.
        #[source]
        source: SendError,
    },

    /// Input validation failed.
    #[error("Validation error for '{field}': {message}")]
    ValidationError {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Database operation failed.
    #[error("Database error during '{operation}': {details}")]
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// The runtime is shutting down and no longer accepts work.
    #[error("Runtime is shutting down")]
    ShuttingDown,
}

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NoRoute { .. } => "NO_ROUTE",
            Self::NoHandler { .. } => "NO_HANDLER",
            Self::Serialization { .. } => "SERIALIZATION_FAILED",
            Self::InvalidEnvelope(_) => "INVALID_ENVELOPE",
            Self::HandlerFailed { .. } => "HANDLER_FAILED",
            Self::UnknownEndpoint { .. } => "UNKNOWN_ENDPOINT",
            Self::Send { .. } => "SEND_FAILED",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::Config(_) => "CONFIG_ERROR",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
            Self::ShuttingDown => "SHUTTING_DOWN",
        }
    }

    pub(crate) fn database(operation: &str, details: impl std::fmt::Display) -> Self {
        Self::DatabaseError {
            operation: operation.to_string(),
            details: details.to_string(),
        }
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::DatabaseError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::DatabaseError {
            operation: "json".to_string(),
            details: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let test_cases = vec![
            (
                CoreError::NoRoute {
                    message_type: "order.placed".to_string(),
                },
                "NO_ROUTE",
            ),
            (
                CoreError::NoHandler {
                    message_type: "order.placed".to_string(),
                },
                "NO_HANDLER",
            ),
            (
                CoreError::Serialization {
                    message_type: "order.placed".to_string(),
                    reason: "bad float".to_string(),
                },
                "SERIALIZATION_FAILED",
            ),
            (
                CoreError::InvalidEnvelope(EnvelopeError::MissingHeader("message-type")),
                "INVALID_ENVELOPE",
            ),
            (
                CoreError::HandlerFailed {
                    message_type: "order.placed".to_string(),
                    source: HandlerError::new("Timeout", "gateway timed out"),
                },
                "HANDLER_FAILED",
            ),
            (
                CoreError::UnknownEndpoint {
                    uri: "kafka://orders".to_string(),
                },
                "UNKNOWN_ENDPOINT",
            ),
            (
                CoreError::Send {
                    destination: "memory://orders".to_string(),
                    source: SendError::TimedOut,
                },
                "SEND_FAILED",
            ),
            (
                CoreError::ValidationError {
                    field: "uri".to_string(),
                    message: "missing scheme".to_string(),
                },
                "VALIDATION_ERROR",
            ),
            (
                CoreError::DatabaseError {
                    operation: "insert".to_string(),
                    details: "connection refused".to_string(),
                },
                "DATABASE_ERROR",
            ),
            (CoreError::ShuttingDown, "SHUTTING_DOWN"),
        ];

        for (error, expected_code) in test_cases {
            assert_eq!(
                error.error_code(),
                expected_code,
                "Error {:?} should have code {}",
                error,
                expected_code
            );
            assert!(!error.to_string().is_empty(), "Message should not be empty");
        }
    }

    #[test]
    fn test_error_display() {
        let err = CoreError::NoRoute {
            message_type: "order.placed".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "No route found for message type 'order.placed'"
        );

        let err = CoreError::DatabaseError {
            operation: "insert".to_string(),
            details: "connection refused".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Database error during 'insert': connection refused"
        );

        let err = CoreError::Send {
            destination: "memory://orders".to_string(),
            source: SendError::DestinationDoesNotExist,
        };
        assert_eq!(
            err.to_string(),
            "Send to 'memory://orders' failed: destination does not exist"
        );
    }

    #[test]
    fn test_from_sqlx_error() {
        let err: CoreError = sqlx::Error::RowNotFound.into();
        assert_eq!(err.error_code(), "DATABASE_ERROR");
    }
}
