// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Message routing and endpoint options.
//!
//! Explicit rules are evaluated first and every matching rule contributes a
//! destination. When none match, the conventional route is the local queue
//! named after the message type, provided a handler for it is registered.

use std::collections::{BTreeSet, HashMap};

use tracing::debug;

use crate::circuit_breaker::CircuitBreakerOptions;
use crate::envelope::DeliveryMode;
use crate::error::{CoreError, Result};
use crate::uri::Uri;

/// Queue-depth marks for listener backpressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferingLimits {
    /// Depth at which the listener stops reading.
    pub maximum: usize,
    /// Depth at or below which a too-busy listener resumes.
    pub restart: usize,
}

impl Default for BufferingLimits {
    fn default() -> Self {
        Self {
            maximum: 1000,
            restart: 500,
        }
    }
}

/// Per-endpoint delivery settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointOptions {
    /// Delivery mode.
    pub mode: DeliveryMode,
    /// Backpressure marks.
    pub buffering: BufferingLimits,
    /// Optional failure-rate breaker.
    pub circuit_breaker: Option<CircuitBreakerOptions>,
    /// Concurrent handler executions for the endpoint's queue.
    pub parallelism: usize,
}

impl Default for EndpointOptions {
    fn default() -> Self {
        Self {
            mode: DeliveryMode::BufferedInMemory,
            buffering: BufferingLimits::default(),
            circuit_breaker: None,
            parallelism: 4,
        }
    }
}

impl EndpointOptions {
    /// Durable endpoint.
    pub fn durable() -> Self {
        Self {
            mode: DeliveryMode::Durable,
            ..Self::default()
        }
    }

    /// Buffered in-memory endpoint.
    pub fn buffered() -> Self {
        Self::default()
    }

    /// Inline endpoint.
    pub fn inline() -> Self {
        Self {
            mode: DeliveryMode::Inline,
            ..Self::default()
        }
    }

    /// Set the backpressure marks.
    pub fn with_buffering(mut self, maximum: usize, restart: usize) -> Self {
        self.buffering = BufferingLimits {
            maximum: maximum.max(1),
            restart: restart.min(maximum),
        };
        self
    }

    /// Enable the circuit breaker.
    pub fn with_circuit_breaker(mut self, options: CircuitBreakerOptions) -> Self {
        self.circuit_breaker = Some(options);
        self
    }

    /// Run up to `parallelism` handlers at once.
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    /// Execute one envelope at a time, in order.
    pub fn sequential(self) -> Self {
        self.with_parallelism(1)
    }

    /// Whether the endpoint persists envelopes.
    pub fn is_durable(&self) -> bool {
        self.mode == DeliveryMode::Durable
    }
}

/// Which message types a rule applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteMatch {
    /// One message type.
    Exact(String),
    /// Message types starting with the prefix, e.g. `billing.`.
    Prefix(String),
    /// Every message type.
    All,
}

impl RouteMatch {
    fn matches(&self, message_type: &str) -> bool {
        match self {
            Self::Exact(name) => name == message_type,
            Self::Prefix(prefix) => message_type.starts_with(prefix.as_str()),
            Self::All => true,
        }
    }
}

/// Explicit routing rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRule {
    /// Selected message types.
    pub matcher: RouteMatch,
    /// Where they go.
    pub destination: Uri,
}

/// One resolved destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Destination address.
    pub destination: Uri,
    /// Delivery mode of the destination endpoint.
    pub mode: DeliveryMode,
}

/// Resolves message types to destinations.
#[derive(Debug, Clone, Default)]
pub struct MessageRouter {
    rules: Vec<RouteRule>,
    endpoints: HashMap<Uri, EndpointOptions>,
    handled_types: BTreeSet<String>,
    discard_missing_routes: bool,
}

impl MessageRouter {
    /// Empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an explicit rule.
    pub fn add_rule(&mut self, matcher: RouteMatch, destination: Uri) {
        self.rules.push(RouteRule {
            matcher,
            destination,
        });
    }

    /// Configure an endpoint.
    pub fn configure_endpoint(&mut self, uri: Uri, options: EndpointOptions) {
        self.endpoints.insert(uri, options);
    }

    /// Register a locally handled type for conventional routing.
    pub fn add_handled_type(&mut self, message_type: impl Into<String>) {
        self.handled_types.insert(message_type.into());
    }

    /// Drop unroutable messages instead of failing the send.
    pub fn set_discard_missing_routes(&mut self, discard: bool) {
        self.discard_missing_routes = discard;
    }

    /// Options of `uri`, falling back to defaults.
    pub fn endpoint(&self, uri: &Uri) -> EndpointOptions {
        self.endpoints.get(uri).cloned().unwrap_or_default()
    }

    /// Explicitly configured endpoints.
    pub fn endpoints(&self) -> impl Iterator<Item = (&Uri, &EndpointOptions)> {
        self.endpoints.iter()
    }

    /// Conventional local queue of a handled message type.
    pub fn conventional_queue(&self, message_type: &str) -> Option<Uri> {
        self.handled_types
            .contains(message_type)
            .then(|| Uri::local(message_type))
    }

    /// Local queues implied by the registered handlers.
    pub fn conventional_queues(&self) -> Vec<Uri> {
        self.handled_types
            .iter()
            .map(|message_type| Uri::local(message_type))
            .collect()
    }

    /// Resolve every destination of `message_type`.
    ///
    /// Returns an empty list for an unroutable type when missing routes are
    /// discarded, otherwise [`CoreError::NoRoute`].
    pub fn route(&self, message_type: &str) -> Result<Vec<Route>> {
        let mut destinations: Vec<Uri> = Vec::new();
        for rule in &self.rules {
            if rule.matcher.matches(message_type) && !destinations.contains(&rule.destination) {
                destinations.push(rule.destination.clone());
            }
        }

        if destinations.is_empty()
            && let Some(queue) = self.conventional_queue(message_type)
        {
            destinations.push(queue);
        }

        if destinations.is_empty() {
            if self.discard_missing_routes {
                debug!(message_type = %message_type, "No route for message type, discarding");
                return Ok(Vec::new());
            }
            return Err(CoreError::NoRoute {
                message_type: message_type.to_string(),
            });
        }

        Ok(destinations
            .into_iter()
            .map(|destination| Route {
                mode: self.endpoint(&destination).mode,
                destination,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uri(raw: &str) -> Uri {
        Uri::parse(raw).unwrap()
    }

    #[test]
    fn test_explicit_rules_fan_out() {
        let mut router = MessageRouter::new();
        router.add_rule(RouteMatch::Exact("order.placed".into()), uri("tcp://billing:5000"));
        router.add_rule(RouteMatch::Prefix("order.".into()), uri("tcp://audit:5000"));
        router.add_rule(RouteMatch::All, uri("tcp://audit:5000"));
        router.configure_endpoint(uri("tcp://billing:5000"), EndpointOptions::durable());

        let routes = router.route("order.placed").unwrap();
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].destination, uri("tcp://billing:5000"));
        assert_eq!(routes[0].mode, DeliveryMode::Durable);
        assert_eq!(routes[1].mode, DeliveryMode::BufferedInMemory);
    }

    #[test]
    fn test_conventional_route_needs_a_handler() {
        let mut router = MessageRouter::new();
        router.add_handled_type("invoice.issued");

        let routes = router.route("invoice.issued").unwrap();
        assert_eq!(routes[0].destination, Uri::local("invoice.issued"));

        let err = router.route("invoice.voided").unwrap_err();
        assert_eq!(err.error_code(), "NO_ROUTE");
    }

    #[test]
    fn test_discard_missing_routes() {
        let mut router = MessageRouter::new();
        router.set_discard_missing_routes(true);
        assert!(router.route("nobody.cares").unwrap().is_empty());
    }

    #[test]
    fn test_explicit_rule_overrides_convention() {
        let mut router = MessageRouter::new();
        router.add_handled_type("invoice.issued");
        router.add_rule(RouteMatch::Exact("invoice.issued".into()), Uri::local("invoices"));
        let routes = router.route("invoice.issued").unwrap();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].destination, Uri::local("invoices"));
    }

    #[test]
    fn test_buffering_limits_are_ordered() {
        let options = EndpointOptions::durable().with_buffering(10, 50).sequential();
        assert_eq!(options.buffering.maximum, 10);
        assert_eq!(options.buffering.restart, 10);
        assert_eq!(options.parallelism, 1);
        assert!(options.is_durable());
    }
}
