// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Failure policies.
//!
//! A handler failure is mapped to a [`Continuation`] by walking, in order:
//! the rules registered for the envelope's message type, the deserialization
//! guard, the global rules, and finally the default of retrying inline until
//! `max_attempts` deliveries and then dead-lettering.
//!
//! Each rule owns a list of slots indexed by the envelope's attempt count.
//! Once the slots are used up the rule's exhausted action applies, which is
//! dead-lettering unless stated otherwise.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::envelope::Envelope;
use crate::handlers::HandlerError;

/// What to do with an envelope whose handler failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Continuation {
    /// Execute again immediately on the same worker.
    RetryNow,
    /// Defer the envelope and re-execute after the delay.
    ScheduleRetry(Duration),
    /// Put the envelope back at the tail of its local queue.
    Requeue,
    /// Move to dead-letter storage.
    MoveToDeadLetter,
    /// Drop without dead-lettering.
    Discard,
    /// Requeue and pause the listener for the duration.
    PauseListener(Duration),
}

impl Continuation {
    /// Whether the envelope will be executed again.
    pub fn is_retry(&self) -> bool {
        !matches!(self, Self::MoveToDeadLetter | Self::Discard)
    }
}

/// Selects the handler failures a rule applies to.
#[derive(Clone)]
pub enum ErrorMatcher {
    /// Every failure.
    Any,
    /// Failures whose kind equals the string.
    Kind(String),
    /// Failures accepted by the predicate.
    Predicate(Arc<dyn Fn(&HandlerError) -> bool + Send + Sync>),
}

impl fmt::Debug for ErrorMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => write!(f, "Any"),
            Self::Kind(kind) => f.debug_tuple("Kind").field(kind).finish(),
            Self::Predicate(_) => write!(f, "Predicate(..)"),
        }
    }
}

impl ErrorMatcher {
    /// Match failures produced by [`HandlerError::from_error`] for `E`.
    pub fn of<E: 'static>() -> Self {
        Self::Kind(std::any::type_name::<E>().to_string())
    }

    /// Match with a predicate.
    pub fn when(predicate: impl Fn(&HandlerError) -> bool + Send + Sync + 'static) -> Self {
        Self::Predicate(Arc::new(predicate))
    }

    /// Whether `error` is selected.
    pub fn matches(&self, error: &HandlerError) -> bool {
        match self {
            Self::Any => true,
            Self::Kind(kind) => error.kind == *kind,
            Self::Predicate(predicate) => predicate(error),
        }
    }
}

/// Ordered continuations for one kind of failure.
///
/// ```ignore
/// let rule = FailureRule::on(ErrorMatcher::of::<GatewayTimeout>())
///     .retry_times(2)
///     .then_schedule_retry(&[Duration::from_secs(5), Duration::from_secs(30)]);
/// ```
#[derive(Debug, Clone)]
pub struct FailureRule {
    matcher: ErrorMatcher,
    slots: Vec<Continuation>,
    exhausted: Continuation,
}

impl FailureRule {
    /// Start a rule for failures selected by `matcher`.
    pub fn on(matcher: ErrorMatcher) -> Self {
        Self {
            matcher,
            slots: Vec::new(),
            exhausted: Continuation::MoveToDeadLetter,
        }
    }

    /// Rule that matches every failure.
    pub fn on_any() -> Self {
        Self::on(ErrorMatcher::Any)
    }

    /// Retry inline `times` times.
    pub fn retry_times(self, times: usize) -> Self {
        self.push(Continuation::RetryNow, times)
    }

    /// One scheduled retry per delay, in order.
    pub fn then_schedule_retry(mut self, delays: &[Duration]) -> Self {
        self.slots
            .extend(delays.iter().copied().map(Continuation::ScheduleRetry));
        self
    }

    /// Requeue `times` times.
    pub fn requeue_times(self, times: usize) -> Self {
        self.push(Continuation::Requeue, times)
    }

    /// Pause the listener once for `duration`.
    pub fn then_pause_listener(mut self, duration: Duration) -> Self {
        self.slots.push(Continuation::PauseListener(duration));
        self
    }

    /// Discard once the slots are used up.
    pub fn then_discard(mut self) -> Self {
        self.exhausted = Continuation::Discard;
        self
    }

    /// Dead-letter once the slots are used up.
    pub fn then_move_to_dead_letter(mut self) -> Self {
        self.exhausted = Continuation::MoveToDeadLetter;
        self
    }

    /// Discard on the first matching failure.
    pub fn discard(mut self) -> Self {
        self.slots.clear();
        self.exhausted = Continuation::Discard;
        self
    }

    /// Dead-letter on the first matching failure.
    pub fn move_to_dead_letter(mut self) -> Self {
        self.slots.clear();
        self.exhausted = Continuation::MoveToDeadLetter;
        self
    }

    fn push(mut self, continuation: Continuation, times: usize) -> Self {
        self.slots
            .extend(std::iter::repeat_n(continuation, times));
        self
    }

    fn matches(&self, error: &HandlerError) -> bool {
        self.matcher.matches(error)
    }

    /// Continuation for a failure after `attempts` earlier failures.
    pub fn continuation_for(&self, attempts: i32) -> Continuation {
        usize::try_from(attempts)
            .ok()
            .and_then(|index| self.slots.get(index))
            .cloned()
            .unwrap_or_else(|| self.exhausted.clone())
    }
}

/// Every failure rule of a runtime.
#[derive(Debug, Clone)]
pub struct FailurePolicies {
    per_type: HashMap<String, Vec<FailureRule>>,
    global: Vec<FailureRule>,
    max_attempts: i32,
}

impl Default for FailurePolicies {
    fn default() -> Self {
        Self::new(3)
    }
}

impl FailurePolicies {
    /// Empty rule set with the default inline-retry budget.
    pub fn new(max_attempts: i32) -> Self {
        Self {
            per_type: HashMap::new(),
            global: Vec::new(),
            max_attempts: max_attempts.max(1),
        }
    }

    /// Deliveries allowed by the default rule.
    pub fn max_attempts(&self) -> i32 {
        self.max_attempts
    }

    pub(crate) fn set_max_attempts(&mut self, max_attempts: i32) {
        self.max_attempts = max_attempts.max(1);
    }

    /// Add a rule for one message type. Rules are tried in insertion order,
    /// so register the most specific failure kinds first.
    pub fn on_message(mut self, message_type: impl Into<String>, rule: FailureRule) -> Self {
        self.per_type
            .entry(message_type.into())
            .or_default()
            .push(rule);
        self
    }

    /// Add a rule for every message type.
    pub fn on_any_message(mut self, rule: FailureRule) -> Self {
        self.global.push(rule);
        self
    }

    /// Decide what happens to `envelope` after `error`.
    ///
    /// Once an envelope has been delivered `max_attempts` times any retrying
    /// continuation becomes a dead-letter move, whichever rule matched.
    pub fn determine(&self, envelope: &Envelope, error: &HandlerError) -> Continuation {
        let continuation = self.select(envelope, error);
        if continuation.is_retry() && envelope.attempts + 1 >= self.max_attempts {
            return Continuation::MoveToDeadLetter;
        }
        continuation
    }

    fn select(&self, envelope: &Envelope, error: &HandlerError) -> Continuation {
        if let Some(rule) = self
            .per_type
            .get(&envelope.message_type)
            .and_then(|rules| rules.iter().find(|rule| rule.matches(error)))
        {
            return rule.continuation_for(envelope.attempts);
        }

        if error.is_deserialization() {
            return Continuation::MoveToDeadLetter;
        }

        if let Some(rule) = self.global.iter().find(|rule| rule.matches(error)) {
            return rule.continuation_for(envelope.attempts);
        }

        Continuation::RetryNow
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(attempts: i32) -> Envelope {
        let mut envelope = Envelope::new("order.placed", b"{}".to_vec());
        envelope.attempts = attempts;
        envelope
    }

    fn timeout() -> HandlerError {
        HandlerError::new("Timeout", "gateway timed out")
    }

    #[test]
    fn test_default_retries_until_max_attempts() {
        let policies = FailurePolicies::new(3);
        assert_eq!(policies.determine(&envelope(0), &timeout()), Continuation::RetryNow);
        assert_eq!(policies.determine(&envelope(1), &timeout()), Continuation::RetryNow);
        assert_eq!(
            policies.determine(&envelope(2), &timeout()),
            Continuation::MoveToDeadLetter
        );
    }

    #[test]
    fn test_slots_are_indexed_by_attempts() {
        let rule = FailureRule::on(ErrorMatcher::Kind("Timeout".into()))
            .retry_times(1)
            .then_schedule_retry(&[Duration::from_secs(5), Duration::from_secs(30)]);
        let policies = FailurePolicies::new(5).on_message("order.placed", rule);

        let expected = [
            Continuation::RetryNow,
            Continuation::ScheduleRetry(Duration::from_secs(5)),
            Continuation::ScheduleRetry(Duration::from_secs(30)),
            Continuation::MoveToDeadLetter,
            Continuation::MoveToDeadLetter,
        ];
        for (attempts, continuation) in expected.iter().enumerate() {
            assert_eq!(
                &policies.determine(&envelope(attempts as i32), &timeout()),
                continuation
            );
        }
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let policies = FailurePolicies::new(3)
            .on_message(
                "order.placed",
                FailureRule::on(ErrorMatcher::Kind("Validation".into())).discard(),
            )
            .on_message("order.placed", FailureRule::on_any().requeue_times(1));

        let validation = HandlerError::new("Validation", "bad sku");
        assert_eq!(policies.determine(&envelope(0), &validation), Continuation::Discard);
        assert_eq!(policies.determine(&envelope(0), &timeout()), Continuation::Requeue);
        assert_eq!(
            policies.determine(&envelope(1), &timeout()),
            Continuation::MoveToDeadLetter
        );
    }

    #[test]
    fn test_deserialization_is_dead_lettered_before_global_rules() {
        let policies =
            FailurePolicies::new(5).on_any_message(FailureRule::on_any().retry_times(10));
        let err = HandlerError::deserialization("missing field `sku`");
        assert_eq!(policies.determine(&envelope(0), &err), Continuation::MoveToDeadLetter);
        assert_eq!(policies.determine(&envelope(0), &timeout()), Continuation::RetryNow);
    }

    #[test]
    fn test_rules_apply_only_to_their_message_type() {
        let policies = FailurePolicies::new(3).on_message(
            "invoice.issued",
            FailureRule::on_any().then_pause_listener(Duration::from_secs(60)),
        );
        assert_eq!(policies.determine(&envelope(0), &timeout()), Continuation::RetryNow);

        let mut invoice = envelope(0);
        invoice.message_type = "invoice.issued".into();
        assert_eq!(
            policies.determine(&invoice, &timeout()),
            Continuation::PauseListener(Duration::from_secs(60))
        );
    }

    #[test]
    fn test_max_attempts_caps_matching_rules() {
        let policies = FailurePolicies::new(3)
            .on_any_message(FailureRule::on(ErrorMatcher::Kind("Timeout".into())).retry_times(10));
        assert_eq!(policies.determine(&envelope(1), &timeout()), Continuation::RetryNow);
        assert_eq!(
            policies.determine(&envelope(2), &timeout()),
            Continuation::MoveToDeadLetter
        );

        let discarding = FailurePolicies::new(1).on_any_message(FailureRule::on_any().discard());
        assert_eq!(discarding.determine(&envelope(0), &timeout()), Continuation::Discard);
    }

    #[test]
    fn test_matcher_of_type() {
        #[derive(Debug)]
        struct Refused;
        impl fmt::Display for Refused {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "refused")
            }
        }
        impl std::error::Error for Refused {}

        let matcher = ErrorMatcher::of::<Refused>();
        assert!(matcher.matches(&HandlerError::from_error(&Refused)));
        assert!(!matcher.matches(&timeout()));
        assert!(ErrorMatcher::when(|e| e.message.contains("gateway")).matches(&timeout()));
    }
}
