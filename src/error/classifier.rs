//! The error classifier.
//!
//! [`ErrorClassifier`] is a pure mapping from an error (plus optional context
//! and attempt number) to an [`ErrorClassification`]. It never sleeps or
//! loops; see [`crate::retry::retry_with`] for the caller-side loop.

use std::any::Any;
use std::collections::BTreeMap;
use std::error::Error;
use std::{fmt, io};

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::classification::{ErrorClassification, ErrorContext, ErrorKind, Severity};
use super::detector::{chain_message, ErrorDetector};
use crate::config::ConfigError;
use crate::inject::ResourceError;
use crate::lifecycle::LifecycleError;
use crate::retry::RetryPolicy;
use crate::router::RouterError;

/// Maps errors to retry verdicts under a fixed [`RetryPolicy`].
#[derive(Debug, Default)]
pub struct ErrorClassifier {
    policy: RetryPolicy,
    detector: ErrorDetector,
}

impl ErrorClassifier {
    /// Creates a classifier with the default detector.
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            detector: ErrorDetector::new(),
        }
    }

    /// Replaces the detector.
    pub fn with_detector(mut self, detector: ErrorDetector) -> Self {
        self.detector = detector;
        self
    }

    /// The policy verdicts are computed under.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn detector(&self) -> &ErrorDetector {
        &self.detector
    }

    /// Classifies a first-attempt failure.
    pub fn classify_error(
        &self,
        error: &(dyn Error + 'static),
        context: Option<ErrorContext>,
    ) -> ErrorClassification {
        self.classify_attempt(error, context, 1)
    }

    /// Classifies the failure of the given 1-based attempt.
    pub fn classify_attempt(
        &self,
        error: &(dyn Error + 'static),
        context: Option<ErrorContext>,
        attempt: u32,
    ) -> ErrorClassification {
        let kind = self.detector.detect(error);
        self.classify_kind(kind, chain_message(error), context, attempt)
    }

    /// Classifies an error known only by its message.
    pub fn classify_message(
        &self,
        message: &str,
        context: Option<ErrorContext>,
        attempt: u32,
    ) -> ErrorClassification {
        let kind = self
            .detector
            .detect_message(message)
            .unwrap_or(ErrorKind::Unknown);
        self.classify_kind(kind, message.to_string(), context, attempt)
    }

    /// Classifies an error held by its concrete type, such as a handler's
    /// `E`.
    ///
    /// Boxed errors and known error types go through the full source-chain
    /// detection of [`classify_attempt`](Self::classify_attempt); any other
    /// type is classified by its message.
    pub fn classify_value<E>(
        &self,
        error: &E,
        context: Option<ErrorContext>,
        attempt: u32,
    ) -> ErrorClassification
    where
        E: fmt::Display + 'static,
    {
        match as_error(error) {
            Some(error) => self.classify_attempt(error, context, attempt),
            None => self.classify_message(&error.to_string(), context, attempt),
        }
    }

    /// Builds the verdict for an already-known kind.
    pub fn classify_kind(
        &self,
        kind: ErrorKind,
        message: String,
        context: Option<ErrorContext>,
        attempt: u32,
    ) -> ErrorClassification {
        let attempt = attempt.max(1);
        let is_retryable = self.policy.is_retryable(kind, attempt);
        let classification = ErrorClassification {
            kind,
            severity: kind.severity(),
            message,
            is_retryable,
            retry_after: is_retryable.then(|| self.policy.backoff(kind, attempt)),
            attempt,
            context: context.unwrap_or_default(),
            occurred_at: Utc::now(),
        };
        tracing::debug!(
            kind = %classification.kind,
            attempt,
            retryable = is_retryable,
            "classified error"
        );
        classification
    }

    /// Same as [`ErrorClassification::should_retry`].
    pub fn should_retry(&self, classification: &ErrorClassification) -> bool {
        classification.should_retry()
    }
}

fn as_error<E: 'static>(value: &E) -> Option<&(dyn Error + 'static)> {
    let any: &dyn Any = value;
    if let Some(boxed) = any.downcast_ref::<Box<dyn Error + Send + Sync>>() {
        return Some(&**boxed);
    }
    if let Some(boxed) = any.downcast_ref::<Box<dyn Error>>() {
        return Some(&**boxed);
    }
    typed::<io::Error>(any)
        .or_else(|| typed::<ResourceError>(any))
        .or_else(|| typed::<LifecycleError>(any))
        .or_else(|| typed::<RouterError>(any))
        .or_else(|| typed::<ConfigError>(any))
        .or_else(|| typed::<serde_json::Error>(any))
}

fn typed<T: Error + 'static>(any: &dyn Any) -> Option<&(dyn Error + 'static)> {
    any.downcast_ref::<T>().map(|e| e as &(dyn Error + 'static))
}

/// A critical error kept in the ledger.
#[derive(Debug, Clone, Serialize)]
pub struct CriticalError {
    pub kind: ErrorKind,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

/// Summary of the errors seen by one ledger.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ErrorSummary {
    pub total: usize,
    pub by_kind: BTreeMap<ErrorKind, usize>,
    pub critical: Vec<CriticalError>,
    pub last_error: Option<String>,
}

/// Running record of classifications for one caller.
#[derive(Debug, Default)]
pub struct ErrorLedger {
    counts: BTreeMap<ErrorKind, usize>,
    critical: Vec<CriticalError>,
    last: Option<String>,
    total: usize,
}

impl ErrorLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a classification and logs it at a level matching its severity.
    pub fn record(&mut self, classification: &ErrorClassification) {
        let ErrorClassification {
            kind,
            severity,
            message,
            attempt,
            ..
        } = classification;

        match severity {
            Severity::Critical => {
                tracing::error!(kind = %kind, attempt, error = %message, "critical error")
            }
            Severity::High => tracing::warn!(kind = %kind, attempt, error = %message, "error"),
            Severity::Medium => tracing::info!(kind = %kind, attempt, error = %message, "error"),
            Severity::Low => tracing::debug!(kind = %kind, attempt, error = %message, "error"),
        }

        *self.counts.entry(*kind).or_default() += 1;
        self.total += 1;
        self.last = Some(message.clone());
        if classification.is_critical() {
            self.critical.push(CriticalError {
                kind: *kind,
                message: message.clone(),
                occurred_at: classification.occurred_at,
            });
        }
    }

    /// Number of recorded errors of the given kind.
    pub fn count(&self, kind: ErrorKind) -> usize {
        self.counts.get(&kind).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn summary(&self) -> ErrorSummary {
        ErrorSummary {
            total: self.total,
            by_kind: self.counts.clone(),
            critical: self.critical.clone(),
            last_error: self.last.clone(),
        }
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{error_context, should_retry};
    use serde_json::json;
    use std::io;
    use std::time::Duration;

    fn scenario_classifier() -> ErrorClassifier {
        ErrorClassifier::new(RetryPolicy::from_secs(3, 1.0).unwrap())
    }

    fn timeout() -> io::Error {
        io::Error::new(io::ErrorKind::TimedOut, "upstream timed out")
    }

    #[test]
    fn test_classify_value_uses_typed_detection() {
        let classifier = scenario_classifier();

        let boxed: Box<dyn Error + Send + Sync> =
            Box::new(io::Error::new(io::ErrorKind::PermissionDenied, "nope"));
        assert_eq!(classifier.classify_value(&boxed, None, 1).kind, ErrorKind::Permission);
        assert_eq!(classifier.classify_message("nope", None, 1).kind, ErrorKind::Unknown);

        let plain = io::Error::new(io::ErrorKind::TimedOut, "slow");
        assert_eq!(classifier.classify_value(&plain, None, 1).kind, ErrorKind::Transient);

        let text = String::from("connection refused");
        assert_eq!(classifier.classify_value(&text, None, 1).kind, ErrorKind::Transient);
    }

    #[test]
    fn test_transient_retry_window() {
        let classifier = scenario_classifier();
        let err = timeout();

        let first = classifier.classify_attempt(&err, None, 1);
        assert_eq!(first.kind, ErrorKind::Transient);
        assert!(first.is_retryable);
        assert!(first.retry_after.unwrap() >= Duration::from_secs(1));

        let third = classifier.classify_attempt(&err, None, 3);
        assert!(!third.is_retryable);
        assert!(third.retry_after.is_none());
    }

    #[test]
    fn test_no_retry_at_or_beyond_limit_for_any_kind() {
        let classifier = scenario_classifier();
        for kind in ErrorKind::ALL {
            for attempt in 3..6 {
                let c = classifier.classify_kind(kind, "x".to_string(), None, attempt);
                assert!(!should_retry(&c), "{kind} attempt {attempt}");
            }
        }
    }

    #[test]
    fn test_classification_is_deterministic() {
        let classifier = scenario_classifier();
        let err = timeout();
        let ctx = error_context(json!({ "handler": "ingest" }));

        let a = classifier.classify_attempt(&err, Some(ctx.clone()), 2);
        let b = classifier.classify_attempt(&err, Some(ctx), 2);

        assert_eq!(a.kind, b.kind);
        assert_eq!(a.is_retryable, b.is_retryable);
        assert_eq!(a.retry_after, b.retry_after);
        assert_eq!(a.context, b.context);
    }

    #[test]
    fn test_retry_after_grows_across_attempts() {
        let classifier = ErrorClassifier::new(RetryPolicy::new(10, Duration::from_millis(250)));
        let err = timeout();
        let delays: Vec<_> = (1..10)
            .map(|a| classifier.classify_attempt(&err, None, a).retry_after.unwrap())
            .collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_context_stored_verbatim() {
        let ctx = error_context(json!({ "handler": "orders", "ids": [1, 2] }));
        let c = scenario_classifier().classify_error(&timeout(), Some(ctx.clone()));
        assert_eq!(c.context, ctx);
        assert_eq!(c.attempt, 1);
    }

    #[test]
    fn test_unknown_uses_conservative_limit() {
        let classifier = ErrorClassifier::new(RetryPolicy::new(5, Duration::from_millis(10)));
        let c1 = classifier.classify_message("something odd", None, 1);
        let c2 = classifier.classify_message("something odd", None, 2);
        assert_eq!(c1.kind, ErrorKind::Unknown);
        assert!(c1.is_retryable);
        assert!(!c2.is_retryable);
    }

    #[test]
    fn test_permission_never_retryable() {
        let err = io::Error::new(io::ErrorKind::PermissionDenied, "secret access");
        let c = scenario_classifier().classify_error(&err, None);
        assert_eq!(c.kind, ErrorKind::Permission);
        assert!(c.is_critical());
        assert!(!c.is_retryable);
    }

    #[test]
    fn test_ledger_summary() {
        let classifier = scenario_classifier();
        let mut ledger = ErrorLedger::new();

        ledger.record(&classifier.classify_error(&timeout(), None));
        ledger.record(&classifier.classify_error(&timeout(), None));
        ledger.record(&classifier.classify_message("access denied", None, 1));

        let summary = ledger.summary();
        assert_eq!(summary.total, 3);
        assert_eq!(ledger.count(ErrorKind::Transient), 2);
        assert_eq!(summary.critical.len(), 1);
        assert_eq!(summary.last_error.as_deref(), Some("access denied"));

        let value = serde_json::to_value(&summary).unwrap();
        assert_eq!(value["by_kind"]["transient"], 2);

        ledger.clear();
        assert_eq!(ledger.total(), 0);
    }
}
