//! Retry policy and the opt-in retry loop.
//!
//! [`RetryPolicy`] is the immutable `max_retries`/`retry_delay` configuration
//! the [`ErrorClassifier`](crate::error::ErrorClassifier) is built with. It
//! only computes verdicts; [`retry_with`] is the caller-side loop that acts
//! on them.

use std::error::Error;
use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::error::{Classify, ErrorClassification, ErrorClassifier, ErrorContext, ErrorKind};

/// Boxed error accepted by [`retry_with`].
pub type BoxError = Box<dyn Error + Send + Sync>;

/// Rejected retry policy parameters.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PolicyError {
    #[error("retry delay must be a finite, non-negative number of seconds, got {0}")]
    InvalidDelay(f64),

    #[error("maximum retry delay ({max:?}) is shorter than the base delay ({base:?})")]
    DelayCapBelowBase { base: Duration, max: Duration },
}

impl Classify for PolicyError {
    fn error_kind(&self) -> Option<ErrorKind> {
        Some(ErrorKind::Validation)
    }
}

/// Immutable retry configuration.
///
/// Delays grow exponentially: attempt `n` waits `retry_delay * 2^(n-1)`,
/// capped at `max_delay`. [`ErrorKind::ResourceExhaustion`] starts from twice
/// the base delay. There is no jitter, so the same inputs always produce the
/// same delay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetryPolicy {
    /// Attempts after which no error is retryable.
    pub max_retries: u32,
    /// Base delay before the first retry.
    pub retry_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Separate, lower limit applied to [`ErrorKind::Unknown`].
    pub unknown_max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            unknown_max_retries: 2,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with the default delay cap and unknown-kind limit.
    pub fn new(max_retries: u32, retry_delay: Duration) -> Self {
        Self {
            max_retries,
            retry_delay,
            max_delay: Duration::from_secs(60).max(retry_delay),
            ..Self::default()
        }
    }

    /// Creates a policy from a delay in (fractional) seconds.
    pub fn from_secs(max_retries: u32, retry_delay: f64) -> Result<Self, PolicyError> {
        let delay = delay_from_secs(retry_delay)?;
        Ok(Self::new(max_retries, delay))
    }

    /// Sets the delay cap.
    pub fn with_max_delay(mut self, max_delay: Duration) -> Result<Self, PolicyError> {
        if max_delay < self.retry_delay {
            return Err(PolicyError::DelayCapBelowBase {
                base: self.retry_delay,
                max: max_delay,
            });
        }
        self.max_delay = max_delay;
        Ok(self)
    }

    /// Sets the attempt limit for unrecognised errors.
    pub fn with_unknown_max_retries(mut self, limit: u32) -> Self {
        self.unknown_max_retries = limit;
        self
    }

    /// Attempts allowed for errors of the given kind.
    pub fn attempt_limit(&self, kind: ErrorKind) -> u32 {
        match kind {
            ErrorKind::Unknown => self.max_retries.min(self.unknown_max_retries),
            _ => self.max_retries,
        }
    }

    /// Whether a failure of `kind` on the given 1-based attempt may be retried.
    pub fn is_retryable(&self, kind: ErrorKind, attempt: u32) -> bool {
        kind.is_retryable() && attempt.max(1) < self.attempt_limit(kind)
    }

    /// Delay before the attempt following `attempt`.
    pub fn backoff(&self, kind: ErrorKind, attempt: u32) -> Duration {
        let exponent = attempt.max(1) - 1;
        let exponent = match kind {
            ErrorKind::ResourceExhaustion => exponent + 1,
            _ => exponent,
        }
        .min(31); // Prevent overflow

        let multiplier = 1u32 << exponent;
        self.retry_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Parses a delay in seconds, rejecting negative and non-finite values.
pub fn delay_from_secs(value: f64) -> Result<Duration, PolicyError> {
    if !value.is_finite() || value < 0.0 {
        return Err(PolicyError::InvalidDelay(value));
    }
    Duration::try_from_secs_f64(value).map_err(|_| PolicyError::InvalidDelay(value))
}

/// The last failure of a [`retry_with`] loop and its verdict.
#[derive(Error, Debug)]
#[error("giving up after attempt {}: {classification}", classification.attempt)]
pub struct RetryError {
    #[source]
    pub error: BoxError,
    pub classification: ErrorClassification,
}

/// Runs `operation` until it succeeds or fails with a non-retryable verdict.
///
/// The operation receives the 1-based attempt number. Between attempts the
/// loop sleeps for the classification's `retry_after`.
pub async fn retry_with<F, Fut, T, E>(
    classifier: &ErrorClassifier,
    context: Option<ErrorContext>,
    mut operation: F,
) -> Result<T, RetryError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Into<BoxError>,
{
    let mut attempt = 1;
    loop {
        let error: BoxError = match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => e.into(),
        };

        let classification = classifier.classify_attempt(&*error, context.clone(), attempt);
        match classification.retry_after.filter(|_| classification.should_retry()) {
            Some(delay) => {
                tracing::warn!(
                    attempt,
                    kind = %classification.kind,
                    delay_ms = delay.as_millis() as u64,
                    error = %classification.message,
                    "operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            None => return Err(RetryError { error, classification }),
        }
    }
}
