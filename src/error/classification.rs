//! Error classification types.
//!
//! An [`ErrorClassification`] is the verdict produced for a failed
//! operation: which [`ErrorKind`] it belongs to, whether another attempt is
//! worthwhile, and how long to wait before making it.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};

/// Free-form description of the failing operation, kept verbatim.
pub type ErrorContext = Map<String, Value>;

/// Builds an [`ErrorContext`] from a JSON value.
///
/// Objects are used as-is; any other value is stored under `"value"`.
pub fn error_context(value: Value) -> ErrorContext {
    match value {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}

/// The closed set of error categories.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Network or timeout failures likely to succeed on retry.
    Transient,
    /// Pool, connection, quota or memory limits; retry with backoff.
    ResourceExhaustion,
    /// Malformed input or configuration. Never retried.
    Validation,
    /// Authentication or authorization failures. Never retried.
    Permission,
    /// Anything not recognised. Retried with a conservative limit.
    Unknown,
}

impl ErrorKind {
    /// All kinds, in declaration order.
    pub const ALL: [ErrorKind; 5] = [
        ErrorKind::Transient,
        ErrorKind::ResourceExhaustion,
        ErrorKind::Validation,
        ErrorKind::Permission,
        ErrorKind::Unknown,
    ];

    /// Returns true if errors of this kind may be retried at all.
    pub fn is_retryable(self) -> bool {
        !matches!(self, ErrorKind::Validation | ErrorKind::Permission)
    }

    /// Default severity assigned to this kind.
    pub fn severity(self) -> Severity {
        match self {
            ErrorKind::Validation => Severity::Medium,
            ErrorKind::Permission => Severity::Critical,
            ErrorKind::Transient | ErrorKind::ResourceExhaustion | ErrorKind::Unknown => {
                Severity::High
            }
        }
    }

    /// Stable snake_case name.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::ResourceExhaustion => "resource_exhaustion",
            ErrorKind::Validation => "validation",
            ErrorKind::Permission => "permission",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How urgently an error needs attention.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Implemented by error types that know their own [`ErrorKind`].
pub trait Classify {
    /// The kind of this error, or `None` to defer to pattern detection.
    fn error_kind(&self) -> Option<ErrorKind>;
}

/// Structured verdict for a failed operation.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ErrorClassification {
    /// Category of the error.
    pub kind: ErrorKind,
    /// Severity derived from the kind.
    pub severity: Severity,
    /// The error message, including its source chain.
    pub message: String,
    /// Whether the caller should try again.
    pub is_retryable: bool,
    /// Suggested delay before the next attempt; `None` when not retryable.
    #[serde(serialize_with = "serialize_secs")]
    pub retry_after: Option<Duration>,
    /// 1-based attempt this classification describes.
    pub attempt: u32,
    /// Caller-supplied description of the failing operation.
    pub context: ErrorContext,
    /// When the classification was made.
    pub occurred_at: DateTime<Utc>,
}

impl ErrorClassification {
    /// Returns true if the caller should try again.
    pub fn should_retry(&self) -> bool {
        self.is_retryable
    }

    /// Suggested delay in seconds.
    pub fn retry_after_secs(&self) -> Option<f64> {
        self.retry_after.map(|d| d.as_secs_f64())
    }

    /// Returns true for critical-severity errors.
    pub fn is_critical(&self) -> bool {
        self.severity == Severity::Critical
    }

    /// Adds a context entry.
    pub fn add_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

impl fmt::Display for ErrorClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

/// Single truth-check entry point for retry decisions.
pub fn should_retry(classification: &ErrorClassification) -> bool {
    classification.should_retry()
}

fn serialize_secs<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
    match value {
        Some(duration) => serializer.serialize_some(&duration.as_secs_f64()),
        None => serializer.serialize_none(),
    }
}
