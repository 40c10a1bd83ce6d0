//! Error kind detection.
//!
//! Walks an error's `source()` chain and decides its [`ErrorKind`]:
//! custom matchers first, then known error types, then regex patterns over
//! the chain's messages. Anything left over is [`ErrorKind::Unknown`].

use std::error::Error;
use std::fmt;
use std::io;

use regex::Regex;

use super::{Classify, ErrorKind};
use crate::config::secrets::SecretError;
use crate::config::ConfigError;
use crate::inject::database::DatabaseError;
use crate::inject::ResourceError;
use crate::lifecycle::LifecycleError;
use crate::retry::PolicyError;
use crate::router::RouterError;

type Matcher = Box<dyn Fn(&(dyn Error + 'static)) -> Option<ErrorKind> + Send + Sync>;

/// A pattern for matching error messages.
#[derive(Debug, Clone)]
pub struct ErrorPattern {
    regex: Regex,
    kind: ErrorKind,
    description: String,
}

impl ErrorPattern {
    /// Creates a new error pattern.
    ///
    /// # Panics
    /// Panics if the regex pattern is invalid.
    pub fn new(pattern: &str, kind: ErrorKind, description: impl Into<String>) -> Self {
        Self {
            regex: Regex::new(pattern).expect("Invalid regex pattern"),
            kind,
            description: description.into(),
        }
    }

    /// Creates a new error pattern, returning an error for an invalid regex.
    pub fn try_new(
        pattern: &str,
        kind: ErrorKind,
        description: impl Into<String>,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            regex: Regex::new(pattern)?,
            kind,
            description: description.into(),
        })
    }

    /// Returns the regex pattern.
    pub fn regex(&self) -> &Regex {
        &self.regex
    }

    /// Returns the kind assigned on match.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Checks if this pattern matches the given text.
    pub fn matches(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }
}

/// Decides the [`ErrorKind`] of arbitrary errors.
pub struct ErrorDetector {
    matchers: Vec<Matcher>,
    patterns: Vec<ErrorPattern>,
}

impl Default for ErrorDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ErrorDetector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorDetector")
            .field("matchers", &self.matchers.len())
            .field("patterns", &self.patterns)
            .finish()
    }
}

impl ErrorDetector {
    /// Creates a detector with the default message patterns.
    pub fn new() -> Self {
        Self {
            matchers: Vec::new(),
            patterns: Self::default_patterns(),
        }
    }

    /// Creates a detector with only the given message patterns.
    pub fn with_patterns(patterns: Vec<ErrorPattern>) -> Self {
        Self {
            matchers: Vec::new(),
            patterns,
        }
    }

    /// Adds a matcher consulted before any built-in recognition.
    ///
    /// Matchers see every error in the source chain, outermost first.
    pub fn with_matcher<F>(mut self, matcher: F) -> Self
    where
        F: Fn(&(dyn Error + 'static)) -> Option<ErrorKind> + Send + Sync + 'static,
    {
        self.matchers.push(Box::new(matcher));
        self
    }

    /// Adds a message pattern after the existing ones.
    pub fn add_pattern(&mut self, pattern: ErrorPattern) {
        self.patterns.push(pattern);
    }

    /// Returns the configured patterns, in priority order.
    pub fn patterns(&self) -> &[ErrorPattern] {
        &self.patterns
    }

    fn default_patterns() -> Vec<ErrorPattern> {
        vec![
            // Permission first so "invalid token" is not read as bad input
            ErrorPattern::new(r"(?i)\b40[13]\b", ErrorKind::Permission, "HTTP 401/403"),
            ErrorPattern::new(r"(?i)unauthori[sz]ed", ErrorKind::Permission, "Unauthorized"),
            ErrorPattern::new(r"(?i)\bforbidden\b", ErrorKind::Permission, "Forbidden"),
            ErrorPattern::new(
                r"(?i)(permission|access)\s*denied",
                ErrorKind::Permission,
                "Permission denied",
            ),
            ErrorPattern::new(
                r"(?i)auth(entication|orization)?\s*(failed|error)",
                ErrorKind::Permission,
                "Authentication failed",
            ),
            ErrorPattern::new(
                r"(?i)(invalid|expired)\s*(api\s*)?(token|key|credentials?)",
                ErrorKind::Permission,
                "Invalid credentials",
            ),
            // Resource exhaustion
            ErrorPattern::new(
                r"(?i)too\s+many\s+(connections|clients|open\s+files|requests)",
                ErrorKind::ResourceExhaustion,
                "Connection or request limit",
            ),
            ErrorPattern::new(
                r"(?i)pool\s*(exhausted|timed?\s*out|limit)",
                ErrorKind::ResourceExhaustion,
                "Pool exhausted",
            ),
            ErrorPattern::new(r"(?i)\b429\b", ErrorKind::ResourceExhaustion, "HTTP 429"),
            ErrorPattern::new(
                r"(?i)rate[\s\-]?limit|throttl",
                ErrorKind::ResourceExhaustion,
                "Rate limited",
            ),
            ErrorPattern::new(
                r"(?i)quota\s*(exceeded|exhausted)|out\s+of\s+memory|resource\s*exhausted",
                ErrorKind::ResourceExhaustion,
                "Quota or memory exhausted",
            ),
            // Transient
            ErrorPattern::new(
                r"(?i)time[d\s]*\s*out|timeout|deadline\s*(exceeded|expired)",
                ErrorKind::Transient,
                "Timeout",
            ),
            ErrorPattern::new(
                r"(?i)connection\s*(refused|reset|closed|aborted)|broken\s+pipe",
                ErrorKind::Transient,
                "Connection error",
            ),
            ErrorPattern::new(
                r"(?i)network\s*(error|failure|unreachable)",
                ErrorKind::Transient,
                "Network error",
            ),
            ErrorPattern::new(
                r"(?i)\b50[234]\b|(service|temporarily)\s*unavailable|try\s+again",
                ErrorKind::Transient,
                "Service unavailable",
            ),
            // Validation
            ErrorPattern::new(
                r"(?i)\binvalid\b|\bmalformed\b|validation",
                ErrorKind::Validation,
                "Invalid input",
            ),
            ErrorPattern::new(
                r"(?i)missing\s+(required\s+)?(field|parameter|value)",
                ErrorKind::Validation,
                "Missing field",
            ),
            ErrorPattern::new(
                r"(?i)parse\s*error|failed\s+to\s+parse|\b400\b",
                ErrorKind::Validation,
                "Unparseable input",
            ),
        ]
    }

    /// Determines the kind of an error and its source chain.
    pub fn detect(&self, error: &(dyn Error + 'static)) -> ErrorKind {
        let chain: Vec<&(dyn Error + 'static)> = chain(error).collect();

        for matcher in &self.matchers {
            if let Some(kind) = chain.iter().find_map(|e| matcher(*e)) {
                return kind;
            }
        }
        if let Some(kind) = chain.iter().find_map(|e| typed_kind(*e)) {
            return kind;
        }
        chain
            .iter()
            .find_map(|e| self.detect_message(&e.to_string()))
            .unwrap_or(ErrorKind::Unknown)
    }

    /// Matches text against the message patterns only.
    pub fn detect_message(&self, text: &str) -> Option<ErrorKind> {
        self.patterns
            .iter()
            .find(|pattern| pattern.matches(text))
            .map(ErrorPattern::kind)
    }
}

/// Iterates an error and its sources, outermost first.
pub fn chain<'a>(error: &'a (dyn Error + 'static)) -> impl Iterator<Item = &'a (dyn Error + 'static)> {
    std::iter::successors(Some(error), |e| (*e).source())
}

/// Renders an error and its sources as `outer: inner: root`.
pub fn chain_message(error: &(dyn Error + 'static)) -> String {
    let mut message = String::new();
    for (i, e) in chain(error).enumerate() {
        let text = e.to_string();
        // wrapper errors often repeat their source's text
        if i > 0 && message.contains(&text) {
            continue;
        }
        if !message.is_empty() {
            message.push_str(": ");
        }
        message.push_str(&text);
    }
    message
}

fn typed_kind(error: &(dyn Error + 'static)) -> Option<ErrorKind> {
    if let Some(e) = error.downcast_ref::<io::Error>() {
        return io_kind(e.kind());
    }
    if error.is::<serde_json::Error>() || error.is::<::config::ConfigError>() {
        return Some(ErrorKind::Validation);
    }
    if error.is::<tokio::time::error::Elapsed>() {
        return Some(ErrorKind::Transient);
    }
    if let Some(e) = error.downcast_ref::<LifecycleError>() {
        return e.error_kind();
    }
    if let Some(e) = error.downcast_ref::<ResourceError>() {
        return e.error_kind();
    }
    if let Some(e) = error.downcast_ref::<DatabaseError>() {
        return e.error_kind();
    }
    if let Some(e) = error.downcast_ref::<ConfigError>() {
        return e.error_kind();
    }
    if let Some(e) = error.downcast_ref::<SecretError>() {
        return e.error_kind();
    }
    if let Some(e) = error.downcast_ref::<RouterError>() {
        return e.error_kind();
    }
    if let Some(e) = error.downcast_ref::<PolicyError>() {
        return e.error_kind();
    }
    None
}

fn io_kind(kind: io::ErrorKind) -> Option<ErrorKind> {
    use io::ErrorKind as Io;
    match kind {
        Io::ConnectionRefused
        | Io::ConnectionReset
        | Io::ConnectionAborted
        | Io::NotConnected
        | Io::BrokenPipe
        | Io::TimedOut
        | Io::Interrupted
        | Io::WouldBlock
        | Io::UnexpectedEof => Some(ErrorKind::Transient),
        Io::AddrInUse | Io::AddrNotAvailable | Io::OutOfMemory => {
            Some(ErrorKind::ResourceExhaustion)
        }
        Io::PermissionDenied => Some(ErrorKind::Permission),
        Io::InvalidInput | Io::InvalidData | Io::NotFound | Io::AlreadyExists => {
            Some(ErrorKind::Validation)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("ingest failed")]
    struct Wrapper(#[source] io::Error);

    #[derive(Debug, thiserror::Error)]
    #[error("{0}")]
    struct Opaque(String);

    fn detect(error: &(dyn Error + 'static)) -> ErrorKind {
        ErrorDetector::new().detect(error)
    }

    #[test]
    fn test_io_kinds() {
        let timeout = io::Error::new(io::ErrorKind::TimedOut, "slow");
        assert_eq!(detect(&timeout), ErrorKind::Transient);

        let denied = io::Error::new(io::ErrorKind::PermissionDenied, "nope");
        assert_eq!(detect(&denied), ErrorKind::Permission);

        let missing = io::Error::new(io::ErrorKind::NotFound, "event.json");
        assert_eq!(detect(&missing), ErrorKind::Validation);
    }

    #[test]
    fn test_walks_source_chain() {
        let err = Wrapper(io::Error::new(io::ErrorKind::ConnectionReset, "peer"));
        assert_eq!(detect(&err), ErrorKind::Transient);
    }

    #[test]
    fn test_chain_outlives_iterator() {
        let err = Wrapper(io::Error::new(io::ErrorKind::Other, "disk full"));
        let links: Vec<&(dyn Error + 'static)> = chain(&err).collect();

        assert_eq!(links.len(), 2);
        assert_eq!(links[0].to_string(), "ingest failed");
        assert!(links[1].is::<io::Error>());
    }

    #[test]
    fn test_serde_json_error_is_validation() {
        let err = serde_json::from_str::<serde_json::Value>("{oops").unwrap_err();
        assert_eq!(detect(&err), ErrorKind::Validation);
    }

    #[test]
    fn test_message_patterns() {
        let cases = [
            ("remaining connection slots reserved: too many connections", ErrorKind::ResourceExhaustion),
            ("upstream returned 429", ErrorKind::ResourceExhaustion),
            ("request timed out after 30s", ErrorKind::Transient),
            ("connection refused by host", ErrorKind::Transient),
            ("Service Unavailable", ErrorKind::Transient),
            ("invalid api token", ErrorKind::Permission),
            ("User is unauthorized", ErrorKind::Permission),
            ("invalid email address", ErrorKind::Validation),
            ("missing required field `id`", ErrorKind::Validation),
            ("the flux capacitor melted", ErrorKind::Unknown),
        ];
        for (message, expected) in cases {
            assert_eq!(
                detect(&Opaque(message.to_string())),
                expected,
                "message: {message}"
            );
        }
    }

    #[test]
    fn test_custom_matcher_takes_priority() {
        let detector = ErrorDetector::new().with_matcher(|e| {
            e.downcast_ref::<Opaque>()
                .filter(|o| o.0.starts_with("E-LOCK"))
                .map(|_| ErrorKind::Transient)
        });

        assert_eq!(
            detector.detect(&Opaque("E-LOCK invalid row".to_string())),
            ErrorKind::Transient
        );
        assert_eq!(
            detector.detect(&Opaque("invalid row".to_string())),
            ErrorKind::Validation
        );
    }

    #[test]
    fn test_custom_patterns_only() {
        let detector = ErrorDetector::with_patterns(vec![ErrorPattern::new(
            r"(?i)deadlock",
            ErrorKind::Transient,
            "Deadlock",
        )]);

        assert_eq!(detector.patterns().len(), 1);
        assert_eq!(detector.detect_message("deadlock detected"), Some(ErrorKind::Transient));
        assert_eq!(detector.detect_message("invalid input"), None);
    }

    #[test]
    fn test_try_new_rejects_bad_regex() {
        assert!(ErrorPattern::try_new("(unclosed", ErrorKind::Unknown, "bad").is_err());
    }

    #[test]
    fn test_chain_message_skips_repeated_text() {
        let err = Wrapper(io::Error::new(io::ErrorKind::Other, "disk full"));
        assert_eq!(chain_message(&err), "ingest failed: disk full");
    }
}
