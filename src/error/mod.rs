//! Error classification and retry verdicts.
//!
//! Errors are sorted into a closed [`ErrorKind`] taxonomy by the
//! [`ErrorDetector`], and the [`ErrorClassifier`] turns that kind plus the
//! attempt number into an [`ErrorClassification`].

pub mod classification;
pub mod classifier;
pub mod detector;

pub use classification::{
    error_context, should_retry, Classify, ErrorClassification, ErrorContext, ErrorKind, Severity,
};
pub use classifier::{CriticalError, ErrorClassifier, ErrorLedger, ErrorSummary};
pub use detector::{chain_message, ErrorDetector, ErrorPattern};
