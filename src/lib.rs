//! Lifecycle, cleanup and error classification for async AWS Lambda handlers.
//!
//! The Lambda runtime calls a synchronous `(event, context) -> result`
//! function. This crate adapts async handlers to that boundary:
//!
//! - [`lifecycle`] runs each invocation on its own runtime and drains the
//!   cleanup registry before returning, including on SIGINT/SIGTERM.
//! - [`inject`] acquires per-invocation resources (settings, database
//!   sessions) and registers their release.
//! - [`error`] classifies failures into retry verdicts under a
//!   [`retry::RetryPolicy`].
//! - [`router`] dispatches one deployed binary to several functions.

pub mod config;
pub mod error;
pub mod inject;
pub mod lifecycle;
pub mod logging;
pub mod retry;
pub mod router;

pub use error::{should_retry, ErrorClassification, ErrorClassifier, ErrorKind};
pub use lifecycle::{lambda_handler, Invocation, SyncHandler};
