//! Handler lifecycle management.
//!
//! This module owns the process-wide cleanup registry, the termination
//! signal bridge that drains it, and the invocation adapter that drains it
//! after every call.

pub mod invocation;
pub mod registry;
pub mod signals;

use std::sync::{Arc, OnceLock};

use thiserror::Error;

use crate::error::{Classify, ErrorKind};

pub use invocation::{
    serve, FnHandler, Invocation, InvocationAdapter, RequestContext, SyncHandler,
};
pub use registry::{
    CleanupError, CleanupFailure, CleanupHandler, CleanupRegistry, DrainReport, ReleaseOrder,
};
pub use signals::SignalBridge;

/// Errors raised by the lifecycle machinery itself.
#[derive(Error, Debug)]
pub enum LifecycleError {
    /// The sync entry point was called from inside an async runtime.
    #[error("cannot start an invocation from inside an async runtime")]
    NestedRuntime,

    /// The per-invocation runtime could not be created.
    #[error("failed to build invocation runtime: {0}")]
    Runtime(#[from] std::io::Error),

    /// One or more cleanup handlers failed during a drain.
    #[error("{failed} of {executed} cleanup handlers failed; first: {first}")]
    CleanupFailed {
        failed: usize,
        executed: usize,
        first: String,
    },

    /// The termination signal handler could not be installed.
    #[error("failed to install signal handler: {0}")]
    SignalInstall(String),
}

impl Classify for LifecycleError {
    fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            LifecycleError::NestedRuntime | LifecycleError::SignalInstall(_) => {
                Some(ErrorKind::Validation)
            }
            LifecycleError::Runtime(_) => Some(ErrorKind::ResourceExhaustion),
            LifecycleError::CleanupFailed { .. } => None,
        }
    }
}

static REGISTRY: OnceLock<Arc<CleanupRegistry>> = OnceLock::new();
static BRIDGE: OnceLock<Arc<SignalBridge>> = OnceLock::new();

/// The process-wide cleanup registry.
pub fn registry() -> Arc<CleanupRegistry> {
    Arc::clone(REGISTRY.get_or_init(|| Arc::new(CleanupRegistry::new())))
}

/// Registers a handler with the process-wide registry.
pub fn register_cleanup(handler: CleanupHandler) {
    registry().register(handler);
}

/// Drains the process-wide registry.
pub fn drain() -> DrainReport {
    registry().drain()
}

/// The signal bridge bound to the process-wide registry.
pub fn signal_bridge() -> Arc<SignalBridge> {
    Arc::clone(BRIDGE.get_or_init(|| Arc::new(SignalBridge::new(registry()))))
}

/// Wraps an async handler for the synchronous runtime boundary.
///
/// The returned adapter drains the process-wide registry after every call
/// and installs the termination signal bridge on its first invocation.
///
/// ```no_run
/// use async_lambda_harness::lifecycle::{lambda_handler, Invocation, SyncHandler};
/// use serde_json::{json, Value};
///
/// async fn handler(inv: Invocation, _: ()) -> Result<Value, lambda_runtime::Error> {
///     Ok(json!({ "statusCode": 200, "body": inv.event() }))
/// }
///
/// let entry = lambda_handler(handler);
/// let response = entry.call(json!({}), lambda_runtime::Context::default());
/// ```
pub fn lambda_handler<H>(handler: H) -> InvocationAdapter<H> {
    InvocationAdapter::new(handler, registry()).with_signal_bridge(signal_bridge())
}
