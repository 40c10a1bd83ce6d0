//! Synchronous runtime boundary for async handlers.
//!
//! [`InvocationAdapter`] turns an async handler into the `(event, context)
//! -> result` call the runtime expects. Each call gets its own
//! current-thread tokio runtime, and the cleanup registry is drained on that
//! runtime before the result or error is handed back.

use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Once};

use futures::FutureExt;
use lambda_runtime::{service_fn, Context, LambdaEvent};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::Instrument;

use super::registry::{CleanupHandler, CleanupRegistry};
use super::signals::SignalBridge;
use super::LifecycleError;
use crate::error::ErrorClassifier;

/// Runtime contexts that carry a request id for log correlation.
pub trait RequestContext {
    fn request_id(&self) -> Option<&str> {
        None
    }
}

impl RequestContext for Context {
    fn request_id(&self) -> Option<&str> {
        Some(&self.request_id)
    }
}

impl RequestContext for () {}

/// The per-invocation view passed to handlers and resource factories.
///
/// Holds the runtime payload and context unchanged, plus the registry that
/// resources acquired for this invocation must register their release with.
pub struct Invocation<P = serde_json::Value, C = Context> {
    event: P,
    context: C,
    registry: Arc<CleanupRegistry>,
}

impl<P, C> Invocation<P, C> {
    /// Creates an invocation bound to a cleanup registry.
    pub fn new(event: P, context: C, registry: Arc<CleanupRegistry>) -> Self {
        Self {
            event,
            context,
            registry,
        }
    }

    /// The event payload.
    pub fn event(&self) -> &P {
        &self.event
    }

    /// The runtime context.
    pub fn context(&self) -> &C {
        &self.context
    }

    /// Registry that drains when this invocation finishes.
    pub fn registry(&self) -> &Arc<CleanupRegistry> {
        &self.registry
    }

    /// Defers a release until the invocation's final drain.
    pub fn register_cleanup(&self, handler: CleanupHandler) {
        self.registry.register(handler);
    }

    /// Splits the invocation into payload and context.
    pub fn into_parts(self) -> (P, C) {
        (self.event, self.context)
    }
}

impl<P: fmt::Debug, C: fmt::Debug> fmt::Debug for Invocation<P, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invocation")
            .field("event", &self.event)
            .field("context", &self.context)
            .field("pending_cleanup", &self.registry.len())
            .finish()
    }
}

/// A synchronous `(event, context) -> result` entry point.
pub trait SyncHandler<P, C>: Send + Sync {
    /// Successful response type.
    type Output;
    /// Error surfaced to the runtime.
    type Error;

    /// Handles one invocation.
    fn call(&self, event: P, context: C) -> Result<Self::Output, Self::Error>;
}

/// Wraps a plain closure as a [`SyncHandler`].
pub struct FnHandler<F>(pub F);

impl<F, P, C, T, E> SyncHandler<P, C> for FnHandler<F>
where
    F: Fn(P, C) -> Result<T, E> + Send + Sync,
{
    type Output = T;
    type Error = E;

    fn call(&self, event: P, context: C) -> Result<T, E> {
        (self.0)(event, context)
    }
}

/// Lifecycle-owning wrapper around an async handler.
///
/// The wrapped handler receives the [`Invocation`] and the (empty) resource
/// list `()`; resource decorators narrow richer handlers down to this shape.
pub struct InvocationAdapter<H> {
    handler: H,
    registry: Arc<CleanupRegistry>,
    signals: Option<Arc<SignalBridge>>,
    classifier: Option<Arc<ErrorClassifier>>,
    install: Once,
}

impl<H> InvocationAdapter<H> {
    /// Creates an adapter draining the given registry. No signal handler is
    /// installed.
    pub fn new(handler: H, registry: Arc<CleanupRegistry>) -> Self {
        Self {
            handler,
            registry,
            signals: None,
            classifier: None,
            install: Once::new(),
        }
    }

    /// Installs the bridge's signal handler on the first invocation.
    pub fn with_signal_bridge(mut self, bridge: Arc<SignalBridge>) -> Self {
        self.signals = Some(bridge);
        self
    }

    /// Classifies handler failures in the error log.
    pub fn with_classifier(mut self, classifier: Arc<ErrorClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Registry drained after every invocation.
    pub fn registry(&self) -> &Arc<CleanupRegistry> {
        &self.registry
    }

    fn ensure_signals(&self) {
        if let Some(bridge) = &self.signals {
            self.install.call_once(|| {
                if let Err(e) = bridge.install() {
                    tracing::warn!(error = %e, "continuing without termination signal cleanup");
                }
            });
        }
    }
}

impl<H, P, C, Fut, T, E> SyncHandler<P, C> for InvocationAdapter<H>
where
    H: Fn(Invocation<P, C>, ()) -> Fut + Send + Sync,
    Fut: Future<Output = Result<T, E>>,
    C: RequestContext,
    E: From<LifecycleError> + fmt::Display + 'static,
{
    type Output = T;
    type Error = E;

    fn call(&self, event: P, context: C) -> Result<T, E> {
        if tokio::runtime::Handle::try_current().is_ok() {
            return Err(LifecycleError::NestedRuntime.into());
        }
        self.ensure_signals();

        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                self.registry.drain();
                return Err(LifecycleError::Runtime(e).into());
            }
        };

        let span = tracing::info_span!(
            "invocation",
            request_id = context.request_id().unwrap_or("-")
        );
        let invocation = Invocation::new(event, context, Arc::clone(&self.registry));
        let outcome = runtime.block_on(
            AssertUnwindSafe((self.handler)(invocation, ()))
                .catch_unwind()
                .instrument(span.clone()),
        );

        let report = runtime.block_on(self.registry.drain_async().instrument(span.clone()));
        let _entered = span.enter();
        if !report.is_clean() {
            tracing::error!(
                failed = report.failures.len(),
                executed = report.executed,
                "cleanup after invocation reported failures"
            );
        } else if report.executed > 0 {
            tracing::debug!(executed = report.executed, "released invocation resources");
        }

        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                match &self.classifier {
                    Some(classifier) => {
                        let verdict = classifier.classify_value(&e, None, 1);
                        tracing::error!(
                            error = %e,
                            kind = %verdict.kind,
                            retryable = verdict.is_retryable,
                            "handler failed"
                        );
                    }
                    None => tracing::error!(error = %e, "handler failed"),
                }
                Err(e)
            }
            Err(payload) => {
                tracing::error!("handler panicked");
                panic::resume_unwind(payload)
            }
        }
    }
}

/// Runs a [`SyncHandler`] under the Lambda runtime API loop.
///
/// Each event is handled on a plain OS thread outside the Lambda client's
/// runtime, where the handler is free to build its own per-invocation
/// runtime.
pub async fn serve<S, P, T, E>(handler: S) -> Result<(), lambda_runtime::Error>
where
    S: SyncHandler<P, Context, Output = T, Error = E> + 'static,
    P: DeserializeOwned + Send + 'static,
    T: Serialize + Send + 'static,
    E: Into<lambda_runtime::Error> + Send + 'static,
{
    let handler = Arc::new(handler);
    lambda_runtime::run(service_fn(move |event: LambdaEvent<P>| {
        let handler = Arc::clone(&handler);
        async move {
            let LambdaEvent { payload, context } = event;
            let (tx, rx) = tokio::sync::oneshot::channel();
            std::thread::spawn(move || {
                let _ = tx.send(handler.call(payload, context));
            });
            let outcome = rx.await?;
            outcome.map_err(Into::<lambda_runtime::Error>::into)
        }
    }))
    .await
}
