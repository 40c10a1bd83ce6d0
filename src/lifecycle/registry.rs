//! Process-wide registry of deferred release callbacks.
//!
//! Resources acquired during an invocation register a [`CleanupHandler`]
//! here. A drain takes every pending handler out of the registry under the
//! lock, then runs them with the lock released, so a handler is executed by
//! exactly one drainer even when a signal-triggered drain races the
//! invocation's own drain. Drains in flight are counted so a signal handler
//! can wait for handlers another drainer already took.

use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Deserialize;

use super::LifecycleError;

/// Error type returned by cleanup callbacks.
pub type CleanupError = Box<dyn std::error::Error + Send + Sync>;

type SyncAction = Box<dyn FnOnce() -> Result<(), CleanupError> + Send>;
type AsyncAction = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), CleanupError>> + Send>;

enum Action {
    Sync(SyncAction),
    Async(AsyncAction),
}

/// A labelled, run-once release callback.
pub struct CleanupHandler {
    label: String,
    action: Action,
}

impl CleanupHandler {
    /// Creates a handler from a synchronous closure.
    pub fn sync<F>(label: impl Into<String>, action: F) -> Self
    where
        F: FnOnce() -> Result<(), CleanupError> + Send + 'static,
    {
        Self {
            label: label.into(),
            action: Action::Sync(Box::new(action)),
        }
    }

    /// Creates a handler from a closure producing a future.
    ///
    /// The closure is not called until the registry is drained.
    pub fn future<F, Fut>(label: impl Into<String>, action: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), CleanupError>> + Send + 'static,
    {
        Self {
            label: label.into(),
            action: Action::Async(Box::new(move || action().boxed())),
        }
    }

    /// Returns the handler label.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Returns true if the handler must be awaited.
    pub fn is_async(&self) -> bool {
        matches!(self.action, Action::Async(_))
    }

    async fn run(self) -> Result<(), String> {
        match self.action {
            Action::Sync(action) => match panic::catch_unwind(AssertUnwindSafe(action)) {
                Ok(result) => result.map_err(|e| e.to_string()),
                Err(payload) => Err(panic_message(payload.as_ref())),
            },
            Action::Async(action) => {
                let future = match panic::catch_unwind(AssertUnwindSafe(action)) {
                    Ok(future) => future,
                    Err(payload) => return Err(panic_message(payload.as_ref())),
                };
                match AssertUnwindSafe(future).catch_unwind().await {
                    Ok(result) => result.map_err(|e| e.to_string()),
                    Err(payload) => Err(panic_message(payload.as_ref())),
                }
            }
        }
    }

    fn run_sync_only(self) -> Result<(), String> {
        match self.action {
            Action::Sync(action) => match panic::catch_unwind(AssertUnwindSafe(action)) {
                Ok(result) => result.map_err(|e| e.to_string()),
                Err(payload) => Err(panic_message(payload.as_ref())),
            },
            Action::Async(_) => Err("no runtime available to await async cleanup".to_string()),
        }
    }
}

impl fmt::Debug for CleanupHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CleanupHandler")
            .field("label", &self.label)
            .field("async", &self.is_async())
            .finish()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panicked: {message}")
    } else {
        "panicked".to_string()
    }
}

/// Order in which a drain releases registered handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReleaseOrder {
    /// First registered, first released.
    #[default]
    Registration,
    /// Last registered, first released.
    Reverse,
}

/// A cleanup handler that failed during a drain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupFailure {
    /// Label of the failing handler.
    pub label: String,
    /// Zero-based registration position of the handler.
    pub position: usize,
    /// Error or panic message.
    pub message: String,
}

impl fmt::Display for CleanupFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cleanup '{}' failed: {}", self.label, self.message)
    }
}

/// Outcome of a drain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Number of handlers executed, successful or not.
    pub executed: usize,
    /// Handlers that returned an error or panicked.
    pub failures: Vec<CleanupFailure>,
}

impl DrainReport {
    /// Returns true if no handler failed.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Converts the report into an error if any handler failed.
    pub fn into_result(self) -> Result<usize, LifecycleError> {
        match self.failures.first() {
            None => Ok(self.executed),
            Some(first) => Err(LifecycleError::CleanupFailed {
                failed: self.failures.len(),
                executed: self.executed,
                first: first.to_string(),
            }),
        }
    }

    fn record(&mut self, position: usize, label: String, outcome: Result<(), String>) {
        self.executed += 1;
        if let Err(message) = outcome {
            tracing::error!(cleanup = %label, position, error = %message, "cleanup handler failed");
            self.failures.push(CleanupFailure {
                label,
                position,
                message,
            });
        }
    }
}

#[derive(Debug, Default)]
struct State {
    pending: Vec<CleanupHandler>,
    /// Threads with a drain in flight, one entry per drain.
    draining: Vec<ThreadId>,
}

/// Marks one drain as running until dropped.
struct InFlight<'a> {
    registry: &'a CleanupRegistry,
    owner: ThreadId,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut state = self.registry.lock();
        if let Some(i) = state.draining.iter().position(|id| *id == self.owner) {
            state.draining.swap_remove(i);
        }
        self.registry.idle.notify_all();
    }
}

type Taken<'a> = (Vec<(usize, CleanupHandler)>, InFlight<'a>);

/// Ordered collection of pending cleanup handlers.
#[derive(Debug, Default)]
pub struct CleanupRegistry {
    state: Mutex<State>,
    idle: Condvar,
    order: ReleaseOrder,
}

impl CleanupRegistry {
    /// Creates an empty registry releasing in registration order.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty registry with the given release order.
    pub fn with_order(order: ReleaseOrder) -> Self {
        Self {
            order,
            ..Self::default()
        }
    }

    /// Returns the release order.
    pub fn order(&self) -> ReleaseOrder {
        self.order
    }

    /// Appends a handler. Repeated registrations all run.
    pub fn register(&self, handler: CleanupHandler) {
        tracing::trace!(cleanup = %handler.label, "registered cleanup handler");
        self.lock().pending.push(handler);
    }

    /// Number of pending handlers.
    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    /// Returns true if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.lock().pending.is_empty()
    }

    /// Returns true while any drain is still running its handlers.
    pub fn is_draining(&self) -> bool {
        !self.lock().draining.is_empty()
    }

    /// Blocks until every drain started by another thread has finished.
    ///
    /// Drains started by the calling thread are not waited for, so a
    /// handler that triggers this cannot wait on itself.
    pub fn wait_idle(&self) {
        let current = thread::current().id();
        let mut state = self.lock();
        while state.draining.iter().any(|id| *id != current) {
            state = self.idle.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Executes and removes every pending handler, awaiting async ones on
    /// the caller's runtime.
    pub async fn drain_async(&self) -> DrainReport {
        match self.take() {
            Some((handlers, _in_flight)) => run_all(handlers).await,
            None => DrainReport::default(),
        }
    }

    /// Executes and removes every pending handler, blocking the current
    /// thread until async handlers complete.
    ///
    /// Safe to call from inside a tokio runtime context: the drain then
    /// runs on a scoped helper thread.
    pub fn drain(&self) -> DrainReport {
        let Some((handlers, _in_flight)) = self.take() else {
            return DrainReport::default();
        };
        if tokio::runtime::Handle::try_current().is_err() {
            return run_blocking(handlers);
        }
        thread::scope(|scope| match scope.spawn(|| run_blocking(handlers)).join() {
            Ok(report) => report,
            Err(_) => {
                tracing::error!("cleanup drain thread panicked");
                DrainReport::default()
            }
        })
    }

    /// Removes all pending handlers, returning them in release order with
    /// their registration positions. The drain counts as in flight until
    /// the returned guard drops.
    fn take(&self) -> Option<Taken<'_>> {
        let owner = thread::current().id();
        let handlers = {
            let mut state = self.lock();
            if state.pending.is_empty() {
                return None;
            }
            state.draining.push(owner);
            std::mem::take(&mut state.pending)
        };
        let in_flight = InFlight {
            registry: self,
            owner,
        };
        let indexed = handlers.into_iter().enumerate();
        let handlers = match self.order {
            ReleaseOrder::Registration => indexed.collect(),
            ReleaseOrder::Reverse => indexed.rev().collect(),
        };
        Some((handlers, in_flight))
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A panicking registrant must not stop later drains.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn run_all(handlers: Vec<(usize, CleanupHandler)>) -> DrainReport {
    let mut report = DrainReport::default();
    for (position, handler) in handlers {
        let label = handler.label.clone();
        let outcome = handler.run().await;
        report.record(position, label, outcome);
    }
    report
}

fn run_blocking(handlers: Vec<(usize, CleanupHandler)>) -> DrainReport {
    if !handlers.iter().any(|(_, handler)| handler.is_async()) {
        let mut report = DrainReport::default();
        for (position, handler) in handlers {
            let label = handler.label.clone();
            let outcome = handler.run_sync_only();
            report.record(position, label, outcome);
        }
        return report;
    }

    match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime.block_on(run_all(handlers)),
        Err(e) => {
            tracing::error!(error = %e, "failed to build cleanup runtime; async handlers will not run");
            let mut report = DrainReport::default();
            for (position, handler) in handlers {
                let label = handler.label.clone();
                let outcome = handler.run_sync_only();
                report.record(position, label, outcome);
            }
            report
        }
    }
}
