//! Termination signal handling.
//!
//! Bridges SIGINT/SIGTERM to a [`CleanupRegistry`] drain so registered
//! resources are released before the process exits. The OS-level handler is
//! installed at most once per process; `ctrlc` runs it on a dedicated thread,
//! so a drain triggered by a signal never runs inside the interrupted code.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::registry::{CleanupRegistry, DrainReport};
use super::LifecycleError;

/// Set once the OS-level handler has been installed for this process.
static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Drains a cleanup registry when the process is asked to terminate.
#[derive(Debug)]
pub struct SignalBridge {
    registry: Arc<CleanupRegistry>,
    exit_code: i32,
    triggered: AtomicBool,
}

impl SignalBridge {
    /// Creates a bridge for the given registry that exits with status 0.
    pub fn new(registry: Arc<CleanupRegistry>) -> Self {
        Self {
            registry,
            exit_code: 0,
            triggered: AtomicBool::new(false),
        }
    }

    /// Sets the process exit status used after cleanup.
    pub fn with_exit_code(mut self, exit_code: i32) -> Self {
        self.exit_code = exit_code;
        self
    }

    /// Exit status used after cleanup.
    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    /// Returns true once a termination signal has been handled.
    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Returns true if some bridge has been installed in this process.
    pub fn is_installed() -> bool {
        INSTALLED.load(Ordering::SeqCst)
    }

    /// Installs the OS handler for SIGINT and SIGTERM.
    ///
    /// Returns `Ok(false)` without touching the OS handler if one was already
    /// installed by any bridge in this process.
    pub fn install(self: &Arc<Self>) -> Result<bool, LifecycleError> {
        if INSTALLED.swap(true, Ordering::SeqCst) {
            tracing::debug!("signal bridge already installed");
            return Ok(false);
        }

        let bridge = Arc::clone(self);
        ctrlc::set_handler(move || bridge.terminate()).map_err(|e| {
            INSTALLED.store(false, Ordering::SeqCst);
            LifecycleError::SignalInstall(e.to_string())
        })?;

        tracing::debug!("installed termination signal bridge");
        Ok(true)
    }

    /// Runs the cleanup drain for a received signal without exiting.
    ///
    /// Only the first call drains; later calls return `None` so a second
    /// signal arriving mid-drain cannot re-run anything. Handlers already
    /// taken by another drain, such as an invocation's final drain, are not
    /// in the returned report, but this waits for them to finish before
    /// returning.
    pub fn handle_signal(&self) -> Option<DrainReport> {
        if self.triggered.swap(true, Ordering::SeqCst) {
            tracing::debug!("termination already in progress; ignoring signal");
            return None;
        }

        tracing::warn!(
            pending = self.registry.len(),
            "received termination signal, running cleanup"
        );
        let report = self.registry.drain();
        if self.registry.is_draining() {
            tracing::debug!("waiting for in-flight cleanup to finish");
            self.registry.wait_idle();
        }
        if !report.is_clean() {
            tracing::error!(
                failed = report.failures.len(),
                executed = report.executed,
                "cleanup after termination signal reported failures"
            );
        }
        Some(report)
    }

    fn terminate(&self) {
        if self.handle_signal().is_some() {
            std::process::exit(self.exit_code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::CleanupHandler;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_handle_signal_drains_once() {
        let registry = Arc::new(CleanupRegistry::new());
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        registry.register(CleanupHandler::sync("conn", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));
        let bridge = SignalBridge::new(Arc::clone(&registry));

        let first = bridge.handle_signal();
        let second = bridge.handle_signal();

        assert_eq!(first.map(|r| r.executed), Some(1));
        assert!(second.is_none());
        assert!(bridge.is_triggered());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_signals_do_not_repeat_cleanup() {
        let registry = Arc::new(CleanupRegistry::new());
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let counter = Arc::clone(&count);
            registry.register(CleanupHandler::sync("slow", move || {
                std::thread::sleep(Duration::from_millis(10));
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }));
        }
        let bridge = Arc::new(SignalBridge::new(Arc::clone(&registry)));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let bridge = Arc::clone(&bridge);
                std::thread::spawn(move || bridge.handle_signal())
            })
            .collect();
        let reports: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(reports.iter().filter(|r| r.is_some()).count(), 1);
        assert_eq!(count.load(Ordering::SeqCst), 4);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_signal_waits_for_drain_already_running() {
        let registry = Arc::new(CleanupRegistry::new());
        let (started_tx, started_rx) = std::sync::mpsc::channel();
        let count = Arc::new(AtomicUsize::new(0));
        for i in 0..3 {
            let counter = Arc::clone(&count);
            let started = (i == 0).then(|| started_tx.clone());
            registry.register(CleanupHandler::sync("slow", move || {
                if let Some(started) = started {
                    started.send(()).unwrap();
                }
                std::thread::sleep(Duration::from_millis(30));
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }));
        }
        let bridge = SignalBridge::new(Arc::clone(&registry));

        let invocation_drain = {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || registry.drain())
        };
        started_rx.recv().unwrap();

        let report = bridge.handle_signal().unwrap();

        assert_eq!(report.executed, 0);
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert_eq!(invocation_drain.join().unwrap().executed, 3);
    }

    #[test]
    fn test_exit_code_builder() {
        let bridge = SignalBridge::new(Arc::new(CleanupRegistry::new())).with_exit_code(143);
        assert_eq!(bridge.exit_code(), 143);
        assert!(!bridge.is_triggered());
    }

    #[test]
    fn test_install_is_idempotent() {
        let bridge = Arc::new(SignalBridge::new(Arc::new(CleanupRegistry::new())));

        let first = bridge.install();
        let second = bridge.install();

        assert!(first.is_ok());
        assert!(matches!(second, Ok(false)));
        assert!(SignalBridge::is_installed());
    }
}
