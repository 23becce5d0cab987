//! Process-level cancellation.
//!
//! A [`SignalRegistry`] is created by the process entry point and passed to
//! every component that needs it. Components bracket multi-file writes with
//! [`SignalRegistry::critical_section`] and register cleanup callbacks.
//! On shutdown the registry:
//! 1. blocks new critical sections,
//! 2. waits for in-flight ones to finish,
//! 3. runs every cleanup callback concurrently, bounded by a timeout.

use futures::future::{join_all, BoxFuture};
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::{info, warn};

/// Why the process is exiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The run finished; the exit code reflects success.
    Completed,
    /// The run stopped because of a failure.
    Fault,
    /// A termination signal was received.
    Interrupted(i32),
}

impl ExitReason {
    /// Process exit code for this reason.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Completed => 0,
            Self::Fault => 1,
            Self::Interrupted(signal) => 128 + signal,
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Fault => write!(f, "fault"),
            Self::Interrupted(signal) => write!(f, "interrupted by signal {signal}"),
        }
    }
}

type CleanupFn = Box<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

struct Cleanup {
    name: String,
    callback: CleanupFn,
}

/// Guard held while a critical section runs.
#[derive(Debug)]
pub struct CriticalSection {
    _guard: OwnedRwLockReadGuard<()>,
}

/// Explicitly owned registry of cleanup callbacks and critical sections.
pub struct SignalRegistry {
    lock: Arc<RwLock<()>>,
    shutdown_guard: Mutex<Option<OwnedRwLockWriteGuard<()>>>,
    cleanups: Mutex<Vec<Cleanup>>,
    shutting_down: AtomicBool,
    cleanup_timeout: Duration,
}

impl Default for SignalRegistry {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl fmt::Debug for SignalRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalRegistry")
            .field("cleanups", &self.cleanups.lock().len())
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}

impl SignalRegistry {
    /// Creates a registry whose cleanups share `cleanup_timeout`.
    #[must_use]
    pub fn new(cleanup_timeout: Duration) -> Self {
        Self {
            lock: Arc::new(RwLock::new(())),
            shutdown_guard: Mutex::new(None),
            cleanups: Mutex::new(Vec::new()),
            shutting_down: AtomicBool::new(false),
            cleanup_timeout,
        }
    }

    /// Enters a critical section; waits forever once shutdown started.
    pub async fn critical_section(&self) -> CriticalSection {
        CriticalSection {
            _guard: Arc::clone(&self.lock).read_owned().await,
        }
    }

    /// Registers a cleanup callback.
    pub fn register<F, Fut>(&self, name: impl Into<String>, callback: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.cleanups.lock().push(Cleanup {
            name: name.into(),
            callback: Box::new(move || Box::pin(callback())),
        });
    }

    /// Removes a callback by name. Returns true if one was removed.
    pub fn unregister(&self, name: &str) -> bool {
        let mut cleanups = self.cleanups.lock();
        let before = cleanups.len();
        cleanups.retain(|c| c.name != name);
        cleanups.len() < before
    }

    /// Returns true once shutdown started.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Shuts down and returns the exit code for `reason`.
    ///
    /// Only the first call runs the cleanups.
    pub async fn shutdown(&self, reason: ExitReason) -> i32 {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return reason.exit_code();
        }
        info!(reason = %reason, "shutting down");
        let guard = Arc::clone(&self.lock).write_owned().await;
        *self.shutdown_guard.lock() = Some(guard);

        let cleanups: Vec<Cleanup> = std::mem::take(&mut *self.cleanups.lock());
        let timeout = self.cleanup_timeout;
        let runs = cleanups.iter().map(|cleanup| async move {
            if tokio::time::timeout(timeout, (cleanup.callback)()).await.is_err() {
                warn!(cleanup = %cleanup.name, "cleanup timed out");
            }
        });
        join_all(runs).await;
        reason.exit_code()
    }

    /// Waits for SIGINT, SIGHUP, SIGTERM, SIGUSR1 or SIGUSR2.
    pub async fn wait_for_signal() -> std::io::Result<ExitReason> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut int = signal(SignalKind::interrupt())?;
        let mut hup = signal(SignalKind::hangup())?;
        let mut term = signal(SignalKind::terminate())?;
        let mut usr1 = signal(SignalKind::user_defined1())?;
        let mut usr2 = signal(SignalKind::user_defined2())?;
        let signo = tokio::select! {
            _ = int.recv() => libc::SIGINT,
            _ = hup.recv() => libc::SIGHUP,
            _ = term.recv() => libc::SIGTERM,
            _ = usr1.recv() => libc::SIGUSR1,
            _ = usr2.recv() => libc::SIGUSR2,
        };
        Ok(ExitReason::Interrupted(signo))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_exit_codes() {
        assert_eq!(ExitReason::Completed.exit_code(), 0);
        assert_eq!(ExitReason::Fault.exit_code(), 1);
        assert_eq!(ExitReason::Interrupted(15).exit_code(), 143);
    }

    #[tokio::test]
    async fn test_shutdown_runs_cleanups_once() {
        let registry = SignalRegistry::new(Duration::from_secs(1));
        let calls = Arc::new(AtomicUsize::new(0));
        for name in ["a", "b"] {
            let calls = Arc::clone(&calls);
            registry.register(name, move || {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                }
            });
        }
        assert_eq!(registry.shutdown(ExitReason::Fault).await, 1);
        assert_eq!(registry.shutdown(ExitReason::Fault).await, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(registry.is_shutting_down());
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_critical_section() {
        let registry = Arc::new(SignalRegistry::new(Duration::from_secs(1)));
        let finished = Arc::new(AtomicBool::new(false));
        let section = registry.critical_section().await;

        let flag = Arc::clone(&finished);
        let holder = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            flag.store(true, Ordering::SeqCst);
            drop(section);
        });

        registry.shutdown(ExitReason::Completed).await;
        assert!(finished.load(Ordering::SeqCst));
        holder.await.unwrap();
    }

    #[tokio::test]
    async fn test_cleanup_timeout_does_not_block() {
        let registry = SignalRegistry::new(Duration::from_millis(20));
        registry.register("slow", || tokio::time::sleep(Duration::from_secs(30)));
        let code = tokio::time::timeout(
            Duration::from_secs(5),
            registry.shutdown(ExitReason::Interrupted(2)),
        )
        .await
        .unwrap();
        assert_eq!(code, 130);
    }

    #[test]
    fn test_no_critical_section_after_shutdown() {
        let registry = SignalRegistry::default();
        tokio_test::block_on(registry.shutdown(ExitReason::Fault));
        let mut section = tokio_test::task::spawn(registry.critical_section());
        tokio_test::assert_pending!(section.poll());
    }

    #[test]
    fn test_unregister() {
        let registry = SignalRegistry::default();
        registry.register("x", || async {});
        assert!(registry.unregister("x"));
        assert!(!registry.unregister("x"));
    }
}
