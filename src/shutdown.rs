//! Ordered, run-once teardown.
//!
//! Every exit path (window closed, interrupt, startup error, panic, the
//! exit guard dropping) calls [`ShutdownCoordinator::cleanup`]. A one-shot
//! latch makes the first call do the work; the rest return immediately.
//! Steps run in registration order and each one is isolated: an error or a
//! panic in one step is logged and the next step still runs.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::instance_lock::LockHandle;
use crate::supervisor::ServiceHandle;

/// One resource released during shutdown.
pub trait CleanupStep: Send {
    fn name(&self) -> &str;
    fn release(&mut self) -> anyhow::Result<()>;
}

impl CleanupStep for LockHandle {
    fn name(&self) -> &str {
        "instance lock"
    }

    fn release(&mut self) -> anyhow::Result<()> {
        LockHandle::release(self);
        Ok(())
    }
}

/// Stops the service context with a bounded grace period.
pub struct StopService {
    handle: ServiceHandle,
    grace: Duration,
}

impl StopService {
    pub fn new(handle: ServiceHandle, grace: Duration) -> Self {
        Self { handle, grace }
    }
}

impl CleanupStep for StopService {
    fn name(&self) -> &str {
        "service"
    }

    fn release(&mut self) -> anyhow::Result<()> {
        self.handle.stop(self.grace);
        Ok(())
    }
}

#[derive(Default)]
pub struct ShutdownCoordinator {
    cleanup_done: AtomicBool,
    steps: Mutex<Vec<Box<dyn CleanupStep>>>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a resource to release on shutdown. If cleanup already ran, the
    /// step is released right away so nothing outlives the latch.
    pub fn register(&self, step: Box<dyn CleanupStep>) {
        let mut steps = self.steps.lock().unwrap_or_else(|e| e.into_inner());
        // Checked under the lock: cleanup flips the latch while holding it.
        if !self.cleanup_done.load(Ordering::SeqCst) {
            steps.push(step);
            return;
        }
        drop(steps);
        warn!("{} registered after shutdown, releasing now", step.name());
        release_isolated(step);
    }

    pub fn is_done(&self) -> bool {
        self.cleanup_done.load(Ordering::SeqCst)
    }

    /// Release everything once. Returns `true` for the call that did the work.
    ///
    /// The confirmation line is only logged when something was registered.
    pub fn cleanup(&self) -> bool {
        let steps = {
            let mut steps = self.steps.lock().unwrap_or_else(|e| e.into_inner());
            if self
                .cleanup_done
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                None
            } else {
                Some(std::mem::take(&mut *steps))
            }
        };
        let Some(steps) = steps else {
            debug!("Shutdown already handled by another trigger");
            return false;
        };

        if steps.is_empty() {
            debug!("Nothing to clean up");
            return true;
        }
        for step in steps {
            release_isolated(step);
        }

        info!("Cleanup complete");
        true
    }
}

fn release_isolated(mut step: Box<dyn CleanupStep>) {
    let name = step.name().to_string();
    match catch_unwind(AssertUnwindSafe(|| step.release())) {
        Ok(Ok(())) => debug!("Released {}", name),
        Ok(Err(e)) => warn!("Failed to release {}: {:#}", name, e),
        Err(_) => warn!("Releasing {} panicked", name),
    }
}

/// Runs cleanup when dropped, covering exits that skip the normal path.
pub struct ShutdownGuard {
    coordinator: Arc<ShutdownCoordinator>,
}

impl ShutdownGuard {
    pub fn new(coordinator: Arc<ShutdownCoordinator>) -> Self {
        Self { coordinator }
    }
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        use tokio::runtime::{Handle, RuntimeFlavor};

        let on_worker = Handle::try_current()
            .map(|handle| handle.runtime_flavor() == RuntimeFlavor::MultiThread)
            .unwrap_or(false);
        if on_worker {
            tokio::task::block_in_place(|| self.coordinator.cleanup());
        } else {
            self.coordinator.cleanup();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance_lock::InstanceLock;
    use crate::test_support::{free_port, CapturedLogs};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;

    struct Counting(Arc<AtomicUsize>);

    impl CleanupStep for Counting {
        fn name(&self) -> &str {
            "counter"
        }

        fn release(&mut self) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Failing;

    impl CleanupStep for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn release(&mut self) -> anyhow::Result<()> {
            anyhow::bail!("socket already gone")
        }
    }

    struct Panicking;

    impl CleanupStep for Panicking {
        fn name(&self) -> &str {
            "panicking"
        }

        fn release(&mut self) -> anyhow::Result<()> {
            panic!("release blew up")
        }
    }

    #[test]
    fn test_cleanup_runs_once_for_many_calls() {
        let count = Arc::new(AtomicUsize::new(0));
        let coordinator = ShutdownCoordinator::new();
        coordinator.register(Box::new(Counting(count.clone())));

        assert!(coordinator.cleanup());
        for _ in 0..4 {
            assert!(!coordinator.cleanup());
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(coordinator.is_done());
    }

    #[test]
    fn test_concurrent_triggers_release_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let coordinator = Arc::new(ShutdownCoordinator::new());
        coordinator.register(Box::new(Counting(count.clone())));

        let barrier = Arc::new(Barrier::new(8));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let coordinator = coordinator.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    coordinator.cleanup()
                })
            })
            .collect();

        let winners = threads
            .into_iter()
            .map(|t| t.join().expect("cleanup must not panic"))
            .filter(|did_work| *did_work)
            .count();
        assert_eq!(winners, 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failing_steps_do_not_block_later_ones() {
        let count = Arc::new(AtomicUsize::new(0));
        let coordinator = ShutdownCoordinator::new();
        coordinator.register(Box::new(Failing));
        coordinator.register(Box::new(Panicking));
        coordinator.register(Box::new(Counting(count.clone())));

        assert!(coordinator.cleanup());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cleanup_releases_instance_lock() {
        let lock = InstanceLock::new(std::net::SocketAddr::from(([127, 0, 0, 1], free_port())));
        let coordinator = ShutdownCoordinator::new();
        coordinator.register(Box::new(lock.acquire().expect("acquire")));
        assert!(lock.acquire().is_err());

        coordinator.cleanup();
        coordinator.cleanup();
        assert!(lock.acquire().is_ok());
    }

    #[test]
    fn test_confirmation_logged_once() {
        let logs = CapturedLogs::default();
        let _guard = tracing::subscriber::set_default(logs.subscriber());

        let coordinator = ShutdownCoordinator::new();
        coordinator.register(Box::new(Counting(Arc::new(AtomicUsize::new(0)))));
        coordinator.cleanup();
        coordinator.cleanup();
        coordinator.cleanup();
        assert_eq!(logs.count("Cleanup complete"), 1);
    }

    #[test]
    fn test_nothing_registered_logs_no_confirmation() {
        let logs = CapturedLogs::default();
        let _guard = tracing::subscriber::set_default(logs.subscriber());

        let coordinator = Arc::new(ShutdownCoordinator::new());
        drop(ShutdownGuard::new(coordinator.clone()));
        assert!(coordinator.is_done());
        assert_eq!(logs.count("Cleanup complete"), 0);
    }

    #[test]
    fn test_registration_racing_cleanup_is_always_released() {
        for _ in 0..50 {
            let count = Arc::new(AtomicUsize::new(0));
            let coordinator = Arc::new(ShutdownCoordinator::new());
            let barrier = Arc::new(Barrier::new(5));

            let registrars: Vec<_> = (0..4)
                .map(|_| {
                    let coordinator = coordinator.clone();
                    let barrier = barrier.clone();
                    let count = count.clone();
                    std::thread::spawn(move || {
                        barrier.wait();
                        for _ in 0..10 {
                            coordinator.register(Box::new(Counting(count.clone())));
                        }
                    })
                })
                .collect();

            barrier.wait();
            coordinator.cleanup();
            for registrar in registrars {
                registrar.join().expect("register must not panic");
            }

            // Every step was released either by cleanup or on registration.
            assert_eq!(count.load(Ordering::SeqCst), 40);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_guard_drop_on_runtime_worker() {
        let count = Arc::new(AtomicUsize::new(0));
        let coordinator = Arc::new(ShutdownCoordinator::new());
        coordinator.register(Box::new(Counting(count.clone())));

        let guard = ShutdownGuard::new(coordinator.clone());
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        drop(guard);

        assert!(coordinator.is_done());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_guard_drop_triggers_cleanup() {
        let count = Arc::new(AtomicUsize::new(0));
        let coordinator = Arc::new(ShutdownCoordinator::new());
        coordinator.register(Box::new(Counting(count.clone())));
        {
            let _guard = ShutdownGuard::new(coordinator.clone());
        }
        assert!(coordinator.is_done());
        assert!(!coordinator.cleanup());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_late_registration_is_released_immediately() {
        let count = Arc::new(AtomicUsize::new(0));
        let coordinator = ShutdownCoordinator::new();
        coordinator.cleanup();
        coordinator.register(Box::new(Counting(count.clone())));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
