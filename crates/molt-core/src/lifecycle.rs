//! Ordered resource teardown with a single post-cleanup hook.
//!
//! Cleanups run in reverse registration order, mirroring init. The
//! post-cleanup hook is a separate, set-once stage that runs only after
//! every ordinary cleanup has completed: the update payload registered
//! there must observe a quiesced process — store closed, migration guard
//! released, logs flushed. Running it as a normal cleanup step would break
//! that ordering.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error};

/// Pause between the last cleanup and the post-cleanup hook, letting
/// filesystem writes settle before an external payload takes over.
const SETTLE_DELAY: Duration = Duration::from_millis(500);

/// A teardown step. Failures are logged and do not abort the rest.
pub type CleanupFn = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;

/// Errors from lifecycle bookkeeping.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// [`PostCleanupSlot::set`] was called a second time.
    #[error("post-cleanup hook already set")]
    PostCleanupAlreadySet,
}

#[derive(Default)]
struct Slot {
    hook: Option<CleanupFn>,
    set: bool,
}

/// Mutex-guarded set-once cell holding the post-cleanup hook.
///
/// Clones share the same slot, so the updater can carry a handle without
/// owning the lifecycle.
#[derive(Clone, Default)]
pub struct PostCleanupSlot {
    inner: Arc<Mutex<Slot>>,
}

impl PostCleanupSlot {
    /// Stores the hook. Only the first call succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::PostCleanupAlreadySet`] on any later call,
    /// even if the first hook has already run.
    pub fn set(&self, hook: CleanupFn) -> Result<(), LifecycleError> {
        let mut slot = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.set {
            return Err(LifecycleError::PostCleanupAlreadySet);
        }
        slot.hook = Some(hook);
        slot.set = true;
        Ok(())
    }

    /// Whether a hook has been stored.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .set
    }

    fn take(&self) -> Option<CleanupFn> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .hook
            .take()
    }
}

/// Deterministic ordered teardown for one process.
#[derive(Default)]
pub struct Lifecycle {
    cleanups: Mutex<Vec<CleanupFn>>,
    post_cleanup: PostCleanupSlot,
    torn_down: AtomicBool,
}

impl Lifecycle {
    /// Creates an empty lifecycle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a cleanup. Cleanups run in reverse registration order.
    pub fn add_cleanup(&self, f: impl FnOnce() -> anyhow::Result<()> + Send + 'static) {
        self.cleanups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(f));
    }

    /// Handle to the post-cleanup slot, for components that register the
    /// update payload.
    #[must_use]
    pub fn post_cleanup_slot(&self) -> PostCleanupSlot {
        self.post_cleanup.clone()
    }

    /// Stores the post-cleanup hook.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::PostCleanupAlreadySet`] on a second call.
    pub fn set_post_cleanup(
        &self,
        f: impl FnOnce() -> anyhow::Result<()> + Send + 'static,
    ) -> Result<(), LifecycleError> {
        self.post_cleanup.set(Box::new(f))
    }

    /// Runs every registered cleanup in reverse order, then the post-cleanup
    /// hook if one was set. Idempotent: a second call is a no-op.
    ///
    /// Individual failures are logged at error level and do not abort the
    /// remaining steps.
    pub fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut cleanups = {
            let mut guard = self.cleanups.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *guard)
        };
        while let Some(cleanup) = cleanups.pop() {
            if let Err(e) = cleanup() {
                error!("cleanup failed: {e:#}");
            }
        }

        if let Some(hook) = self.post_cleanup.take() {
            debug!("running post-cleanup hook");
            std::thread::sleep(SETTLE_DELAY);
            if let Err(e) = hook() {
                error!("post-cleanup failed: {e:#}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn test_cleanups_run_in_reverse_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let lc = Lifecycle::new();
        for i in 0..3 {
            let order = Arc::clone(&order);
            lc.add_cleanup(move || {
                order.lock().unwrap().push(i);
                Ok(())
            });
        }
        lc.teardown();
        assert_eq!(*order.lock().unwrap(), [2, 1, 0]);
    }

    #[test]
    fn test_failing_cleanup_does_not_abort_the_rest() {
        let ran = Arc::new(AtomicBool::new(false));
        let lc = Lifecycle::new();
        {
            let ran = Arc::clone(&ran);
            lc.add_cleanup(move || {
                ran.store(true, Ordering::SeqCst);
                Ok(())
            });
        }
        lc.add_cleanup(|| anyhow::bail!("boom"));
        lc.teardown();
        assert!(ran.load(Ordering::SeqCst), "later-registered failure must not stop earlier cleanups");
    }

    #[test]
    fn test_post_cleanup_runs_after_all_cleanups() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let lc = Lifecycle::new();
        {
            let order = Arc::clone(&order);
            lc.add_cleanup(move || {
                order.lock().unwrap().push("cleanup");
                Ok(())
            });
        }
        {
            let order = Arc::clone(&order);
            lc.set_post_cleanup(move || {
                order.lock().unwrap().push("post");
                Ok(())
            })
            .expect("set");
        }
        lc.teardown();
        assert_eq!(*order.lock().unwrap(), ["cleanup", "post"]);
    }

    #[test]
    fn test_post_cleanup_set_once() {
        let lc = Lifecycle::new();
        lc.set_post_cleanup(|| Ok(())).expect("first set");
        let err = lc.set_post_cleanup(|| Ok(())).expect_err("second set");
        assert!(matches!(err, LifecycleError::PostCleanupAlreadySet));
    }

    #[test]
    fn test_slot_clones_share_the_latch() {
        let lc = Lifecycle::new();
        let slot = lc.post_cleanup_slot();
        slot.set(Box::new(|| Ok(()))).expect("set via clone");
        let err = lc.set_post_cleanup(|| Ok(())).expect_err("latched");
        assert!(matches!(err, LifecycleError::PostCleanupAlreadySet));
        assert!(slot.is_set());
    }

    #[test]
    fn test_teardown_is_idempotent() {
        let count = Arc::new(AtomicUsize::new(0));
        let lc = Lifecycle::new();
        {
            let count = Arc::clone(&count);
            lc.add_cleanup(move || {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        lc.teardown();
        lc.teardown();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
