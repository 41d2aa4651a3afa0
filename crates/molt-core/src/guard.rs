//! Migration guard: cross-process presence registry and advisory lock.
//!
//! Every normal instance of the binary holds a **shared** `flock` on
//! `<runtime>/migrate.lock` for its whole lifetime and leaves a zero-byte
//! marker at `<runtime>/instances/<pid>` so the installer can find it. The
//! installer's contract is:
//!
//! 1. Signal every pid listed under `instances/` (after verifying the pid's
//!    executable is actually this binary) and wait for the markers to
//!    disappear.
//! 2. Take the **exclusive** lock on `migrate.lock`.
//! 3. Launch the migrator instance (`--migrate`), which skips acquisition
//!    entirely and opens the store directly, then await its exit.
//! 4. Release the exclusive lock and restart the service.
//!
//! Acquisition failure is fatal to the starting process. Release failures
//! are logged only; the kernel drops the lock when the descriptor closes at
//! process exit.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;
use thiserror::Error;
use tracing::debug;

/// Wall-clock bound on lock acquisition.
pub const LOCK_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Lock file name inside the runtime directory. The file is persistent;
/// only the marker files come and go.
pub const LOCK_FILE_NAME: &str = "migrate.lock";

/// Presence-marker directory inside the runtime directory.
pub const INSTANCES_DIR: &str = "instances";

/// Poll interval while waiting for a contended lock.
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Whether a lock request is shared (normal instance) or exclusive
/// (installer/migrator side).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Shared lock, held by every running instance.
    Shared,
    /// Exclusive lock, held while migrations run.
    Exclusive,
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shared => write!(f, "shared"),
            Self::Exclusive => write!(f, "exclusive"),
        }
    }
}

/// Errors from migration guard operations.
#[derive(Debug, Error)]
pub enum GuardError {
    /// The lock could not be acquired within the wall-clock bound.
    #[error("timeout acquiring {mode} lock on migrate.lock after {timeout:?}")]
    LockTimeout {
        /// Requested lock mode.
        mode: LockMode,
        /// The bound that elapsed.
        timeout: Duration,
    },

    /// Filesystem I/O failure.
    #[error("migration guard I/O error: {context}: {source}")]
    Io {
        /// Human-readable context for the failure.
        context: String,
        /// Underlying I/O error.
        source: io::Error,
    },
}

impl GuardError {
    fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// A held shared lock plus this process's presence marker.
///
/// Dropping the guard removes the marker on a best-effort basis and closes
/// the descriptor, which releases the advisory lock.
#[derive(Debug)]
pub struct MigrationGuard {
    lock_file: File,
    marker_path: PathBuf,
    released: bool,
}

impl MigrationGuard {
    /// Acquires the shared lock and registers this process's presence.
    ///
    /// Creates the runtime directory layout if needed. Blocks up to
    /// [`LOCK_ACQUIRE_TIMEOUT`].
    ///
    /// A migrator instance must not call this; it relies on the installer
    /// already holding the exclusive lock on its behalf.
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::LockTimeout`] when the bound elapses, or
    /// [`GuardError::Io`] on filesystem failures. Either is fatal to the
    /// starting process.
    pub fn acquire(runtime_dir: &Path) -> Result<Self, GuardError> {
        Self::acquire_with(runtime_dir, LOCK_ACQUIRE_TIMEOUT)
    }

    /// [`MigrationGuard::acquire`] with an explicit timeout.
    ///
    /// # Errors
    ///
    /// See [`MigrationGuard::acquire`].
    pub fn acquire_with(runtime_dir: &Path, timeout: Duration) -> Result<Self, GuardError> {
        let instances_dir = runtime_dir.join(INSTANCES_DIR);
        fs::create_dir_all(&instances_dir)
            .map_err(|e| GuardError::io(format!("creating {}", instances_dir.display()), e))?;

        let lock_file = open_lock_file(runtime_dir)?;
        lock_with_timeout(&lock_file, LockMode::Shared, timeout)?;

        // Marker file for the installer to signal shutdown. It just needs
        // to exist; the name is the pid.
        let marker_path = instances_dir.join(std::process::id().to_string());
        File::create(&marker_path)
            .map_err(|e| GuardError::io(format!("creating {}", marker_path.display()), e))?;

        debug!(marker = %marker_path.display(), "migration guard acquired");
        Ok(Self {
            lock_file,
            marker_path,
            released: false,
        })
    }

    /// Removes the presence marker and releases the shared lock.
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::Io`] when the marker cannot be removed. Callers
    /// should log and continue: the kernel drops the lock at process exit
    /// regardless.
    pub fn release(mut self) -> Result<(), GuardError> {
        self.released = true;
        let marker = fs::remove_file(&self.marker_path)
            .map_err(|e| GuardError::io(format!("removing {}", self.marker_path.display()), e));
        let _ = FileExt::unlock(&self.lock_file);
        debug!(marker = %self.marker_path.display(), "migration guard released");
        marker
    }
}

impl Drop for MigrationGuard {
    fn drop(&mut self) {
        if !self.released {
            let _ = fs::remove_file(&self.marker_path);
            // Closing the descriptor drops the flock.
        }
    }
}

/// A held exclusive lock on `migrate.lock`.
///
/// This is the installer/migrator side of the protocol: no presence marker
/// is written, and normal instances are locked out until the handle drops.
#[derive(Debug)]
pub struct ExclusiveLock {
    lock_file: File,
}

impl ExclusiveLock {
    /// Releases the exclusive lock.
    pub fn release(self) {
        let _ = FileExt::unlock(&self.lock_file);
    }
}

/// Acquires the exclusive lock on `migrate.lock`, creating the runtime
/// directory if needed. Blocks up to `timeout`.
///
/// # Errors
///
/// Returns [`GuardError::LockTimeout`] while any instance still holds its
/// shared lock, or [`GuardError::Io`] on filesystem failures.
pub fn exclusive(runtime_dir: &Path, timeout: Duration) -> Result<ExclusiveLock, GuardError> {
    fs::create_dir_all(runtime_dir)
        .map_err(|e| GuardError::io(format!("creating {}", runtime_dir.display()), e))?;
    let lock_file = open_lock_file(runtime_dir)?;
    lock_with_timeout(&lock_file, LockMode::Exclusive, timeout)?;
    Ok(ExclusiveLock { lock_file })
}

fn open_lock_file(runtime_dir: &Path) -> Result<File, GuardError> {
    let lock_path = runtime_dir.join(LOCK_FILE_NAME);
    let mut options = OpenOptions::new();
    options.read(true).write(true).create(true).truncate(false);

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    options
        .open(&lock_path)
        .map_err(|e| GuardError::io(format!("opening {}", lock_path.display()), e))
}

/// Try-lock loop bounded by a wall-clock deadline.
///
/// `flock` has no native timeout, so contention is polled at
/// [`LOCK_RETRY_INTERVAL`] until `timeout` elapses.
fn lock_with_timeout(file: &File, mode: LockMode, timeout: Duration) -> Result<(), GuardError> {
    let deadline = Instant::now() + timeout;
    loop {
        // Fully qualified: std::fs::File grew inherent try_lock methods
        // with a different return type, which would otherwise shadow the
        // fs2 trait.
        let attempt = match mode {
            LockMode::Shared => FileExt::try_lock_shared(file),
            LockMode::Exclusive => FileExt::try_lock_exclusive(file),
        };
        match attempt {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => {},
            Err(e) => return Err(GuardError::io(format!("flock ({mode})"), e)),
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(GuardError::LockTimeout { mode, timeout });
        }
        std::thread::sleep(LOCK_RETRY_INTERVAL.min(deadline - now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_creates_lock_and_marker() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let guard = MigrationGuard::acquire(tmp.path()).expect("acquire");

        assert!(tmp.path().join(LOCK_FILE_NAME).is_file());
        let marker = tmp
            .path()
            .join(INSTANCES_DIR)
            .join(std::process::id().to_string());
        assert!(marker.is_file());

        guard.release().expect("release");
        assert!(!marker.exists(), "marker should be gone after release");
    }

    #[test]
    fn test_shared_locks_coexist() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let a = MigrationGuard::acquire(tmp.path()).expect("first");
        let b = MigrationGuard::acquire(tmp.path()).expect("second");
        drop(a);
        drop(b);
    }

    #[test]
    fn test_exclusive_times_out_while_shared_held() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let guard = MigrationGuard::acquire(tmp.path()).expect("acquire");

        let err = exclusive(tmp.path(), Duration::from_millis(300))
            .expect_err("exclusive must not succeed while a shared lock is held");
        assert!(
            matches!(
                err,
                GuardError::LockTimeout {
                    mode: LockMode::Exclusive,
                    ..
                }
            ),
            "expected LockTimeout, got {err:?}"
        );

        guard.release().expect("release");
        let lock = exclusive(tmp.path(), Duration::from_millis(300))
            .expect("exclusive after shared release");
        lock.release();
    }

    #[test]
    fn test_shared_times_out_while_exclusive_held() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let lock = exclusive(tmp.path(), Duration::from_millis(300)).expect("exclusive");

        let err = MigrationGuard::acquire_with(tmp.path(), Duration::from_millis(300))
            .expect_err("shared must wait for the migrator");
        assert!(matches!(
            err,
            GuardError::LockTimeout {
                mode: LockMode::Shared,
                ..
            }
        ));

        lock.release();
    }

    #[test]
    fn test_drop_removes_marker() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let marker = tmp
            .path()
            .join(INSTANCES_DIR)
            .join(std::process::id().to_string());
        {
            let _guard = MigrationGuard::acquire(tmp.path()).expect("acquire");
            assert!(marker.is_file());
        }
        assert!(!marker.exists(), "drop should remove the marker");
    }
}
