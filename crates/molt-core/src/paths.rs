//! Filesystem layout for a molt application.
//!
//! Two roots exist per application:
//!
//! - **Storage** (`~/.<name>/`): long-lived data — the embedded store under
//!   `db/`, log files under `logs/`, scratch space under `tmp/`, and the
//!   `update.log` written by non-supervised detached updates.
//! - **Runtime** (`$XDG_RUNTIME_DIR/<name>/`, falling back to
//!   `/tmp/<name>-<user>/`): the migration guard's lock file and presence
//!   markers. Contents do not survive a reboot and must not be relied on for
//!   durable state.

use std::io;
use std::path::{Path, PathBuf};
use std::{env, fs};

use thiserror::Error;

/// Store directory inside the storage root.
pub const DB_DIR: &str = "db";
/// Log directory inside the storage root.
pub const LOGS_DIR: &str = "logs";
/// Scratch directory inside the storage root.
pub const TMP_DIR: &str = "tmp";
/// Log file for detached updates running outside a supervisor.
pub const UPDATE_LOG_FILE: &str = "update.log";

/// Errors from resolving or provisioning the application directories.
#[derive(Debug, Error)]
pub enum PathsError {
    /// The home directory could not be determined.
    #[error("cannot determine home directory (HOME is unset)")]
    NoHome,

    /// The current user could not be determined for the /tmp fallback.
    #[error("cannot determine current user (USER is unset)")]
    NoUser,

    /// A directory could not be created.
    #[error("failed to create {path}: {source}")]
    Create {
        /// The directory that could not be created.
        path: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
    },
}

/// Resolved storage and runtime roots for one application.
#[derive(Debug, Clone)]
pub struct AppPaths {
    /// Long-lived data root, `~/.<name>/`.
    pub storage: PathBuf,
    /// Volatile runtime root holding the migration guard state.
    pub runtime: PathBuf,
}

impl AppPaths {
    /// Resolves both roots for `app_name` from the environment.
    ///
    /// # Errors
    ///
    /// Returns [`PathsError::NoHome`] or [`PathsError::NoUser`] when the
    /// environment does not identify the invoking user.
    pub fn resolve(app_name: &str) -> Result<Self, PathsError> {
        Ok(Self {
            storage: storage_dir(app_name)?,
            runtime: runtime_dir(app_name)?,
        })
    }

    /// Creates the storage layout (`logs/`, `tmp/`).
    ///
    /// The `db/` directory is created by the store itself and the runtime
    /// directory by the migration guard, so that each owner provisions what
    /// it locks.
    ///
    /// # Errors
    ///
    /// Returns [`PathsError::Create`] if a directory cannot be created.
    pub fn ensure_layout(&self) -> Result<(), PathsError> {
        for sub in [LOGS_DIR, TMP_DIR] {
            let path = self.storage.join(sub);
            fs::create_dir_all(&path).map_err(|source| PathsError::Create { path, source })?;
        }
        Ok(())
    }

    /// Path of the embedded store directory.
    #[must_use]
    pub fn db_dir(&self) -> PathBuf {
        self.storage.join(DB_DIR)
    }

    /// Path of the log directory.
    #[must_use]
    pub fn logs_dir(&self) -> PathBuf {
        self.storage.join(LOGS_DIR)
    }
}

/// Computes the storage root for the application (`~/.<name>`).
///
/// # Errors
///
/// Returns [`PathsError::NoHome`] when `HOME` is unset.
pub fn storage_dir(app_name: &str) -> Result<PathBuf, PathsError> {
    let home = env::var_os("HOME").ok_or(PathsError::NoHome)?;
    Ok(Path::new(&home).join(format!(".{app_name}")))
}

/// Computes the runtime root for the application.
///
/// Prefers `$XDG_RUNTIME_DIR/<name>` (typically `/run/user/<uid>/<name>`).
/// On systems without a runtime dir, falls back to `/tmp/<name>-<user>`;
/// the username is included to avoid collisions in the shared /tmp.
///
/// # Errors
///
/// Returns [`PathsError::NoUser`] when the fallback is needed and `USER`
/// is unset.
pub fn runtime_dir(app_name: &str) -> Result<PathBuf, PathsError> {
    if let Some(dir) = env::var_os("XDG_RUNTIME_DIR") {
        if !dir.is_empty() {
            return Ok(Path::new(&dir).join(app_name));
        }
    }

    let user = env::var("USER").map_err(|_| PathsError::NoUser)?;
    Ok(PathBuf::from("/tmp").join(format!("{app_name}-{user}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_dir_is_hidden_under_home() {
        let dir = storage_dir("molt").expect("storage dir");
        assert!(dir.ends_with(".molt"), "got {dir:?}");
    }

    #[test]
    fn test_ensure_layout_creates_subdirs() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths {
            storage: tmp.path().join("storage"),
            runtime: tmp.path().join("runtime"),
        };
        paths.ensure_layout().expect("layout");
        assert!(paths.logs_dir().is_dir());
        assert!(paths.storage.join(TMP_DIR).is_dir());
        // db/ is owned by the store and must not be pre-created here.
        assert!(!paths.db_dir().exists());
    }
}
