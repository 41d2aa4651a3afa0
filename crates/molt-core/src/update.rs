//! Update orchestrator: version checks and the install payload launch.
//!
//! The updater owns no long-lived resources, only a one-shot latch ensuring
//! the update is prepared at most once per process. Preparation records the
//! running version as `preUpdateVersion` *before* any payload launches, so
//! the replacement binary can infer success after restart by comparing it
//! against its own version.
//!
//! Two launch strategies exist:
//!
//! - **Deferred**: the payload is registered as the lifecycle's post-cleanup
//!   hook and runs attached to this process's streams during normal exit.
//! - **Detached**: the payload must survive this process. Under a
//!   supervisor, a new session is not enough — the supervisor kills the
//!   whole process group — so a one-shot transient unit with its own
//!   lifetime is created instead. Outside a supervisor, a plain new-session
//!   detach with file-backed logging suffices.

use std::io;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Once};
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::lifecycle::{LifecycleError, PostCleanupSlot};
use crate::paths::UPDATE_LOG_FILE;
use crate::release::{ReleaseError, ReleaseSource};
use crate::store::config::{self, Configuration};
use crate::store::{Store, StoreError};

/// Version string of local non-release builds. The updater refuses to act
/// on it.
pub const DEV_VERSION: &str = "vX.X.X";

/// Maximum runtime of the install payload.
pub const UPDATE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Period of the background update checker.
pub const UPDATE_CHECK_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Deadline for a single release-source fetch.
const CHECK_DEADLINE: Duration = Duration::from_secs(8);

/// Bound on `systemd-run` itself accepting the transient unit.
const TRANSIENT_UNIT_SPAWN_TIMEOUT: Duration = Duration::from_secs(15);

/// Poll interval while waiting on a spawned payload.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Errors from update orchestration.
#[derive(Debug, Error)]
pub enum UpdateError {
    /// The running binary is a development build; updates are disabled.
    /// Non-fatal and distinct from network failure so callers can branch.
    #[error("development build detected, skipping")]
    DevelopmentBuild,

    /// The running binary carries no version at all.
    #[error("application version is unset")]
    MissingVersion,

    /// The release source could not be consulted. Periodic callers log and
    /// continue.
    #[error(transparent)]
    Transient(#[from] ReleaseError),

    /// A version string did not parse as semver.
    #[error("invalid version {version:?}: {source}")]
    Version {
        /// The offending string.
        version: String,
        /// Parse failure detail.
        source: semver::Error,
    },

    /// Persisting update state failed.
    #[error("failed to update configuration: {0}")]
    Store(#[from] StoreError),

    /// The post-cleanup hook was already taken by something else.
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    /// The payload (or its launcher) could not be started.
    #[error("failed to launch update payload: {context}: {source}")]
    Launch {
        /// What was being launched.
        context: String,
        /// Underlying I/O error.
        source: io::Error,
    },

    /// The payload ran past its deadline and was killed.
    #[error("update payload timed out after {0:?}")]
    PayloadTimeout(Duration),

    /// The payload exited unsuccessfully.
    #[error("update payload exited with {status}")]
    PayloadFailed {
        /// The payload's exit status.
        status: ExitStatus,
    },
}

impl UpdateError {
    fn launch(context: impl Into<String>, source: io::Error) -> Self {
        Self::Launch {
            context: context.into(),
            source,
        }
    }
}

/// Identity of the running binary, as the updater needs it.
#[derive(Debug, Clone)]
pub struct BinaryInfo {
    /// Application name (binary and unit names derive from it).
    pub name: String,
    /// Running version, `v`-prefixed, or [`DEV_VERSION`].
    pub version: String,
    /// Base URL of the release server.
    pub release_url: String,
    /// Whether this binary runs under a service supervisor, which decides
    /// the detachment strategy.
    pub service_mode: bool,
}

/// Outcome of comparing persisted update state against the running binary.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RestartStatus {
    /// The service has reached listening since the last restart request.
    pub restarted: bool,
    /// The version changed across the last prepared update.
    pub updated: bool,
}

/// Update orchestrator. One per process, created during init.
pub struct Updater {
    info: BinaryInfo,
    storage_dir: PathBuf,
    store: Store,
    source: Arc<dyn ReleaseSource>,
    post_cleanup: PostCleanupSlot,
    prep_latch: Once,
}

impl Updater {
    /// Assembles the updater.
    #[must_use]
    pub fn new(
        info: BinaryInfo,
        storage_dir: PathBuf,
        store: Store,
        source: Arc<dyn ReleaseSource>,
        post_cleanup: PostCleanupSlot,
    ) -> Self {
        Self {
            info,
            storage_dir,
            store,
            source,
            post_cleanup,
            prep_latch: Once::new(),
        }
    }

    /// The running version.
    #[must_use]
    pub fn version(&self) -> &str {
        &self.info.version
    }

    /// Consults the release source and caches the outcome.
    ///
    /// In one store update, `updateAvailable` is set to whether the latest
    /// published version is semver-greater than the running one and
    /// `lastUpdateCheck` is set to now. Returns the availability flag.
    ///
    /// Blocks up to the fetch deadline; from async code, call through
    /// `spawn_blocking`.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::DevelopmentBuild`] on a dev build (state is
    /// left untouched), [`UpdateError::Transient`] on network failure, or
    /// store/parse errors.
    pub fn check_for_update(&self) -> Result<bool, UpdateError> {
        self.reject_unversioned()?;

        let latest = self
            .source
            .latest_version(CHECK_DEADLINE, &self.info.release_url)?;
        let available = semver_greater(&latest, &self.info.version)?;
        debug!(
            latest = %latest,
            current = %self.info.version,
            available,
            "release source consulted"
        );

        config::update_config(&self.store, |cfg| {
            cfg.update_available = available;
            cfg.last_update_check = Utc::now();
            Ok(())
        })?;

        Ok(available)
    }

    /// Prepares the update and registers the install pipeline as the
    /// lifecycle's post-cleanup payload, to run during normal exit attached
    /// to this process's streams. Exit soon after calling this.
    ///
    /// The first of `defer_update`/`detach_update` wins; later calls of
    /// either are no-ops.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::DevelopmentBuild`] on a dev build, or
    /// store/lifecycle errors from preparation.
    pub fn defer_update(&self) -> Result<(), UpdateError> {
        let mut result = Ok(());
        self.prep_latch.call_once(|| {
            result = self.defer_inner();
        });
        result
    }

    fn defer_inner(&self) -> Result<(), UpdateError> {
        self.prepare()?;

        let pipeline = self.install_pipeline();
        debug!(%pipeline, "prepared deferred update");

        self.post_cleanup.set(Box::new(move || {
            run_attached(&pipeline, UPDATE_TIMEOUT)?;
            Ok(())
        }))?;
        Ok(())
    }

    /// Prepares the update and launches the install pipeline detached, so
    /// it survives this process and — in service mode — the supervisor
    /// killing the whole process group. Returns once the child has started;
    /// the payload will terminate this process externally.
    ///
    /// The first of `defer_update`/`detach_update` wins; later calls of
    /// either are no-ops.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::DevelopmentBuild`] on a dev build, or
    /// store/launch errors.
    pub fn detach_update(&self) -> Result<(), UpdateError> {
        let mut result = Ok(());
        self.prep_latch.call_once(|| {
            result = self.detach_inner();
        });
        result
    }

    fn detach_inner(&self) -> Result<(), UpdateError> {
        self.prepare()?;

        let pipeline = self.install_pipeline();
        if self.info.service_mode {
            debug!(%pipeline, "launching detached update as transient unit");
            self.spawn_transient_unit(&pipeline)
        } else {
            let log_path = self.storage_dir.join(UPDATE_LOG_FILE);
            debug!(%pipeline, log = %log_path.display(), "launching detached update in new session");
            spawn_new_session(&pipeline, &log_path)
        }
    }

    /// Records that an update was accepted: `updateAvailable` drops to
    /// false and `preUpdateVersion` captures the running version, in one
    /// store update. The updater is the sole setter of `preUpdateVersion`.
    fn prepare(&self) -> Result<(), UpdateError> {
        self.reject_unversioned()?;

        let version = self.info.version.clone();
        config::update_config(&self.store, |cfg| {
            cfg.update_available = false;
            cfg.pre_update_version = version;
            Ok(())
        })?;
        Ok(())
    }

    fn reject_unversioned(&self) -> Result<(), UpdateError> {
        if self.info.version.is_empty() {
            return Err(UpdateError::MissingVersion);
        }
        if self.info.version == DEV_VERSION {
            return Err(UpdateError::DevelopmentBuild);
        }
        Ok(())
    }

    /// The install pipeline: fetch the install script from the release
    /// server and hand it to a shell.
    fn install_pipeline(&self) -> String {
        format!(
            "curl -sSfL {}/install.sh | sh",
            self.info.release_url.trim_end_matches('/')
        )
    }

    /// Launches the pipeline as a one-shot managed unit with its own
    /// lifetime, journal-backed logging tagged `<name>-update`, and a
    /// runtime cap. `systemd-run --no-block` returns as soon as the unit is
    /// queued, so only its own invocation is awaited here.
    fn spawn_transient_unit(&self, pipeline: &str) -> Result<(), UpdateError> {
        let unit_name = format!(
            "{}-update-{}",
            self.info.name,
            Utc::now().format("%Y%m%d-%H%M%S")
        );
        let runtime_max = format!("RuntimeMaxSec={}", UPDATE_TIMEOUT.as_secs());
        let syslog_ident = format!("SyslogIdentifier={}-update", self.info.name);

        let mut child = Command::new("systemd-run")
            .arg("--user")
            .arg(format!("--unit={unit_name}"))
            .arg("--quiet")
            .arg("--no-block")
            .args(["-p", "StandardOutput=journal"])
            .args(["-p", "StandardError=journal"])
            .args(["-p", &syslog_ident])
            .args(["-p", &runtime_max])
            .args(["-p", "KillSignal=SIGINT"])
            .args(["-p", "TimeoutStopSec=30s"])
            .args(["/bin/sh", "-c", pipeline])
            .spawn()
            .map_err(|e| UpdateError::launch("spawning systemd-run", e))?;

        wait_with_deadline(&mut child, TRANSIENT_UNIT_SPAWN_TIMEOUT)
    }
}

/// Runs the pipeline attached to this process's standard streams, bounded
/// by `timeout`.
fn run_attached(pipeline: &str, timeout: Duration) -> Result<(), UpdateError> {
    let mut child = Command::new("sh")
        .args(["-c", pipeline])
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(|e| UpdateError::launch("spawning install pipeline", e))?;
    wait_with_deadline(&mut child, timeout)
}

/// Starts the pipeline in a new session with output appended to `log_path`,
/// and releases the child handle. No process-group threat exists outside a
/// supervisor, so `setsid` is sufficient detachment.
fn spawn_new_session(pipeline: &str, log_path: &std::path::Path) -> Result<(), UpdateError> {
    // Shell-managed logging keeps the redirection alive after we exit.
    let wrapped = format!("( {pipeline} ) >> \"{}\" 2>&1", log_path.display());

    let mut cmd = Command::new("sh");
    cmd.args(["-c", &wrapped])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // SAFETY: setsid is async-signal-safe and the closure does nothing
        // else, which is all pre_exec requires between fork and exec.
        unsafe {
            cmd.pre_exec(|| {
                nix::unistd::setsid().map_err(io::Error::from)?;
                Ok(())
            });
        }
    }

    let child = cmd
        .spawn()
        .map_err(|e| UpdateError::launch("spawning detached update", e))?;

    // The handle is dropped without waiting: this process exits shortly
    // (the install script terminates it), at which point init adopts and
    // reaps the child.
    drop(child);
    Ok(())
}

/// `try_wait` poll loop with a kill on deadline.
fn wait_with_deadline(child: &mut Child, timeout: Duration) -> Result<(), UpdateError> {
    let deadline = Instant::now() + timeout;
    loop {
        match child
            .try_wait()
            .map_err(|e| UpdateError::launch("waiting for update payload", e))?
        {
            Some(status) if status.success() => return Ok(()),
            Some(status) => return Err(UpdateError::PayloadFailed { status }),
            None => {},
        }

        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Err(UpdateError::PayloadTimeout(timeout));
        }
        std::thread::sleep(WAIT_POLL_INTERVAL);
    }
}

/// Compares two `v`-prefixed version strings.
fn semver_greater(latest: &str, current: &str) -> Result<bool, UpdateError> {
    Ok(parse_version(latest)? > parse_version(current)?)
}

fn parse_version(version: &str) -> Result<semver::Version, UpdateError> {
    semver::Version::parse(version.trim().trim_start_matches('v')).map_err(|source| {
        UpdateError::Version {
            version: version.to_string(),
            source,
        }
    })
}

/// Derives the restart/update outcome from persisted state: the service
/// restarted iff it has reached listening since the last restart request,
/// and an update landed iff a recorded `preUpdateVersion` differs from the
/// running version.
#[must_use]
pub fn restart_status(cfg: &Configuration, running_version: &str) -> RestartStatus {
    RestartStatus {
        restarted: cfg.start_counter > 0,
        updated: !cfg.pre_update_version.is_empty()
            && cfg.pre_update_version != running_version,
    }
}

/// Handle to the running auto-checker task.
pub struct AutoChecker {
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl AutoChecker {
    /// Cancels the loop and waits for it to acknowledge.
    pub async fn shutdown(self) {
        let _ = self.cancel.send(true);
        if let Err(e) = self.task.await {
            warn!("auto-checker task failed to join: {e}");
        }
    }
}

/// Starts the periodic update checker on the current Tokio runtime.
///
/// `current` is the config snapshot taken at init; each tick re-reads the
/// config so `updateNotifications` toggles take effect without a restart.
/// When the last check is already older than the period, one check runs
/// immediately; otherwise the first tick lands at `lastUpdateCheck +
/// period`. Returns `None` on a development build.
#[must_use]
pub fn spawn_auto_checker(updater: &Arc<Updater>, current: &Configuration) -> Option<AutoChecker> {
    if updater.info.version == DEV_VERSION {
        return None;
    }

    let (cancel, cancelled) = watch::channel(false);
    let task = tokio::spawn(run_auto_checker(
        Arc::clone(updater),
        current.clone(),
        cancelled,
    ));
    Some(AutoChecker { cancel, task })
}

async fn run_auto_checker(
    updater: Arc<Updater>,
    initial: Configuration,
    mut cancelled: watch::Receiver<bool>,
) {
    let period = TimeDelta::from_std(UPDATE_CHECK_INTERVAL).unwrap_or(TimeDelta::hours(24));
    let mut initial_delay = UPDATE_CHECK_INTERVAL;

    if initial.update_notifications {
        let mut available = initial.update_available;
        if Utc::now().signed_duration_since(initial.last_update_check) >= period {
            available = do_check(&updater).await;
        } else {
            initial_delay = (initial.last_update_check + period - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO);
        }
        if available {
            println!(
                "Update available! Run '{} update' to update to the latest version.",
                updater.info.name
            );
        }
    }

    tokio::select! {
        () = tokio::time::sleep(initial_delay) => {},
        _ = cancelled.changed() => return,
    }
    check_tick(&updater).await;

    let start = tokio::time::Instant::now() + UPDATE_CHECK_INTERVAL;
    let mut ticker = tokio::time::interval_at(start, UPDATE_CHECK_INTERVAL);
    loop {
        tokio::select! {
            _ = cancelled.changed() => return,
            _ = ticker.tick() => check_tick(&updater).await,
        }
    }
}

/// One tick: re-read the config and check if the window has elapsed.
async fn check_tick(updater: &Arc<Updater>) {
    let cfg = match config::view_config(&updater.store) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("auto-checker failed to read config: {e}");
            return;
        },
    };
    if should_check(&cfg, Utc::now()) {
        do_check(updater).await;
    }
}

/// Whether a tick should perform a check. The one-minute slack accounts for
/// the gap between a tick firing and `lastUpdateCheck` being written;
/// without it every other tick would be skipped.
fn should_check(cfg: &Configuration, now: DateTime<Utc>) -> bool {
    if !cfg.update_notifications {
        return false;
    }
    let window = TimeDelta::from_std(UPDATE_CHECK_INTERVAL).unwrap_or(TimeDelta::hours(24))
        - TimeDelta::minutes(1);
    now.signed_duration_since(cfg.last_update_check) >= window
}

/// Performs one check on the blocking pool, swallowing expected failures:
/// network flakiness and dev builds are normal, everything else is an
/// error-level event.
async fn do_check(updater: &Arc<Updater>) -> bool {
    let handle = Arc::clone(updater);
    let outcome = tokio::task::spawn_blocking(move || handle.check_for_update()).await;
    match outcome {
        Ok(Ok(available)) => available,
        Ok(Err(UpdateError::DevelopmentBuild)) => {
            debug!("auto-checker skipped: development build");
            false
        },
        Ok(Err(e @ UpdateError::Transient(_))) => {
            warn!("update check failed: {e}");
            false
        },
        Ok(Err(e)) => {
            error!("update check failed: {e}");
            false
        },
        Err(e) => {
            error!("update check task failed to join: {e}");
            false
        },
    }
}
