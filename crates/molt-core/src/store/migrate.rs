//! Forward-only schema migration runner.
//!
//! Developers declare an ordered list of steps; the order of [`Migrator::add`]
//! calls is the execution order, with no sorting by id or timestamp. The
//! runner applies every step after the stored version marker inside the
//! caller's transaction, so a run is atomic: either the post-migration state
//! is entirely visible to other instances or none of it is.
//!
//! Rolling back is deliberately unsupported; a marker that is not in the
//! declared list means the database came from an unknown future or forked
//! lineage, and the runner refuses to guess.

use rusqlite::Transaction;
use thiserror::Error;
use tracing::info;

use super::config::{CONFIG_DATA_KEY, Configuration};
use super::{Partition, Store, StoreError};

/// A single migration step's database operation.
pub type StepFn = Box<dyn Fn(&Transaction<'_>) -> Result<(), StoreError> + Send + Sync>;

struct Step {
    id: String,
    description: String,
    apply: StepFn,
}

/// Errors from declaring or running migrations.
#[derive(Debug, Error)]
pub enum MigrateError {
    /// The stored schema version is not in the declared step list.
    #[error("schema version {version:?} not found in migration history; database state is unknown")]
    UnknownSchemaVersion {
        /// The unrecognized marker read from the store.
        version: String,
    },

    /// A step id was declared twice.
    #[error("duplicate migration step id {id:?}")]
    DuplicateStep {
        /// The repeated id.
        id: String,
    },

    /// A step's `apply` failed; the whole run rolls back.
    #[error("failed to apply migration {id:?} ({description}): {source}")]
    Step {
        /// Id of the failing step.
        id: String,
        /// Its human-readable description.
        description: String,
        /// Underlying store error.
        source: Box<StoreError>,
    },
}

/// Ordered list of migration steps.
#[derive(Default)]
pub struct Migrator {
    steps: Vec<Step>,
}

impl Migrator {
    /// Creates a runner with an empty step list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares the next migration step. Order matters: steps run in the
    /// exact order they were added.
    ///
    /// # Errors
    ///
    /// Returns [`MigrateError::DuplicateStep`] when `id` was already
    /// declared; duplicated ids are a programming error caught at
    /// construction, not at run time.
    pub fn add(
        &mut self,
        id: &str,
        description: &str,
        apply: impl Fn(&Transaction<'_>) -> Result<(), StoreError> + Send + Sync + 'static,
    ) -> Result<(), MigrateError> {
        if self.steps.iter().any(|step| step.id == id) {
            return Err(MigrateError::DuplicateStep { id: id.to_string() });
        }
        self.steps.push(Step {
            id: id.to_string(),
            description: description.to_string(),
            apply: Box::new(apply),
        });
        Ok(())
    }

    /// Applies every step after `current_version` inside `txn` and returns
    /// the id the version marker should advance to.
    ///
    /// An empty `current_version` means a fresh store: the run starts from
    /// the first declared step. An up-to-date store is a no-op and returns
    /// `current_version` unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`MigrateError::UnknownSchemaVersion`] when
    /// `current_version` is non-empty and not declared, or
    /// [`MigrateError::Step`] when a step fails.
    pub fn run(&self, txn: &Transaction<'_>, current_version: &str) -> Result<String, MigrateError> {
        let start = if current_version.is_empty() {
            0
        } else {
            let position = self
                .steps
                .iter()
                .position(|step| step.id == current_version)
                .ok_or_else(|| MigrateError::UnknownSchemaVersion {
                    version: current_version.to_string(),
                })?;
            position + 1
        };

        let mut version = current_version.to_string();
        for step in &self.steps[start..] {
            info!(id = %step.id, description = %step.description, "applying migration");
            (step.apply)(txn).map_err(|source| MigrateError::Step {
                id: step.id.clone(),
                description: step.description.clone(),
                source: Box::new(source),
            })?;
            version.clone_from(&step.id);
        }

        Ok(version)
    }
}

/// The application's declared migration history.
///
/// Add steps here, after the existing ones. Registering a new partition in
/// [`Partition::ALL`] alone does not need a step; only data reshaping does.
///
/// # Errors
///
/// Returns [`MigrateError::DuplicateStep`] if the declared list is invalid.
pub fn builtin() -> Result<Migrator, MigrateError> {
    let mut m = Migrator::new();

    m.add("v1", "initial schema", |txn| {
        Store::put_in(txn, Partition::Config, CONFIG_DATA_KEY, &Configuration::default())
    })?;

    // Example version bump:
    // m.add("v2", "add widget partition defaults", |txn| { ... })?;

    Ok(m)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::store::SCHEMA_VERSION_KEY;

    #[test]
    fn test_duplicate_step_rejected_at_construction() {
        let mut m = Migrator::new();
        m.add("v1", "first", |_| Ok(())).expect("first add");
        let err = m.add("v1", "again", |_| Ok(())).expect_err("duplicate id");
        assert!(matches!(err, MigrateError::DuplicateStep { id } if id == "v1"));
    }

    #[test]
    fn test_fresh_store_runs_all_steps_in_order() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = Store::open_unmigrated(&tmp.path().join("db")).expect("open");

        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut m = Migrator::new();
        for id in ["v1", "v2", "v3"] {
            let order = Arc::clone(&order);
            m.add(id, "step", move |_| {
                order.lock().unwrap().push(id);
                Ok(())
            })
            .expect("add");
        }

        let version = store.migrate(&m).expect("migrate");
        assert_eq!(version, "v3");
        assert_eq!(*order.lock().unwrap(), ["v1", "v2", "v3"]);

        let stored: String = store
            .view(Partition::Config, SCHEMA_VERSION_KEY)
            .expect("version marker");
        assert_eq!(stored, "v3");
    }

    #[test]
    fn test_up_to_date_store_is_a_no_op() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = Store::open_unmigrated(&tmp.path().join("db")).expect("open");

        let applied = Arc::new(AtomicUsize::new(0));
        let build = |counter: Arc<AtomicUsize>| {
            let mut m = Migrator::new();
            m.add("v1", "only step", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .expect("add");
            m
        };

        store.migrate(&build(Arc::clone(&applied))).expect("first run");
        assert_eq!(applied.load(Ordering::SeqCst), 1);

        store.migrate(&build(Arc::clone(&applied))).expect("second run");
        assert_eq!(
            applied.load(Ordering::SeqCst),
            1,
            "no step may run on an up-to-date store"
        );

        let stored: String = store
            .view(Partition::Config, SCHEMA_VERSION_KEY)
            .expect("version marker");
        assert_eq!(stored, "v1");
    }

    #[test]
    fn test_partial_history_resumes_after_current() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = Store::open_unmigrated(&tmp.path().join("db")).expect("open");

        let mut first = Migrator::new();
        first.add("v1", "first", |_| Ok(())).expect("add");
        store.migrate(&first).expect("run v1");

        let applied = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut second = Migrator::new();
        for id in ["v1", "v2"] {
            let applied = Arc::clone(&applied);
            second
                .add(id, "step", move |_| {
                    applied.lock().unwrap().push(id);
                    Ok(())
                })
                .expect("add");
        }
        let version = store.migrate(&second).expect("run v2");
        assert_eq!(version, "v2");
        assert_eq!(*applied.lock().unwrap(), ["v2"], "v1 must not re-run");
    }

    #[test]
    fn test_unknown_version_refuses_to_guess() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = Store::open_unmigrated(&tmp.path().join("db")).expect("open");

        let mut future = Migrator::new();
        future.add("v9", "from the future", |_| Ok(())).expect("add");
        store.migrate(&future).expect("write future marker");

        let err = store.migrate(&builtin().expect("builtin")).expect_err("unknown marker");
        match err {
            StoreError::Migrate(MigrateError::UnknownSchemaVersion { version }) => {
                assert_eq!(version, "v9");
            },
            other => panic!("expected UnknownSchemaVersion, got {other:?}"),
        }
    }

    #[test]
    fn test_failing_step_rolls_back_the_run() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = Store::open_unmigrated(&tmp.path().join("db")).expect("open");

        let mut m = Migrator::new();
        m.add("v1", "writes data", |txn| {
            Store::put_in(txn, Partition::Config, "seeded", &true)
        })
        .expect("add");
        m.add("v2", "explodes", |_| {
            Err(StoreError::NotFound {
                partition: "config",
                key: "whatever".into(),
            })
        })
        .expect("add");

        let err = store.migrate(&m).expect_err("failing step");
        assert!(matches!(
            err,
            StoreError::Migrate(MigrateError::Step { ref id, .. }) if id == "v2"
        ));

        // The whole run aborted: v1's write and the marker are both absent.
        assert!(store
            .view::<bool>(Partition::Config, "seeded")
            .expect_err("rolled back")
            .is_not_found());
        assert!(store
            .view::<String>(Partition::Config, SCHEMA_VERSION_KEY)
            .expect_err("no marker")
            .is_not_found());
    }
}
