//! Embedded key-value store with a versioned schema.
//!
//! Backed by `SQLite` in WAL mode: crash-atomic commits, single-writer /
//! multi-reader transactions, and multi-process access from the same host.
//! Values are JSON objects addressed by `(partition, key)`.
//!
//! Partitions are declared up front in the [`Partition`] enum; the variant
//! list **is** the registration list, traversed when the store opens, so the
//! type-level enumeration and the provisioned schema cannot drift apart.
//!
//! Every one-shot operation on [`Store`] opens its own transaction. Never
//! call one from inside another transaction on the same handle; compose with
//! the `*_in` associated functions instead, which take the caller's
//! [`Transaction`].

pub mod config;
pub mod migrate;

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::{fs, io};

use rusqlite::{Connection, OptionalExtension, Transaction, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, info};

use self::migrate::{MigrateError, Migrator};

/// Database file name inside the store directory.
const DB_FILE: &str = "molt.db";

/// How long a transaction waits on a competing writer before failing.
const BUSY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Key of the schema version marker in the config partition.
pub const SCHEMA_VERSION_KEY: &str = "version";

/// The declared partitions of the store.
///
/// Add a variant (and extend [`Partition::ALL`]) to register a new
/// partition; existing data is preserved and no migration is needed for
/// that alone. Removing a variant does not delete rows, it only removes
/// the typed handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Partition {
    /// Configuration record and schema version marker.
    Config,
}

impl Partition {
    /// Every declared partition, traversed at open to provision the schema.
    pub const ALL: &'static [Self] = &[Self::Config];

    /// Stable on-disk name of the partition.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Config => "config",
        }
    }
}

/// What [`Store::for_each`] should do with an entry after the callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisitAction {
    /// Leave the entry unchanged.
    Keep,
    /// Re-serialize and store the (possibly mutated) entry.
    Update,
    /// Remove the entry.
    Delete,
}

/// Errors from store operations.
///
/// `NotFound` is a distinct kind so callers can branch on absence; use
/// [`StoreError::is_not_found`] after wrapping.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The key does not exist in the partition.
    #[error("key {key:?} not found in partition {partition:?}")]
    NotFound {
        /// Partition that was searched.
        partition: &'static str,
        /// Missing key.
        key: String,
    },

    /// Underlying database failure.
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Value (de)serialization failure.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Schema migration failure.
    #[error(transparent)]
    Migrate(#[from] MigrateError),

    /// Filesystem failure while provisioning the store directory.
    #[error("failed to create store directory: {0}")]
    CreateDir(#[source] io::Error),

    /// The connection mutex was poisoned by a panicking holder.
    #[error("store connection lock poisoned")]
    Poisoned,

    /// The store was closed; surviving handles cannot operate on it.
    #[error("store is closed")]
    Closed,
}

impl StoreError {
    /// Returns true when the error is (or wraps) a missing key.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Handle to the embedded store. Cheap to clone; all clones share one
/// connection guarded by a mutex, and mutation goes through the
/// transactional API only. [`Store::close`] shuts the shared connection
/// down for every clone at once — teardown relies on this to quiesce the
/// database file while other components still hold handles.
#[derive(Debug, Clone)]
pub struct Store {
    conn: Arc<Mutex<Option<Connection>>>,
}

impl Store {
    /// Opens (creating if absent) the store at `dir` and brings the schema
    /// up to date with the built-in migration list.
    ///
    /// A normal instance must hold its shared migration-guard lock before
    /// calling this; the migrator instance relies on the installer's
    /// exclusive lock instead.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Migrate`] when the stored schema version is
    /// unknown, or other variants on database/filesystem failures.
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        let store = Self::open_unmigrated(dir)?;
        store.migrate(&migrate::builtin()?)?;
        Ok(store)
    }

    /// Opens the store without running any migrations. Intended for tests
    /// and tools that supply their own [`Migrator`].
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on database or filesystem failures.
    pub fn open_unmigrated(dir: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(dir).map_err(StoreError::CreateDir)?;
        let conn = Connection::open(dir.join(DB_FILE))?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        // WAL keeps readers unblocked while one writer commits, across
        // processes sharing the file.
        let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        init_schema(&conn)?;
        info!(path = %dir.display(), "store opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(Some(conn))),
        })
    }

    /// Closes the store: the connection is taken out of the shared handle
    /// and shut down, so this process holds no open handle on the database
    /// file afterwards (an installer's migrator instance may open it
    /// immediately). Idempotent; operations through surviving clones fail
    /// with [`StoreError::Closed`].
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] when the underlying close fails; the
    /// connection is dropped regardless.
    pub fn close(&self) -> Result<(), StoreError> {
        let mut guard = self.lock()?;
        match guard.take() {
            Some(conn) => {
                conn.close().map_err(|(_conn, e)| StoreError::Sqlite(e))?;
                debug!("store closed");
                Ok(())
            },
            None => Ok(()),
        }
    }

    /// Runs `migrator` against the store inside a single transaction: the
    /// current schema version is read, every later step is applied in
    /// declaration order, and the marker is advanced to the last applied
    /// step's id. The whole run commits atomically or not at all.
    ///
    /// Running an up-to-date store through this is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`MigrateError::UnknownSchemaVersion`] (wrapped) when the
    /// stored marker is not in the declared list, or the failing step's
    /// error.
    pub fn migrate(&self, migrator: &Migrator) -> Result<String, StoreError> {
        let mut guard = self.lock()?;
        let conn = guard.as_mut().ok_or(StoreError::Closed)?;
        let txn = conn.transaction()?;

        let current = match get_raw(&txn, Partition::Config, SCHEMA_VERSION_KEY)? {
            Some(raw) => serde_json::from_str::<String>(&raw)?,
            None => String::new(),
        };

        let next = migrator.run(&txn, &current)?;
        if next != current {
            Self::put_in(&txn, Partition::Config, SCHEMA_VERSION_KEY, &next)?;
        }
        txn.commit()?;

        if next == current {
            debug!(version = %next, "schema already up to date");
        } else {
            info!(from = %current, to = %next, "schema migrated");
        }
        Ok(next)
    }

    /// Reads a value.
    ///
    /// Opens a read transaction; do not call inside another transaction on
    /// this handle.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when the key is absent.
    pub fn view<T: DeserializeOwned>(&self, partition: Partition, key: &str) -> Result<T, StoreError> {
        let guard = self.lock()?;
        let conn = guard.as_ref().ok_or(StoreError::Closed)?;
        match get_raw(conn, partition, key)? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Err(StoreError::NotFound {
                partition: partition.name(),
                key: key.to_string(),
            }),
        }
    }

    /// Writes a value unconditionally.
    ///
    /// Opens a write transaction; do not call inside another transaction on
    /// this handle.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on serialization or database failures.
    pub fn put<T: Serialize>(&self, partition: Partition, key: &str, value: &T) -> Result<(), StoreError> {
        let guard = self.lock()?;
        let conn = guard.as_ref().ok_or(StoreError::Closed)?;
        put_raw(conn, partition, key, &serde_json::to_string(value)?)
    }

    /// Deletes a key, returning whether it existed.
    ///
    /// Opens a write transaction; do not call inside another transaction on
    /// this handle.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on database failures.
    pub fn delete(&self, partition: Partition, key: &str) -> Result<bool, StoreError> {
        let guard = self.lock()?;
        let conn = guard.as_ref().ok_or(StoreError::Closed)?;
        let n = conn.execute(
            "DELETE FROM kv WHERE partition = ?1 AND key = ?2",
            params![partition.name(), key],
        )?;
        Ok(n > 0)
    }

    /// Read-modify-write of an existing value. `f` failing aborts the
    /// transaction with no observable effect.
    ///
    /// Opens a write transaction; do not call inside another transaction on
    /// this handle.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when the key is absent, or `f`'s
    /// error.
    pub fn update<T>(
        &self,
        partition: Partition,
        key: &str,
        f: impl FnOnce(&mut T) -> Result<(), StoreError>,
    ) -> Result<(), StoreError>
    where
        T: Serialize + DeserializeOwned,
    {
        let mut guard = self.lock()?;
        let conn = guard.as_mut().ok_or(StoreError::Closed)?;
        let txn = conn.transaction()?;
        let mut value: T = Self::view_in(&txn, partition, key)?;
        f(&mut value)?;
        Self::put_in(&txn, partition, key, &value)?;
        txn.commit()?;
        Ok(())
    }

    /// Like [`Store::update`], but seeds the value from `default` when the
    /// key is absent. Returns whether the value was created.
    ///
    /// Opens a write transaction; do not call inside another transaction on
    /// this handle.
    ///
    /// # Errors
    ///
    /// Returns `f`'s error (aborting the transaction) or a database error.
    pub fn upsert<T>(
        &self,
        partition: Partition,
        key: &str,
        default: impl FnOnce() -> T,
        f: impl FnOnce(&mut T) -> Result<(), StoreError>,
    ) -> Result<bool, StoreError>
    where
        T: Serialize + DeserializeOwned,
    {
        let mut guard = self.lock()?;
        let conn = guard.as_mut().ok_or(StoreError::Closed)?;
        let txn = conn.transaction()?;
        let (mut value, created) = match get_raw(&txn, partition, key)? {
            Some(raw) => (serde_json::from_str(&raw)?, false),
            None => (default(), true),
        };
        f(&mut value)?;
        Self::put_in(&txn, partition, key, &value)?;
        txn.commit()?;
        Ok(created)
    }

    /// Reads every entry of a partition that passes `filter`, ordered by
    /// key. Pass `|_, _| true` for no filtering.
    ///
    /// Opens a read transaction; do not call inside another transaction on
    /// this handle.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on deserialization or database failures.
    pub fn view_all<T, F>(&self, partition: Partition, filter: F) -> Result<Vec<(String, T)>, StoreError>
    where
        T: DeserializeOwned,
        F: Fn(&str, &T) -> bool,
    {
        let guard = self.lock()?;
        let conn = guard.as_ref().ok_or(StoreError::Closed)?;
        let mut stmt =
            conn.prepare("SELECT key, value FROM kv WHERE partition = ?1 ORDER BY key")?;
        let rows = stmt.query_map(params![partition.name()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (key, raw) = row?;
            let value: T = serde_json::from_str(&raw)?;
            if filter(&key, &value) {
                out.push((key, value));
            }
        }
        Ok(out)
    }

    /// Visits every entry of a partition inside one write transaction. The
    /// callback may mutate the value and decides per entry whether to keep,
    /// re-store, or delete it; a callback error aborts the whole pass.
    ///
    /// Opens a write transaction; do not call inside another transaction on
    /// this handle.
    ///
    /// # Errors
    ///
    /// Returns the callback's error or a database error; either rolls the
    /// transaction back.
    pub fn for_each<T>(
        &self,
        partition: Partition,
        mut cb: impl FnMut(&str, &mut T) -> Result<VisitAction, StoreError>,
    ) -> Result<(), StoreError>
    where
        T: Serialize + DeserializeOwned,
    {
        let mut guard = self.lock()?;
        let conn = guard.as_mut().ok_or(StoreError::Closed)?;
        let txn = conn.transaction()?;

        let entries: Vec<(String, String)> = {
            let mut stmt =
                txn.prepare("SELECT key, value FROM kv WHERE partition = ?1 ORDER BY key")?;
            let rows = stmt.query_map(params![partition.name()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            rows.collect::<Result<_, _>>()?
        };

        for (key, raw) in entries {
            let mut value: T = serde_json::from_str(&raw)?;
            match cb(&key, &mut value)? {
                VisitAction::Keep => {},
                VisitAction::Update => Self::put_in(&txn, partition, &key, &value)?,
                VisitAction::Delete => {
                    txn.execute(
                        "DELETE FROM kv WHERE partition = ?1 AND key = ?2",
                        params![partition.name(), key],
                    )?;
                },
            }
        }

        txn.commit()?;
        Ok(())
    }

    /// Reads a value inside the caller's transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when the key is absent.
    pub fn view_in<T: DeserializeOwned>(
        txn: &Transaction<'_>,
        partition: Partition,
        key: &str,
    ) -> Result<T, StoreError> {
        match get_raw(txn, partition, key)? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Err(StoreError::NotFound {
                partition: partition.name(),
                key: key.to_string(),
            }),
        }
    }

    /// Writes a value inside the caller's transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on serialization or database failures.
    pub fn put_in<T: Serialize>(
        txn: &Transaction<'_>,
        partition: Partition,
        key: &str,
        value: &T,
    ) -> Result<(), StoreError> {
        put_raw(txn, partition, key, &serde_json::to_string(value)?)
    }

    /// Deletes a key inside the caller's transaction, returning whether it
    /// existed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on database failures.
    pub fn delete_in(
        txn: &Transaction<'_>,
        partition: Partition,
        key: &str,
    ) -> Result<bool, StoreError> {
        let n = txn.execute(
            "DELETE FROM kv WHERE partition = ?1 AND key = ?2",
            params![partition.name(), key],
        )?;
        Ok(n > 0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Option<Connection>>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}

/// Creates the backing table and registers every declared partition.
fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS kv (
            partition TEXT NOT NULL,
            key TEXT NOT NULL,
            value TEXT NOT NULL,
            PRIMARY KEY (partition, key)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS partitions (name TEXT PRIMARY KEY)",
        [],
    )?;
    for partition in Partition::ALL {
        conn.execute(
            "INSERT OR IGNORE INTO partitions (name) VALUES (?1)",
            params![partition.name()],
        )?;
    }
    Ok(())
}

fn get_raw(conn: &Connection, partition: Partition, key: &str) -> Result<Option<String>, StoreError> {
    let raw = conn
        .query_row(
            "SELECT value FROM kv WHERE partition = ?1 AND key = ?2",
            params![partition.name(), key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(raw)
}

fn put_raw(conn: &Connection, partition: Partition, key: &str, raw: &str) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO kv (partition, key, value) VALUES (?1, ?2, ?3)
         ON CONFLICT (partition, key) DO UPDATE SET value = excluded.value",
        params![partition.name(), key, raw],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Widget {
        label: String,
        count: u32,
    }

    fn test_store() -> (tempfile::TempDir, Store) {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = Store::open_unmigrated(&tmp.path().join("db")).expect("open");
        (tmp, store)
    }

    #[test]
    fn test_view_missing_key_is_not_found() {
        let (_tmp, store) = test_store();
        let err = store
            .view::<Widget>(Partition::Config, "absent")
            .expect_err("missing key");
        assert!(err.is_not_found(), "got {err:?}");
    }

    #[test]
    fn test_put_then_view_roundtrip() {
        let (_tmp, store) = test_store();
        let widget = Widget {
            label: "a".into(),
            count: 1,
        };
        store.put(Partition::Config, "w", &widget).expect("put");
        let back: Widget = store.view(Partition::Config, "w").expect("view");
        assert_eq!(back, widget);
    }

    #[test]
    fn test_update_missing_key_fails() {
        let (_tmp, store) = test_store();
        let err = store
            .update(Partition::Config, "absent", |_: &mut Widget| Ok(()))
            .expect_err("update of a missing key");
        assert!(err.is_not_found());
    }

    #[test]
    fn test_update_failure_leaves_value_untouched() {
        let (_tmp, store) = test_store();
        let widget = Widget {
            label: "orig".into(),
            count: 1,
        };
        store.put(Partition::Config, "w", &widget).expect("put");

        let err = store
            .update(Partition::Config, "w", |w: &mut Widget| {
                w.label = "mutated".into();
                Err(StoreError::Poisoned)
            })
            .expect_err("callback error must propagate");
        assert!(matches!(err, StoreError::Poisoned));

        // Aborted transaction: no partial write observable.
        let back: Widget = store.view(Partition::Config, "w").expect("view");
        assert_eq!(back, widget);
    }

    #[test]
    fn test_upsert_reports_creation() {
        let (_tmp, store) = test_store();
        let created = store
            .upsert(
                Partition::Config,
                "w",
                || Widget {
                    label: "seed".into(),
                    count: 0,
                },
                |w| {
                    w.count += 1;
                    Ok(())
                },
            )
            .expect("first upsert");
        assert!(created);

        let created = store
            .upsert(
                Partition::Config,
                "w",
                || Widget {
                    label: "seed".into(),
                    count: 0,
                },
                |w| {
                    w.count += 1;
                    Ok(())
                },
            )
            .expect("second upsert");
        assert!(!created);

        let back: Widget = store.view(Partition::Config, "w").expect("view");
        assert_eq!(back.count, 2);
    }

    #[test]
    fn test_delete_reports_existence() {
        let (_tmp, store) = test_store();
        store
            .put(
                Partition::Config,
                "w",
                &Widget {
                    label: "x".into(),
                    count: 0,
                },
            )
            .expect("put");
        assert!(store.delete(Partition::Config, "w").expect("delete"));
        assert!(!store.delete(Partition::Config, "w").expect("redelete"));
    }

    #[test]
    fn test_view_all_filters_and_orders() {
        let (_tmp, store) = test_store();
        for (key, count) in [("b", 2), ("a", 1), ("c", 3)] {
            store
                .put(
                    Partition::Config,
                    key,
                    &Widget {
                        label: key.into(),
                        count,
                    },
                )
                .expect("put");
        }

        let all: Vec<(String, Widget)> = store
            .view_all(Partition::Config, |_, _| true)
            .expect("view_all");
        let keys: Vec<&str> = all.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, ["a", "b", "c"]);

        let big: Vec<(String, Widget)> = store
            .view_all(Partition::Config, |_, w: &Widget| w.count >= 2)
            .expect("filtered");
        assert_eq!(big.len(), 2);
    }

    #[test]
    fn test_for_each_applies_actions() {
        let (_tmp, store) = test_store();
        for key in ["keep", "bump", "drop"] {
            store
                .put(
                    Partition::Config,
                    key,
                    &Widget {
                        label: key.into(),
                        count: 0,
                    },
                )
                .expect("put");
        }

        store
            .for_each(Partition::Config, |key, w: &mut Widget| {
                Ok(match key {
                    "bump" => {
                        w.count = 9;
                        VisitAction::Update
                    },
                    "drop" => VisitAction::Delete,
                    _ => VisitAction::Keep,
                })
            })
            .expect("for_each");

        let bumped: Widget = store.view(Partition::Config, "bump").expect("bump");
        assert_eq!(bumped.count, 9);
        assert!(store
            .view::<Widget>(Partition::Config, "drop")
            .expect_err("dropped")
            .is_not_found());
        let kept: Widget = store.view(Partition::Config, "keep").expect("keep");
        assert_eq!(kept.count, 0);
    }

    #[test]
    fn test_close_shuts_down_every_clone() {
        let (_tmp, store) = test_store();
        let clone = store.clone();
        store
            .put(
                Partition::Config,
                "w",
                &Widget {
                    label: "x".into(),
                    count: 0,
                },
            )
            .expect("put");

        store.close().expect("close");
        store.close().expect("second close is a no-op");

        // The clone kept the Arc alive, but the connection is gone: no
        // open handle on the file remains in this process.
        let err = clone
            .view::<Widget>(Partition::Config, "w")
            .expect_err("operations after close");
        assert!(matches!(err, StoreError::Closed), "got {err:?}");
    }

    #[test]
    fn test_two_handles_share_state() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dir = tmp.path().join("db");
        let a = Store::open_unmigrated(&dir).expect("open a");
        let b = Store::open_unmigrated(&dir).expect("open b");

        a.put(
            Partition::Config,
            "w",
            &Widget {
                label: "shared".into(),
                count: 7,
            },
        )
        .expect("put via a");

        let seen: Widget = b.view(Partition::Config, "w").expect("view via b");
        assert_eq!(seen.count, 7);
    }
}
