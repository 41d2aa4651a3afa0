//! The configuration record and its access helpers.
//!
//! Configuration lives as a single JSON row under the `config` partition.
//! The store's transaction model makes it readable only as a complete
//! record or not at all; partial writes cannot be observed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Partition, Store, StoreError};

/// Key of the configuration record in the config partition.
pub const CONFIG_DATA_KEY: &str = "data";

/// Listen port seeded on first run.
pub const DEFAULT_PORT: u16 = 8080;

/// Log level seeded on first run.
pub const DEFAULT_LOG_LEVEL: &str = "WARN";

/// The application's persistent configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Configuration {
    /// Log level: `DEBUG`, `INFO`, `WARN`, `ERROR`, or `none`.
    pub log_level: String,
    /// Port the server listens on. 80/443 are omitted from derived URLs.
    pub port: u16,
    /// Host the server is reachable at; empty means `localhost`.
    pub host: String,
    /// Port a fronting proxy listens on; 0 means no proxy.
    pub proxy_port: u16,

    /// Whether the background update checker performs checks.
    pub update_notifications: bool,
    /// When the release source was last consulted.
    pub last_update_check: DateTime<Utc>,
    /// Cached result of the last check.
    pub update_available: bool,

    /// Running version captured when an update was accepted. After restart,
    /// a mismatch with the running version means the update landed.
    pub pre_update_version: String,
    /// Incremented each time the service reaches listening; reset to 0 when
    /// a restart is requested, so `> 0` means "restarted since".
    pub start_counter: u64,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            port: DEFAULT_PORT,
            host: "localhost".to_string(),
            proxy_port: 0,
            update_notifications: true,
            last_update_check: DateTime::UNIX_EPOCH,
            update_available: false,
            pre_update_version: String::new(),
            start_counter: 0,
        }
    }
}

/// Reads a copy of the current configuration.
///
/// Opens a read transaction; do not call inside another transaction on the
/// same handle.
///
/// # Errors
///
/// Returns [`StoreError::NotFound`] before the first migration has seeded
/// the record.
pub fn view_config(store: &Store) -> Result<Configuration, StoreError> {
    store.view(Partition::Config, CONFIG_DATA_KEY)
}

/// Applies `f` to the configuration in one transaction, seeding defaults
/// when the record is absent.
///
/// Opens a write transaction; do not call inside another transaction on the
/// same handle.
///
/// # Errors
///
/// Returns `f`'s error (the transaction aborts) or a database error.
pub fn update_config(
    store: &Store,
    f: impl FnOnce(&mut Configuration) -> Result<(), StoreError>,
) -> Result<(), StoreError> {
    store
        .upsert(Partition::Config, CONFIG_DATA_KEY, Configuration::default, f)
        .map(|_created| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_first_run_contract() {
        let cfg = Configuration::default();
        assert_eq!(cfg.log_level, "WARN");
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.host, "localhost");
        assert_eq!(cfg.proxy_port, 0);
        assert!(cfg.update_notifications);
        assert!(!cfg.update_available);
        assert_eq!(cfg.start_counter, 0);
        assert!(cfg.pre_update_version.is_empty());
    }

    #[test]
    fn test_serializes_with_camel_case_keys() {
        let cfg = Configuration::default();
        let json = serde_json::to_value(&cfg).expect("serialize");
        let object = json.as_object().expect("object");
        for key in [
            "logLevel",
            "port",
            "host",
            "proxyPort",
            "updateNotifications",
            "lastUpdateCheck",
            "updateAvailable",
            "preUpdateVersion",
            "startCounter",
        ] {
            assert!(object.contains_key(key), "missing {key}");
        }
    }

    #[test]
    fn test_update_config_seeds_then_mutates() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = Store::open_unmigrated(&tmp.path().join("db")).expect("open");

        update_config(&store, |cfg| {
            cfg.port = 9999;
            Ok(())
        })
        .expect("seed + mutate");

        let cfg = view_config(&store).expect("view");
        assert_eq!(cfg.port, 9999);
        assert_eq!(cfg.log_level, "WARN", "other fields keep defaults");
    }
}
