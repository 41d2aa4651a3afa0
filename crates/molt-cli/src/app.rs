//! Application context: ordered initialization of every core resource.
//!
//! Init order is load-bearing: paths → migration guard (skipped for the
//! migrator role) → logging → store (which runs migrations) → config
//! snapshot → base URL → updater. Each acquired resource registers its
//! cleanup immediately, so a failure part-way through unwinds exactly what
//! was already set up, in reverse.

use std::fs::OpenOptions;
use std::sync::Arc;

use anyhow::{Context, Result};
use molt_core::lifecycle::Lifecycle;
use molt_core::paths::AppPaths;
use molt_core::release::HttpReleaseSource;
use molt_core::store::config::{self, Configuration};
use molt_core::store::Store;
use molt_core::update::{BinaryInfo, Updater};
use molt_core::{guard, net};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Layer};

use crate::build_info;

/// Log file name inside the storage `logs/` directory.
const SERVICE_LOG_FILE: &str = "molt.log";

/// Invocation-scoped switches that shape initialization.
#[derive(Debug, Default)]
pub struct InitOptions {
    /// `--log`: pin the log level for this invocation instead of the
    /// configured one.
    pub log_override: Option<String>,
    /// `--port`: temporarily override the configured port.
    pub port_override: Option<u16>,
    /// `--migrate`: this is the migrator instance; skip the migration
    /// guard entirely (the installer holds the exclusive lock for us).
    pub migrator_role: bool,
    /// The invocation will run the foreground service; logs go to a file.
    pub service_run: bool,
}

/// Everything a command needs, fully initialized.
pub struct App {
    /// Teardown coordinator; owns the cleanup stack for the process.
    pub lifecycle: Arc<Lifecycle>,
    /// Shared store handle.
    pub store: Store,
    /// Update orchestrator.
    pub updater: Arc<Updater>,
    /// Config snapshot taken at init, with the port override applied.
    pub config: Configuration,
    /// Externally reachable base URL derived from the config.
    pub base_url: String,
    /// Resolved storage/runtime roots.
    pub paths: AppPaths,
    /// Application name from the build.
    pub name: &'static str,
    /// Running version from the build.
    pub version: &'static str,
}

impl App {
    /// Initializes the application in dependency order. On failure, every
    /// cleanup registered so far runs before the error is returned.
    ///
    /// # Errors
    ///
    /// Any init failure is fatal to the invocation and propagates here.
    pub fn init(opts: &InitOptions) -> Result<Self> {
        let lifecycle = Arc::new(Lifecycle::new());
        match Self::init_inner(&lifecycle, opts) {
            Ok(app) => Ok(app),
            Err(e) => {
                lifecycle.teardown();
                Err(e)
            },
        }
    }

    fn init_inner(lifecycle: &Arc<Lifecycle>, opts: &InitOptions) -> Result<Self> {
        let paths = AppPaths::resolve(build_info::NAME).context("failed to resolve app paths")?;
        paths
            .ensure_layout()
            .context("failed to create storage layout")?;

        // The guard comes before anything touches shared state. The
        // migrator instance skips it: the installer already holds the
        // exclusive lock on its behalf.
        if opts.migrator_role {
            println!("{} version {}", build_info::NAME, build_info::VERSION);
        } else {
            let guard = guard::MigrationGuard::acquire(&paths.runtime)
                .context("failed to set up migration guard")?;
            lifecycle.add_cleanup(move || {
                guard.release()?;
                Ok(())
            });
        }

        // Logging starts muted unless overridden; the configured level is
        // applied through the reload handle once the store is readable.
        let initial_level = opts.log_override.as_deref().unwrap_or("none");
        let (filter, filter_handle) = reload::Layer::new(build_filter(initial_level));
        let fmt_layer = if opts.service_run {
            let log_path = paths.logs_dir().join(SERVICE_LOG_FILE);
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_path)
                .with_context(|| format!("failed to open log file {}", log_path.display()))?;
            tracing_subscriber::fmt::layer()
                .with_writer(Arc::new(file))
                .with_ansi(false)
                .boxed()
        } else {
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .boxed()
        };
        // Ignore a second init: only the first invocation in a process wins.
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .try_init();

        tracing::debug!(
            name = build_info::NAME,
            version = build_info::VERSION,
            storage = %paths.storage.display(),
            runtime = %paths.runtime.display(),
            "starting"
        );

        // Opening the store runs any pending migrations. Teardown closes
        // the shared connection outright — the app and updater still hold
        // clones then, but the post-cleanup payload must find the database
        // file without any open handle from this process.
        let store = Store::open(&paths.db_dir()).context("failed to initialize store")?;
        {
            let store = store.clone();
            lifecycle.add_cleanup(move || {
                store.close()?;
                Ok(())
            });
        }

        let mut cfg = config::view_config(&store).context("failed to read configuration")?;
        if let Some(port) = opts.port_override {
            cfg.port = port;
        }

        let base_url = net::base_url(&cfg);
        tracing::debug!(%base_url, "base URL derived");

        // The configured level takes over unless --log pinned one.
        if opts.log_override.is_none() {
            let _ = filter_handle.reload(build_filter(&cfg.log_level));
        }

        let source = HttpReleaseSource::new().context("failed to build release client")?;
        let updater = Arc::new(Updater::new(
            BinaryInfo {
                name: build_info::NAME.to_string(),
                version: build_info::VERSION.to_string(),
                release_url: build_info::RELEASE_URL.to_string(),
                service_mode: build_info::service_enabled(),
            },
            paths.storage.clone(),
            store.clone(),
            Arc::new(source),
            lifecycle.post_cleanup_slot(),
        ));

        Ok(Self {
            lifecycle: Arc::clone(lifecycle),
            store,
            updater,
            config: cfg,
            base_url,
            paths,
            name: build_info::NAME,
            version: build_info::VERSION,
        })
    }
}

fn build_filter(level: &str) -> EnvFilter {
    match level.to_ascii_lowercase().as_str() {
        "none" => EnvFilter::new("off"),
        other => EnvFilter::try_new(other).unwrap_or_else(|_| EnvFilter::new("warn")),
    }
}
