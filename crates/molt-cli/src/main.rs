//! molt - a self-updating single-binary service.
//!
//! The CLI frame: global flags, subcommand dispatch, and the guarantee that
//! lifecycle teardown runs on every exit path, so a prepared update payload
//! always gets its post-cleanup slot.

use std::process::ExitCode;

use clap::{Parser, Subcommand};

mod app;
mod build_info;
mod commands;
mod server;

use app::{App, InitOptions};

/// molt - a self-updating single-binary service
#[derive(Parser, Debug)]
#[command(name = build_info::NAME)]
#[command(version = build_info::VERSION, about, long_about = None)]
struct Cli {
    /// Override log level for this invocation (debug|info|warn|error|none)
    #[arg(long, short = 'l', global = true, value_name = "LEVEL")]
    log: Option<String>,

    /// Temporarily override the configured port
    #[arg(long, short = 'p', global = true, value_name = "PORT")]
    port: Option<u16>,

    /// Skip the migration guard (set by the installer for the migrator
    /// instance, which runs under the installer's exclusive lock)
    #[arg(long, global = true, hide = true)]
    migrate: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Update the app
    Update {
        /// Just check for updates
        #[arg(long)]
        check: bool,

        /// Toggle update notifications
        #[arg(long)]
        notify: bool,
    },

    /// Service management commands
    Service {
        #[command(subcommand)]
        command: Option<ServiceCommands>,
    },
}

#[derive(Subcommand, Debug)]
enum ServiceCommands {
    /// Set config values for bootstrapping the server
    Set {
        /// Set log level (DEBUG, INFO, WARN, ERROR)
        #[arg(long)]
        log: Option<String>,

        /// Set server port
        #[arg(long)]
        port: Option<u16>,

        /// Set server host (e.g., localhost, 0.0.0.0)
        #[arg(long)]
        host: Option<String>,

        /// Set proxy port (0 = no proxy)
        #[arg(long)]
        proxy: Option<u16>,
    },

    /// Run the service in the foreground. Typically invoked by the
    /// supervisor; use this directly for an unmanaged instance. The global
    /// --port flag overrides the configured port.
    Run,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.command.is_none() && !cli.migrate {
        use clap::CommandFactory;
        let _ = Cli::command().print_help();
        return ExitCode::SUCCESS;
    }

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        },
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let service_run = matches!(
        cli.command,
        Some(Commands::Service {
            command: Some(ServiceCommands::Run)
        })
    );

    let opts = InitOptions {
        log_override: cli.log.clone(),
        port_override: cli.port,
        migrator_role: cli.migrate,
        service_run,
    };
    let app = App::init(&opts)?;

    let result = match cli.command {
        // Migrator invocation: the store open during init already ran the
        // migrations under the installer's exclusive lock.
        None => Ok(()),
        Some(Commands::Update { check, notify }) => commands::update::run(&app, check, notify),
        Some(Commands::Service { command }) => match command {
            None => commands::service::cheat_sheet(&app),
            Some(ServiceCommands::Set {
                log,
                port,
                host,
                proxy,
            }) => commands::service::set(&app, log, port, host, proxy),
            Some(ServiceCommands::Run) => commands::service::run(&app),
        },
    };

    // Teardown runs on success and failure alike; a deferred update's
    // payload fires here, after everything else has been released.
    app.lifecycle.teardown();
    result
}
