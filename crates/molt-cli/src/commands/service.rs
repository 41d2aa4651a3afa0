//! `molt service [set|run]`.

use anyhow::{Context, Result};
use molt_core::store::config;

use crate::app::App;
use crate::server;

/// Prints the supervisor command reference for this installation.
pub fn cheat_sheet(app: &App) -> Result<()> {
    let service_name = format!("{}.service", app.name);

    println!("Service Cheat Sheet\n");
    println!("    Status:  systemctl --user status {service_name}");
    println!("    Enable:  systemctl --user enable {service_name}");
    println!("    Disable: systemctl --user disable {service_name}\n");
    println!("    Start:   systemctl --user start {service_name}");
    println!("    Stop:    systemctl --user stop {service_name}");
    println!("    Restart: systemctl --user restart {service_name}\n");
    println!("    Reset:   systemctl --user reset-failed {service_name}\n");
    println!("    Logs:        journalctl --user -u {service_name} -n 200 --no-pager");
    println!(
        "    Update Logs: journalctl --user -u {}-update* -n 200 -f",
        app.name
    );
    Ok(())
}

/// Writes bootstrap config values, for hosts where the HTTP surface is not
/// up yet.
pub fn set(
    app: &App,
    log: Option<String>,
    port: Option<u16>,
    host: Option<String>,
    proxy: Option<u16>,
) -> Result<()> {
    let mut updated = false;
    config::update_config(&app.store, |cfg| {
        if let Some(log) = log {
            cfg.log_level = log;
            updated = true;
        }
        if let Some(port) = port {
            cfg.port = port;
            updated = true;
        }
        if let Some(host) = host {
            cfg.host = host;
            updated = true;
        }
        if let Some(proxy) = proxy {
            cfg.proxy_port = proxy;
            updated = true;
        }
        Ok(())
    })
    .context("failed to update config")?;

    if updated {
        println!("Configuration updated successfully.");
    } else {
        println!("No configuration values were changed. Use --help to see available options.");
    }
    Ok(())
}

/// Runs the foreground service: builds the Tokio runtime and blocks on the
/// server until shutdown.
///
/// The listen port comes from the init-time config snapshot, which already
/// folded in the global --port override, so the bound socket and the
/// announced base URL cannot diverge.
pub fn run(app: &App) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new().context("failed to create Tokio runtime")?;
    runtime.block_on(server::serve(app, app.config.port))
}
