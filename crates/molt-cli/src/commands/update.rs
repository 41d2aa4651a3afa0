//! `molt update [--check | --notify]`.

use anyhow::{Context, Result};
use molt_core::store::config;

use crate::app::App;

/// Runs the update command.
///
/// Without flags, prepares a deferred update: the install payload runs as
/// the post-cleanup hook when this invocation exits.
pub fn run(app: &App, check: bool, notify: bool) -> Result<()> {
    if notify {
        let mut enabled = false;
        config::update_config(&app.store, |cfg| {
            cfg.update_notifications = !cfg.update_notifications;
            enabled = cfg.update_notifications;
            Ok(())
        })
        .context("failed to update notification setting")?;

        if enabled {
            println!("Update notifications are now enabled.");
        } else {
            println!("Update notifications are now disabled.");
        }
        return Ok(());
    }

    if check {
        let available = app
            .updater
            .check_for_update()
            .context("failed to check for updates")?;
        if available {
            println!(
                "Update available! Run '{} update' to update to the latest version.",
                app.name
            );
        } else {
            println!("No updates available.");
        }
        return Ok(());
    }

    app.updater
        .defer_update()
        .context("failed to prepare update")
}
