//! HTTP glue for the foreground service: the JSON settings API and the
//! listen/shutdown loop.
//!
//! On a successful bind the server announces the base URL and increments
//! `startCounter` in one store update; the restart endpoint zeroes the
//! counter first, so `startCounter > 0` afterwards means the replacement
//! process came up.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Json, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use molt_core::store::config;
use molt_core::store::Store;
use molt_core::update::{self, RestartStatus, Updater, DEV_VERSION};
use serde::Deserialize;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::app::App;

struct ServerState {
    store: Store,
    updater: Arc<Updater>,
    version: &'static str,
    shutdown: watch::Sender<bool>,
}

/// Binds the listener, starts the auto-checker, and serves until a
/// shutdown is requested via signal or the settings API. The auto-checker
/// is cancelled and awaited before this returns, so synchronous teardown
/// afterwards observes no background work.
pub async fn serve(app: &App, port: u16) -> Result<()> {
    let (shutdown, shutdown_rx) = watch::channel(false);
    let state = Arc::new(ServerState {
        store: app.store.clone(),
        updater: Arc::clone(&app.updater),
        version: app.version,
        shutdown: shutdown.clone(),
    });

    let router = Router::new()
        .route("/settings", post(update_settings))
        .route("/settings/stop", post(stop))
        .route("/settings/restart", post(restart))
        .route("/settings/restart-status", get(restart_status))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("failed to bind port {port}"))?;

    println!("Listening on {}", app.base_url);
    if let Err(e) = config::update_config(&app.store, |cfg| {
        cfg.start_counter += 1;
        Ok(())
    }) {
        error!("failed to increment start counter: {e}");
    }

    let checker = update::spawn_auto_checker(&app.updater, &app.config);

    // The installer's shutdown contract is SIGTERM to the pids it finds in
    // the presence registry; honor it alongside interactive SIGINT.
    let signal_shutdown = shutdown.clone();
    let signal_task = tokio::spawn(async move {
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to register SIGINT");
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        }
        let _ = signal_shutdown.send(true);
    });

    let mut graceful = shutdown_rx;
    let served = axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = graceful.changed().await;
        })
        .await;

    signal_task.abort();
    if let Some(checker) = checker {
        checker.shutdown().await;
    }

    served.context("server error")?;
    println!("server stopped gracefully");
    Ok(())
}

/// Structured failure for the settings API: code + message + cause.
struct ApiError {
    code: StatusCode,
    message: &'static str,
    cause: String,
}

impl ApiError {
    fn internal(message: &'static str, cause: impl std::fmt::Display) -> Self {
        Self {
            code: StatusCode::INTERNAL_SERVER_ERROR,
            message,
            cause: cause.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({
            "code": self.code.as_u16(),
            "message": self.message,
            "cause": self.cause,
        }));
        (self.code, body).into_response()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SettingsPatch {
    log_level: Option<String>,
    host: Option<String>,
    port: Option<u16>,
    proxy_port: Option<u16>,
}

async fn update_settings(
    State(state): State<Arc<ServerState>>,
    Json(patch): Json<SettingsPatch>,
) -> Result<StatusCode, ApiError> {
    config::update_config(&state.store, |cfg| {
        if let Some(log_level) = patch.log_level {
            cfg.log_level = log_level;
        }
        if let Some(host) = patch.host {
            cfg.host = host;
        }
        if let Some(port) = patch.port {
            cfg.port = port;
        }
        if let Some(proxy_port) = patch.proxy_port {
            cfg.proxy_port = proxy_port;
        }
        Ok(())
    })
    .map_err(|e| ApiError::internal("failed to update config", e))?;

    Ok(StatusCode::OK)
}

async fn stop(State(state): State<Arc<ServerState>>) -> StatusCode {
    let _ = state.shutdown.send(true);
    StatusCode::ACCEPTED
}

#[derive(Debug, Deserialize)]
struct RestartRequest {
    #[serde(default)]
    update: bool,
}

async fn restart(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<RestartRequest>,
) -> Result<StatusCode, ApiError> {
    let do_update = request.update && state.version != DEV_VERSION;
    debug!(requested = request.update, do_update, "restart requested");

    // Zero the counter before anything restarts us; the replacement's first
    // listen turns it back into 1.
    config::update_config(&state.store, |cfg| {
        cfg.start_counter = 0;
        Ok(())
    })
    .map_err(|e| ApiError::internal("failed to update config", e))?;

    if do_update {
        // The detached payload stops this process externally.
        let updater = Arc::clone(&state.updater);
        match tokio::task::spawn_blocking(move || updater.detach_update()).await {
            Ok(Ok(())) => {},
            Ok(Err(e)) => error!("failed to detach update: {e}"),
            Err(e) => error!("detach task failed to join: {e}"),
        }
    } else {
        let _ = state.shutdown.send(true);
    }

    Ok(StatusCode::ACCEPTED)
}

async fn restart_status(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<RestartStatus>, ApiError> {
    let cfg = config::view_config(&state.store)
        .map_err(|e| ApiError::internal("failed to read config", e))?;
    Ok(Json(update::restart_status(&cfg, state.version)))
}
