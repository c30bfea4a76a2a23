mod api;
mod background;
mod bootstrap;
mod health;

use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use crewflow_core::config::{AppConfig, LoadOptions};
use tower_http::trace::TraceLayer;

use crate::background::BackgroundTasks;

fn init_logging(config: &AppConfig) {
    use crewflow_core::config::LogFormat::*;
    use tracing::Level;

    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);

    match config.logging.format {
        Compact => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).compact().init();
        }
        Pretty => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).pretty().init();
        }
        Json => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).json().init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    // Logging must be up before bootstrap so its events are not lost.
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    let app = bootstrap::bootstrap_with_config(config).await?;
    let server = app.config.server.clone();

    let worker_interval = app
        .config
        .queue
        .worker_enabled
        .then(|| Duration::from_secs(app.config.queue.poll_interval_secs));
    let sweep_interval = app
        .config
        .reminders
        .sweep_enabled
        .then(|| Duration::from_secs(app.config.reminders.sweep_interval_secs));
    let background = BackgroundTasks::spawn(&app.runtime, worker_interval, sweep_interval);

    let router = Router::new()
        .merge(api::router(app.runtime.clone(), app.config.webhook.clone()))
        .merge(health::router(
            app.db_pool.clone(),
            app.config.queue.worker_enabled,
            app.config.reminders.sweep_enabled,
        ))
        .layer(TraceLayer::new_for_http());

    let address = format!("{}:{}", server.bind_address, server.port);
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("failed to bind http listener on {address}"))?;

    tracing::info!(
        event_name = "system.server.started",
        correlation_id = "bootstrap",
        address = %address,
        background_tasks = background.task_count(),
        webhook_auth = app.config.webhook.requires_authentication(),
        "crewflow-server listening"
    );

    axum::serve(listener, router).with_graceful_shutdown(wait_for_shutdown()).await?;

    tracing::info!(
        event_name = "system.server.stopping",
        correlation_id = "shutdown",
        "crewflow-server stopping"
    );

    let grace = Duration::from_secs(server.graceful_shutdown_secs);
    if tokio::time::timeout(grace, background.shutdown()).await.is_err() {
        tracing::warn!(
            event_name = "system.server.shutdown_timeout",
            correlation_id = "shutdown",
            grace_secs = server.graceful_shutdown_secs,
            "background tasks did not stop within the grace period"
        );
    }
    app.db_pool.close().await;

    Ok(())
}

async fn wait_for_shutdown() {
    if let Err(signal_error) = tokio::signal::ctrl_c().await {
        tracing::error!(
            event_name = "system.server.signal_failed",
            correlation_id = "shutdown",
            error = %signal_error,
            "failed to listen for shutdown signal"
        );
        std::future::pending::<()>().await;
    }
}
